use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

const MAX_ID_LENGTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{kind} cannot be empty")]
    Empty { kind: &'static str },

    #[error("{kind} exceeds {max} characters")]
    TooLong { kind: &'static str, max: usize },

    #[error("{kind} contains invalid control characters")]
    ControlCharacters { kind: &'static str },
}

fn validate_text(kind: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty { kind });
    }
    if value.chars().count() > max {
        return Err(ValidationError::TooLong { kind, max });
    }
    if value.chars().any(char::is_control) {
        return Err(ValidationError::ControlCharacters { kind });
    }
    Ok(())
}

/// Trims and checks a patient display name before it is stored.
pub fn validate_display_name(name: &str, max: usize) -> Result<String, ValidationError> {
    let name = name.trim();
    validate_text("display name", name, max)?;
    Ok(name.to_string())
}

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident, $kind:literal) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
                let id = id.into().trim().to_string();
                validate_text($kind, &id, MAX_ID_LENGTH)?;
                Ok(Self(id))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(PatientUuid, "patient uuid");
typed_id!(UserId, "user id");
typed_id!(HandlerId, "handler id");

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }
}

/// Synchronization status of one (patient, handler) pair.
///
/// `Reloading` and `ReloadingError` carry the timestamp of the last
/// successful load so a failed refresh never hides data that is still usable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoadState {
    Loading,
    Loaded { timestamp: UnixTimeMs },
    Reloading { timestamp: UnixTimeMs },
    LoadingError { error: String },
    ReloadingError { error: String, timestamp: UnixTimeMs },
}

impl LoadState {
    pub fn state_name(&self) -> &'static str {
        match self {
            LoadState::Loading => "loading",
            LoadState::Loaded { .. } => "loaded",
            LoadState::Reloading { .. } => "reloading",
            LoadState::LoadingError { .. } => "loading_error",
            LoadState::ReloadingError { .. } => "reloading_error",
        }
    }

    /// Timestamp of the last successful load, if there ever was one.
    pub fn last_success(&self) -> Option<UnixTimeMs> {
        match self {
            LoadState::Loaded { timestamp }
            | LoadState::Reloading { timestamp }
            | LoadState::ReloadingError { timestamp, .. } => Some(*timestamp),
            LoadState::Loading | LoadState::LoadingError { .. } => None,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, LoadState::Loading | LoadState::Reloading { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            LoadState::LoadingError { .. } | LoadState::ReloadingError { .. }
        )
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            LoadState::LoadingError { error } | LoadState::ReloadingError { error, .. } => {
                Some(error)
            }
            _ => None,
        }
    }

    /// State a handler enters when a load is (re)started.
    pub fn restart(previous: Option<&LoadState>) -> LoadState {
        match previous.and_then(LoadState::last_success) {
            Some(timestamp) => LoadState::Reloading { timestamp },
            None => LoadState::Loading,
        }
    }

    /// Next state after the handler reports `outcome`, or `None` if the
    /// current state is not waiting for a load.
    pub fn resolve(&self, outcome: &LoadOutcome, now: UnixTimeMs) -> Option<LoadState> {
        match (self, outcome) {
            (LoadState::Loading | LoadState::Reloading { .. }, LoadOutcome::Succeeded) => {
                Some(LoadState::Loaded { timestamp: now })
            }
            (LoadState::Loading, LoadOutcome::Failed(error)) => Some(LoadState::LoadingError {
                error: error.clone(),
            }),
            (LoadState::Reloading { timestamp }, LoadOutcome::Failed(error)) => {
                Some(LoadState::ReloadingError {
                    error: error.clone(),
                    timestamp: *timestamp,
                })
            }
            _ => None,
        }
    }
}

/// What a handler reported for one load call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    Succeeded,
    Failed(String),
}

/// Result of releasing a user's interest in a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Release {
    NotInterested,
    Released,
    LastUserReleased,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerStatus<'a> {
    /// The handler was registered after this record was last synced.
    Unknown,
    Known(&'a LoadState),
}

/// Summary shown next to a patient in the offline list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncStatus {
    NotSynchronized,
    Downloading,
    Failed { failed: usize },
    Synced { at: UnixTimeMs },
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflinePatientRecord {
    pub patient_uuid: PatientUuid,
    pub display_name: String,
    pub interested_users: BTreeSet<UserId>,
    pub per_handler_state: BTreeMap<HandlerId, LoadState>,
}

// Display names are patient-identifying; keep them out of logs.
impl fmt::Debug for OfflinePatientRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflinePatientRecord")
            .field("patient_uuid", &self.patient_uuid)
            .field("display_name_len", &self.display_name.len())
            .field("interested_users", &self.interested_users)
            .field("per_handler_state", &self.per_handler_state)
            .finish()
    }
}

impl OfflinePatientRecord {
    pub fn new(patient_uuid: PatientUuid, display_name: impl Into<String>) -> Self {
        Self {
            patient_uuid,
            display_name: display_name.into(),
            interested_users: BTreeSet::new(),
            per_handler_state: BTreeMap::new(),
        }
    }

    pub fn is_interested(&self, user: &UserId) -> bool {
        self.interested_users.contains(user)
    }

    /// Registers `user`'s interest and restarts every listed handler.
    ///
    /// Returns `true` if the user was not interested before.
    pub fn begin_sync(&mut self, user: &UserId, display_name: &str, handlers: &[HandlerId]) -> bool {
        self.display_name = display_name.to_string();
        for handler in handlers {
            let next = LoadState::restart(self.per_handler_state.get(handler));
            self.per_handler_state.insert(handler.clone(), next);
        }
        self.interested_users.insert(user.clone())
    }

    /// Applies a handler outcome. Returns `false` when the outcome does not
    /// match a pending load and the record was left untouched.
    pub fn apply_outcome(
        &mut self,
        handler: &HandlerId,
        outcome: &LoadOutcome,
        now: UnixTimeMs,
    ) -> bool {
        let Some(current) = self.per_handler_state.get_mut(handler) else {
            return false;
        };
        match current.resolve(outcome, now) {
            Some(next) => {
                *current = next;
                true
            }
            None => false,
        }
    }

    pub fn release(&mut self, user: &UserId) -> Release {
        if !self.interested_users.remove(user) {
            return Release::NotInterested;
        }
        if self.interested_users.is_empty() {
            Release::LastUserReleased
        } else {
            Release::Released
        }
    }

    pub fn handler_status(&self, handler: &HandlerId) -> HandlerStatus<'_> {
        self.per_handler_state
            .get(handler)
            .map_or(HandlerStatus::Unknown, HandlerStatus::Known)
    }

    /// Handlers whose last load failed, with their error message.
    pub fn failures(&self) -> Vec<(&HandlerId, &str)> {
        self.per_handler_state
            .iter()
            .filter_map(|(id, state)| state.error().map(|error| (id, error)))
            .collect()
    }

    pub fn sync_status(&self) -> SyncStatus {
        let states = self.per_handler_state.values();
        if states.clone().any(LoadState::is_in_progress) {
            return SyncStatus::Downloading;
        }
        let failed = states.clone().filter(|s| s.is_error()).count();
        if failed > 0 {
            return SyncStatus::Failed { failed };
        }
        match states.filter_map(LoadState::last_success).max() {
            Some(at) => SyncStatus::Synced { at },
            None => SyncStatus::NotSynchronized,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn patient() -> PatientUuid {
        PatientUuid::new("p1").unwrap()
    }

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn handler(id: &str) -> HandlerId {
        HandlerId::new(id).unwrap()
    }

    #[test]
    fn ids_are_trimmed_and_validated() {
        assert_eq!(PatientUuid::new("  abc  ").unwrap().as_str(), "abc");
        assert_eq!(
            UserId::new("   "),
            Err(ValidationError::Empty { kind: "user id" })
        );
        assert!(HandlerId::new("a\u{0}b").is_err());
        assert!(PatientUuid::new("x".repeat(MAX_ID_LENGTH + 1)).is_err());
    }

    #[test]
    fn display_name_limits() {
        assert_eq!(validate_display_name(" Jane Doe ", 20).unwrap(), "Jane Doe");
        assert!(validate_display_name("", 20).is_err());
        assert!(matches!(
            validate_display_name("Jane Doe", 4),
            Err(ValidationError::TooLong { max: 4, .. })
        ));
    }

    #[test]
    fn restart_preserves_last_success() {
        let t = UnixTimeMs(42);
        assert_eq!(LoadState::restart(None), LoadState::Loading);
        assert_eq!(
            LoadState::restart(Some(&LoadState::LoadingError { error: "x".into() })),
            LoadState::Loading
        );
        assert_eq!(
            LoadState::restart(Some(&LoadState::Loaded { timestamp: t })),
            LoadState::Reloading { timestamp: t }
        );
        assert_eq!(
            LoadState::restart(Some(&LoadState::ReloadingError {
                error: "x".into(),
                timestamp: t
            })),
            LoadState::Reloading { timestamp: t }
        );
    }

    #[test]
    fn resolve_follows_transition_table() {
        let now = UnixTimeMs(100);
        let old = UnixTimeMs(10);
        let failed = LoadOutcome::Failed("offline".into());

        assert_eq!(
            LoadState::Loading.resolve(&LoadOutcome::Succeeded, now),
            Some(LoadState::Loaded { timestamp: now })
        );
        assert_eq!(
            LoadState::Loading.resolve(&failed, now),
            Some(LoadState::LoadingError {
                error: "offline".into()
            })
        );
        assert_eq!(
            LoadState::Reloading { timestamp: old }.resolve(&failed, now),
            Some(LoadState::ReloadingError {
                error: "offline".into(),
                timestamp: old
            })
        );

        let terminal = [
            LoadState::Loaded { timestamp: old },
            LoadState::LoadingError { error: "e".into() },
            LoadState::ReloadingError {
                error: "e".into(),
                timestamp: old,
            },
        ];
        for state in terminal {
            assert_eq!(state.resolve(&LoadOutcome::Succeeded, now), None);
            assert_eq!(state.resolve(&failed, now), None);
        }
    }

    #[test]
    fn outcome_for_unknown_handler_is_ignored() {
        let mut record = OfflinePatientRecord::new(patient(), "Jane");
        record.begin_sync(&user("u1"), "Jane", &[handler("vitals")]);

        assert!(!record.apply_outcome(&handler("forms"), &LoadOutcome::Succeeded, UnixTimeMs(1)));
        assert_eq!(record.handler_status(&handler("forms")), HandlerStatus::Unknown);
    }

    #[test]
    fn release_reports_last_user() {
        let mut record = OfflinePatientRecord::new(patient(), "Jane");
        record.begin_sync(&user("u1"), "Jane", &[]);
        record.begin_sync(&user("u2"), "Jane", &[]);

        assert_eq!(record.release(&user("u3")), Release::NotInterested);
        assert_eq!(record.release(&user("u1")), Release::Released);
        assert_eq!(record.release(&user("u2")), Release::LastUserReleased);
        assert!(record.interested_users.is_empty());
    }

    #[test]
    fn sync_status_summarizes_handlers() {
        let mut record = OfflinePatientRecord::new(patient(), "Jane");
        assert_eq!(record.sync_status(), SyncStatus::NotSynchronized);

        record.begin_sync(&user("u1"), "Jane", &[handler("vitals"), handler("forms")]);
        assert_eq!(record.sync_status(), SyncStatus::Downloading);

        record.apply_outcome(&handler("vitals"), &LoadOutcome::Succeeded, UnixTimeMs(5));
        record.apply_outcome(&handler("forms"), &LoadOutcome::Failed("boom".into()), UnixTimeMs(6));
        assert_eq!(record.sync_status(), SyncStatus::Failed { failed: 1 });
        assert_eq!(record.failures(), vec![(&handler("forms"), "boom")]);

        record.begin_sync(&user("u1"), "Jane", &[handler("forms")]);
        record.apply_outcome(&handler("forms"), &LoadOutcome::Succeeded, UnixTimeMs(9));
        assert_eq!(record.sync_status(), SyncStatus::Synced { at: UnixTimeMs(9) });
    }

    #[test]
    fn debug_output_hides_display_name() {
        let record = OfflinePatientRecord::new(patient(), "Jane Doe");
        assert!(!format!("{record:?}").contains("Jane"));
    }

    #[test]
    fn load_state_serializes_as_tagged_union() {
        let state = LoadState::ReloadingError {
            error: "timeout".into(),
            timestamp: UnixTimeMs(7),
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "reloading_error", "error": "timeout", "timestamp": 7})
        );
        assert_eq!(json["type"], state.state_name());
    }

    #[derive(Clone, Debug)]
    enum Op {
        Add(u8),
        Remove(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![(0u8..4).prop_map(Op::Add), (0u8..4).prop_map(Op::Remove)]
    }

    proptest! {
        #[test]
        fn interest_set_matches_model(ops in proptest::collection::vec(op_strategy(), 0..40)) {
            let mut record = OfflinePatientRecord::new(patient(), "Jane");
            let mut expected = BTreeSet::new();
            let handlers = [handler("vitals")];

            for op in ops {
                match op {
                    Op::Add(u) => {
                        let id = user(&format!("u{u}"));
                        let newly = record.begin_sync(&id, "Jane", &handlers);
                        prop_assert_eq!(newly, expected.insert(id));
                    }
                    Op::Remove(u) => {
                        let id = user(&format!("u{u}"));
                        let was_present = expected.remove(&id);
                        let release = record.release(&id);
                        match release {
                            Release::NotInterested => prop_assert!(!was_present),
                            Release::Released => prop_assert!(was_present && !expected.is_empty()),
                            Release::LastUserReleased => prop_assert!(was_present && expected.is_empty()),
                        }
                    }
                }
                prop_assert_eq!(&record.interested_users, &expected);
            }
        }

        #[test]
        fn reload_never_loses_success_timestamp(t in 1u64..1_000_000, err in "[a-z]{1,12}") {
            let mut record = OfflinePatientRecord::new(patient(), "Jane");
            let vitals = handler("vitals");
            record.begin_sync(&user("u1"), "Jane", &[vitals.clone()]);
            record.apply_outcome(&vitals, &LoadOutcome::Succeeded, UnixTimeMs(t));

            record.begin_sync(&user("u1"), "Jane", &[vitals.clone()]);
            record.apply_outcome(&vitals, &LoadOutcome::Failed(err.clone()), UnixTimeMs(t + 1));

            prop_assert_eq!(
                record.handler_status(&vitals),
                HandlerStatus::Known(&LoadState::ReloadingError { error: err, timestamp: UnixTimeMs(t) })
            );
        }
    }
}
