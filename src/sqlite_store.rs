//! SQLite backend for the offline patient store.
//!
//! One row per patient. The record is stored as a CBOR payload next to its
//! blake3 checksum; rows that fail to decode or verify are quarantined (left
//! in place, skipped and logged) rather than failing the whole read.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, instrument, warn};

use crate::model::{OfflinePatientRecord, PatientUuid};
use crate::offline_store::{PatientStorage, StoreError};

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Migration `n` brings the schema from version `n` to `n + 1`.
const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS offline_patients (
        patient_uuid TEXT PRIMARY KEY,
        payload BLOB NOT NULL,
        checksum BLOB NOT NULL
    );
    "#,
];

#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        info!(path = %path.display(), "opening offline patient store");
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self, StoreError> {
        migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::LockFailed)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
    }
}

fn migrate(conn: &mut Connection) -> Result<(), StoreError> {
    let found: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if found > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::FutureSchema {
            found,
            max: CURRENT_SCHEMA_VERSION,
        });
    }
    if found == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for (from, sql) in MIGRATIONS.iter().enumerate().skip(found as usize) {
        tx.execute_batch(sql)?;
        info!(from, to = from + 1, "migrated offline patient store");
    }
    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
    tx.commit()?;
    Ok(())
}

fn encode(record: &OfflinePatientRecord) -> Result<(Vec<u8>, [u8; 32]), StoreError> {
    let mut payload = Vec::new();
    ciborium::into_writer(record, &mut payload)?;
    let checksum = blake3::hash(&payload);
    Ok((payload, *checksum.as_bytes()))
}

fn decode(patient_uuid: &str, payload: &[u8], checksum: &[u8]) -> Result<OfflinePatientRecord, StoreError> {
    let actual = blake3::hash(payload);
    if actual.as_bytes().as_slice() != checksum {
        return Err(StoreError::IntegrityCheckFailed {
            expected: hex::encode(checksum),
            actual: hex::encode(actual.as_bytes()),
        });
    }
    let record: OfflinePatientRecord =
        ciborium::from_reader(payload).map_err(|e| StoreError::Corrupted {
            patient_uuid: patient_uuid.to_string(),
            reason: e.to_string(),
        })?;
    if record.patient_uuid.as_str() != patient_uuid {
        return Err(StoreError::Corrupted {
            patient_uuid: patient_uuid.to_string(),
            reason: format!("payload belongs to {}", record.patient_uuid),
        });
    }
    Ok(record)
}

fn decode_or_quarantine(patient_uuid: &str, payload: &[u8], checksum: &[u8]) -> Option<OfflinePatientRecord> {
    match decode(patient_uuid, payload, checksum) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(patient = patient_uuid, error = %e, "quarantining unreadable offline record");
            None
        }
    }
}

#[async_trait]
impl PatientStorage for SqliteStorage {
    #[instrument(skip(self))]
    async fn load_all(&self) -> Result<Vec<OfflinePatientRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT patient_uuid, payload, checksum FROM offline_patients ORDER BY patient_uuid",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })?;

            let mut records = Vec::new();
            for row in rows {
                let (patient_uuid, payload, checksum) = row?;
                records.extend(decode_or_quarantine(&patient_uuid, &payload, &checksum));
            }
            Ok(records)
        })
        .await
    }

    async fn get(&self, patient: &PatientUuid) -> Result<Option<OfflinePatientRecord>, StoreError> {
        let patient_uuid = patient.as_str().to_string();
        self.with_conn(move |conn| {
            let row: Option<(Vec<u8>, Vec<u8>)> = conn
                .query_row(
                    "SELECT payload, checksum FROM offline_patients WHERE patient_uuid = ?1",
                    params![patient_uuid],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            Ok(row.and_then(|(payload, checksum)| {
                decode_or_quarantine(&patient_uuid, &payload, &checksum)
            }))
        })
        .await
    }

    async fn upsert(&self, record: &OfflinePatientRecord) -> Result<(), StoreError> {
        let (payload, checksum) = encode(record)?;
        let patient_uuid = record.patient_uuid.as_str().to_string();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO offline_patients (patient_uuid, payload, checksum)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(patient_uuid) DO UPDATE SET
                    payload = excluded.payload,
                    checksum = excluded.checksum
                "#,
                params![patient_uuid, payload, checksum.as_slice()],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, patient: &PatientUuid) -> Result<bool, StoreError> {
        let patient_uuid = patient.as_str().to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM offline_patients WHERE patient_uuid = ?1",
                params![patient_uuid],
            )?;
            Ok(removed > 0)
        })
        .await
    }
}
