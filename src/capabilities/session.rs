use async_trait::async_trait;
use thiserror::Error;

use crate::model::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("no authenticated user")]
    NotAuthenticated,

    #[error("session lookup failed: {0}")]
    Lookup(String),
}

/// Resolves the user the host application is currently signed in as.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn current_user(&self) -> Result<UserId, SessionError>;
}

/// A session pinned to one user, for hosts that resolve identity up front.
#[derive(Debug, Clone)]
pub struct StaticSession(Option<UserId>);

impl StaticSession {
    pub fn signed_in(user: UserId) -> Self {
        Self(Some(user))
    }

    pub fn signed_out() -> Self {
        Self(None)
    }
}

#[async_trait]
impl SessionProvider for StaticSession {
    async fn current_user(&self) -> Result<UserId, SessionError> {
        self.0.clone().ok_or(SessionError::NotAuthenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_session_resolves_user() {
        let user = UserId::new("u1").unwrap();
        let session = StaticSession::signed_in(user.clone());
        assert_eq!(session.current_user().await, Ok(user));
        assert_eq!(
            StaticSession::signed_out().current_user().await,
            Err(SessionError::NotAuthenticated)
        );
    }
}
