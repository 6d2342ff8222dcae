//! Session lifecycle behind an explicit store so the workflow core never reaches for
//! process-wide state. The core only reads `active_role`; everything else here is plumbing
//! for whoever fronts the service.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::workflow::types::{Role, UserId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,
    #[error("session expired")]
    Expired,
    #[error("role '{role}' is not available to this user")]
    RoleNotAvailable { role: Role },
    #[error("user has no roles assigned")]
    NoRoles,
}

/// Who the user is, as established by authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: UserId,
    pub email: String,
    pub display_name: String,
    pub primary_role: Role,
    pub available_roles: Vec<Role>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub user_id: UserId,
    pub email: String,
    pub display_name: String,
    pub primary_role: Role,
    /// Explicitly selected role; `None` until a multi-role user picks one.
    pub active_role: Option<Role>,
    pub available_roles: Vec<Role>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// A session already acting as `role`, for callers that authenticate elsewhere (CLI, tests).
    pub fn acting(identity: UserIdentity, role: Role, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            token: Uuid::new_v4().to_string(),
            user_id: identity.user_id,
            email: identity.email,
            display_name: identity.display_name,
            primary_role: identity.primary_role,
            active_role: Some(role),
            available_roles: identity.available_roles,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn holds(&self, role: Role) -> bool {
        self.available_roles.contains(&role)
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, identity: UserIdentity) -> Result<Session, SessionError>;

    /// Look up a live session and slide its expiry forward.
    async fn validate(&self, token: &str) -> Result<Session, SessionError>;

    async fn select_role(&self, token: &str, role: Role) -> Result<Session, SessionError>;

    async fn destroy(&self, token: &str) -> Result<(), SessionError>;

    /// Remove every expired session, returning how many were dropped.
    async fn expire_stale(&self) -> Result<usize, SessionError>;
}

pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl InMemorySessionStore {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            clock,
            ttl,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, identity: UserIdentity) -> Result<Session, SessionError> {
        if identity.available_roles.is_empty() {
            return Err(SessionError::NoRoles);
        }
        let now = self.clock.now();
        // Single-role users act as that role immediately; everyone else must choose.
        let active_role = match identity.available_roles.as_slice() {
            [only] => Some(*only),
            _ => None,
        };
        let session = Session {
            token: Uuid::new_v4().to_string(),
            user_id: identity.user_id,
            email: identity.email,
            display_name: identity.display_name,
            primary_role: identity.primary_role,
            active_role,
            available_roles: identity.available_roles,
            created_at: now,
            expires_at: now + self.ttl,
        };
        info!(user_id = %session.user_id, active_role = ?session.active_role, "Session created");
        self.sessions
            .write()
            .await
            .insert(session.token.clone(), session.clone());
        Ok(session)
    }

    async fn validate(&self, token: &str) -> Result<Session, SessionError> {
        let now = self.clock.now();
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(token).ok_or(SessionError::NotFound)?;
        if session.is_expired(now) {
            sessions.remove(token);
            return Err(SessionError::Expired);
        }
        session.expires_at = now + self.ttl;
        Ok(session.clone())
    }

    async fn select_role(&self, token: &str, role: Role) -> Result<Session, SessionError> {
        let now = self.clock.now();
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(token).ok_or(SessionError::NotFound)?;
        if session.is_expired(now) {
            sessions.remove(token);
            return Err(SessionError::Expired);
        }
        if !session.holds(role) {
            return Err(SessionError::RoleNotAvailable { role });
        }
        session.active_role = Some(role);
        debug!(user_id = %session.user_id, role = %role, "Active role selected");
        Ok(session.clone())
    }

    async fn destroy(&self, token: &str) -> Result<(), SessionError> {
        self.sessions
            .write()
            .await
            .remove(token)
            .map(|_| ())
            .ok_or(SessionError::NotFound)
    }

    async fn expire_stale(&self) -> Result<usize, SessionError> {
        let now = self.clock.now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_expired(now));
        let removed = before - sessions.len();
        if removed > 0 {
            info!(removed, "Expired stale sessions");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::TimeZone;

    fn identity(roles: Vec<Role>) -> UserIdentity {
        UserIdentity {
            user_id: UserId::new("u-100"),
            email: "pat@example.mil".to_string(),
            display_name: "Pat Example".to_string(),
            primary_role: roles[0],
            available_roles: roles,
        }
    }

    fn store() -> (Arc<FixedClock>, InMemorySessionStore) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 2, 1, 8, 0, 0).unwrap(),
        ));
        let store = InMemorySessionStore::new(clock.clone(), Duration::minutes(30));
        (clock, store)
    }

    #[tokio::test]
    async fn test_single_role_user_is_active_immediately() {
        let (_, store) = store();
        let session = store.create(identity(vec![Role::Cpso])).await.unwrap();
        assert_eq!(session.active_role, Some(Role::Cpso));
    }

    #[tokio::test]
    async fn test_multi_role_user_must_select() {
        let (_, store) = store();
        let session = store
            .create(identity(vec![Role::Approver, Role::Cpso]))
            .await
            .unwrap();
        assert_eq!(session.active_role, None);

        let err = store.select_role(&session.token, Role::Dta).await.unwrap_err();
        assert_eq!(err, SessionError::RoleNotAvailable { role: Role::Dta });

        let selected = store.select_role(&session.token, Role::Cpso).await.unwrap();
        assert_eq!(selected.active_role, Some(Role::Cpso));
    }

    #[tokio::test]
    async fn test_validate_slides_expiry_and_expires() {
        let (clock, store) = store();
        let session = store.create(identity(vec![Role::Requestor])).await.unwrap();

        clock.advance(Duration::minutes(20));
        assert!(store.validate(&session.token).await.is_ok());

        clock.advance(Duration::minutes(20));
        assert!(store.validate(&session.token).await.is_ok());

        clock.advance(Duration::minutes(31));
        assert_eq!(
            store.validate(&session.token).await.unwrap_err(),
            SessionError::Expired
        );
        assert_eq!(
            store.validate(&session.token).await.unwrap_err(),
            SessionError::NotFound
        );
    }

    #[tokio::test]
    async fn test_expire_stale_sweeps_only_expired() {
        let (clock, store) = store();
        store.create(identity(vec![Role::Requestor])).await.unwrap();
        clock.advance(Duration::minutes(40));
        store.create(identity(vec![Role::Sme])).await.unwrap();

        assert_eq!(store.expire_stale().await.unwrap(), 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_destroy_and_no_roles() {
        let (_, store) = store();
        let session = store.create(identity(vec![Role::Admin])).await.unwrap();
        store.destroy(&session.token).await.unwrap();
        assert_eq!(store.destroy(&session.token).await, Err(SessionError::NotFound));

        let mut nobody = identity(vec![Role::Admin]);
        nobody.available_roles.clear();
        assert_eq!(store.create(nobody).await.unwrap_err(), SessionError::NoRoles);
    }
}
