//! Session table and authorization guard.
//!
//! A request is in one of three states: anonymous, authenticated user or
//! authenticated admin. The state comes from looking up the request's token
//! in the [`SessionStore`] held by the application state; a missing, unknown
//! or expired token means anonymous. Handlers declare the minimum
//! [`AccessLevel`] they need and the guard rejects anything below it.

use std::future::{ready, Ready};
use std::sync::Arc;

use actix_web::{dev::Payload, web, FromRequest, HttpRequest};
use actix_web_httpauth::extractors::bearer::BearerAuth;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::RngCore;
use serde::Serialize;

use crate::error::ApiError;
use crate::models::{Id, Role, User};
use crate::routes::AppState;

pub const SESSION_COOKIE: &str = "newsroom_session";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Anonymous,
    User,
    Admin,
}

impl From<Role> for AccessLevel {
    fn from(role: Role) -> Self {
        match role {
            Role::User => AccessLevel::User,
            Role::Admin => AccessLevel::Admin,
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum GuardError {
    #[error("requires {required:?} access, session is {actual:?}")]
    Unauthorized { required: AccessLevel, actual: AccessLevel },
}

#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub user_id: Id,
    pub username: String,
    pub role: Role,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum SessionState {
    Anonymous,
    AuthenticatedUser(Session),
    AuthenticatedAdmin(Session),
}

impl SessionState {
    fn from_session(session: Session) -> Self {
        match session.role {
            Role::Admin => SessionState::AuthenticatedAdmin(session),
            Role::User => SessionState::AuthenticatedUser(session),
        }
    }

    pub fn level(&self) -> AccessLevel {
        match self {
            SessionState::Anonymous => AccessLevel::Anonymous,
            SessionState::AuthenticatedUser(_) => AccessLevel::User,
            SessionState::AuthenticatedAdmin(_) => AccessLevel::Admin,
        }
    }

    pub fn session(&self) -> Option<&Session> {
        match self {
            SessionState::Anonymous => None,
            SessionState::AuthenticatedUser(s) | SessionState::AuthenticatedAdmin(s) => Some(s),
        }
    }

    pub fn authorize(&self, required: AccessLevel) -> Result<(), GuardError> {
        let actual = self.level();
        if actual >= required {
            Ok(())
        } else {
            Err(GuardError::Unauthorized { required, actual })
        }
    }

    /// Any signed-in account, user or admin.
    pub fn require_user(&self) -> Result<&Session, GuardError> {
        self.require(AccessLevel::User)
    }

    pub fn require_admin(&self) -> Result<&Session, GuardError> {
        self.require(AccessLevel::Admin)
    }

    fn require(&self, required: AccessLevel) -> Result<&Session, GuardError> {
        self.authorize(required)?;
        self.session().ok_or(GuardError::Unauthorized { required, actual: AccessLevel::Anonymous })
    }
}

/// Token-keyed session table. Cloning shares the table.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<DashMap<String, Session>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self { sessions: Arc::new(DashMap::new()), ttl }
    }

    /// Start a session for `user`; its role is fixed for the session's life.
    pub fn open(&self, user: &User) -> Session {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let session = Session {
            token: hex::encode(bytes),
            user_id: user.id,
            username: user.username.clone(),
            role: user.role,
            expires_at: Utc::now() + self.ttl,
        };
        self.sessions.insert(session.token.clone(), session.clone());
        tracing::debug!(user_id = user.id, "session opened");
        session
    }

    pub fn resolve(&self, token: Option<&str>) -> SessionState {
        let Some(token) = token else { return SessionState::Anonymous };
        let now = Utc::now();
        if self.sessions.remove_if(token, |_, s| s.expires_at <= now).is_some() {
            return SessionState::Anonymous;
        }
        match self.sessions.get(token) {
            Some(s) => SessionState::from_session(s.value().clone()),
            None => SessionState::Anonymous,
        }
    }

    /// Returns whether a live session was removed.
    pub fn close(&self, token: &str) -> bool {
        self.sessions.remove(token).is_some()
    }

    /// Drop every expired session; returns how many went.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.expires_at > now);
        before - self.sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Every token the request carries, bearer header first, then the cookie.
pub fn request_tokens(req: &HttpRequest) -> impl Iterator<Item = String> {
    let bearer = BearerAuth::extract(req).into_inner().ok().map(|b| b.token().to_string());
    let cookie = req.cookie(SESSION_COOKIE).map(|c| c.value().to_string());
    bearer.into_iter().chain(cookie)
}

/// Never fails for a bad token: it just yields `Anonymous`. A stale bearer
/// header does not hide a live cookie. Handlers decide whether anonymous is
/// enough.
impl FromRequest for SessionState {
    type Error = ApiError;
    type Future = Ready<Result<Self, ApiError>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let Some(state) = req.app_data::<web::Data<AppState>>() else {
            tracing::error!("AppState missing from app data");
            return ready(Err(ApiError::Internal));
        };
        let resolved = request_tokens(req)
            .map(|token| state.sessions.resolve(Some(&token)))
            .find(|s| s.level() > AccessLevel::Anonymous)
            .unwrap_or(SessionState::Anonymous);
        ready(Ok(resolved))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(role: Role) -> User {
        User { id: 7, username: "alice".into(), role, created_at: Utc::now() }
    }

    #[test]
    fn levels_are_ordered() {
        assert!(AccessLevel::Anonymous < AccessLevel::User);
        assert!(AccessLevel::User < AccessLevel::Admin);
    }

    #[test]
    fn anonymous_only_passes_anonymous() {
        let s = SessionState::Anonymous;
        assert!(s.authorize(AccessLevel::Anonymous).is_ok());
        assert_eq!(
            s.require_user().unwrap_err(),
            GuardError::Unauthorized { required: AccessLevel::User, actual: AccessLevel::Anonymous }
        );
    }

    #[test]
    fn user_session_cannot_act_as_admin() {
        let store = SessionStore::new(Duration::hours(1));
        let session = store.open(&user(Role::User));
        let state = store.resolve(Some(&session.token));
        assert_eq!(state.level(), AccessLevel::User);
        assert_eq!(state.require_user().unwrap().user_id, 7);
        assert!(state.require_admin().is_err());
    }

    #[test]
    fn admin_session_satisfies_user_requirement() {
        let store = SessionStore::new(Duration::hours(1));
        let session = store.open(&user(Role::Admin));
        let state = store.resolve(Some(&session.token));
        assert!(state.require_user().is_ok());
        assert!(state.require_admin().is_ok());
    }

    #[test]
    fn tokens_are_unique_hex() {
        let store = SessionStore::new(Duration::hours(1));
        let a = store.open(&user(Role::User));
        let b = store.open(&user(Role::User));
        assert_ne!(a.token, b.token);
        assert_eq!(a.token.len(), 64);
        assert!(a.token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn close_and_expiry_fall_back_to_anonymous() {
        let store = SessionStore::new(Duration::hours(1));
        let session = store.open(&user(Role::User));
        assert!(store.close(&session.token));
        assert!(!store.close(&session.token));
        assert_eq!(store.resolve(Some(&session.token)).level(), AccessLevel::Anonymous);

        let expired = SessionStore::new(Duration::zero());
        let session = expired.open(&user(Role::Admin));
        assert_eq!(expired.resolve(Some(&session.token)).level(), AccessLevel::Anonymous);
        assert!(expired.is_empty());
    }

    #[test]
    fn unknown_token_is_anonymous() {
        let store = SessionStore::new(Duration::hours(1));
        assert_eq!(store.resolve(Some("deadbeef")).level(), AccessLevel::Anonymous);
        assert_eq!(store.resolve(None).level(), AccessLevel::Anonymous);
    }

    #[test]
    fn purge_drops_only_expired() {
        let live = SessionStore::new(Duration::hours(1));
        live.open(&user(Role::User));
        assert_eq!(live.purge_expired(), 0);
        assert_eq!(live.len(), 1);

        let dead = SessionStore::new(Duration::zero());
        dead.open(&user(Role::User));
        dead.open(&user(Role::User));
        assert_eq!(dead.purge_expired(), 2);
    }
}
