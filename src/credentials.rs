//! Registration, login verification and admin provisioning.
//!
//! Passwords are hashed with Argon2id and a per-user random salt; the PHC
//! string is the only thing that reaches the repository. Hashing runs on the
//! blocking pool because it is deliberately slow.

use actix_web::web;
use argon2::{
    password_hash::{rand_core::OsRng, SaltString},
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
};
use once_cell::sync::Lazy;
use tracing::{info, warn};

use crate::models::{Credentials, NewUser, Role, User};
use crate::repo::{Repo, RepoError};

#[derive(thiserror::Error, Debug)]
pub enum CredentialError {
    #[error("username already taken")] DuplicateUsername,
    #[error("invalid username or password")] InvalidCredentials,
    #[error("{0}")] Invalid(&'static str),
    #[error("password hashing failed")] Hash,
    #[error(transparent)] Repo(#[from] RepoError),
}

// Verified against when the username is unknown so both failure paths cost
// one Argon2 verification.
static DUMMY_HASH: Lazy<Option<String>> = Lazy::new(|| hash_password("newsroom-timing-equalizer").ok());

pub fn hash_password(plain: &str) -> Result<String, CredentialError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(plain.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|_| CredentialError::Hash)
}

/// False for a wrong password and for an unparsable stored hash alike.
pub fn verify_password(plain: &str, phc: &str) -> bool {
    match PasswordHash::new(phc) {
        Ok(parsed) => Argon2::default().verify_password(plain.as_bytes(), &parsed).is_ok(),
        Err(_) => false,
    }
}

async fn hash_blocking(password: String) -> Result<String, CredentialError> {
    web::block(move || hash_password(&password)).await.map_err(|_| CredentialError::Hash)?
}

async fn verify_blocking(password: String, phc: Option<String>) -> Result<bool, CredentialError> {
    web::block(move || match phc {
        Some(phc) => verify_password(&password, &phc),
        None => {
            if let Some(dummy) = DUMMY_HASH.as_deref() {
                let _ = verify_password(&password, dummy);
            }
            false
        }
    })
    .await
    .map_err(|_| CredentialError::Hash)
}

/// Create a regular account. The role is always [`Role::User`].
pub async fn register(repo: &dyn Repo, creds: Credentials) -> Result<User, CredentialError> {
    let creds = creds.normalized().map_err(CredentialError::Invalid)?;
    create_account(repo, creds, Role::User).await
}

async fn create_account(repo: &dyn Repo, creds: Credentials, role: Role) -> Result<User, CredentialError> {
    let password_hash = hash_blocking(creds.password).await?;
    let record = repo
        .create_user(NewUser { username: creds.username, password_hash, role })
        .await
        .map_err(|e| match e {
            RepoError::Conflict => CredentialError::DuplicateUsername,
            other => other.into(),
        })?;
    info!(user_id = record.id, username = %record.username, role = role.as_str(), "account created");
    Ok(record.into())
}

/// Check a username/password pair. Unknown user and wrong password are
/// indistinguishable to the caller.
pub async fn authenticate(repo: &dyn Repo, creds: Credentials) -> Result<User, CredentialError> {
    let creds = creds.normalized().map_err(|_| CredentialError::InvalidCredentials)?;
    let record = repo.find_user_by_username(&creds.username).await?;
    let ok = verify_blocking(creds.password, record.as_ref().map(|r| r.password_hash.clone())).await?;
    match record {
        Some(r) if ok => Ok(r.into()),
        _ => {
            warn!(username = %creds.username, "login rejected");
            Err(CredentialError::InvalidCredentials)
        }
    }
}

/// Ensure an admin account named `creds.username` exists. An existing
/// account with that name is left exactly as it is; returns `None` then.
pub async fn provision_admin(repo: &dyn Repo, creds: Credentials) -> Result<Option<User>, CredentialError> {
    let creds = creds.normalized().map_err(CredentialError::Invalid)?;
    if let Some(existing) = repo.find_user_by_username(&creds.username).await? {
        if existing.role != Role::Admin {
            warn!(username = %existing.username, "bootstrap admin name is taken by a non-admin account");
        }
        return Ok(None);
    }
    match create_account(repo, creds, Role::Admin).await {
        Ok(user) => Ok(Some(user)),
        // lost a race with a concurrent registration
        Err(CredentialError::DuplicateUsername) => Ok(None),
        Err(e) => Err(e),
    }
}
