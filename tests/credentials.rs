#![cfg(feature = "inmem-store")]

use newsroom::credentials::{authenticate, provision_admin, register, CredentialError};
use newsroom::models::{Credentials, Role};
use newsroom::repo::inmem::InMemRepo;
use newsroom::repo::UserRepo;

fn creds(username: &str, password: &str) -> Credentials {
    Credentials { username: username.into(), password: password.into() }
}

#[actix_web::test]
async fn register_then_login() {
    let repo = InMemRepo::new();
    let user = register(&repo, creds("  alice ", "pw1")).await.unwrap();
    assert_eq!(user.username, "alice");
    assert_eq!(user.role, Role::User);

    let stored = repo.find_user_by_username("alice").await.unwrap().unwrap();
    assert_ne!(stored.password_hash, "pw1");

    let logged_in = authenticate(&repo, creds("alice", "pw1")).await.unwrap();
    assert_eq!(logged_in.id, user.id);
}

#[actix_web::test]
async fn duplicate_registration_keeps_original_password() {
    let repo = InMemRepo::new();
    register(&repo, creds("alice", "pw1")).await.unwrap();
    let err = register(&repo, creds("alice", "pw2")).await.unwrap_err();
    assert!(matches!(err, CredentialError::DuplicateUsername));

    assert!(authenticate(&repo, creds("alice", "pw1")).await.is_ok());
    assert!(matches!(
        authenticate(&repo, creds("alice", "pw2")).await,
        Err(CredentialError::InvalidCredentials)
    ));
}

#[actix_web::test]
async fn blank_fields_are_rejected() {
    let repo = InMemRepo::new();
    assert!(matches!(register(&repo, creds("   ", "pw")).await, Err(CredentialError::Invalid(_))));
    assert!(matches!(register(&repo, creds("bob", "")).await, Err(CredentialError::Invalid(_))));
    assert!(matches!(register(&repo, creds(&"x".repeat(51), "pw")).await, Err(CredentialError::Invalid(_))));
}

#[actix_web::test]
async fn unknown_user_and_wrong_password_look_the_same() {
    let repo = InMemRepo::new();
    register(&repo, creds("alice", "pw1")).await.unwrap();

    let wrong_pw = authenticate(&repo, creds("alice", "nope")).await.unwrap_err();
    let no_user = authenticate(&repo, creds("mallory", "pw1")).await.unwrap_err();
    assert!(matches!(wrong_pw, CredentialError::InvalidCredentials));
    assert!(matches!(no_user, CredentialError::InvalidCredentials));
    assert_eq!(wrong_pw.to_string(), no_user.to_string());
}

#[actix_web::test]
async fn provision_admin_is_idempotent() {
    let repo = InMemRepo::new();
    let admin = provision_admin(&repo, creds("root", "s3cret")).await.unwrap().unwrap();
    assert_eq!(admin.role, Role::Admin);

    // second run leaves the account alone, password included
    assert!(provision_admin(&repo, creds("root", "other")).await.unwrap().is_none());
    assert!(authenticate(&repo, creds("root", "s3cret")).await.is_ok());
    assert!(authenticate(&repo, creds("root", "other")).await.is_err());
}

#[actix_web::test]
async fn provision_admin_does_not_promote_existing_user() {
    let repo = InMemRepo::new();
    register(&repo, creds("root", "pw")).await.unwrap();
    assert!(provision_admin(&repo, creds("root", "s3cret")).await.unwrap().is_none());
    let user = authenticate(&repo, creds("root", "pw")).await.unwrap();
    assert_eq!(user.role, Role::User);
}
