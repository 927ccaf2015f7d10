#![allow(dead_code)]

use std::sync::Arc;

use newsroom::credentials::provision_admin;
use newsroom::models::Credentials;
use newsroom::repo::inmem::InMemRepo;
use newsroom::storage::FsImageStore;
use newsroom::{AppState, SessionStore};

pub const ADMIN: (&str, &str) = ("editor", "editor-pw");

/// Fresh in-memory state with an admin account already provisioned. The
/// returned tempdir backs the image store and must outlive the test.
pub async fn state() -> (AppState, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let repo = Arc::new(InMemRepo::new());
    provision_admin(repo.as_ref(), Credentials { username: ADMIN.0.into(), password: ADMIN.1.into() })
        .await
        .unwrap();
    let images = Arc::new(FsImageStore::new(dir.path().join("images")));
    let state = AppState::new(repo, images, SessionStore::new(chrono::Duration::hours(1)));
    (state, dir)
}

/// Build the routed test service around `state`.
#[allow(unused_macros)]
macro_rules! init_app {
    ($state:expr) => {
        actix_web::test::init_service(
            actix_web::App::new()
                .wrap(newsroom::SecurityHeaders::default())
                .app_data(actix_web::web::Data::new($state))
                .configure(newsroom::config),
        )
        .await
    };
}

pub fn bearer(token: &str) -> (&'static str, String) {
    ("Authorization", format!("Bearer {token}"))
}

/// Register (ignoring a taken name) and log in over HTTP; yields the session token.
#[allow(unused_macros)]
macro_rules! login {
    ($app:expr, $user:expr, $pw:expr) => {{
        let body = serde_json::json!({ "username": $user, "password": $pw });
        let req = actix_web::test::TestRequest::post().uri("/api/v1/auth/register").set_json(&body).to_request();
        let _ = actix_web::test::call_service(&$app, req).await;
        let req = actix_web::test::TestRequest::post().uri("/api/v1/auth/login").set_json(&body).to_request();
        let resp = actix_web::test::call_service(&$app, req).await;
        assert_eq!(resp.status(), 200, "login failed for {}", $user);
        let v: serde_json::Value = actix_web::test::read_body_json(resp).await;
        v["token"].as_str().unwrap().to_string()
    }};
}
