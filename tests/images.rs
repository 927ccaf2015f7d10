#![cfg(feature = "inmem-store")]

#[macro_use]
mod common;

use actix_web::test;
use common::{bearer, ADMIN};
use serde_json::{json, Value};

// Helper to build a multipart body with provided bytes and filename
fn build_multipart(file_name: &str, bytes: &[u8], boundary: &str) -> (String, Vec<u8>) {
    let mut body: Vec<u8> = Vec::new();
    let disp = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
    );
    body.extend_from_slice(disp.as_bytes());
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    (format!("multipart/form-data; boundary={boundary}"), body)
}

// Minimal 1x1 PNG
fn sample_png() -> Vec<u8> {
    vec![
        0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, // signature
        0x00, 0x00, 0x00, 0x0D, b'I', b'H', b'D', b'R', 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
        0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F, 0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, b'I',
        b'D', b'A', b'T', 0x78, 0x9C, 0x63, 0x00, 0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A,
        0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, b'I', b'E', b'N', b'D', 0xAE, 0x42, 0x60, 0x82,
    ]
}

fn upload(token: Option<&str>, name: &str, bytes: &[u8]) -> test::TestRequest {
    let (content_type, body) = build_multipart(name, bytes, "XBOUNDARY");
    let mut req = test::TestRequest::post()
        .uri("/api/v1/images")
        .insert_header(("Content-Type", content_type))
        .set_payload(body);
    if let Some(t) = token {
        req = req.insert_header(bearer(t));
    }
    req
}

#[actix_web::test]
async fn admin_upload_then_duplicate() {
    let (state, _dir) = common::state().await;
    let app = init_app!(state);
    let admin = login!(app, ADMIN.0, ADMIN.1);

    let resp = test::call_service(&app, upload(Some(&admin), "pixel.png", &sample_png()).to_request()).await;
    assert_eq!(resp.status(), 201);
    let first: Value = test::read_body_json(resp).await;
    assert_eq!(first["mime"], "image/png");
    assert_eq!(first["duplicate"], false);
    let hash = first["hash"].as_str().unwrap().to_string();
    assert_eq!(hash.len(), 64);

    let resp = test::call_service(&app, upload(Some(&admin), "again.png", &sample_png()).to_request()).await;
    assert_eq!(resp.status(), 200);
    let second: Value = test::read_body_json(resp).await;
    assert_eq!(second["hash"], hash.as_str());
    assert_eq!(second["duplicate"], true);

    let req = test::TestRequest::get().uri(&format!("/images/{hash}")).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("content-type").unwrap(), "image/png");
    let bytes = test::read_body(resp).await;
    assert_eq!(bytes.as_ref(), sample_png().as_slice());
}

#[actix_web::test]
async fn upload_requires_admin() {
    let (state, _dir) = common::state().await;
    let app = init_app!(state);
    let user = login!(app, "alice", "pw1");

    let resp = test::call_service(&app, upload(Some(&user), "pixel.png", &sample_png()).to_request()).await;
    assert_eq!(resp.status(), 401);
    let resp = test::call_service(&app, upload(None, "pixel.png", &sample_png()).to_request()).await;
    assert_eq!(resp.status(), 401);
}

#[actix_web::test]
async fn non_image_upload_is_unsupported() {
    let (state, _dir) = common::state().await;
    let app = init_app!(state);
    let admin = login!(app, ADMIN.0, ADMIN.1);

    let resp = test::call_service(&app, upload(Some(&admin), "notes.txt", b"hello world").to_request()).await;
    assert_eq!(resp.status(), 415);
}

#[actix_web::test]
async fn unknown_or_malformed_hash_is_not_found() {
    let (state, _dir) = common::state().await;
    let app = init_app!(state);

    for uri in [format!("/images/{}", "a".repeat(64)), "/images/..%2F..%2Fetc%2Fpasswd".to_string()] {
        let req = test::TestRequest::get().uri(&uri).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 404, "{uri}");
    }
}

#[actix_web::test]
async fn article_image_must_be_uploaded_first() {
    let (state, _dir) = common::state().await;
    let app = init_app!(state);
    let admin = login!(app, ADMIN.0, ADMIN.1);

    let req = test::TestRequest::post()
        .uri("/api/v1/articles")
        .insert_header(bearer(&admin))
        .set_json(&json!({"title": "T", "category": "c", "body": "b", "image": "f".repeat(64)}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 400);

    let resp = test::call_service(&app, upload(Some(&admin), "pixel.png", &sample_png()).to_request()).await;
    let uploaded: Value = test::read_body_json(resp).await;
    let hash = uploaded["hash"].as_str().unwrap().to_string();

    let req = test::TestRequest::post()
        .uri("/api/v1/articles")
        .insert_header(bearer(&admin))
        .set_json(&json!({"title": "T", "category": "c", "body": "b", "image": hash.to_uppercase()}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let article: Value = test::read_body_json(resp).await;
    assert_eq!(article["image"], hash.as_str());

    // deleting the article leaves the blob in place
    let req = test::TestRequest::delete()
        .uri(&format!("/api/v1/articles/{}", article["id"]))
        .insert_header(bearer(&admin))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 204);
    let req = test::TestRequest::get().uri(&format!("/images/{hash}")).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), 200);
}
