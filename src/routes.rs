use std::sync::Arc;

use actix_multipart::Multipart;
use actix_web::cookie::{time::Duration as CookieDuration, Cookie, SameSite};
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt as _;
use metrics_exporter_prometheus::PrometheusHandle;
use sha2::{Digest, Sha256};
use tracing::{error, info};

use crate::credentials;
use crate::error::ApiError;
use crate::models::*;
use crate::repo::Repo;
use crate::session::{request_tokens, SessionState, SessionStore, SESSION_COOKIE};
use crate::storage::{sniff_mime, ImageStore, ImageStoreError};

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(
                web::resource("/articles")
                    .route(web::get().to(list_articles))
                    .route(web::post().to(create_article)),
            )
            .service(
                web::resource("/articles/{id}")
                    .route(web::get().to(get_article))
                    .route(web::delete().to(delete_article)),
            )
            .service(
                web::resource("/articles/{id}/comments")
                    .route(web::get().to(list_comments))
                    .route(web::post().to(add_comment)),
            )
            .service(web::resource("/articles/{id}/like").route(web::post().to(toggle_like)))
            .service(web::resource("/auth/register").route(web::post().to(register)))
            .service(web::resource("/auth/login").route(web::post().to(login)))
            .service(web::resource("/auth/logout").route(web::post().to(logout)))
            .service(web::resource("/auth/me").route(web::get().to(auth_me)))
            .service(web::resource("/images").route(web::post().to(upload_image))),
    );
    // no /api/v1 prefix so an article's image can be used directly as <img src>
    cfg.route("/images/{hash}", web::get().to(get_image));
    cfg.route("/metrics", web::get().to(render_metrics));
}

/// Everything a handler may touch. Sessions live here rather than in a
/// process global, and reach handlers through `web::Data`.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repo>,
    pub images: Arc<dyn ImageStore>,
    pub sessions: SessionStore,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(repo: Arc<dyn Repo>, images: Arc<dyn ImageStore>, sessions: SessionStore) -> Self {
        Self { repo, images, sessions, metrics: None }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

// ---------------- Articles -----------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/articles",
    tag = "articles",
    responses((status = 200, description = "Articles, newest first", body = [Article]))
)]
pub async fn list_articles(data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let articles = data.repo.list_articles().await?;
    Ok(HttpResponse::Ok().json(articles))
}

#[utoipa::path(
    get,
    path = "/api/v1/articles/{id}",
    tag = "articles",
    params(("id" = i64, Path, description = "Article id")),
    responses(
        (status = 200, description = "Article with threaded comments", body = ArticleDetail),
        (status = 404, description = "Article not found")
    )
)]
pub async fn get_article(
    session: SessionState,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let article = data.repo.get_article(id).await?;
    let comments = data.repo.list_comments(id).await?;
    let likes = data.repo.count_likes(id).await?;
    let liked = match session.session() {
        Some(s) => data.repo.has_liked(id, s.user_id).await?,
        None => false,
    };
    Ok(HttpResponse::Ok().json(ArticleDetail { article, comments: CommentNode::forest(comments), likes, liked }))
}

#[utoipa::path(
    post,
    path = "/api/v1/articles",
    tag = "articles",
    request_body = NewArticle,
    responses(
        (status = 201, description = "Article published", body = Article),
        (status = 400, description = "Missing field or unknown image"),
        (status = 401, description = "Admins only")
    )
)]
pub async fn create_article(
    session: SessionState,
    data: web::Data<AppState>,
    payload: web::Json<NewArticle>,
) -> Result<HttpResponse, ApiError> {
    let admin = session.require_admin()?;
    let new = payload.into_inner().normalized().map_err(|m| ApiError::BadRequest(m.into()))?;
    if let Some(hash) = new.image.as_deref() {
        if !data.images.exists(hash).await? {
            return Err(ApiError::BadRequest("image has not been uploaded".into()));
        }
    }
    let article = data.repo.create_article(new).await?;
    metrics::counter!("newsroom_articles_created_total").increment(1);
    info!(article_id = article.id, admin = %admin.username, "article published");
    Ok(HttpResponse::Created().json(article))
}

#[utoipa::path(
    delete,
    path = "/api/v1/articles/{id}",
    tag = "articles",
    params(("id" = i64, Path, description = "Article id")),
    responses(
        (status = 204, description = "Article and its comments and likes removed"),
        (status = 401, description = "Admins only"),
        (status = 404, description = "Article not found")
    )
)]
pub async fn delete_article(
    session: SessionState,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let admin = session.require_admin()?;
    let id = path.into_inner();
    data.repo.delete_article(id).await?;
    metrics::counter!("newsroom_articles_deleted_total").increment(1);
    info!(article_id = id, admin = %admin.username, "article deleted");
    Ok(HttpResponse::NoContent().finish())
}

// ---------------- Engagement ---------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/articles/{id}/comments",
    tag = "engagement",
    params(("id" = i64, Path, description = "Article id")),
    responses(
        (status = 200, description = "Comments in insertion order", body = [Comment]),
        (status = 404, description = "Article not found")
    )
)]
pub async fn list_comments(data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    data.repo.get_article(id).await?;
    let comments = data.repo.list_comments(id).await?;
    Ok(HttpResponse::Ok().json(comments))
}

#[utoipa::path(
    post,
    path = "/api/v1/articles/{id}/comments",
    tag = "engagement",
    params(("id" = i64, Path, description = "Article id")),
    request_body = CommentRequest,
    responses(
        (status = 201, description = "Comment added", body = Comment),
        (status = 401, description = "Login required"),
        (status = 404, description = "Article or parent comment not found"),
        (status = 422, description = "Parent comment is on another article")
    )
)]
pub async fn add_comment(
    session: SessionState,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<CommentRequest>,
) -> Result<HttpResponse, ApiError> {
    let user = session.require_user()?;
    let new = payload
        .into_inner()
        .into_new(path.into_inner(), user.user_id)
        .map_err(|m| ApiError::BadRequest(m.into()))?;
    let comment = data.repo.add_comment(new).await?;
    metrics::counter!("newsroom_comments_total").increment(1);
    Ok(HttpResponse::Created().json(comment))
}

#[derive(Debug, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct LikeResponse {
    pub liked: bool,
    pub likes: i64,
}

#[utoipa::path(
    post,
    path = "/api/v1/articles/{id}/like",
    tag = "engagement",
    params(("id" = i64, Path, description = "Article id")),
    responses(
        (status = 200, description = "New like state for the caller", body = LikeResponse),
        (status = 401, description = "Login required"),
        (status = 404, description = "Article not found")
    )
)]
pub async fn toggle_like(
    session: SessionState,
    data: web::Data<AppState>,
    path: web::Path<Id>,
) -> Result<HttpResponse, ApiError> {
    let user = session.require_user()?;
    let id = path.into_inner();
    let LikeState { liked } = data.repo.toggle_like(id, user.user_id).await?;
    let likes = data.repo.count_likes(id).await?;
    metrics::counter!("newsroom_like_toggles_total", "liked" => if liked { "true" } else { "false" }).increment(1);
    Ok(HttpResponse::Ok().json(LikeResponse { liked, likes }))
}

// ---------------- Accounts -----------------------------------------

#[utoipa::path(
    post,
    path = "/api/v1/auth/register",
    tag = "auth",
    request_body = Credentials,
    responses(
        (status = 201, description = "Account created", body = User),
        (status = 400, description = "Blank username or password"),
        (status = 409, description = "Username already taken")
    )
)]
pub async fn register(data: web::Data<AppState>, payload: web::Json<Credentials>) -> Result<HttpResponse, ApiError> {
    let user = credentials::register(data.repo.as_ref(), payload.into_inner()).await?;
    metrics::counter!("newsroom_registrations_total").increment(1);
    Ok(HttpResponse::Created().json(user))
}

#[derive(Debug, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct LoginResponse {
    pub token: String,
    pub user: User,
    pub expires_at: DateTime<Utc>,
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/login",
    tag = "auth",
    request_body = Credentials,
    responses(
        (status = 200, description = "Session opened; token also set as a cookie", body = LoginResponse),
        (status = 401, description = "Invalid username or password")
    )
)]
pub async fn login(data: web::Data<AppState>, payload: web::Json<Credentials>) -> Result<HttpResponse, ApiError> {
    let user = match credentials::authenticate(data.repo.as_ref(), payload.into_inner()).await {
        Ok(u) => u,
        Err(e) => {
            metrics::counter!("newsroom_logins_total", "outcome" => "rejected").increment(1);
            return Err(e.into());
        }
    };
    let session = data.sessions.open(&user);
    metrics::counter!("newsroom_logins_total", "outcome" => "ok").increment(1);
    info!(user_id = user.id, role = user.role.as_str(), "login");

    let ttl = (session.expires_at - Utc::now()).num_seconds().max(0);
    let cookie = Cookie::build(SESSION_COOKIE, session.token.clone())
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .max_age(CookieDuration::seconds(ttl))
        .finish();
    Ok(HttpResponse::Ok()
        .cookie(cookie)
        .json(LoginResponse { token: session.token, user, expires_at: session.expires_at }))
}

#[utoipa::path(
    post,
    path = "/api/v1/auth/logout",
    tag = "auth",
    responses((status = 204, description = "Session cleared"))
)]
pub async fn logout(req: HttpRequest, data: web::Data<AppState>) -> HttpResponse {
    // header and cookie may name different sessions; both end here
    let closed = request_tokens(&req).filter(|token| data.sessions.close(token)).count();
    if closed > 0 {
        info!(closed, "logout");
    }
    let mut removal = Cookie::build(SESSION_COOKIE, "").path("/").finish();
    removal.make_removal();
    HttpResponse::NoContent().cookie(removal).finish()
}

#[utoipa::path(
    get,
    path = "/api/v1/auth/me",
    tag = "auth",
    responses(
        (status = 200, description = "Current user", body = User),
        (status = 401, description = "Not logged in")
    )
)]
pub async fn auth_me(session: SessionState, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let s = session.require_user()?;
    let user: User = data.repo.get_user(s.user_id).await?.into();
    Ok(HttpResponse::Ok().json(user))
}

// ---------------- Images -------------------------------------------

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct ImageUploadResponse {
    pub hash: String,
    pub mime: String,
    pub size: usize,
    pub duplicate: bool, // same bytes were already stored
}

const IMAGE_SIZE_LIMIT: usize = 10 * 1024 * 1024; // 10 MB

const ALLOWED_MIME: &[&str] = &["image/png", "image/jpeg", "image/gif", "image/webp"];

#[utoipa::path(
    post,
    path = "/api/v1/images",
    tag = "articles",
    responses(
        (status = 201, description = "Image stored (new)", body = ImageUploadResponse),
        (status = 200, description = "Image already existed", body = ImageUploadResponse),
        (status = 401, description = "Admins only"),
        (status = 413, description = "Payload too large"),
        (status = 415, description = "Unsupported media type")
    )
)]
pub async fn upload_image(
    session: SessionState,
    data: web::Data<AppState>,
    mut payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    use actix_web::http::StatusCode;
    session.require_admin()?;
    while let Some(mut field) = payload.try_next().await.map_err(|e| {
        error!("multipart error: {e}");
        ApiError::BadRequest("malformed multipart body".into())
    })? {
        if field.content_disposition().get_name() != Some("file") {
            continue;
        }
        let mut bytes: Vec<u8> = Vec::new();
        let mut hasher = Sha256::new();
        while let Some(chunk) = field.try_next().await.map_err(|e| {
            error!("stream read error: {e}");
            ApiError::BadRequest("malformed multipart body".into())
        })? {
            if bytes.len() + chunk.len() > IMAGE_SIZE_LIMIT {
                return Ok(HttpResponse::build(StatusCode::PAYLOAD_TOO_LARGE).finish());
            }
            hasher.update(&chunk);
            bytes.extend_from_slice(&chunk);
        }
        let hash = hex::encode(hasher.finalize());
        let mime = sniff_mime(&bytes);
        if !ALLOWED_MIME.contains(&mime.as_str()) {
            return Ok(HttpResponse::UnsupportedMediaType().finish());
        }
        let (status, duplicate) = match data.images.save(&hash, &bytes).await {
            Ok(()) => (StatusCode::CREATED, false),
            Err(ImageStoreError::Duplicate) => (StatusCode::OK, true),
            Err(e) => return Err(e.into()),
        };
        let resp = ImageUploadResponse { hash, mime, size: bytes.len(), duplicate };
        return Ok(HttpResponse::build(status).json(resp));
    }
    Err(ApiError::BadRequest("expected a multipart field named \"file\"".into()))
}

#[utoipa::path(
    get,
    path = "/images/{hash}",
    tag = "articles",
    params(("hash" = String, Path, description = "SHA-256 of the image, lowercase hex")),
    responses(
        (status = 200, description = "Image bytes with the sniffed content type"),
        (status = 404, description = "No such image, or not a valid hash")
    )
)]
pub async fn get_image(data: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let hash = path.into_inner();
    let (bytes, mime) = data.images.load(&hash).await?;
    Ok(HttpResponse::Ok().insert_header(("Content-Type", mime)).body(bytes))
}

pub async fn render_metrics(data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let handle = data.metrics.as_ref().ok_or(ApiError::NotFound)?;
    Ok(HttpResponse::Ok().content_type("text/plain; version=0.0.4").body(handle.render()))
}
