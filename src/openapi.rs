use crate::error::ApiErrorBody;
use crate::models::{Article, ArticleDetail, Comment, CommentNode, CommentRequest, Credentials, LikeState, NewArticle, Role, User};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::list_articles,
        crate::routes::get_article,
        crate::routes::create_article,
        crate::routes::delete_article,
        crate::routes::list_comments,
        crate::routes::add_comment,
        crate::routes::toggle_like,
        crate::routes::register,
        crate::routes::login,
        crate::routes::logout,
        crate::routes::auth_me,
        crate::routes::upload_image,
        crate::routes::get_image
    ),
    components(schemas(
        Article, NewArticle, ArticleDetail, Comment, CommentNode, CommentRequest,
        LikeState, User, Role, Credentials, ApiErrorBody,
        crate::routes::LikeResponse, crate::routes::LoginResponse, crate::routes::ImageUploadResponse
    )),
    tags(
        (name = "articles", description = "Publishing and reading articles"),
        (name = "engagement", description = "Comments and likes"),
        (name = "auth", description = "Accounts and sessions")
    )
)]
pub struct ApiDoc;
