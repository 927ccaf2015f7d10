use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware::Compress, web, App, HttpServer};
use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn, Level};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi; // bring trait into scope for ApiDoc::openapi()
use utoipa_swagger_ui::SwaggerUi;

use newsroom::credentials;
use newsroom::openapi::ApiDoc;
use newsroom::repo::Repo;
use newsroom::storage::build_image_store;
use newsroom::{config, AppConfig, AppState, SecurityHeaders, SessionStore};

#[cfg(all(feature = "inmem-store", not(feature = "postgres-store")))]
async fn build_repo(cfg: &AppConfig) -> anyhow::Result<Arc<dyn Repo>> {
    use newsroom::repo::inmem::InMemRepo;
    let repo = match &cfg.data_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "using in-memory repository with snapshots");
            InMemRepo::with_snapshot(dir.join("state.json"))
        }
        None => {
            warn!("NEWSROOM_DATA_DIR not set; state is lost on restart");
            InMemRepo::new()
        }
    };
    Ok(Arc::new(repo))
}

#[cfg(feature = "postgres-store")]
async fn build_repo(cfg: &AppConfig) -> anyhow::Result<Arc<dyn Repo>> {
    use newsroom::repo::pg::PgRepo;
    use sqlx::postgres::PgPoolOptions;
    let url = cfg.database_url.as_deref().context("DATABASE_URL must be set for postgres-store")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    let repo = PgRepo::new(pool);
    repo.run_migrations().await.context("failed to apply migrations")?;
    info!("using Postgres repository backend");
    Ok(Arc::new(repo))
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load .env automatically only in debug builds.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("bootstrapping newsroom");
    let cfg = AppConfig::from_env().context("invalid configuration")?;

    let repo = build_repo(&cfg).await?;
    if let Some(seed) = cfg.bootstrap_admin.clone() {
        let username = seed.username.clone();
        match credentials::provision_admin(repo.as_ref(), seed.into()).await {
            Ok(Some(_)) => info!(%username, "bootstrap admin created"),
            Ok(None) => info!(%username, "bootstrap admin already present"),
            Err(e) => return Err(anyhow::anyhow!("failed to provision admin '{username}': {e}")),
        }
    }

    let images = build_image_store(&cfg.image_dir).await?;
    let sessions = SessionStore::new(cfg.session_ttl);
    // expired sessions are also dropped lazily on lookup; this catches abandoned ones
    let sweeper = sessions.clone();
    actix_web::rt::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(600));
        loop {
            tick.tick().await;
            let purged = sweeper.purge_expired();
            if purged > 0 {
                info!(purged, "expired sessions removed");
            }
        }
    });
    let mut state = AppState::new(repo, images, sessions);
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => state = state.with_metrics(handle),
        Err(e) => warn!("metrics recorder not installed: {e}"),
    }

    let openapi = ApiDoc::openapi();
    let security = SecurityHeaders::from_config(&cfg);
    let frontend = cfg.frontend_url.clone();

    let server = HttpServer::new(move || {
        let mut cors = Cors::default()
            .allowed_origin("http://localhost:5173")
            .allowed_origin("http://127.0.0.1:5173")
            .allow_any_header()
            .allowed_methods(["GET", "POST", "DELETE", "OPTIONS"])
            .supports_credentials()
            .max_age(3600);
        if let Some(front) = frontend.as_deref() {
            cors = cors.allowed_origin(front);
        }

        App::new()
            .wrap(TracingLogger::default())
            .wrap(Compress::default())
            .wrap(security.clone())
            .wrap(cors)
            .app_data(web::Data::new(state.clone()))
            .configure(config)
            .service(SwaggerUi::new("/docs/{_:.*}").url("/docs/openapi.json", openapi.clone()))
    })
    .bind(cfg.bind.as_str())
    .with_context(|| format!("failed to bind {}", cfg.bind))?;

    info!(bind = %cfg.bind, "listening");
    server.run().await?;
    Ok(())
}
