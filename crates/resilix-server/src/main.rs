mod routes;

use std::sync::Arc;

use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::info;

use resilix_core::{
    config::Config, orchestrator::Orchestrator, session::ensure_session_store,
    session::SessionStore,
};

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn SessionStore>,
    pub orchestrator: Orchestrator,
}

// ── CORS ──────────────────────────────────────────────────────────────────

fn cors_layer(allowed_origins: &str) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty() && *o != "*")
        .filter_map(|o| o.parse().ok())
        .collect();
    if origins.is_empty() || allowed_origins.split(',').any(|o| o.trim() == "*") {
        return CorsLayer::permissive();
    }
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "resilix_server=info,resilix_core=info,resilix_providers=info,tower_http=warn".into()
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env());
    let store = ensure_session_store(&config).await?;

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        store,
        orchestrator: Orchestrator::new(Arc::clone(&config), None),
    });

    let mut app = Router::new()
        .route("/webhook/prometheus", post(routes::prometheus_webhook))
        .route("/incidents", get(routes::list_incidents))
        .route("/incidents/:id", get(routes::get_incident))
        .route("/incidents/:id/approve-merge", post(routes::approve_merge))
        .route("/health", get(routes::health));

    // Static frontend, when a built dist directory is configured.
    if !config.frontend_dist_dir.is_empty() {
        let dist_dir = config.frontend_dist_dir.clone();
        let serve_dir = tower_http::services::ServeDir::new(&dist_dir).fallback(
            tower_http::services::ServeFile::new(format!("{dist_dir}/index.html")),
        );
        app = app.fallback_service(serve_dir);
    }

    let app = app
        .layer(cors_layer(&config.cors_allowed_origins))
        .with_state(state);

    let addr = format!("{}:{}", config.web_bind, config.web_port);
    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
