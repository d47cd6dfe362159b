use axum::{
    Router,
    routing::{get, post, put},
    middleware::from_fn_with_state,
    extract::DefaultBodyLimit,
};

use anyhow::Context;
use http::{HeaderValue, Method, header};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_cookies::CookieManagerLayer;
use tower_governor::governor::GovernorConfigBuilder;
use tower_http::{
    trace::{TraceLayer, DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, DefaultOnFailure},
    cors::CorsLayer,
};

use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rollcall::{
    config::Config,
    handlers,
    middleware_layer,
    services::face::FaceExtraction,
    state::AppState,
};

/// Large enough for a base64 face image plus the JSON around it.
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    tracing::info!("✅ Configuration loaded successfully");

    // No extraction model ships with the server; image-based face checks
    // report ExtractorNotReady until one is installed.
    let extraction = FaceExtraction::disabled();
    if let Err(e) = extraction.initialize().await {
        tracing::warn!("⚠️ Face extraction unavailable: {}", e);
    }

    let state = AppState::new(&config, extraction).await?;
    tracing::info!("✅ AppState initialized");

    let cors = CorsLayer::new()
        .allow_origin(
            config
                .cors_origin
                .parse::<HeaderValue>()
                .context("Invalid CORS_ORIGIN")?,
        )
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            header::COOKIE,
        ])
        .allow_credentials(true)
        .max_age(Duration::from_secs(86400));

    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(100)
            .burst_size(500)
            .use_headers()
            .finish()
            .context("Invalid rate limiter configuration")?,
    );

    let public_routes = Router::new()
        .route("/api/health", get(handlers::health::health))
        .with_state(state.clone());

    let mark_routes = Router::new()
        .route(
            "/api/sessions/{session_id}/mark",
            post(handlers::attendance::mark_attendance),
        )
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware_layer::rate_limit::rate_limit_mark,
        ))
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware_layer::auth::require_auth,
        ))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/api/sessions", post(handlers::sessions::open_session))
        .route(
            "/api/sessions/{session_id}",
            get(handlers::sessions::get_session),
        )
        .route(
            "/api/sessions/{session_id}/close",
            post(handlers::sessions::close_session),
        )
        .route(
            "/api/sessions/{session_id}/qr",
            post(handlers::sessions::rotate_token),
        )
        .route(
            "/api/sessions/{session_id}/events",
            get(handlers::events::session_events),
        )
        .route("/api/members/me/face", put(handlers::members::register_face))
        .route("/api/records", get(handlers::attendance::list_records))
        .route(
            "/api/records/summary",
            get(handlers::attendance::summarize_records),
        )
        .route_layer(from_fn_with_state(
            state.clone(),
            middleware_layer::auth::require_auth,
        ))
        .with_state(state.clone());

    let app = Router::new()
        .merge(public_routes)
        .merge(mark_routes)
        .merge(protected_routes)
        .layer(tower_governor::GovernorLayer::new(governor_conf))
        .layer(
            ServiceBuilder::new()
                .layer(cors)
                .map_response(|res: http::Response<_>| res.map(axum::body::Body::new))
                .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
                .layer(CookieManagerLayer::new())
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::default().include_headers(true))
                        .on_request(DefaultOnRequest::default().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::default().level(Level::DEBUG))
                        .on_failure(DefaultOnFailure::default().level(Level::ERROR)),
                ),
        );

    let sweep_state = state.clone();
    let sweep_interval = config.session_sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            let closed = sweep_state.attendance.sweep_overdue().await;
            if !closed.is_empty() {
                tracing::info!("🧹 Closed {} overdue session(s)", closed.len());
            }
        }
    });

    let addr: SocketAddr = config.bind_addr;
    tracing::info!("🚀 Server listening on http://{}", addr);
    tracing::info!(
        "✅ Overdue session sweeper started (runs every {}s)",
        sweep_interval.as_secs()
    );
    tracing::info!("✅ All systems operational");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
