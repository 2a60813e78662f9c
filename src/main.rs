mod circuit_breaker;
mod config;
mod db;
mod dispatcher;
mod errors;
mod handlers;
mod lifecycle;
mod metrics;
mod models;
mod multi_inquiry;
mod notifier;
mod outcomes;
mod scheduler;
mod scoring;
mod selector;

use axum::{
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::db::Database;
use crate::notifier::NotificationService;
use crate::scheduler::PhaseScheduler;

/// Serves the OpenAPI specification YAML file.
///
/// This endpoint reads the `openapi.yml` file from the filesystem and serves it
/// with the appropriate content type. If the file is not found, it returns a 404 error.
async fn serve_openapi_spec() -> impl IntoResponse {
    match tokio::fs::read_to_string("openapi.yml").await {
        Ok(content) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/yaml")],
            content,
        )
            .into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "OpenAPI spec not found").into_response(),
    }
}

/// Serves the Swagger UI HTML page.
///
/// This endpoint returns an HTML page that embeds the Swagger UI, configured to
/// load the OpenAPI specification served by `serve_openapi_spec`.
async fn serve_swagger_ui() -> impl IntoResponse {
    let html = r#"
<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>DJ Routing API - Swagger UI</title>
    <link rel="stylesheet" type="text/css" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css">
    <style>
        body { margin: 0; padding: 0; }
    </style>
</head>
<body>
    <div id="swagger-ui"></div>
    <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
    <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-standalone-preset.js"></script>
    <script>
        window.onload = function() {
            window.ui = SwaggerUIBundle({
                url: "/api-docs/openapi.yml",
                dom_id: '#swagger-ui',
                deepLinking: true,
                presets: [
                    SwaggerUIBundle.presets.apis,
                    SwaggerUIStandalonePreset
                ],
                layout: "StandaloneLayout"
            });
        };
    </script>
</body>
</html>
"#;
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/html; charset=utf-8")],
        html,
    )
}

/// Main entry point for the application.
///
/// This function initializes the application, including:
/// - Logging and tracing.
/// - Configuration loading.
/// - Database connection and migrations.
/// - Outbound collaborator clients (notifications, routing events).
/// - The background phase-expiry sweep.
/// - HTTP routes and middleware (CORS, Rate Limiting).
///
/// It then starts the Axum server.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dj_routing_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded successfully");

    // Initialize database connection pool and run migrations
    let db = Database::new(&config.database_url).await?;
    tracing::info!("Database connection pool established");

    // Outbound collaborator clients, shared across handlers and the sweep
    let notifier = Arc::new(NotificationService::new(&config)?);
    tracing::info!("Notification service initialized");

    // Deduplication cache for performer-response deliveries (5 minute TTL).
    // Duplicate webhook deliveries short-circuit here before hitting the
    // database; the conditional updates underneath stay the source of truth.
    let response_dedupe_cache = Cache::builder()
        .time_to_live(Duration::from_secs(300))
        .max_capacity(10_000)
        .build();
    tracing::info!("Response deduplication cache initialized");

    // Background phase-expiry sweep. Offers whose window lapsed are closed
    // within one sweep interval, so stale offers never linger.
    let sweeper = Arc::new(PhaseScheduler::new(
        db.pool.clone(),
        config.clone(),
        Arc::clone(&notifier),
    ));
    tokio::spawn(Arc::clone(&sweeper).run_sweep_loop());
    tracing::info!(
        "Phase-expiry sweep started (interval {}s)",
        config.routing.sweep_interval_secs
    );

    // Build application state
    let app_state = Arc::new(handlers::AppState {
        db: db.pool.clone(),
        config: config.clone(),
        notifier,
        response_dedupe_cache,
    });

    // Configure rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .unwrap(),
    );

    // Build protected routes with security layers
    let protected_routes = Router::new()
        // API Documentation
        .route("/docs", get(serve_swagger_ui))
        .route("/api-docs/openapi.yml", get(serve_openapi_spec))
        // Lead lifecycle
        .route("/api/v1/leads", post(handlers::submit_lead))
        .route("/api/v1/leads/:id", get(handlers::get_lead))
        .route("/api/v1/leads/:id/cancel", post(handlers::cancel_lead))
        .route("/api/v1/leads/:id/converted", post(handlers::mark_converted))
        .route("/api/v1/leads/:id/requeue", post(handlers::requeue_lead))
        .route(
            "/api/v1/leads/:id/distributions",
            get(handlers::get_lead_distributions),
        )
        // Performer responses
        .route(
            "/api/v1/assignments/:id/response",
            post(handlers::submit_response),
        )
        .route(
            "/api/v1/assignments/:id/viewed",
            post(handlers::record_viewed),
        )
        // Operator surface
        .route(
            "/api/v1/performers/:id/metrics",
            get(handlers::get_performer_metrics),
        )
        .route(
            "/api/v1/performers/:id/suspension",
            post(handlers::override_suspension),
        )
        // Multi-performer inquiries
        .route("/api/v1/multi-inquiry", post(handlers::submit_multi_inquiry))
        .route("/api/v1/multi-inquiry/:id", get(handlers::get_multi_inquiry))
        .layer(
            ServiceBuilder::new()
                // Request size limit: 1MB max payload (prevents memory exhaustion)
                .layer(RequestBodyLimitLayer::new(1024 * 1024))
                // Rate limiting: 10 req/sec per IP, burst of 20
                .layer(GovernorLayer {
                    config: governor_conf,
                }),
        );

    // Build final app with health check (bypasses rate limiting)
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
