mod api;
mod config;
mod models;
mod providers;
mod services;
mod sync;

use std::sync::Arc;

use axum::http::{header, Method};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use api::{ApiDoc, AppState};
use config::Config;
use sync::Tracker;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "tram_monitor=debug,tower_http=debug,axum::rejection=trace".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Yekaterinburg tram monitor");
    let config = Config::from_env()?;
    config.validate();

    let tracker = Arc::new(Tracker::new(config.clone())?);
    let state = AppState {
        atlas: tracker.atlas_handle(),
        states: tracker.state_store(),
        stats: tracker.stats_store(),
        broadcaster: tracker.broadcaster(),
    };

    // Background loops: initial atlas build, then the fast vehicle poll and
    // the slow atlas refresh
    tokio::spawn(tracker.clone().start());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers([header::CONTENT_TYPE]);

    let (rest, _openapi) = OpenApiRouter::<AppState>::with_openapi(ApiDoc::openapi())
        .routes(routes!(api::routes::list_routes))
        .routes(routes!(api::routes::get_route))
        .routes(routes!(api::stops::list_stops))
        .routes(routes!(api::stops::get_arrivals))
        .routes(routes!(api::vehicles::list_vehicles))
        .routes(routes!(api::vehicles::get_vehicle))
        .routes(routes!(api::diagnostics::get_diagnostics))
        .routes(routes!(api::diagnostics::get_route_diagnostics))
        .routes(routes!(api::health::health_check))
        .split_for_parts();

    let app = rest
        .route("/ws/vehicles", axum::routing::get(api::ws::ws_vehicles))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let listener = tokio::net::TcpListener::bind(&config.http_bind).await?;
    info!(addr = %config.http_bind, "HTTP server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
