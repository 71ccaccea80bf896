//! Status and metrics API.

use axum::{
    extract::Extension,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::{future::Future, net::SocketAddr, sync::Arc};

use crate::metrics::{gather_prometheus, PipelineMetrics, StatsSnapshot};

struct State {
    metrics: Arc<PipelineMetrics>,
}

pub(crate) async fn run_webserver(
    port: u16,
    metrics: Arc<PipelineMetrics>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), axum::BoxError> {
    let shared_state = Arc::new(State { metrics });

    let app = Router::new()
        .route("/status", get(get_status))
        .route("/metrics", get(get_metrics))
        .layer(Extension(shared_state));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Starting status API server on {addr:?}");

    axum::Server::try_bind(&addr)?
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn get_status(Extension(state): Extension<Arc<State>>) -> Json<StatsSnapshot> {
    Json(state.metrics.snapshot())
}

async fn get_metrics(Extension(_state): Extension<Arc<State>>) -> impl IntoResponse {
    match gather_prometheus() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        ),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain")],
            err.to_string(),
        ),
    }
}

#[tokio::test]
async fn status_reports_totals() {
    let metrics = Arc::new(PipelineMetrics::new());
    metrics.record_read();
    metrics.record_filtered();
    let state = Arc::new(State { metrics });

    let Json(found) = get_status(Extension(state)).await;
    assert_eq!(found.events_read, 1);
    assert_eq!(found.filtered, 1);
}

#[tokio::test]
async fn metrics_endpoint_renders() {
    let state = Arc::new(State {
        metrics: Arc::new(PipelineMetrics::new()),
    });
    let response = get_metrics(Extension(state)).await.into_response();
    assert_eq!(response.status(), StatusCode::OK);
}
