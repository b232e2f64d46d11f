use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/execute", post(handlers::submit_job))
        .route("/job/:job_id", get(handlers::get_job_result))
        .route("/status", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        .route("/admin/queue/status", get(handlers::queue_status))
        .route("/admin/queue/metrics", get(handlers::queue_metrics))
        .route("/admin/queue/metrics/reset", post(handlers::reset_metrics))
}
