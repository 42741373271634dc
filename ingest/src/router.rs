use std::future::ready;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use health::HealthRegistry;
use tower_http::trace::TraceLayer;

use crate::auth::{admission_middleware, AdmissionGate};
use crate::prometheus::{setup_metrics_recorder, track_metrics};
use crate::sink;
use crate::time::TimeSource;

#[derive(Clone)]
pub struct State {
    pub sink: Arc<dyn sink::Event + Send + Sync>,
    pub timesource: Arc<dyn TimeSource + Send + Sync>,
    pub gate: AdmissionGate,
}

async fn index() -> &'static str {
    "analytics ingest"
}

pub fn router<TZ: TimeSource + Send + Sync + 'static, S: sink::Event + Send + Sync + 'static>(
    timesource: TZ,
    liveness: HealthRegistry,
    sink: S,
    gate: AdmissionGate,
    metrics: bool,
) -> Router {
    let state = State {
        sink: Arc::new(sink),
        timesource: Arc::new(timesource),
        gate,
    };

    // Only the ingestion endpoints sit behind the admission gate; index
    // and health stay open.
    let ingest_routes = Router::new()
        .route("/ingest", post(crate::endpoint::event))
        .route("/ingest/batch", post(crate::endpoint::batch))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            admission_middleware,
        ));

    let router = Router::new()
        .merge(ingest_routes)
        .route("/", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install metrics unless asked to
    // Installing a global recorder when used as a library (during tests etc)
    // does not work well.
    if metrics {
        let recorder_handle = setup_metrics_recorder();

        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
