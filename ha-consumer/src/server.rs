use std::time::Instant;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{MatchedPath, Path, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde_json::json;
use tokio::sync::watch;
use tracing::info;

use crate::leadership::LeadershipNotifier;
use crate::metrics_consts::{HTTP_REQUESTS, HTTP_REQUEST_DURATION};
use crate::types::{ConsumerStatus, LeadershipState, RunState};

const UNMATCHED_ROUTE: &str = "unmatched";

#[derive(Clone)]
pub struct AppState {
    pub status: watch::Receiver<ConsumerStatus>,
    pub leadership: LeadershipNotifier,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_liveness", get(liveness))
        .route("/_readiness", get(readiness))
        .route("/leadership/:state", post(leadership_change))
        .with_state(state)
}

/// Add the prometheus endpoint and request metrics. Call last, after every other
/// route has been added.
pub fn with_metrics_routes(router: Router, handle: PrometheusHandle) -> Router {
    router
        .route(
            "/metrics",
            get(move || std::future::ready(handle.render())),
        )
        .layer(axum::middleware::from_fn(track_requests))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle> {
    const BUCKETS: &[f64] = &[
        1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(BUCKETS)
        .context("invalid histogram buckets")?
        .install_recorder()
        .context("failed to install prometheus recorder")
}

pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("Listening on {}", bind);
    axum::serve(listener, router).await
}

async fn index() -> &'static str {
    "ha consumer"
}

async fn liveness() -> &'static str {
    "ok"
}

fn status_body(status: &ConsumerStatus) -> serde_json::Value {
    json!({
        "run_state": status.run_state.as_str(),
        "active_topic": status.active_topic.map(|topic| topic.as_str()),
        "leadership": status.leadership.map(|state| state.as_str()),
        "topic_switches": status.topic_switches,
    })
}

/// Ready only while records are actually being dispatched.
async fn readiness(State(state): State<AppState>) -> Response {
    let status = *state.status.borrow();
    let code = if status.run_state == RunState::Running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status_body(&status))).into_response()
}

/// Leadership callback for the election mechanism. Only records the signal.
async fn leadership_change(
    State(state): State<AppState>,
    Path(requested): Path<String>,
) -> Response {
    match requested.parse::<LeadershipState>() {
        Ok(leadership) => {
            state.leadership.on_leadership_change(leadership);
            (
                StatusCode::ACCEPTED,
                Json(json!({ "accepted": leadership.as_str() })),
            )
                .into_response()
        }
        Err(reason) => (StatusCode::BAD_REQUEST, Json(json!({ "error": reason }))).into_response(),
    }
}

/// Request count and latency per route. Requests that match no route share one
/// label so arbitrary paths cannot add series.
async fn track_requests(req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let route = route_label(req.extensions().get::<MatchedPath>());

    let response = next.run(req).await;

    let labels = [
        ("route", route),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!(HTTP_REQUESTS, &labels).increment(1);
    metrics::histogram!(HTTP_REQUEST_DURATION, &labels).record(start.elapsed().as_secs_f64());

    response
}

fn route_label(matched: Option<&MatchedPath>) -> String {
    matched.map_or_else(|| UNMATCHED_ROUTE.to_string(), |path| path.as_str().to_string())
}
