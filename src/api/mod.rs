//! Status API
//!
//! HTTP view of the node for operators and `oraclectl`. Only compiled when
//! the `status-api` feature is enabled.

use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::consensus::{ControlCommand, NodeMetrics, NodeStatus, RoundSummary, RoundView};
use crate::oracle::{CollectorHandle, ExchangeHealth};
use crate::types::{AssetId, Exchange, NodeId, RoundId};

const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Envelope for every response
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaderResponse {
    pub round_id: RoundId,
    pub leader: Option<NodeId>,
    pub attempt: u32,
    pub is_self: bool,
    pub schedule: Vec<NodeId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub node_id: NodeId,
    pub tag: String,
    pub healthy_exchanges: usize,
    pub unhealthy_exchanges: usize,
    pub assets: BTreeMap<AssetId, BTreeMap<Exchange, ExchangeHealth>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestartResponse {
    pub restarted_round: RoundId,
}

/// Shared handler state
#[derive(Clone)]
pub struct ApiState {
    pub tag: String,
    pub status: watch::Receiver<NodeStatus>,
    pub control: mpsc::Sender<ControlCommand>,
    pub collectors: Arc<Vec<CollectorHandle>>,
}

/// Create the API router with all endpoints
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/round", get(get_round))
        .route("/api/leader", get(get_leader))
        .route("/api/last-commit", get(get_last_commit))
        .route("/api/health", get(get_health))
        .route("/api/round/restart", post(restart_round))
        .route("/api/metrics", get(get_metrics))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// GET /api/status - Full consensus status
async fn get_status(State(state): State<ApiState>) -> impl IntoResponse {
    let status = state.status.borrow().clone();
    Json(ApiResponse::success(status))
}

/// GET /api/round - Live round, if any
async fn get_round(State(state): State<ApiState>) -> impl IntoResponse {
    let round: Option<RoundView> = state.status.borrow().round.clone();
    match round {
        Some(round) => Json(ApiResponse::success(round)),
        None => Json(ApiResponse::error("no round started yet")),
    }
}

/// GET /api/leader - Acting leader of the live round
async fn get_leader(State(state): State<ApiState>) -> impl IntoResponse {
    let status = state.status.borrow().clone();
    match status.round {
        Some(round) => Json(ApiResponse::success(LeaderResponse {
            round_id: round.round_id,
            is_self: round.leader == Some(status.node_id),
            leader: round.leader,
            attempt: round.attempt,
            schedule: round.schedule,
        })),
        None => Json(ApiResponse::error("no round started yet")),
    }
}

/// GET /api/last-commit - Most recent committed round
async fn get_last_commit(State(state): State<ApiState>) -> impl IntoResponse {
    let last: Option<RoundSummary> = state.status.borrow().last_commit.clone();
    match last {
        Some(summary) => Json(ApiResponse::success(summary)),
        None => Json(ApiResponse::error("no round committed yet")),
    }
}

/// GET /api/health - Exchange health per asset
async fn get_health(State(state): State<ApiState>) -> impl IntoResponse {
    let mut assets = BTreeMap::new();
    for collector in state.collectors.iter() {
        if let Some(health) = collector.health().await {
            assets.insert(collector.asset_id.clone(), health);
        }
    }
    let (healthy, unhealthy) = assets
        .values()
        .flat_map(|per_exchange| per_exchange.values())
        .fold((0, 0), |(ok, bad), h| {
            if h.healthy {
                (ok + 1, bad)
            } else {
                (ok, bad + 1)
            }
        });
    let node_id = state.status.borrow().node_id;
    Json(ApiResponse::success(HealthResponse {
        node_id,
        tag: state.tag.clone(),
        healthy_exchanges: healthy,
        unhealthy_exchanges: unhealthy,
        assets,
    }))
}

/// GET /api/metrics - Cumulative counters
async fn get_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let metrics: NodeMetrics = state.status.borrow().metrics.clone();
    Json(ApiResponse::success(metrics))
}

/// GET /metrics - Same counters for Prometheus scrapers
async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let body = state.status.borrow().metrics.to_prometheus();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

/// POST /api/round/restart - Fail the live round and start a new one
async fn restart_round(State(state): State<ApiState>) -> impl IntoResponse {
    let (reply, rx) = oneshot::channel();
    if state
        .control
        .send(ControlCommand::RestartRound { reply })
        .await
        .is_err()
    {
        return Json(ApiResponse::<RestartResponse>::error("round driver is not running"));
    }
    match tokio::time::timeout(CONTROL_TIMEOUT, rx).await {
        Ok(Ok(Ok(round_id))) => Json(ApiResponse::success(RestartResponse {
            restarted_round: round_id,
        })),
        Ok(Ok(Err(e))) => Json(ApiResponse::error(e.to_string())),
        Ok(Err(_)) => Json(ApiResponse::error("round driver dropped the request")),
        Err(_) => Json(ApiResponse::error("round driver did not answer in time")),
    }
}

/// Serve the API until shutdown
pub async fn start_server(
    state: ApiState,
    listen_addr: &str,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!("🖥️ Status API listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{ConsensusEngine, ConsensusError};
    use crate::ledger::StakeEntry;
    use crate::stake::StakeSnapshot;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use tower::ServiceExt;

    fn status_with_round() -> NodeStatus {
        let node = NodeId::from_low_u64_be(1);
        let stake = StakeSnapshot::from_entries(&[StakeEntry { node_id: node, stake: 5 }], 1);
        let mut engine = ConsensusEngine::new(node, 2);
        engine.begin_round(12, stake).unwrap();
        engine.status()
    }

    fn state(status: NodeStatus) -> (ApiState, mpsc::Receiver<ControlCommand>) {
        let (_status_tx, status_rx) = watch::channel(status);
        let (control_tx, control_rx) = mpsc::channel(4);
        (
            ApiState {
                tag: "test".to_string(),
                status: status_rx,
                control: control_tx,
                collectors: Arc::new(Vec::new()),
            },
            control_rx,
        )
    }

    async fn call(router: Router, method: Method, uri: &str) -> serde_json::Value {
        let response = router
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn leader_endpoint_reports_live_round() {
        let (state, _control) = state(status_with_round());
        let json = call(create_router(state), Method::GET, "/api/leader").await;
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["round_id"], 12);
        assert_eq!(json["data"]["is_self"], true);
        assert_eq!(json["data"]["attempt"], 0);
    }

    #[tokio::test]
    async fn last_commit_empty_before_first_commit() {
        let (state, _control) = state(NodeStatus::starting(NodeId::from_low_u64_be(1)));
        let json = call(create_router(state), Method::GET, "/api/last-commit").await;
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().contains("no round committed"));
    }

    #[tokio::test]
    async fn restart_forwards_to_driver() {
        let (state, mut control) = state(status_with_round());
        tokio::spawn(async move {
            if let Some(ControlCommand::RestartRound { reply }) = control.recv().await {
                let _ = reply.send(Ok(12));
            }
        });
        let json = call(create_router(state), Method::POST, "/api/round/restart").await;
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["restarted_round"], 12);
    }

    #[tokio::test]
    async fn restart_reports_engine_refusal() {
        let (state, mut control) = state(status_with_round());
        tokio::spawn(async move {
            if let Some(ControlCommand::RestartRound { reply }) = control.recv().await {
                let _ = reply.send(Err(ConsensusError::NoLiveRound));
            }
        });
        let json = call(create_router(state), Method::POST, "/api/round/restart").await;
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "no live round");
    }

    #[tokio::test]
    async fn metrics_endpoint_reports_counters() {
        let mut status = status_with_round();
        status.metrics.batches_built = 3;
        status.metrics.uptime_secs = 42;
        let (state, _control) = state(status);
        let json = call(create_router(state), Method::GET, "/api/metrics").await;
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["rounds_started"], 1);
        assert_eq!(json["data"]["rounds_committed"], 0);
        assert_eq!(json["data"]["batches_built"], 3);
        assert_eq!(json["data"]["uptime_secs"], 42);
    }

    #[tokio::test]
    async fn prometheus_endpoint_serves_text() {
        let (state, _control) = state(status_with_round());
        let response = create_router(state)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("oracle_rounds_started_total 1\n"));
    }

    #[tokio::test]
    async fn health_with_no_collectors() {
        let (state, _control) = state(NodeStatus::starting(NodeId::from_low_u64_be(1)));
        let json = call(create_router(state), Method::GET, "/api/health").await;
        assert_eq!(json["data"]["healthy_exchanges"], 0);
        assert_eq!(json["data"]["tag"], "test");
    }
}
