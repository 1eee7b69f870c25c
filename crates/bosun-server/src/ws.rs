use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::stream::MultiplexerRegistry;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Per-connection stream id; a random one is assigned when absent.
    pub id: Option<String>,
    #[serde(rename = "runID")]
    pub run_id: Option<String>,
}

pub fn router(registry: Arc<MultiplexerRegistry>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(registry)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(registry): State<Arc<MultiplexerRegistry>>,
    Query(query): Query<WsQuery>,
) -> axum::response::Response {
    let Some(run_id) = query.run_id.filter(|id| !id.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "runID query parameter is required").into_response();
    };

    let stream_id = query
        .id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

    info!(
        target: "bosun::ws",
        run_id = %run_id,
        stream_id = %stream_id,
        "Handling websocket request"
    );

    ws.on_upgrade(move |socket| async move {
        if let Err(err) = registry.attach(&run_id, &stream_id, socket).await {
            warn!(target: "bosun::ws", "Could not attach socket: {err}");
        }
    })
}
