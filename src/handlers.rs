//! HTTP + WebSocket surface (spec.md §6).
//!
//! Route table shape follows `handlers.rs`'s `routes<A>() -> Router<A>`
//! convention, `#[instrument(skip_all)]` per handler, errors converted via
//! `IntoResponse`; the JSON-RPC subscribe/unsubscribe surface over a
//! WebSocket is new, added for the push-notification channel (spec.md §6).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::instrument;

use crate::events::EventDispatcher;
use crate::lifecycle::{LifecycleError, LifecycleManager};
use crate::request::{RequestDetails, RequestType, WrapOperation};

#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<LifecycleManager>,
    pub events: Arc<EventDispatcher>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/private/approve-token", post(approve_token))
        .route("/private/withdraw", post(withdraw))
        .route("/private/insert-order", post(insert_order))
        .route("/private/wrap-unwrap-token", post(wrap_unwrap_token))
        .route("/private/amend-request", post(amend_request))
        .route("/private/cancel-request", delete(cancel_request))
        .route("/private/cancel-all", delete(cancel_all))
        .route("/public/get-all-open-requests", get(get_all_open_requests))
        .route("/public/get-request-status", get(get_request_status))
        .route("/public/status", get(get_status))
        .route("/ws", get(ws_upgrade))
}

fn parse_gas_price(raw: &str) -> Result<u128, LifecycleError> {
    raw.parse()
        .map_err(|_| LifecycleError::Internal(format!("gas_price_wei is not an integer: {raw}")))
}

#[derive(Debug, Deserialize)]
pub struct ApproveBody {
    pub client_request_id: String,
    pub symbol: String,
    pub amount: String,
    pub gas_price_wei: String,
}

#[instrument(skip_all, err)]
pub async fn approve_token(State(state): State<AppState>, Json(body): Json<ApproveBody>) -> Result<Response, LifecycleError> {
    let gas_price_wei = parse_gas_price(&body.gas_price_wei)?;
    let result = state
        .lifecycle
        .approve(&body.client_request_id, &body.symbol, &body.amount, gas_price_wei)
        .await?;
    Ok((StatusCode::OK, Json(json!({"tx_hash": result.tx_hash}))).into_response())
}

#[derive(Debug, Deserialize)]
pub struct WithdrawBody {
    pub client_request_id: String,
    pub symbol: String,
    pub amount: String,
    pub address_to: String,
    pub gas_price_wei: String,
}

#[instrument(skip_all, err)]
pub async fn withdraw(State(state): State<AppState>, Json(body): Json<WithdrawBody>) -> Result<Response, LifecycleError> {
    let gas_price_wei = parse_gas_price(&body.gas_price_wei)?;
    let result = state
        .lifecycle
        .transfer(
            &body.client_request_id,
            &body.symbol,
            &body.amount,
            &body.address_to,
            "/private/withdraw",
            gas_price_wei,
        )
        .await?;
    Ok((StatusCode::OK, Json(json!({"tx_hash": result.tx_hash}))).into_response())
}

#[derive(Debug, Deserialize)]
pub struct InsertOrderBody {
    pub client_request_id: String,
    pub gas_price_wei: String,
    #[serde(flatten)]
    pub details: RequestDetails,
}

#[instrument(skip_all, err)]
pub async fn insert_order(State(state): State<AppState>, Json(body): Json<InsertOrderBody>) -> Result<Response, LifecycleError> {
    let gas_price_wei = parse_gas_price(&body.gas_price_wei)?;
    let result = state
        .lifecycle
        .insert_order(&body.client_request_id, body.details, gas_price_wei)
        .await?;
    Ok((
        StatusCode::OK,
        Json(json!({"result": {"tx_hash": result.tx_hash, "nonce": result.nonce}})),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct WrapUnwrapBody {
    pub client_request_id: String,
    pub symbol: String,
    pub amount: String,
    pub operation: WrapOperation,
    pub gas_price_wei: String,
}

#[instrument(skip_all, err)]
pub async fn wrap_unwrap_token(State(state): State<AppState>, Json(body): Json<WrapUnwrapBody>) -> Result<Response, LifecycleError> {
    let gas_price_wei = parse_gas_price(&body.gas_price_wei)?;
    let result = state
        .lifecycle
        .wrap_unwrap(&body.client_request_id, &body.symbol, &body.amount, body.operation, gas_price_wei)
        .await?;
    Ok((StatusCode::OK, Json(json!({"tx_hash": result.tx_hash}))).into_response())
}

#[derive(Debug, Deserialize)]
pub struct AmendRequestBody {
    pub client_request_id: String,
    pub gas_price_wei: String,
    #[serde(flatten)]
    pub details: RequestDetails,
}

#[instrument(skip_all, err)]
pub async fn amend_request(State(state): State<AppState>, Json(body): Json<AmendRequestBody>) -> Result<Response, LifecycleError> {
    let gas_price_wei = parse_gas_price(&body.gas_price_wei)?;
    let result = state
        .lifecycle
        .amend_request(&body.client_request_id, body.details, gas_price_wei)
        .await?;
    Ok((StatusCode::OK, Json(json!({"result": {"tx_hash": result.tx_hash}}))).into_response())
}

#[derive(Debug, Deserialize)]
pub struct CancelRequestBody {
    pub client_request_id: String,
    pub gas_price_wei: Option<String>,
}

#[instrument(skip_all, err)]
pub async fn cancel_request(State(state): State<AppState>, Json(body): Json<CancelRequestBody>) -> Result<Response, LifecycleError> {
    let gas_price_wei = body.gas_price_wei.as_deref().map(parse_gas_price).transpose()?;
    let result = state.lifecycle.cancel_request(&body.client_request_id, gas_price_wei).await?;
    Ok((StatusCode::OK, Json(json!({"result": {"tx_hash": result.tx_hash}}))).into_response())
}

#[derive(Debug, Deserialize)]
pub struct CancelAllBody {
    pub request_type: Option<RequestType>,
}

#[instrument(skip_all)]
pub async fn cancel_all(State(state): State<AppState>, Json(body): Json<CancelAllBody>) -> impl IntoResponse {
    let result = state.lifecycle.cancel_all(body.request_type).await;
    let status = if result.failed_cancels.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(result)).into_response()
}

#[derive(Debug, Deserialize)]
pub struct RequestTypeQuery {
    pub request_type: Option<RequestType>,
}

#[instrument(skip_all)]
pub async fn get_all_open_requests(State(state): State<AppState>, Query(query): Query<RequestTypeQuery>) -> impl IntoResponse {
    Json(state.lifecycle.get_all_open_requests(query.request_type))
}

#[derive(Debug, Deserialize)]
pub struct ClientRequestIdQuery {
    pub client_request_id: String,
}

#[instrument(skip_all)]
pub async fn get_request_status(State(state): State<AppState>, Query(query): Query<ClientRequestIdQuery>) -> Response {
    match state.lifecycle.get_request_status(&query.client_request_id) {
        Some(value) => (StatusCode::OK, Json(value)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": {"message": format!("client_request_id={} not found", query.client_request_id)}})),
        )
            .into_response(),
    }
}

#[instrument(skip_all)]
pub async fn get_status() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

impl IntoResponse for LifecycleError {
    fn into_response(self) -> Response {
        let status = match &self {
            LifecycleError::NotFound(_) => StatusCode::NOT_FOUND,
            LifecycleError::CancelWindowClosed(_) => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::BAD_REQUEST,
        };
        (status, Json(json!({"error": {"message": self.to_string()}}))).into_response()
    }
}

/// JSON-RPC 2.0 request envelope for the `subscribe`/`unsubscribe` methods
/// (spec.md §6 WebSocket surface).
#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    id: serde_json::Value,
    method: String,
    params: RpcParams,
}

#[derive(Debug, Deserialize)]
struct RpcParams {
    channel: String,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<serde_json::Value>,
}

impl RpcResponse {
    fn ok(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: serde_json::Value, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(json!({"message": message.into()})),
        }
    }
}

#[instrument(skip_all)]
pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One client connection: a writer task drains an mpsc queue to the socket
/// sink while the read loop below both handles subscribe/unsubscribe
/// commands and feeds the same queue with per-channel broadcast forwarders,
/// so outgoing notifications never block processing further client frames.
async fn handle_socket(socket: WebSocket, state: AppState) {
    use futures_util::{SinkExt, StreamExt};

    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut subscriptions: std::collections::HashMap<String, tokio::task::JoinHandle<()>> = std::collections::HashMap::new();

    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else { continue };
        let request: RpcRequest = match serde_json::from_str(&text) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(error = %err, "malformed JSON-RPC frame, ignoring");
                continue;
            }
        };

        match request.method.as_str() {
            "subscribe" => {
                let channel = request.params.channel.clone();
                if !crate::events::CHANNELS.contains(&channel.as_str()) {
                    let response = RpcResponse::err(request.id, format!("channel {channel} does not exist"));
                    if send_response(&outbound_tx, &response).is_err() {
                        break;
                    }
                    continue;
                }
                let mut receiver = state.events.subscribe(&channel);
                let forward_tx = outbound_tx.clone();
                subscriptions.entry(channel).or_insert_with(|| {
                    tokio::spawn(async move {
                        while let Ok(notification) = receiver.recv().await {
                            let Ok(payload) = serde_json::to_string(&notification) else { continue };
                            if forward_tx.send(Message::Text(payload.into())).is_err() {
                                break;
                            }
                        }
                    })
                });
                let response = RpcResponse::ok(request.id, json!({"subscribed": request.params.channel}));
                if send_response(&outbound_tx, &response).is_err() {
                    break;
                }
            }
            "unsubscribe" => {
                if let Some(handle) = subscriptions.remove(&request.params.channel) {
                    handle.abort();
                }
                let response = RpcResponse::ok(request.id, json!({"unsubscribed": request.params.channel}));
                if send_response(&outbound_tx, &response).is_err() {
                    break;
                }
            }
            other => {
                tracing::warn!(method = other, "unknown JSON-RPC method");
            }
        }
    }

    for (_, handle) in subscriptions {
        handle.abort();
    }
    drop(outbound_tx);
    let _ = writer.await;
}

fn send_response(tx: &tokio::sync::mpsc::UnboundedSender<Message>, response: &RpcResponse) -> Result<(), ()> {
    let payload = serde_json::to_string(response).map_err(|_| ())?;
    tx.send(Message::Text(payload.into())).map_err(|_| ())
}
