use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};

use crate::domain::model::{ChatMessage, MessageType};
use crate::domain::tool::ToolDefinition;
use crate::runtime::{
    ChatError, Runtime, ToolRegistry, ToolRequest, ToolResponse, TripError, TripSnapshot,
};

#[derive(Clone)]
pub struct HttpState {
    runtime: Arc<Runtime>,
}

#[derive(serde::Deserialize)]
pub struct InvokeToolRequest {
    #[serde(default)]
    pub arguments: Value,
    #[serde(default, rename = "callId")]
    pub call_id: Option<String>,
}

#[derive(serde::Deserialize)]
pub struct SendChatRequest {
    pub message: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub metadata: Option<Value>,
}

pub fn router(runtime: Arc<Runtime>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/tools", get(list_tools))
        .route("/tools/:name", post(invoke_tool))
        .route("/trip", get(current_trip))
        .route("/chat", get(chat_history).post(send_chat))
        .layer(
            CorsLayer::new()
                .allow_methods(Any)
                .allow_headers(Any)
                .allow_origin(Any),
        )
        .with_state(HttpState { runtime })
}

pub async fn start_server(runtime: Arc<Runtime>, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = router(runtime);
    tracing::info!(%addr, "http transport listening");
    axum::serve(
        tokio::net::TcpListener::bind(addr).await?,
        app.into_make_service(),
    )
    .await?;

    Ok(())
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn list_tools() -> Json<Vec<ToolDefinition>> {
    Json(ToolRegistry::definitions())
}

/// Tool failures are part of the response body, not the status code.
async fn invoke_tool(
    State(state): State<HttpState>,
    Path(name): Path<String>,
    Json(payload): Json<InvokeToolRequest>,
) -> Json<ToolResponse> {
    let request = ToolRequest {
        name,
        arguments: payload.arguments,
        call_id: payload.call_id,
    };
    Json(state.runtime.tools().dispatch(request).await)
}

async fn current_trip(State(state): State<HttpState>) -> Result<Json<TripSnapshot>, AppError> {
    Ok(Json(state.runtime.trips().snapshot().await?))
}

async fn chat_history(State(state): State<HttpState>) -> Result<Json<Vec<ChatMessage>>, AppError> {
    Ok(Json(state.runtime.chat().messages().await?))
}

async fn send_chat(
    State(state): State<HttpState>,
    Json(payload): Json<SendChatRequest>,
) -> Result<(StatusCode, Json<ChatMessage>), AppError> {
    let message = state
        .runtime
        .chat()
        .send_message(&payload.message, payload.message_type, payload.metadata)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Trip(#[from] TripError),
    #[error(transparent)]
    Chat(#[from] ChatError),
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::Chat(ChatError::NoLobby) => StatusCode::CONFLICT,
            AppError::Chat(ChatError::BlankMessage) => StatusCode::BAD_REQUEST,
            AppError::Chat(ChatError::Remote(_)) | AppError::Trip(TripError::Remote(_)) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({
            "error": self.to_string(),
        }));
        (status, body).into_response()
    }
}
