//! # Chat Proxy Handlers
//!
//! Forwards the latest user message to the agent and streams its reply back in
//! the UI data-stream protocol.

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use serde_json::json;
use utoipa::ToSchema;

use crate::auth::USER_ID_HEADER;
use crate::chat::{AgentChatRequest, ChatError, ChatRequest, DEFAULT_CHAT_USER, SESSION_COOKIE};
use crate::server::AppState;

#[derive(Debug, Serialize, ToSchema)]
pub struct ChatHealth {
    pub status: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ChatErrorBody {
    pub error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ChatErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

/// Value of the session cookie, if the caller sent one.
pub fn session_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Chat proxy health check
#[utoipa::path(
    get,
    path = "/agent/chat",
    responses((status = 200, description = "Proxy is up", body = ChatHealth)),
    tag = "chat"
)]
pub async fn chat_health() -> Json<ChatHealth> {
    Json(ChatHealth {
        status: "ok".to_string(),
    })
}

/// Stream an agent reply for the last user message
#[utoipa::path(
    post,
    path = "/agent/chat",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Event stream", content_type = "text/event-stream", body = String),
        (status = 400, description = "No usable user message", body = ChatErrorBody),
        (status = 500, description = "Proxy failure", body = ChatErrorBody)
    ),
    tag = "chat"
)]
pub async fn chat(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let request: ChatRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err.to_string()),
    };

    let message = match request.last_user_text() {
        Ok(message) => message,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err.to_string()),
    };

    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_CHAT_USER)
        .to_string();

    let forward = AgentChatRequest {
        message,
        user_id,
        session_id: session_id_from_headers(&headers),
    };

    match state.chat.open(&forward).await {
        Ok(stream) => (
            [
                (header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream")),
                (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
                (header::CONNECTION, HeaderValue::from_static("keep-alive")),
            ],
            Body::from_stream(stream),
        )
            .into_response(),
        Err(err @ ChatError::Upstream { status, .. }) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            error_response(status, err.to_string())
        }
        Err(err) => {
            tracing::error!(error = %err, "Chat proxy failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

/// Forget the agent conversation
#[utoipa::path(
    delete,
    path = "/agent/chat",
    responses((status = 200, description = "Session cookie cleared")),
    tag = "chat"
)]
pub async fn clear_session() -> Response {
    let cookie = format!("{}=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax", SESSION_COOKIE);
    let mut response = Json(json!({ "message": "Session cleared" })).into_response();
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_cookie_is_found_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; chat_session_id=abc123 ; other=1"),
        );
        assert_eq!(session_id_from_headers(&headers).as_deref(), Some("abc123"));
    }

    #[test]
    fn missing_or_empty_session_cookie_is_none() {
        let mut headers = HeaderMap::new();
        assert!(session_id_from_headers(&headers).is_none());

        headers.insert(header::COOKIE, HeaderValue::from_static("chat_session_id="));
        assert!(session_id_from_headers(&headers).is_none());
    }
}
