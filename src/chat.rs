//! Proxy client for the conversational agent's streaming endpoint.

use std::pin::Pin;
use std::time::Duration;

use axum::body::Bytes;
use futures::Stream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::config::AppConfig;
use crate::stream::translate_stream;

/// Cookie carrying the agent's conversation id.
pub const SESSION_COOKIE: &str = "chat_session_id";

/// User id forwarded when the caller does not identify one.
pub const DEFAULT_CHAT_USER: &str = "default_user";

/// Translated event stream handed back to the caller.
pub type ChatEventStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Inbound chat transcript.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub parts: Option<Vec<ChatPart>>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ChatPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl ChatMessage {
    /// Concatenated text parts, falling back to `content`.
    pub fn text(&self) -> String {
        let from_parts: String = self
            .parts
            .iter()
            .flatten()
            .filter(|part| part.kind == "text")
            .filter_map(|part| part.text.as_deref())
            .collect();

        if from_parts.is_empty() {
            self.content.clone().unwrap_or_default()
        } else {
            from_parts
        }
    }
}

impl ChatRequest {
    /// Text of the final message when it came from the user.
    pub fn last_user_text(&self) -> Result<String, ChatError> {
        let last = self
            .messages
            .last()
            .filter(|m| m.role == "user")
            .ok_or(ChatError::NoUserMessage)?;

        let text = last.text();
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        Ok(text)
    }
}

/// Body forwarded to the agent.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AgentChatRequest {
    pub message: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("No user message found")]
    NoUserMessage,

    #[error("Empty message")]
    EmptyMessage,

    #[error("failed to build chat HTTP client: {0}")]
    Client(String),

    #[error("agent request failed: {0}")]
    Network(String),

    #[error("Trackable API error: {status}")]
    Upstream { status: u16, body: String },
}

#[derive(Debug, Clone)]
pub struct ChatProxy {
    http_client: Client,
    base_url: String,
}

impl ChatProxy {
    pub fn from_config(config: &AppConfig) -> Result<Self, ChatError> {
        Self::new(
            config.ingestion_api_url.clone(),
            Duration::from_secs(config.provider_timeout_seconds),
        )
    }

    /// `timeout` bounds connecting and each read; a long reply may stream past it.
    pub fn new(base_url: String, timeout: Duration) -> Result<Self, ChatError> {
        let http_client = Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .map_err(|e| ChatError::Client(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Open the agent stream and translate it frame by frame.
    pub async fn open(&self, request: &AgentChatRequest) -> Result<ChatEventStream, ChatError> {
        let url = format!("{}/api/chat/stream", self.base_url);
        tracing::debug!(url = %url, has_session = request.session_id.is_some(), "Calling chat agent");

        let response = self
            .http_client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| ChatError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = status.as_u16(), body = %body, "Chat agent rejected request");
            return Err(ChatError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        Ok(translate_stream(response.bytes_stream()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(value: serde_json::Value) -> ChatRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn last_user_text_prefers_parts() {
        let req = request(json!({
            "messages": [
                { "role": "assistant", "content": "hi" },
                { "role": "user", "content": "ignored", "parts": [
                    { "type": "text", "text": "where is " },
                    { "type": "image", "url": "x" },
                    { "type": "text", "text": "my order?" }
                ]}
            ]
        }));
        assert_eq!(req.last_user_text().unwrap(), "where is my order?");
    }

    #[test]
    fn last_user_text_falls_back_to_content() {
        let req = request(json!({ "messages": [{ "role": "user", "content": "hello" }] }));
        assert_eq!(req.last_user_text().unwrap(), "hello");
    }

    #[test]
    fn last_message_must_be_from_user_and_non_empty() {
        let req = request(json!({ "messages": [{ "role": "assistant", "content": "hello" }] }));
        assert!(matches!(req.last_user_text(), Err(ChatError::NoUserMessage)));

        let req = request(json!({ "messages": [{ "role": "user", "content": "   " }] }));
        assert!(matches!(req.last_user_text(), Err(ChatError::EmptyMessage)));

        assert!(matches!(
            ChatRequest::default().last_user_text(),
            Err(ChatError::NoUserMessage)
        ));
    }

    #[tokio::test]
    async fn open_translates_agent_stream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat/stream"))
            .and(body_json(json!({ "message": "hi", "user_id": "u1", "session_id": "s1" })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "data: {\"choices\":[{\"delta\":{\"content\":\"yo\"},\"finish_reason\":\"stop\"}]}\n\ndata: [DONE]\n\n",
                "text/event-stream",
            ))
            .mount(&server)
            .await;

        let proxy = ChatProxy::new(server.uri(), Duration::from_secs(5)).unwrap();
        let stream = proxy
            .open(&AgentChatRequest {
                message: "hi".to_string(),
                user_id: "u1".to_string(),
                session_id: Some("s1".to_string()),
            })
            .await
            .unwrap();

        let body: Vec<u8> = stream
            .map(|chunk| chunk.unwrap().to_vec())
            .concat()
            .await;
        let body = String::from_utf8(body).unwrap();
        assert!(body.starts_with("data: {\"type\":\"start\"}\n\n"));
        assert!(body.contains("\"type\":\"text-delta\",\"id\":\"text-0\",\"delta\":\"yo\""));
        assert_eq!(body.matches("\"type\":\"finish\"").count(), 1);
    }

    #[tokio::test]
    async fn slow_reply_streams_past_the_read_timeout() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 8192];
            let _ = socket.read(&mut request).await.unwrap();
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n",
                )
                .await
                .unwrap();
            for word in ["one", "two", "three", "four"] {
                tokio::time::sleep(Duration::from_millis(150)).await;
                let frame = format!(
                    "data: {{\"choices\":[{{\"delta\":{{\"content\":\"{} \"}}}}]}}\n\n",
                    word
                );
                let chunk = format!("{:x}\r\n{}\r\n", frame.len(), frame);
                socket.write_all(chunk.as_bytes()).await.unwrap();
            }
            socket.write_all(b"0\r\n\r\n").await.unwrap();
        });

        let proxy = ChatProxy::new(format!("http://{}", addr), Duration::from_millis(400)).unwrap();
        let stream = proxy
            .open(&AgentChatRequest {
                message: "hi".to_string(),
                user_id: "u1".to_string(),
                session_id: None,
            })
            .await
            .unwrap();

        let body: Vec<u8> = stream
            .map(|chunk| chunk.unwrap().to_vec())
            .concat()
            .await;
        let body = String::from_utf8(body).unwrap();
        assert_eq!(body.matches("\"type\":\"text-delta\"").count(), 4);
        assert!(body.contains("\"delta\":\"four \""));
        assert_eq!(body.matches("\"type\":\"finish\"").count(), 1);
    }

    #[tokio::test]
    async fn upstream_failure_is_reported_with_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat/stream"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let proxy = ChatProxy::new(server.uri(), Duration::from_secs(5)).unwrap();
        let result = proxy
            .open(&AgentChatRequest {
                message: "hi".to_string(),
                user_id: DEFAULT_CHAT_USER.to_string(),
                session_id: None,
            })
            .await;

        match result {
            Err(err @ ChatError::Upstream { status: 502, .. }) => {
                assert_eq!(err.to_string(), "Trackable API error: 502");
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }
}
