//! Gmail REST client
//!
//! Implements [`MailboxProvider`] against the Gmail v1 API. Token refresh is
//! performed proactively when the stored expiry has passed, and once reactively
//! when the API answers 401; either way the new token is returned to the caller
//! through [`Refreshed`].

use std::time::Duration;

use async_trait::async_trait;
use base64::{
    Engine as _, alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;

use super::{
    ChangeLog, MailMessage, MailboxCredential, MailboxProvider, ProviderError, RawMessage,
    RefreshResult, Refreshed, WatchRegistration,
};
use crate::config::AppConfig;

/// Upper bound on `history.list` pages followed per call.
const MAX_HISTORY_PAGES: usize = 20;

/// Deepest MIME nesting kept when converting API payloads.
const MAX_PART_DEPTH: usize = 64;

/// Gmail emits unpadded base64url, but some clients pad; accept both.
const GMAIL_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decode a Gmail body `data` field.
pub fn decode_body_data(data: &str) -> Option<Vec<u8>> {
    let trimmed = data.trim();
    GMAIL_BASE64
        .decode(trimmed)
        .or_else(|_| STANDARD_LENIENT.decode(trimmed))
        .ok()
}

/// Google OAuth token response
#[derive(Debug, Deserialize)]
struct GoogleTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessageResponse {
    id: String,
    #[serde(default)]
    snippet: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    history_id: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    internal_date: Option<String>,
    #[serde(default)]
    payload: Option<GmailPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailPart {
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    headers: Vec<GmailHeader>,
    #[serde(default)]
    body: Option<GmailPartBody>,
    #[serde(default)]
    parts: Vec<GmailPart>,
}

#[derive(Debug, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct GmailPartBody {
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryResponse {
    #[serde(default)]
    history: Vec<HistoryRecord>,
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    history_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord {
    #[serde(default, deserialize_with = "string_or_number")]
    id: Option<String>,
    #[serde(default)]
    messages_added: Vec<HistoryMessageAdded>,
}

#[derive(Debug, Deserialize)]
struct HistoryMessageAdded {
    message: MessageRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchResponse {
    #[serde(default, deserialize_with = "string_or_number")]
    history_id: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    expiration: Option<String>,
}

/// Accept a JSON string or number and keep it as a string.
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Numeric comparison of Gmail history ids.
fn history_id_is_newer(candidate: &str, current: &str) -> bool {
    match (candidate.parse::<u128>(), current.parse::<u128>()) {
        (Ok(candidate), Ok(current)) => candidate > current,
        _ => false,
    }
}

fn epoch_millis(value: &str) -> Option<DateTime<Utc>> {
    value
        .parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn into_raw(part: GmailPart, depth: usize) -> RawMessage {
    let body_data = part
        .body
        .and_then(|body| body.data)
        .filter(|data| !data.is_empty())
        .and_then(|data| {
            let decoded = decode_body_data(&data);
            if decoded.is_none() {
                tracing::debug!("Skipping MIME part with undecodable body data");
            }
            decoded
        });

    let children = if depth >= MAX_PART_DEPTH {
        Vec::new()
    } else {
        part.parts
            .into_iter()
            .map(|child| into_raw(child, depth + 1))
            .collect()
    };

    RawMessage {
        content_type: part.mime_type.filter(|ct| !ct.is_empty()),
        body_data,
        children,
    }
}

/// Gmail API client
pub struct GmailClient {
    http_client: Client,
    client_id: String,
    client_secret: String,
    /// `.../gmail/v1/users` (overridable for tests)
    api_base: String,
    token_url: String,
    revoke_url: String,
}

impl GmailClient {
    /// Build a client from application configuration.
    pub fn from_config(config: &AppConfig) -> Result<Self, ProviderError> {
        Self::new(
            config.gmail_client_id.clone().unwrap_or_default(),
            config.gmail_client_secret.clone().unwrap_or_default(),
            config.gmail_api_base.clone(),
            config.google_token_url.clone(),
            config.google_revoke_url.clone(),
            Duration::from_secs(config.provider_timeout_seconds),
        )
    }

    pub fn new(
        client_id: String,
        client_secret: String,
        api_base: String,
        token_url: String,
        revoke_url: String,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let http_client = Client::builder().timeout(timeout).build().map_err(|e| {
            ProviderError::Configuration(format!("Failed to create HTTP client: {}", e))
        })?;

        Ok(Self {
            http_client,
            client_id,
            client_secret,
            api_base: api_base.trim_end_matches('/').to_string(),
            token_url,
            revoke_url,
        })
    }

    /// Exchange a refresh token for a new access token.
    async fn refresh_access_token(
        &self,
        credential: &MailboxCredential,
    ) -> Result<RefreshResult, ProviderError> {
        let refresh_token = credential.refresh_token.as_deref().ok_or_else(|| {
            ProviderError::Unauthorized("Access token expired and no refresh token".to_string())
        })?;

        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];

        let response = self
            .http_client
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| ProviderError::Network(format!("Token refresh request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(ProviderError::TokenRefresh(format!(
                "Token refresh failed with status {}: {}",
                response.status(),
                response.text().await.unwrap_or_default()
            )));
        }

        let token: GoogleTokenResponse = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse(format!("Failed to parse refresh response: {}", e))
        })?;

        tracing::debug!(expires_in = ?token.expires_in, "Refreshed Gmail access token");

        Ok(RefreshResult {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: token
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
        })
    }

    /// Send an authorized request, refreshing proactively or once after a 401.
    ///
    /// A failure after a successful refresh carries that refresh in
    /// [`ProviderError::AfterRefresh`].
    async fn send_authorized<F>(
        &self,
        credential: &MailboxCredential,
        build: F,
    ) -> Result<(Response, Option<RefreshResult>), ProviderError>
    where
        F: Fn(&str) -> RequestBuilder + Send + Sync,
    {
        let mut refresh = None;
        if credential.needs_refresh(Utc::now()) {
            refresh = Some(self.refresh_access_token(credential).await?);
        }

        let token = refresh
            .as_ref()
            .map_or(credential.access_token.as_str(), |r| r.access_token.as_str());
        let response = match build(token).send().await {
            Ok(response) => response,
            Err(e) => {
                return Err(
                    ProviderError::Network(format!("Gmail request failed: {}", e))
                        .after_refresh(refresh),
                );
            }
        };

        if response.status() == StatusCode::UNAUTHORIZED
            && refresh.is_none()
            && credential.refresh_token.is_some()
        {
            tracing::debug!("Gmail rejected access token, refreshing once");
            let renewed = self.refresh_access_token(credential).await?;
            let checked = match build(&renewed.access_token).send().await {
                Ok(response) => check_status(response).await,
                Err(e) => Err(ProviderError::Network(format!(
                    "Gmail request failed: {}",
                    e
                ))),
            };
            return match checked {
                Ok(response) => Ok((response, Some(renewed))),
                Err(err) => Err(err.after_refresh(Some(renewed))),
            };
        }

        match check_status(response).await {
            Ok(response) => Ok((response, refresh)),
            Err(err) => Err(err.after_refresh(refresh)),
        }
    }

    async fn get_json<T>(
        &self,
        credential: &MailboxCredential,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Refreshed<T>, ProviderError>
    where
        T: serde::de::DeserializeOwned,
    {
        let (response, refresh) = self
            .send_authorized(credential, |token| {
                self.http_client.get(url).bearer_auth(token).query(query)
            })
            .await?;

        match response.json::<T>().await {
            Ok(value) => Ok(Refreshed::new(value, refresh)),
            Err(e) => Err(ProviderError::InvalidResponse(format!(
                "Failed to parse Gmail response: {}",
                e
            ))
            .after_refresh(refresh)),
        }
    }
}

/// Map non-success statuses onto [`ProviderError`]. 404 is left as `Api` for callers to interpret.
async fn check_status(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok());

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ProviderError::RateLimited {
            retry_after_secs: retry_after.or(Some(60)),
        });
    }

    let body = response.text().await.unwrap_or_default();

    if status == StatusCode::FORBIDDEN {
        let body_lower = body.to_lowercase();
        let quota_error_patterns = [
            "userratelimitexceeded",
            "ratelimitexceeded",
            "quotaexceeded",
            "daily limit",
        ];
        if quota_error_patterns
            .iter()
            .any(|pattern| body_lower.contains(pattern))
        {
            return Err(ProviderError::RateLimited {
                retry_after_secs: retry_after.or(Some(60)),
            });
        }
    }

    if status == StatusCode::UNAUTHORIZED {
        return Err(ProviderError::Unauthorized(
            "Invalid or expired access token".to_string(),
        ));
    }

    Err(ProviderError::Api {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl MailboxProvider for GmailClient {
    async fn search(
        &self,
        credential: &MailboxCredential,
        query: &str,
        max_results: u32,
    ) -> Result<Refreshed<Vec<String>>, ProviderError> {
        let url = format!("{}/me/messages", self.api_base);
        let params = [
            ("q", query.to_string()),
            ("maxResults", max_results.to_string()),
        ];

        let listed: Refreshed<MessageListResponse> =
            self.get_json(credential, &url, &params).await?;

        Ok(Refreshed::new(
            listed.value.messages.into_iter().map(|m| m.id).collect(),
            listed.refresh,
        ))
    }

    async fn get_message(
        &self,
        credential: &MailboxCredential,
        message_id: &str,
    ) -> Result<Refreshed<MailMessage>, ProviderError> {
        let url = format!("{}/me/messages/{}", self.api_base, message_id);
        let fetched: Refreshed<GmailMessageResponse> = self
            .get_json(credential, &url, &[("format", "full".to_string())])
            .await?;

        let message = fetched.value;
        let (headers, payload) = match message.payload {
            Some(mut part) => {
                let headers = std::mem::take(&mut part.headers)
                    .into_iter()
                    .map(|h| (h.name, h.value))
                    .collect();
                (headers, into_raw(part, 0))
            }
            None => (Vec::new(), RawMessage::default()),
        };

        Ok(Refreshed::new(
            MailMessage {
                id: message.id,
                headers,
                internal_date: message.internal_date.as_deref().and_then(epoch_millis),
                snippet: message.snippet,
                payload,
            },
            fetched.refresh,
        ))
    }

    async fn message_cursor(
        &self,
        credential: &MailboxCredential,
        message_id: &str,
    ) -> Result<Refreshed<Option<String>>, ProviderError> {
        let url = format!("{}/me/messages/{}", self.api_base, message_id);
        let fetched: Refreshed<GmailMessageResponse> = self
            .get_json(credential, &url, &[("format", "minimal".to_string())])
            .await?;

        Ok(Refreshed::new(fetched.value.history_id, fetched.refresh))
    }

    async fn changes_since(
        &self,
        credential: &MailboxCredential,
        start_history_id: &str,
    ) -> Result<Refreshed<ChangeLog>, ProviderError> {
        let url = format!("{}/me/history", self.api_base);
        let mut working = credential.clone();
        let mut refresh: Option<RefreshResult> = None;
        let mut log = ChangeLog::default();
        let mut page_token: Option<String> = None;
        let mut head: Option<String> = None;
        let mut last_replayed: Option<String> = None;

        for _ in 0..MAX_HISTORY_PAGES {
            let mut params = vec![
                ("startHistoryId", start_history_id.to_string()),
                ("historyTypes", "messageAdded".to_string()),
            ];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }

            let fetched: Refreshed<HistoryResponse> =
                match self.get_json(&working, &url, &params).await {
                    Ok(fetched) => fetched,
                    Err(err) => {
                        let (err, page_refresh) = err.into_parts();
                        let err = match err {
                            ProviderError::Api { status: 404, .. } => ProviderError::CursorExpired,
                            other => other,
                        };
                        let refresh = match (refresh, page_refresh) {
                            (Some(earlier), Some(later)) => Some(earlier.superseded_by(later)),
                            (earlier, later) => later.or(earlier),
                        };
                        return Err(err.after_refresh(refresh));
                    }
                };

            let (response, page_refresh) = fetched.unpack(&mut working);
            if let Some(later) = page_refresh {
                refresh = Some(match refresh {
                    Some(earlier) => earlier.superseded_by(later),
                    None => later,
                });
            }

            for record in response.history {
                if let Some(id) = record.id {
                    if last_replayed
                        .as_deref()
                        .is_none_or(|current| history_id_is_newer(&id, current))
                    {
                        last_replayed = Some(id);
                    }
                }
                for added in record.messages_added {
                    if !log.message_ids.contains(&added.message.id) {
                        log.message_ids.push(added.message.id);
                    }
                }
            }
            if response.history_id.is_some() {
                head = response.history_id;
            }

            match response.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => {
                    page_token = None;
                    break;
                }
            }
        }

        log.history_id = match page_token {
            None => head,
            // The reported head lies beyond unread pages; resume from what was replayed.
            Some(_) => {
                tracing::warn!(
                    pages = MAX_HISTORY_PAGES,
                    resume_from = ?last_replayed,
                    "History replay hit page limit; remaining changes wait for the next sync"
                );
                last_replayed
            }
        };

        Ok(Refreshed::new(log, refresh))
    }

    async fn watch(
        &self,
        credential: &MailboxCredential,
        topic: &str,
    ) -> Result<Refreshed<WatchRegistration>, ProviderError> {
        let url = format!("{}/me/watch", self.api_base);
        let body = json!({
            "topicName": topic,
            "labelIds": ["INBOX"],
            "labelFilterBehavior": "include",
        });

        let (response, refresh) = self
            .send_authorized(credential, |token| {
                self.http_client.post(&url).bearer_auth(token).json(&body)
            })
            .await?;

        let watch: WatchResponse = match response.json().await {
            Ok(watch) => watch,
            Err(e) => {
                return Err(ProviderError::InvalidResponse(format!(
                    "Failed to parse watch response: {}",
                    e
                ))
                .after_refresh(refresh));
            }
        };

        let Some(expires_at) = watch.expiration.as_deref().and_then(epoch_millis) else {
            return Err(
                ProviderError::InvalidResponse("Watch response missing expiration".to_string())
                    .after_refresh(refresh),
            );
        };

        Ok(Refreshed::new(
            WatchRegistration {
                expires_at,
                history_id: watch.history_id,
            },
            refresh,
        ))
    }

    async fn stop_watch(
        &self,
        credential: &MailboxCredential,
    ) -> Result<Refreshed<()>, ProviderError> {
        let url = format!("{}/me/stop", self.api_base);
        let (_, refresh) = self
            .send_authorized(credential, |token| {
                self.http_client.post(&url).bearer_auth(token)
            })
            .await?;

        Ok(Refreshed::new((), refresh))
    }

    async fn revoke(&self, token: &str) -> Result<(), ProviderError> {
        let response = self
            .http_client
            .post(&self.revoke_url)
            .query(&[("token", token)])
            .send()
            .await
            .map_err(|e| ProviderError::Network(format!("Token revocation failed: {}", e)))?;

        check_status(response).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> GmailClient {
        GmailClient::new(
            "test-client-id".to_string(),
            "test-client-secret".to_string(),
            format!("{}/gmail/v1/users", server.uri()),
            format!("{}/token", server.uri()),
            format!("{}/revoke", server.uri()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn credential() -> MailboxCredential {
        MailboxCredential {
            access_token: "access-1".to_string(),
            refresh_token: Some("refresh-1".to_string()),
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
        }
    }

    #[test]
    fn decodes_padded_and_unpadded_base64url() {
        assert_eq!(decode_body_data("SGk_").unwrap(), b"Hi?");
        assert_eq!(decode_body_data("SGk").unwrap(), b"Hi");
        assert_eq!(decode_body_data("SGk=").unwrap(), b"Hi");
        assert!(decode_body_data("!!!").is_none());
    }

    #[tokio::test]
    async fn search_sends_query_and_cap() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages"))
            .and(query_param("q", "\"your order\""))
            .and(query_param("maxResults", "25"))
            .and(header("authorization", "Bearer access-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "messages": [{"id": "m1", "threadId": "t1"}, {"id": "m2", "threadId": "t2"}],
                "resultSizeEstimate": 2
            })))
            .expect(1)
            .mount(&server)
            .await;

        let result = client_for(&server)
            .search(&credential(), "\"your order\"", 25)
            .await
            .unwrap();

        assert_eq!(result.value, vec!["m1".to_string(), "m2".to_string()]);
        assert!(result.refresh.is_none());
    }

    #[tokio::test]
    async fn get_message_builds_mime_tree() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages/m1"))
            .and(query_param("format", "full"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "m1",
                "snippet": "Your order has shipped",
                "historyId": "500",
                "internalDate": "1700000000000",
                "payload": {
                    "mimeType": "multipart/alternative",
                    "headers": [
                        {"name": "Subject", "value": "Order #42"},
                        {"name": "From", "value": "shop@example.com"}
                    ],
                    "body": {"size": 0},
                    "parts": [
                        {"mimeType": "text/plain", "body": {"size": 5, "data": "SGVsbG8"}},
                        {"mimeType": "text/html", "body": {"size": 12, "data": "PGI-SGk8L2I-"}}
                    ]
                }
            })))
            .mount(&server)
            .await;

        let message = client_for(&server)
            .get_message(&credential(), "m1")
            .await
            .unwrap()
            .value;

        assert_eq!(message.header("subject"), Some("Order #42"));
        assert_eq!(message.snippet.as_deref(), Some("Your order has shipped"));
        assert_eq!(
            message.internal_date.unwrap().timestamp_millis(),
            1_700_000_000_000
        );
        assert_eq!(message.payload.children.len(), 2);
        assert_eq!(
            message.payload.children[0].body_data.as_deref(),
            Some(&b"Hello"[..])
        );
    }

    #[tokio::test]
    async fn message_cursor_uses_minimal_format() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages/m1"))
            .and(query_param("format", "minimal"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": "m1", "historyId": 777})),
            )
            .mount(&server)
            .await;

        let cursor = client_for(&server)
            .message_cursor(&credential(), "m1")
            .await
            .unwrap();

        assert_eq!(cursor.value.as_deref(), Some("777"));
    }

    #[tokio::test]
    async fn changes_since_follows_pages_and_dedups() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/history"))
            .and(query_param("startHistoryId", "100"))
            .and(query_param("historyTypes", "messageAdded"))
            .and(query_param("pageToken", "page-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "history": [{"id": "3", "messagesAdded": [{"message": {"id": "m3"}}]}],
                "historyId": "130"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/history"))
            .and(query_param("startHistoryId", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "history": [
                    {"id": "1", "messagesAdded": [{"message": {"id": "m1"}}]},
                    {"id": "2", "messagesAdded": [{"message": {"id": "m2"}}, {"message": {"id": "m1"}}]}
                ],
                "nextPageToken": "page-2",
                "historyId": "120"
            })))
            .mount(&server)
            .await;

        let log = client_for(&server)
            .changes_since(&credential(), "100")
            .await
            .unwrap()
            .value;

        assert_eq!(log.message_ids, vec!["m1", "m2", "m3"]);
        assert_eq!(log.history_id.as_deref(), Some("130"));
    }

    #[tokio::test]
    async fn history_404_is_cursor_expired() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/history"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Requested entity was not found."))
            .mount(&server)
            .await;

        let result = client_for(&server).changes_since(&credential(), "1").await;
        assert!(matches!(result, Err(ProviderError::CursorExpired)));
    }

    #[tokio::test]
    async fn history_page_limit_resumes_from_last_replayed_record() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/history"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "history": [
                    {"id": "105", "messagesAdded": [{"message": {"id": "m1"}}]},
                    {"id": "104"}
                ],
                "nextPageToken": "more",
                "historyId": "999"
            })))
            .expect(MAX_HISTORY_PAGES as u64)
            .mount(&server)
            .await;

        let log = client_for(&server)
            .changes_since(&credential(), "100")
            .await
            .unwrap()
            .value;

        assert_eq!(log.message_ids, vec!["m1"]);
        assert_eq!(log.history_id.as_deref(), Some("105"));
    }

    #[tokio::test]
    async fn failed_call_after_refresh_still_returns_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access-2",
                "refresh_token": "refresh-2",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages/gone"))
            .and(header("authorization", "Bearer access-2"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let mut expired = credential();
        expired.expires_at = Some(Utc::now() - chrono::Duration::minutes(5));

        let err = client_for(&server)
            .get_message(&expired, "gone")
            .await
            .unwrap_err();
        let (err, refresh) = err.into_parts();

        assert!(matches!(err, ProviderError::Api { status: 404, .. }));
        let refresh = refresh.expect("refresh survives the failure");
        assert_eq!(refresh.access_token, "access-2");
        assert_eq!(refresh.refresh_token.as_deref(), Some("refresh-2"));
    }

    #[tokio::test]
    async fn expired_history_after_refresh_keeps_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access-2",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/history"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let mut expired = credential();
        expired.expires_at = Some(Utc::now() - chrono::Duration::minutes(5));

        let err = client_for(&server)
            .changes_since(&expired, "1")
            .await
            .unwrap_err();
        let (err, refresh) = err.into_parts();

        assert!(matches!(err, ProviderError::CursorExpired));
        assert_eq!(refresh.unwrap().access_token, "access-2");
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/history"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "120"))
            .mount(&server)
            .await;

        let result = client_for(&server).changes_since(&credential(), "1").await;
        assert!(matches!(
            result,
            Err(ProviderError::RateLimited {
                retry_after_secs: Some(120)
            })
        ));
    }

    #[tokio::test]
    async fn quota_403_is_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages"))
            .respond_with(
                ResponseTemplate::new(403)
                    .set_body_string(r#"{"error":{"status":"userRateLimitExceeded"}}"#),
            )
            .mount(&server)
            .await;

        let result = client_for(&server).search(&credential(), "q", 10).await;
        assert!(matches!(result, Err(ProviderError::RateLimited { .. })));
    }

    #[tokio::test]
    async fn unauthorized_response_refreshes_once_and_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=refresh-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access-2",
                "expires_in": 3600,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages"))
            .and(header("authorization", "Bearer access-1"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages"))
            .and(header("authorization", "Bearer access-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"messages": []})))
            .expect(1)
            .mount(&server)
            .await;

        let result = client_for(&server)
            .search(&credential(), "q", 10)
            .await
            .unwrap();

        let refresh = result.refresh.expect("refresh returned to caller");
        assert_eq!(refresh.access_token, "access-2");
        assert!(refresh.refresh_token.is_none());
        assert!(refresh.expires_at.is_some());
    }

    #[tokio::test]
    async fn expired_credential_refreshes_before_calling() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access-2",
                "refresh_token": "refresh-2",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/gmail/v1/users/me/stop"))
            .and(header("authorization", "Bearer access-2"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let mut expired = credential();
        expired.expires_at = Some(Utc::now() - chrono::Duration::minutes(5));

        let result = client_for(&server).stop_watch(&expired).await.unwrap();
        assert_eq!(
            result.refresh.unwrap().refresh_token.as_deref(),
            Some("refresh-2")
        );
    }

    #[tokio::test]
    async fn watch_registers_inbox_topic() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/gmail/v1/users/me/watch"))
            .and(body_json(json!({
                "topicName": "projects/p/topics/gmail",
                "labelIds": ["INBOX"],
                "labelFilterBehavior": "include"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "historyId": "9001",
                "expiration": "1893456000000"
            })))
            .mount(&server)
            .await;

        let registration = client_for(&server)
            .watch(&credential(), "projects/p/topics/gmail")
            .await
            .unwrap()
            .value;

        assert_eq!(registration.history_id.as_deref(), Some("9001"));
        assert_eq!(registration.expires_at.timestamp(), 1_893_456_000);
    }

    #[tokio::test]
    async fn revoke_posts_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/revoke"))
            .and(query_param("token", "access-1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server).revoke("access-1").await.unwrap();
    }
}
