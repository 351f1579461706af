//! REST client for the task provider.
//!
//! Resources live at `{api_url}/{type}s` (`labels`, `lists`, `tasks`).
//! Fetches accept either a bare JSON array (full listing) or an object
//! `{ "items": [...], "cursor": "...", "delta": true }` when the provider
//! supports changed-since queries via `?since=`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, RETRY_AFTER, USER_AGENT};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument};

use super::{RemoteBatch, RemoteEnvelope, RemoteProvider, CLIENT_REF_KEY};
use crate::errors::RemoteApiError;
use crate::models::EntityType;

/// Asynchronous HTTP provider client.
#[derive(Clone)]
pub struct HttpProvider {
    http: reqwest::Client,
    api_url: String,
}

impl HttpProvider {
    pub fn new(api_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteApiError> {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("tasksync/", env!("CARGO_PKG_VERSION"))),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        info!(api_url = %api_url, "created HttpProvider");
        Ok(Self { http, api_url })
    }

    fn collection_url(&self, entity_type: EntityType) -> String {
        format!("{}/{}s", self.api_url, entity_type.as_str())
    }

    fn item_url(&self, entity_type: EntityType, remote_id: &str) -> String {
        format!("{}/{}", self.collection_url(entity_type), remote_id)
    }

    /// Turn a non-success response into the matching error.
    async fn check_response(resp: reqwest::Response) -> Result<reqwest::Response, RemoteApiError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = resp.text().await.unwrap_or_default();
        Err(RemoteApiError::from_status(
            status.as_u16(),
            clip_body(&body, MAX_ERROR_BODY),
            retry_after,
        ))
    }

    async fn read_entity(
        entity_type: EntityType,
        resp: reqwest::Response,
    ) -> Result<RemoteEnvelope, RemoteApiError> {
        let value: Value = resp
            .json()
            .await
            .map_err(|e| RemoteApiError::ParseError(e.to_string()))?;
        RemoteEnvelope::from_json(entity_type, value)
    }
}

/// Longest error body kept in an error, in bytes.
const MAX_ERROR_BODY: usize = 200;

/// Cut `body` to at most `max` bytes without splitting a character.
fn clip_body(body: &str, max: usize) -> String {
    if body.len() <= max {
        return body.to_string();
    }
    let mut end = max;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

/// Parse a fetch response body into a batch.
fn parse_batch(
    entity_type: EntityType,
    value: Value,
    asked_for_delta: bool,
) -> Result<RemoteBatch, RemoteApiError> {
    let (items, cursor, is_delta) = match value {
        Value::Array(items) => (items, None, false),
        Value::Object(mut obj) => {
            let items = match obj.remove("items") {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(RemoteApiError::ParseError(
                        "fetch response has no 'items' array".into(),
                    ))
                }
            };
            let cursor = match obj.remove("cursor") {
                Some(Value::String(s)) => Some(s),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            };
            let is_delta = asked_for_delta && matches!(obj.get("delta"), Some(Value::Bool(true)));
            (items, cursor, is_delta)
        }
        _ => {
            return Err(RemoteApiError::ParseError(
                "fetch response is neither an array nor an object".into(),
            ))
        }
    };

    let entities = items
        .into_iter()
        .map(|item| RemoteEnvelope::from_json(entity_type, item))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(RemoteBatch {
        entities,
        cursor,
        is_delta,
    })
}

#[async_trait]
impl RemoteProvider for HttpProvider {
    #[instrument(skip(self, token))]
    async fn verify_token(&self, token: &str) -> Result<(), RemoteApiError> {
        let url = format!("{}/me", self.api_url);
        let resp = self.http.get(&url).bearer_auth(token).send().await?;
        Self::check_response(resp).await?;
        debug!("token verified");
        Ok(())
    }

    #[instrument(skip(self, token))]
    async fn fetch(
        &self,
        token: &str,
        entity_type: EntityType,
        cursor: Option<&str>,
    ) -> Result<RemoteBatch, RemoteApiError> {
        let mut req = self
            .http
            .get(self.collection_url(entity_type))
            .bearer_auth(token);
        if let Some(since) = cursor {
            req = req.query(&[("since", since)]);
        }
        let resp = Self::check_response(req.send().await?).await?;
        let value: Value = resp
            .json()
            .await
            .map_err(|e| RemoteApiError::ParseError(e.to_string()))?;

        let batch = parse_batch(entity_type, value, cursor.is_some())?;
        debug!(
            count = batch.entities.len(),
            is_delta = batch.is_delta,
            "fetched remote entities"
        );
        Ok(batch)
    }

    #[instrument(skip(self, token, fields))]
    async fn create(
        &self,
        token: &str,
        entity_type: EntityType,
        fields: &Map<String, Value>,
        stable_key: &str,
    ) -> Result<RemoteEnvelope, RemoteApiError> {
        let mut body = fields.clone();
        body.insert(CLIENT_REF_KEY.into(), Value::String(stable_key.to_string()));
        let resp = self
            .http
            .post(self.collection_url(entity_type))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        let envelope = Self::read_entity(entity_type, Self::check_response(resp).await?).await?;
        debug!(remote_id = %envelope.remote_id, "created remote entity");
        Ok(envelope)
    }

    #[instrument(skip(self, token, fields))]
    async fn update(
        &self,
        token: &str,
        entity_type: EntityType,
        remote_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<RemoteEnvelope, RemoteApiError> {
        let resp = self
            .http
            .patch(self.item_url(entity_type, remote_id))
            .bearer_auth(token)
            .json(fields)
            .send()
            .await?;
        Self::read_entity(entity_type, Self::check_response(resp).await?).await
    }

    #[instrument(skip(self, token))]
    async fn delete(
        &self,
        token: &str,
        entity_type: EntityType,
        remote_id: &str,
    ) -> Result<(), RemoteApiError> {
        let resp = self
            .http
            .delete(self.item_url(entity_type, remote_id))
            .bearer_auth(token)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            debug!("remote entity already gone");
            return Ok(());
        }
        Self::check_response(resp).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and return the base URL plus a handle
    /// yielding the raw request text.
    async fn serve_once(response: String) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&received).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let content_length = text[..end]
                        .lines()
                        .filter_map(|l| l.split_once(':'))
                        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if received.len() >= end + 4 + content_length {
                        break;
                    }
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&received).to_string()
        });
        (format!("http://{}", addr), handle)
    }

    fn response(status: &str, headers: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n{}\r\n{}",
            status,
            body.len(),
            headers,
            body
        )
    }

    fn provider(url: &str) -> HttpProvider {
        HttpProvider::new(url, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_parse_batch_shapes() {
        let full = parse_batch(EntityType::Task, json!([{"id": "T1"}]), false).unwrap();
        assert_eq!(full.entities.len(), 1);
        assert!(!full.is_delta);
        assert!(full.cursor.is_none());

        let delta = parse_batch(
            EntityType::Task,
            json!({"items": [{"id": "T2", "deleted": true}], "cursor": 17, "delta": true}),
            true,
        )
        .unwrap();
        assert!(delta.is_delta);
        assert_eq!(delta.cursor.as_deref(), Some("17"));
        assert!(delta.entities[0].deleted);

        // A delta flag without a requested cursor is treated as a full listing.
        let unasked = parse_batch(EntityType::Task, json!({"items": [], "delta": true}), false)
            .unwrap();
        assert!(!unasked.is_delta);

        assert!(parse_batch(EntityType::Task, json!({"data": []}), false).is_err());
        assert!(parse_batch(EntityType::Task, json!("nope"), false).is_err());
    }

    #[tokio::test]
    async fn test_fetch_sends_bearer_and_cursor() {
        let body = r#"{"items":[{"id":"T1","title":"Buy bread"}],"cursor":"c2","delta":true}"#;
        let (url, request) = serve_once(response("200 OK", "", body)).await;

        let batch = provider(&url)
            .fetch("tok_123", EntityType::Task, Some("c1"))
            .await
            .unwrap();
        assert_eq!(batch.entities[0].remote_id, "T1");
        assert_eq!(batch.cursor.as_deref(), Some("c2"));

        let raw = request.await.unwrap();
        assert!(raw.starts_with("GET /tasks?since=c1 "));
        assert!(raw.to_lowercase().contains("authorization: bearer tok_123"));
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_reconnect() {
        let (url, _request) = serve_once(response("401 Unauthorized", "", "{}")).await;
        let err = provider(&url).verify_token("bad").await.unwrap_err();
        assert!(err.requires_reconnect());
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_rate_limit_reads_retry_after() {
        let (url, _request) =
            serve_once(response("429 Too Many Requests", "Retry-After: 7\r\n", "{}")).await;
        let err = provider(&url)
            .fetch("tok", EntityType::Label, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RemoteApiError::RateLimited {
                retry_after_secs: Some(7)
            }
        ));
    }

    #[test]
    fn test_clip_body_keeps_char_boundaries() {
        assert_eq!(clip_body("short", 200), "short");
        assert_eq!(clip_body("abcdef", 4), "abcd");
        // 'é' is two bytes; byte 2 falls inside it.
        assert_eq!(clip_body("aé tail", 2), "a");
        assert_eq!(clip_body("aé tail", 3), "aé");
    }

    #[tokio::test]
    async fn test_server_error_with_multibyte_body_is_clipped() {
        let body = format!("{}é tail", "a".repeat(199));
        let (url, _request) = serve_once(response("503 Service Unavailable", "", &body)).await;

        let err = provider(&url)
            .fetch("tok", EntityType::Task, None)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        match err {
            RemoteApiError::ServerError { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "a".repeat(199));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_delete_treats_404_as_success() {
        let (url, request) = serve_once(response("404 Not Found", "", "{}")).await;
        provider(&url)
            .delete("tok", EntityType::List, "P9")
            .await
            .unwrap();
        assert!(request.await.unwrap().starts_with("DELETE /lists/P9 "));
    }

    #[tokio::test]
    async fn test_create_sends_client_ref() {
        let (url, request) = serve_once(response(
            "201 Created",
            "",
            r#"{"id":"T7","title":"Buy milk","client_ref":"5"}"#,
        ))
        .await;

        let fields = json!({"title": "Buy milk"}).as_object().cloned().unwrap();
        let created = provider(&url)
            .create("tok", EntityType::Task, &fields, "5")
            .await
            .unwrap();
        assert_eq!(created.remote_id, "T7");
        assert_eq!(created.stable_key.as_deref(), Some("5"));

        let raw = request.await.unwrap();
        assert!(raw.starts_with("POST /tasks "));
        assert!(raw.contains("\"client_ref\":\"5\""));
    }
}
