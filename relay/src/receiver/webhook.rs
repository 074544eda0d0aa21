use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{ErrorKind, RelayResult};
use crate::parameters::parse_parameters;
use crate::receiver::{Receiver, ReceiverResponse, delivery_payload};
use crate::relay_error;
use crate::types::TrackedChange;

/// Maximum number of characters of a response body kept in an error description.
const MAX_BODY_EXCERPT_CHARS: usize = 256;

#[derive(Debug, Deserialize)]
struct Parameters {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

fn default_method() -> String {
    "POST".to_string()
}

/// Typed, validated form of [`Parameters`].
struct Request {
    url: Url,
    method: Method,
    headers: HashMap<String, String>,
    timeout: Option<Duration>,
}

impl Request {
    fn parse(parameters: &Value) -> RelayResult<Self> {
        let parameters: Parameters = parse_parameters(WebhookReceiver::NAME, parameters)?;

        let url = Url::parse(&parameters.url).map_err(|err| {
            relay_error!(
                ErrorKind::ConfigError,
                "Invalid component parameters",
                format!("Webhook: invalid url '{}': {err}", parameters.url)
            )
        })?;
        let method = Method::from_bytes(parameters.method.to_uppercase().as_bytes()).map_err(
            |err| {
                relay_error!(
                    ErrorKind::ConfigError,
                    "Invalid component parameters",
                    format!("Webhook: invalid method '{}': {err}", parameters.method)
                )
            },
        )?;

        Ok(Self {
            url,
            method,
            headers: parameters.headers,
            timeout: parameters.timeout_ms.map(Duration::from_millis),
        })
    }
}

fn body_excerpt(body: &str) -> String {
    let mut excerpt: String = body.chars().take(MAX_BODY_EXCERPT_CHARS).collect();
    if body.chars().count() > MAX_BODY_EXCERPT_CHARS {
        excerpt.push('…');
    }

    excerpt
}

/// Delivers changes as JSON documents over HTTP.
///
/// Any 2xx response is a success. Other statuses are failures carrying the status and the start
/// of the response body.
#[derive(Debug, Clone)]
pub struct WebhookReceiver {
    client: Client,
}

impl WebhookReceiver {
    pub const NAME: &'static str = "Webhook";

    pub fn new() -> RelayResult<Self> {
        let client = Client::builder().build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Receiver for WebhookReceiver {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn validate_parameters(&self, parameters: &Value) -> RelayResult<()> {
        Request::parse(parameters).map(|_| ())
    }

    async fn send(
        &self,
        change: &TrackedChange,
        parameters: &Value,
    ) -> RelayResult<ReceiverResponse> {
        let request = Request::parse(parameters)?;
        let payload = delivery_payload(change)?;

        let mut builder = self
            .client
            .request(request.method, request.url)
            .json(&payload);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await?;
        let status = response.status();
        debug!(row_label = %change.row_label, %status, "webhook responded");

        if status.is_success() {
            return Ok(ReceiverResponse::success());
        }

        let body = response.text().await.unwrap_or_default();

        Ok(ReceiverResponse::failure(format!(
            "HTTP {status}: {}",
            body_excerpt(&body)
        )))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    use super::*;

    /// Answers a single HTTP request with `status_line` and `body`, returning the request text.
    async fn one_shot_server(status_line: &'static str, body: &'static str) -> (Url, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("http://{}/hook", listener.local_addr().unwrap())).unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();

            let mut request = Vec::new();
            let mut buffer = [0u8; 4096];
            loop {
                let read = socket.read(&mut buffer).await.unwrap();
                request.extend_from_slice(&buffer[..read]);

                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + content_length || read == 0 {
                        break;
                    }
                }
                if read == 0 {
                    break;
                }
            }

            let response = format!(
                "{status_line}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();

            String::from_utf8_lossy(&request).to_string()
        });

        (url, handle)
    }

    fn change() -> TrackedChange {
        TrackedChange::insert("orders", "101", Utc::now(), json!({"id": 1}))
    }

    #[tokio::test]
    async fn posts_the_transformed_payload_when_present() {
        let (url, server) = one_shot_server("HTTP/1.1 204 No Content", "").await;
        let receiver = WebhookReceiver::new().unwrap();

        let mut change = change();
        change.transformed_data = Some(json!({"projected": true}));

        let response = receiver
            .send(
                &change,
                &json!({"url": url.as_str(), "headers": {"x-relay-token": "abc"}}),
            )
            .await
            .unwrap();
        assert!(response.is_success());

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /hook"));
        assert!(request.to_lowercase().contains("x-relay-token: abc"));
        assert!(request.contains(r#"{"projected":true}"#));
    }

    #[tokio::test]
    async fn non_success_statuses_are_failures() {
        let (url, server) = one_shot_server("HTTP/1.1 503 Service Unavailable", "busy").await;
        let receiver = WebhookReceiver::new().unwrap();

        let response = receiver
            .send(&change(), &json!({"url": url.as_str(), "method": "put"}))
            .await
            .unwrap();

        assert!(!response.is_success());
        let description = response.error_description.unwrap();
        assert!(description.contains("503"));
        assert!(description.contains("busy"));

        assert!(server.await.unwrap().starts_with("PUT /hook"));
    }

    #[test]
    fn parameters_are_validated() {
        let receiver = WebhookReceiver::new().unwrap();

        assert!(receiver
            .validate_parameters(&json!({"url": "http://localhost:8080/hook"}))
            .is_ok());
        assert_eq!(
            receiver
                .validate_parameters(&json!({"url": "not a url"}))
                .unwrap_err()
                .kind(),
            ErrorKind::ConfigError
        );
        assert!(receiver
            .validate_parameters(&json!({"url": "http://localhost", "method": "GE T"}))
            .is_err());
        assert!(receiver.validate_parameters(&Value::Null).is_err());
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(1_000);
        let excerpt = body_excerpt(&body);

        assert_eq!(excerpt.chars().count(), MAX_BODY_EXCERPT_CHARS + 1);
        assert!(excerpt.ends_with('…'));
        assert_eq!(body_excerpt("short"), "short");
    }
}
