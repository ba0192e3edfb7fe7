use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }

    pub fn system(content: impl Into<String>) -> Self { Self::new(Role::System, content) }
    pub fn user(content: impl Into<String>) -> Self { Self::new(Role::User, content) }
    pub fn assistant(content: impl Into<String>) -> Self { Self::new(Role::Assistant, content) }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("chat endpoint returned {0}")]
    Status(u16),

    #[error("malformed chat response: {0}")]
    MalformedResponse(String),
}

/// A single request/response round trip to the remote assistant. No retries;
/// callers decide what to do with a failure.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, messages: &[ChatMessage]) -> Result<String, TransportError>;
}

#[derive(Debug, Serialize)]
struct WorkerRequest<'a> {
    messages: &'a [ChatMessage],
}

#[derive(Debug, Deserialize)]
struct WorkerResponse {
    #[serde(default)]
    choices: Vec<WorkerChoice>,
}

#[derive(Debug, Deserialize)]
struct WorkerChoice {
    message: Option<WorkerMessage>,
}

#[derive(Debug, Deserialize)]
struct WorkerMessage {
    content: String,
}

/// Client for the chat worker: `POST {endpoint}` with `{messages}` and an
/// OpenAI style `{choices: [{message: {content}}]}` reply. The worker holds
/// any credentials, so nothing is sent besides the messages.
#[derive(Clone)]
pub struct WorkerClient {
    endpoint: String,
    client: reqwest::Client,
}

impl WorkerClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { endpoint: endpoint.into(), client })
    }
}

pub(crate) fn first_choice_content(body: &str) -> Result<String, TransportError> {
    let v: WorkerResponse = serde_json::from_str(body)
        .map_err(|e| TransportError::MalformedResponse(e.to_string()))?;
    v.choices
        .into_iter()
        .next()
        .and_then(|c| c.message)
        .map(|m| m.content)
        .ok_or_else(|| TransportError::MalformedResponse("missing choices[0].message".into()))
}

#[async_trait]
impl ChatTransport for WorkerClient {
    async fn send(&self, messages: &[ChatMessage]) -> Result<String, TransportError> {
        metrics::counter!("advisor_transport_requests_total").increment(1);
        tracing::debug!(
            endpoint = %self.endpoint,
            messages = messages.len(),
            "sending chat request"
        );

        let result = async {
            let resp = self
                .client
                .post(&self.endpoint)
                .json(&WorkerRequest { messages })
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(TransportError::Status(status.as_u16()));
            }
            let body = resp.text().await?;
            first_choice_content(&body)
        }
        .await;

        if let Err(e) = &result {
            metrics::counter!("advisor_transport_failures_total").increment(1);
            tracing::error!(error = %e, "chat request failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use std::sync::{Arc, Mutex};

    async fn spawn_worker(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/chat", addr)
    }

    fn client(url: &str) -> WorkerClient {
        WorkerClient::new(url, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn send_posts_messages_and_returns_first_choice() {
        let seen: Arc<Mutex<Option<serde_json::Value>>> = Arc::default();
        let seen_in_handler = seen.clone();
        let app = Router::new().route(
            "/chat",
            post(move |Json(body): Json<serde_json::Value>| {
                let seen = seen_in_handler.clone();
                async move {
                    *seen.lock().unwrap() = Some(body);
                    Json(serde_json::json!({
                        "choices": [
                            {"message": {"role": "assistant", "content": "Use A then B."}},
                            {"message": {"role": "assistant", "content": "ignored"}}
                        ]
                    }))
                }
            }),
        );
        let url = spawn_worker(app).await;

        let msgs = vec![ChatMessage::system("be helpful"), ChatMessage::user("hi")];
        let reply = client(&url).send(&msgs).await.unwrap();
        assert_eq!(reply, "Use A then B.");

        let body = seen.lock().unwrap().clone().unwrap();
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body.as_object().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let app = Router::new()
            .route("/chat", post(|| async { (StatusCode::BAD_GATEWAY, "upstream down") }));
        let url = spawn_worker(app).await;
        let err = client(&url).send(&[ChatMessage::user("hi")]).await.unwrap_err();
        assert!(matches!(err, TransportError::Status(502)));
    }

    #[tokio::test]
    async fn missing_choices_is_malformed() {
        let app = Router::new()
            .route("/chat", post(|| async { Json(serde_json::json!({"error": "quota"})) }));
        let url = spawn_worker(app).await;
        let err = client(&url).send(&[ChatMessage::user("hi")]).await.unwrap_err();
        assert!(matches!(err, TransportError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_network_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = client(&format!("http://{}/chat", addr))
            .send(&[ChatMessage::user("hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Network(_)));
    }

    #[test]
    fn first_choice_content_shapes() {
        assert_eq!(
            first_choice_content(r#"{"choices":[{"message":{"content":"ok"}}]}"#).unwrap(),
            "ok"
        );
        assert!(first_choice_content(r#"{"choices":[]}"#).is_err());
        assert!(first_choice_content(r#"{"choices":[{"delta":{}}]}"#).is_err());
        assert!(first_choice_content("not json").is_err());
    }

    #[test]
    fn roles_serialize_lowercase() {
        let v = serde_json::to_value(ChatMessage::assistant("x")).unwrap();
        assert_eq!(v, serde_json::json!({"role": "assistant", "content": "x"}));
    }
}
