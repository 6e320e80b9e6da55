use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{token_count, CompletionRequest, CompletionResponse, ModelBackend};
use crate::error::GatewayError;
use crate::types::{HealthStatus, SessionHandle, Usage};

/// Remote model server speaking the pipeline's own wire contract.
///
/// `POST {base}/v1/generate` takes the rendered prompt, the structured
/// messages, sampling parameters and an optional session token, and answers
/// `{"text", "session", "usage"}`. Errors carry `{"error": {"kind", "message"}}`;
/// kind `session_unknown` means the token expired. `GET {base}/health`
/// answers `{"status": "ready" | "degraded" | "unavailable"}`.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: None,
        }
    }

    /// Pre-shared credential sent as a bearer token.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.api_key {
            Some(ref key) => req.header("authorization", format!("Bearer {key}")),
            None => req,
        }
    }

    fn request_body(request: &CompletionRequest) -> Value {
        let mut body = json!({
            "prompt": request.prompt.render(),
            "system": request.prompt.system,
            "messages": request.prompt.messages,
            "params": {
                "temperature": request.params.temperature,
                "top_p": request.params.top_p,
                "repetition_penalty": request.params.repetition_penalty,
                "max_new_tokens": request.params.max_output_tokens,
            },
        });
        if let Some(ref session) = request.session {
            body["session"] = Value::String(session.as_str().to_string());
        }
        body
    }

    /// Map a non-200 reply onto the error taxonomy.
    fn error_from(status: u16, text: String) -> GatewayError {
        let kind = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v["error"]["kind"].as_str().map(String::from));
        match kind.as_deref() {
            Some("session_unknown") | Some("session_expired") => GatewayError::SessionUnknown(text),
            _ => GatewayError::ApiError { status, body: text },
        }
    }

    fn parse_response(text: &str) -> Result<CompletionResponse, GatewayError> {
        let parsed: Value =
            serde_json::from_str(text).map_err(|e| GatewayError::Parse(e.to_string()))?;

        let generated = parsed["text"]
            .as_str()
            .ok_or_else(|| GatewayError::Parse("response has no text field".into()))?
            .to_string();

        let session = parsed["session"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(SessionHandle::new);

        let usage = Usage {
            input_tokens: token_count(&parsed["usage"]["input_tokens"]),
            output_tokens: token_count(&parsed["usage"]["output_tokens"]),
        };

        Ok(CompletionResponse {
            text: generated,
            session,
            usage,
        })
    }
}

#[async_trait]
impl ModelBackend for HttpBackend {
    async fn health(&self) -> Result<HealthStatus, GatewayError> {
        let resp = self
            .authorized(self.client.get(format!("{}/health", self.base_url)))
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status != 200 {
            return Ok(HealthStatus::Unavailable);
        }
        let parsed: Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::Parse(e.to_string()))?;

        Ok(match parsed["status"].as_str().unwrap_or("ready") {
            "ready" | "ok" => HealthStatus::Ready,
            "degraded" | "loading" => HealthStatus::Degraded,
            _ => HealthStatus::Unavailable,
        })
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, GatewayError> {
        let body = Self::request_body(&request);

        debug!(
            messages = request.prompt.messages.len(),
            session = request.session.is_some(),
            "http generate request"
        );

        let resp = self
            .authorized(
                self.client
                    .post(format!("{}/v1/generate", self.base_url))
                    .header("content-type", "application/json"),
            )
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        let text = resp.text().await?;

        if status != 200 {
            return Err(Self::error_from(status, text));
        }

        Self::parse_response(&text)
    }
}
