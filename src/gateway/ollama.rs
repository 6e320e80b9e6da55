use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{token_count, CompletionRequest, CompletionResponse, ModelBackend};
use crate::error::GatewayError;
use crate::types::{HealthStatus, SessionHandle, Usage};

/// Ollama backend using the native `/api/generate` endpoint.
///
/// Ollama returns a `context` array encoding the evaluated conversation. It is
/// carried as the session handle (JSON-encoded); sending it back lets Ollama
/// skip re-evaluating the history, so a warm call only sends the newest user
/// message.
pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaBackend {
    /// Connect to a local Ollama instance at the default address.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "http://localhost:11434".into(),
            model: model.into(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn decode_session(handle: &SessionHandle) -> Result<Vec<i64>, GatewayError> {
        serde_json::from_str(handle.as_str())
            .map_err(|e| GatewayError::SessionUnknown(format!("undecodable context: {e}")))
    }

    fn encode_session(context: &Value) -> Option<SessionHandle> {
        let arr = context.as_array().filter(|a| !a.is_empty())?;
        Some(SessionHandle::new(Value::Array(arr.clone()).to_string()))
    }

    fn request_body(&self, request: &CompletionRequest) -> Result<Value, GatewayError> {
        let warm = match request.session {
            Some(ref handle) => Some(Self::decode_session(handle)?),
            None => None,
        };

        // With a warm context only the new message is evaluated.
        let prompt = match (&warm, request.prompt.latest_user()) {
            (Some(_), Some(latest)) => format!("User: {latest}\n\nAssistant:"),
            _ => request.prompt.render_turns(),
        };

        let mut body = json!({
            "model": self.model,
            "prompt": prompt,
            "system": request.prompt.system,
            "stream": false,
            "options": {
                "temperature": request.params.temperature,
                "top_p": request.params.top_p,
                "repeat_penalty": request.params.repetition_penalty,
                "num_predict": request.params.max_output_tokens,
            },
        });
        if let Some(context) = warm {
            body["context"] = json!(context);
        }
        Ok(body)
    }

    fn parse_response(text: &str) -> Result<CompletionResponse, GatewayError> {
        let parsed: Value =
            serde_json::from_str(text).map_err(|e| GatewayError::Parse(e.to_string()))?;

        let generated = parsed["response"]
            .as_str()
            .ok_or_else(|| GatewayError::Parse("response has no response field".into()))?
            .to_string();

        let usage = Usage {
            input_tokens: token_count(&parsed["prompt_eval_count"]),
            output_tokens: token_count(&parsed["eval_count"]),
        };

        Ok(CompletionResponse {
            text: generated,
            session: Self::encode_session(&parsed["context"]),
            usage,
        })
    }
}

#[async_trait]
impl ModelBackend for OllamaBackend {
    /// Ready when the model is resident, Degraded when Ollama is up but the
    /// model would need a cold load.
    async fn health(&self) -> Result<HealthStatus, GatewayError> {
        let resp = self
            .client
            .get(format!("{}/api/ps", self.base_url))
            .send()
            .await?;

        if resp.status().as_u16() != 200 {
            return Ok(HealthStatus::Unavailable);
        }
        let parsed: Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::Parse(e.to_string()))?;

        let loaded = parsed["models"].as_array().is_some_and(|models| {
            models.iter().any(|m| {
                m["name"].as_str() == Some(self.model.as_str())
                    || m["model"].as_str() == Some(self.model.as_str())
            })
        });
        Ok(if loaded {
            HealthStatus::Ready
        } else {
            HealthStatus::Degraded
        })
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, GatewayError> {
        let body = self.request_body(&request)?;

        debug!(
            model = %self.model,
            warm = body.get("context").is_some(),
            "ollama generate request"
        );

        let resp = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        let text = resp.text().await?;

        if status != 200 {
            return Err(GatewayError::ApiError { status, body: text });
        }

        Self::parse_response(&text)
    }
}
