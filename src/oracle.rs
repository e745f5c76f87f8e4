use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("oracle request failed: {0}")]
    Request(String),
    #[error("oracle responded with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("oracle response decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// External text-generation capability. The decision engine, knowledge
/// interpreter, and result synthesizer all consult this; tests substitute
/// scripted implementations.
pub trait Oracle {
    fn complete(&self, messages: &[ChatMessage]) -> Result<String, OracleError>;
}

/// OpenAI-compatible chat-completions client.
#[derive(Debug, Clone)]
pub struct HttpOracle {
    api_base: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpOracle {
    pub fn new(api_base: &str, model: &str, api_key: Option<String>) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }
}

impl Oracle for HttpOracle {
    fn complete(&self, messages: &[ChatMessage]) -> Result<String, OracleError> {
        let payload = json!({
            "model": self.model,
            "temperature": 0,
            "messages": messages,
        });

        let mut request = ureq::post(&self.endpoint())
            .timeout(self.timeout)
            .set("Content-Type", "application/json");
        if let Some(key) = self.api_key.as_ref() {
            request = request.set("Authorization", &format!("Bearer {key}"));
        }

        let response = match request.send_json(payload) {
            Ok(response) => response,
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                return Err(OracleError::Status { status, body });
            }
            Err(err) => return Err(OracleError::Request(err.to_string())),
        };

        let body: serde_json::Value = response
            .into_json()
            .map_err(|err| OracleError::Decode(err.to_string()))?;
        let content = body
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .ok_or_else(|| {
                OracleError::Decode("missing choices[0].message.content".to_string())
            })?;
        Ok(content.to_string())
    }
}

/// Removes a surrounding markdown fence (with optional language tag) while
/// keeping the inner content. Oracle replies frequently wrap JSON or SQL this
/// way.
pub fn strip_code_fence(text: &str) -> &str {
    let mut trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        trimmed = match rest.split_once('\n') {
            Some((_tag, body)) => body,
            None => "",
        };
        if let Some(end) = trimmed.rfind("```") {
            trimmed = &trimmed[..end];
        }
    }
    trimmed.trim()
}
