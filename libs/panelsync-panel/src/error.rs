use serde_json::{Value, json};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PanelError>;

#[derive(Debug, Error)]
pub enum PanelError {
    /// Missing endpoint or credentials. Raised before any request is sent.
    #[error("panel is not configured: {0}")]
    Configuration(String),

    #[error("{method} {path} failed after {attempts} attempt(s): {message}")]
    Transport {
        method: String,
        path: String,
        attempts: u32,
        message: String,
    },

    #[error("{method} {path} still rate limited after {attempts} attempt(s)")]
    RateLimited {
        method: String,
        path: String,
        attempts: u32,
    },

    #[error("panel API error {status}: {message}")]
    Api {
        status: u16,
        message: String,
        body: Value,
    },

    #[error("unexpected panel response: {0}")]
    Decode(String),
}

impl PanelError {
    pub fn status(&self) -> Option<u16> {
        match self {
            PanelError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Transport failures and exhausted rate limits. Local state must not be
    /// touched when one of these surfaces.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PanelError::Transport { .. } | PanelError::RateLimited { .. }
        )
    }

    /// The panel answers enable/disable on an account that is already in the
    /// requested state with an error whose message says so.
    pub fn is_already_in_state(&self, state: &str) -> bool {
        let PanelError::Api { message, body, .. } = self else {
            return false;
        };
        let needle = format!("already {}", state.to_ascii_lowercase());
        message.to_ascii_lowercase().contains(&needle)
            || body.to_string().to_ascii_lowercase().contains(&needle)
    }
}

/// Empty bodies decode to `{}`; anything that is not JSON is kept verbatim
/// under `raw_response`.
pub fn parse_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(text).unwrap_or_else(|_| json!({ "raw_response": text }))
}

pub fn error_message(status: u16, body: &Value) -> String {
    body.get("message")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {}", status))
}
