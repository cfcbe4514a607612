use thiserror::Error;

#[derive(Debug, Error)]
pub enum WardenError {
    #[error("unknown isolate `{0}`")]
    InvalidId(String),

    #[error("isolate `{id}` cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("no reply from `{target}` within {timeout_ms} ms")]
    TransportTimeout { target: String, timeout_ms: u64 },

    #[error("malformed `{signal}` payload: {reason}")]
    MalformedPayload { signal: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl WardenError {
    pub fn malformed(signal: &str, reason: impl Into<String>) -> Self {
        WardenError::MalformedPayload {
            signal: signal.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WardenError>;
