use thiserror::Error;

/// Network or broker trouble. Always retried through the backoff policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("network unreachable: {0}")]
    Unreachable(String),
    #[error("operation timed out")]
    Timeout,
    #[error("transport rejected the request: {0}")]
    Rejected(String),
    #[error("transport queue is full")]
    Busy,
}

/// Sensor or pin failure. Contained by the component that saw it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HardwareError {
    #[error("hardware read timed out")]
    Timeout,
    #[error("bus error: {0}")]
    Bus(String),
    #[error("value out of physical range")]
    OutOfRange,
}

/// Malformed configuration. Never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("wifi credentials are missing")]
    MissingCredentials,
    #[error("invalid wifi credentials: {0}")]
    InvalidCredentials(&'static str),
    #[error("invalid broker settings: {0}")]
    InvalidBroker(&'static str),
    #[error("invalid hardware settings: {0}")]
    InvalidHardware(&'static str),
    #[error("invalid reminder entry: {0}")]
    InvalidReminder(String),
    #[error("stored configuration unreadable: {0}")]
    Unreadable(String),
}

/// Inbound command discarded before it could touch device state.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("payload of {0} bytes exceeds the command size limit")]
    Oversized(usize),
    #[error("payload is not valid utf-8")]
    NotUtf8,
    #[error("malformed command: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("auth token mismatch")]
    Unauthorized,
    #[error("unknown command type `{0}`")]
    UnknownType(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl LinkError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_link_errors() {
        let transient = LinkError::from(TransportError::Timeout);
        assert!(transient.is_retryable());
        assert!(!transient.is_fatal());

        let fatal = LinkError::from(ConfigError::MissingCredentials);
        assert!(fatal.is_fatal());
        assert!(!fatal.is_retryable());
    }
}
