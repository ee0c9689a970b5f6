use std::time::Duration;

/// Failures while opening a connection or negotiating its setup.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Failed to open WebSocket: {0}")]
    Dial(String),
    #[error("Timed out after {0:?} opening the WebSocket")]
    Timeout(Duration),
    #[error("Setup was rejected by the service: {0}")]
    SetupRejected(String),
    /// The service refused the voice in the setup frame.
    #[error("Voice was rejected by the service: {0}")]
    VoiceRejected(String),
    #[error("Timed out after {0:?} waiting for setupComplete")]
    SetupTimeout(Duration),
    #[error("Connection attempt was cancelled by a disconnect")]
    Cancelled,
}

/// Errors surfaced by the Live transport.
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("Not connected to the Live service")]
    NotConnected,
    #[error("No outstanding tool call with id '{0}'")]
    UnknownToolCall(String),
    #[error("Tool call '{0}' is answered more than once in the same response")]
    DuplicateToolResponse(String),
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
    #[error("Failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(
            LiveError::NotConnected.to_string(),
            "Not connected to the Live service"
        );
        assert_eq!(
            LiveError::UnknownToolCall("42".into()).to_string(),
            "No outstanding tool call with id '42'"
        );
        let err: LiveError = ConnectError::SetupRejected("bad voice".into()).into();
        assert!(err.to_string().contains("bad voice"));
        assert_eq!(
            ConnectError::VoiceRejected("Unsupported voice name: Nope".into()).to_string(),
            "Voice was rejected by the service: Unsupported voice name: Nope"
        );
    }
}
