use thiserror::Error;

pub type BrowserResult<T> = Result<T, BrowserError>;

/// Tagged failure taxonomy for the browser session. CDP errors are
/// classified exactly once, at the `From<CdpError>` boundary below;
/// callers match on variants and never re-parse message text.
#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("chrome discovery failed: {0}")]
    Discovery(String),
    #[error("chrome connection failed: {0}")]
    Connection(String),
    #[error("navigation timeout: {0}")]
    NavigationTimeout(String),
    #[error("anti-automation defense triggered: {0}")]
    AntiAutomation(String),
    #[error("browser connection lost: {0}")]
    ConnectionLost(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("cdp error: {0}")]
    Cdp(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrowserError {
    /// True when the underlying automation connection is gone and the
    /// session must reconnect before the next use.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, BrowserError::ConnectionLost(_))
    }

    /// True when the rendered endpoint, not the session, misbehaved.
    pub fn is_anti_automation(&self) -> bool {
        matches!(self, BrowserError::AntiAutomation(_))
    }
}

// Known failure signatures surfaced by the remote debugging protocol.
// "Maximum call stack size exceeded" is the defensive-script marker
// mirror endpoints inject against automated visitors.
const ANTI_AUTOMATION_SIGNATURE: &str = "maximum call stack size exceeded";
const DROPPED_CONNECTION_SIGNATURES: &[&str] = &[
    "connection is closed",
    "protocol error",
    "websocket error",
    "channel closed",
];

impl From<chromiumoxide::error::CdpError> for BrowserError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        classify_protocol_message(err.to_string())
    }
}

fn classify_protocol_message(text: String) -> BrowserError {
    let lowered = text.to_lowercase();
    if lowered.contains(ANTI_AUTOMATION_SIGNATURE) {
        BrowserError::AntiAutomation(text)
    } else if DROPPED_CONNECTION_SIGNATURES
        .iter()
        .any(|signature| lowered.contains(signature))
    {
        BrowserError::ConnectionLost(text)
    } else if lowered.contains("timeout") {
        BrowserError::NavigationTimeout(text)
    } else {
        BrowserError::Cdp(text)
    }
}

impl From<tokio::task::JoinError> for BrowserError {
    fn from(err: tokio::task::JoinError) -> Self {
        BrowserError::Cdp(err.to_string())
    }
}
