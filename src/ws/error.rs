#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use tokio_tungstenite::tungstenite;

/// WebSocket error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// Error connecting to or communicating with the WebSocket server
    Connection(tungstenite::Error),
    /// WebSocket connection was closed by the server
    ConnectionClosed {
        code: Option<u16>,
        reason: String,
    },
    /// No frame arrived within the connection watchdog window
    WatchdogExpired(Duration),
}

impl WsError {
    /// HTTP status of a rejected handshake, e.g. `429` when rate limited.
    #[must_use]
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Connection(tungstenite::Error::Http(response)) => {
                Some(response.status().as_u16())
            }
            _ => None,
        }
    }
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::ConnectionClosed { code: Some(code), reason } => {
                write!(f, "WebSocket connection closed ({code}): {reason}")
            }
            Self::ConnectionClosed { code: None, .. } => write!(f, "WebSocket connection closed"),
            Self::WatchdogExpired(window) => {
                write!(f, "No frame received within {window:?}, connection presumed dead")
            }
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            _ => None,
        }
    }
}

// Integration with main Error type
impl From<WsError> for crate::error::Error {
    fn from(e: WsError) -> Self {
        crate::error::Error::with_source(crate::error::Kind::WebSocket, e)
    }
}

impl From<tungstenite::Error> for crate::error::Error {
    fn from(e: tungstenite::Error) -> Self {
        crate::error::Error::with_source(crate::error::Kind::WebSocket, WsError::Connection(e))
    }
}
