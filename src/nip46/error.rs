use crate::nip44::Nip44Error;
use crate::relay::TransportError;

use super::uri::BunkerUriError;

/// Failures surfaced by a bunker session.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Uri(#[from] BunkerUriError),
    /// Malformed envelope or key material
    #[error("encryption format error: {0}")]
    Format(Nip44Error),
    /// MAC or padding failure: tampering or the wrong key
    #[error("integrity check failed: {0}")]
    Integrity(Nip44Error),
    #[error("no relay reachable ({} tried)", .0.len())]
    NoRelayReachable(Vec<TransportError>),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{context}: timeout")]
    Timeout { context: &'static str },
    /// The bunker answered with an explicit error
    #[error("bunker rejected the request: {0}")]
    Rejected(String),
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("failed to encode request: {0}")]
    Encode(String),
    #[error("invalid signed event: {0}")]
    InvalidEvent(String),
    #[error("session is not connected")]
    NotConnected,
    #[error("session is already {0}")]
    InvalidState(&'static str),
    #[error("request cancelled: session closed")]
    Cancelled,
}

impl From<Nip44Error> for SessionError {
    fn from(err: Nip44Error) -> Self {
        if err.is_integrity() {
            SessionError::Integrity(err)
        } else {
            SessionError::Format(err)
        }
    }
}

impl SessionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::Timeout { .. })
    }

    /// Message suitable for showing to an end user.
    ///
    /// MAC and other decryption failures read the same, so the outer layer
    /// cannot be used as a decryption oracle.
    pub fn user_message(&self) -> String {
        match self {
            SessionError::Format(_) | SessionError::Integrity(_) => {
                "could not decrypt the bunker response".to_string()
            }
            SessionError::Timeout { .. } => "the bunker did not respond in time".to_string(),
            SessionError::Rejected(reason) => format!("the bunker rejected the request: {}", reason),
            SessionError::NoRelayReachable(_) => {
                "none of the bunker relays could be reached".to_string()
            }
            SessionError::NotConnected | SessionError::Cancelled => {
                "not logged in".to_string()
            }
            other => other.to_string(),
        }
    }
}
