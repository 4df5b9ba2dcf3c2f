//! Relay transport
//!
//! A relay is an untrusted, unreliable WebSocket endpoint. This module only
//! knows how to move NIP-01 frames over it; nothing here sees plaintext.

pub mod link;
pub mod publish;

pub use link::{dial_before, RelayDialer, RelayLink, RelayMessages, WebSocketDialer};
pub use publish::{PublishError, PublishPolicy, PublishReport, Publisher};

use nostr::RelayUrl;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("failed to dial {url}: {reason}")]
    Dial { url: RelayUrl, reason: String },
    #[error("dial to {0} timed out")]
    DialTimeout(RelayUrl),
    #[error("relay link {0} is closed")]
    Closed(RelayUrl),
    #[error("malformed relay message: {0}")]
    Malformed(String),
}
