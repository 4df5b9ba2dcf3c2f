//! NIP-46 remote signing
//!
//! This module provides bunker:// URI parsing, the encrypted request/response
//! session with a remote signer, a registry of live sessions, and the audited
//! signer the CLI drives.

pub mod audit;
pub mod error;
pub mod registry;
pub mod rpc;
pub mod session;
pub mod signer;
pub mod uri;

#[cfg(test)]
pub mod testkit;

pub use audit::AuditLog;
pub use error::SessionError;
pub use registry::DEFAULT_MAX_IDLE;
pub use rpc::EventTemplate;
pub use session::BunkerSession;
pub use signer::{BunkerSigner, Timeouts};
