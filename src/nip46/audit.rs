//! Audit trail for bunker sessions
//!
//! One JSON line per connect, signing request and logout, so an operator can
//! review what was signed through which session. Secrets and event content
//! are never written.

use std::io::Write;
use std::path::PathBuf;

use serde::Serialize;

pub const BUNKER_CONNECT: &str = "bunker_connect";
pub const SIGN_EVENT_REQUEST: &str = "sign_event_request";
pub const SIGN_EVENT_SUCCESS: &str = "sign_event_success";
pub const SIGN_EVENT_FAILURE: &str = "sign_event_failure";
pub const LOGOUT: &str = "logout";

#[derive(Debug, Serialize)]
struct AuditEntry<'a> {
    timestamp: String,
    operation: &'a str,
    session: &'a str,
    details: &'a str,
}

/// Append-only JSONL log
pub struct AuditLog {
    path: Option<PathBuf>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// A log that records nothing
    pub fn disabled() -> Self {
        Self { path: None }
    }

    /// Append one entry. Failures are logged and otherwise ignored.
    pub fn record(&mut self, operation: &str, session: &str, details: &str) {
        let Some(path) = &self.path else {
            return;
        };

        let entry = AuditEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            operation,
            session,
            details,
        };
        let written = serde_json::to_string(&entry)
            .map_err(std::io::Error::from)
            .and_then(|json| {
                let mut file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                writeln!(file, "{}", json)
            });
        if let Err(e) = written {
            tracing::warn!(path = %path.display(), error = %e, "Audit log write failed");
        }
    }
}
