//! Session host used by the CLI
//!
//! BunkerSigner is what a web handler would hold: it logs users in through a
//! bunker URI, keeps their sessions in a [`SessionRegistry`], signs on their
//! behalf with the configured deadlines, and writes every step to the audit
//! log.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nostr::{Event, PublicKey};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use super::audit::{self, AuditLog};
use super::registry::SessionRegistry;
use super::rpc::EventTemplate;
use super::session::BunkerSession;
use super::uri::BunkerUri;
use crate::relay::RelayDialer;

/// Matches the web app's login handler
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
/// Matches the web app's posting handler
pub const DEFAULT_SIGN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub connect: Duration,
    pub sign: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: DEFAULT_CONNECT_TIMEOUT,
            sign: DEFAULT_SIGN_TIMEOUT,
        }
    }
}

pub struct BunkerSigner {
    registry: SessionRegistry,
    dialer: Arc<dyn RelayDialer>,
    audit: Arc<Mutex<AuditLog>>,
    timeouts: Timeouts,
}

impl BunkerSigner {
    pub fn new(dialer: Arc<dyn RelayDialer>, audit: Arc<Mutex<AuditLog>>, timeouts: Timeouts) -> Self {
        Self {
            registry: SessionRegistry::new(),
            dialer,
            audit,
            timeouts,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Connect to the bunker behind `bunker_uri` and register the session.
    pub async fn login(&self, bunker_uri: &str) -> Result<Arc<BunkerSession>> {
        let uri = BunkerUri::parse(bunker_uri).context("Invalid bunker URI")?;
        let signer = uri.remote_signer;
        let session = BunkerSession::new(uri, Arc::clone(&self.dialer)).with_auth_url_handler(
            Arc::new(|url: &str| {
                eprintln!("🔐 The bunker asks for approval: {}", url);
            }),
        );

        let deadline = Instant::now() + self.timeouts.connect;
        let user = session
            .connect(deadline)
            .await
            .with_context(|| format!("Failed to connect to bunker {}", &signer.to_hex()[..16]))?;

        self.audit.lock().await.record(
            audit::BUNKER_CONNECT,
            session.id(),
            &format!("remote signer: {}, user pubkey: {}", signer.to_hex(), user.to_hex()),
        );

        let session = Arc::new(session);
        self.registry.set(Arc::clone(&session));
        Ok(session)
    }

    /// Cached user key for a session, `None` when not logged in.
    pub fn whoami(&self, session_id: &str) -> Option<PublicKey> {
        self.registry.get(session_id)?.user_pubkey()
    }

    pub async fn sign(&self, session_id: &str, template: EventTemplate) -> Result<Event> {
        let session = self
            .registry
            .get(session_id)
            .context("Not logged in: unknown session")?;

        self.audit.lock().await.record(
            audit::SIGN_EVENT_REQUEST,
            session_id,
            &format!("kind: {}", template.kind),
        );

        let deadline = Instant::now() + self.timeouts.sign;
        match session.sign_event(template, deadline).await {
            Ok(event) => {
                self.audit.lock().await.record(
                    audit::SIGN_EVENT_SUCCESS,
                    session_id,
                    &format!("event_id: {}, kind: {}", event.id.to_hex(), event.kind.as_u16()),
                );
                Ok(event)
            }
            Err(e) => {
                warn!(timeout = e.is_timeout(), error = %e, "Signing request failed");
                self.audit
                    .lock()
                    .await
                    .record(audit::SIGN_EVENT_FAILURE, session_id, &e.to_string());
                Err(anyhow::Error::new(e).context("Bunker signing failed"))
            }
        }
    }

    /// Forget and close a session. Returns false if it was not logged in.
    pub async fn logout(&self, session_id: &str) -> bool {
        let removed = self.registry.remove_and_close(session_id).await;
        if removed {
            self.audit.lock().await.record(audit::LOGOUT, session_id, "");
        }
        removed
    }

    pub async fn sweep(&self, max_idle: Duration) -> usize {
        let evicted = self.registry.evict_idle(max_idle).await;
        info!(evicted, live = self.registry.len(), "Session sweep finished");
        evicted
    }

    /// Close every session.
    pub async fn shutdown(&self) {
        if self.registry.is_empty() {
            return;
        }
        let closed = self.registry.evict_idle(Duration::ZERO).await;
        info!(closed, "Closed all bunker sessions");
    }
}
