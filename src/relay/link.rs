//! One persistent socket to one relay

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use nostr::{ClientMessage, JsonUtil, RelayMessage, RelayUrl};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};

use super::TransportError;

const OUTBOUND_BUFFER: usize = 64;
const INBOUND_BUFFER: usize = 256;

/// Opens relay links. The session only ever talks to relays through this.
#[async_trait]
pub trait RelayDialer: Send + Sync {
    async fn dial(&self, url: &RelayUrl) -> Result<RelayLink, TransportError>;
}

/// Dial, giving up at `deadline`.
pub async fn dial_before(
    dialer: &dyn RelayDialer,
    url: &RelayUrl,
    deadline: Instant,
) -> Result<RelayLink, TransportError> {
    match tokio::time::timeout_at(deadline, dialer.dial(url)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::DialTimeout(url.clone())),
    }
}

/// A connected relay.
///
/// Outbound frames go through a channel to a pump task that owns the socket,
/// so `send` only needs `&self` and many callers can share one link.
/// The inbound side can be taken exactly once with [`RelayLink::messages`].
pub struct RelayLink {
    url: RelayUrl,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    inbound: Mutex<Option<mpsc::Receiver<String>>>,
    closed: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl RelayLink {
    /// Build a link from raw text-frame channels.
    ///
    /// `pump` is the task driving the underlying socket, aborted on close.
    pub fn from_channels(
        url: RelayUrl,
        outbound: mpsc::Sender<String>,
        inbound: mpsc::Receiver<String>,
        pump: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            url,
            outbound: Mutex::new(Some(outbound)),
            inbound: Mutex::new(Some(inbound)),
            closed: AtomicBool::new(false),
            pump: Mutex::new(pump),
        }
    }

    pub fn url(&self) -> &RelayUrl {
        &self.url
    }

    pub fn is_closed(&self) -> bool {
        self.sender().map_or(true, |sender| sender.is_closed())
    }

    fn sender(&self) -> Option<mpsc::Sender<String>> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.outbound.lock().ok()?.clone()
    }

    pub async fn send(&self, message: &ClientMessage<'_>) -> Result<(), TransportError> {
        let sender = self
            .sender()
            .ok_or_else(|| TransportError::Closed(self.url.clone()))?;
        let text = message
            .try_as_json()
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        sender
            .send(text)
            .await
            .map_err(|_| TransportError::Closed(self.url.clone()))
    }

    /// Inbound frame stream. Returns `None` if it was already taken.
    pub fn messages(&self) -> Option<RelayMessages> {
        let mut inbound = self.inbound.lock().ok()?;
        inbound.take().map(|rx| RelayMessages {
            url: self.url.clone(),
            rx,
        })
    }

    /// Drop the link at once. Queued frames may be lost.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.take_sender();
        if let Some(pump) = self.take_pump() {
            pump.abort();
        }
        debug!(relay = %self.url, "Relay link closed");
    }

    /// Stop accepting frames and wait until the pump has written everything
    /// already queued and shut the socket. The pump is aborted at `deadline`.
    pub async fn finish(&self, deadline: Instant) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.take_sender();
        if let Some(mut pump) = self.take_pump() {
            if tokio::time::timeout_at(deadline, &mut pump).await.is_err() {
                warn!(relay = %self.url, "Relay link did not flush before the deadline");
                pump.abort();
            }
        }
        debug!(relay = %self.url, "Relay link finished");
    }

    fn take_sender(&self) {
        if let Ok(mut outbound) = self.outbound.lock() {
            outbound.take();
        }
    }

    fn take_pump(&self) -> Option<JoinHandle<()>> {
        self.pump.lock().ok()?.take()
    }
}

impl Drop for RelayLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Parsed inbound messages from one relay. Malformed ones are skipped.
pub struct RelayMessages {
    url: RelayUrl,
    rx: mpsc::Receiver<String>,
}

impl RelayMessages {
    pub async fn next(&mut self) -> Option<RelayMessage<'static>> {
        loop {
            let text = self.rx.recv().await?;
            match RelayMessage::from_json(&text) {
                Ok(frame) => return Some(frame),
                Err(e) => {
                    warn!(relay = %self.url, error = %e, "Skipping malformed relay frame");
                }
            }
        }
    }
}

/// Dials relays over WebSocket.
#[derive(Debug, Default, Clone)]
pub struct WebSocketDialer;

#[async_trait]
impl RelayDialer for WebSocketDialer {
    async fn dial(&self, url: &RelayUrl) -> Result<RelayLink, TransportError> {
        debug!(relay = %url, "Dialing relay");

        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Dial {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<String>(INBOUND_BUFFER);
        let relay = url.clone();

        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    // Queued frames are written before anything is read.
                    biased;
                    outgoing = out_rx.recv() => match outgoing {
                        Some(text) => {
                            if let Err(e) = sink.send(Message::Text(text)).await {
                                warn!(relay = %relay, error = %e, "Relay send failed");
                                break;
                            }
                        }
                        None => break,
                    },
                    incoming = stream.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if in_tx.send(text).await.is_err() {
                                break;
                            }
                        }
                        // Pong is handled automatically by tungstenite
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(relay = %relay, error = %e, "Relay socket error");
                            break;
                        }
                    },
                }
            }
            let _ = sink.close().await;
            debug!(relay = %relay, "Relay pump stopped");
        });

        debug!(relay = %url, "Relay connected");
        Ok(RelayLink::from_channels(url.clone(), out_tx, in_rx, Some(pump)))
    }
}
