//! One NIP-46 session with a remote signer
//!
//! A session owns an ephemeral local keypair, one link per reachable relay,
//! and a dispatcher that turns inbound kind-24133 events into responses for
//! pending requests. Every request is published on every link; the first
//! valid response for an id wins and later copies are dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use nostr::{
    ClientMessage, Event, EventBuilder, Filter, Keys, Kind, PublicKey, RelayMessage, RelayUrl,
    SubscriptionId, Tag, Timestamp,
};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::error::SessionError;
use super::rpc::{new_request_id, EventTemplate, Outcome, Reply, Request, ResponseMessage};
use super::uri::BunkerUri;
use crate::nip44::{self, ConversationKey, Nip44Error};
use crate::relay::{dial_before, RelayDialer, RelayLink, RelayMessages};

/// How far back the response subscription reaches, to absorb clock skew
const SUBSCRIPTION_LOOKBACK_SECS: u64 = 10;
/// Time given to relays to receive `CLOSE` when a session ends
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Called with the URL when the signer asks the user to approve out of band.
pub type AuthUrlHandler = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unconnected,
    Connecting,
    Connected,
    Closed,
}

enum Phase {
    Unconnected,
    Connecting,
    Connected {
        channel: Arc<Channel>,
        user_pubkey: PublicKey,
    },
    Closed,
}

pub struct BunkerSession {
    id: String,
    uri: BunkerUri,
    dialer: Arc<dyn RelayDialer>,
    phase: Mutex<Phase>,
    last_used: Mutex<Instant>,
    closing: Notify,
    auth_url_handler: Option<AuthUrlHandler>,
}

impl BunkerSession {
    pub fn new(uri: BunkerUri, dialer: Arc<dyn RelayDialer>) -> Self {
        let mut id = [0u8; 32];
        OsRng.fill_bytes(&mut id);
        Self {
            id: hex::encode(id),
            uri,
            dialer,
            phase: Mutex::new(Phase::Unconnected),
            last_used: Mutex::new(Instant::now()),
            closing: Notify::new(),
            auth_url_handler: None,
        }
    }

    pub fn with_auth_url_handler(mut self, handler: AuthUrlHandler) -> Self {
        self.auth_url_handler = Some(handler);
        self
    }

    /// Opaque handle for this session
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn uri(&self) -> &BunkerUri {
        &self.uri
    }

    pub fn state(&self) -> SessionState {
        match &*self.lock_phase() {
            Phase::Unconnected => SessionState::Unconnected,
            Phase::Connecting => SessionState::Connecting,
            Phase::Connected { .. } => SessionState::Connected,
            Phase::Closed => SessionState::Closed,
        }
    }

    /// The key that appears on signed events, once connected.
    pub fn user_pubkey(&self) -> Option<PublicKey> {
        match &*self.lock_phase() {
            Phase::Connected { user_pubkey, .. } => Some(*user_pubkey),
            _ => None,
        }
    }

    pub fn idle_for(&self) -> Duration {
        let last_used = *self.last_used.lock().unwrap_or_else(|e| e.into_inner());
        Instant::now().saturating_duration_since(last_used)
    }

    /// Open relay links and run the `connect` handshake.
    ///
    /// Relays that fail to dial are skipped as long as one succeeds. A failed
    /// handshake closes the session.
    pub async fn connect(&self, deadline: Instant) -> Result<PublicKey, SessionError> {
        {
            let mut phase = self.lock_phase();
            match &*phase {
                Phase::Unconnected => *phase = Phase::Connecting,
                Phase::Connecting => return Err(SessionError::InvalidState("connecting")),
                Phase::Connected { .. } => return Err(SessionError::InvalidState("connected")),
                Phase::Closed => return Err(SessionError::InvalidState("closed")),
            }
        }

        // Only one connect can be in flight, so a stored permit always
        // belongs to it.
        let established = tokio::select! {
            result = self.establish(deadline) => result,
            _ = self.closing.notified() => Err(SessionError::Cancelled),
        };

        let mut phase = self.lock_phase();
        match established {
            Ok((channel, user_pubkey)) if matches!(*phase, Phase::Connecting) => {
                *phase = Phase::Connected {
                    channel,
                    user_pubkey,
                };
                drop(phase);
                self.touch();
                info!(session_id = %self.short_id(), user = %user_pubkey, "Bunker session connected");
                Ok(user_pubkey)
            }
            // Closed while the handshake was in flight. Dropping the channel
            // tears it down.
            Ok(_) => Err(SessionError::Cancelled),
            Err(e) => {
                *phase = Phase::Closed;
                warn!(session_id = %self.short_id(), error = %e, "Bunker connect failed");
                Err(e)
            }
        }
    }

    async fn establish(&self, deadline: Instant) -> Result<(Arc<Channel>, PublicKey), SessionError> {
        let keys = Keys::generate();
        let conversation_key = ConversationKey::between(&keys, &self.uri.remote_signer)?;

        let dials = self
            .uri
            .relays
            .iter()
            .map(|relay| dial_before(self.dialer.as_ref(), relay, deadline));
        let mut links = Vec::new();
        let mut failures = Vec::new();
        for result in join_all(dials).await {
            match result {
                Ok(link) => links.push(Arc::new(link)),
                Err(e) => {
                    warn!(error = %e, "Skipping unreachable bunker relay");
                    failures.push(e);
                }
            }
        }
        if links.is_empty() {
            return Err(SessionError::NoRelayReachable(failures));
        }

        let dispatcher = Arc::new(Dispatcher::new(
            keys.public_key(),
            self.uri.remote_signer,
            conversation_key,
            self.auth_url_handler.clone(),
        ));
        let channel = Arc::new(Channel::open(keys, dispatcher, links).await);

        let request = Request::Connect {
            remote_signer: self.uri.remote_signer,
            secret: self.uri.secret.clone(),
        };
        channel.call(&request, deadline, "connection failed").await?;

        let user_pubkey = match self.uri.user_pubkey {
            Some(user_pubkey) => user_pubkey,
            None => match channel
                .call(&Request::GetPublicKey, deadline, "connection failed")
                .await?
            {
                Reply::PublicKey(user_pubkey) => user_pubkey,
                other => {
                    return Err(SessionError::UnexpectedResponse(format!(
                        "expected a public key, got {:?}",
                        other
                    )))
                }
            },
        };

        Ok((channel, user_pubkey))
    }

    /// Ask the bunker to sign `template`.
    ///
    /// The returned event is checked: valid signature, authored by the
    /// session's user, and identical to the template. A failed request leaves
    /// the session connected.
    pub async fn sign_event(
        &self,
        template: EventTemplate,
        deadline: Instant,
    ) -> Result<Event, SessionError> {
        let (channel, user_pubkey) = self.connected()?;
        self.touch();

        let reply = channel
            .call(&Request::SignEvent(template.clone()), deadline, "signing failed")
            .await?;
        let Reply::SignedEvent(event) = reply else {
            return Err(SessionError::UnexpectedResponse(
                "sign_event did not return an event".into(),
            ));
        };

        event
            .verify()
            .map_err(|e| SessionError::InvalidEvent(e.to_string()))?;
        if event.pubkey != user_pubkey {
            return Err(SessionError::InvalidEvent(format!(
                "signed by {} instead of {}",
                event.pubkey, user_pubkey
            )));
        }
        if !template.matches(&event) {
            return Err(SessionError::InvalidEvent(
                "signed event does not match the request".into(),
            ));
        }

        debug!(session_id = %self.short_id(), event_id = %event.id, "Event signed by bunker");
        Ok(*event)
    }

    /// Round-trip `get_public_key` on an open session.
    pub async fn get_public_key(&self, deadline: Instant) -> Result<PublicKey, SessionError> {
        let (channel, _) = self.connected()?;
        self.touch();
        match channel
            .call(&Request::GetPublicKey, deadline, "get_public_key failed")
            .await?
        {
            Reply::PublicKey(user_pubkey) => Ok(user_pubkey),
            other => Err(SessionError::UnexpectedResponse(format!(
                "expected a public key, got {:?}",
                other
            ))),
        }
    }

    pub async fn ping(&self, deadline: Instant) -> Result<(), SessionError> {
        let (channel, _) = self.connected()?;
        self.touch();
        channel.call(&Request::Ping, deadline, "ping failed").await?;
        Ok(())
    }

    /// Close every link and cancel pending requests. Idempotent.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.lock_phase(), Phase::Closed);
        match previous {
            Phase::Connected { channel, .. } => {
                channel.shutdown().await;
                info!(session_id = %self.short_id(), "Bunker session closed");
            }
            Phase::Connecting => self.closing.notify_one(),
            Phase::Unconnected | Phase::Closed => {}
        }
    }

    fn connected(&self) -> Result<(Arc<Channel>, PublicKey), SessionError> {
        match &*self.lock_phase() {
            Phase::Connected {
                channel,
                user_pubkey,
            } => Ok((Arc::clone(channel), *user_pubkey)),
            _ => Err(SessionError::NotConnected),
        }
    }

    fn lock_phase(&self) -> std::sync::MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn short_id(&self) -> &str {
        &self.id[..16]
    }
}

/// Links, keys and reader tasks of a connected (or connecting) session
struct Channel {
    keys: Keys,
    dispatcher: Arc<Dispatcher>,
    links: Vec<Arc<RelayLink>>,
    subscription_id: SubscriptionId,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl Channel {
    /// Start a reader per link and subscribe to responses addressed to us.
    async fn open(keys: Keys, dispatcher: Arc<Dispatcher>, links: Vec<Arc<RelayLink>>) -> Self {
        let since = Timestamp::now().as_secs().saturating_sub(SUBSCRIPTION_LOOKBACK_SECS);
        let subscription_id = SubscriptionId::generate();
        let subscribe = ClientMessage::req(
            subscription_id.clone(),
            vec![Filter::new()
                .kind(Kind::NostrConnect)
                .pubkey(keys.public_key())
                .since(Timestamp::from(since))],
        );

        let mut readers = Vec::with_capacity(links.len());
        for link in &links {
            if let Some(messages) = link.messages() {
                readers.push(spawn_reader(
                    Arc::clone(&dispatcher),
                    link.url().clone(),
                    messages,
                ));
            }
            if let Err(e) = link.send(&subscribe).await {
                warn!(relay = %link.url(), error = %e, "Subscription failed");
            }
        }

        Self {
            keys,
            dispatcher,
            links,
            subscription_id,
            readers: Mutex::new(readers),
        }
    }

    /// Publish `request` on every link and wait for its response.
    async fn call(
        &self,
        request: &Request,
        deadline: Instant,
        context: &'static str,
    ) -> Result<Reply, SessionError> {
        let id = new_request_id();
        let message = request.to_message(&id)?;
        let plaintext = Zeroizing::new(
            serde_json::to_string(&message).map_err(|e| SessionError::Encode(e.to_string()))?,
        );
        let content = nip44::encrypt(plaintext.as_bytes(), self.dispatcher.conversation_key.as_bytes())?;
        let event = EventBuilder::new(Kind::NostrConnect, content)
            .tag(Tag::public_key(self.dispatcher.remote_signer))
            .sign_with_keys(&self.keys)
            .map_err(|e| SessionError::Encode(e.to_string()))?;

        let integrity_baseline = self.dispatcher.integrity_failures();
        // Dropping the guard, on any return or when this future is dropped,
        // removes the waiter.
        let (response, _pending) = self.dispatcher.register(&id);

        let message = ClientMessage::event(event);
        let open: Vec<&Arc<RelayLink>> = self.links.iter().filter(|link| !link.is_closed()).collect();
        let sends = join_all(open.iter().map(|link| link.send(&message))).await;
        let mut last_error = None;
        let mut published = 0;
        for (link, result) in open.iter().zip(sends) {
            match result {
                Ok(()) => published += 1,
                Err(e) => {
                    warn!(relay = %link.url(), error = %e, "Request not sent");
                    last_error = Some(e);
                }
            }
        }
        if published == 0 {
            return Err(last_error.map_or(SessionError::NotConnected, SessionError::Transport));
        }
        debug!(request_id = %id, method = request.method(), relays = published, "Request published");

        let response = match tokio::time::timeout_at(deadline, response).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(SessionError::Cancelled),
            Err(_) => {
                if let Some(err) = self.dispatcher.integrity_error_since(integrity_baseline) {
                    return Err(SessionError::Integrity(err));
                }
                return Err(SessionError::Timeout { context });
            }
        };

        match response.outcome() {
            Outcome::Result(result) => request.interpret(&result),
            Outcome::Error(error) => Err(SessionError::Rejected(error)),
            Outcome::AuthChallenge(_) => Err(SessionError::UnexpectedResponse(
                "auth challenge delivered as a response".into(),
            )),
        }
    }

    /// End the subscription on every relay, then tear the links down.
    async fn shutdown(&self) {
        self.dispatcher.cancel_all();
        let close = ClientMessage::close(self.subscription_id.clone());
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        join_all(self.links.iter().map(|link| async {
            if let Err(e) = link.send(&close).await {
                debug!(relay = %link.url(), error = %e, "Subscription not closed");
            }
            link.finish(deadline).await;
        }))
        .await;
        self.abort_readers();
    }

    fn abort_readers(&self) {
        if let Ok(mut readers) = self.readers.lock() {
            for reader in readers.drain(..) {
                reader.abort();
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        for link in &self.links {
            link.close();
        }
        self.abort_readers();
    }
}

fn spawn_reader(
    dispatcher: Arc<Dispatcher>,
    relay: RelayUrl,
    mut messages: RelayMessages,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = messages.next().await {
            match message {
                RelayMessage::Event { event, .. } => dispatcher.handle(&relay, &event),
                RelayMessage::Closed {
                    subscription_id,
                    message,
                } => {
                    warn!(relay = %relay, subscription = %subscription_id, reason = %message, "Relay closed the subscription");
                }
                RelayMessage::Notice(notice) => debug!(relay = %relay, notice = %notice, "Relay notice"),
                _ => {}
            }
        }
        debug!(relay = %relay, "Relay stream ended");
    })
}

#[derive(Default)]
struct IntegrityLog {
    count: u64,
    last: Option<Nip44Error>,
}

/// Matches inbound responses to pending requests.
struct Dispatcher {
    local: PublicKey,
    remote_signer: PublicKey,
    conversation_key: ConversationKey,
    pending: Mutex<HashMap<String, oneshot::Sender<ResponseMessage>>>,
    integrity: Mutex<IntegrityLog>,
    auth_url_handler: Option<AuthUrlHandler>,
}

impl Dispatcher {
    fn new(
        local: PublicKey,
        remote_signer: PublicKey,
        conversation_key: ConversationKey,
        auth_url_handler: Option<AuthUrlHandler>,
    ) -> Self {
        Self {
            local,
            remote_signer,
            conversation_key,
            pending: Mutex::new(HashMap::new()),
            integrity: Mutex::new(IntegrityLog::default()),
            auth_url_handler,
        }
    }

    fn register(&self, id: &str) -> (oneshot::Receiver<ResponseMessage>, PendingGuard<'_>) {
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(id.to_string(), tx);
        let guard = PendingGuard {
            dispatcher: self,
            id: id.to_string(),
        };
        (rx, guard)
    }

    fn forget(&self, id: &str) {
        self.lock_pending().remove(id);
    }

    /// Drop every waiter; their receivers see the session as cancelled.
    fn cancel_all(&self) {
        self.lock_pending().clear();
    }

    fn lock_pending(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<ResponseMessage>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn integrity_failures(&self) -> u64 {
        self.integrity.lock().map(|log| log.count).unwrap_or_default()
    }

    /// Last integrity failure recorded after `baseline`.
    ///
    /// Failures are counted per session, not per request: a MAC failure on
    /// any response during the wait is attributed to every request that
    /// times out in that window.
    fn integrity_error_since(&self, baseline: u64) -> Option<Nip44Error> {
        let log = self.integrity.lock().ok()?;
        if log.count > baseline {
            log.last.clone()
        } else {
            None
        }
    }

    fn record_integrity_failure(&self, err: Nip44Error) {
        if let Ok(mut log) = self.integrity.lock() {
            log.count += 1;
            log.last = Some(err);
        }
    }

    fn handle(&self, relay: &RelayUrl, event: &Event) {
        if event.kind != Kind::NostrConnect || event.pubkey != self.remote_signer {
            debug!(relay = %relay, author = %event.pubkey, "Ignoring foreign event");
            return;
        }
        if !is_addressed_to(event, &self.local) {
            debug!(relay = %relay, event_id = %event.id, "Ignoring event addressed elsewhere");
            return;
        }
        if let Err(e) = event.verify() {
            warn!(relay = %relay, event_id = %event.id, error = %e, "Dropping response with bad signature");
            return;
        }

        let plaintext = match nip44::decrypt(&event.content, self.conversation_key.as_bytes()) {
            Ok(plaintext) => Zeroizing::new(plaintext),
            Err(e) => {
                warn!(relay = %relay, event_id = %event.id, error = %e, "Dropping undecryptable response");
                if e.is_integrity() {
                    self.record_integrity_failure(e);
                }
                return;
            }
        };
        let response: ResponseMessage = match serde_json::from_slice(&plaintext) {
            Ok(response) => response,
            Err(e) => {
                warn!(relay = %relay, error = %e, "Dropping malformed response");
                return;
            }
        };

        if let Outcome::AuthChallenge(url) = response.outcome() {
            info!(request_id = %response.id, url = %url, "Bunker requires authorization");
            if let Some(handler) = &self.auth_url_handler {
                handler(&url);
            }
            return;
        }

        let waiter = self.lock_pending().remove(&response.id);
        match waiter {
            Some(waiter) => {
                debug!(relay = %relay, request_id = %response.id, "Response matched");
                let _ = waiter.send(response);
            }
            None => debug!(relay = %relay, request_id = %response.id, "Dropping duplicate or unknown response"),
        }
    }
}

/// Removes its request's waiter when dropped.
struct PendingGuard<'a> {
    dispatcher: &'a Dispatcher,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.dispatcher.forget(&self.id);
    }
}

fn is_addressed_to(event: &Event, recipient: &PublicKey) -> bool {
    let recipient = recipient.to_hex();
    event.tags.iter().any(|tag| match tag.as_slice() {
        [name, value, ..] => name == "p" && *value == recipient,
        _ => false,
    })
}
