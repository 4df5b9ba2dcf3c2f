//! In-process relays and a scripted remote signer for tests.
//!
//! [`MemoryRelays`] hands out [`RelayLink`]s backed by tokio channels. Each
//! link is served by a small relay task that answers `REQ`/`EVENT`/`CLOSE` and
//! forwards NIP-46 requests to a shared [`FakeBunker`]. The bunker decrypts
//! with the real NIP-44 code and broadcasts its replies to every relay, so a
//! session connected through several relays sees the same duplicates it would
//! see on the public network.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nostr::filter::MatchEventOptions;
use nostr::{
    ClientMessage, Event, EventBuilder, Filter, JsonUtil, Keys, Kind, RelayMessage, RelayUrl,
    SubscriptionId, Tag, TagKind, Timestamp,
};
use tokio::sync::{broadcast, mpsc};

use super::rpc::{EventTemplate, RequestMessage, ResponseMessage, AUTH_URL_RESULT};
use crate::nip44::{self, ConversationKey};
use crate::relay::{RelayDialer, RelayLink, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayMode {
    #[default]
    Normal,
    /// Dialing fails
    Down,
    /// Every forwarded event is delivered twice
    Duplicate,
    /// Accepts frames and never answers
    Silent,
    /// Answers `OK false` to every event and drops it
    RejectEvents,
}

#[derive(Debug, Clone, Default)]
pub struct FakeBunkerConfig {
    /// Required second `connect` param
    pub secret: Option<String>,
    /// Answer `connect` with this error
    pub reject_connect: Option<String>,
    /// Encrypt replies under an unrelated key
    pub wrong_key: bool,
    /// Send an `auth_url` challenge before every real reply
    pub auth_url: Option<String>,
    /// Buffer this many `sign_event` replies, then release them newest first
    pub hold_sign_replies: usize,
    /// Methods that never get an answer
    pub silent_methods: Vec<&'static str>,
    /// Sign requested events with a random key instead of the user's
    pub sign_as_other: bool,
}

pub struct FakeBunker {
    pub signer_keys: Keys,
    pub user_keys: Keys,
    config: FakeBunkerConfig,
    seen: Mutex<HashSet<String>>,
    held: Mutex<Vec<Event>>,
    methods: Mutex<Vec<String>>,
    replies: broadcast::Sender<Event>,
}

impl FakeBunker {
    pub fn new(config: FakeBunkerConfig) -> Self {
        let (replies, _) = broadcast::channel(256);
        Self {
            signer_keys: Keys::generate(),
            user_keys: Keys::generate(),
            config,
            seen: Mutex::new(HashSet::new()),
            held: Mutex::new(Vec::new()),
            methods: Mutex::new(Vec::new()),
            replies,
        }
    }

    /// Methods handled so far, once per request id.
    pub fn methods(&self) -> Vec<String> {
        self.methods.lock().unwrap().clone()
    }

    /// `bunker://` string pointing at this signer through `relays`.
    pub fn uri(&self, relays: &[&str]) -> String {
        let mut uri = format!("bunker://{}?", self.signer_keys.public_key().to_hex());
        let params: Vec<String> = relays.iter().map(|r| format!("relay={}", r)).collect();
        uri.push_str(&params.join("&"));
        if let Some(secret) = &self.config.secret {
            uri.push_str(&format!("&secret={}", secret));
        }
        uri
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.replies.subscribe()
    }

    fn handle(&self, request: &Event) {
        if request.kind != Kind::NostrConnect
            || !p_tags(request).contains(&self.signer_keys.public_key().to_hex())
        {
            return;
        }
        let Ok(key) = ConversationKey::between(&self.signer_keys, &request.pubkey) else {
            return;
        };
        let Ok(plaintext) = nip44::decrypt(&request.content, key.as_bytes()) else {
            return;
        };
        let Ok(message) = serde_json::from_slice::<RequestMessage>(&plaintext) else {
            return;
        };
        if !self.seen.lock().unwrap().insert(message.id.clone()) {
            return;
        }
        self.methods.lock().unwrap().push(message.method.clone());
        if self.config.silent_methods.contains(&message.method.as_str()) {
            return;
        }

        if let Some(url) = &self.config.auth_url {
            let challenge = ResponseMessage {
                id: message.id.clone(),
                result: Some(AUTH_URL_RESULT.into()),
                error: Some(url.clone()),
            };
            self.emit(self.wrap(&challenge, request));
        }

        let response = self.respond(&message);
        let reply = self.wrap(&response, request);
        if message.method == "sign_event" && self.config.hold_sign_replies > 0 {
            let mut held = self.held.lock().unwrap();
            held.push(reply);
            if held.len() >= self.config.hold_sign_replies {
                for reply in held.drain(..).rev() {
                    self.emit(reply);
                }
            }
        } else {
            self.emit(reply);
        }
    }

    fn respond(&self, message: &RequestMessage) -> ResponseMessage {
        let ok = |result: String| ResponseMessage {
            id: message.id.clone(),
            result: Some(result),
            error: None,
        };
        let fail = |error: &str| ResponseMessage {
            id: message.id.clone(),
            result: None,
            error: Some(error.to_string()),
        };

        match message.method.as_str() {
            "connect" => {
                if let Some(reason) = &self.config.reject_connect {
                    return fail(reason);
                }
                if self.config.secret.is_some() && message.params.get(1) != self.config.secret.as_ref() {
                    return fail("invalid secret");
                }
                ok("ack".into())
            }
            "get_public_key" => ok(self.user_keys.public_key().to_hex()),
            "ping" => ok("pong".into()),
            "sign_event" => {
                let Some(template) = message
                    .params
                    .first()
                    .and_then(|p| serde_json::from_str::<EventTemplate>(p).ok())
                else {
                    return fail("invalid event template");
                };
                let keys = if self.config.sign_as_other {
                    Keys::generate()
                } else {
                    self.user_keys.clone()
                };
                ok(serde_json::to_string(&sign_template(&template, &keys)).unwrap())
            }
            other => fail(&format!("unsupported method {}", other)),
        }
    }

    fn wrap(&self, response: &ResponseMessage, request: &Event) -> Event {
        let key = if self.config.wrong_key {
            ConversationKey::between(&Keys::generate(), &request.pubkey).unwrap()
        } else {
            ConversationKey::between(&self.signer_keys, &request.pubkey).unwrap()
        };
        let plaintext = serde_json::to_string(response).unwrap();
        let content = nip44::encrypt(plaintext.as_bytes(), key.as_bytes()).unwrap();
        EventBuilder::new(Kind::NostrConnect, content)
            .tag(Tag::public_key(request.pubkey))
            .sign_with_keys(&self.signer_keys)
            .unwrap()
    }

    fn emit(&self, reply: Event) {
        let _ = self.replies.send(reply);
    }
}

pub fn sign_template(template: &EventTemplate, keys: &Keys) -> Event {
    let tags = template.tags.iter().filter_map(|tag| {
        let (name, values) = tag.split_first()?;
        Some(Tag::custom(TagKind::custom(name.clone()), values.to_vec()))
    });
    EventBuilder::new(Kind::from(template.kind), template.content.clone())
        .tags(tags)
        .custom_created_at(Timestamp::from(template.created_at))
        .sign_with_keys(keys)
        .unwrap()
}

fn p_tags(event: &Event) -> Vec<String> {
    event
        .tags
        .iter()
        .filter_map(|tag| match tag.as_slice() {
            [name, value, ..] if name == "p" => Some(value.clone()),
            _ => None,
        })
        .collect()
}

/// Dialer for in-memory relays, all fronting the same [`FakeBunker`].
pub struct MemoryRelays {
    bunker: Arc<FakeBunker>,
    modes: Mutex<HashMap<String, RelayMode>>,
    received: Arc<Mutex<Vec<(String, Event)>>>,
    closed: Arc<Mutex<Vec<(String, SubscriptionId)>>>,
}

impl MemoryRelays {
    pub fn new(bunker: Arc<FakeBunker>) -> Self {
        Self {
            bunker,
            modes: Mutex::new(HashMap::new()),
            received: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Relays with an idle bunker behind them, for plain publishing.
    pub fn standalone() -> Self {
        Self::new(Arc::new(FakeBunker::new(FakeBunkerConfig::default())))
    }

    pub fn set_mode(&self, url: &str, mode: RelayMode) {
        let key = RelayUrl::parse(url).unwrap().to_string();
        self.modes.lock().unwrap().insert(key, mode);
    }

    /// Every event a relay accepted, with the relay it arrived on.
    pub fn received_events(&self) -> Vec<(String, Event)> {
        self.received.lock().unwrap().clone()
    }

    /// Subscriptions a client ended with `CLOSE`, with the relay it was sent to.
    pub fn closed_subscriptions(&self) -> Vec<(String, SubscriptionId)> {
        self.closed.lock().unwrap().clone()
    }
}

#[async_trait]
impl RelayDialer for MemoryRelays {
    async fn dial(&self, url: &RelayUrl) -> Result<RelayLink, TransportError> {
        let mode = self
            .modes
            .lock()
            .unwrap()
            .get(&url.to_string())
            .copied()
            .unwrap_or_default();
        if mode == RelayMode::Down {
            return Err(TransportError::Dial {
                url: url.clone(),
                reason: "connection refused".into(),
            });
        }

        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(256);
        let relay = MemoryRelay {
            url: url.to_string(),
            mode,
            bunker: Arc::clone(&self.bunker),
            replies: self.bunker.subscribe(),
            received: Arc::clone(&self.received),
            closed: Arc::clone(&self.closed),
            subscriptions: Vec::new(),
        };
        let task = tokio::spawn(relay.run(out_rx, in_tx));
        Ok(RelayLink::from_channels(url.clone(), out_tx, in_rx, Some(task)))
    }
}

struct MemoryRelay {
    url: String,
    mode: RelayMode,
    bunker: Arc<FakeBunker>,
    replies: broadcast::Receiver<Event>,
    received: Arc<Mutex<Vec<(String, Event)>>>,
    closed: Arc<Mutex<Vec<(String, SubscriptionId)>>>,
    subscriptions: Vec<(SubscriptionId, Vec<Filter>)>,
}

impl MemoryRelay {
    async fn run(mut self, mut from_client: mpsc::Receiver<String>, to_client: mpsc::Sender<String>) {
        loop {
            tokio::select! {
                // Client frames first, so a REQ is registered before replies to
                // requests published after it are forwarded.
                biased;
                frame = from_client.recv() => match frame {
                    Some(text) => {
                        if self.mode != RelayMode::Silent {
                            self.on_client_message(&text, &to_client).await;
                        }
                    }
                    None => break,
                },
                reply = self.replies.recv() => match reply {
                    Ok(event) => {
                        if self.mode != RelayMode::Silent {
                            self.forward(&event, &to_client).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    async fn on_client_message(&mut self, text: &str, to_client: &mpsc::Sender<String>) {
        let Ok(message) = ClientMessage::from_json(text) else {
            return;
        };
        match message {
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let subscription_id = subscription_id.into_owned();
                let filters = filters.into_iter().map(Cow::into_owned).collect();
                self.subscriptions.push((subscription_id.clone(), filters));
                reply(to_client, RelayMessage::eose(subscription_id)).await;
            }
            ClientMessage::Event(event) => {
                let event = event.into_owned();
                if self.mode == RelayMode::RejectEvents {
                    reply(to_client, RelayMessage::ok(event.id, false, "blocked: test relay")).await;
                    return;
                }
                self.received.lock().unwrap().push((self.url.clone(), event.clone()));
                reply(to_client, RelayMessage::ok(event.id, true, "")).await;
                self.bunker.handle(&event);
            }
            ClientMessage::Close(subscription_id) => {
                let subscription_id = subscription_id.into_owned();
                self.subscriptions.retain(|(id, _)| *id != subscription_id);
                self.closed.lock().unwrap().push((self.url.clone(), subscription_id));
            }
            _ => {}
        }
    }

    async fn forward(&self, event: &Event, to_client: &mpsc::Sender<String>) {
        let copies = if self.mode == RelayMode::Duplicate { 2 } else { 1 };
        for (subscription_id, filters) in &self.subscriptions {
            let wanted = filters
                .iter()
                .any(|filter| filter.match_event(event, MatchEventOptions::new()));
            if wanted {
                for _ in 0..copies {
                    reply(to_client, RelayMessage::event(subscription_id.clone(), event.clone())).await;
                }
            }
        }
    }
}

async fn reply(to_client: &mpsc::Sender<String>, message: RelayMessage<'_>) {
    let _ = to_client.send(message.as_json()).await;
}
