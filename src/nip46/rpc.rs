//! NIP-46 request and response messages
//!
//! These are the plaintexts carried inside NIP-44 envelopes. Requests are a
//! closed set of variants, and each knows how to interpret its own result
//! string, so a malformed answer is rejected at one place per method.

use nostr::{Event, PublicKey, Timestamp};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::error::SessionError;

/// Result string some signers return while waiting for out-of-band approval
pub const AUTH_URL_RESULT: &str = "auth_url";
pub const ACK_RESULT: &str = "ack";
pub const PONG_RESULT: &str = "pong";

/// Unique per-request correlation id
pub fn new_request_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// The unsigned event handed to the bunker for signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTemplate {
    pub kind: u16,
    pub content: String,
    pub tags: Vec<Vec<String>>,
    pub created_at: u64,
}

impl EventTemplate {
    /// A kind-1 note stamped with the current time.
    pub fn text_note(content: impl Into<String>) -> Self {
        Self {
            kind: 1,
            content: content.into(),
            tags: Vec::new(),
            created_at: Timestamp::now().as_secs(),
        }
    }

    /// True if `event` is this template, signed.
    pub fn matches(&self, event: &Event) -> bool {
        event.kind.as_u16() == self.kind
            && event.content == self.content
            && event.created_at.as_secs() == self.created_at
            && serde_json::to_value(&event.tags).ok() == serde_json::to_value(&self.tags).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Connect {
        remote_signer: PublicKey,
        secret: Option<String>,
    },
    GetPublicKey,
    SignEvent(EventTemplate),
    Ping,
}

/// Typed result of a successful request
#[derive(Debug, Clone)]
pub enum Reply {
    Ack,
    PublicKey(PublicKey),
    SignedEvent(Box<Event>),
    Pong,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub id: String,
    pub method: String,
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What a response means, independent of which request it answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Result(String),
    Error(String),
    /// The signer wants the user to approve at this URL first
    AuthChallenge(String),
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::Connect { .. } => "connect",
            Request::GetPublicKey => "get_public_key",
            Request::SignEvent(_) => "sign_event",
            Request::Ping => "ping",
        }
    }

    fn params(&self) -> Result<Vec<String>, SessionError> {
        Ok(match self {
            Request::Connect {
                remote_signer,
                secret,
            } => {
                let mut params = vec![remote_signer.to_hex()];
                if let Some(secret) = secret {
                    params.push(secret.clone());
                }
                params
            }
            Request::GetPublicKey | Request::Ping => Vec::new(),
            Request::SignEvent(template) => vec![serde_json::to_string(template)
                .map_err(|e| SessionError::Encode(e.to_string()))?],
        })
    }

    pub fn to_message(&self, id: &str) -> Result<RequestMessage, SessionError> {
        Ok(RequestMessage {
            id: id.to_string(),
            method: self.method().to_string(),
            params: self.params()?,
        })
    }

    /// Interpret the `result` string of a successful response.
    pub fn interpret(&self, result: &str) -> Result<Reply, SessionError> {
        match self {
            Request::Connect { secret, .. } => {
                // Some signers echo the connection secret instead of "ack".
                if result == ACK_RESULT || secret.as_deref() == Some(result) {
                    Ok(Reply::Ack)
                } else {
                    Err(SessionError::UnexpectedResponse(
                        "connect was not acknowledged".into(),
                    ))
                }
            }
            Request::GetPublicKey => PublicKey::from_hex(result)
                .map(Reply::PublicKey)
                .map_err(|_| {
                    SessionError::UnexpectedResponse("get_public_key returned an invalid key".into())
                }),
            Request::SignEvent(_) => serde_json::from_str::<Event>(result)
                .map(|event| Reply::SignedEvent(Box::new(event)))
                .map_err(|e| SessionError::InvalidEvent(e.to_string())),
            Request::Ping => {
                if result == PONG_RESULT {
                    Ok(Reply::Pong)
                } else {
                    Err(SessionError::UnexpectedResponse(
                        "ping was not answered with pong".into(),
                    ))
                }
            }
        }
    }
}

impl ResponseMessage {
    pub fn outcome(&self) -> Outcome {
        let error = self.error.clone().filter(|e| !e.is_empty());
        match (self.result.as_deref(), error) {
            (Some(AUTH_URL_RESULT), Some(url)) => Outcome::AuthChallenge(url),
            (_, Some(error)) => Outcome::Error(error),
            (Some(result), None) => Outcome::Result(result.to_string()),
            (None, None) => Outcome::Error("empty response".into()),
        }
    }
}
