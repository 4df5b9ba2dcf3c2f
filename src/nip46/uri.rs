//! bunker:// connection strings
//!
//! Format: `bunker://<remote-signer-pubkey>?relay=wss://...&relay=wss://...&secret=TOKEN`
//!
//! An optional `user=<hex>` parameter carries the user's public key when the
//! signer already knows it, which saves a `get_public_key` round trip.

use std::fmt;
use std::str::FromStr;

use nostr::{PublicKey, RelayUrl};
use url::form_urlencoded;
use url::Url;

pub const SCHEME: &str = "bunker";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BunkerUriError {
    #[error("invalid bunker URI: {0}")]
    Malformed(String),
    #[error("expected bunker:// URI, got {0}://")]
    WrongScheme(String),
    #[error("remote signer must be a 64-character hex public key")]
    InvalidRemoteSigner,
    #[error("bunker URI must include at least one relay")]
    MissingRelay,
    #[error("invalid relay URL: {0}")]
    InvalidRelay(String),
    #[error("invalid user public key")]
    InvalidUserPubkey,
}

/// A parsed connection string. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BunkerUri {
    pub remote_signer: PublicKey,
    /// Non-empty, in the order given, duplicates removed
    pub relays: Vec<RelayUrl>,
    pub secret: Option<String>,
    pub user_pubkey: Option<PublicKey>,
}

impl BunkerUri {
    pub fn parse(uri: &str) -> Result<Self, BunkerUriError> {
        let parsed = Url::parse(uri.trim()).map_err(|e| BunkerUriError::Malformed(e.to_string()))?;
        if parsed.scheme() != SCHEME {
            return Err(BunkerUriError::WrongScheme(parsed.scheme().to_string()));
        }

        let authority = parsed.host_str().ok_or(BunkerUriError::InvalidRemoteSigner)?;
        if authority.len() != 64 || !authority.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(BunkerUriError::InvalidRemoteSigner);
        }
        let remote_signer =
            PublicKey::from_hex(authority).map_err(|_| BunkerUriError::InvalidRemoteSigner)?;

        if !matches!(parsed.path(), "" | "/") {
            return Err(BunkerUriError::Malformed(format!(
                "unexpected path {}",
                parsed.path()
            )));
        }

        let mut relays: Vec<RelayUrl> = Vec::new();
        let mut secret = None;
        let mut user_pubkey = None;

        for (key, value) in parsed.query_pairs() {
            match &*key {
                "relay" => {
                    let relay = RelayUrl::parse(&*value)
                        .map_err(|_| BunkerUriError::InvalidRelay(value.to_string()))?;
                    if !relays.contains(&relay) {
                        relays.push(relay);
                    }
                }
                "secret" if !value.is_empty() => secret = Some(value.into_owned()),
                "user" => {
                    user_pubkey = Some(
                        PublicKey::from_hex(&*value)
                            .map_err(|_| BunkerUriError::InvalidUserPubkey)?,
                    );
                }
                _ => {}
            }
        }

        if relays.is_empty() {
            return Err(BunkerUriError::MissingRelay);
        }

        Ok(Self {
            remote_signer,
            relays,
            secret,
            user_pubkey,
        })
    }
}

impl FromStr for BunkerUri {
    type Err = BunkerUriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BunkerUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut query = form_urlencoded::Serializer::new(String::new());
        for relay in &self.relays {
            query.append_pair("relay", &relay.to_string());
        }
        if let Some(secret) = &self.secret {
            query.append_pair("secret", secret);
        }
        if let Some(user) = &self.user_pubkey {
            query.append_pair("user", &user.to_hex());
        }
        write!(
            f,
            "{}://{}?{}",
            SCHEME,
            self.remote_signer.to_hex(),
            query.finish()
        )
    }
}
