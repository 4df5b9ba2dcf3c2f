//! Conversation and per-message key derivation

use hkdf::Hkdf;
use nostr::secp256k1::{ecdh, PublicKey as CurvePoint, SecretKey as CurveScalar};
use nostr::{Keys, PublicKey};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::Nip44Error;

/// HKDF-extract salt fixed by the protocol
const SALT: &[u8] = b"nip44-v2";

pub const CONVERSATION_KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 32;

const CIPHER_KEY_SIZE: usize = 32;
const CIPHER_NONCE_SIZE: usize = 12;
const MAC_KEY_SIZE: usize = 32;
const MESSAGE_KEYS_SIZE: usize = CIPHER_KEY_SIZE + CIPHER_NONCE_SIZE + MAC_KEY_SIZE;

/// Long-lived secret shared by two correspondents.
///
/// `conversation_key(a, B) == conversation_key(b, A)`. Wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ConversationKey([u8; CONVERSATION_KEY_SIZE]);

impl ConversationKey {
    /// Derive between a nostr keypair and a peer's public key.
    pub fn between(local: &Keys, remote: &PublicKey) -> Result<Self, Nip44Error> {
        conversation_key(local.secret_key().as_secret_bytes(), remote.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; CONVERSATION_KEY_SIZE] {
        &self.0
    }
}

impl From<[u8; CONVERSATION_KEY_SIZE]> for ConversationKey {
    fn from(bytes: [u8; CONVERSATION_KEY_SIZE]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for ConversationKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConversationKey(..)")
    }
}

/// Keys for a single encrypt or decrypt call. Wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MessageKeys {
    pub cipher_key: [u8; CIPHER_KEY_SIZE],
    pub cipher_nonce: [u8; CIPHER_NONCE_SIZE],
    pub mac_key: [u8; MAC_KEY_SIZE],
}

/// ECDH between `local_secret` and the x-only `remote_pubkey`, then
/// HKDF-extract with the protocol salt over the shared x-coordinate.
pub fn conversation_key(
    local_secret: &[u8],
    remote_pubkey: &[u8],
) -> Result<ConversationKey, Nip44Error> {
    let scalar =
        CurveScalar::from_slice(local_secret).map_err(|_| Nip44Error::InvalidSecretKey)?;
    let point = parse_xonly(remote_pubkey)?;

    let mut shared_point = ecdh::shared_secret_point(&point, &scalar);
    let mut shared_x = [0u8; 32];
    shared_x.copy_from_slice(&shared_point[..32]);
    shared_point.zeroize();

    let (prk, _) = Hkdf::<Sha256>::extract(Some(SALT), &shared_x);
    shared_x.zeroize();

    let mut key = [0u8; CONVERSATION_KEY_SIZE];
    key.copy_from_slice(&prk);
    Ok(ConversationKey(key))
}

/// The y parity is not carried; try the even point first, then the odd one.
fn parse_xonly(xonly: &[u8]) -> Result<CurvePoint, Nip44Error> {
    if xonly.len() != 32 {
        return Err(Nip44Error::InvalidPublicKey);
    }

    let mut compressed = [0u8; 33];
    compressed[1..].copy_from_slice(xonly);

    compressed[0] = 0x02;
    if let Ok(point) = CurvePoint::from_slice(&compressed) {
        return Ok(point);
    }
    compressed[0] = 0x03;
    CurvePoint::from_slice(&compressed).map_err(|_| Nip44Error::InvalidPublicKey)
}

/// HKDF-expand the conversation key with the nonce as info into
/// cipher key (32) || cipher nonce (12) || mac key (32).
pub fn message_keys(conversation_key: &[u8], nonce: &[u8]) -> Result<MessageKeys, Nip44Error> {
    if conversation_key.len() != CONVERSATION_KEY_SIZE {
        return Err(Nip44Error::InvalidConversationKeyLength(
            conversation_key.len(),
        ));
    }
    if nonce.len() != NONCE_SIZE {
        return Err(Nip44Error::InvalidNonceLength(nonce.len()));
    }

    let hk = Hkdf::<Sha256>::from_prk(conversation_key)
        .map_err(|_| Nip44Error::InvalidConversationKeyLength(conversation_key.len()))?;
    let mut okm = Zeroizing::new([0u8; MESSAGE_KEYS_SIZE]);
    hk.expand(nonce, &mut okm[..])
        .map_err(|_| Nip44Error::InvalidConversationKeyLength(conversation_key.len()))?;

    let mut keys = MessageKeys {
        cipher_key: [0u8; CIPHER_KEY_SIZE],
        cipher_nonce: [0u8; CIPHER_NONCE_SIZE],
        mac_key: [0u8; MAC_KEY_SIZE],
    };
    keys.cipher_key.copy_from_slice(&okm[..CIPHER_KEY_SIZE]);
    keys.cipher_nonce
        .copy_from_slice(&okm[CIPHER_KEY_SIZE..CIPHER_KEY_SIZE + CIPHER_NONCE_SIZE]);
    keys.mac_key
        .copy_from_slice(&okm[CIPHER_KEY_SIZE + CIPHER_NONCE_SIZE..]);
    Ok(keys)
}
