//! Versioned encrypt-then-MAC envelope

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use super::keys::{message_keys, NONCE_SIZE};
use super::padding::{pad, unpad};
use super::Nip44Error;

type HmacSha256 = Hmac<Sha256>;

pub const VERSION: u8 = 2;

/// Leading character reserved for future, non-base64 encodings
const FUTURE_VERSION_MARKER: char = '#';
const MAC_SIZE: usize = 32;
/// version + nonce + smallest padded plaintext (2 + 32) + mac
pub const MIN_PAYLOAD_SIZE: usize = 99;
/// version + nonce + largest padded plaintext (2 + 65536) + mac
pub const MAX_PAYLOAD_SIZE: usize = 65603;

/// Encrypt under a fresh random nonce.
pub fn encrypt(plaintext: &[u8], conversation_key: &[u8]) -> Result<String, Nip44Error> {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    encrypt_with_nonce(plaintext, conversation_key, &nonce)
}

/// Encrypt with a caller-supplied nonce.
///
/// The nonce must never repeat under the same conversation key; outside of
/// tests use [`encrypt`].
pub fn encrypt_with_nonce(
    plaintext: &[u8],
    conversation_key: &[u8],
    nonce: &[u8],
) -> Result<String, Nip44Error> {
    let keys = message_keys(conversation_key, nonce)?;
    let mut buf = Zeroizing::new(pad(plaintext)?);

    let mut cipher = ChaCha20::new(&keys.cipher_key.into(), &keys.cipher_nonce.into());
    cipher.apply_keystream(&mut buf);

    let mac = compute_mac(&keys.mac_key, nonce, &buf)?;

    let mut payload = Vec::with_capacity(1 + NONCE_SIZE + buf.len() + MAC_SIZE);
    payload.push(VERSION);
    payload.extend_from_slice(nonce);
    payload.extend_from_slice(&buf);
    payload.extend_from_slice(&mac);

    Ok(BASE64.encode(payload))
}

/// Verify and decrypt a base64 payload.
///
/// The MAC is checked before the ciphertext is touched, so a bad payload
/// never yields partial plaintext.
pub fn decrypt(payload: &str, conversation_key: &[u8]) -> Result<Vec<u8>, Nip44Error> {
    if payload.starts_with(FUTURE_VERSION_MARKER) {
        return Err(Nip44Error::UnsupportedVersion);
    }

    let data = BASE64
        .decode(payload)
        .map_err(|_| Nip44Error::InvalidBase64)?;
    if !(MIN_PAYLOAD_SIZE..=MAX_PAYLOAD_SIZE).contains(&data.len()) {
        return Err(Nip44Error::InvalidPayloadSize(data.len()));
    }
    if data[0] != VERSION {
        return Err(Nip44Error::UnknownVersion(data[0]));
    }

    let nonce = &data[1..1 + NONCE_SIZE];
    let ciphertext = &data[1 + NONCE_SIZE..data.len() - MAC_SIZE];
    let mac = &data[data.len() - MAC_SIZE..];

    let keys = message_keys(conversation_key, nonce)?;

    let mut verifier = new_mac(&keys.mac_key)?;
    verifier.update(nonce);
    verifier.update(ciphertext);
    verifier
        .verify_slice(mac)
        .map_err(|_| Nip44Error::InvalidMac)?;

    let mut padded = Zeroizing::new(ciphertext.to_vec());
    let mut cipher = ChaCha20::new(&keys.cipher_key.into(), &keys.cipher_nonce.into());
    cipher.apply_keystream(&mut padded);

    unpad(&padded).map_err(|_| Nip44Error::InvalidPadding)
}

fn new_mac(key: &[u8]) -> Result<HmacSha256, Nip44Error> {
    // HMAC accepts keys of any length; the error arm is unreachable for 32 bytes.
    <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| Nip44Error::InvalidConversationKeyLength(key.len()))
}

/// HMAC-SHA256 over `aad || message`
fn compute_mac(key: &[u8], aad: &[u8], message: &[u8]) -> Result<[u8; MAC_SIZE], Nip44Error> {
    let mut mac = new_mac(key)?;
    mac.update(aad);
    mac.update(message);
    Ok(mac.finalize().into_bytes().into())
}
