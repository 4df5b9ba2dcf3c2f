//! Length-obfuscating padding
//!
//! Plaintexts are prefixed with their big-endian `u16` length and zero-filled
//! up to a bucket boundary, so ciphertext sizes only reveal a coarse length class.

use super::Nip44Error;

pub const MIN_PLAINTEXT_SIZE: usize = 1;
pub const MAX_PLAINTEXT_SIZE: usize = 65535;

const MIN_PADDED_SIZE: usize = 32;
const LENGTH_PREFIX_SIZE: usize = 2;

/// Padded length for a plaintext of `unpadded_len` bytes.
///
/// Up to 32 bytes everything lands in one bucket. Beyond that the chunk size
/// is 32 until the next power of two exceeds 256, then `next_power / 8`.
pub fn padded_len(unpadded_len: usize) -> usize {
    if unpadded_len <= MIN_PADDED_SIZE {
        return MIN_PADDED_SIZE;
    }

    let next_power = 1usize << (usize::BITS - (unpadded_len - 1).leading_zeros());
    let chunk = if next_power <= 256 { 32 } else { next_power / 8 };

    chunk * ((unpadded_len - 1) / chunk + 1)
}

/// Prefix with the length and zero-pad to the bucket size.
pub fn pad(plaintext: &[u8]) -> Result<Vec<u8>, Nip44Error> {
    let unpadded_len = plaintext.len();
    if !(MIN_PLAINTEXT_SIZE..=MAX_PLAINTEXT_SIZE).contains(&unpadded_len) {
        return Err(Nip44Error::InvalidPlaintextLength(unpadded_len));
    }

    let mut padded = vec![0u8; LENGTH_PREFIX_SIZE + padded_len(unpadded_len)];
    padded[..LENGTH_PREFIX_SIZE].copy_from_slice(&(unpadded_len as u16).to_be_bytes());
    padded[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + unpadded_len].copy_from_slice(plaintext);

    Ok(padded)
}

/// Strip the prefix and padding.
///
/// Rejects a zero length, a length past the end of the buffer, and any buffer
/// whose total size is not the canonical padded size for the encoded length.
pub fn unpad(padded: &[u8]) -> Result<Vec<u8>, Nip44Error> {
    if padded.len() < LENGTH_PREFIX_SIZE {
        return Err(Nip44Error::InvalidPadding);
    }

    let unpadded_len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if unpadded_len == 0 || unpadded_len > padded.len() - LENGTH_PREFIX_SIZE {
        return Err(Nip44Error::InvalidPadding);
    }
    if padded.len() != LENGTH_PREFIX_SIZE + padded_len(unpadded_len) {
        return Err(Nip44Error::InvalidPadding);
    }

    Ok(padded[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + unpadded_len].to_vec())
}
