//! BLAKE2s hashing, keyed MACs, the HMAC-BLAKE2s KDF chain, and
//! ChaCha20-Poly1305 with explicit counters.
//!
//! The AEAD nonce is 4 zero bytes followed by the little-endian counter, so a
//! receiver can decrypt packets in any order as long as it knows the counter.

use blake2::digest::consts::U16;
use blake2::digest::{KeyInit as MacKeyInit, Mac};
use blake2::{Blake2s256, Blake2sMac, Digest};
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};
use hmac::SimpleHmac;
use veil_core::{AEAD_TAG_SIZE, KEY_LEN, MAC_LEN};

pub const LABEL_MAC1: &[u8; 8] = b"mac1----";
pub const LABEL_COOKIE: &[u8; 8] = b"cookie--";

/// BLAKE2s-256 over the concatenation of `parts`.
pub fn hash(parts: &[&[u8]]) -> [u8; KEY_LEN] {
    let mut hasher = Blake2s256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Keyed BLAKE2s-128. Keys longer than 32 bytes are a programming error.
pub fn mac(key: &[u8], parts: &[&[u8]]) -> [u8; MAC_LEN] {
    let mut m = <Blake2sMac<U16> as MacKeyInit>::new_from_slice(key)
        .expect("BLAKE2s keys are at most 32 bytes");
    for part in parts {
        Mac::update(&mut m, part);
    }
    m.finalize().into_bytes().into()
}

/// HMAC-BLAKE2s-256.
pub fn hmac(key: &[u8], parts: &[&[u8]]) -> [u8; KEY_LEN] {
    let mut m = <SimpleHmac<Blake2s256> as MacKeyInit>::new_from_slice(key)
        .expect("HMAC accepts keys of any length");
    for part in parts {
        Mac::update(&mut m, part);
    }
    m.finalize().into_bytes().into()
}

/// HKDF with one output.
pub fn kdf1(chaining_key: &[u8; KEY_LEN], input: &[u8]) -> [u8; KEY_LEN] {
    let prk = hmac(chaining_key, &[input]);
    hmac(&prk, &[&[0x1]])
}

/// HKDF with two outputs.
pub fn kdf2(chaining_key: &[u8; KEY_LEN], input: &[u8]) -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    let prk = hmac(chaining_key, &[input]);
    let t1 = hmac(&prk, &[&[0x1]]);
    let t2 = hmac(&prk, &[&t1, &[0x2]]);
    (t1, t2)
}

/// HKDF with three outputs.
pub fn kdf3(
    chaining_key: &[u8; KEY_LEN],
    input: &[u8],
) -> ([u8; KEY_LEN], [u8; KEY_LEN], [u8; KEY_LEN]) {
    let prk = hmac(chaining_key, &[input]);
    let t1 = hmac(&prk, &[&[0x1]]);
    let t2 = hmac(&prk, &[&t1, &[0x2]]);
    let t3 = hmac(&prk, &[&t2, &[0x3]]);
    (t1, t2, t3)
}

/// AEAD failure; carries no detail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AeadError;

pub fn counter_nonce(counter: u64) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce.into()
}

/// Seal `plaintext` into `out[..plaintext.len() + 16]`.
pub fn seal(
    cipher: &ChaCha20Poly1305,
    counter: u64,
    aad: &[u8],
    plaintext: &[u8],
    out: &mut [u8],
) -> Result<usize, AeadError> {
    let total = plaintext.len() + AEAD_TAG_SIZE;
    let out = out.get_mut(..total).ok_or(AeadError)?;
    let (body, tag_out) = out.split_at_mut(plaintext.len());
    body.copy_from_slice(plaintext);
    let tag = cipher
        .encrypt_in_place_detached(&counter_nonce(counter), aad, body)
        .map_err(|_| AeadError)?;
    tag_out.copy_from_slice(&tag);
    Ok(total)
}

/// Open `ciphertext` (body followed by tag) into `out[..ciphertext.len() - 16]`.
pub fn open(
    cipher: &ChaCha20Poly1305,
    counter: u64,
    aad: &[u8],
    ciphertext: &[u8],
    out: &mut [u8],
) -> Result<usize, AeadError> {
    let body_len = ciphertext.len().checked_sub(AEAD_TAG_SIZE).ok_or(AeadError)?;
    let (body, tag) = ciphertext.split_at(body_len);
    let out = out.get_mut(..body_len).ok_or(AeadError)?;
    out.copy_from_slice(body);
    cipher
        .decrypt_in_place_detached(&counter_nonce(counter), aad, out, Tag::from_slice(tag))
        .map_err(|_| AeadError)?;
    Ok(body_len)
}

/// One-shot seal with a fresh cipher, as used by the handshake (counter 0).
pub fn seal_with_key(
    key: &[u8; KEY_LEN],
    aad: &[u8],
    plaintext: &[u8],
    out: &mut [u8],
) -> Result<usize, AeadError> {
    seal(&cipher(key), 0, aad, plaintext, out)
}

/// One-shot open with a fresh cipher, as used by the handshake (counter 0).
pub fn open_with_key(
    key: &[u8; KEY_LEN],
    aad: &[u8],
    ciphertext: &[u8],
    out: &mut [u8],
) -> Result<usize, AeadError> {
    open(&cipher(key), 0, aad, ciphertext, out)
}

pub fn cipher(key: &[u8; KEY_LEN]) -> ChaCha20Poly1305 {
    ChaCha20Poly1305::new(Key::from_slice(key))
}

/// Constant-time comparison of two byte strings.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (lhs, rhs) in a.iter().zip(b.iter()) {
        diff |= lhs ^ rhs;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_of_parts_equals_hash_of_concatenation() {
        assert_eq!(hash(&[b"ab", b"cd"]), hash(&[b"abcd"]));
        assert_ne!(hash(&[b"abcd"]), hash(&[b"abce"]));
    }

    #[test]
    fn test_mac_depends_on_key() {
        let a = mac(&[1u8; 32], &[b"message"]);
        let b = mac(&[2u8; 32], &[b"message"]);
        let c = mac(&[1u8; 16], &[b"message"]);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, mac(&[1u8; 32], &[b"mess", b"age"]));
    }

    #[test]
    fn test_kdf_outputs_chain() {
        let ck = [7u8; 32];
        let (a1, a2) = kdf2(&ck, b"input");
        let (b1, b2, b3) = kdf3(&ck, b"input");
        assert_eq!(a1, b1);
        assert_eq!(a2, b2);
        assert_eq!(kdf1(&ck, b"input"), a1);
        assert_ne!(b2, b3);
        assert_ne!(kdf1(&ck, b"other"), a1);
    }

    #[test]
    fn test_seal_open() {
        let c = cipher(&[3u8; 32]);
        let mut sealed = [0u8; 64];
        let n = seal(&c, 9, b"aad", b"hello", &mut sealed).unwrap();
        assert_eq!(n, 5 + AEAD_TAG_SIZE);

        let mut opened = [0u8; 64];
        let m = open(&c, 9, b"aad", &sealed[..n], &mut opened).unwrap();
        assert_eq!(&opened[..m], b"hello");
    }

    #[test]
    fn test_open_rejects_wrong_counter_or_aad() {
        let c = cipher(&[3u8; 32]);
        let mut sealed = [0u8; 32];
        let n = seal(&c, 1, b"aad", b"data", &mut sealed).unwrap();

        let mut out = [0u8; 32];
        assert_eq!(open(&c, 2, b"aad", &sealed[..n], &mut out), Err(AeadError));
        assert_eq!(open(&c, 1, b"bad", &sealed[..n], &mut out), Err(AeadError));
        assert_eq!(open(&c, 1, b"aad", &sealed[..10], &mut out), Err(AeadError));
    }

    #[test]
    fn test_seal_rejects_short_output() {
        let c = cipher(&[3u8; 32]);
        let mut out = [0u8; 19];
        assert_eq!(seal(&c, 0, &[], b"abcd", &mut out), Err(AeadError));
    }

    #[test]
    fn test_nonce_layout() {
        let nonce = counter_nonce(0x0102);
        assert_eq!(&nonce[..4], &[0, 0, 0, 0]);
        assert_eq!(&nonce[4..6], &[0x02, 0x01]);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"token123", b"token123"));
        assert!(constant_time_eq(b"", b""));
        assert!(!constant_time_eq(b"token123", b"token124"));
        assert!(!constant_time_eq(b"short", b"much_longer"));
    }
}
