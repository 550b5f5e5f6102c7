/*!
Crypto things: sealing of spotify tokens at rest and signing
of session tokens.
*/
use ring::aead::BoundKey;

use crate::{Error, Result, CONFIG};

/// An encrypted value and the nonce it was sealed with, both hex encoded
/// for storage in text columns.
#[derive(Debug)]
pub struct Sealed {
    pub value: String,
    pub nonce: String,
}

/// ring requires an implementor of `NonceSequence`,
/// which is a wrapping trait around `ring::aead::Nonce`.
/// We have to make a wrapper that can pass ownership
/// of the nonce exactly once.
struct OneNonceSequence {
    inner: Option<ring::aead::Nonce>,
}
impl OneNonceSequence {
    fn new(inner: ring::aead::Nonce) -> Self {
        Self { inner: Some(inner) }
    }
}

impl ring::aead::NonceSequence for OneNonceSequence {
    fn advance(&mut self) -> std::result::Result<ring::aead::Nonce, ring::error::Unspecified> {
        self.inner.take().ok_or(ring::error::Unspecified)
    }
}

/// Return a `Vec` of secure random bytes of size `n`
fn rand_bytes(n: usize) -> Result<Vec<u8>> {
    use ring::rand::SecureRandom;
    let mut buf = vec![0; n];
    let sysrand = ring::rand::SystemRandom::new();
    sysrand
        .fill(&mut buf)
        .map_err(|_| Error::Crypto("error getting random bytes".to_string()))?;
    Ok(buf)
}

fn new_nonce() -> Result<Vec<u8>> {
    rand_bytes(12)
}

/// Encrypt `plaintext` with a fresh nonce and the application key.
///
/// Values are encrypted using AES_256_GCM with the 32-byte `ENC_KEY`
/// from the current environment.
pub fn seal(plaintext: &str) -> Result<Sealed> {
    let alg = &ring::aead::AES_256_GCM;
    let nonce_bytes = new_nonce()?;
    let nonce = ring::aead::Nonce::try_assume_unique_for_key(&nonce_bytes)
        .map_err(|_| Error::Crypto("encryption nonce not unique".to_string()))?;
    let nonce = OneNonceSequence::new(nonce);
    let key = ring::aead::UnboundKey::new(alg, CONFIG.enc_key.as_bytes())
        .map_err(|_| Error::Crypto("error building sealing key".to_string()))?;
    let mut key = ring::aead::SealingKey::new(key, nonce);
    let mut in_out = plaintext.as_bytes().to_vec();
    key.seal_in_place_append_tag(ring::aead::Aad::empty(), &mut in_out)
        .map_err(|_| Error::Crypto("failed encrypting bytes".to_string()))?;
    Ok(Sealed {
        value: hex::encode(&in_out),
        nonce: hex::encode(&nonce_bytes),
    })
}

/// Decrypt a `Sealed` value back to its plaintext.
pub fn open(sealed: &Sealed) -> Result<String> {
    let alg = &ring::aead::AES_256_GCM;
    let nonce_bytes = hex::decode(&sealed.nonce)
        .map_err(|_| Error::Crypto("nonce hex decode error".to_string()))?;
    let mut value = hex::decode(&sealed.value)
        .map_err(|_| Error::Crypto("value hex decode error".to_string()))?;
    let nonce = ring::aead::Nonce::try_assume_unique_for_key(&nonce_bytes)
        .map_err(|_| Error::Crypto("decryption nonce not unique".to_string()))?;
    let nonce = OneNonceSequence::new(nonce);
    let key = ring::aead::UnboundKey::new(alg, CONFIG.enc_key.as_bytes())
        .map_err(|_| Error::Crypto("error building opening key".to_string()))?;
    let mut key = ring::aead::OpeningKey::new(key, nonce);
    let out_slice = key
        .open_in_place(ring::aead::Aad::empty(), value.as_mut_slice())
        .map_err(|_| Error::Crypto("failed decrypting bytes".to_string()))?;
    String::from_utf8(out_slice.to_vec())
        .map_err(|_| Error::Crypto("decrypted bytes are not utf8".to_string()))
}

/// HMAC-SHA256 signature of `s`, hex encoded. Session cookie values are
/// stored in this form so a database leak doesn't leak usable tokens.
pub fn hmac_sign(s: &str) -> String {
    // using a 32 byte key
    let s_key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, &crate::CONFIG.enc_key.as_bytes());
    let tag = ring::hmac::sign(&s_key, s.as_bytes());
    hex::encode(&tag)
}

/// Return the SHA256 hash of `bytes`
pub fn hash(bytes: &[u8]) -> Vec<u8> {
    let alg = &ring::digest::SHA256;
    let digest = ring::digest::digest(alg, bytes);
    Vec::from(digest.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let sealed = seal("BQDtoken-value-123").expect("seal error");
        assert_ne!(sealed.value, "BQDtoken-value-123");
        let opened = open(&sealed).expect("open error");
        assert_eq!(opened, "BQDtoken-value-123");
    }

    #[test]
    fn seal_uses_fresh_nonces() {
        let a = seal("same-plaintext").expect("seal error");
        let b = seal("same-plaintext").expect("seal error");
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.value, b.value);
    }

    #[test]
    fn open_rejects_tampered_value() {
        let mut sealed = seal("secret").expect("seal error");
        let mut chars: Vec<char> = sealed.value.chars().collect();
        chars[0] = if chars[0] == '0' { '1' } else { '0' };
        sealed.value = chars.into_iter().collect();
        assert!(open(&sealed).is_err());
    }

    #[test]
    fn hmac_sign_is_deterministic() {
        let a = hmac_sign("cookie-token");
        let b = hmac_sign("cookie-token");
        assert_eq!(a, b);
        assert_ne!(a, hmac_sign("other-token"));
        // hex encoded sha256 tag
        assert_eq!(a.len(), 64);
    }
}
