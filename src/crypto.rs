/*!
Crypto things
*/
use ring::aead::BoundKey;

use crate::{se, Result, CONFIG};

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
pub fn rand_bytes(n: usize) -> Result<Vec<u8>> {
    use ring::rand::SecureRandom;
    let mut buf = vec![0; n];
    let sysrand = ring::rand::SystemRandom::new();
    sysrand
        .fill(&mut buf)
        .map_err(|_| se!("error getting random bytes"))?;
    Ok(buf)
}

pub fn new_nonce() -> Result<Vec<u8>> {
    rand_bytes(12)
}

/// Return the SHA256 hash of `bytes`
pub fn hash(bytes: &[u8]) -> Vec<u8> {
    let alg = &ring::digest::SHA256;
    let digest = ring::digest::digest(alg, bytes);
    Vec::from(digest.as_ref())
}

/// Seal `bytes` with the given `nonce` and `pass`
///
/// `bytes` are encrypted using AES_256_GCM, `nonce` is expected to be
/// 12-bytes, and `pass` 32-bytes
fn seal(bytes: &[u8], nonce: &[u8], pass: &[u8]) -> Result<Vec<u8>> {
    let alg = &ring::aead::AES_256_GCM;
    let nonce = ring::aead::Nonce::try_assume_unique_for_key(nonce)
        .map_err(|_| se!("encryption nonce not unique"))?;
    let nonce = OneNonceSequence::new(nonce);
    let key =
        ring::aead::UnboundKey::new(alg, pass).map_err(|_| se!("error building sealing key"))?;
    let mut key = ring::aead::SealingKey::new(key, nonce);
    let mut in_out = bytes.to_vec();
    key.seal_in_place_append_tag(ring::aead::Aad::empty(), &mut in_out)
        .map_err(|_| se!("failed encrypting bytes"))?;
    Ok(in_out)
}

/// Open `bytes` with the given `nonce` and `pass`
///
/// `bytes` are decrypted using AES_256_GCM, `nonce` is expected to be
/// 12-bytes, and `pass` 32-bytes
fn open<'a>(bytes: &'a mut [u8], nonce: &[u8], pass: &[u8]) -> Result<&'a [u8]> {
    let alg = &ring::aead::AES_256_GCM;
    let nonce = ring::aead::Nonce::try_assume_unique_for_key(nonce)
        .map_err(|_| se!("decryption nonce not unique"))?;
    let nonce = OneNonceSequence::new(nonce);
    let key =
        ring::aead::UnboundKey::new(alg, pass).map_err(|_| se!("error building opening key"))?;
    let mut key = ring::aead::OpeningKey::new(key, nonce);
    let out_slice = key
        .open_in_place(ring::aead::Aad::empty(), bytes)
        .map_err(|_| se!("failed decrypting bytes"))?;
    Ok(out_slice)
}

/// A hex encoded ciphertext and the hex encoded nonce it was
/// sealed with. Both halves are stored next to each other so the
/// value can be recovered later with the application key.
pub struct Enc {
    pub value: String,
    pub nonce: String,
}

/// Encrypt `s` with a fresh nonce and the application `ENC_KEY`
pub fn encrypt(s: &str) -> Result<Enc> {
    let nonce = new_nonce()?;
    let sealed = seal(s.as_bytes(), &nonce, CONFIG.enc_key.as_bytes())?;
    Ok(Enc {
        value: hex::encode(&sealed),
        nonce: hex::encode(&nonce),
    })
}

/// Recover the string sealed in `enc` using the application `ENC_KEY`
pub fn decrypt(enc: &Enc) -> Result<String> {
    let nonce = hex::decode(&enc.nonce).map_err(|e| se!("nonce hex decode error {}", e))?;
    let mut value = hex::decode(&enc.value).map_err(|e| se!("value hex decode error {}", e))?;
    let bytes = open(value.as_mut_slice(), &nonce, CONFIG.enc_key.as_bytes())?;
    String::from_utf8(bytes.to_vec()).map_err(|e| se!("decrypted utf8 error {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_round_trips() {
        let enc = encrypt("BQDe6-secret-token").expect("encrypt error");
        assert_ne!(enc.value, hex::encode("BQDe6-secret-token"));
        let out = decrypt(&enc).expect("decrypt error");
        assert_eq!(out, "BQDe6-secret-token");
    }

    #[test]
    fn each_encryption_uses_a_new_nonce() {
        let a = encrypt("same-value").expect("encrypt error");
        let b = encrypt("same-value").expect("encrypt error");
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.value, b.value);
    }

    #[test]
    fn tampered_value_fails_to_decrypt() {
        let mut enc = encrypt("value").expect("encrypt error");
        let flipped = if enc.value.starts_with("00") { "ff" } else { "00" };
        enc.value = format!("{}{}", flipped, &enc.value[2..]);
        assert!(decrypt(&enc).is_err());
    }

    #[test]
    fn hash_is_stable() {
        assert_eq!(hash(b"abc"), hash(b"abc"));
        assert_ne!(hash(b"abc"), hash(b"abd"));
        assert_eq!(hash(b"abc").len(), 32);
    }

    #[test]
    fn rand_bytes_len() {
        assert_eq!(rand_bytes(12).expect("rand error").len(), 12);
        assert_ne!(
            rand_bytes(12).expect("rand error"),
            rand_bytes(12).expect("rand error")
        );
    }
}
