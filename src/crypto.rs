/*!
Crypto things
*/
use ring::aead::BoundKey;

use crate::se;

/// ring requires an implementor of `NonceSequence`,
/// which if a wrapping trait around `ring::aead::Nonce`.
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

/// A hex encoded, encrypted value along with the hex
/// encoded nonce that it was sealed with.
#[derive(Debug, Clone, PartialEq)]
pub struct Enc {
    pub value: String,
    pub nonce: String,
}

/// Return a `Vec` of secure random bytes of size `n`
pub fn rand_bytes(n: usize) -> crate::Result<Vec<u8>> {
    use ring::rand::SecureRandom;
    let mut buf = vec![0; n];
    let sysrand = ring::rand::SystemRandom::new();
    sysrand
        .fill(&mut buf)
        .map_err(|_| se!("Error getting random bytes"))?;
    Ok(buf)
}

pub fn new_nonce() -> crate::Result<Vec<u8>> {
    rand_bytes(12)
}

/// Encrypt `s` with a fresh nonce and the configured `ENC_KEY`
pub fn encrypt(s: &str) -> crate::Result<Enc> {
    encrypt_with_key(s, crate::CONFIG.enc_key.as_bytes())
}

/// Decrypt a value produced by `encrypt`
pub fn decrypt(enc: &Enc) -> crate::Result<String> {
    decrypt_with_key(enc, crate::CONFIG.enc_key.as_bytes())
}

fn encrypt_with_key(s: &str, key: &[u8]) -> crate::Result<Enc> {
    let nonce = new_nonce()?;
    let b = seal(s.as_bytes(), &nonce, key)?;
    Ok(Enc {
        value: hex::encode(&b),
        nonce: hex::encode(&nonce),
    })
}

fn decrypt_with_key(enc: &Enc, key: &[u8]) -> crate::Result<String> {
    let nonce = hex::decode(&enc.nonce).map_err(|e| se!("nonce hex decode error {}", e))?;
    let mut value = hex::decode(&enc.value).map_err(|e| se!("value hex decode error {}", e))?;
    let bytes = open(value.as_mut_slice(), &nonce, key)?;
    Ok(String::from_utf8(bytes.to_owned()).map_err(|e| se!("decrypted utf8 error {}", e))?)
}

/// Encrypt `bytes` with the given `nonce` and `pass`
///
/// `bytes` are encrypted using AES_256_GCM, `nonce` is expected to be
/// 12-bytes, and `pass` 32-bytes
fn seal(bytes: &[u8], nonce: &[u8], pass: &[u8]) -> crate::Result<Vec<u8>> {
    let alg = &ring::aead::AES_256_GCM;
    let nonce = ring::aead::Nonce::try_assume_unique_for_key(nonce)
        .map_err(|_| se!("Encryption nonce not unique"))?;
    let nonce = OneNonceSequence::new(nonce);
    let key =
        ring::aead::UnboundKey::new(alg, pass).map_err(|_| se!("Error building sealing key"))?;
    let mut key = ring::aead::SealingKey::new(key, nonce);
    let mut in_out = bytes.to_vec();
    key.seal_in_place_append_tag(ring::aead::Aad::empty(), &mut in_out)
        .map_err(|_| se!("Failed encrypting bytes"))?;
    Ok(in_out)
}

/// Decrypt `bytes` with the given `nonce` and `pass`
///
/// `bytes` are decrypted using AES_256_GCM, `nonce` is expected to be
/// 12-bytes, and `pass` 32-bytes
fn open<'a>(bytes: &'a mut [u8], nonce: &[u8], pass: &[u8]) -> crate::Result<&'a [u8]> {
    let alg = &ring::aead::AES_256_GCM;
    let nonce = ring::aead::Nonce::try_assume_unique_for_key(nonce)
        .map_err(|_| se!("Decryption nonce not unique"))?;
    let nonce = OneNonceSequence::new(nonce);
    let key =
        ring::aead::UnboundKey::new(alg, pass).map_err(|_| se!("Error build opening key"))?;
    let mut key = ring::aead::OpeningKey::new(key, nonce);
    let out_slice = key
        .open_in_place(ring::aead::Aad::empty(), bytes)
        .map_err(|_| se!("Failed decrypting bytes"))?;
    Ok(out_slice)
}
