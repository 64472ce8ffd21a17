//! Per-session hybrid encryption.
//!
//! Each logical task exchange gets one [`CryptoSession`] on each side:
//! a fresh RSA-2048 keypair for exchanging a 256-bit AES-GCM session
//! key, then AES-256-GCM for every payload on the data channel. Keys
//! live exactly as long as the session; nothing is persisted or
//! reused, so compromising one session key exposes one task.
//!
//! Sealed payload wire format: `base64url( 12-byte nonce ‖ ciphertext‖tag )`.

use aes_gcm::aead::{Aead, AeadCore, OsRng as AeadOsRng};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE;
use rand::RngCore;
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;

/// RSA modulus size for the per-session keypair.
const RSA_BITS: usize = 2048;
/// AES-256 session key size in bytes.
const SESSION_KEY_SIZE: usize = 32;
/// GCM nonce size in bytes.
const NONCE_SIZE: usize = 12;
/// GCM authentication tag size in bytes.
const TAG_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// `seal`/`unseal` called before the session key was established.
    #[error("session key not established")]
    NotReady,
    /// The RSA leg of the handshake failed (bad peer key, wrong
    /// keypair, corrupted key ciphertext). Not retried; the session
    /// is aborted.
    #[error("key exchange failed: {0}")]
    KeyExchange(String),
    /// AEAD authentication failed: the payload was tampered with or
    /// corrupted in flight. Distinct from [`CryptoError::Decode`] so
    /// callers can tell tampering from malformed encoding.
    #[error("payload failed authentication")]
    Integrity,
    /// The payload was not valid base64url / was too short to carry a
    /// nonce and tag.
    #[error("malformed payload: {0}")]
    Decode(String),
    /// AEAD encryption failed. Practically unreachable with a valid key.
    #[error("encryption failed")]
    Seal,
}

/// Cryptographic state for one session.
///
/// The session key is set at most once, by exactly one of
/// [`seal_session_key`](Self::seal_session_key) (initiator) or
/// [`unseal_session_key`](Self::unseal_session_key) (responder), and
/// never rotated.
pub struct CryptoSession {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    session_key: Option<[u8; SESSION_KEY_SIZE]>,
}

impl CryptoSession {
    /// Generate a fresh keypair for a new session.
    ///
    /// Failure to obtain system randomness is not recoverable per
    /// session, so this panics rather than returning an error.
    pub fn new() -> Self {
        let private_key = RsaPrivateKey::new(&mut OsRng, RSA_BITS)
            .expect("system randomness unavailable: cannot generate session keypair");
        let public_key = RsaPublicKey::from(&private_key);
        tracing::debug!(target = "crypto", bits = RSA_BITS, "session keypair generated");
        Self {
            private_key,
            public_key,
            session_key: None,
        }
    }

    /// Whether the symmetric session key has been established.
    pub fn is_ready(&self) -> bool {
        self.session_key.is_some()
    }

    /// Own public key as PKCS#8 PEM, safe to embed in a JSON message.
    pub fn public_key_pem(&self) -> Result<String, CryptoError> {
        self.public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|err| CryptoError::KeyExchange(format!("public key export: {err}")))
    }

    /// Initiator side: generate the 256-bit session key, store it, and
    /// seal it under the peer's RSA public key (OAEP-SHA256).
    ///
    /// Only the task submitter calls this; the side that sends the
    /// sensitive payload controls the key material.
    pub fn seal_session_key(&mut self, peer_public_key_pem: &str) -> Result<String, CryptoError> {
        let peer_key = RsaPublicKey::from_public_key_pem(peer_public_key_pem)
            .map_err(|err| CryptoError::KeyExchange(format!("peer public key: {err}")))?;

        let mut key = [0u8; SESSION_KEY_SIZE];
        OsRng.fill_bytes(&mut key);

        let sealed = peer_key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &key)
            .map_err(|err| CryptoError::KeyExchange(format!("session key seal: {err}")))?;

        self.session_key = Some(key);
        tracing::debug!(target = "crypto", "session key generated and sealed for peer");
        Ok(URL_SAFE.encode(sealed))
    }

    /// Responder side: decrypt the session key sealed under our public
    /// key and store it.
    pub fn unseal_session_key(&mut self, encoded: &str) -> Result<(), CryptoError> {
        let sealed = URL_SAFE
            .decode(encoded)
            .map_err(|err| CryptoError::KeyExchange(format!("session key encoding: {err}")))?;
        let key = self
            .private_key
            .decrypt(Oaep::new::<Sha256>(), &sealed)
            .map_err(|err| CryptoError::KeyExchange(format!("session key unseal: {err}")))?;
        let key: [u8; SESSION_KEY_SIZE] = key
            .try_into()
            .map_err(|_| CryptoError::KeyExchange("session key has wrong length".into()))?;

        self.session_key = Some(key);
        tracing::debug!(target = "crypto", "session key unsealed and stored");
        Ok(())
    }

    /// Seal a payload with the session key. A fresh 96-bit nonce is
    /// drawn per call; nonces are never reused under one key.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let key = self.session_key.as_ref().ok_or(CryptoError::NotReady)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let nonce = Aes256Gcm::generate_nonce(&mut AeadOsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Seal)?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(URL_SAFE.encode(sealed))
    }

    /// Unseal a payload, authenticating it in the process.
    pub fn unseal(&self, encoded: &str) -> Result<Vec<u8>, CryptoError> {
        let key = self.session_key.as_ref().ok_or(CryptoError::NotReady)?;
        let sealed = URL_SAFE
            .decode(encoded)
            .map_err(|err| CryptoError::Decode(err.to_string()))?;
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::Decode(format!(
                "sealed payload too short: {} bytes",
                sealed.len()
            )));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Integrity)
    }
}

impl std::fmt::Debug for CryptoSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoSession")
            .field("session_key", &self.session_key.map(|_| "[REDACTED]"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn established_pair() -> (CryptoSession, CryptoSession) {
        let mut client = CryptoSession::new();
        let mut node = CryptoSession::new();
        let sealed_key = client
            .seal_session_key(&node.public_key_pem().unwrap())
            .unwrap();
        node.unseal_session_key(&sealed_key).unwrap();
        (client, node)
    }

    #[test]
    fn seal_unseal_round_trip() {
        let (client, node) = established_pair();
        for payload in [&b""[..], b"x", b"{\"code\":\"print(1+1)\"}"] {
            let sealed = client.seal(payload).unwrap();
            assert_eq!(node.unseal(&sealed).unwrap(), payload);
        }
    }

    #[test]
    fn both_directions_share_one_key() {
        let (client, node) = established_pair();
        let sealed = node.seal(b"result").unwrap();
        assert_eq!(client.unseal(&sealed).unwrap(), b"result");
    }

    #[test]
    fn tampering_fails_authentication() {
        let (client, node) = established_pair();
        let sealed = client.seal(b"payload under test").unwrap();
        let raw = URL_SAFE.decode(&sealed).unwrap();

        // Flip one bit in the nonce, mid-ciphertext, and in the tag.
        for index in [0, NONCE_SIZE + 2, raw.len() - 1] {
            let mut corrupt = raw.clone();
            corrupt[index] ^= 0x01;
            let err = node.unseal(&URL_SAFE.encode(&corrupt)).unwrap_err();
            assert!(matches!(err, CryptoError::Integrity), "index {index}: {err:?}");
        }
    }

    #[test]
    fn tampered_empty_payload_still_detected() {
        let (client, node) = established_pair();
        let sealed = client.seal(b"").unwrap();
        let mut raw = URL_SAFE.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x80;
        assert!(matches!(
            node.unseal(&URL_SAFE.encode(&raw)).unwrap_err(),
            CryptoError::Integrity
        ));
    }

    #[test]
    fn malformed_encoding_is_decode_not_integrity() {
        let (_, node) = established_pair();
        assert!(matches!(
            node.unseal("not base64!!").unwrap_err(),
            CryptoError::Decode(_)
        ));
        // Valid base64, but too short to hold nonce + tag.
        assert!(matches!(
            node.unseal(&URL_SAFE.encode([0u8; 8])).unwrap_err(),
            CryptoError::Decode(_)
        ));
    }

    #[test]
    fn not_ready_before_key_establishment() {
        let session = CryptoSession::new();
        assert!(!session.is_ready());
        assert!(matches!(session.seal(b"x").unwrap_err(), CryptoError::NotReady));
        assert!(matches!(
            session.unseal("AAAA").unwrap_err(),
            CryptoError::NotReady
        ));
    }

    #[test]
    fn nonces_are_unique_across_seals() {
        let (client, _) = established_pair();
        let mut nonces = std::collections::HashSet::new();
        for _ in 0..64 {
            let raw = URL_SAFE.decode(client.seal(b"same plaintext").unwrap()).unwrap();
            assert!(nonces.insert(raw[..NONCE_SIZE].to_vec()));
        }
    }

    #[test]
    fn sessions_cannot_decrypt_each_other() {
        let (client_a, _node_a) = established_pair();
        let (_client_b, node_b) = established_pair();
        let sealed = client_a.seal(b"session a secret").unwrap();
        assert!(matches!(
            node_b.unseal(&sealed).unwrap_err(),
            CryptoError::Integrity
        ));
    }

    #[test]
    fn wrong_keypair_cannot_unseal_session_key() {
        let mut client = CryptoSession::new();
        let node = CryptoSession::new();
        let mut other = CryptoSession::new();
        let sealed_key = client
            .seal_session_key(&node.public_key_pem().unwrap())
            .unwrap();
        assert!(matches!(
            other.unseal_session_key(&sealed_key).unwrap_err(),
            CryptoError::KeyExchange(_)
        ));
    }

    #[test]
    fn public_key_pem_is_self_describing() {
        let session = CryptoSession::new();
        let pem = session.public_key_pem().unwrap();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));
        assert!(pem.trim_end().ends_with("-----END PUBLIC KEY-----"));
    }
}
