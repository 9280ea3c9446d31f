//! Device identity and crypto: keypairs, sender ids, LAN link keys, sealed signaling envelopes.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::protocol::{Signal, SignalingMessage};

/// Device public key (32 bytes, X25519). Serializable for beacons, handshakes and IDENTITY messages.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "bytes_32")] [u8; 32]);

mod bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create a `PublicKey` from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }
}

/// Device ID: truncated hash of the public key. Its hex form is the session's sender id.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId([u8; 16]);

impl DeviceId {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        DeviceId(bytes)
    }

    /// Derive device ID from a public key (same as Keypair does).
    pub fn from_public_key(public: &[u8; 32]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(public);
        let digest = hasher.finalize();
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        DeviceId(id)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// X25519 keypair. Keep secret key private; expose only public key and device ID.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
    device_id: DeviceId,
}

impl Keypair {
    /// Generate a new random keypair and derive device ID from public key.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public_x = X25519PublicKey::from(&secret);
        let public = PublicKey(public_x.to_bytes());
        let device_id = DeviceId::from_public_key(public.as_bytes());
        Self {
            secret,
            public,
            device_id,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Stable sender id for signaling messages of this session.
    pub fn sender_id(&self) -> String {
        self.device_id.to_hex()
    }

    /// Shared secret with another device's public key.
    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }
}

/// Derive a 32-byte link key from a shared secret. Pairwise: each pair of devices has its own key.
pub fn derive_session_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    derive_key(b"meshcall-link-v1", shared_secret)
}

fn derive_key(label: &[u8], shared_secret: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(label);
    hasher.update(shared_secret);
    hasher.finalize().into()
}

fn cipher(key: &[u8; 32]) -> Result<ChaCha20Poly1305, WireCryptoError> {
    ChaCha20Poly1305::new_from_slice(key).map_err(|_| WireCryptoError::Key)
}

/// 96-bit nonce: four zero bytes, then the counter little-endian.
fn counter_nonce(counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&counter.to_le_bytes());
    Nonce::from(bytes)
}

/// ChaCha20-Poly1305 under `key`. Callers keep one counter per direction and never reuse it.
pub fn encrypt_wire(key: &[u8; 32], nonce: u64, plaintext: &[u8]) -> Result<Vec<u8>, WireCryptoError> {
    cipher(key)?
        .encrypt(&counter_nonce(nonce), plaintext)
        .map_err(|_| WireCryptoError::Encrypt)
}

pub fn decrypt_wire(key: &[u8; 32], nonce: u64, ciphertext: &[u8]) -> Result<Vec<u8>, WireCryptoError> {
    cipher(key)?
        .decrypt(&counter_nonce(nonce), ciphertext)
        .map_err(|_| WireCryptoError::Decrypt)
}

#[derive(Debug, thiserror::Error)]
pub enum WireCryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}

/// Seal `msg` for `recipient` as an ENCRYPTED message. A fresh ephemeral key is used per
/// envelope, so the AEAD nonce is always zero.
pub fn seal(recipient: &PublicKey, msg: &SignalingMessage) -> Result<SignalingMessage, EnvelopeError> {
    if matches!(msg.signal, Signal::Encrypted { .. }) {
        return Err(EnvelopeError::Nested);
    }
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey(X25519PublicKey::from(&ephemeral).to_bytes());
    let shared = ephemeral
        .diffie_hellman(&X25519PublicKey::from(recipient.0))
        .to_bytes();
    let key = derive_key(b"meshcall-envelope-v1", &shared);
    let plain = bincode::serialize(msg)?;
    let payload = encrypt_wire(&key, 0, &plain)?;
    Ok(SignalingMessage::new(
        msg.sender_id.clone(),
        Signal::Encrypted {
            ephemeral_key: ephemeral_public,
            payload,
        },
    ))
}

/// Open an ENCRYPTED message addressed to `keypair`. The inner message must come from the
/// same sender as the envelope and must not itself be an envelope.
pub fn open(keypair: &Keypair, envelope: &SignalingMessage) -> Result<SignalingMessage, EnvelopeError> {
    let Signal::Encrypted {
        ephemeral_key,
        payload,
    } = &envelope.signal
    else {
        return Err(EnvelopeError::NotAnEnvelope);
    };
    let key = derive_key(b"meshcall-envelope-v1", &keypair.shared_secret(ephemeral_key));
    let plain = decrypt_wire(&key, 0, payload)?;
    let inner: SignalingMessage = bincode::deserialize(&plain)?;
    if inner.sender_id != envelope.sender_id {
        return Err(EnvelopeError::SenderMismatch);
    }
    if matches!(inner.signal, Signal::Encrypted { .. }) {
        return Err(EnvelopeError::Nested);
    }
    Ok(inner)
}

/// Error sealing or opening a signaling envelope.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("message is not an envelope")]
    NotAnEnvelope,
    #[error("envelopes cannot be nested")]
    Nested,
    #[error("envelope sender does not match inner sender")]
    SenderMismatch,
    #[error("crypto: {0}")]
    Crypto(#[from] WireCryptoError),
    #[error("encoding: {0}")]
    Encoding(#[from] bincode::Error),
}
