//! Knock payload codec and wire formats.
//!
//! Two wire formats share the same JSON payload:
//!
//! v1 (sign only):      `[64B ed25519 signature][JSON payload]`
//! v2 (sign + encrypt): `[64B ed25519 signature][24B nonce][box ciphertext]`
//!
//! In v2 the signature covers `nonce || ciphertext` and the ciphertext is a
//! NaCl box (Curve25519 + XSalsa20 + Poly1305) between the client and server
//! keys, both derived from the corresponding Ed25519 keys. v2 is the
//! canonical format; v1 is kept for compatibility.
//!
//! SECURITY: JSON is only deserialized after the signature check succeeds,
//! and decryption only runs against the key that produced a valid signature.
//! Unauthenticated input never reaches the JSON parser.

use chrono::Utc;
use crypto_box::aead::{Aead, AeadCore, OsRng};
use crypto_box::SalsaBox;
use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::collections::HashMap;
use thiserror::Error;

/// Detached Ed25519 signature length.
pub const SIGNATURE_SIZE: usize = 64;

/// XSalsa20 nonce length.
pub const NONCE_SIZE: usize = 24;

/// Raw private key file length (seed || public key).
pub const PRIVATE_KEY_SIZE: usize = 64;

/// Raw public key file length.
pub const PUBLIC_KEY_SIZE: usize = 32;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),
    #[error("signature does not match any configured key")]
    BadSignature,
    #[error("authenticated decryption failed")]
    BadDecryption,
    #[error("payload is not valid JSON: {0}")]
    BadJson(#[from] serde_json::Error),
    #[error("payload has an empty action_id")]
    EmptyAction,
    #[error("invalid key material")]
    BadKey,
    #[error("encryption failed")]
    SealFailed,
}

/// The authorization request carried inside every knock.
///
/// `params` is omitted on the wire when empty and normalized back to an
/// empty map on decode, so `deserialize(serialize(p)) == p` holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Nanoseconds since the Unix epoch.
    pub timestamp: i64,
    pub action_id: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub params: HashMap<String, String>,
}

impl Payload {
    /// New payload stamped with the current time.
    pub fn new(action_id: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX),
            action_id: action_id.into(),
            params: HashMap::new(),
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, CodecError> {
        if self.action_id.is_empty() {
            return Err(CodecError::EmptyAction);
        }
        Ok(serde_json::to_vec(self)?)
    }

    /// Total over arbitrary bytes: either a payload with a non-empty
    /// action_id or an error, never a panic.
    pub fn deserialize(data: &[u8]) -> Result<Self, CodecError> {
        let payload: Payload = serde_json::from_slice(data)?;
        if payload.action_id.is_empty() {
            return Err(CodecError::EmptyAction);
        }
        Ok(payload)
    }
}

/// Ed25519 keypair in the on-disk layout (seed || public key).
pub struct KnockKeypair {
    signing: SigningKey,
}

impl KnockKeypair {
    pub fn generate() -> Self {
        Self { signing: SigningKey::generate(&mut rand::rngs::OsRng) }
    }

    /// Accepts the 64-byte private key file contents. The embedded public
    /// half must be consistent with the seed.
    pub fn from_keypair_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let raw: [u8; PRIVATE_KEY_SIZE] = bytes.try_into().map_err(|_| CodecError::BadKey)?;
        let signing = SigningKey::from_keypair_bytes(&raw).map_err(|_| CodecError::BadKey)?;
        Ok(Self { signing })
    }

    pub fn to_keypair_bytes(&self) -> [u8; PRIVATE_KEY_SIZE] {
        self.signing.to_keypair_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(message).to_bytes()
    }
}

/// Ed25519 secret → X25519 secret: SHA-512 of the 32-byte seed, truncated
/// to 32 bytes and clamped. A raw truncation of the seed would be wrong.
pub fn x25519_secret_from_ed25519(keypair: &KnockKeypair) -> crypto_box::SecretKey {
    let digest = Sha512::digest(keypair.signing.to_bytes());
    let mut scalar = [0u8; 32];
    scalar.copy_from_slice(&digest[..32]);
    scalar[0] &= 248;
    scalar[31] &= 127;
    scalar[31] |= 64;
    crypto_box::SecretKey::from(scalar)
}

/// Ed25519 public → X25519 public via the Edwards→Montgomery birational
/// map. Fails on bytes that do not decompress to a curve point.
pub fn x25519_public_from_ed25519(key: &VerifyingKey) -> Result<crypto_box::PublicKey, CodecError> {
    let point = CompressedEdwardsY(key.to_bytes())
        .decompress()
        .ok_or(CodecError::BadKey)?;
    Ok(crypto_box::PublicKey::from(point.to_montgomery().to_bytes()))
}

/// A verified, decoded knock and the key that produced it.
#[derive(Debug)]
pub struct OpenedKnock {
    /// Index into the key slice passed to `open_*`.
    pub user_index: usize,
    pub payload: Payload,
}

/// v1: sign the serialized payload and prepend the signature.
pub fn seal_v1(payload: &Payload, client: &KnockKeypair) -> Result<Vec<u8>, CodecError> {
    let body = payload.serialize()?;
    let mut datagram = Vec::with_capacity(SIGNATURE_SIZE + body.len());
    datagram.extend_from_slice(&client.sign(&body));
    datagram.extend_from_slice(&body);
    Ok(datagram)
}

/// v1: try each configured key against the signature; deserialize only
/// after a match.
pub fn open_v1(datagram: &[u8], user_keys: &[VerifyingKey]) -> Result<OpenedKnock, CodecError> {
    if datagram.len() <= SIGNATURE_SIZE {
        return Err(CodecError::TooShort(datagram.len()));
    }
    let signature =
        Signature::from_slice(&datagram[..SIGNATURE_SIZE]).map_err(|_| CodecError::BadSignature)?;
    let body = &datagram[SIGNATURE_SIZE..];

    let user_index = user_keys
        .iter()
        .position(|key| key.verify(body, &signature).is_ok())
        .ok_or(CodecError::BadSignature)?;

    let payload = Payload::deserialize(body)?;
    Ok(OpenedKnock { user_index, payload })
}

/// v2: box-seal the payload for the server, then sign `nonce || ciphertext`.
pub fn seal_v2(
    payload: &Payload,
    client: &KnockKeypair,
    server_key: &VerifyingKey,
) -> Result<Vec<u8>, CodecError> {
    let body = payload.serialize()?;

    let client_secret = x25519_secret_from_ed25519(client);
    let server_public = x25519_public_from_ed25519(server_key)?;
    let sealer = SalsaBox::new(&server_public, &client_secret);

    let nonce = SalsaBox::generate_nonce(&mut OsRng);
    let ciphertext = sealer
        .encrypt(&nonce, body.as_slice())
        .map_err(|_| CodecError::SealFailed)?;

    let mut signed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    signed.extend_from_slice(nonce.as_slice());
    signed.extend_from_slice(&ciphertext);

    let mut datagram = Vec::with_capacity(SIGNATURE_SIZE + signed.len());
    datagram.extend_from_slice(&client.sign(&signed));
    datagram.extend_from_slice(&signed);
    Ok(datagram)
}

/// v2: verify the signature over `nonce || ciphertext` against each
/// configured key, then decrypt with the matching user's derived X25519
/// key and the server secret.
pub fn open_v2(
    datagram: &[u8],
    user_keys: &[VerifyingKey],
    server_secret: &crypto_box::SecretKey,
) -> Result<OpenedKnock, CodecError> {
    if datagram.len() <= SIGNATURE_SIZE + NONCE_SIZE {
        return Err(CodecError::TooShort(datagram.len()));
    }
    let signature =
        Signature::from_slice(&datagram[..SIGNATURE_SIZE]).map_err(|_| CodecError::BadSignature)?;
    let signed = &datagram[SIGNATURE_SIZE..];

    let user_index = user_keys
        .iter()
        .position(|key| key.verify(signed, &signature).is_ok())
        .ok_or(CodecError::BadSignature)?;

    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&signed[..NONCE_SIZE]);
    let ciphertext = &signed[NONCE_SIZE..];

    let client_public = x25519_public_from_ed25519(&user_keys[user_index])?;
    let opener = SalsaBox::new(&client_public, server_secret);
    let plaintext = opener
        .decrypt(&nonce.into(), ciphertext)
        .map_err(|_| CodecError::BadDecryption)?;

    let payload = Payload::deserialize(&plaintext)?;
    Ok(OpenedKnock { user_index, payload })
}
