//! Key-service client seam for hola's secret resources.
//!
//! The `aws_kms` resource encrypts and decrypts artifacts through a
//! [`KmsClient`]. The concrete AWS transport is a replaceable driver
//! behind that trait; this crate ships the trait, credential resolution
//! (explicit fields first, standard `AWS_*` environment variables as
//! fallback), and [`LocalKms`], an AES-256-GCM keyring deriving its
//! key from the key id via PBKDF2, used by tests and offline runs.
//!
//! # Example
//!
//! ```
//! use hola_kms::{KmsClient, KmsRequest, LocalKms};
//!
//! let kms = LocalKms::default();
//! let req = KmsRequest::symmetric("alias/demo");
//!
//! let sealed = kms.encrypt(&req, b"secret bytes").expect("encrypt");
//! let opened = kms.decrypt(&req, &sealed).expect("decrypt");
//! assert_eq!(opened, b"secret bytes");
//! ```

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
};
use pbkdf2::pbkdf2_hmac_array;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

/// Size of the salt mixed into key derivation (16 bytes).
const SALT_SIZE: usize = 16;
/// Size of the AES-GCM nonce (12 bytes).
const NONCE_SIZE: usize = 12;
/// PBKDF2 iteration count.
const PBKDF2_ITERATIONS: u32 = 100_000;
/// Derived key size (256 bits).
const KEY_SIZE: usize = 32;

/// The only algorithm the symmetric path accepts.
pub const SYMMETRIC_DEFAULT: &str = "SYMMETRIC_DEFAULT";

/// Failures from a key-service call.
#[derive(Debug, Error)]
pub enum KmsError {
    /// The service refused the operation (bad credentials, missing grant).
    #[error("key service denied the request: {0}")]
    Denied(String),
    /// Ciphertext failed authentication or was structurally invalid.
    #[error("invalid ciphertext: {0}")]
    InvalidCiphertext(String),
    /// The requested algorithm is not available on this client.
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    /// Anything else (transport, I/O).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Credentials for a key-service call.
///
/// Explicit resource fields win; empty fields fall back to the standard
/// `AWS_*` environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub region: Option<String>,
}

impl Credentials {
    /// Merge explicit fields with the process environment.
    pub fn resolve(
        access_key_id: Option<&str>,
        secret_access_key: Option<&str>,
        session_token: Option<&str>,
        region: Option<&str>,
    ) -> Self {
        fn pick(explicit: Option<&str>, vars: &[&str]) -> Option<String> {
            if let Some(v) = explicit {
                if !v.is_empty() {
                    return Some(v.to_string());
                }
            }
            vars.iter().find_map(|var| std::env::var(var).ok()).filter(|v| !v.is_empty())
        }

        Self {
            access_key_id: pick(access_key_id, &["AWS_ACCESS_KEY_ID"]),
            secret_access_key: pick(secret_access_key, &["AWS_SECRET_ACCESS_KEY"]),
            session_token: pick(session_token, &["AWS_SESSION_TOKEN"]),
            region: pick(region, &["AWS_REGION", "AWS_DEFAULT_REGION"]),
        }
    }
}

/// One encrypt or decrypt call: which key, which algorithm, as whom.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KmsRequest {
    /// Key id, ARN, or alias.
    pub key_id: String,
    /// Encryption algorithm; [`SYMMETRIC_DEFAULT`] unless overridden.
    pub algorithm: String,
    /// Resolved credentials for the call.
    pub credentials: Credentials,
}

impl KmsRequest {
    /// A `SYMMETRIC_DEFAULT` request with ambient credentials.
    pub fn symmetric(key_id: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            algorithm: SYMMETRIC_DEFAULT.to_string(),
            credentials: Credentials::default(),
        }
    }
}

/// A key service that can seal and open byte payloads.
///
/// Implementations must be safe to call from a worker thread; the
/// engine offloads driver work while the foreground reports progress.
pub trait KmsClient: Send + Sync {
    /// Encrypt `plaintext` under the request's key. Returns raw
    /// ciphertext bytes (encoding is the caller's concern).
    fn encrypt(&self, req: &KmsRequest, plaintext: &[u8]) -> Result<Vec<u8>, KmsError>;

    /// Decrypt raw ciphertext bytes produced by [`KmsClient::encrypt`].
    fn decrypt(&self, req: &KmsRequest, ciphertext: &[u8]) -> Result<Vec<u8>, KmsError>;
}

/// Local AES-256-GCM keyring.
///
/// Derives a per-key-id key via PBKDF2 and seals payloads as
/// `salt || nonce || ciphertext`. No network, no credentials; the
/// key id alone determines the key, so encrypt-then-decrypt round-trips
/// across processes.
#[derive(Debug, Clone, Default)]
pub struct LocalKms;

impl LocalKms {
    fn derive_key(&self, key_id: &str, salt: &[u8]) -> [u8; KEY_SIZE] {
        pbkdf2_hmac_array::<Sha256, KEY_SIZE>(key_id.as_bytes(), salt, PBKDF2_ITERATIONS)
    }

    fn check_algorithm(req: &KmsRequest) -> Result<(), KmsError> {
        if req.algorithm != SYMMETRIC_DEFAULT {
            return Err(KmsError::UnsupportedAlgorithm(req.algorithm.clone()));
        }
        Ok(())
    }
}

impl KmsClient for LocalKms {
    fn encrypt(&self, req: &KmsRequest, plaintext: &[u8]) -> Result<Vec<u8>, KmsError> {
        Self::check_algorithm(req)?;

        let mut salt = [0u8; SALT_SIZE];
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce_bytes);

        let key = self.derive_key(&req.key_id, &salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| KmsError::Other(anyhow::anyhow!("cipher init failed: {e}")))?;
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| KmsError::Other(anyhow::anyhow!("encryption failed: {e:?}")))?;

        let mut sealed = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&salt);
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn decrypt(&self, req: &KmsRequest, ciphertext: &[u8]) -> Result<Vec<u8>, KmsError> {
        Self::check_algorithm(req)?;

        if ciphertext.len() < SALT_SIZE + NONCE_SIZE {
            return Err(KmsError::InvalidCiphertext(format!(
                "sealed payload too short: {} bytes",
                ciphertext.len()
            )));
        }
        let (salt, rest) = ciphertext.split_at(SALT_SIZE);
        let (nonce_bytes, body) = rest.split_at(NONCE_SIZE);

        let key = self.derive_key(&req.key_id, salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| KmsError::Other(anyhow::anyhow!("cipher init failed: {e}")))?;
        let nonce = Nonce::from_slice(nonce_bytes);
        cipher
            .decrypt(nonce, body)
            .map_err(|_| KmsError::InvalidCiphertext("authentication failed".to_string()))
    }
}
