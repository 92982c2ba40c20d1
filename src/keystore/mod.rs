//! Key Store
//!
//! Owns every custodial private key. Callers only ever see an opaque handle
//! (`kh_<uuid>`) and the derived address; signing happens inside the store.
//! No operation returns key material.
//!
//! ```text
//! generate(family) ──► SecretKey ──► derive address ──► encrypt ──► handle
//! sign(handle, digest) ──► decrypt ──► ECDSA (recoverable) ──► signature
//! ```
//!
//! Keys are encrypted at rest with AES-256-GCM under a key derived from the
//! configured passphrase and a per-key random salt.

pub mod address;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use parking_lot::RwLock;
use rand::RngCore;
use secp256k1::{ecdsa::RecoverableSignature, Message, PublicKey, SecretKey, SECP256K1};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::types::AddressFamily;

pub use address::{derive_address, validate_address};

/// Opaque reference to a stored key
pub type KeyHandle = String;

const FILE_VERSION: u8 = 1;

/// Key store errors
#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("encryption error: {0}")]
    Encryption(String),
    #[error("decryption error: {0}")]
    Decryption(String),
    #[error("unknown key handle: {0}")]
    UnknownHandle(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// Result of provisioning a new key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedKey {
    pub address: String,
    pub handle: KeyHandle,
}

/// Custodial key storage and signing
pub trait KeyStore: Send + Sync {
    /// Store a private key for `address` and return its handle
    fn store(&self, address: &str, secret: SecretKey) -> Result<KeyHandle, KeyStoreError>;

    /// Public key behind a handle
    fn public_key(&self, handle: &str) -> Result<PublicKey, KeyStoreError>;

    /// Sign a 32-byte digest with the key behind `handle`
    fn sign(&self, handle: &str, digest: &[u8; 32]) -> Result<RecoverableSignature, KeyStoreError>;

    /// Remove a key that was never bound to a persisted address
    fn discard(&self, handle: &str) -> Result<(), KeyStoreError>;

    /// Create a fresh key for an address family
    fn generate(&self, family: &AddressFamily) -> Result<GeneratedKey, KeyStoreError> {
        let secret = SecretKey::new(&mut rand::thread_rng());
        let address = derive_address(family, &secret.public_key(SECP256K1));
        let handle = self.store(&address, secret)?;
        Ok(GeneratedKey { address, handle })
    }
}

/// Encrypted key file format
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EncryptedKeyFile {
    /// Version for future format changes
    version: u8,
    handle: String,
    /// Address the key was provisioned for
    address: String,
    /// Compressed public key (hex), readable without decrypting
    public_key: String,
    /// Salt for key derivation (hex-encoded)
    salt: String,
    /// Nonce for AES-GCM (hex-encoded)
    nonce: String,
    /// Encrypted secret key (hex-encoded)
    ciphertext: String,
}

enum Backend {
    /// One JSON file per handle
    Directory(PathBuf),
    /// Encrypted records held in memory (tests, demo)
    Memory(RwLock<HashMap<String, EncryptedKeyFile>>),
}

/// AES-256-GCM encrypted key store
pub struct EncryptedKeyStore {
    backend: Backend,
    passphrase: String,
}

impl EncryptedKeyStore {
    /// Store keys as encrypted files under `dir`
    pub fn open(dir: impl AsRef<Path>, passphrase: impl Into<String>) -> Result<Self, KeyStoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            backend: Backend::Directory(dir),
            passphrase: passphrase.into(),
        })
    }

    /// Keep encrypted keys in memory only; lost on restart
    pub fn ephemeral(passphrase: impl Into<String>) -> Self {
        Self {
            backend: Backend::Memory(RwLock::new(HashMap::new())),
            passphrase: passphrase.into(),
        }
    }

    /// Derive encryption key from passphrase using SHA-256
    fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(passphrase.as_bytes());
        hasher.update(salt);
        hasher.update(b"custody-keystore-v1");
        hasher.finalize().into()
    }

    fn file_path(dir: &Path, handle: &str) -> Result<PathBuf, KeyStoreError> {
        if handle.is_empty() || !handle.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(KeyStoreError::UnknownHandle(handle.to_string()));
        }
        Ok(dir.join(format!("{}.json", handle)))
    }

    fn encrypt(&self, handle: &str, address: &str, secret: &SecretKey) -> Result<EncryptedKeyFile, KeyStoreError> {
        let mut salt = [0u8; 16];
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let key = Self::derive_key(&self.passphrase, &salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| KeyStoreError::Encryption(e.to_string()))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, secret.secret_bytes().as_ref())
            .map_err(|e| KeyStoreError::Encryption(e.to_string()))?;

        Ok(EncryptedKeyFile {
            version: FILE_VERSION,
            handle: handle.to_string(),
            address: address.to_string(),
            public_key: hex::encode(secret.public_key(SECP256K1).serialize()),
            salt: hex::encode(salt),
            nonce: hex::encode(nonce_bytes),
            ciphertext: hex::encode(ciphertext),
        })
    }

    fn decrypt(&self, file: &EncryptedKeyFile) -> Result<SecretKey, KeyStoreError> {
        if file.version != FILE_VERSION {
            return Err(KeyStoreError::Decryption(format!(
                "unsupported key file version {}",
                file.version
            )));
        }

        let salt = hex::decode(&file.salt).map_err(|e| KeyStoreError::Decryption(e.to_string()))?;
        let nonce_bytes =
            hex::decode(&file.nonce).map_err(|e| KeyStoreError::Decryption(e.to_string()))?;
        if nonce_bytes.len() != 12 {
            return Err(KeyStoreError::Decryption("bad nonce length".to_string()));
        }
        let ciphertext =
            hex::decode(&file.ciphertext).map_err(|e| KeyStoreError::Decryption(e.to_string()))?;

        let key = Self::derive_key(&self.passphrase, &salt);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| KeyStoreError::Decryption(e.to_string()))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        // AEAD failure here means the passphrase is wrong or the file was altered
        let plaintext = cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| KeyStoreError::Decryption("authentication failed".to_string()))?;

        SecretKey::from_slice(&plaintext).map_err(|e| KeyStoreError::InvalidKey(e.to_string()))
    }

    fn load(&self, handle: &str) -> Result<EncryptedKeyFile, KeyStoreError> {
        match &self.backend {
            Backend::Directory(dir) => {
                let path = Self::file_path(dir, handle)?;
                if !path.exists() {
                    return Err(KeyStoreError::UnknownHandle(handle.to_string()));
                }
                let json = std::fs::read_to_string(&path)?;
                Ok(serde_json::from_str(&json)?)
            }
            Backend::Memory(map) => map
                .read()
                .get(handle)
                .cloned()
                .ok_or_else(|| KeyStoreError::UnknownHandle(handle.to_string())),
        }
    }
}

impl KeyStore for EncryptedKeyStore {
    fn store(&self, address: &str, secret: SecretKey) -> Result<KeyHandle, KeyStoreError> {
        let handle = format!("kh_{}", uuid::Uuid::new_v4().simple());
        let file = self.encrypt(&handle, address, &secret)?;

        match &self.backend {
            Backend::Directory(dir) => {
                let path = Self::file_path(dir, &handle)?;
                let json = serde_json::to_string_pretty(&file)?;
                std::fs::write(&path, json)?;
            }
            Backend::Memory(map) => {
                map.write().insert(handle.clone(), file);
            }
        }

        tracing::debug!(target: "custody::keystore", handle = %handle, address = %address, "Stored encrypted key");
        Ok(handle)
    }

    fn public_key(&self, handle: &str) -> Result<PublicKey, KeyStoreError> {
        let file = self.load(handle)?;
        let bytes =
            hex::decode(&file.public_key).map_err(|e| KeyStoreError::InvalidKey(e.to_string()))?;
        PublicKey::from_slice(&bytes).map_err(|e| KeyStoreError::InvalidKey(e.to_string()))
    }

    fn sign(&self, handle: &str, digest: &[u8; 32]) -> Result<RecoverableSignature, KeyStoreError> {
        let file = self.load(handle)?;
        let secret = self.decrypt(&file)?;
        let message = Message::from_digest(*digest);
        Ok(SECP256K1.sign_ecdsa_recoverable(&message, &secret))
    }

    fn discard(&self, handle: &str) -> Result<(), KeyStoreError> {
        match &self.backend {
            Backend::Directory(dir) => {
                let path = Self::file_path(dir, handle)?;
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
            }
            Backend::Memory(map) => {
                map.write().remove(handle);
            }
        }
        tracing::debug!(target: "custody::keystore", handle = %handle, "Discarded unbound key");
        Ok(())
    }
}
