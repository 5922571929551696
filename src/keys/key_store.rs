//! Local signing identity and its persisted key slot.
//!
//! The private key is the only persisted value; the public key is always
//! rederived from it. If the backing store cannot be read or written the key
//! lives for the session only and [`KeyStore::is_persistent`] reports it.

use crate::*;
use secp256k1::rand::rngs::OsRng;
use secp256k1::{KeyPair, Secp256k1, SecretKey};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

/// Slot holding the hex private key.
pub const PRIVATE_KEY_SLOT: &str = "nostrPrivateKey";

/// A key-value slot store surviving process restarts.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, slot: &str) -> Result<Option<String>>;
    fn set(&self, slot: &str, value: &str) -> Result<()>;
}

/// JSON object on disk, one entry per slot.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn load(&self) -> Result<HashMap<String, String>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let json = fs::read_to_string(&self.path).map_err(|e| ZapError::Storage(e.to_string()))?;
        serde_json::from_str(&json).map_err(|e| ZapError::Storage(e.to_string()))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, slot: &str) -> Result<Option<String>> {
        Ok(self.load()?.remove(slot))
    }

    fn set(&self, slot: &str, value: &str) -> Result<()> {
        let mut data = self.load()?;
        data.insert(slot.to_string(), value.to_string());
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| ZapError::Storage(e.to_string()))?;
        }
        let json =
            serde_json::to_string_pretty(&data).map_err(|e| ZapError::Storage(e.to_string()))?;
        fs::write(&self.path, json).map_err(|e| ZapError::Storage(e.to_string()))
    }
}

/// Session-only store.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, slot: &str) -> Result<Option<String>> {
        let data = self
            .data
            .lock()
            .map_err(|_| ZapError::Storage("memory store poisoned".to_string()))?;
        Ok(data.get(slot).cloned())
    }

    fn set(&self, slot: &str, value: &str) -> Result<()> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| ZapError::Storage("memory store poisoned".to_string()))?;
        data.insert(slot.to_string(), value.to_string());
        Ok(())
    }
}

/// The process-wide signing identity.
#[derive(Clone, Copy)]
pub struct Identity {
    key_pair: KeyPair,
}

impl Identity {
    pub fn from_secret_key(secret_key: &SecretKey) -> Self {
        let secp = Secp256k1::new();
        Self {
            key_pair: KeyPair::from_secret_key(&secp, secret_key),
        }
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub fn secret_key(&self) -> SecretKey {
        self.key_pair.secret_key()
    }

    pub fn public_key(&self) -> String {
        public_key_hex(&self.key_pair)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Derives the hex x-only public key for `secret_key`.
pub fn derive_public_key(secret_key: &SecretKey) -> String {
    Identity::from_secret_key(secret_key).public_key()
}

struct KeyState {
    identity: Option<Identity>,
    persistent: bool,
}

pub struct KeyStore {
    store: Box<dyn KeyValueStore>,
    state: Mutex<KeyState>,
}

impl KeyStore {
    pub fn new(store: Box<dyn KeyValueStore>) -> Self {
        Self {
            store,
            state: Mutex::new(KeyState {
                identity: None,
                persistent: false,
            }),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Self {
        Self::new(Box::new(FileStore::new(path)))
    }

    /// Returns the stored key, generating and persisting one on first use.
    pub fn get_or_create_private_key(&self) -> Result<SecretKey> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ZapError::Storage("key state poisoned".to_string()))?;
        if let Some(identity) = state.identity {
            return Ok(identity.secret_key());
        }

        let (secret_key, persistent) = match self.store.get(PRIVATE_KEY_SLOT) {
            Ok(Some(stored)) => match stored.parse::<SecretKey>() {
                Ok(secret_key) => (secret_key, true),
                Err(e) => {
                    warn!("stored private key is unreadable ({e}), replacing it");
                    self.generate_and_store()
                }
            },
            Ok(None) => self.generate_and_store(),
            Err(e) => {
                warn!("key storage unavailable ({e}), identity is session-only");
                (generate_secret_key(), false)
            }
        };

        let identity = Identity::from_secret_key(&secret_key);
        info!("local identity {}", identity.public_key());
        state.identity = Some(identity);
        state.persistent = persistent;
        Ok(secret_key)
    }

    fn generate_and_store(&self) -> (SecretKey, bool) {
        let secret_key = generate_secret_key();
        let hex = secret_key.display_secret().to_string();
        match self.store.set(PRIVATE_KEY_SLOT, &hex) {
            Ok(()) => (secret_key, true),
            Err(e) => {
                warn!("could not persist private key ({e}), identity is session-only");
                (secret_key, false)
            }
        }
    }

    /// The derived identity, or `IdentityUnavailable` before the key is loaded.
    pub fn identity(&self) -> Result<Identity> {
        let state = self
            .state
            .lock()
            .map_err(|_| ZapError::Storage("key state poisoned".to_string()))?;
        state.identity.ok_or(ZapError::IdentityUnavailable)
    }

    pub fn public_key(&self) -> Result<String> {
        Ok(self.identity()?.public_key())
    }

    pub fn is_persistent(&self) -> bool {
        self.state.lock().map(|s| s.persistent).unwrap_or(false)
    }
}

fn generate_secret_key() -> SecretKey {
    SecretKey::new(&mut OsRng)
}
