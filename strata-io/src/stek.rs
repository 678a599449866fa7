use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use rand::RngCore;
use std::path::Path;
use std::sync::RwLock;
use thiserror::Error;

pub const STEK_NAME_LEN: usize = 16;
pub const STEK_AES_LEN: usize = 16;
pub const STEK_HMAC_LEN: usize = 16;
/// Total serialized key size.
pub const STEK_SIZE: usize = STEK_NAME_LEN + STEK_AES_LEN + STEK_HMAC_LEN;

#[derive(Debug, Error)]
pub enum StekError {
    #[error("ticket key file I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("ticket key decode: {0}")]
    Decode(String),
}

/// One session-ticket encryption key: 16-byte name, 16-byte AES key,
/// 16-byte HMAC secret.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TicketKey {
    pub key_name: [u8; STEK_NAME_LEN],
    pub aes_key: [u8; STEK_AES_LEN],
    pub hmac_secret: [u8; STEK_HMAC_LEN],
}

impl TicketKey {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut key = Self {
            key_name: [0; STEK_NAME_LEN],
            aes_key: [0; STEK_AES_LEN],
            hmac_secret: [0; STEK_HMAC_LEN],
        };
        rng.fill_bytes(&mut key.key_name);
        rng.fill_bytes(&mut key.aes_key);
        rng.fill_bytes(&mut key.hmac_secret);
        key
    }

    pub fn to_bytes(&self) -> [u8; STEK_SIZE] {
        let mut out = [0u8; STEK_SIZE];
        out[..STEK_NAME_LEN].copy_from_slice(&self.key_name);
        out[STEK_NAME_LEN..STEK_NAME_LEN + STEK_AES_LEN].copy_from_slice(&self.aes_key);
        out[STEK_NAME_LEN + STEK_AES_LEN..].copy_from_slice(&self.hmac_secret);
        out
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, StekError> {
        if raw.len() != STEK_SIZE {
            return Err(StekError::Decode(format!(
                "expected {STEK_SIZE} bytes, got {}",
                raw.len()
            )));
        }
        let mut key = Self {
            key_name: [0; STEK_NAME_LEN],
            aes_key: [0; STEK_AES_LEN],
            hmac_secret: [0; STEK_HMAC_LEN],
        };
        key.key_name.copy_from_slice(&raw[..STEK_NAME_LEN]);
        key.aes_key
            .copy_from_slice(&raw[STEK_NAME_LEN..STEK_NAME_LEN + STEK_AES_LEN]);
        key.hmac_secret
            .copy_from_slice(&raw[STEK_NAME_LEN + STEK_AES_LEN..]);
        Ok(key)
    }
}

impl std::fmt::Debug for TicketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        write!(f, "TicketKey(name={:02x?}..)", &self.key_name[..4])
    }
}

#[derive(Clone, Copy)]
struct Slots {
    current: TicketKey,
    previous: Option<TicketKey>,
    incoming: Option<TicketKey>,
}

/// Process-wide triple-buffered ticket-key store: the `current` key encrypts
/// new tickets, `previous` still decrypts recently issued ones, `incoming`
/// is staged (e.g. received from a peer) and promoted on rotation.
pub struct StekStore {
    slots: RwLock<Slots>,
}

impl StekStore {
    pub fn new_random() -> Self {
        Self {
            slots: RwLock::new(Slots {
                current: TicketKey::generate(),
                previous: None,
                incoming: None,
            }),
        }
    }

    /// Keys usable for ticket decryption, current first.
    pub fn active_keys(&self) -> Vec<TicketKey> {
        let s = self.slots.read().unwrap_or_else(|e| e.into_inner());
        let mut keys = vec![s.current];
        if let Some(prev) = s.previous {
            keys.push(prev);
        }
        keys
    }

    pub fn current(&self) -> TicketKey {
        self.slots.read().unwrap_or_else(|e| e.into_inner()).current
    }

    /// Stage a key (from a peer or a reload) for the next rotation.
    pub fn stage_incoming(&self, key: TicketKey) {
        let mut s = self.slots.write().unwrap_or_else(|e| e.into_inner());
        s.incoming = Some(key);
    }

    /// Promote: current → previous, incoming (or a fresh key) → current.
    pub fn rotate(&self) -> TicketKey {
        let mut s = self.slots.write().unwrap_or_else(|e| e.into_inner());
        s.previous = Some(s.current);
        s.current = s.incoming.take().unwrap_or_else(TicketKey::generate);
        s.current
    }

    pub fn save(&self, path: &Path) -> Result<(), StekError> {
        let s = self.slots.read().unwrap_or_else(|e| e.into_inner());
        let mut lines = vec![B64.encode(s.current.to_bytes())];
        if let Some(prev) = s.previous {
            lines.push(B64.encode(prev.to_bytes()));
        }
        std::fs::write(path, lines.join("\n"))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, StekError> {
        let text = std::fs::read_to_string(path)?;
        let mut keys = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let raw = B64
                .decode(line.trim())
                .map_err(|e| StekError::Decode(e.to_string()))?;
            keys.push(TicketKey::from_bytes(&raw)?);
        }
        let mut iter = keys.into_iter();
        let current = iter
            .next()
            .ok_or_else(|| StekError::Decode("empty ticket key file".into()))?;
        Ok(Self {
            slots: RwLock::new(Slots {
                current,
                previous: iter.next(),
                incoming: None,
            }),
        })
    }
}
