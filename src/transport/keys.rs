use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::sync::Arc;
use tracing::info;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::kernel::time::{unix_now, Timestamp};

pub const KEY_LEN: usize = 32;

/// HMAC key material. Wiped on drop, never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey(Vec<u8>);

impl SecretKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn generate() -> Self {
        let mut bytes = vec![0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey(<{} bytes redacted>)", self.0.len())
    }
}

/// Supplies HMAC keys to both sides of the channel.
pub trait KeyProvider: Send + Sync {
    /// Key used for new signatures.
    fn signing_key(&self) -> Arc<SecretKey>;

    /// Keys accepted for verification at `now`: the current key first, then
    /// the prior key while its rotation grace period lasts.
    fn verification_keys_at(&self, now: Timestamp) -> Vec<Arc<SecretKey>>;

    fn verification_keys(&self) -> Vec<Arc<SecretKey>> {
        self.verification_keys_at(unix_now())
    }
}

#[derive(Debug)]
struct RingState {
    current: Arc<SecretKey>,
    previous: Option<(Arc<SecretKey>, Timestamp)>,
    rotations: u64,
}

/// Current key plus the immediately prior key for an overlap window.
#[derive(Debug)]
pub struct KeyRing {
    grace_s: f64,
    state: RwLock<RingState>,
}

impl KeyRing {
    pub fn new(key: SecretKey, grace_s: u64) -> Self {
        Self {
            grace_s: grace_s as f64,
            state: RwLock::new(RingState {
                current: Arc::new(key),
                previous: None,
                rotations: 0,
            }),
        }
    }

    pub fn generate(grace_s: u64) -> Self {
        Self::new(SecretKey::generate(), grace_s)
    }

    pub fn rotate(&self, next: SecretKey) {
        self.rotate_at(next, unix_now())
    }

    /// Install `next` as the signing key; the old key keeps verifying until
    /// `now + grace`. Only one prior key is retained.
    pub fn rotate_at(&self, next: SecretKey, now: Timestamp) {
        let mut state = self.state.write();
        let old = std::mem::replace(&mut state.current, Arc::new(next));
        state.previous = Some((old, now + self.grace_s));
        state.rotations += 1;
        info!("HMAC key rotated (rotation #{})", state.rotations);
    }

    pub fn rotations(&self) -> u64 {
        self.state.read().rotations
    }
}

impl KeyProvider for KeyRing {
    fn signing_key(&self) -> Arc<SecretKey> {
        self.state.read().current.clone()
    }

    fn verification_keys_at(&self, now: Timestamp) -> Vec<Arc<SecretKey>> {
        let state = self.state.read();
        let mut keys = vec![state.current.clone()];
        if let Some((prev, expires)) = &state.previous {
            if now <= *expires {
                keys.push(prev.clone());
            }
        }
        keys
    }
}
