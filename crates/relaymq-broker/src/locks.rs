//! Striped locks serializing handshake steps per (client, message id).

use parking_lot::{Mutex, MutexGuard};
use relaymq_core::InFlightKey;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const DEFAULT_STRIPES: usize = 64;

/// Fixed set of mutexes; a key always maps to the same stripe.
///
/// Two handshake steps on one key never interleave. Distinct keys only
/// contend when they share a stripe.
#[derive(Debug)]
pub struct KeyLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyLocks {
    /// Create `stripes` locks (at least one).
    #[must_use]
    pub fn new(stripes: usize) -> Self {
        let stripes = (0..stripes.max(1)).map(|_| Mutex::new(())).collect();
        Self { stripes }
    }

    /// Hold the lock guarding `key` until the guard is dropped.
    pub fn lock(&self, key: &InFlightKey) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe(key)].lock()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn stripe(&self, key: &InFlightKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.stripes.len()
    }
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new(DEFAULT_STRIPES)
    }
}
