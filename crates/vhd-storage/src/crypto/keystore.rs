use super::{check_key, Key, KeyHash};

/// Keys already verified during this process, indexed by the keyhash they matched.
///
/// A snapshot created after its chain was opened carries its own keyhash but no keyfile;
/// [`Keystore::find`] lets it reuse a key already verified for one of its ancestors.
#[derive(Debug, Default)]
pub struct Keystore {
    // Newest first.
    entries: Vec<(KeyHash, Key)>,
}

impl Keystore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caches `key` under `keyhash`; adding the same keyhash again is a no-op.
    pub fn add(&mut self, key: &Key, keyhash: &KeyHash) {
        if self.entries.iter().any(|(kh, _)| kh == keyhash) {
            return;
        }
        self.entries.insert(0, (keyhash.clone(), key.clone()));
    }

    /// First cached key, newest first, that verifies against `keyhash`.
    pub fn find(&self, keyhash: &KeyHash) -> Option<&Key> {
        self.entries
            .iter()
            .map(|(_, key)| key)
            .find(|key| check_key(key, keyhash).is_ok())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
