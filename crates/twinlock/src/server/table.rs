//! In-memory lock table.
//!
//! Every key gets a [`LockerInfo`] that lives for the rest of the process.
//! Each identity gets a keyset that records the keys it holds. Lock order is
//! always key mutex, then keyset mutex, and no code path holds two keysets.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use twinlock_proto::LockInfo;

/// How a locker last changed hands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LockerTag {
    Free = 0,
    Granted = 1,
    Released = 2,
    Forced = 3,
}

impl LockerTag {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LockerTag::Granted,
            2 => LockerTag::Released,
            3 => LockerTag::Forced,
            _ => LockerTag::Free,
        }
    }
}

/// One key's lock.
#[derive(Debug)]
pub struct LockerInfo {
    key: String,
    owner: Mutex<Option<String>>,
    taken: AtomicBool,
    tag: AtomicU8,
}

impl LockerInfo {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            owner: Mutex::new(None),
            taken: AtomicBool::new(false),
            tag: AtomicU8::new(LockerTag::Free as u8),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_taken(&self) -> bool {
        self.taken.load(Ordering::Acquire)
    }

    pub fn tag(&self) -> LockerTag {
        LockerTag::from_u8(self.tag.load(Ordering::Relaxed))
    }

    fn owner(&self) -> MutexGuard<'_, Option<String>> {
        self.owner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_tag(&self, tag: LockerTag) {
        self.tag.store(tag as u8, Ordering::Relaxed);
    }
}

type KeySet = Arc<Mutex<HashSet<String>>>;

fn lock_set(set: &KeySet) -> MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
pub struct LockTable {
    lockers: RwLock<HashMap<String, Arc<LockerInfo>>>,
    keysets: RwLock<HashMap<String, KeySet>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn existing(&self, key: &str) -> Option<Arc<LockerInfo>> {
        let lockers = self.lockers.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        lockers.get(key).cloned()
    }

    fn locker(&self, key: &str) -> Arc<LockerInfo> {
        if let Some(info) = self.existing(key) {
            return info;
        }
        let mut lockers = self.lockers.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        lockers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(LockerInfo::new(key)))
            .clone()
    }

    fn existing_keyset(&self, identity: &str) -> Option<KeySet> {
        let keysets = self.keysets.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        keysets.get(identity).cloned()
    }

    fn keyset(&self, identity: &str) -> KeySet {
        if let Some(set) = self.existing_keyset(identity) {
            return set;
        }
        let mut keysets = self.keysets.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        keysets.entry(identity.to_string()).or_default().clone()
    }

    /// Grant `key` to `identity` if it is free. A held key is never granted
    /// again, not even to its current owner.
    pub fn enter(&self, key: &str, identity: &str) -> bool {
        let info = self.locker(key);
        let mut owner = info.owner();
        if info
            .taken
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let keyset = self.keyset(identity);
        if !lock_set(&keyset).insert(key.to_string()) {
            // Keyset says we already hold it while the locker says free: keep
            // the locker authoritative and refuse.
            info.taken.store(false, Ordering::Release);
            return false;
        }
        *owner = Some(identity.to_string());
        info.set_tag(LockerTag::Granted);
        true
    }

    /// Release `key` if `identity` holds it.
    pub fn exit(&self, key: &str, identity: &str) -> bool {
        self.release(key, Some(identity), LockerTag::Released).is_some()
    }

    /// Release `key` whoever holds it, returning the previous owner.
    pub fn force_exit(&self, key: &str) -> Option<String> {
        self.release(key, None, LockerTag::Forced)
    }

    fn release(&self, key: &str, expected: Option<&str>, tag: LockerTag) -> Option<String> {
        let info = self.existing(key)?;
        let mut owner = info.owner();
        match (owner.as_deref(), expected) {
            (None, _) => return None,
            (Some(current), Some(expected)) if current != expected => return None,
            _ => {}
        }
        let identity = owner.take()?;
        if let Some(keyset) = self.existing_keyset(&identity) {
            lock_set(&keyset).remove(key);
        }
        info.taken.store(false, Ordering::Release);
        info.set_tag(tag);
        Some(identity)
    }

    /// Release every key `identity` holds and return them.
    ///
    /// The keyset is drained and unlocked before any key mutex is taken.
    pub fn exit_all(&self, identity: &str) -> Vec<String> {
        let Some(keyset) = self.existing_keyset(identity) else {
            return Vec::new();
        };
        let keys: Vec<String> = lock_set(&keyset).drain().collect();
        keys.into_iter()
            .filter(|key| self.release(key, Some(identity), LockerTag::Forced).is_some())
            .collect()
    }

    pub fn owner_of(&self, key: &str) -> Option<String> {
        self.existing(key).and_then(|info| info.owner().clone())
    }

    pub fn tag_of(&self, key: &str) -> Option<LockerTag> {
        self.existing(key).map(|info| info.tag())
    }

    pub fn keys_of(&self, identity: &str) -> Vec<String> {
        let Some(keyset) = self.existing_keyset(identity) else {
            return Vec::new();
        };
        let mut keys: Vec<String> = lock_set(&keyset).iter().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.lockers.read().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every key this table has ever seen, sorted by key.
    pub fn snapshot(&self) -> Vec<LockInfo> {
        let lockers: Vec<Arc<LockerInfo>> = {
            let lockers = self.lockers.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            lockers.values().cloned().collect()
        };
        let mut rows: Vec<LockInfo> = lockers
            .iter()
            .map(|info| {
                let owner = info.owner().clone();
                LockInfo {
                    key: info.key.clone(),
                    available: owner.is_none(),
                    identity: owner,
                }
            })
            .collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        rows
    }

    /// Release `key` only if `identity` still holds it, tagging it forced.
    pub fn force_exit_held_by(&self, key: &str, identity: &str) -> bool {
        self.release(key, Some(identity), LockerTag::Forced).is_some()
    }

    /// Take a peer's word that `identity` holds `key`.
    ///
    /// A key held locally by someone else keeps whichever owner sorts first,
    /// so two servers that granted the same key settle on the same owner.
    /// Returns true when the local table changed.
    pub fn adopt(&self, key: &str, identity: &str) -> bool {
        match self.owner_of(key) {
            Some(current) if current.as_str() <= identity => false,
            Some(_) => {
                self.force_exit(key);
                self.enter(key, identity)
            }
            None => self.enter(key, identity),
        }
    }

    /// Merge a peer snapshot into this table. Every hold the peer lists is
    /// adopted; local holds survive even where the peer lists the key as
    /// available, since a free row cannot tell a missed exit from a missed
    /// grant. Merging the same rows twice changes nothing the second time.
    /// Returns the number of keys changed.
    pub fn load_all_info(&self, rows: &[LockInfo]) -> usize {
        let mut changed = 0;
        for row in rows {
            match (row.available, row.identity.as_deref()) {
                (false, Some(identity)) => {
                    if self.adopt(&row.key, identity) {
                        changed += 1;
                    }
                }
                _ => {
                    self.locker(&row.key);
                }
            }
        }
        changed
    }
}
