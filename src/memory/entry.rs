use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Mutex;

use crate::sync::lock;

/// `(namespace, key)`.
pub type EntryKey = (String, String);

/// One versioned value. `value == None` is a tombstone left by `delete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub namespace: String,
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Lifetime measured from `updated_at`.
    pub ttl_ms: Option<u64>,
    pub version: u64,
    pub origin_replica: usize,
}

impl MemoryEntry {
    pub fn entry_key(&self) -> EntryKey {
        (self.namespace.clone(), self.key.clone())
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.ttl_ms
            .map(|ttl| self.updated_at + ChronoDuration::milliseconds(ttl as i64))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().map(|at| now > at).unwrap_or(false)
    }

    /// Live means readable: not a tombstone and not expired.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_tombstone() && !self.is_expired_at(now)
    }

    pub fn size_bytes(&self) -> usize {
        self.value.as_ref().map(Vec::len).unwrap_or(0)
    }

    /// Convergence order: version, then `updated_at`, then origin replica id.
    pub fn merge_cmp(&self, other: &MemoryEntry) -> Ordering {
        self.version
            .cmp(&other.version)
            .then(self.updated_at.cmp(&other.updated_at))
            .then(self.origin_replica.cmp(&other.origin_replica))
    }

    pub fn supersedes(&self, other: &MemoryEntry) -> bool {
        self.merge_cmp(other) == Ordering::Greater
    }
}

/// An in-process replica. Availability is toggled to simulate partitions.
#[derive(Debug)]
pub(crate) struct Replica {
    pub(crate) id: usize,
    entries: Mutex<HashMap<EntryKey, MemoryEntry>>,
    available: AtomicBool,
}

impl Replica {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub(crate) fn is_available(&self) -> bool {
        self.available.load(AtomicOrdering::SeqCst)
    }

    pub(crate) fn set_available(&self, available: bool) {
        self.available.store(available, AtomicOrdering::SeqCst);
    }

    pub(crate) fn get(&self, key: &EntryKey) -> Option<MemoryEntry> {
        lock(&self.entries).get(key).cloned()
    }

    /// Merge `entry` in; returns whether it replaced what was stored.
    pub(crate) fn apply(&self, entry: MemoryEntry) -> bool {
        let mut entries = lock(&self.entries);
        let key = entry.entry_key();
        match entries.get(&key) {
            Some(current) if !entry.supersedes(current) => false,
            _ => {
                entries.insert(key, entry);
                true
            }
        }
    }

    /// Put back what was stored before a rejected write.
    pub(crate) fn restore(&self, key: &EntryKey, previous: Option<MemoryEntry>) {
        let mut entries = lock(&self.entries);
        match previous {
            Some(prev) => {
                entries.insert(key.clone(), prev);
            }
            None => {
                entries.remove(key);
            }
        }
    }

    /// Remove `key` only if it still holds `version`.
    pub(crate) fn evict_version(&self, key: &EntryKey, version: u64) -> bool {
        let mut entries = lock(&self.entries);
        if entries.get(key).map(|e| e.version) == Some(version) {
            entries.remove(key);
            return true;
        }
        false
    }

    /// Drop expired entries and tombstones older than `tombstone_cutoff`.
    pub(crate) fn sweep(
        &self,
        now: DateTime<Utc>,
        tombstone_cutoff: Option<DateTime<Utc>>,
    ) -> usize {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, e| {
            if e.is_tombstone() {
                return tombstone_cutoff.map(|cut| e.updated_at > cut).unwrap_or(true);
            }
            !e.is_expired_at(now)
        });
        before - entries.len()
    }

    pub(crate) fn snapshot(&self) -> Vec<MemoryEntry> {
        lock(&self.entries).values().cloned().collect()
    }

    pub(crate) fn replace_all(&self, new_entries: Vec<MemoryEntry>) {
        let mut entries = lock(&self.entries);
        entries.clear();
        for e in new_entries {
            entries.insert(e.entry_key(), e);
        }
    }
}
