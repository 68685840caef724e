//! Replicated key/value memory shared by agents.
//!
//! Replicas live in-process; replica 0 is local. Under eventual consistency a
//! write is acknowledged once the local replica has it and a background
//! worker propagates it to the others. Under strong consistency a write
//! either reaches a quorum or leaves nothing behind.

mod backup;
mod entry;

pub use backup::BackupInfo;
pub use entry::{EntryKey, MemoryEntry};

use anyhow::{anyhow, Result};
use chrono::{Duration as ChronoDuration, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{Consistency, MemoryConfig};
use crate::error::{SwarmError, SwarmResult};
use crate::sync::lock;
use entry::Replica;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStatistics {
    pub total_entries: usize,
    pub total_size: usize,
    pub namespace_counts: BTreeMap<String, usize>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub pending_replication: usize,
    pub available_replicas: usize,
    pub replication_factor: usize,
}

struct ReplicationJob {
    entry: MemoryEntry,
    targets: Vec<usize>,
    due: Instant,
}

struct CachedValue {
    entry: MemoryEntry,
    cached_at: Instant,
}

struct StoreInner {
    config: MemoryConfig,
    replicas: Vec<Replica>,
    cache: Mutex<LruCache<EntryKey, CachedValue>>,
    /// Serializes version assignment.
    write_lock: Mutex<()>,
    /// Highest version assigned per key. Outlives lazy eviction so a rewrite
    /// always supersedes copies still held by lagging replicas.
    high_water: Mutex<HashMap<EntryKey, u64>>,
    pending: AtomicUsize,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    stop: Mutex<bool>,
    wake: Condvar,
}

impl StoreInner {
    fn quorum(&self) -> usize {
        let rf = self.replicas.len();
        ((rf + 1) / 2 + 1).min(rf)
    }

    fn available(&self) -> Vec<&Replica> {
        self.replicas.iter().filter(|r| r.is_available()).collect()
    }

    fn invalidate(&self, key: &EntryKey) {
        lock(&self.cache).pop(key);
    }

    fn cached(&self, key: &EntryKey) -> Option<MemoryEntry> {
        let ttl = Duration::from_millis(self.config.cache_ttl_ms);
        let mut cache = lock(&self.cache);
        let hit = cache
            .get(key)
            .map(|c| (c.cached_at.elapsed() < ttl, c.entry.clone()));
        match hit {
            Some((true, entry)) => Some(entry),
            Some((false, _)) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    fn sweep(&self) -> usize {
        let now = Utc::now();
        let cutoff = if self.pending.load(Ordering::SeqCst) == 0 {
            Some(now - ChronoDuration::milliseconds(self.config.sweep_interval_ms as i64))
        } else {
            None
        };
        let removed: usize = self
            .available()
            .iter()
            .map(|r| r.sweep(now, cutoff))
            .sum();
        if removed > 0 {
            debug!(removed, "memory sweep removed expired entries");
        }
        self.prune_high_water();
        removed
    }

    /// Forget version marks for keys no replica holds any more. Only safe
    /// while nothing is queued for replication.
    fn prune_high_water(&self) {
        let _guard = lock(&self.write_lock);
        if self.pending.load(Ordering::SeqCst) > 0 {
            return;
        }
        lock(&self.high_water)
            .retain(|key, _| self.replicas.iter().any(|r| r.get(key).is_some()));
    }

    fn backup(&self) -> Result<BackupInfo> {
        let dir = self
            .config
            .backup_dir
            .as_ref()
            .ok_or_else(|| anyhow!("backups are disabled: memory.backup_dir is not set"))?;
        let info = backup::write_backup(dir, self.replicas[0].snapshot())?;
        let pruned = backup::prune_backups(dir, self.config.max_backups)?;
        info!(
            backup = %info.id,
            entries = info.entry_count,
            pruned,
            "memory backup written"
        );
        Ok(info)
    }
}

pub struct MemoryStore {
    inner: Arc<StoreInner>,
    replication_tx: Mutex<Option<Sender<ReplicationJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl MemoryStore {
    /// Build the store and start its replication and maintenance threads.
    pub fn new(config: MemoryConfig) -> Self {
        let rf = config.replication_factor.max(1);
        let cache_size = NonZeroUsize::new(config.cache_size).unwrap_or(NonZeroUsize::MIN);
        let inner = Arc::new(StoreInner {
            replicas: (0..rf).map(Replica::new).collect(),
            cache: Mutex::new(LruCache::new(cache_size)),
            write_lock: Mutex::new(()),
            high_water: Mutex::new(HashMap::new()),
            pending: AtomicUsize::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            stop: Mutex::new(false),
            wake: Condvar::new(),
            config,
        });

        let (tx, rx) = mpsc::channel();
        let mut workers = Vec::new();
        let repl_inner = Arc::clone(&inner);
        workers.push(thread::spawn(move || replication_loop(repl_inner, rx)));
        let maint_inner = Arc::clone(&inner);
        workers.push(thread::spawn(move || maintenance_loop(maint_inner)));

        info!(
            replication_factor = rf,
            consistency = ?inner.config.consistency,
            "memory store started"
        );
        Self {
            inner,
            replication_tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.inner.config
    }

    pub fn quorum(&self) -> usize {
        self.inner.quorum()
    }

    /// Store `value`; returns the new version of the key.
    pub fn put(
        &self,
        namespace: &str,
        key: &str,
        value: impl Into<Vec<u8>>,
        ttl: Option<Duration>,
    ) -> SwarmResult<u64> {
        let ttl_ms = ttl.map(|d| d.as_millis() as u64);
        self.write(namespace, key, Some(value.into()), ttl_ms)
    }

    /// Tombstone the key; returns the tombstone's version.
    pub fn delete(&self, namespace: &str, key: &str) -> SwarmResult<u64> {
        self.write(namespace, key, None, None)
    }

    fn write(
        &self,
        namespace: &str,
        key: &str,
        value: Option<Vec<u8>>,
        ttl_ms: Option<u64>,
    ) -> SwarmResult<u64> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SwarmError::ShuttingDown);
        }
        let inner = &self.inner;
        let _guard = lock(&inner.write_lock);
        let entry_key = (namespace.to_string(), key.to_string());
        let now = Utc::now();
        let floor = lock(&inner.high_water)
            .get(&entry_key)
            .copied()
            .unwrap_or(0);
        let build = |prev: Option<&MemoryEntry>| MemoryEntry {
            namespace: namespace.to_string(),
            key: key.to_string(),
            created_at: prev
                .filter(|p| !p.is_tombstone())
                .map(|p| p.created_at)
                .unwrap_or(now),
            updated_at: now,
            value: value.clone(),
            ttl_ms,
            version: prev.map(|p| p.version).unwrap_or(0).max(floor) + 1,
            origin_replica: 0,
        };

        let (entry, lagging) = match inner.config.consistency {
            Consistency::Eventual => {
                let local = &inner.replicas[0];
                if !local.is_available() {
                    return Err(SwarmError::QuorumUnavailable {
                        acks: 0,
                        required: 1,
                    });
                }
                let entry = build(local.get(&entry_key).as_ref());
                local.apply(entry.clone());
                let lagging: Vec<usize> = (1..inner.replicas.len()).collect();
                (entry, lagging)
            }
            Consistency::Strong => {
                let quorum = inner.quorum();
                let available = inner.available();
                if available.len() < quorum {
                    warn!(
                        namespace,
                        key,
                        available = available.len(),
                        quorum,
                        "strong write rejected: quorum unavailable"
                    );
                    return Err(SwarmError::QuorumUnavailable {
                        acks: available.len(),
                        required: quorum,
                    });
                }
                let newest = available
                    .iter()
                    .filter_map(|r| r.get(&entry_key))
                    .max_by(|a, b| a.merge_cmp(b));
                let entry = build(newest.as_ref());

                let mut previous = Vec::with_capacity(available.len());
                let mut acks = 0;
                for replica in &available {
                    previous.push((*replica, replica.get(&entry_key)));
                    replica.apply(entry.clone());
                    if replica.is_available() {
                        acks += 1;
                    }
                }
                if acks < quorum {
                    for (replica, prev) in previous {
                        replica.restore(&entry_key, prev);
                    }
                    warn!(namespace, key, acks, quorum, "strong write rolled back");
                    return Err(SwarmError::QuorumUnavailable {
                        acks,
                        required: quorum,
                    });
                }
                let written: Vec<usize> = available.iter().map(|r| r.id).collect();
                let lagging: Vec<usize> = (0..inner.replicas.len())
                    .filter(|id| !written.contains(id))
                    .collect();
                (entry, lagging)
            }
        };

        let version = entry.version;
        lock(&inner.high_water).insert(entry_key.clone(), version);
        inner.invalidate(&entry_key);
        debug!(
            namespace,
            key,
            version,
            tombstone = entry.is_tombstone(),
            "memory write"
        );
        self.enqueue(entry, lagging)?;
        Ok(version)
    }

    fn enqueue(&self, entry: MemoryEntry, targets: Vec<usize>) -> SwarmResult<()> {
        if targets.is_empty() {
            return Ok(());
        }
        let count = targets.len();
        let job = ReplicationJob {
            entry,
            targets,
            due: Instant::now() + Duration::from_millis(self.inner.config.replication_delay_ms),
        };
        let tx = lock(&self.replication_tx);
        let Some(tx) = tx.as_ref() else {
            return Err(SwarmError::ShuttingDown);
        };
        self.inner.pending.fetch_add(count, Ordering::SeqCst);
        if tx.send(job).is_err() {
            self.inner.pending.fetch_sub(count, Ordering::SeqCst);
            return Err(SwarmError::ShuttingDown);
        }
        Ok(())
    }

    /// Read a live value. Expired entries are evicted on the way.
    pub fn get(&self, namespace: &str, key: &str) -> SwarmResult<Vec<u8>> {
        let entry = self.get_entry(namespace, key)?;
        entry
            .value
            .ok_or_else(|| SwarmError::NotFound(format!("{namespace}/{key}")))
    }

    pub fn get_entry(&self, namespace: &str, key: &str) -> SwarmResult<MemoryEntry> {
        let inner = &self.inner;
        let entry_key = (namespace.to_string(), key.to_string());
        let not_found = || SwarmError::NotFound(format!("{namespace}/{key}"));
        let now = Utc::now();

        let found = match inner.config.consistency {
            Consistency::Eventual => {
                if let Some(entry) = inner.cached(&entry_key) {
                    if entry.is_live_at(now) {
                        inner.cache_hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(entry);
                    }
                    inner.invalidate(&entry_key);
                }
                inner.cache_misses.fetch_add(1, Ordering::Relaxed);
                let replica = inner
                    .replicas
                    .iter()
                    .find(|r| r.is_available())
                    .ok_or(SwarmError::QuorumUnavailable {
                        acks: 0,
                        required: 1,
                    })?;
                replica.get(&entry_key).map(|e| (e, vec![replica]))
            }
            Consistency::Strong => {
                let quorum = inner.quorum();
                let available = inner.available();
                if available.len() < quorum {
                    return Err(SwarmError::QuorumUnavailable {
                        acks: available.len(),
                        required: quorum,
                    });
                }
                let consulted: Vec<&Replica> = available.into_iter().take(quorum).collect();
                let newest = consulted
                    .iter()
                    .filter_map(|r| r.get(&entry_key))
                    .max_by(|a, b| a.merge_cmp(b));
                if let Some(newest) = &newest {
                    for replica in &consulted {
                        replica.apply(newest.clone());
                    }
                }
                newest.map(|e| (e, consulted))
            }
        };

        let Some((entry, consulted)) = found else {
            return Err(not_found());
        };
        if entry.is_expired_at(now) {
            for replica in consulted {
                replica.evict_version(&entry_key, entry.version);
            }
            inner.invalidate(&entry_key);
            debug!(namespace, key, "evicted expired entry on read");
            return Err(not_found());
        }
        if entry.is_tombstone() {
            return Err(not_found());
        }
        if inner.config.consistency == Consistency::Eventual {
            lock(&inner.cache).put(
                entry_key,
                CachedValue {
                    entry: entry.clone(),
                    cached_at: Instant::now(),
                },
            );
        }
        Ok(entry)
    }

    /// Live keys of `namespace` on the local replica, sorted.
    pub fn list_keys(&self, namespace: &str) -> Vec<String> {
        let now = Utc::now();
        let mut keys: Vec<String> = self.inner.replicas[0]
            .snapshot()
            .into_iter()
            .filter(|e| e.namespace == namespace && e.is_live_at(now))
            .map(|e| e.key)
            .collect();
        keys.sort();
        keys
    }

    /// Delete every live key of `namespace`; returns how many were deleted.
    pub fn clear_namespace(&self, namespace: &str) -> SwarmResult<usize> {
        let keys = self.list_keys(namespace);
        for key in &keys {
            self.delete(namespace, key)?;
        }
        Ok(keys.len())
    }

    /// Anti-entropy: push the newest version of every key to every available
    /// replica. Returns how many replica entries were repaired.
    pub fn sync_replicas(&self) -> usize {
        let inner = &self.inner;
        let _guard = lock(&inner.write_lock);
        let available = inner.available();
        let mut winners: HashMap<EntryKey, MemoryEntry> = HashMap::new();
        for replica in &available {
            for e in replica.snapshot() {
                let key = e.entry_key();
                match winners.get(&key) {
                    Some(current) if !e.supersedes(current) => {}
                    _ => {
                        winners.insert(key, e);
                    }
                }
            }
        }
        // An expired winner is left to the sweeper rather than copied around.
        let now = Utc::now();
        winners.retain(|_, e| !e.is_expired_at(now));
        let mut repaired = 0;
        for replica in &available {
            for e in winners.values() {
                if replica.apply(e.clone()) {
                    repaired += 1;
                    if replica.id == 0 {
                        inner.invalidate(&e.entry_key());
                    }
                }
            }
        }
        info!(
            repaired,
            replicas = available.len(),
            "anti-entropy sync finished"
        );
        repaired
    }

    pub fn set_replica_available(&self, replica_id: usize, available: bool) -> SwarmResult<()> {
        let replica = self
            .inner
            .replicas
            .get(replica_id)
            .ok_or_else(|| SwarmError::NotFound(format!("replica {replica_id}")))?;
        replica.set_available(available);
        info!(replica = replica_id, available, "replica availability changed");
        Ok(())
    }

    /// Live value stored on one replica, bypassing cache and quorum.
    pub fn replica_value(&self, replica_id: usize, namespace: &str, key: &str) -> Option<Vec<u8>> {
        let replica = self.inner.replicas.get(replica_id)?;
        replica
            .get(&(namespace.to_string(), key.to_string()))
            .filter(|e| e.is_live_at(Utc::now()))
            .and_then(|e| e.value)
    }

    /// Wait until queued replication drains; false on timeout.
    pub fn flush_replication(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.inner.pending.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
        true
    }

    /// Drop expired entries now instead of waiting for the sweeper.
    pub fn sweep_expired(&self) -> usize {
        self.inner.sweep()
    }

    pub fn get_statistics(&self) -> MemoryStatistics {
        let inner = &self.inner;
        let now = Utc::now();
        let mut stats = MemoryStatistics {
            cache_hits: inner.cache_hits.load(Ordering::Relaxed),
            cache_misses: inner.cache_misses.load(Ordering::Relaxed),
            pending_replication: inner.pending.load(Ordering::SeqCst),
            available_replicas: inner.available().len(),
            replication_factor: inner.replicas.len(),
            ..MemoryStatistics::default()
        };
        for e in inner.replicas[0].snapshot() {
            if !e.is_live_at(now) {
                continue;
            }
            stats.total_entries += 1;
            stats.total_size += e.size_bytes();
            *stats.namespace_counts.entry(e.namespace).or_insert(0) += 1;
        }
        stats
    }

    pub fn backup_now(&self) -> Result<BackupInfo> {
        self.inner.backup()
    }

    pub fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        match &self.inner.config.backup_dir {
            Some(dir) => backup::list_backups(dir),
            None => Ok(Vec::new()),
        }
    }

    /// Replace the contents of every replica with a verified backup.
    pub fn restore_backup(&self, backup_id: &str) -> Result<usize> {
        let dir = self
            .inner
            .config
            .backup_dir
            .as_ref()
            .ok_or_else(|| anyhow!("backups are disabled: memory.backup_dir is not set"))?;
        let entries = backup::read_backup(dir, backup_id)?;
        let count = entries.len();
        let _guard = lock(&self.inner.write_lock);
        for replica in &self.inner.replicas {
            replica.replace_all(entries.clone());
        }
        lock(&self.inner.cache).clear();
        info!(backup = backup_id, entries = count, "memory restored from backup");
        Ok(count)
    }

    fn signal_stop(&self) {
        *lock(&self.inner.stop) = true;
        self.inner.wake.notify_all();
        lock(&self.replication_tx).take();
    }

    /// Stop background threads, flush replication within `flush_timeout` and
    /// write a final backup when backups are configured. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.signal_stop();
        let handles: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("memory store worker panicked");
            }
        }
        if self.inner.config.backup_dir.is_some() {
            self.inner.backup()?;
        }
        info!("memory store shut down");
        Ok(())
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            self.signal_stop();
        }
    }
}

fn replication_loop(inner: Arc<StoreInner>, rx: Receiver<ReplicationJob>) {
    let retry = Duration::from_millis(inner.config.replication_retry_ms.max(1));
    let mut queue: VecDeque<ReplicationJob> = VecDeque::new();
    let mut flush_deadline: Option<Instant> = None;

    loop {
        let now = Instant::now();
        let wait = queue
            .iter()
            .map(|j| j.due.saturating_duration_since(now))
            .min()
            .unwrap_or(retry)
            .min(retry);

        if flush_deadline.is_none() {
            match rx.recv_timeout(wait) {
                Ok(job) => queue.push_back(job),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    flush_deadline = Some(
                        Instant::now() + Duration::from_millis(inner.config.flush_timeout_ms),
                    );
                }
            }
            while let Ok(job) = rx.try_recv() {
                queue.push_back(job);
            }
        } else if !queue.is_empty() {
            thread::sleep(wait.max(Duration::from_millis(1)));
        }

        let now = Instant::now();
        let mut waiting = VecDeque::with_capacity(queue.len());
        for mut job in queue.drain(..) {
            if job.due > now {
                waiting.push_back(job);
                continue;
            }
            job.targets.retain(|&target| {
                let replica = &inner.replicas[target];
                if !replica.is_available() {
                    return true;
                }
                replica.apply(job.entry.clone());
                inner.pending.fetch_sub(1, Ordering::SeqCst);
                false
            });
            if !job.targets.is_empty() {
                job.due = now + retry;
                waiting.push_back(job);
            }
        }
        queue = waiting;

        if let Some(deadline) = flush_deadline {
            if queue.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                let dropped: usize = queue.iter().map(|j| j.targets.len()).sum();
                inner.pending.fetch_sub(dropped, Ordering::SeqCst);
                warn!(dropped, "replication flush timed out; dropping queued updates");
                break;
            }
        }
    }
    debug!("replication worker stopped");
}

fn maintenance_loop(inner: Arc<StoreInner>) {
    let sweep_every = Duration::from_millis(inner.config.sweep_interval_ms.max(1));
    let backup_every = Duration::from_millis(inner.config.backup_interval_ms.max(1));
    let backups_enabled = inner.config.backup_dir.is_some();
    let mut next_sweep = Instant::now() + sweep_every;
    let mut next_backup = Instant::now() + backup_every;

    loop {
        let next = if backups_enabled {
            next_sweep.min(next_backup)
        } else {
            next_sweep
        };
        {
            let stopped = lock(&inner.stop);
            if *stopped {
                break;
            }
            let wait = next.saturating_duration_since(Instant::now());
            let stopped = match inner.wake.wait_timeout(stopped, wait) {
                Ok((g, _)) => g,
                Err(poisoned) => poisoned.into_inner().0,
            };
            if *stopped {
                break;
            }
        }

        let now = Instant::now();
        if now >= next_sweep {
            inner.sweep();
            next_sweep = now + sweep_every;
        }
        if backups_enabled && now >= next_backup {
            if let Err(err) = inner.backup() {
                warn!(error = %format!("{err:#}"), "periodic memory backup failed");
            }
            next_backup = now + backup_every;
        }
    }
    debug!("memory maintenance worker stopped");
}
