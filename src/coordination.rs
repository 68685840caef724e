//! Resource-lock arbitration, deadlock detection and acknowledged messaging
//! between agents.
//!
//! Locks are leases: a lock whose `timeout` has elapsed no longer excludes
//! anyone, even if its holder never released it. Waiters block on a condvar
//! until a release, their own deadline, or the current lease expiry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::CoordinationConfig;
use crate::error::{SwarmError, SwarmResult};
use crate::model::new_id;
use crate::sync::lock;

/// Proof of a granted lock. Releasing a token whose lock already expired or
/// was re-granted is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken {
    pub resource_id: String,
    pub holder: String,
    generation: u64,
}

impl LockToken {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Public view of a live lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLock {
    pub resource_id: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub timeout_ms: u64,
}

#[derive(Debug)]
struct HeldLock {
    holder: String,
    acquired_at: DateTime<Utc>,
    expires: Instant,
    generation: u64,
}

#[derive(Debug, Default)]
struct LockTable {
    locks: HashMap<String, HeldLock>,
    /// Wait-for edges: requester -> resource it is blocked on.
    waiting: HashMap<String, String>,
    next_generation: u64,
}

impl LockTable {
    fn drop_if_expired(&mut self, resource_id: &str, now: Instant) -> bool {
        let expired = self
            .locks
            .get(resource_id)
            .map(|held| held.expires <= now)
            .unwrap_or(false);
        if expired {
            if let Some(held) = self.locks.remove(resource_id) {
                debug!(resource = resource_id, holder = %held.holder, "lock lease expired");
            }
        }
        expired
    }

    fn live_holder(&self, resource_id: &str, now: Instant) -> Option<&str> {
        self.locks
            .get(resource_id)
            .filter(|held| held.expires > now)
            .map(|held| held.holder.as_str())
    }

    /// Granting `requester` a wait on a lock held by `holder` closes a cycle if
    /// `holder` transitively waits on something `requester` holds.
    fn would_deadlock(&self, requester: &str, holder: &str, now: Instant) -> bool {
        let mut cur = holder.to_string();
        let mut visited: HashSet<String> = HashSet::new();
        loop {
            if cur == requester {
                return true;
            }
            if !visited.insert(cur.clone()) {
                return false;
            }
            let Some(resource) = self.waiting.get(&cur) else {
                return false;
            };
            match self.live_holder(resource, now) {
                Some(next) => cur = next.to_string(),
                None => return false,
            }
        }
    }
}

/// A message between agents that must be acknowledged within the configured
/// message timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub payload: JsonValue,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug)]
struct PendingMessage {
    message: CoordinationMessage,
    deadline: Instant,
    delivered: bool,
}

#[derive(Debug, Default)]
struct MessageBoard {
    pending: HashMap<String, PendingMessage>,
    inboxes: HashMap<String, VecDeque<String>>,
    /// Settled ids and when they settled, kept for one retention window so
    /// late `acknowledge`/`await_ack` calls still get a definite answer.
    acked: HashMap<String, Instant>,
    timed_out: HashMap<String, Instant>,
}

impl MessageBoard {
    fn expire(&mut self, now: Instant, retention: Duration) -> Vec<String> {
        let keep = |settled: &mut Instant| now.saturating_duration_since(*settled) < retention;
        self.acked.retain(|_, settled| keep(settled));
        self.timed_out.retain(|_, settled| keep(settled));

        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(p) = self.pending.remove(id) {
                if let Some(inbox) = self.inboxes.get_mut(&p.message.to) {
                    inbox.retain(|m| m != id);
                }
            }
            self.timed_out.insert(id.clone(), now);
        }
        expired
    }
}

pub struct CoordinationManager {
    config: CoordinationConfig,
    locks: Mutex<LockTable>,
    released: Condvar,
    messages: Mutex<MessageBoard>,
    acked: Condvar,
}

impl CoordinationManager {
    pub fn new(config: CoordinationConfig) -> Self {
        Self {
            config,
            locks: Mutex::new(LockTable::default()),
            released: Condvar::new(),
            messages: Mutex::new(MessageBoard::default()),
            acked: Condvar::new(),
        }
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    fn lease(&self) -> Duration {
        Duration::from_millis(self.config.resource_timeout_ms)
    }

    fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.config.message_timeout_ms)
    }

    /// Acquire `resource_id` for `holder`, waiting at most `timeout`.
    ///
    /// A held resource yields `Busy` once `timeout` elapses (`Duration::ZERO`
    /// fails immediately). With deadlock detection on, a request that would
    /// close a wait-for cycle yields `WouldDeadlock` without waiting.
    pub fn acquire_lock(
        &self,
        resource_id: &str,
        holder: &str,
        timeout: Duration,
    ) -> SwarmResult<LockToken> {
        let deadline = Instant::now() + timeout;
        let mut table = lock(&self.locks);

        loop {
            let now = Instant::now();
            table.drop_if_expired(resource_id, now);

            let current = table.locks.get(resource_id).map(|h| h.holder.clone());
            match current {
                None => {
                    table.waiting.remove(holder);
                    table.next_generation += 1;
                    let generation = table.next_generation;
                    table.locks.insert(
                        resource_id.to_string(),
                        HeldLock {
                            holder: holder.to_string(),
                            acquired_at: Utc::now(),
                            expires: now + self.lease(),
                            generation,
                        },
                    );
                    debug!(resource = resource_id, holder, generation, "lock granted");
                    return Ok(LockToken {
                        resource_id: resource_id.to_string(),
                        holder: holder.to_string(),
                        generation,
                    });
                }
                Some(current) if current == holder => {
                    table.waiting.remove(holder);
                    let lease = self.lease();
                    let held = table
                        .locks
                        .get_mut(resource_id)
                        .ok_or_else(|| SwarmError::NotFound(resource_id.to_string()))?;
                    held.expires = now + lease;
                    debug!(resource = resource_id, holder, "lock lease renewed");
                    return Ok(LockToken {
                        resource_id: resource_id.to_string(),
                        holder: holder.to_string(),
                        generation: held.generation,
                    });
                }
                Some(current) => {
                    if self.config.deadlock_detection
                        && table.would_deadlock(holder, &current, now)
                    {
                        table.waiting.remove(holder);
                        warn!(
                            resource = resource_id,
                            requester = holder,
                            holder = %current,
                            "lock request rejected: would deadlock"
                        );
                        return Err(SwarmError::WouldDeadlock {
                            resource_id: resource_id.to_string(),
                            requester: holder.to_string(),
                            holder: current,
                        });
                    }
                    if now >= deadline {
                        table.waiting.remove(holder);
                        return Err(SwarmError::Busy {
                            resource_id: resource_id.to_string(),
                            holder: current,
                        });
                    }

                    table
                        .waiting
                        .insert(holder.to_string(), resource_id.to_string());
                    let lease_left = table
                        .locks
                        .get(resource_id)
                        .map(|h| h.expires.saturating_duration_since(now))
                        .unwrap_or_default();
                    let wait = deadline
                        .saturating_duration_since(now)
                        .min(lease_left.max(Duration::from_millis(1)));
                    table = self.wait_released(table, wait);
                }
            }
        }
    }

    fn wait_released<'a>(
        &self,
        guard: MutexGuard<'a, LockTable>,
        wait: Duration,
    ) -> MutexGuard<'a, LockTable> {
        match self.released.wait_timeout(guard, wait) {
            Ok((g, _)) => g,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    /// Release a lock. Returns whether a live lock was actually released.
    pub fn release_lock(&self, token: &LockToken) -> bool {
        let mut table = lock(&self.locks);
        let matches = table
            .locks
            .get(&token.resource_id)
            .map(|held| held.generation == token.generation && held.holder == token.holder)
            .unwrap_or(false);
        if matches {
            table.locks.remove(&token.resource_id);
            debug!(resource = %token.resource_id, holder = %token.holder, "lock released");
            self.released.notify_all();
        }
        matches
    }

    /// Release every lock held by `holder`; returns how many were released.
    pub fn release_all(&self, holder: &str) -> usize {
        let mut table = lock(&self.locks);
        let before = table.locks.len();
        table.locks.retain(|_, held| held.holder != holder);
        table.waiting.remove(holder);
        let released = before - table.locks.len();
        if released > 0 {
            debug!(holder, released, "released all locks for holder");
            self.released.notify_all();
        }
        released
    }

    /// Live locks, sorted by resource id.
    pub fn get_locks(&self) -> Vec<ResourceLock> {
        let table = lock(&self.locks);
        let now = Instant::now();
        let mut out: Vec<ResourceLock> = table
            .locks
            .iter()
            .filter(|(_, held)| held.expires > now)
            .map(|(resource_id, held)| ResourceLock {
                resource_id: resource_id.clone(),
                holder: held.holder.clone(),
                acquired_at: held.acquired_at,
                timeout_ms: self.config.resource_timeout_ms,
            })
            .collect();
        out.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        out
    }

    pub fn holder_of(&self, resource_id: &str) -> Option<String> {
        let table = lock(&self.locks);
        table
            .live_holder(resource_id, Instant::now())
            .map(str::to_string)
    }

    /// Drop expired leases; returns the freed resource ids.
    pub fn sweep_expired_locks(&self) -> Vec<String> {
        let mut table = lock(&self.locks);
        let now = Instant::now();
        let ids: Vec<String> = table.locks.keys().cloned().collect();
        let freed: Vec<String> = ids
            .into_iter()
            .filter(|id| table.drop_if_expired(id, now))
            .collect();
        if !freed.is_empty() {
            self.released.notify_all();
        }
        freed
    }

    pub fn send_message(&self, from: &str, to: &str, payload: JsonValue) -> String {
        let id = new_id("msg");
        let message = CoordinationMessage {
            id: id.clone(),
            from: from.to_string(),
            to: to.to_string(),
            payload,
            sent_at: Utc::now(),
        };
        let mut board = lock(&self.messages);
        board.pending.insert(
            id.clone(),
            PendingMessage {
                message,
                deadline: Instant::now() + self.message_timeout(),
                delivered: false,
            },
        );
        board
            .inboxes
            .entry(to.to_string())
            .or_default()
            .push_back(id.clone());
        debug!(message = %id, from, to, "message sent");
        id
    }

    /// Deliver every unexpired message addressed to `agent`. Delivered
    /// messages still need an explicit acknowledgement.
    pub fn receive(&self, agent: &str) -> Vec<CoordinationMessage> {
        let mut board = lock(&self.messages);
        board.expire(Instant::now(), self.message_timeout());
        let ids: Vec<String> = board
            .inboxes
            .get_mut(agent)
            .map(|inbox| inbox.drain(..).collect())
            .unwrap_or_default();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(p) = board.pending.get_mut(&id) {
                p.delivered = true;
                out.push(p.message.clone());
            }
        }
        out
    }

    pub fn acknowledge(&self, message_id: &str) -> SwarmResult<()> {
        let mut board = lock(&self.messages);
        board.expire(Instant::now(), self.message_timeout());
        if board.pending.remove(message_id).is_some() {
            board.acked.insert(message_id.to_string(), Instant::now());
            self.acked.notify_all();
            return Ok(());
        }
        if board.acked.contains_key(message_id) {
            return Ok(());
        }
        if board.timed_out.contains_key(message_id) {
            return Err(SwarmError::MessageTimeout {
                message_id: message_id.to_string(),
                timeout_ms: self.config.message_timeout_ms,
            });
        }
        Err(SwarmError::NotFound(format!("message '{message_id}'")))
    }

    /// Block until `message_id` is acknowledged. An unacknowledged message is
    /// dropped at its deadline and reported as `MessageTimeout`; it is never
    /// re-sent.
    pub fn await_ack(&self, message_id: &str) -> SwarmResult<()> {
        let mut board = lock(&self.messages);
        loop {
            if board.acked.remove(message_id).is_some() {
                return Ok(());
            }
            let now = Instant::now();
            board.expire(now, self.message_timeout());
            if board.timed_out.contains_key(message_id) {
                warn!(message = message_id, "message dropped: not acknowledged in time");
                return Err(SwarmError::MessageTimeout {
                    message_id: message_id.to_string(),
                    timeout_ms: self.config.message_timeout_ms,
                });
            }
            let Some(deadline) = board.pending.get(message_id).map(|p| p.deadline) else {
                return Err(SwarmError::NotFound(format!("message '{message_id}'")));
            };
            let wait = deadline.saturating_duration_since(now);
            board = match self.acked.wait_timeout(board, wait) {
                Ok((g, _)) => g,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Drop every message past its deadline; returns their ids.
    pub fn sweep_expired_messages(&self) -> Vec<String> {
        let expired = lock(&self.messages).expire(Instant::now(), self.message_timeout());
        if !expired.is_empty() {
            info!(count = expired.len(), "dropped unacknowledged messages");
        }
        expired
    }

    pub fn pending_messages(&self) -> usize {
        lock(&self.messages).pending.len()
    }

    /// Acknowledged or timed-out ids still remembered for late callers.
    pub fn settled_messages(&self) -> usize {
        let board = lock(&self.messages);
        board.acked.len() + board.timed_out.len()
    }
}

impl Default for CoordinationManager {
    fn default() -> Self {
        Self::new(CoordinationConfig::default())
    }
}
