#![allow(dead_code)]

use std::collections::HashMap;
use std::env;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use swarm::config::{CoordinatorConfig, ExecutorConfig, MemoryConfig};
use swarm::{ExecutionContext, SwarmConfig, SwarmError, SwarmResult, Task, TaskHandler};

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

fn env_lock() -> MutexGuard<'static, ()> {
    match ENV_LOCK.get_or_init(|| Mutex::new(())).lock() {
        Ok(g) => g,
        // A test that panicked while holding the lock must not wedge the rest.
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// RAII guard for test-only env var mutation, serialized by a global lock.
#[must_use]
pub struct EnvVarGuard {
    key: String,
    old: Option<OsString>,
    _lock: MutexGuard<'static, ()>,
}

impl EnvVarGuard {
    pub fn set<K: Into<String>, V: AsRef<OsStr>>(key: K, value: V) -> Self {
        let key = key.into();
        let lock = env_lock();
        let old = env::var_os(&key);
        // Env mutation is unsafe on recent toolchains; ENV_LOCK serializes it.
        unsafe {
            env::set_var(&key, value);
        }
        Self {
            key,
            old,
            _lock: lock,
        }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        unsafe {
            match &self.old {
                Some(v) => env::set_var(&self.key, v),
                None => env::remove_var(&self.key),
            }
        }
    }
}

/// Fresh, not-yet-created directory under the system temp dir.
pub fn unique_test_temp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let seq = TEMP_SEQ.fetch_add(1, Ordering::SeqCst);
    env::temp_dir().join(format!(
        "swarm-{prefix}-{}-{nanos}-{seq}",
        std::process::id()
    ))
}

/// Short ticks and timeouts so scenarios settle in milliseconds.
pub fn fast_config() -> SwarmConfig {
    SwarmConfig {
        coordinator: CoordinatorConfig {
            tick_interval_ms: 5,
            max_retries: 0,
            default_task_timeout_ms: 5_000,
            default_max_duration_ms: 30_000,
            status_interval_ms: 20,
            ..CoordinatorConfig::default()
        },
        executor: ExecutorConfig {
            poll_interval_ms: 2,
            kill_timeout_ms: 200,
            ..ExecutorConfig::default()
        },
        memory: MemoryConfig {
            replication_retry_ms: 5,
            flush_timeout_ms: 1_000,
            ..MemoryConfig::default()
        },
        ..SwarmConfig::default()
    }
}

pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    check()
}

pub fn ok_handler() -> Arc<dyn TaskHandler> {
    Arc::new(|task: &Task, _: &ExecutionContext| -> SwarmResult<String> {
        Ok(format!("{} ok", task.name))
    })
}

/// Sleeps `input.sleep_ms` (default `default_ms`) then succeeds.
pub fn sleep_handler(default_ms: u64) -> Arc<dyn TaskHandler> {
    Arc::new(move |task: &Task, _: &ExecutionContext| -> SwarmResult<String> {
        let ms = task
            .input
            .get("sleep_ms")
            .and_then(|v| v.as_u64())
            .unwrap_or(default_ms);
        thread::sleep(Duration::from_millis(ms));
        Ok(format!("{} slept {ms}ms", task.name))
    })
}

/// Fails the first `failures[name]` attempts of each named task.
pub struct FlakyHandler {
    failures: HashMap<String, u32>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl FlakyHandler {
    pub fn new<I, S>(failures: I) -> Arc<Self>
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        Arc::new(Self {
            failures: failures.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            attempts: Mutex::new(HashMap::new()),
        })
    }

    pub fn attempts(&self, name: &str) -> u32 {
        self.attempts
            .lock()
            .map(|a| a.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

impl TaskHandler for FlakyHandler {
    fn run(&self, task: &Task, _ctx: &ExecutionContext) -> SwarmResult<String> {
        let attempt = {
            let mut attempts = self.attempts.lock().map_err(|_| SwarmError::task_failed("poisoned"))?;
            let n = attempts.entry(task.name.clone()).or_insert(0);
            *n += 1;
            *n
        };
        let budget = self.failures.get(&task.name).copied().unwrap_or(0);
        if attempt <= budget {
            return Err(SwarmError::task_failed(format!(
                "{} attempt {attempt} failed",
                task.name
            )));
        }
        Ok(format!("{} ok after {attempt}", task.name))
    }
}

/// Records start/finish order and which agent-visible task ran when.
#[derive(Default)]
pub struct OrderLog {
    entries: Mutex<Vec<String>>,
}

impl OrderLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, entry: String) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    /// Handler that logs `start:<name>` and `end:<name>` around a short sleep.
    pub fn handler(self: &Arc<Self>, sleep_ms: u64) -> Arc<dyn TaskHandler> {
        let log = Arc::clone(self);
        Arc::new(move |task: &Task, _: &ExecutionContext| -> SwarmResult<String> {
            log.push(format!("start:{}", task.name));
            thread::sleep(Duration::from_millis(sleep_ms));
            log.push(format!("end:{}", task.name));
            Ok(task.name.clone())
        })
    }
}
