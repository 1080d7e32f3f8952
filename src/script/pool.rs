//! Per-path pool of ready interpreters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use super::compiler::normalize_path;
use super::engine::{Interpreter, InterpreterFactory};
use super::registry::UnitCatalog;
use crate::config::PoolConfig;
use crate::{CastroError, Result};

struct IdleInterpreter {
    interpreter: Interpreter,
    returned_at: Instant,
}

/// Pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Paths with at least one idle interpreter.
    pub paths: usize,
    /// Idle interpreters over all paths.
    pub idle: usize,
    /// Interpreters built by cold starts.
    pub created: u64,
    /// Checkouts served from the pool.
    pub reused: u64,
    /// Interpreters dropped (stale, expired, over capacity or discarded).
    pub dropped: u64,
}

/// LIFO stacks of idle interpreters keyed by normalised path.
///
/// The mutex only guards pushes and pops. Cold starts and dropping Lua
/// states happen with it released.
pub struct StatePool {
    catalog: Arc<UnitCatalog>,
    factory: Arc<InterpreterFactory>,
    idle: Mutex<HashMap<String, Vec<IdleInterpreter>>>,
    max_idle_per_path: usize,
    idle_timeout: Option<Duration>,
    created: AtomicU64,
    reused: AtomicU64,
    dropped: AtomicU64,
}

impl StatePool {
    pub fn new(
        catalog: Arc<UnitCatalog>,
        factory: Arc<InterpreterFactory>,
        config: &PoolConfig,
    ) -> Self {
        Self {
            catalog,
            factory,
            idle: Mutex::new(HashMap::new()),
            max_idle_per_path: config.max_idle_per_path,
            idle_timeout: (config.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(config.idle_timeout_secs)),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<IdleInterpreter>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take an interpreter for `path`, reusing an idle one when possible.
    pub fn checkout(&self, path: &str) -> Result<Interpreter> {
        let key = normalize_path(path);
        let unit = self
            .catalog
            .resolve(&key)
            .ok_or_else(|| CastroError::NotFound(format!("script {key}")))?;

        let mut garbage = Vec::new();
        let reused = {
            let mut idle = self.lock();
            match idle.get_mut(&key) {
                Some(bucket) => {
                    self.expire(bucket, &mut garbage);
                    let mut found = None;
                    while let Some(entry) = bucket.pop() {
                        if entry.interpreter.built_from(&unit) {
                            found = Some(entry.interpreter);
                            break;
                        }
                        garbage.push(entry.interpreter);
                    }
                    found
                }
                None => None,
            }
        };
        self.drop_all(garbage);

        if let Some(interpreter) = reused {
            self.reused.fetch_add(1, Ordering::Relaxed);
            debug!("Reusing interpreter {} for {}", interpreter.id(), key);
            return Ok(interpreter);
        }

        let interpreter = self.factory.build(unit)?;
        self.created.fetch_add(1, Ordering::Relaxed);
        debug!("Cold start of {} ({})", key, interpreter.id());
        Ok(interpreter)
    }

    /// Return an interpreter to the pool after use.
    ///
    /// The transaction marker and any queued statements are cleared first.
    /// Interpreters built from a unit that is no longer current, or that
    /// would exceed the per-path bound, are dropped instead.
    pub fn checkin(&self, interpreter: Interpreter, path: &str) {
        interpreter.reset_session();
        let key = normalize_path(path);

        if !self.catalog.snapshot().is_current(interpreter.unit()) {
            debug!("Dropping stale interpreter {} for {}", interpreter.id(), key);
            self.drop_all(vec![interpreter]);
            return;
        }

        let mut garbage = Vec::new();
        {
            let mut idle = self.lock();
            let bucket = idle.entry(key).or_default();
            self.expire(bucket, &mut garbage);

            if self.max_idle_per_path > 0 && bucket.len() >= self.max_idle_per_path {
                garbage.push(interpreter);
            } else {
                bucket.push(IdleInterpreter {
                    interpreter,
                    returned_at: Instant::now(),
                });
            }
        }
        self.drop_all(garbage);
    }

    /// Drop an interpreter that must not be reused.
    pub fn discard(&self, interpreter: Interpreter) {
        debug!(
            "Discarding interpreter {} for {}",
            interpreter.id(),
            interpreter.path()
        );
        self.drop_all(vec![interpreter]);
    }

    /// Remove idle interpreters older than the idle timeout from every path.
    /// Returns how many were removed.
    pub fn evict_idle(&self) -> usize {
        let mut garbage = Vec::new();
        {
            let mut idle = self.lock();
            for bucket in idle.values_mut() {
                self.expire(bucket, &mut garbage);
            }
            idle.retain(|_, bucket| !bucket.is_empty());
        }
        let evicted = garbage.len();
        self.drop_all(garbage);
        if evicted > 0 {
            debug!("Evicted {} idle interpreters", evicted);
        }
        evicted
    }

    /// Remove idle interpreters whose unit is no longer current.
    /// Returns how many were removed.
    pub fn purge_stale(&self) -> usize {
        let snapshot = self.catalog.snapshot();
        let mut garbage = Vec::new();
        {
            let mut idle = self.lock();
            for bucket in idle.values_mut() {
                let (keep, stale): (Vec<_>, Vec<_>) = std::mem::take(bucket)
                    .into_iter()
                    .partition(|entry| snapshot.is_current(entry.interpreter.unit()));
                *bucket = keep;
                garbage.extend(stale.into_iter().map(|entry| entry.interpreter));
            }
            idle.retain(|_, bucket| !bucket.is_empty());
        }
        let purged = garbage.len();
        self.drop_all(garbage);
        purged
    }

    /// Idle interpreters for `path`.
    pub fn idle_count(&self, path: &str) -> usize {
        self.lock()
            .get(&normalize_path(path))
            .map_or(0, Vec::len)
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.lock();
        PoolStats {
            paths: idle.values().filter(|b| !b.is_empty()).count(),
            idle: idle.values().map(Vec::len).sum(),
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Move expired entries of `bucket` into `garbage`.
    fn expire(&self, bucket: &mut Vec<IdleInterpreter>, garbage: &mut Vec<Interpreter>) {
        let Some(timeout) = self.idle_timeout else {
            return;
        };
        let now = Instant::now();
        let (keep, expired): (Vec<_>, Vec<_>) = std::mem::take(bucket)
            .into_iter()
            .partition(|entry| now.duration_since(entry.returned_at) < timeout);
        *bucket = keep;
        garbage.extend(expired.into_iter().map(|entry| entry.interpreter));
    }

    fn drop_all(&self, interpreters: Vec<Interpreter>) {
        if !interpreters.is_empty() {
            self.dropped
                .fetch_add(interpreters.len() as u64, Ordering::Relaxed);
        }
    }
}
