//! Process-wide resource governor.
//!
//! The governor is the single authority on memory pressure. Writer threads
//! ask it two questions: "how bad is it?" ([`ResourceGovernor::usage`]) and
//! "should anything be purged right now?" ([`ResourceGovernor::purge_flag`]).
//! Under pressure, writers throttle themselves through
//! [`ResourceGovernor::pace`], the only deliberate backpressure point in
//! the write path.
//!
//! None of these operations fail; pressure is never fatal, only throttling.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::types::{FileIndex, FileKind};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

/// Memory pressure levels, from none to critical.
///
/// The ordering is total: a continuous increase in consumed bytes walks
/// through the levels one threshold at a time, never skipping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    /// Comfortably under budget; nothing needs purging.
    Ignore,
    /// At or just past budget.
    Neutral,
    /// More than 5% over budget (default threshold).
    Shallow,
    /// More than 10% over budget (default threshold).
    Immense,
    /// More than 15% over budget (default threshold).
    Extreme,
}

impl PressureLevel {
    /// Base pacing sleep for this level.
    #[must_use]
    pub const fn base_timeout(self) -> Duration {
        match self {
            Self::Ignore => Duration::ZERO,
            Self::Neutral => Duration::from_millis(5),
            Self::Shallow => Duration::from_millis(20),
            Self::Immense => Duration::from_millis(50),
            Self::Extreme => Duration::from_millis(100),
        }
    }
}

/// Process-wide memory pressure state machine.
///
/// Allocation accounting is fed by the segment cache (every insert and
/// purge reports its byte delta); the governor itself never walks the
/// heap. All state is atomic so `usage` and `pace` are safe from any
/// number of threads without blocking the callers that feed the counters.
#[derive(Debug, Default)]
pub struct ResourceGovernor {
    /// Bytes currently allocated to cached segments and version chains.
    allocated: AtomicU64,
    /// Bytes parked on the free list, reusable without new allocation.
    freelist: AtomicU64,
}

impl ResourceGovernor {
    /// Creates a governor with zeroed accounting.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `bytes` of new cache allocation.
    pub fn record_allocation(&self, bytes: u64) {
        self.allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records `bytes` released back from the cache.
    pub fn record_release(&self, bytes: u64) {
        let mut current = self.allocated.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(bytes);
            match self.allocated.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// Replaces the free-list byte count.
    pub fn set_freelist(&self, bytes: u64) {
        self.freelist.store(bytes, Ordering::Relaxed);
    }

    /// Returns the bytes currently accounted as allocated.
    #[must_use]
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Computes the current pressure level against a cache budget.
    ///
    /// Consumption is allocated bytes minus the free list, but only when
    /// the free list exceeds its budgeted fraction (a small free list is
    /// working capital, not reclaimable slack). The budget itself is
    /// normalized: past the diviser constant it shrinks by 1.5 per decade,
    /// so very large budgets tolerate proportionally less overshoot.
    #[must_use]
    pub fn usage(&self, config: &Config) -> PressureLevel {
        let allocated = self.allocated.load(Ordering::Relaxed);
        let freelist = self.freelist.load(Ordering::Relaxed);
        let budget = config.cache_budget.max(1);

        let freelist_allowance =
            (budget as f64 * config.freelist_budget_fraction) as u64;
        let consumed = if freelist > freelist_allowance {
            allocated.saturating_sub(freelist)
        } else {
            allocated
        };

        Self::level_for(consumed, budget, config)
    }

    /// Pure threshold math, shared with the property tests.
    #[must_use]
    pub fn level_for(consumed: u64, budget: u64, config: &Config) -> PressureLevel {
        let mut normalized = budget.max(1) as f64;
        let mut scale = budget;
        while scale > config.budget_diviser {
            scale /= 10;
            normalized /= 1.5;
        }

        let ratio = consumed as f64 / normalized;
        if ratio >= 1.0 + config.pressure_extreme {
            PressureLevel::Extreme
        } else if ratio >= 1.0 + config.pressure_immense {
            PressureLevel::Immense
        } else if ratio >= 1.0 + config.pressure_shallow {
            PressureLevel::Shallow
        } else if ratio >= 1.0 {
            PressureLevel::Neutral
        } else {
            PressureLevel::Ignore
        }
    }

    /// The sleep a paced writer takes at a given level.
    ///
    /// `growing` marks a call made while the caller is about to allocate
    /// more; such writers wait ten times longer.
    #[must_use]
    pub fn pace_timeout(level: PressureLevel, growing: bool) -> Duration {
        let base = level.base_timeout();
        if growing {
            base * 10
        } else {
            base
        }
    }

    /// Blocking backoff for writer threads under memory pressure.
    ///
    /// Sleeps for a duration keyed to the current level; while the level
    /// stays `Extreme` and infinite pacing is enabled, the sleep repeats
    /// up to `config.pace_retries` times. Logs a warning if pressure never
    /// relieves. Never fails.
    pub fn pace(&self, config: &Config, growing: bool, wait: bool) {
        let mut level = self.usage(config);
        if level == PressureLevel::Ignore || !wait {
            return;
        }

        let mut retries = 0u32;
        loop {
            std::thread::sleep(Self::pace_timeout(level, growing));
            level = self.usage(config);
            if level < PressureLevel::Extreme || !config.infinite_pacing {
                return;
            }
            retries += 1;
            if retries >= config.pace_retries {
                warn!(
                    retries,
                    allocated = self.allocated(),
                    budget = config.cache_budget,
                    "memory pressure did not relieve during pacing"
                );
                return;
            }
        }
    }

    /// The single gate the eviction policy consults before purging.
    #[must_use]
    pub fn purge_flag(&self, config: &Config) -> bool {
        self.usage(config) > PressureLevel::Ignore
    }
}

/// LRU limiter for the process-wide open-file budget.
///
/// A file must be acquired (active) while any I/O touches it. When the
/// budget is exhausted, the least-recently-used inactive file is
/// deactivated to make room; if every handle is active, the engine cannot
/// make progress and the error is fatal.
#[derive(Debug)]
pub struct FileLimiter {
    budget: usize,
    state: Mutex<LimiterState>,
}

#[derive(Debug, Default)]
struct LimiterState {
    /// Active handles with reference counts.
    active: HashMap<(FileKind, FileIndex), usize>,
    /// Inactive handles in least-recently-released order.
    idle: VecDeque<(FileKind, FileIndex)>,
}

impl FileLimiter {
    /// Creates a limiter with the given open-file budget.
    #[must_use]
    pub fn new(budget: usize) -> Self {
        Self {
            budget: budget.max(1),
            state: Mutex::new(LimiterState::default()),
        }
    }

    /// Marks a file active, evicting the LRU idle handle if the budget is
    /// exhausted.
    ///
    /// Returns the `(kind, index)` of the handle that had to be
    /// deactivated, if any, so the caller can close it.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::FileLimitExhausted`] when the budget is full
    /// and every handle is active.
    pub fn acquire(
        &self,
        kind: FileKind,
        index: FileIndex,
    ) -> CoreResult<Option<(FileKind, FileIndex)>> {
        let mut state = self.state.lock();

        if let Some(count) = state.active.get_mut(&(kind, index)) {
            *count += 1;
            return Ok(None);
        }

        // Re-activating an idle handle costs nothing.
        if let Some(pos) = state.idle.iter().position(|&k| k == (kind, index)) {
            state.idle.remove(pos);
            state.active.insert((kind, index), 1);
            return Ok(None);
        }

        let mut evicted = None;
        if state.active.len() + state.idle.len() >= self.budget {
            match state.idle.pop_front() {
                Some(victim) => evicted = Some(victim),
                None => {
                    return Err(CoreError::FileLimitExhausted {
                        budget: self.budget,
                    })
                }
            }
        }

        state.active.insert((kind, index), 1);
        Ok(evicted)
    }

    /// Releases one reference on an active file; the handle becomes idle
    /// when the last reference drops.
    pub fn release(&self, kind: FileKind, index: FileIndex) {
        let mut state = self.state.lock();
        if let Some(count) = state.active.get_mut(&(kind, index)) {
            *count -= 1;
            if *count == 0 {
                state.active.remove(&(kind, index));
                state.idle.push_back((kind, index));
            }
        }
    }

    /// Number of currently active handles.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }
}

/// Explicitly owned engine-wide subsystems.
///
/// Constructed once at process start and shared by reference with every
/// table instance; lifecycle is `new` and `shutdown`, with no static
/// registries.
#[derive(Debug)]
pub struct EngineContext {
    config: Config,
    governor: ResourceGovernor,
    limiter: FileLimiter,
}

impl EngineContext {
    /// Creates the engine context from a configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let limiter = FileLimiter::new(config.max_open_files);
        Self {
            config,
            governor: ResourceGovernor::new(),
            limiter,
        }
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The process-wide resource governor.
    #[must_use]
    pub fn governor(&self) -> &ResourceGovernor {
        &self.governor
    }

    /// The open-file limiter.
    #[must_use]
    pub fn limiter(&self) -> &FileLimiter {
        &self.limiter
    }

    /// Drains engine-wide state before process exit.
    ///
    /// Tables must already be closed; this only asserts the accounting is
    /// balanced and is a natural place for future background-loop joins.
    pub fn shutdown(&self) {
        let leaked = self.governor.allocated();
        if leaked > 0 {
            warn!(leaked, "engine shut down with unreleased cache bytes");
        }
    }
}
