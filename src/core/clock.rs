//! Hybrid logical clock.
//!
//! Every mutation is stamped with a [`Timestamp`] triple
//! `(wall_time_µs, logical, node_id)` whose lexicographic order is the total
//! order used for last-writer-wins conflict resolution. The clock guarantees:
//!
//! - successive [`HybridLogicalClock::now`] calls return strictly increasing
//!   timestamps;
//! - after [`HybridLogicalClock::update`] with an incoming timestamp, any
//!   subsequent `now()` is greater than the incoming timestamp;
//! - `wall` tracks the physical clock but may lead it briefly when the
//!   physical clock regresses.
//!
//! [`ThreadLocalClock`] layers batched logical-range reservation on top so
//! hot threads take the clock mutex once per ~50 events instead of once per
//! event.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Maximum tolerated lead of the clock over physical time before a warning
/// is emitted (5 seconds, in microseconds).
const DRIFT_WARN_THRESHOLD_US: i64 = 5_000_000;

/// Minimum gap between two drift warnings (1 second, in microseconds).
const DRIFT_WARN_INTERVAL_US: i64 = 1_000_000;

/// Logical ticks reserved per thread-local refill.
const RESERVE_BATCH: u32 = 50;

/// A hybrid logical timestamp.
///
/// The derived ordering is lexicographic on `(wall, logical, node)`, which
/// is exactly the total order used for conflict resolution: the `node`
/// component breaks ties between concurrent writes with identical wall and
/// logical parts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp {
    /// Physical component, microseconds since the Unix epoch.
    pub wall: i64,
    /// Logical counter, reset whenever `wall` advances.
    pub logical: u32,
    /// Originating node id (tie-breaker).
    pub node: u32,
}

impl Timestamp {
    /// The zero timestamp, smaller than any stamped mutation.
    pub const ZERO: Timestamp = Timestamp {
        wall: 0,
        logical: 0,
        node: 0,
    };
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.wall, self.logical, self.node)
    }
}

/// Current physical time in microseconds since the Unix epoch.
pub fn physical_time_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64
}

struct ClockState {
    max_wall: i64,
    max_logical: u32,
    last_drift_warn: i64,
}

/// Process-wide hybrid logical clock.
///
/// One clock per engine; pass it by reference rather than through a global.
pub struct HybridLogicalClock {
    state: Mutex<ClockState>,
    node_id: u32,
    drift_warnings: AtomicU64,
}

impl HybridLogicalClock {
    /// Create a clock for the given node id.
    pub fn new(node_id: u32) -> Self {
        Self {
            state: Mutex::new(ClockState {
                max_wall: 0,
                max_logical: 0,
                last_drift_warn: 0,
            }),
            node_id,
            drift_warnings: AtomicU64::new(0),
        }
    }

    /// The node id stamped into produced timestamps.
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Number of drift warnings emitted so far.
    pub fn drift_warnings(&self) -> u64 {
        self.drift_warnings.load(Ordering::Relaxed)
    }

    /// Produce a timestamp for a send event.
    ///
    /// Strictly increasing across all callers. If the logical counter is
    /// exhausted at the current wall time (the physical clock regressed and
    /// 2^32 events were stamped at one microsecond), this blocks until the
    /// physical clock passes the recorded wall time.
    pub fn now(&self) -> Timestamp {
        loop {
            let phys = physical_time_micros();
            let mut state = self.state.lock();

            if phys > state.max_wall {
                state.max_wall = phys;
                state.max_logical = 0;
            } else if state.max_logical == u32::MAX {
                // Logical space at this wall time is exhausted; wait for
                // physical time to pass max_wall.
                drop(state);
                std::thread::yield_now();
                continue;
            } else {
                state.max_logical += 1;
            }

            self.check_drift(&mut state, phys);

            return Timestamp {
                wall: state.max_wall,
                logical: state.max_logical,
                node: self.node_id,
            };
        }
    }

    /// Fold an incoming timestamp into the clock (receive event).
    ///
    /// After this returns, any subsequent `now()` is greater than
    /// `incoming`.
    pub fn update(&self, incoming: Timestamp) {
        let phys = physical_time_micros();
        let mut state = self.state.lock();

        let wall_old = state.max_wall;
        let logical_old = state.max_logical;

        state.max_wall = wall_old.max(incoming.wall).max(phys);

        if state.max_wall == wall_old && state.max_wall == incoming.wall {
            state.max_logical = logical_old.max(incoming.logical).saturating_add(1);
        } else if state.max_wall == wall_old {
            state.max_logical = logical_old.saturating_add(1);
        } else if state.max_wall == incoming.wall {
            state.max_logical = incoming.logical.saturating_add(1);
        } else {
            state.max_logical = 0;
        }
    }

    /// Reserve `count` logical ticks at physical time `for_phys`.
    ///
    /// Returns the first reserved logical value, or `None` when `for_phys`
    /// is already in the clock's past (the caller should refresh its
    /// physical time and retry) or the logical range would overflow.
    pub fn reserve_logical(&self, for_phys: i64, count: u32) -> Option<u32> {
        let mut state = self.state.lock();
        let floor = physical_time_micros().max(state.max_wall);

        if for_phys < floor {
            return None;
        }

        if for_phys > state.max_wall {
            state.max_wall = for_phys;
            state.max_logical = 0;
        }

        if u32::MAX - state.max_logical < count {
            return None;
        }

        let start = state.max_logical + 1;
        state.max_logical += count;
        Some(start)
    }

    fn check_drift(&self, state: &mut ClockState, phys: i64) {
        let lead = state.max_wall - phys;
        if lead > DRIFT_WARN_THRESHOLD_US && phys - state.last_drift_warn > DRIFT_WARN_INTERVAL_US {
            state.last_drift_warn = phys;
            self.drift_warnings.fetch_add(1, Ordering::Relaxed);
            warn!(
                lead_us = lead,
                "clock wall time is leading physical time; physical clock may have regressed"
            );
        }
    }
}

/// Per-thread timestamp allocator.
///
/// Holds a reserved range of logical ticks for one physical microsecond and
/// serves `now()` from it without touching the clock mutex. When the range
/// is exhausted or physical time moves, a new batch is reserved; if the
/// global clock has been pushed ahead of physical time (a receive event
/// landed) and physical time is not advancing, the allocator falls back to
/// the global slow path once so progress is guaranteed.
pub struct ThreadLocalClock {
    global: Arc<HybridLogicalClock>,
    cached_wall: i64,
    next_logical: u32,
    end_logical: u32,
}

impl ThreadLocalClock {
    /// Create an allocator backed by the given clock.
    pub fn new(global: Arc<HybridLogicalClock>) -> Self {
        Self {
            global,
            cached_wall: 0,
            next_logical: 0,
            end_logical: 0,
        }
    }

    /// Produce a timestamp, preferring the thread-local batch.
    pub fn now(&mut self) -> Timestamp {
        let mut phys = physical_time_micros();

        if phys == self.cached_wall && self.next_logical < self.end_logical {
            let logical = self.next_logical;
            self.next_logical += 1;
            return Timestamp {
                wall: self.cached_wall,
                logical,
                node: self.global.node_id(),
            };
        }

        if phys > self.cached_wall {
            self.cached_wall = phys;
            self.next_logical = 0;
            self.end_logical = 0;
        }

        loop {
            if let Some(start) = self.global.reserve_logical(phys, RESERVE_BATCH) {
                self.cached_wall = phys;
                self.next_logical = start;
                self.end_logical = start.saturating_add(RESERVE_BATCH);
                let logical = self.next_logical;
                self.next_logical += 1;
                return Timestamp {
                    wall: phys,
                    logical,
                    node: self.global.node_id(),
                };
            }

            std::thread::yield_now();
            let refreshed = physical_time_micros();
            if refreshed == phys {
                // The global clock is ahead of physical time and physical
                // time is not moving; take the slow path for this one tick.
                return self.global.now();
            }
            phys = refreshed;
        }
    }

    /// Fold an incoming timestamp into the backing clock.
    pub fn update(&self, incoming: Timestamp) {
        self.global.update(incoming);
    }
}
