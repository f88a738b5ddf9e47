//! The three primitives shared between the Flusher Stage and the Flusher
//! Worker. Each is a single atomic word with single-writer/single-reader
//! semantics — no locks, matching the isolation boundary described in the
//! design notes.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

/// Write-once-true from the Stage, read by the Worker at the top of each
/// loop iteration. Monotonic: once true it never observes false again.
#[derive(Clone, Default)]
pub struct SharedStopFlag(Arc<AtomicBool>);

impl SharedStopFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Signed seconds offset between producer-side wall clock and local wall
/// clock, written by the Stage on every integer-payload `submit`, read by
/// the Worker at the top of each loop iteration.
#[derive(Clone, Default)]
pub struct SharedDrift(Arc<AtomicI64>);

impl SharedDrift {
    pub fn new() -> Self {
        Self(Arc::new(AtomicI64::new(0)))
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, drift_seconds: i64) {
        self.0.store(drift_seconds, Ordering::Release);
    }
}

/// Written by the Worker once per flush iteration, read by the Stage on
/// every `submit`. True iff the Buffer returned a full batch for every
/// assigned shard on the most recent iteration.
#[derive(Clone, Default)]
pub struct SharedBackpressure(Arc<AtomicBool>);

impl SharedBackpressure {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, value: bool) {
        self.0.store(value, Ordering::Release);
    }
}

/// The bundle of shared primitives for one Flusher Stage's lifetime. The
/// Stage constructs this once; restarting the Worker reuses the same
/// bundle rather than allocating fresh primitives.
#[derive(Clone, Default)]
pub struct SharedState {
    pub stop_flag: SharedStopFlag,
    pub drift: SharedDrift,
    pub backpressure: SharedBackpressure,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            stop_flag: SharedStopFlag::new(),
            drift: SharedDrift::new(),
            backpressure: SharedBackpressure::new(),
        }
    }
}

pub fn wall_clock_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_flag_monotonic() {
        let flag = SharedStopFlag::new();
        assert!(!flag.is_set());
        flag.set();
        assert!(flag.is_set());
        flag.set();
        assert!(flag.is_set());
    }

    #[test]
    fn test_stop_flag_shared_across_clones() {
        let flag = SharedStopFlag::new();
        let clone = flag.clone();
        clone.set();
        assert!(flag.is_set());
    }

    #[test]
    fn test_drift_round_trip() {
        let drift = SharedDrift::new();
        assert_eq!(drift.get(), 0);
        drift.set(-100);
        assert_eq!(drift.get(), -100);
    }

    #[test]
    fn test_backpressure_round_trip() {
        let bp = SharedBackpressure::new();
        assert!(!bp.is_set());
        bp.set(true);
        assert!(bp.is_set());
        bp.set(false);
        assert!(!bp.is_set());
    }
}
