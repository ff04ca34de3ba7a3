//! Runtime tunables.
//!
//! Compile-time defaults with runtime-adjustable thresholds for the
//! collector. The byte/count thresholds are atomics so embedders and tests
//! can lower them without rebuilding; the structural limits (stack depth,
//! mark depth) are fixed constants because generated code bakes them in.

use std::sync::atomic::{AtomicI64, Ordering};

/// Maximum call-frame depth per thread.
pub const MAX_STACK_DEPTH: usize = 1000;

/// Maximum recursion depth of the mark callbacks before an object is pushed
/// onto the deep-mark list instead.
pub const MAX_MARK_DEPTH: i32 = 1000;

/// Default number of allocations between collections.
pub const DEFAULT_OBJECT_THRESHOLD: i64 = 1_000_000;

/// Default bytes allocated since the last collection before collecting.
pub const DEFAULT_MEM_THRESHOLD: i64 = 100_000_000;

/// Default total heap bytes past which every allocation collects first.
pub const DEFAULT_HEAP_THRESHOLD: i64 = 2_500_000_000;

/// Default total heap bytes past which allocation reports out-of-memory.
pub const DEFAULT_OOM_THRESHOLD: i64 = 3_000_000_000;

/// Wall-clock bound on waiting for threads to die during shutdown.
pub const SHUTDOWN_TIMEOUT_MS: u64 = 10_000;

/// Finalizer thread poll interval.
pub const FINALIZER_POLL_MS: u64 = 1;

static OBJECT_THRESHOLD: AtomicI64 = AtomicI64::new(DEFAULT_OBJECT_THRESHOLD);
static MEM_THRESHOLD: AtomicI64 = AtomicI64::new(DEFAULT_MEM_THRESHOLD);
static HEAP_THRESHOLD: AtomicI64 = AtomicI64::new(DEFAULT_HEAP_THRESHOLD);
static OOM_THRESHOLD: AtomicI64 = AtomicI64::new(DEFAULT_OOM_THRESHOLD);

/// Allocations between collections before a collection is forced.
pub fn object_threshold() -> i64 {
    OBJECT_THRESHOLD.load(Ordering::Relaxed)
}

/// Set the allocation-count collection trigger.
pub fn set_object_threshold(value: i64) {
    OBJECT_THRESHOLD.store(value, Ordering::Relaxed);
}

/// Bytes allocated since the last collection before a collection is forced.
pub fn mem_threshold() -> i64 {
    MEM_THRESHOLD.load(Ordering::Relaxed)
}

/// Set the bytes-since-collection trigger.
pub fn set_mem_threshold(value: i64) {
    MEM_THRESHOLD.store(value, Ordering::Relaxed);
}

/// Total heap bytes past which every allocation collects first.
pub fn heap_threshold() -> i64 {
    HEAP_THRESHOLD.load(Ordering::Relaxed)
}

/// Set the total-heap collection trigger.
pub fn set_heap_threshold(value: i64) {
    HEAP_THRESHOLD.store(value, Ordering::Relaxed);
}

/// Total heap bytes past which allocation throws out-of-memory.
pub fn oom_threshold() -> i64 {
    OOM_THRESHOLD.load(Ordering::Relaxed)
}

/// Set the out-of-memory limit.
pub fn set_oom_threshold(value: i64) {
    OOM_THRESHOLD.store(value, Ordering::Relaxed);
}

/// Restore all adjustable thresholds to their compile-time defaults.
pub fn reset_thresholds() {
    set_object_threshold(DEFAULT_OBJECT_THRESHOLD);
    set_mem_threshold(DEFAULT_MEM_THRESHOLD);
    set_heap_threshold(DEFAULT_HEAP_THRESHOLD);
    set_oom_threshold(DEFAULT_OOM_THRESHOLD);
}
