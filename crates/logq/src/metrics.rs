//! Dispatch counters.

use serde::Serialize;

/// Counters for one dispatcher instance.
///
/// Plain `u64` fields: the dispatcher is single-threaded, so there is no
/// atomic overhead to pay and a snapshot is a cheap copy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchMetrics {
    /// Records routed into a transaction store.
    pub records_routed: u64,
    /// Records dropped for carrying the reserved vxid 0.
    pub records_ignored: u64,
    /// Batch frames appended as single spans.
    pub batches: u64,
    /// Trees that became ready for delivery.
    pub trees_ready: u64,
    /// Trees the callback actually saw (grouping filter and query passed).
    pub trees_delivered: u64,
    /// Records the callback saw in raw grouping.
    pub raw_delivered: u64,
    /// Incomplete transactions forced by the age backstop.
    pub forced_timeout: u64,
    /// Incomplete transactions forced by the store bound.
    pub forced_overflow: u64,
    /// Incomplete transactions forced by an explicit flush.
    pub forced_flush: u64,
    /// Stores promoted from ring references to private buffers.
    pub promotions: u64,
    /// Diagnostics emitted.
    pub diagnostics: u64,
}
