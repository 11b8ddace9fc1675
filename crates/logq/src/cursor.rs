//! The ring cursor seam and the per-node record cursors handed to callbacks.
//!
//! The core never touches the shared ring directly. It consumes records
//! through [`RingCursor`], an object the caller constructs over whatever
//! transport backs the ring (shared memory segment, replayed capture, the
//! simulator in `logq-sim`), and probes reference validity through
//! [`RingCursor::check`].

use crate::record::Record;
use crate::store::{RecordStore, StorePos};
use thiserror::Error;

/// Exposed vxid of the synthetic single-record cursor in raw mode.
pub const RAW_VXID: i64 = -1;

/// The cursor failed to read the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("log cursor read failed")]
pub struct CursorError;

/// One step of the ring cursor.
#[derive(Debug, Clone, Copy)]
pub enum CursorStep {
    /// A record was yielded. For a `Batch` header the cursor stands on the
    /// first enclosed record afterwards; the dispatcher skips the body.
    Record(Record),
    /// No data available right now; try again later.
    Empty,
    /// End of input.
    Eof,
}

/// Where a previously yielded ring reference stands with respect to the
/// producer's write head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefCheck {
    /// Still comfortably inside the ring window.
    Valid,
    /// Still readable, but the writer is close; copy out now.
    OverwriteImminent,
    /// Already overwritten. The words are gone.
    Lost,
}

/// Read access to the producer's record ring.
///
/// The dispatcher takes ownership of the cursor at construction and drives it
/// single-threaded. `next` must not block indefinitely; callers that want
/// timed reads implement them underneath this trait.
pub trait RingCursor {
    /// Advances to the next record.
    fn next(&mut self) -> Result<CursorStep, CursorError>;

    /// Probes whether `rec` still lies inside the ring window.
    fn check(&self, rec: Record) -> RefCheck;

    /// Skips `words` words without yielding them.
    fn skip(&mut self, words: usize) -> Result<(), CursorError>;
}

enum Source<'a> {
    /// A transaction's assembled record sequence.
    Store(&'a RecordStore),
    /// A single ring record (raw passthrough).
    Raw { start: *const u32, words: usize },
}

/// A restartable cursor over one node's records, as delivered to the
/// dispatch callback.
///
/// Callbacks receive one cursor per tree node, ordered deepest-first;
/// `level` is 0 for the root. In raw grouping there is exactly one cursor
/// covering exactly one record and `vxid` is [`RAW_VXID`].
pub struct RecordCursor<'a> {
    vxid: i64,
    level: u32,
    src: Source<'a>,
    pos: StorePos,
}

impl<'a> RecordCursor<'a> {
    pub(crate) fn from_store(store: &'a RecordStore, vxid: u32, level: u32) -> Self {
        RecordCursor {
            vxid: i64::from(vxid),
            level,
            src: Source::Store(store),
            pos: StorePos::default(),
        }
    }

    pub(crate) fn raw(rec: Record) -> Self {
        RecordCursor {
            vxid: RAW_VXID,
            level: 0,
            src: Source::Raw {
                start: rec.as_ptr(),
                words: rec.next_words(),
            },
            pos: StorePos::default(),
        }
    }

    /// Transaction id of this node, or [`RAW_VXID`] in raw grouping.
    #[inline]
    pub fn vxid(&self) -> i64 {
        self.vxid
    }

    /// Depth of this node in the dispatched tree; the root is 0.
    #[inline]
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Yields the next record in insertion order.
    pub fn next(&mut self) -> Option<Record> {
        match self.src {
            Source::Store(store) => store.next_record(&mut self.pos),
            Source::Raw { start, words } => {
                if self.pos.offset >= words {
                    return None;
                }
                // SAFETY: start..start+words is the span of the record this
                // cursor was built over; offset stays within it.
                let rec = unsafe { Record::from_ptr(start.add(self.pos.offset)) };
                self.pos.offset += rec.next_words();
                Some(rec)
            }
        }
    }

    /// Rewinds to the first record.
    pub fn reset(&mut self) {
        self.pos = StorePos::default();
    }
}
