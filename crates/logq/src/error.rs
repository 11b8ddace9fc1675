//! Error and status types for the dispatch surface.

use crate::cursor::CursorError;
use thiserror::Error;

/// Terminal failures out of [`dispatch`](crate::LogQuery::dispatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The cursor failed while reading the ring.
    #[error("log cursor failed")]
    Cursor(#[from] CursorError),

    /// A ring record was overwritten before it could be copied out. The data
    /// is irretrievably gone; the caller must treat the stream as broken.
    #[error("ring overwrote a record before it was buffered")]
    Overrun,
}

/// How a `dispatch` or `flush` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// The cursor has no more records for now; backstops have run.
    Drained,
    /// The cursor reached end of input.
    Eof,
    /// The callback returned non-zero; the value is propagated verbatim.
    Stopped(i32),
}

impl Dispatched {
    /// True when the call ended because the callback asked to stop.
    #[inline]
    pub fn is_stopped(self) -> bool {
        matches!(self, Dispatched::Stopped(_))
    }
}
