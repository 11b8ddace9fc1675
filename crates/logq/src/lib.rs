//! Transaction assembly and dispatch for a shared-memory log stream.
//!
//! A producer (a reverse-proxy cache, in the original deployment) writes
//! variable-length log records into a shared ring. Each record carries a
//! transaction id (vxid); transactions form hierarchies — a session parents
//! requests, a request parents ESI sub-requests and backend fetches. This
//! crate consumes the interleaved record stream through a caller-supplied
//! [`RingCursor`], reassembles per-transaction record sequences with zero
//! copies while the ring window allows it, discovers the tree edges from
//! `Begin`/`Link` records in whatever order they arrive, and hands fully
//! assembled trees to a callback in the granularity the caller picked:
//!
//! - [`Grouping::Session`] — whole-session trees
//! - [`Grouping::Request`] — request trees including ESI and backend work
//! - [`Grouping::Vxid`] — every transaction by itself
//! - [`Grouping::Raw`] — every record by itself, no assembly
//!
//! Transactions that never complete are bounded by an age timeout and a
//! store cap, both configurable through [`DispatchConfig`].
//!
//! ```no_run
//! use logq::{Grouping, LogQuery};
//! # struct MyCursor;
//! # impl logq::RingCursor for MyCursor {
//! #     fn next(&mut self) -> Result<logq::CursorStep, logq::CursorError> { Ok(logq::CursorStep::Eof) }
//! #     fn check(&self, _: logq::Record) -> logq::RefCheck { logq::RefCheck::Valid }
//! #     fn skip(&mut self, _: usize) -> Result<(), logq::CursorError> { Ok(()) }
//! # }
//! # let cursor = MyCursor;
//! let mut query = LogQuery::new(cursor, Grouping::Session);
//! query.dispatch(|nodes| {
//!     for node in nodes.iter_mut() {
//!         while let Some(rec) = node.next() {
//!             println!("{} <{}> {:?}", node.level(), node.vxid(), rec.tag());
//!         }
//!     }
//!     0
//! })?;
//! # Ok::<(), logq::DispatchError>(())
//! ```

pub mod clock;
pub mod config;
pub mod cursor;
pub mod diag;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod query;
pub mod record;

mod assemble;
mod invariants;
mod store;
mod table;

pub use clock::{Clock, MonotonicClock};
pub use config::DispatchConfig;
pub use cursor::{CursorError, CursorStep, RecordCursor, RefCheck, RingCursor, RAW_VXID};
pub use diag::{Diag, DiagReason, DiagSink, JsonSink, MemorySink, TracingSink};
pub use dispatch::{Grouping, LogQuery};
pub use error::{Dispatched, DispatchError};
pub use metrics::DispatchMetrics;
pub use query::Query;
pub use record::{Record, Tag};
pub use table::{TableStats, TxType};
