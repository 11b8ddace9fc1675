//! The tree filter seam.

use crate::cursor::RecordCursor;

/// Filter deciding whether an assembled tree (or a single record in raw
/// grouping) reaches the callback.
///
/// The cursor slice handed to `matches` is the same snapshot the callback
/// would receive: one cursor per node, deepest-first. The query may consume
/// the cursors while evaluating; the dispatcher resets them before invoking
/// the callback.
pub trait Query {
    /// Returns `true` when the snapshot should be delivered.
    fn matches(&self, nodes: &mut [RecordCursor<'_>]) -> bool;
}

impl<F> Query for F
where
    F: Fn(&mut [RecordCursor<'_>]) -> bool,
{
    fn matches(&self, nodes: &mut [RecordCursor<'_>]) -> bool {
        self(nodes)
    }
}
