//! The dispatch loop: demultiplexes the raw record stream into transaction
//! stores, runs the assembler, and delivers ready trees to the callback.
//!
//! One [`LogQuery`] owns one ring cursor and runs strictly single-threaded:
//! `dispatch` and `flush` are synchronous and run to completion on the
//! caller's thread. Records are processed in arrival order; trees are
//! delivered in the order their roots become ready.
//!
//! Zero-copy discipline: a record whose ring words are fully valid is kept by
//! reference. At the top of every loop iteration the eviction guard probes
//! the oldest ring reference and promotes stores to private buffers the
//! moment the producer gets close. A reference reported lost before it could
//! be copied is unrecoverable and fails the dispatch with
//! [`DispatchError::Overrun`].

use crate::assemble::{self, ScanCtx};
use crate::clock::{Clock, MonotonicClock};
use crate::config::DispatchConfig;
use crate::cursor::{CursorStep, RecordCursor, RefCheck, RingCursor};
use crate::diag::{DiagReason, DiagSink, TracingSink};
use crate::error::{Dispatched, DispatchError};
use crate::metrics::DispatchMetrics;
use crate::query::Query;
use crate::record::Tag;
use crate::table::{TableStats, TxTable, TxType};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Caller-selected callback granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Grouping {
    /// Every record individually, bypassing assembly.
    Raw,
    /// Every transaction as a single-node tree; no edges are recorded.
    Vxid,
    /// Request trees, including their ESI and backend work.
    Request,
    /// Whole-session trees.
    Session,
}

/// Assembles transaction trees from a shared-memory record stream and
/// dispatches them to a callback.
///
/// The callback receives one restartable [`RecordCursor`] per tree node,
/// deepest level first, the root (level 0) last. A non-zero return stops the
/// current call and is propagated verbatim as [`Dispatched::Stopped`].
pub struct LogQuery<C> {
    cursor: C,
    grouping: Grouping,
    query: Option<Box<dyn Query>>,
    cfg: DispatchConfig,
    table: TxTable,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn DiagSink>,
    metrics: DispatchMetrics,
}

impl<C: RingCursor> LogQuery<C> {
    /// Creates a dispatcher over `cursor` with default configuration, the
    /// system clock, the tracing diagnostic sink and no query filter.
    pub fn new(cursor: C, grouping: Grouping) -> Self {
        LogQuery {
            cursor,
            grouping,
            query: None,
            cfg: DispatchConfig::default(),
            table: TxTable::new(),
            clock: Arc::new(MonotonicClock),
            sink: Arc::new(TracingSink),
            metrics: DispatchMetrics::default(),
        }
    }

    /// Installs a tree filter.
    pub fn with_query(mut self, query: impl Query + 'static) -> Self {
        self.query = Some(Box::new(query));
        self
    }

    /// Replaces the configuration.
    pub fn with_config(mut self, cfg: DispatchConfig) -> Self {
        self.cfg = cfg;
        self
    }

    /// Replaces the clock (tests use a manually advanced one).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the diagnostic sink.
    pub fn with_diag_sink(mut self, sink: Arc<dyn DiagSink>) -> Self {
        self.sink = sink;
        self
    }

    /// The configured grouping.
    pub fn grouping(&self) -> Grouping {
        self.grouping
    }

    /// The active configuration.
    pub fn config(&self) -> &DispatchConfig {
        &self.cfg
    }

    /// Snapshot of the dispatch counters.
    pub fn metrics(&self) -> DispatchMetrics {
        self.metrics
    }

    /// Snapshot of the transaction table sizes.
    pub fn stats(&self) -> TableStats {
        self.table.stats()
    }

    /// Tears the dispatcher down and hands the cursor back. Call
    /// [`flush`](Self::flush) first to drain incomplete transactions through
    /// the callback.
    pub fn into_cursor(self) -> C {
        self.cursor
    }

    /// Consumes the cursor until it runs dry, dispatching every tree that
    /// becomes ready. When the cursor reports no-data-for-now, the age and
    /// store-bound backstops run before returning [`Dispatched::Drained`].
    pub fn dispatch<F>(&mut self, mut callback: F) -> Result<Dispatched, DispatchError>
    where
        F: FnMut(&mut [RecordCursor<'_>]) -> i32,
    {
        if self.grouping == Grouping::Raw {
            return self.dispatch_raw(&mut callback);
        }

        loop {
            // Relinquish ring references before the producer reaches them.
            while let Some(vxid) = self.table.oldest_ring_ref() {
                let head = self
                    .table
                    .tx(vxid)
                    .store
                    .first_chunk_record()
                    .expect("ring-referencing queue entry without chunks");
                match self.cursor.check(head) {
                    RefCheck::Valid => break,
                    RefCheck::OverwriteImminent => {
                        let min = self.cfg.min_buffer_words;
                        self.table.tx_mut(vxid).store.promote_to_buffer(min);
                        self.metrics.promotions += 1;
                    }
                    RefCheck::Lost => return Err(DispatchError::Overrun),
                }
            }

            let rec = match self.cursor.next()? {
                CursorStep::Record(rec) => rec,
                CursorStep::Empty => break,
                CursorStep::Eof => return Ok(Dispatched::Eof),
            };

            let tag = rec.tag();
            let vxid = rec.vxid();
            if vxid == 0 {
                // Reserved id, dropped silently. A batch frame with carrier 0
                // is not skipped, so its inner records stream individually.
                self.metrics.records_ignored += 1;
                continue;
            }

            let len = rec.span_words();
            let must_copy = self.cursor.check(rec) != RefCheck::Valid;
            let now = self.clock.now();
            let (first_chunk, seq) = {
                let tx = self.table.lookup_or_insert(vxid, now);
                let first = tx.store.append(
                    rec,
                    len,
                    must_copy,
                    self.cfg.chunks_per_tx,
                    self.cfg.min_buffer_words,
                );
                (first, tx.seq)
            };
            if first_chunk {
                self.table.push_ring_ref(vxid, seq);
            }
            self.metrics.records_routed += 1;

            if tag == Tag::Batch {
                // The whole span is already appended; jump the cursor past
                // the enclosed records.
                self.metrics.batches += 1;
                self.cursor.skip(rec.batch_body_words())?;
            }

            let ready = {
                let mut ctx = ScanCtx {
                    grouping: self.grouping,
                    now,
                    sink: self.sink.as_ref(),
                    metrics: &mut self.metrics,
                };
                assemble::scan(&mut self.table, vxid, &mut ctx)
            };
            if let Some(root) = ready {
                self.metrics.trees_ready += 1;
                let rv = self.deliver(root, &mut callback);
                self.retire(root);
                if rv != 0 {
                    return Ok(Dispatched::Stopped(rv));
                }
            }

            #[cfg(debug_assertions)]
            crate::invariants::check_table(&self.table);
        }

        let now = self.clock.now();
        while let Some(vxid) = self.table.oldest_incomplete() {
            let age = now.saturating_duration_since(self.table.tx(vxid).t_start);
            if age <= self.cfg.incomplete_timeout {
                break;
            }
            if let Some(code) = self.force_and_deliver(vxid, DiagReason::Timeout, now, &mut callback)
            {
                return Ok(Dispatched::Stopped(code));
            }
        }

        while self.table.n_incomplete() > self.cfg.incomplete_max {
            let Some(vxid) = self.table.oldest_incomplete() else {
                break;
            };
            if let Some(code) =
                self.force_and_deliver(vxid, DiagReason::StoreOverflow, now, &mut callback)
            {
                return Ok(Dispatched::Stopped(code));
            }
        }

        Ok(Dispatched::Drained)
    }

    /// Forces every remaining incomplete transaction, oldest first,
    /// dispatching and retiring each tree that becomes ready. Afterwards the
    /// table is empty.
    pub fn flush<F>(&mut self, mut callback: F) -> Dispatched
    where
        F: FnMut(&mut [RecordCursor<'_>]) -> i32,
    {
        let now = self.clock.now();
        while let Some(vxid) = self.table.oldest_incomplete() {
            if let Some(code) = self.force_and_deliver(vxid, DiagReason::Flush, now, &mut callback)
            {
                return Dispatched::Stopped(code);
            }
        }
        Dispatched::Drained
    }

    fn dispatch_raw<F>(&mut self, callback: &mut F) -> Result<Dispatched, DispatchError>
    where
        F: FnMut(&mut [RecordCursor<'_>]) -> i32,
    {
        loop {
            let rec = match self.cursor.next()? {
                CursorStep::Record(rec) => rec,
                CursorStep::Empty => return Ok(Dispatched::Drained),
                CursorStep::Eof => return Ok(Dispatched::Eof),
            };

            let mut cursors = [RecordCursor::raw(rec)];
            if let Some(query) = &self.query {
                if !query.matches(&mut cursors) {
                    continue;
                }
                cursors[0].reset();
            }
            self.metrics.raw_delivered += 1;
            let rv = callback(&mut cursors);
            if rv != 0 {
                return Ok(Dispatched::Stopped(rv));
            }
        }
    }

    fn force_and_deliver<F>(
        &mut self,
        vxid: u32,
        reason: DiagReason,
        now: Instant,
        callback: &mut F,
    ) -> Option<i32>
    where
        F: FnMut(&mut [RecordCursor<'_>]) -> i32,
    {
        match reason {
            DiagReason::Timeout => self.metrics.forced_timeout += 1,
            DiagReason::StoreOverflow => self.metrics.forced_overflow += 1,
            DiagReason::Flush => self.metrics.forced_flush += 1,
            _ => {}
        }

        let ready = {
            let mut ctx = ScanCtx {
                grouping: self.grouping,
                now,
                sink: self.sink.as_ref(),
                metrics: &mut self.metrics,
            };
            assemble::force(&mut self.table, vxid, reason, &mut ctx)
        };
        if let Some(root) = ready {
            self.metrics.trees_ready += 1;
            let rv = self.deliver(root, callback);
            self.retire(root);
            if rv != 0 {
                return Some(rv);
            }
        }
        None
    }

    /// Runs the grouping filter and the query, then hands the tree to the
    /// callback as cursors ordered deepest-first. Returns the callback's
    /// return value, or 0 when the tree was filtered out.
    fn deliver<F>(&mut self, root: u32, callback: &mut F) -> i32
    where
        F: FnMut(&mut [RecordCursor<'_>]) -> i32,
    {
        let root_tx = self.table.tx(root);
        match self.grouping {
            Grouping::Session if root_tx.ty != TxType::Session => return 0,
            Grouping::Request if root_tx.ty != TxType::Request => return 0,
            _ => {}
        }

        // Breadth-first, then reversed: deepest level first, siblings in
        // child-insertion order.
        let n = root_tx.n_descend as usize + 1;
        let mut order: Vec<(u32, u32)> = Vec::with_capacity(n);
        order.push((root, 0));
        let mut i = 0;
        while i < order.len() {
            let (vxid, level) = order[i];
            for &child in &self.table.tx(vxid).children {
                order.push((child, level + 1));
            }
            i += 1;
        }
        debug_assert_eq!(order.len(), n);

        let mut cursors: Vec<RecordCursor<'_>> = order
            .iter()
            .rev()
            .map(|&(vxid, level)| {
                let tx = self.table.tx(vxid);
                RecordCursor::from_store(&tx.store, vxid, level)
            })
            .collect();

        if let Some(query) = &self.query {
            if !query.matches(&mut cursors) {
                return 0;
            }
            for cursor in &mut cursors {
                cursor.reset();
            }
        }

        self.metrics.trees_delivered += 1;
        callback(&mut cursors)
    }

    /// Removes a dispatched tree from the table, pooling shells for reuse.
    fn retire(&mut self, vxid: u32) {
        let mut tx = self.table.remove(vxid);
        debug_assert!(tx.complete && tx.ready && tx.parent.is_none());
        #[cfg(debug_assertions)]
        {
            let sum: u32 = tx
                .children
                .iter()
                .map(|&c| 1 + self.table.tx(c).n_descend)
                .sum();
            debug_assert_eq!(tx.n_descend, sum);
        }

        let children = std::mem::take(&mut tx.children);
        self.table.recycle(tx, self.cfg.cache_pool_size);

        for child in children {
            let c = self.table.tx_mut(child);
            debug_assert_eq!(c.parent, Some(vxid));
            debug_assert!(c.ready);
            c.parent = None;
            self.retire(child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::CursorError;
    use crate::record::Record;

    /// A cursor that never yields anything.
    struct IdleCursor;

    impl RingCursor for IdleCursor {
        fn next(&mut self) -> Result<CursorStep, CursorError> {
            Ok(CursorStep::Empty)
        }

        fn check(&self, _rec: Record) -> RefCheck {
            RefCheck::Valid
        }

        fn skip(&mut self, _words: usize) -> Result<(), CursorError> {
            Ok(())
        }
    }

    #[test]
    fn test_builder_defaults() {
        let q = LogQuery::new(IdleCursor, Grouping::Session);
        assert_eq!(q.grouping(), Grouping::Session);
        assert_eq!(q.config().incomplete_max, 1000);
        assert_eq!(q.stats().transactions, 0);
    }

    #[test]
    fn test_empty_cursor_drains() {
        let mut q = LogQuery::new(IdleCursor, Grouping::Vxid);
        let got = q.dispatch(|_| 0).expect("dispatch");
        assert_eq!(got, Dispatched::Drained);
        assert_eq!(q.metrics().records_routed, 0);
    }

    #[test]
    fn test_flush_on_empty_table() {
        let mut q = LogQuery::new(IdleCursor, Grouping::Session);
        assert_eq!(q.flush(|_| 0), Dispatched::Drained);
    }

    #[test]
    fn test_into_cursor_returns_ownership() {
        let q = LogQuery::new(IdleCursor, Grouping::Raw);
        let _cursor = q.into_cursor();
    }
}
