//! The per-transaction assembler state machine.
//!
//! `scan` walks the records appended to a transaction since its last scan and
//! interprets the control tags: `Begin` names the transaction's type and
//! optionally its parent, `Link` names a child, `End` completes it. Links
//! tolerate any arrival order — either side of an edge may be mentioned
//! first, and the missing side is created lazily. Data tags pass through
//! untouched; they exist for the callback, not for the assembler.
//!
//! Completion flows upward: a transaction is ready once it is complete and
//! all of its children are ready. `scan` reports the root of a tree that
//! just became ready in its entirety, which is the dispatcher's cue to
//! deliver and retire it.

use crate::diag::{Diag, DiagReason, DiagSink};
use crate::dispatch::Grouping;
use crate::metrics::DispatchMetrics;
use crate::record::{Record, Tag};
use crate::table::{TxTable, TxType};
use std::time::Instant;

/// Shared context for one scan pass.
pub(crate) struct ScanCtx<'a> {
    pub grouping: Grouping,
    pub now: Instant,
    pub sink: &'a dyn DiagSink,
    pub metrics: &'a mut DispatchMetrics,
}

impl ScanCtx<'_> {
    fn diag(&mut self, diag: Diag) {
        self.metrics.diagnostics += 1;
        self.sink.emit(&diag);
    }
}

/// Parses a `Begin`/`Link` payload of the form `"<type-word> [<vxid>]"`.
///
/// A missing, non-numeric or zero second field comes back as `None` — for a
/// `Begin` that simply means "no parent given"; a `Link` treats it as a
/// parse error since a link without a target is meaningless.
fn parse_type_link(payload: &[u8]) -> Option<(TxType, Option<u32>)> {
    let text = std::str::from_utf8(payload).ok()?;
    let mut fields = text.trim_matches('\0').split_ascii_whitespace();
    let ty = TxType::parse_word(fields.next()?)?;
    let vxid = fields
        .next()
        .and_then(|word| word.parse::<u32>().ok())
        .filter(|&v| v != 0);
    Some((ty, vxid))
}

/// Links `child` under `parent` and charges the subtree size to every
/// ancestor.
fn set_parent(table: &mut TxTable, parent: u32, child: u32) {
    let add = {
        let c = table.tx_mut(child);
        debug_assert!(c.parent.is_none());
        c.parent = Some(parent);
        1 + c.n_descend
    };
    table.tx_mut(parent).children.push(child);

    let mut cur = Some(parent);
    while let Some(vxid) = cur {
        let tx = table.tx_mut(vxid);
        tx.n_descend += add;
        cur = tx.parent;
    }
}

fn scan_begin(table: &mut TxTable, vxid: u32, rec: Record, ctx: &mut ScanCtx<'_>) {
    if table.tx(vxid).ready {
        ctx.diag(Diag::with_record(vxid, DiagReason::LinkTooLate, rec));
        return;
    }

    let Some((ty, parent)) = parse_type_link(rec.payload()) else {
        ctx.diag(Diag::with_record(vxid, DiagReason::ParseError, rec));
        return;
    };

    {
        let tx = table.tx_mut(vxid);
        if tx.ty != TxType::Unknown && tx.ty != ty {
            ctx.diag(Diag::with_record(vxid, DiagReason::TypeMismatch, rec));
            return;
        }
        tx.ty = ty;
    }

    let Some(p_vxid) = parent else { return };
    match ctx.grouping {
        Grouping::Vxid => return,
        Grouping::Request if table.tx(vxid).ty == TxType::Request => return,
        _ => {}
    }
    if p_vxid == vxid {
        ctx.diag(Diag::with_record(vxid, DiagReason::ParseError, rec));
        return;
    }

    table.lookup_or_insert(p_vxid, ctx.now);
    let current = table.tx(vxid).parent;
    if current == Some(p_vxid) {
        // Link already exists
        return;
    }
    if current.is_some() {
        ctx.diag(Diag::with_record(vxid, DiagReason::DuplicateLink, rec));
        return;
    }
    if table.tx(p_vxid).ready {
        ctx.diag(Diag::with_record(vxid, DiagReason::LinkTooLate, rec));
        return;
    }

    set_parent(table, p_vxid, vxid);
}

fn scan_link(table: &mut TxTable, vxid: u32, rec: Record, ctx: &mut ScanCtx<'_>) {
    if table.tx(vxid).ready {
        ctx.diag(Diag::with_record(vxid, DiagReason::LinkTooLate, rec));
        return;
    }

    let Some((c_ty, Some(c_vxid))) = parse_type_link(rec.payload()) else {
        ctx.diag(Diag::with_record(vxid, DiagReason::ParseError, rec));
        return;
    };

    match ctx.grouping {
        Grouping::Vxid => return,
        Grouping::Request if table.tx(vxid).ty == TxType::Session => return,
        _ => {}
    }
    if c_vxid == vxid {
        ctx.diag(Diag::with_record(vxid, DiagReason::ParseError, rec));
        return;
    }

    table.lookup_or_insert(c_vxid, ctx.now);
    let child = table.tx(c_vxid);
    if child.parent == Some(vxid) {
        // Link already exists
        return;
    }
    if child.parent.is_some() {
        ctx.diag(Diag::with_record(vxid, DiagReason::DuplicateLink, rec));
        return;
    }
    if child.ready {
        ctx.diag(Diag::with_record(vxid, DiagReason::LinkTooLate, rec));
        return;
    }
    if child.ty != TxType::Unknown && child.ty != c_ty {
        ctx.diag(Diag::with_record(vxid, DiagReason::TypeMismatch, rec));
        return;
    }
    table.tx_mut(c_vxid).ty = c_ty;

    set_parent(table, vxid, c_vxid);
}

/// Propagates readiness upward from a just-completed transaction.
///
/// Returns the root when the walk ends on a ready transaction without a
/// parent — the whole tree is assembled and can be dispatched.
fn check_ready(table: &mut TxTable, vxid: u32, ctx: &mut ScanCtx<'_>) -> Option<u32> {
    {
        let tx = table.tx(vxid);
        debug_assert!(tx.complete && !tx.ready);
        if tx.ty == TxType::Unknown {
            ctx.diag(Diag::new(vxid, DiagReason::UnknownType));
        }
    }

    let mut cur = vxid;
    loop {
        let tx = table.tx_mut(cur);
        if tx.complete && tx.n_child() == tx.n_child_ready {
            tx.ready = true;
        } else {
            break;
        }
        let Some(parent) = tx.parent else { break };
        cur = parent;
        let p = table.tx_mut(parent);
        p.n_child_ready += 1;
        debug_assert!(p.n_child() >= p.n_child_ready);
    }

    let top = table.tx(cur);
    if top.ready && top.parent.is_none() {
        Some(cur)
    } else {
        None
    }
}

/// Scans the records appended since the previous scan. Returns the root of a
/// tree that became ready, if any.
pub(crate) fn scan(table: &mut TxTable, vxid: u32, ctx: &mut ScanCtx<'_>) -> Option<u32> {
    let mut ready = None;
    loop {
        let (rec, complete, ty) = {
            let tx = table.tx_mut(vxid);
            match tx.store.next_record(&mut tx.scan) {
                Some(rec) => (rec, tx.complete, tx.ty),
                None => break,
            }
        };
        let tag = rec.tag();

        if tag == Tag::Batch {
            // Frame marker; its contents were appended as part of the span.
            continue;
        }
        if complete {
            ctx.diag(Diag::with_record(vxid, DiagReason::LateRecord, rec));
            continue;
        }
        if ty == TxType::Unknown && tag != Tag::Begin {
            ctx.diag(Diag::with_record(vxid, DiagReason::EarlyRecord, rec));
        }

        match tag {
            Tag::Begin => scan_begin(table, vxid, rec, ctx),
            Tag::Link => scan_link(table, vxid, rec, ctx),
            Tag::End => {
                debug_assert!(ready.is_none());
                table.mark_complete(vxid);
                ready = check_ready(table, vxid, ctx);
            }
            _ => {}
        }
    }
    ready
}

/// Forces an incomplete transaction to completion (timeout, store overflow
/// or flush) and propagates readiness.
pub(crate) fn force(
    table: &mut TxTable,
    vxid: u32,
    reason: DiagReason,
    ctx: &mut ScanCtx<'_>,
) -> Option<u32> {
    {
        let tx = table.tx(vxid);
        debug_assert!(!tx.complete && !tx.ready);
    }
    ctx.diag(Diag::new(vxid, reason));
    table.mark_complete(vxid);
    check_ready(table, vxid, ctx)
}
