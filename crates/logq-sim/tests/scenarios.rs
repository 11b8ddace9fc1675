//! End-to-end dispatch scenarios over the simulated ring.

use logq::{
    DiagReason, DispatchError, Dispatched, Grouping, LogQuery, MemorySink, RecordCursor, Tag,
    RAW_VXID,
};
use logq_sim::{ManualClock, SimRing};
use std::sync::Arc;
use std::time::Duration;

/// What one callback invocation saw: per node, the vxid, the level, and the
/// record tags in order.
#[derive(Debug, Clone, PartialEq, Eq)]
struct NodeSnap {
    vxid: i64,
    level: u32,
    tags: Vec<Tag>,
}

fn snap(nodes: &mut [RecordCursor<'_>]) -> Vec<NodeSnap> {
    nodes
        .iter_mut()
        .map(|node| {
            let mut tags = Vec::new();
            while let Some(rec) = node.next() {
                tags.push(rec.tag());
            }
            node.reset();
            NodeSnap {
                vxid: node.vxid(),
                level: node.level(),
                tags,
            }
        })
        .collect()
}

#[test_log::test]
fn simple_request_under_session_grouping() {
    let (ring, cursor) = SimRing::pair();
    ring.write(Tag::Begin, 1, b"sess");
    ring.write(Tag::Begin, 2, b"req 1");
    ring.write(Tag::ReqUrl, 2, b"/a");
    ring.write(Tag::End, 2, b"");
    ring.write(Tag::Link, 1, b"req 2");
    ring.write(Tag::End, 1, b"");

    let mut q = LogQuery::new(cursor, Grouping::Session);
    let mut trees = Vec::new();
    let got = q.dispatch(|nodes| {
        trees.push(snap(nodes));
        0
    });
    assert_eq!(got, Ok(Dispatched::Drained));

    assert_eq!(trees.len(), 1);
    let tree = &trees[0];
    assert_eq!(tree.len(), 2);
    // Deepest-first: the request before its session.
    assert_eq!((tree[0].vxid, tree[0].level), (2, 1));
    assert_eq!((tree[1].vxid, tree[1].level), (1, 0));
    assert_eq!(tree[0].tags, vec![Tag::Begin, Tag::ReqUrl, Tag::End]);
    assert_eq!(tree[1].tags, vec![Tag::Begin, Tag::Link, Tag::End]);

    // The dispatched tree is retired wholesale.
    assert_eq!(q.stats().transactions, 0);
    assert_eq!(q.stats().incomplete, 0);
}

#[test]
fn vxid_grouping_dispatches_single_nodes() {
    let (ring, cursor) = SimRing::pair();
    ring.write(Tag::Begin, 1, b"sess");
    ring.write(Tag::Begin, 2, b"req 1");
    ring.write(Tag::ReqUrl, 2, b"/a");
    ring.write(Tag::End, 2, b"");
    ring.write(Tag::Link, 1, b"req 2");
    ring.write(Tag::End, 1, b"");

    let mut q = LogQuery::new(cursor, Grouping::Vxid);
    let mut trees = Vec::new();
    q.dispatch(|nodes| {
        trees.push(snap(nodes));
        0
    })
    .expect("dispatch");

    // One callback per End, in End order, each a single level-0 node.
    assert_eq!(trees.len(), 2);
    assert_eq!(trees[0].len(), 1);
    assert_eq!((trees[0][0].vxid, trees[0][0].level), (2, 0));
    assert_eq!((trees[1][0].vxid, trees[1][0].level), (1, 0));
}

#[test]
fn out_of_order_arrival_assembles_the_same_tree() {
    let (ring, cursor) = SimRing::pair();
    ring.write(Tag::Begin, 3, b"req 2");
    ring.write(Tag::Begin, 2, b"sess");
    ring.write(Tag::Link, 2, b"req 3");
    ring.write(Tag::End, 3, b"");
    ring.write(Tag::End, 2, b"");

    let mut q = LogQuery::new(cursor, Grouping::Session);
    let mut trees = Vec::new();
    q.dispatch(|nodes| {
        trees.push(snap(nodes));
        0
    })
    .expect("dispatch");

    assert_eq!(trees.len(), 1);
    let tree = &trees[0];
    assert_eq!((tree[0].vxid, tree[0].level), (3, 1));
    assert_eq!((tree[1].vxid, tree[1].level), (2, 0));
}

#[test]
fn timeout_forces_incomplete_transactions() {
    let (ring, cursor) = SimRing::pair();
    ring.write(Tag::Begin, 9, b"req");

    let clock = Arc::new(ManualClock::new());
    let sink = Arc::new(MemorySink::new());
    let mut q = LogQuery::new(cursor, Grouping::Request)
        .with_clock(clock.clone())
        .with_diag_sink(sink.clone());

    let mut trees = Vec::new();
    q.dispatch(|nodes| {
        trees.push(snap(nodes));
        0
    })
    .expect("dispatch");
    assert!(trees.is_empty());
    assert_eq!(q.stats().incomplete, 1);

    clock.advance(Duration::from_secs(121));
    q.dispatch(|nodes| {
        trees.push(snap(nodes));
        0
    })
    .expect("dispatch");

    assert_eq!(trees.len(), 1);
    assert_eq!(trees[0][0].vxid, 9);
    assert_eq!(sink.count(DiagReason::Timeout), 1);
    assert_eq!(q.metrics().forced_timeout, 1);
    assert_eq!(q.stats().transactions, 0);
}

#[test]
fn timeout_under_session_grouping_retires_silently() {
    let (ring, cursor) = SimRing::pair();
    ring.write(Tag::Begin, 9, b"req");

    let clock = Arc::new(ManualClock::new());
    let mut q = LogQuery::new(cursor, Grouping::Session).with_clock(clock.clone());
    q.dispatch(|_| 0).expect("dispatch");
    clock.advance(Duration::from_secs(121));

    let mut fired = 0;
    q.dispatch(|_| {
        fired += 1;
        0
    })
    .expect("dispatch");
    // Wrong root type for the grouping: no callback, but the transaction is
    // gone all the same.
    assert_eq!(fired, 0);
    assert_eq!(q.stats().transactions, 0);
}

#[test]
fn overwrite_imminent_promotes_the_store() {
    let (ring, cursor) = SimRing::pair();
    ring.write(Tag::Begin, 4, b"req");

    let mut q = LogQuery::new(cursor, Grouping::Vxid);
    q.dispatch(|_| 0).expect("dispatch");
    assert_eq!(q.metrics().promotions, 0);

    ring.make_imminent();
    ring.write(Tag::End, 4, b"");

    let mut trees = Vec::new();
    q.dispatch(|nodes| {
        trees.push(snap(nodes));
        0
    })
    .expect("dispatch");

    assert_eq!(q.metrics().promotions, 1);
    assert_eq!(trees.len(), 1);
    assert_eq!(trees[0][0].tags, vec![Tag::Begin, Tag::End]);
}

#[test]
fn overwrite_lost_fails_the_dispatch() {
    let (ring, cursor) = SimRing::pair();
    ring.write(Tag::Begin, 4, b"req");

    let mut q = LogQuery::new(cursor, Grouping::Vxid);
    q.dispatch(|_| 0).expect("dispatch");

    ring.make_lost();
    ring.write(Tag::End, 4, b"");

    let got = q.dispatch(|_| panic!("callback must not fire"));
    assert_eq!(got, Err(DispatchError::Overrun));
}

#[test]
fn duplicate_link_keeps_the_first_parent() {
    let (ring, cursor) = SimRing::pair();
    ring.write(Tag::Begin, 5, b"req 1");
    ring.write(Tag::Begin, 5, b"req 2");
    ring.write(Tag::End, 5, b"");
    ring.write(Tag::End, 1, b"");

    let sink = Arc::new(MemorySink::new());
    let mut q = LogQuery::new(cursor, Grouping::Session).with_diag_sink(sink.clone());
    let mut fired = 0;
    q.dispatch(|_| {
        fired += 1;
        0
    })
    .expect("dispatch");

    assert_eq!(sink.count(DiagReason::DuplicateLink), 1);
    // vxid 1 completes in unknown type and roots the tree; the session
    // filter drops it silently, but vxid 2 must not have adopted 5.
    assert_eq!(sink.count(DiagReason::UnknownType), 1);
    assert_eq!(fired, 0);
    assert_eq!(q.stats().transactions, 1); // only the lazily created 2 remains
    assert_eq!(q.flush(|_| 0), Dispatched::Drained);
    assert_eq!(q.stats().transactions, 0);
}

#[test]
fn batch_is_one_span_but_iterates_record_by_record() {
    let (ring, cursor) = SimRing::pair();
    ring.write(Tag::Begin, 3, b"req");
    ring.write_batch(
        3,
        &[
            (Tag::ReqMethod, 3, b"GET"),
            (Tag::ReqUrl, 3, b"/b"),
            (Tag::End, 3, b""),
        ],
    );

    let mut q = LogQuery::new(cursor, Grouping::Vxid);
    let mut trees = Vec::new();
    q.dispatch(|nodes| {
        trees.push(snap(nodes));
        0
    })
    .expect("dispatch");

    assert_eq!(q.metrics().batches, 1);
    assert_eq!(trees.len(), 1);
    // The frame marker stays in the store; the inner records follow it.
    assert_eq!(
        trees[0][0].tags,
        vec![Tag::Begin, Tag::Batch, Tag::ReqMethod, Tag::ReqUrl, Tag::End]
    );
}

#[test]
fn batch_with_carrier_zero_streams_inner_records() {
    let (ring, cursor) = SimRing::pair();
    ring.write_batch(0, &[(Tag::Begin, 6, b"req"), (Tag::End, 6, b"")]);

    let mut q = LogQuery::new(cursor, Grouping::Vxid);
    let mut trees = Vec::new();
    q.dispatch(|nodes| {
        trees.push(snap(nodes));
        0
    })
    .expect("dispatch");

    // The frame is dropped (reserved carrier), its contents are not.
    assert_eq!(q.metrics().records_ignored, 1);
    assert_eq!(trees.len(), 1);
    assert_eq!(trees[0][0].vxid, 6);
    assert_eq!(trees[0][0].tags, vec![Tag::Begin, Tag::End]);
}

#[test]
fn zero_vxid_records_are_dropped_silently() {
    let (ring, cursor) = SimRing::pair();
    ring.write(Tag::Timestamp, 0, b"boot");
    ring.write(Tag::Begin, 1, b"req");
    ring.write(Tag::End, 1, b"");

    let mut q = LogQuery::new(cursor, Grouping::Vxid);
    let mut fired = 0;
    q.dispatch(|_| {
        fired += 1;
        0
    })
    .expect("dispatch");

    assert_eq!(fired, 1);
    assert_eq!(q.metrics().records_ignored, 1);
    assert_eq!(q.metrics().records_routed, 2);
}

#[test]
fn deep_tree_is_delivered_deepest_first() {
    let (ring, cursor) = SimRing::pair();
    ring.write(Tag::Begin, 1, b"sess");
    ring.write(Tag::Begin, 2, b"req 1");
    ring.write(Tag::Begin, 3, b"bereq 2");
    ring.write(Tag::Begin, 4, b"esireq 2");
    for vxid in [3, 4, 2, 1] {
        ring.write(Tag::End, vxid, b"");
    }

    let mut q = LogQuery::new(cursor, Grouping::Session);
    let mut trees = Vec::new();
    q.dispatch(|nodes| {
        trees.push(snap(nodes));
        0
    })
    .expect("dispatch");

    assert_eq!(trees.len(), 1);
    let order: Vec<(i64, u32)> = trees[0].iter().map(|n| (n.vxid, n.level)).collect();
    assert_eq!(order, vec![(4, 2), (3, 2), (2, 1), (1, 0)]);
}

#[test]
fn request_grouping_includes_backend_and_esi_work() {
    let (ring, cursor) = SimRing::pair();
    ring.write(Tag::Begin, 1, b"sess");
    ring.write(Tag::Link, 1, b"req 2");
    ring.write(Tag::Begin, 2, b"req 1");
    ring.write(Tag::Begin, 3, b"bereq 2");
    ring.write(Tag::End, 3, b"");
    ring.write(Tag::End, 2, b"");
    ring.write(Tag::End, 1, b"");

    let mut q = LogQuery::new(cursor, Grouping::Request);
    let mut trees = Vec::new();
    q.dispatch(|nodes| {
        trees.push(snap(nodes));
        0
    })
    .expect("dispatch");

    // One request tree; the session completes alone and is filtered out.
    assert_eq!(trees.len(), 1);
    let order: Vec<(i64, u32)> = trees[0].iter().map(|n| (n.vxid, n.level)).collect();
    assert_eq!(order, vec![(3, 1), (2, 0)]);
    assert_eq!(q.stats().transactions, 0);
}

#[test]
fn callback_abort_propagates_and_resumes() {
    let (ring, cursor) = SimRing::pair();
    ring.write(Tag::Begin, 1, b"req");
    ring.write(Tag::End, 1, b"");
    ring.write(Tag::Begin, 2, b"req");
    ring.write(Tag::End, 2, b"");

    let mut q = LogQuery::new(cursor, Grouping::Vxid);
    let mut seen = Vec::new();
    let got = q.dispatch(|nodes| {
        seen.push(nodes[0].vxid());
        5
    });
    assert_eq!(got, Ok(Dispatched::Stopped(5)));
    assert_eq!(seen, vec![1]);

    // The next call picks up where the cursor stopped.
    q.dispatch(|nodes| {
        seen.push(nodes[0].vxid());
        0
    })
    .expect("dispatch");
    assert_eq!(seen, vec![1, 2]);
}

#[test]
fn flush_forces_everything_and_empties_the_table() {
    let (ring, cursor) = SimRing::pair();
    ring.write(Tag::Begin, 2, b"sess");
    ring.write(Tag::Begin, 3, b"req 2");
    ring.write(Tag::End, 3, b"");

    let sink = Arc::new(MemorySink::new());
    let mut q = LogQuery::new(cursor, Grouping::Session).with_diag_sink(sink.clone());
    q.dispatch(|_| 0).expect("dispatch");
    assert_eq!(q.stats().incomplete, 1);

    let mut trees = Vec::new();
    let got = q.flush(|nodes| {
        trees.push(snap(nodes));
        0
    });
    assert_eq!(got, Dispatched::Drained);

    assert_eq!(sink.count(DiagReason::Flush), 1);
    assert_eq!(trees.len(), 1);
    assert_eq!(trees[0].len(), 2);
    assert_eq!(q.stats().incomplete, 0);
    assert_eq!(q.stats().transactions, 0);
}

#[test]
fn store_overflow_forces_the_oldest() {
    let (ring, cursor) = SimRing::pair();
    for vxid in 1..=5 {
        ring.write(Tag::Begin, vxid, b"req");
    }

    let sink = Arc::new(MemorySink::new());
    let cfg = logq::DispatchConfig::default().with_incomplete_max(2);
    let mut q = LogQuery::new(cursor, Grouping::Vxid)
        .with_config(cfg)
        .with_diag_sink(sink.clone());

    let mut seen = Vec::new();
    q.dispatch(|nodes| {
        seen.push(nodes[0].vxid());
        0
    })
    .expect("dispatch");

    assert_eq!(seen, vec![1, 2, 3]);
    assert_eq!(q.metrics().forced_overflow, 3);
    assert_eq!(sink.count(DiagReason::StoreOverflow), 3);
    assert_eq!(q.stats().incomplete, 2);
}

#[test]
fn eof_and_cursor_errors_propagate() {
    let (ring, cursor) = SimRing::pair();
    ring.set_eof();
    let mut q = LogQuery::new(cursor, Grouping::Session);
    assert_eq!(q.dispatch(|_| 0), Ok(Dispatched::Eof));

    let (ring, cursor) = SimRing::pair();
    ring.fail_next();
    let mut q = LogQuery::new(cursor, Grouping::Session);
    assert!(matches!(q.dispatch(|_| 0), Err(DispatchError::Cursor(_))));
}

#[test]
fn raw_grouping_streams_single_records() {
    let (ring, cursor) = SimRing::pair();
    ring.write(Tag::Begin, 1, b"req");
    ring.write(Tag::ReqUrl, 1, b"/raw");
    ring.write(Tag::End, 1, b"");

    let mut q = LogQuery::new(cursor, Grouping::Raw);
    let mut seen = Vec::new();
    q.dispatch(|nodes| {
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].vxid(), RAW_VXID);
        assert_eq!(nodes[0].level(), 0);
        let rec = nodes[0].next().expect("one record");
        assert!(nodes[0].next().is_none());
        seen.push(rec.tag());
        0
    })
    .expect("dispatch");

    assert_eq!(seen, vec![Tag::Begin, Tag::ReqUrl, Tag::End]);
    assert_eq!(q.metrics().raw_delivered, 3);
}

#[test]
fn raw_grouping_applies_the_query() {
    let (ring, cursor) = SimRing::pair();
    ring.write(Tag::Begin, 1, b"req");
    ring.write(Tag::ReqUrl, 1, b"/only-this");
    ring.write(Tag::End, 1, b"");

    let mut q = LogQuery::new(cursor, Grouping::Raw).with_query(
        |nodes: &mut [RecordCursor<'_>]| {
            nodes[0]
                .next()
                .is_some_and(|rec| rec.tag() == Tag::ReqUrl)
        },
    );

    let mut payloads = Vec::new();
    q.dispatch(|nodes| {
        // The query consumed the cursor; it arrives reset.
        let rec = nodes[0].next().expect("record");
        payloads.push(String::from_utf8_lossy(rec.payload()).into_owned());
        0
    })
    .expect("dispatch");

    assert_eq!(payloads, vec!["/only-this".to_string()]);
}

#[test]
fn tree_query_filters_and_resets_cursors() {
    let (ring, cursor) = SimRing::pair();
    // Session 1 has a ReqUrl, session 10 does not.
    ring.write(Tag::Begin, 1, b"req");
    ring.write(Tag::ReqUrl, 1, b"/hit");
    ring.write(Tag::End, 1, b"");
    ring.write(Tag::Begin, 10, b"req");
    ring.write(Tag::End, 10, b"");

    let has_requrl = |nodes: &mut [RecordCursor<'_>]| {
        let mut found = false;
        for node in nodes.iter_mut() {
            while let Some(rec) = node.next() {
                found |= rec.tag() == Tag::ReqUrl;
            }
        }
        found
    };

    let mut q = LogQuery::new(cursor, Grouping::Vxid).with_query(has_requrl);
    let mut trees = Vec::new();
    q.dispatch(|nodes| {
        trees.push(snap(nodes));
        0
    })
    .expect("dispatch");

    assert_eq!(trees.len(), 1);
    assert_eq!(trees[0][0].vxid, 1);
    // Cursors were reset after the query pass.
    assert_eq!(trees[0][0].tags, vec![Tag::Begin, Tag::ReqUrl, Tag::End]);
    assert_eq!(q.metrics().trees_ready, 2);
    assert_eq!(q.metrics().trees_delivered, 1);
}

#[test]
fn end_before_begin_completes_as_unknown() {
    let (ring, cursor) = SimRing::pair();
    ring.write(Tag::End, 8, b"");

    let sink = Arc::new(MemorySink::new());
    let mut q = LogQuery::new(cursor, Grouping::Vxid).with_diag_sink(sink.clone());
    let mut trees = Vec::new();
    q.dispatch(|nodes| {
        trees.push(snap(nodes));
        0
    })
    .expect("dispatch");

    // Vxid grouping has no type filter, so even the unknown tree arrives.
    assert_eq!(trees.len(), 1);
    assert_eq!(sink.count(DiagReason::UnknownType), 1);
    assert_eq!(sink.count(DiagReason::EarlyRecord), 1);
}
