//! Debug-build invariant checks for the transaction table.
//!
//! The dispatcher runs [`check_table`] after every processed record in debug
//! builds; release builds pay nothing. A violation here is a programming
//! error, never a data problem, so the checks abort instead of returning.

#[cfg(debug_assertions)]
use crate::table::TxTable;

/// Walks the whole table and asserts the structural invariants.
#[cfg(debug_assertions)]
pub(crate) fn check_table(table: &TxTable) {
    for tx in table.iter() {
        // Ready is a strengthening of complete.
        if tx.ready {
            assert!(tx.complete, "<{}> ready without complete", tx.vxid);
        }
        assert!(
            tx.n_child() >= tx.n_child_ready,
            "<{}> more ready children than children",
            tx.vxid
        );

        // Edges are symmetric and counted once.
        if let Some(parent_vxid) = tx.parent {
            let parent = table
                .get(parent_vxid)
                .expect("parent link to transaction outside the table");
            let links = parent
                .children
                .iter()
                .filter(|&&child| child == tx.vxid)
                .count();
            assert_eq!(links, 1, "<{}> not linked exactly once", tx.vxid);
            assert!(
                parent.n_descend >= 1 + tx.n_descend,
                "<{}> descendant count exceeds parent's",
                tx.vxid
            );
        }

        // Descendant counts are exact sums over children.
        let sum: u32 = tx
            .children
            .iter()
            .map(|&child| {
                1 + table
                    .get(child)
                    .expect("child link to transaction outside the table")
                    .n_descend
            })
            .sum();
        assert_eq!(tx.n_descend, sum, "<{}> descendant count drifted", tx.vxid);

        // Store length bookkeeping.
        assert_eq!(
            tx.store.len_words(),
            tx.store.chunk_words() + tx.store.buffered_words(),
            "<{}> store length out of sync",
            tx.vxid
        );

        // Ring references imply exactly one live queue entry.
        if tx.store.has_chunks() {
            assert_eq!(
                table.ring_ref_entries(tx.vxid, tx.seq),
                1,
                "<{}> holds chunks but is not queued once",
                tx.vxid
            );
        }
    }
}
