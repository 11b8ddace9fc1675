//! Seeded random transaction stream generation.
//!
//! Produces session → request → backend trees and merges their per-
//! transaction record sequences in a random order. Within one transaction
//! the order is preserved (the producer writes its own records in order);
//! across transactions anything goes, which is exactly the reordering the
//! assembler must tolerate.

use logq::Tag;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, VecDeque};

/// One record to be written into the simulated ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSpec {
    pub tag: Tag,
    pub vxid: u32,
    pub payload: String,
}

fn spec(tag: Tag, vxid: u32, payload: String) -> RecordSpec {
    RecordSpec { tag, vxid, payload }
}

/// Seeded generator of interleaved transaction streams.
pub struct StreamGen {
    rng: SmallRng,
    next_vxid: u32,
}

impl StreamGen {
    /// Same seed, same stream.
    pub fn new(seed: u64) -> Self {
        StreamGen {
            rng: SmallRng::seed_from_u64(seed),
            next_vxid: 1,
        }
    }

    fn alloc(&mut self) -> u32 {
        let vxid = self.next_vxid;
        self.next_vxid += 1;
        vxid
    }

    /// Generates `count` complete session trees. Returns the records in a
    /// random order-preserving interleave, plus the expected node count per
    /// session root.
    pub fn sessions(&mut self, count: usize) -> (Vec<RecordSpec>, BTreeMap<u32, usize>) {
        let mut queues: Vec<VecDeque<RecordSpec>> = Vec::new();
        let mut expected = BTreeMap::new();

        for _ in 0..count {
            let sess = self.alloc();
            let mut nodes = 1usize;
            let mut sess_q = VecDeque::new();
            sess_q.push_back(spec(Tag::Begin, sess, "sess".into()));

            for _ in 0..self.rng.gen_range(1..=3) {
                let req = self.alloc();
                nodes += 1;
                if self.rng.gen_bool(0.5) {
                    // The session names the edge too; the child's Begin will
                    // reassert the same parent, which is a no-op.
                    sess_q.push_back(spec(Tag::Link, sess, format!("req {req}")));
                }
                let mut req_q = VecDeque::new();
                req_q.push_back(spec(Tag::Begin, req, format!("req {sess}")));
                req_q.push_back(spec(Tag::ReqUrl, req, "/gen".into()));

                for _ in 0..self.rng.gen_range(0..=2) {
                    let bereq = self.alloc();
                    nodes += 1;
                    req_q.push_back(spec(Tag::Link, req, format!("bereq {bereq}")));
                    let mut be_q = VecDeque::new();
                    be_q.push_back(spec(Tag::Begin, bereq, format!("bereq {req}")));
                    be_q.push_back(spec(Tag::BereqUrl, bereq, "/gen".into()));
                    be_q.push_back(spec(Tag::End, bereq, String::new()));
                    queues.push(be_q);
                }

                req_q.push_back(spec(Tag::End, req, String::new()));
                queues.push(req_q);
            }

            sess_q.push_back(spec(Tag::End, sess, String::new()));
            queues.push(sess_q);
            expected.insert(sess, nodes);
        }

        let mut out = Vec::new();
        while !queues.is_empty() {
            let i = self.rng.gen_range(0..queues.len());
            if let Some(rec) = queues[i].pop_front() {
                out.push(rec);
            }
            if queues[i].is_empty() {
                queues.swap_remove(i);
            }
        }
        (out, expected)
    }
}
