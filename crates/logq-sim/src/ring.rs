//! In-memory stand-in for the producer ring.
//!
//! The arena is a fixed, never-moving slice of words, so record pointers
//! handed out by the cursor stay dereferenceable for the whole test. Instead
//! of actually wrapping, the simulation models eviction with two horizons:
//! words below `lost_before` are gone, words below `imminent_before` are
//! about to be. Tests move the horizons explicitly.

use logq::record::{words_of_bytes, HDR_WORDS, VXID_MASK};
use logq::{CursorError, CursorStep, Record, RefCheck, RingCursor, Tag};
use std::sync::{Arc, Mutex};

const DEFAULT_CAPACITY_WORDS: usize = 1 << 16;

struct SimState {
    words: Box<[u32]>,
    wr: usize,
    rd: usize,
    lost_before: usize,
    imminent_before: usize,
    eof: bool,
    fail_next: bool,
}

impl SimState {
    fn push_record(&mut self, tag: Tag, vxid: u32, payload: &[u8]) {
        let need = HDR_WORDS + words_of_bytes(payload.len());
        assert!(
            self.wr + need <= self.words.len(),
            "sim ring arena exhausted"
        );
        self.words[self.wr] = (u32::from(tag.to_raw()) << 24) | payload.len() as u32;
        self.words[self.wr + 1] = vxid & VXID_MASK;
        for (i, piece) in payload.chunks(4).enumerate() {
            let mut word = [0u8; 4];
            word[..piece.len()].copy_from_slice(piece);
            self.words[self.wr + HDR_WORDS + i] = u32::from_le_bytes(word);
        }
        self.wr += need;
    }
}

/// Writer and control handle over the simulated ring.
#[derive(Clone)]
pub struct SimRing {
    state: Arc<Mutex<SimState>>,
}

/// The consumer side; implements [`RingCursor`].
pub struct SimCursor {
    state: Arc<Mutex<SimState>>,
}

impl SimRing {
    /// Creates an arena of `capacity` words plus its cursor.
    pub fn with_capacity(capacity: usize) -> (SimRing, SimCursor) {
        let state = Arc::new(Mutex::new(SimState {
            words: vec![0u32; capacity].into_boxed_slice(),
            wr: 0,
            rd: 0,
            lost_before: 0,
            imminent_before: 0,
            eof: false,
            fail_next: false,
        }));
        (
            SimRing {
                state: Arc::clone(&state),
            },
            SimCursor { state },
        )
    }

    /// Creates a default-sized arena plus its cursor.
    pub fn pair() -> (SimRing, SimCursor) {
        Self::with_capacity(DEFAULT_CAPACITY_WORDS)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().expect("sim ring poisoned")
    }

    /// Appends one record.
    pub fn write(&self, tag: Tag, vxid: u32, payload: &[u8]) {
        self.lock().push_record(tag, vxid, payload);
    }

    /// Appends a batch frame: a `Batch` header under `carrier` followed by
    /// the inner records.
    pub fn write_batch(&self, carrier: u32, inner: &[(Tag, u32, &[u8])]) {
        let mut state = self.lock();
        let body_words: usize = inner
            .iter()
            .map(|(_, _, payload)| HDR_WORDS + words_of_bytes(payload.len()))
            .sum();
        state.push_record(Tag::Batch, carrier, &[]);
        // Patch the header length to cover the body.
        let hdr = state.wr - HDR_WORDS;
        state.words[hdr] = (u32::from(Tag::Batch.to_raw()) << 24) | (body_words * 4) as u32;
        for &(tag, vxid, payload) in inner {
            state.push_record(tag, vxid, payload);
        }
    }

    /// Marks everything written so far as about to be overwritten.
    pub fn make_imminent(&self) {
        let mut state = self.lock();
        state.imminent_before = state.wr;
    }

    /// Marks everything written so far as already overwritten.
    pub fn make_lost(&self) {
        let mut state = self.lock();
        state.lost_before = state.wr;
        state.imminent_before = state.imminent_before.max(state.wr);
    }

    /// Switches the cursor from "no data for now" to end-of-input.
    pub fn set_eof(&self) {
        self.lock().eof = true;
    }

    /// Makes the next `next` call fail once.
    pub fn fail_next(&self) {
        self.lock().fail_next = true;
    }

    /// Words written so far.
    pub fn written_words(&self) -> usize {
        self.lock().wr
    }
}

impl RingCursor for SimCursor {
    fn next(&mut self) -> Result<CursorStep, CursorError> {
        let mut state = self.state.lock().expect("sim ring poisoned");
        if state.fail_next {
            state.fail_next = false;
            return Err(CursorError);
        }
        if state.rd >= state.wr {
            return Ok(if state.eof {
                CursorStep::Eof
            } else {
                CursorStep::Empty
            });
        }
        let ptr: *const u32 = &state.words[state.rd];
        // SAFETY: rd points at a record header inside the arena, which never
        // moves for the lifetime of the SimState.
        let rec = unsafe { Record::from_ptr(ptr) };
        state.rd += if rec.tag() == Tag::Batch {
            HDR_WORDS
        } else {
            rec.span_words()
        };
        Ok(CursorStep::Record(rec))
    }

    fn check(&self, rec: Record) -> RefCheck {
        let state = self.state.lock().expect("sim ring poisoned");
        let base = state.words.as_ptr() as usize;
        let end = base + state.words.len() * 4;
        let p = rec.as_ptr() as usize;
        if p < base || p >= end {
            // Not an arena pointer: a private buffer, nothing of ours.
            return RefCheck::Valid;
        }
        let offset = (p - base) / 4;
        if offset < state.lost_before {
            RefCheck::Lost
        } else if offset < state.imminent_before {
            RefCheck::OverwriteImminent
        } else {
            RefCheck::Valid
        }
    }

    fn skip(&mut self, words: usize) -> Result<(), CursorError> {
        let mut state = self.state.lock().expect("sim ring poisoned");
        state.rd += words;
        debug_assert!(state.rd <= state.wr);
        Ok(())
    }
}
