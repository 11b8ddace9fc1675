//! Word-level log record layout.
//!
//! The producer writes variable-length records into a shared ring of `u32`
//! words. A record is a two-word header followed by the payload, zero-padded
//! to a word boundary:
//!
//! - word 0: tag in the top byte, payload byte length in the low 24 bits
//! - word 1: two origin marker bits above a 30-bit transaction id (vxid)
//!
//! A `Batch` header frames a run of records written under one carrier vxid;
//! its length field counts the enclosed records' bytes. The header itself is
//! an ordinary two-word record, so stepping over it by [`Record::next_words`]
//! lands on the first inner record.

use serde::Serialize;

/// Header size of every record, in words.
pub const HDR_WORDS: usize = 2;

/// Low 30 bits of the id word carry the vxid.
pub const VXID_MASK: u32 = 0x3fff_ffff;

/// Id-word marker: record written on behalf of a client transaction.
pub const MARKER_CLIENT: u32 = 1 << 31;

/// Id-word marker: record written on behalf of a backend transaction.
pub const MARKER_BACKEND: u32 = 1 << 30;

const TAG_SHIFT: u32 = 24;
const LEN_MASK: u32 = 0x00ff_ffff;

/// Number of words needed to hold `bytes` payload bytes.
#[inline]
pub const fn words_of_bytes(bytes: usize) -> usize {
    (bytes + 3) / 4
}

/// Record type discriminator.
///
/// The core interprets only the control tags (`Begin`, `Link`, `End`,
/// `Batch`); every other tag is data carried through to the callback. Raw
/// values without a named variant round-trip through `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Tag {
    Begin,
    Link,
    End,
    Batch,
    SessOpen,
    SessClose,
    ReqMethod,
    ReqUrl,
    ReqHeader,
    RespStatus,
    RespHeader,
    BereqMethod,
    BereqUrl,
    BereqHeader,
    BerespStatus,
    Timestamp,
    Hit,
    Miss,
    Error,
    Debug,
    /// A tag value the core does not interpret.
    Unknown(u8),
}

impl Tag {
    /// Decodes a raw tag byte.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Tag::Begin,
            2 => Tag::Link,
            3 => Tag::End,
            4 => Tag::Batch,
            5 => Tag::SessOpen,
            6 => Tag::SessClose,
            7 => Tag::ReqMethod,
            8 => Tag::ReqUrl,
            9 => Tag::ReqHeader,
            10 => Tag::RespStatus,
            11 => Tag::RespHeader,
            12 => Tag::BereqMethod,
            13 => Tag::BereqUrl,
            14 => Tag::BereqHeader,
            15 => Tag::BerespStatus,
            16 => Tag::Timestamp,
            17 => Tag::Hit,
            18 => Tag::Miss,
            19 => Tag::Error,
            20 => Tag::Debug,
            other => Tag::Unknown(other),
        }
    }

    /// Encodes the tag back to its raw byte.
    pub fn to_raw(self) -> u8 {
        match self {
            Tag::Begin => 1,
            Tag::Link => 2,
            Tag::End => 3,
            Tag::Batch => 4,
            Tag::SessOpen => 5,
            Tag::SessClose => 6,
            Tag::ReqMethod => 7,
            Tag::ReqUrl => 8,
            Tag::ReqHeader => 9,
            Tag::RespStatus => 10,
            Tag::RespHeader => 11,
            Tag::BereqMethod => 12,
            Tag::BereqUrl => 13,
            Tag::BereqHeader => 14,
            Tag::BerespStatus => 15,
            Tag::Timestamp => 16,
            Tag::Hit => 17,
            Tag::Miss => 18,
            Tag::Error => 19,
            Tag::Debug => 20,
            Tag::Unknown(other) => other,
        }
    }

    /// Human-readable tag name for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Tag::Begin => "Begin",
            Tag::Link => "Link",
            Tag::End => "End",
            Tag::Batch => "Batch",
            Tag::SessOpen => "SessOpen",
            Tag::SessClose => "SessClose",
            Tag::ReqMethod => "ReqMethod",
            Tag::ReqUrl => "ReqUrl",
            Tag::ReqHeader => "ReqHeader",
            Tag::RespStatus => "RespStatus",
            Tag::RespHeader => "RespHeader",
            Tag::BereqMethod => "BereqMethod",
            Tag::BereqUrl => "BereqUrl",
            Tag::BereqHeader => "BereqHeader",
            Tag::BerespStatus => "BerespStatus",
            Tag::Timestamp => "Timestamp",
            Tag::Hit => "Hit",
            Tag::Miss => "Miss",
            Tag::Error => "Error",
            Tag::Debug => "Debug",
            Tag::Unknown(_) => "Unknown",
        }
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A raw record handle pointing into the shared ring or into a transaction's
/// private buffer.
///
/// `Record` is a plain word pointer, `Copy` and free of lifetimes, so it can
/// be stashed in chunk descriptors and iterated the way the producer laid the
/// words out. The price is an explicit validity contract:
///
/// - a record inside the ring is readable only while
///   [`RingCursor::check`](crate::cursor::RingCursor::check) does not report
///   it [`Lost`](crate::cursor::RefCheck::Lost); the dispatcher's eviction
///   guard upholds this by promoting stores before the window moves;
/// - a record inside a private buffer is readable while that buffer is alive
///   and not reallocated, which holds for the duration of a scan or a
///   callback because appends never interleave with either.
#[derive(Debug, Clone, Copy)]
pub struct Record {
    ptr: *const u32,
}

impl Record {
    /// Wraps a raw pointer to a record header.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a well-formed record: at least [`HDR_WORDS`] +
    /// payload words readable, per the validity contract in the type docs.
    pub unsafe fn from_ptr(ptr: *const u32) -> Self {
        debug_assert!(!ptr.is_null());
        Record { ptr }
    }

    /// The underlying word pointer.
    #[inline]
    pub fn as_ptr(self) -> *const u32 {
        self.ptr
    }

    #[inline]
    fn header(self) -> u32 {
        // SAFETY: upheld by the from_ptr contract.
        unsafe { self.ptr.read() }
    }

    #[inline]
    fn id_word(self) -> u32 {
        // SAFETY: upheld by the from_ptr contract.
        unsafe { self.ptr.add(1).read() }
    }

    /// The record's tag.
    #[inline]
    pub fn tag(self) -> Tag {
        Tag::from_raw((self.header() >> TAG_SHIFT) as u8)
    }

    /// The transaction id carrying this record. For a `Batch` header this is
    /// the carrier vxid of the enclosed records.
    #[inline]
    pub fn vxid(self) -> u32 {
        self.id_word() & VXID_MASK
    }

    /// True if the producer marked this record as client-side.
    #[inline]
    pub fn is_client(self) -> bool {
        self.id_word() & MARKER_CLIENT != 0
    }

    /// True if the producer marked this record as backend-side.
    #[inline]
    pub fn is_backend(self) -> bool {
        self.id_word() & MARKER_BACKEND != 0
    }

    /// Payload length in bytes.
    #[inline]
    pub fn len_bytes(self) -> usize {
        (self.header() & LEN_MASK) as usize
    }

    /// Payload bytes, excluding the pad.
    pub fn payload(&self) -> &[u8] {
        // SAFETY: the payload occupies words_of_bytes(len) words right after
        // the header, per the from_ptr contract.
        unsafe {
            std::slice::from_raw_parts(self.ptr.add(HDR_WORDS).cast::<u8>(), self.len_bytes())
        }
    }

    /// Words to the next record when stepping through a stored sequence.
    ///
    /// A `Batch` header advances by its own two words only, so iteration
    /// descends into the enclosed records.
    #[inline]
    pub fn next_words(self) -> usize {
        if self.tag() == Tag::Batch {
            HDR_WORDS
        } else {
            HDR_WORDS + words_of_bytes(self.len_bytes())
        }
    }

    /// Full span of the record in words, header included. For a `Batch`
    /// header this covers the header plus every enclosed record.
    #[inline]
    pub fn span_words(self) -> usize {
        HDR_WORDS + words_of_bytes(self.len_bytes())
    }

    /// Words occupied by a batch body (everything after the header).
    #[inline]
    pub fn batch_body_words(self) -> usize {
        words_of_bytes(self.len_bytes())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::{Tag, HDR_WORDS, VXID_MASK};

    /// Encodes one record into words (test helper).
    pub fn enc(tag: Tag, vxid: u32, payload: &[u8]) -> Vec<u32> {
        let words = super::words_of_bytes(payload.len());
        let mut out = Vec::with_capacity(HDR_WORDS + words);
        out.push((u32::from(tag.to_raw()) << 24) | payload.len() as u32);
        out.push(vxid & VXID_MASK);
        for piece in payload.chunks(4) {
            let mut word = [0u8; 4];
            word[..piece.len()].copy_from_slice(piece);
            out.push(u32::from_le_bytes(word));
        }
        out
    }
}
