//! Deterministic simulation testing for `logq`.
//!
//! Everything the dispatcher treats as external gets a controllable stand-in
//! here: [`SimRing`] is an in-memory word arena with an explicit overwrite
//! horizon and a [`logq::RingCursor`] implementation, [`ManualClock`] is a
//! clock that only moves when told to, and [`StreamGen`] produces seeded
//! random transaction trees in order-preserving random interleaves.

pub mod clock;
pub mod gen;
pub mod ring;

pub use clock::ManualClock;
pub use gen::{RecordSpec, StreamGen};
pub use ring::{SimCursor, SimRing};
