//! Packed connection lifecycle state.
//!
//! The state and the Unix second of its last transition share one `u64` so
//! the drain loop can read both without a lock:
//!
//! ```text
//!  63                                    8 7        0
//! +---------------------------------------+----------+
//! |        unix seconds (56 bits)         |  state   |
//! +---------------------------------------+----------+
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

const STATE_BITS: u32 = 8;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;

/// Largest timestamp representable in the packed word.
pub const MAX_TIMESTAMP: u64 = u64::MAX >> STATE_BITS;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// Accepted, or a request line has arrived and is being handled.
    New = 0,
    /// Response written; blocked waiting for the next request.
    Idle = 1,
    /// Terminal.
    Closed = 2,
}

impl ConnState {
    fn from_bits(bits: u8) -> ConnState {
        match bits {
            0 => ConnState::New,
            1 => ConnState::Idle,
            2 => ConnState::Closed,
            other => panic!("internal error: invalid connection state {other}"),
        }
    }
}

/// Atomic (state, last-transition timestamp) pair.
///
/// A freshly constructed cell reads as `(New, 0)`; a zero timestamp means
/// the cell has never been stamped.
#[derive(Debug, Default)]
pub struct StateCell {
    packed: AtomicU64,
}

impl StateCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `state` stamped with the current wall-clock second.
    pub fn store(&self, state: ConnState) {
        self.store_at(state, unix_now());
    }

    /// Store `state` stamped with `unix_sec`.
    ///
    /// The stored timestamp never moves backwards: if `unix_sec` is older
    /// than the current stamp the current stamp is kept.
    pub fn store_at(&self, state: ConnState, unix_sec: u64) {
        assert!(
            unix_sec <= MAX_TIMESTAMP,
            "internal error: timestamp {unix_sec} does not fit the packed state"
        );
        // Cannot fail: the closure always returns `Some`.
        let _ = self
            .packed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                let stamp = unix_sec.max(prev >> STATE_BITS);
                Some(pack(state, stamp))
            });
    }

    /// Load the current state and its timestamp.
    pub fn load(&self) -> (ConnState, u64) {
        unpack(self.packed.load(Ordering::Acquire))
    }
}

fn pack(state: ConnState, unix_sec: u64) -> u64 {
    (unix_sec << STATE_BITS) | state as u64
}

fn unpack(packed: u64) -> (ConnState, u64) {
    let state = ConnState::from_bits((packed & STATE_MASK) as u8);
    (state, packed >> STATE_BITS)
}

/// Current wall-clock time in whole Unix seconds, clamped at zero.
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
