//! Connection runtime.
//!
//! - `state`: packed (state, timestamp) cell read lock-free by the drain loop
//! - `connection`: per-connection read/dispatch loop and the live-connection set
//! - `drain`: closability rule and poll backoff used during shutdown

mod connection;
mod drain;
mod state;

pub(crate) use connection::{ConnHandle, ConnId, Connection, ConnectionRegistry};
pub use drain::DrainPolicy;
pub use state::{unix_now, ConnState, StateCell};
