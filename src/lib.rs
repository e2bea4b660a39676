//! A receiver-driven, priority-scheduled datagram RPC transport.
//!
//! `shortwire` multiplexes many concurrent RPCs over a connectionless
//! packet driver. Short messages travel at near-minimum latency: a sender
//! may push one round-trip's worth of bytes unilaterally, at a priority
//! chosen from the message size. Everything longer is paced by the
//! receiver, which grants transmission rights to a small set of distinct
//! senders at a time, favoring the messages closest to completion (an
//! approximation of shortest-remaining-processing-time), and assigns
//! network priorities so the best message always wins the wire.
//!
//! The transport is strictly single-threaded: all state changes happen
//! inside [`Transport::poll`], which the owning dispatch loop calls on
//! every iteration, or inside the O(1) API entry points.

mod accumulator;
mod config;
mod driver;
mod error;
mod outgoing;
mod pkthdr;
mod sched;
mod transport;
pub mod type_alias;

pub use self::config::TransportConfig;
pub use self::driver::{Driver, PacketBuf, Received};
pub use self::error::TransportError;
pub use self::pkthdr::RpcId;
pub use self::transport::{ReplyHandle, RpcNotifier, Transport};

#[cfg(test)]
mod tests;
