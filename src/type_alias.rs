//! Type aliases used in this library.

/// [`u64`]: Uniquely identifies a client transport instance across the cluster.
pub type ClientId = u64;

/// [`u64`]: Per-client RPC sequence number, monotonically increasing.
pub type Sequence = u64;

/// [`u32`]: Index of a session within its owning transport.
pub type SessionId = u32;

/// [`u8`]: Packet priority class (0 is lowest).
pub type Priority = u8;

/// [`u64`]: Monotonic tick timestamp supplied by the dispatch layer.
pub type Tick = u64;
