//! Receiver-side state for messages that need grants.

use crate::pkthdr::RpcId;
use crate::type_alias::*;

/// Identifies a scheduled message: the RPC it belongs to plus its
/// direction (a request we are receiving as server, or a response we are
/// receiving as client).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SchedKey {
    pub rpc_id: RpcId,

    /// True iff the message travels client-to-server (we are the server).
    pub from_client: bool,
}

/// Scheduling state of an incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SchedState {
    /// Just constructed; not yet placed on either list.
    New,

    /// On the active list: being granted.
    Active,

    /// Parked on the inactive list.
    Inactive,

    /// Granted through its last byte; on neither list.
    FullyGranted,
}

/// One incoming message whose length exceeds the sender's unscheduled
/// budget, so the remainder must be granted.
pub(crate) struct ScheduledMessage<A> {
    pub rpc_id: RpcId,

    /// Where grants for this message go.
    pub sender_address: A,

    /// Hash of the sender's address; the scheduler keeps active senders
    /// distinct by comparing these.
    pub sender_hash: u64,

    /// High-water mark of grants sent, starting at the sender's
    /// unscheduled budget. Non-decreasing.
    pub grant_offset: u32,

    /// Priority carried by the most recent GRANT.
    pub grant_priority: Priority,

    /// Contiguous bytes of the message received so far; kept in step with
    /// the accumulator by the receive path.
    pub bytes_received: u32,

    /// Total bytes in the message.
    pub total_length: u32,

    /// Direction of the message (request or response).
    pub from_client: bool,

    pub state: SchedState,
}

impl<A> ScheduledMessage<A> {
    pub fn new(
        rpc_id: RpcId,
        sender_address: A,
        sender_hash: u64,
        unscheduled_bytes: u32,
        total_length: u32,
        from_client: bool,
    ) -> Self {
        debug_assert!(total_length > unscheduled_bytes);
        Self {
            rpc_id,
            sender_address,
            sender_hash,
            grant_offset: unscheduled_bytes,
            grant_priority: 0,
            bytes_received: 0,
            total_length,
            from_client,
            state: SchedState::New,
        }
    }

    #[inline(always)]
    pub fn bytes_remaining(&self) -> u32 {
        self.total_length - self.bytes_received
    }

    /// Priority key: fewer bytes remaining wins, then the earlier RpcId as
    /// a stable tiebreak.
    #[inline]
    pub fn precedes(&self, other: &Self) -> bool {
        (self.bytes_remaining(), self.rpc_id) < (other.bytes_remaining(), other.rpc_id)
    }
}
