//! Sender-side state for one message in flight.

use crate::pkthdr::RpcId;
use crate::type_alias::*;

/// Identifies an outgoing message across the two sender-side tables: a
/// request is keyed by our client sequence, a response by the RPC it
/// answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutKey {
    Request(Sequence),
    Response(RpcId),
}

/// Per-direction state for one transmitted message, either the request of
/// a client RPC or the response of a server RPC.
pub(crate) struct OutgoingMessage<A> {
    /// The complete message contents.
    pub buffer: Vec<u8>,

    /// Where to send the message.
    pub recipient: A,

    /// Offset of the next byte to transmit; everything before it has been
    /// sent at least once.
    pub transmit_offset: u32,

    /// Largest offset the grants received so far permit us to transmit.
    /// Never decreases, never exceeds the message length.
    pub transmit_limit: u32,

    /// Priority class for the bytes below `transmit_limit`.
    pub transmit_priority: Priority,

    /// Tick at which we last put data bytes of this message on the wire.
    pub last_transmit_time: Tick,

    /// True iff this message currently sits in the sender's few-bytes-left
    /// top list.
    pub top_choice: bool,

    /// Bytes we may transmit without any grant.
    pub unscheduled_bytes: u32,
}

impl<A> OutgoingMessage<A> {
    pub fn new(buffer: Vec<u8>, recipient: A, unscheduled_bytes: u32) -> Self {
        let total = buffer.len() as u32;
        Self {
            buffer,
            recipient,
            transmit_offset: 0,
            transmit_limit: unscheduled_bytes.min(total),
            transmit_priority: 0,
            last_transmit_time: 0,
            top_choice: false,
            unscheduled_bytes,
        }
    }

    #[inline(always)]
    pub fn total_length(&self) -> u32 {
        self.buffer.len() as u32
    }

    /// Bytes not yet transmitted at all.
    #[inline(always)]
    pub fn bytes_remaining(&self) -> u32 {
        self.total_length() - self.transmit_offset
    }

    /// True if a packet could be sent right now.
    #[inline(always)]
    pub fn transmittable(&self) -> bool {
        self.transmit_offset < self.transmit_limit
    }

    /// True once every byte has been handed to the driver.
    #[inline(always)]
    pub fn fully_transmitted(&self) -> bool {
        self.transmit_offset == self.total_length()
    }

    /// Apply a GRANT: raise the transmit limit and adopt the granted
    /// priority for the newly permitted bytes. Stale grants are ignored.
    pub fn record_grant(&mut self, offset: u32, priority: Priority) {
        let offset = offset.min(self.total_length());
        if offset > self.transmit_limit {
            self.transmit_limit = offset;
            self.transmit_priority = priority;
        }
        debug_assert!(self.transmit_offset <= self.transmit_limit);
    }

    /// The peer lost all state for this RPC: start over from offset zero
    /// with only the unscheduled budget.
    pub fn restart(&mut self) {
        self.transmit_offset = 0;
        self.transmit_limit = self.unscheduled_bytes.min(self.total_length());
    }
}
