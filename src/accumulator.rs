//! Reassembly of multi-packet messages from out-of-order fragments.

use std::collections::HashMap;

use bytes::BytesMut;

use crate::driver::{Driver, PacketBuf, Received};
use crate::pkthdr::*;
use crate::type_alias::*;

/// A fragment received ahead of the contiguous prefix.
enum Fragment {
    /// The driver's receive buffer, retained whole; the payload lives at
    /// `[start, start + len)` inside it.
    Stolen {
        buf: PacketBuf,
        start: usize,
        len: usize,
    },

    /// Payload copied out; the driver buffer was released on arrival.
    Copied(Vec<u8>),
}

impl Fragment {
    fn payload(&self) -> &[u8] {
        match self {
            Fragment::Stolen { buf, start, len } => &buf.as_slice()[*start..*start + *len],
            Fragment::Copied(data) => data,
        }
    }
}

/// Assembles one incoming multi-packet message.
///
/// `buffer` always holds exactly the contiguous prefix of the message;
/// fragments that arrived ahead of it wait in `fragments`, keyed by their
/// message offset. No stored fragment starts at or before the prefix
/// length.
pub(crate) struct MessageAccumulator {
    /// The contiguous prefix received so far.
    buffer: Vec<u8>,

    /// Out-of-order fragments, keyed by message offset.
    fragments: HashMap<u32, Fragment, ahash::RandomState>,

    /// Total bytes in the message.
    total_length: u32,

    /// True if this message is short enough to retain stolen driver
    /// buffers until delivery; longer messages copy fragments out so one
    /// message cannot pin the hardware pool.
    zero_copy: bool,
}

impl MessageAccumulator {
    pub fn new(total_length: u32, zero_copy_threshold: u32) -> Self {
        Self {
            buffer: Vec::with_capacity(total_length as usize),
            fragments: HashMap::default(),
            total_length,
            zero_copy: total_length <= zero_copy_threshold,
        }
    }

    /// Total bytes in the message.
    #[inline(always)]
    pub fn total_length(&self) -> u32 {
        self.total_length
    }

    /// Length of the contiguous prefix received so far.
    #[inline(always)]
    pub fn contiguous_length(&self) -> u32 {
        self.buffer.len() as u32
    }

    /// True once every byte of the message has been received.
    #[inline(always)]
    pub fn is_complete(&self) -> bool {
        self.buffer.len() as u32 == self.total_length
    }

    /// Take the assembled message. Only valid once complete.
    pub fn take_message(&mut self) -> Vec<u8> {
        debug_assert!(self.is_complete());
        std::mem::take(&mut self.buffer)
    }

    /// Incorporate one DATA packet.
    ///
    /// In-order payload is appended to the prefix, then any stored
    /// fragments that became contiguous are drained. Out-of-order payload
    /// is held (stealing the driver buffer for short messages, copying for
    /// long ones). Duplicates and payload entirely inside the prefix are
    /// dropped. Returns true iff the message is now complete.
    pub fn add_packet<D: Driver>(
        &mut self,
        header: &DataHeader,
        packet: Received<D::Address>,
        driver: &mut D,
    ) -> bool {
        let payload_len = packet.as_slice().len() - DATA_HEADER_LEN;
        let offset = header.offset;
        let prefix = self.buffer.len() as u32;

        if offset as u64 + payload_len as u64 > self.total_length as u64 {
            log::warn!(
                "dropping DATA for {} past end of message (offset {}, length {}, total {})",
                header.common.rpc_id,
                offset,
                payload_len,
                self.total_length
            );
            driver.release(packet.steal());
            return false;
        }

        if offset > prefix {
            // Can't be appended yet; hold it unless we already have it.
            if self.fragments.contains_key(&offset) {
                driver.release(packet.steal());
            } else if self.zero_copy {
                self.fragments.insert(
                    offset,
                    Fragment::Stolen {
                        buf: packet.steal(),
                        start: DATA_HEADER_LEN,
                        len: payload_len,
                    },
                );
            } else {
                let copied = packet.as_slice()[DATA_HEADER_LEN..].to_vec();
                driver.release(packet.steal());
                self.fragments.insert(offset, Fragment::Copied(copied));
            }
            return false;
        }

        if offset + payload_len as u32 <= prefix {
            // Entirely inside the prefix: a duplicate.
            driver.release(packet.steal());
            return self.is_complete();
        }

        // Append the part of the payload beyond the prefix, then drain
        // whatever stored fragments are now contiguous.
        let skip = (prefix - offset) as usize;
        self.buffer
            .extend_from_slice(&packet.as_slice()[DATA_HEADER_LEN + skip..]);
        driver.release(packet.steal());

        while let Some(frag) = self.fragments.remove(&(self.buffer.len() as u32)) {
            self.buffer.extend_from_slice(frag.payload());
            if let Fragment::Stolen { buf, .. } = frag {
                driver.release(buf);
            }
        }
        self.is_complete()
    }

    /// Ask the sender to retransmit everything between the contiguous
    /// prefix and `up_to` (the smallest offset for which the sender has
    /// not yet delivered all preceding bytes). Returns `up_to`.
    pub fn request_retransmission<D: Driver>(
        &self,
        driver: &mut D,
        address: &D::Address,
        rpc_id: RpcId,
        up_to: u32,
        priority: Priority,
        flags: u8,
    ) -> u32 {
        let prefix = self.contiguous_length();
        debug_assert!(up_to > prefix, "nothing to retransmit");

        let mut buf = BytesMut::with_capacity(RESEND_HEADER_LEN);
        ResendHeader::new(rpc_id, prefix, up_to - prefix, priority, flags).ser(&mut buf);
        driver.send_packet(address, &buf, priority);
        up_to
    }

    /// Hand every retained driver buffer back. Must run on every teardown
    /// path: normal completion, cancellation, transport shutdown.
    pub fn release_buffers<D: Driver>(&mut self, driver: &mut D) {
        for (_, frag) in self.fragments.drain() {
            if let Fragment::Stolen { buf, .. } = frag {
                driver.release(buf);
            }
        }
    }
}
