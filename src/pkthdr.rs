//! On-wire packet headers.
//!
//! All multi-byte fields are little-endian, byte-packed, no padding. The
//! codec is deliberately dumb: fixed layouts, no varints, so header
//! encode/decode stays off the profile.

use std::cmp::Ordering;
use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use crate::type_alias::*;

/// A unique identifier for an RPC: the issuing client plus a sequence
/// number that is monotonically increasing per client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RpcId {
    pub client_id: ClientId,
    pub sequence: Sequence,
}

impl RpcId {
    pub const WIRE_LEN: usize = 16;

    #[inline(always)]
    pub fn new(client_id: ClientId, sequence: Sequence) -> Self {
        Self {
            client_id,
            sequence,
        }
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.client_id);
        buf.put_u64_le(self.sequence);
    }

    fn parse(buf: &mut &[u8]) -> Self {
        Self {
            client_id: buf.get_u64_le(),
            sequence: buf.get_u64_le(),
        }
    }
}

impl Ord for RpcId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.client_id, self.sequence).cmp(&(other.client_id, other.sequence))
    }
}

impl PartialOrd for RpcId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client_id, self.sequence)
    }
}

/// Packet opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Opcode {
    /// An entire request or response message in one packet.
    AllData = 20,

    /// A portion of a request or response message.
    Data = 21,

    /// Receiver-to-sender: raises the sender's transmit limit.
    Grant = 22,

    /// Debug only: the recipient dumps its time trace to the log.
    LogTimeTrace = 23,

    /// Receiver-to-sender: retransmit a byte range.
    Resend = 24,

    /// Keep-alive; resets the recipient's silent-interval counter only.
    Busy = 25,

    /// Client-to-server: the client has cancelled this RPC.
    Abort = 26,
}

impl TryFrom<u8> for Opcode {
    type Error = HeaderError;

    fn try_from(val: u8) -> Result<Self, HeaderError> {
        match val {
            20 => Ok(Self::AllData),
            21 => Ok(Self::Data),
            22 => Ok(Self::Grant),
            23 => Ok(Self::LogTimeTrace),
            24 => Ok(Self::Resend),
            25 => Ok(Self::Busy),
            26 => Ok(Self::Abort),
            _ => Err(HeaderError::BadOpcode(val)),
        }
    }
}

/// Symbolic name of an opcode byte, for log lines.
pub(crate) fn opcode_symbol(opcode: u8) -> &'static str {
    match Opcode::try_from(opcode) {
        Ok(Opcode::AllData) => "ALL_DATA",
        Ok(Opcode::Data) => "DATA",
        Ok(Opcode::Grant) => "GRANT",
        Ok(Opcode::LogTimeTrace) => "LOG_TIME_TRACE",
        Ok(Opcode::Resend) => "RESEND",
        Ok(Opcode::Busy) => "BUSY",
        Ok(Opcode::Abort) => "ABORT",
        Err(_) => "UNKNOWN",
    }
}

// Flag bits for `CommonHeader::flags`. Not every flag is valid for every
// opcode.
//
// FROM_CLIENT:    valid everywhere; set iff the packet travels
//                 client-to-server. FROM_SERVER is the readability alias
//                 for its absence.
// RETRANSMISSION: DATA only; the packet answers a RESEND.
// RESTART:        GRANT/RESEND only; the recipient must clear all sender
//                 state for this RPC and start again from offset zero.
pub(crate) const FROM_CLIENT: u8 = 1;
pub(crate) const FROM_SERVER: u8 = 0;
pub(crate) const RETRANSMISSION: u8 = 2;
pub(crate) const RESTART: u8 = 4;

/// Header fields common to all packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CommonHeader {
    pub opcode: Opcode,
    pub rpc_id: RpcId,
    pub flags: u8,
}

pub(crate) const COMMON_HEADER_LEN: usize = 1 + RpcId::WIRE_LEN + 1;
pub(crate) const ALL_DATA_HEADER_LEN: usize = COMMON_HEADER_LEN + 2;
pub(crate) const DATA_HEADER_LEN: usize = COMMON_HEADER_LEN + 12;
pub(crate) const GRANT_HEADER_LEN: usize = COMMON_HEADER_LEN + 5;
pub(crate) const RESEND_HEADER_LEN: usize = COMMON_HEADER_LEN + 9;

impl CommonHeader {
    pub fn new(opcode: Opcode, rpc_id: RpcId, flags: u8) -> Self {
        Self {
            opcode,
            rpc_id,
            flags,
        }
    }

    #[inline(always)]
    pub fn from_client(&self) -> bool {
        self.flags & FROM_CLIENT != 0
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.opcode as u8);
        self.rpc_id.ser(buf);
        buf.put_u8(self.flags);
    }
}

/// ALL_DATA: the entire message follows the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AllDataHeader {
    pub common: CommonHeader,
    pub message_length: u16,
}

impl AllDataHeader {
    pub fn new(rpc_id: RpcId, flags: u8, message_length: u16) -> Self {
        Self {
            common: CommonHeader::new(Opcode::AllData, rpc_id, flags),
            message_length,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        self.common.ser(buf);
        buf.put_u16_le(self.message_length);
    }
}

/// DATA: a fragment of a message, starting at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DataHeader {
    pub common: CommonHeader,

    /// Total bytes in the message, not in this packet.
    pub total_length: u32,

    /// Offset of this packet's first payload byte within the message.
    pub offset: u32,

    /// The sender's unscheduled-byte budget for this message.
    pub unscheduled_bytes: u32,
}

impl DataHeader {
    pub fn new(
        rpc_id: RpcId,
        total_length: u32,
        offset: u32,
        unscheduled_bytes: u32,
        flags: u8,
    ) -> Self {
        Self {
            common: CommonHeader::new(Opcode::Data, rpc_id, flags),
            total_length,
            offset,
            unscheduled_bytes,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        self.common.ser(buf);
        buf.put_u32_le(self.total_length);
        buf.put_u32_le(self.offset);
        buf.put_u32_le(self.unscheduled_bytes);
    }
}

/// GRANT: the sender may now transmit everything below `offset`, at
/// priority `priority`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GrantHeader {
    pub common: CommonHeader,
    pub offset: u32,
    pub priority: Priority,
}

impl GrantHeader {
    pub fn new(rpc_id: RpcId, offset: u32, priority: Priority, flags: u8) -> Self {
        Self {
            common: CommonHeader::new(Opcode::Grant, rpc_id, flags),
            offset,
            priority,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        self.common.ser(buf);
        buf.put_u32_le(self.offset);
        buf.put_u8(self.priority);
    }
}

/// RESEND: retransmit `[offset, offset + length)` at `priority`. The range
/// may extend past what has been granted; the sender clamps it. With the
/// RESTART flag the priority field is ignored and the sender starts over
/// from offset zero at its unscheduled priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResendHeader {
    pub common: CommonHeader,
    pub offset: u32,
    pub length: u32,
    pub priority: Priority,
}

impl ResendHeader {
    pub fn new(rpc_id: RpcId, offset: u32, length: u32, priority: Priority, flags: u8) -> Self {
        Self {
            common: CommonHeader::new(Opcode::Resend, rpc_id, flags),
            offset,
            length,
            priority,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        self.common.ser(buf);
        buf.put_u32_le(self.offset);
        buf.put_u32_le(self.length);
        buf.put_u8(self.priority);
    }
}

/// BUSY, ABORT and LOG_TIME_TRACE carry nothing beyond the common header.
pub(crate) fn ser_control(opcode: Opcode, rpc_id: RpcId, flags: u8, buf: &mut BytesMut) {
    CommonHeader::new(opcode, rpc_id, flags).ser(buf);
}

/// Decoded view of a received packet's header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PacketHeader {
    AllData(AllDataHeader),
    Data(DataHeader),
    Grant(GrantHeader),
    Resend(ResendHeader),
    Busy(CommonHeader),
    Abort(CommonHeader),
    LogTimeTrace(CommonHeader),
}

/// Decode failures. These indicate a buggy or hostile peer; the packet is
/// logged and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub(crate) enum HeaderError {
    #[error("packet truncated: {0} bytes")]
    Truncated(usize),

    #[error("unknown opcode {0}")]
    BadOpcode(u8),

    #[error("payload length mismatch: header says {expected}, packet carries {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

impl PacketHeader {
    /// Decode the header at the front of `packet`.
    ///
    /// For ALL_DATA and DATA, the caller takes the payload from
    /// `&packet[header.payload_offset()..]`; ALL_DATA's payload length is
    /// validated here against `message_length`.
    pub fn parse(packet: &[u8]) -> Result<Self, HeaderError> {
        if packet.len() < COMMON_HEADER_LEN {
            return Err(HeaderError::Truncated(packet.len()));
        }
        let mut buf = packet;
        let opcode = Opcode::try_from(buf.get_u8())?;
        let rpc_id = RpcId::parse(&mut buf);
        let flags = buf.get_u8();
        let common = CommonHeader {
            opcode,
            rpc_id,
            flags,
        };

        match opcode {
            Opcode::AllData => {
                if buf.remaining() < 2 {
                    return Err(HeaderError::Truncated(packet.len()));
                }
                let message_length = buf.get_u16_le();
                if buf.remaining() != message_length as usize {
                    return Err(HeaderError::LengthMismatch {
                        expected: message_length as usize,
                        actual: buf.remaining(),
                    });
                }
                Ok(Self::AllData(AllDataHeader {
                    common,
                    message_length,
                }))
            }
            Opcode::Data => {
                if buf.remaining() < 12 {
                    return Err(HeaderError::Truncated(packet.len()));
                }
                Ok(Self::Data(DataHeader {
                    common,
                    total_length: buf.get_u32_le(),
                    offset: buf.get_u32_le(),
                    unscheduled_bytes: buf.get_u32_le(),
                }))
            }
            Opcode::Grant => {
                if buf.remaining() < 5 {
                    return Err(HeaderError::Truncated(packet.len()));
                }
                Ok(Self::Grant(GrantHeader {
                    common,
                    offset: buf.get_u32_le(),
                    priority: buf.get_u8(),
                }))
            }
            Opcode::Resend => {
                if buf.remaining() < 9 {
                    return Err(HeaderError::Truncated(packet.len()));
                }
                Ok(Self::Resend(ResendHeader {
                    common,
                    offset: buf.get_u32_le(),
                    length: buf.get_u32_le(),
                    priority: buf.get_u8(),
                }))
            }
            Opcode::Busy => Ok(Self::Busy(common)),
            Opcode::Abort => Ok(Self::Abort(common)),
            Opcode::LogTimeTrace => Ok(Self::LogTimeTrace(common)),
        }
    }

    /// Common fields, whatever the opcode.
    #[inline(always)]
    pub fn common(&self) -> &CommonHeader {
        match self {
            Self::AllData(h) => &h.common,
            Self::Data(h) => &h.common,
            Self::Grant(h) => &h.common,
            Self::Resend(h) => &h.common,
            Self::Busy(c) | Self::Abort(c) | Self::LogTimeTrace(c) => c,
        }
    }

    /// Where the payload begins, for the opcodes that carry one.
    #[inline(always)]
    pub fn payload_offset(&self) -> usize {
        match self {
            Self::AllData(_) => ALL_DATA_HEADER_LEN,
            Self::Data(_) => DATA_HEADER_LEN,
            _ => 0,
        }
    }
}
