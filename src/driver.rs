//! The packet-driver seam.
//!
//! The transport runs on top of a connectionless packet driver that can
//! send bounded datagrams at a chosen priority and poll for received ones.
//! Real deployments wire in a kernel-bypass NIC driver; tests use an
//! in-memory network.

use std::fmt;
use std::hash::Hash;

use crate::type_alias::Priority;

/// A receive buffer handed out by the driver.
///
/// Exactly one owner at a time: the driver until [`Driver::receive_packets`]
/// returns it, then the transport, which either releases it back before the
/// end of the poll or steals it into a message accumulator. Every stolen
/// buffer is released on the accumulator's teardown, whichever exit path
/// that takes.
#[derive(Debug)]
pub struct PacketBuf {
    data: Vec<u8>,
}

impl PacketBuf {
    /// Wrap raw packet contents.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// The full packet contents (header bytes included).
    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Recover the underlying storage, e.g. for pool reuse.
    #[inline]
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

/// One received datagram.
pub struct Received<A> {
    /// Address of the machine that sent the packet.
    pub sender: A,

    buf: PacketBuf,
}

impl<A> Received<A> {
    /// Package a freshly received packet.
    pub fn new(sender: A, buf: PacketBuf) -> Self {
        Self { sender, buf }
    }

    /// The full packet contents.
    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_slice()
    }

    /// Take ownership of the receive buffer away from the driver.
    ///
    /// The new owner is responsible for eventually passing the buffer to
    /// [`Driver::release`].
    #[inline]
    pub fn steal(self) -> PacketBuf {
        self.buf
    }
}

/// Driver abstraction for sending and receiving raw datagrams.
///
/// The transport assumes nothing about the medium beyond what this trait
/// states: bounded datagrams, best-effort delivery, a fixed number of
/// hardware priority queues, and a bounded transmit queue whose free space
/// the driver can report.
pub trait Driver {
    /// Network address type. Cheap to clone and hashable; the receiver
    /// scheduler distinguishes senders by hashing addresses.
    type Address: Clone + Eq + Hash + fmt::Debug;

    /// Parse an address from a string locator. Returns `None` if the
    /// locator does not describe a reachable peer.
    fn address_from_locator(&self, locator: &str) -> Option<Self::Address>;

    /// Queue one datagram for transmission at the given priority class
    /// (0 lowest). The driver owns pacing; this call never blocks.
    fn send_packet(&mut self, addr: &Self::Address, packet: &[u8], priority: Priority);

    /// Poll for up to `max` received datagrams, appending them to `out`.
    fn receive_packets(&mut self, max: usize, out: &mut Vec<Received<Self::Address>>);

    /// Return a receive buffer to the driver's pool. Must be called exactly
    /// once for every buffer obtained via [`Received::steal`].
    fn release(&mut self, buf: PacketBuf);

    /// Largest datagram the link carries, header bytes included.
    fn max_packet_size(&self) -> u32;

    /// Highest priority class the link supports (0 means no priority
    /// queues).
    fn highest_packet_priority(&self) -> Priority;

    /// How many more bytes the transmit queue will accept right now.
    /// The send selector stops queuing packets once this is exhausted.
    fn transmit_queue_space(&self) -> u32;
}
