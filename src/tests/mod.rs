//! Deterministic end-to-end tests over an in-memory packet network.
//!
//! Each test wires one or more transports to a shared [`Network`] that
//! routes packets by address, records a full wire trace, and can drop
//! packets on demand. Time is a plain counter advanced by the tests, so
//! every run is reproducible.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Once;

use simple_logger::SimpleLogger;

use crate::driver::{Driver, PacketBuf, Received};
use crate::pkthdr::*;
use crate::type_alias::*;
use crate::{Transport, TransportConfig, TransportError};

mod corners;
mod sched;

static LOGGER: Once = Once::new();

pub(self) fn init_logger() {
    LOGGER.call_once(|| {
        SimpleLogger::new()
            .with_level(log::LevelFilter::Info)
            .init()
            .unwrap();
    });
}

pub(crate) type Addr = u64;

/// Test MTU: 1000 payload bytes per DATA packet.
pub(crate) const MTU: u32 = 1000 + DATA_HEADER_LEN as u32;

/// One packet as the network saw it.
#[derive(Debug, Clone)]
pub(crate) struct TraceEntry {
    pub from: Addr,
    pub to: Addr,
    pub priority: Priority,
    pub packet: Vec<u8>,
    pub dropped: bool,
}

impl TraceEntry {
    pub fn opcode(&self) -> u8 {
        self.packet[0]
    }

    pub fn header(&self) -> PacketHeader {
        PacketHeader::parse(&self.packet).expect("unparseable packet in trace")
    }
}

/// Shared in-memory network: per-address delivery queues plus a trace of
/// every send.
pub(crate) struct Network {
    queues: HashMap<Addr, VecDeque<(Addr, Vec<u8>, Priority)>>,
    pub trace: Vec<TraceEntry>,

    /// Sent packets matching this predicate are recorded but not
    /// delivered.
    pub drop_filter: Option<Box<dyn FnMut(&TraceEntry) -> bool>>,

    /// Receive buffers currently held by transports (stolen or in
    /// flight); zero at quiescence.
    pub outstanding_buffers: usize,
}

impl Network {
    pub fn new() -> Rc<RefCell<Network>> {
        Rc::new(RefCell::new(Network {
            queues: HashMap::new(),
            trace: Vec::new(),
            drop_filter: None,
            outstanding_buffers: 0,
        }))
    }
}

impl Network {
    /// Delivered packets of the given opcode addressed to `to`.
    pub fn delivered(&self, to: Addr, opcode: Opcode) -> usize {
        self.trace
            .iter()
            .filter(|e| e.to == to && e.opcode() == opcode as u8 && !e.dropped)
            .count()
    }

    /// Duplicate the most recent packet queued for `to`.
    pub fn duplicate_last(&mut self, to: Addr) {
        let last = self
            .queues
            .get(&to)
            .and_then(|q| q.back().cloned())
            .expect("no packet to duplicate");
        self.queues.get_mut(&to).unwrap().push_back(last);
    }

    /// Inject raw bytes as a packet to `to`.
    pub fn inject(&mut self, from: Addr, to: Addr, packet: Vec<u8>) {
        self.queues.entry(to).or_default().push_back((from, packet, 0));
    }
}

/// Driver backed by the shared [`Network`].
pub(crate) struct MockDriver {
    addr: Addr,
    net: Rc<RefCell<Network>>,
    queue_space: Rc<Cell<u32>>,
}

impl Driver for MockDriver {
    type Address = Addr;

    fn address_from_locator(&self, locator: &str) -> Option<Addr> {
        locator.parse().ok()
    }

    fn send_packet(&mut self, addr: &Addr, packet: &[u8], priority: Priority) {
        self.queue_space
            .set(self.queue_space.get().saturating_sub(packet.len() as u32));

        let mut net = self.net.borrow_mut();
        let mut entry = TraceEntry {
            from: self.addr,
            to: *addr,
            priority,
            packet: packet.to_vec(),
            dropped: false,
        };
        entry.dropped = net
            .drop_filter
            .as_mut()
            .is_some_and(|filter| filter(&entry));
        if !entry.dropped {
            net.queues
                .entry(*addr)
                .or_default()
                .push_back((self.addr, packet.to_vec(), priority));
        }
        net.trace.push(entry);
    }

    fn receive_packets(&mut self, max: usize, out: &mut Vec<Received<Addr>>) {
        let mut net = self.net.borrow_mut();
        let net = &mut *net;
        let Some(queue) = net.queues.get_mut(&self.addr) else {
            return;
        };
        for _ in 0..max {
            let Some((from, data, _)) = queue.pop_front() else {
                break;
            };
            net.outstanding_buffers += 1;
            out.push(Received::new(from, PacketBuf::new(data)));
        }
    }

    fn release(&mut self, _buf: PacketBuf) {
        self.net.borrow_mut().outstanding_buffers -= 1;
    }

    fn max_packet_size(&self) -> u32 {
        MTU
    }

    fn highest_packet_priority(&self) -> Priority {
        7
    }

    fn transmit_queue_space(&self) -> u32 {
        self.queue_space.get()
    }
}

/// Config used by most tests: 4 packets of unscheduled budget, a fast
/// timer so liveness tests stay short.
pub(crate) fn test_config() -> TransportConfig {
    TransportConfig {
        round_trip_bytes: 4000,
        timer_interval: 10,
        ..TransportConfig::default()
    }
}

/// Build a transport on the shared network. The returned cell is the
/// driver's transmit queue space; tests that throttle refill it between
/// polls.
pub(crate) fn make_transport(
    net: &Rc<RefCell<Network>>,
    addr: Addr,
    client_id: ClientId,
    config: TransportConfig,
) -> (Transport<MockDriver>, Rc<Cell<u32>>) {
    let queue_space = Rc::new(Cell::new(u32::MAX));
    let driver = MockDriver {
        addr,
        net: net.clone(),
        queue_space: queue_space.clone(),
    };
    (Transport::new(driver, config, client_id), queue_space)
}

/// Capture slot for an RPC outcome.
pub(crate) type Outcome = Rc<RefCell<Option<Result<Vec<u8>, TransportError>>>>;

pub(crate) fn outcome_slot() -> (Outcome, impl FnOnce(Result<Vec<u8>, TransportError>)) {
    let slot: Outcome = Rc::new(RefCell::new(None));
    let writer = {
        let slot = slot.clone();
        move |result| {
            *slot.borrow_mut() = Some(result);
        }
    };
    (slot, writer)
}

/// Answer every ready request with `reply`.
pub(crate) fn serve_with(
    transport: &mut Transport<MockDriver>,
    mut reply: impl FnMut(Vec<u8>) -> Vec<u8>,
) {
    while let Some((handle, payload)) = transport.take_request() {
        let _ = transport.send_reply(handle, reply(payload));
    }
}

/// Poll both ends (server echoing) for `iterations` ticks.
pub(crate) fn pump_echo(
    client: &mut Transport<MockDriver>,
    server: &mut Transport<MockDriver>,
    now: &mut Tick,
    iterations: usize,
) {
    for _ in 0..iterations {
        *now += 1;
        client.poll(*now);
        server.poll(*now);
        serve_with(server, |req| req);
        server.poll(*now);
    }
}

/// A deterministic byte pattern for message payloads.
pub(crate) fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}
