//! The transport proper: RPC tables, sessions, and the per-tick poller.

mod grant;
mod rx;
mod timer;
mod tx;

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::hash::BuildHasher;

use bytes::BytesMut;

use crate::accumulator::MessageAccumulator;
use crate::config::TransportConfig;
use crate::driver::{Driver, Received};
use crate::error::TransportError;
use crate::outgoing::{OutKey, OutgoingMessage};
use crate::pkthdr::*;
use crate::sched::{SchedKey, ScheduledMessage};
use crate::type_alias::*;

/// Completion callback for a client RPC. Invoked exactly once, with the
/// assembled response or the failure. Must not reenter the transport.
pub type RpcNotifier = Box<dyn FnOnce(Result<Vec<u8>, TransportError>)>;

/// How many received packets one poll drains from the driver at most.
const POLL_BATCH_SIZE: usize = 8;

/// Bound on the top-outgoing list. Large enough that the slow path is
/// rare, small enough that scanning it costs less than a cache miss.
const TOP_OUTGOING_LIMIT: usize = 8;

/// State for one RPC for which we are the client.
pub(crate) struct ClientRpc<A> {
    /// Session the RPC was issued on.
    pub session: SessionId,

    /// The request message being (or already) transmitted.
    pub request: OutgoingMessage<A>,

    /// Reassembly state for a multi-packet response. `None` until the
    /// first response DATA packet arrives (single-packet responses never
    /// create one).
    pub response: Option<MessageAccumulator>,

    /// The sender's unscheduled budget for the response, as published in
    /// its DATA headers. Meaningful only while `response` is `Some`.
    pub peer_unscheduled: u32,

    /// Completion callback; taken exactly once.
    pub notifier: Option<RpcNotifier>,

    pub rpc_id: RpcId,

    /// Timer wakeups since we last heard from the server.
    pub silent_intervals: u32,

    /// True while request bytes remain to transmit (and the RPC is in
    /// `outgoing_requests`).
    pub transmit_pending: bool,

    /// True iff the response has an entry in the scheduled-message table.
    pub scheduled: bool,
}

/// State for one RPC for which we are the server.
pub(crate) struct ServerRpc<A> {
    /// Server-local sequence number, distinct from the client's.
    pub sequence: Sequence,

    pub rpc_id: RpcId,

    /// Where the request came from and the response goes.
    pub client_address: A,

    /// Set when an ABORT arrives while the request is with the service
    /// layer; the RPC is torn down at `send_reply`.
    pub cancelled: bool,

    /// True once every request byte has been received.
    pub request_complete: bool,

    /// True while the service layer holds the request.
    pub in_service: bool,

    /// True once `send_reply` has made the response an outgoing message.
    pub sending_response: bool,

    /// Timer wakeups since we last heard from the client.
    pub silent_intervals: u32,

    /// Reassembly state for a multi-packet request.
    pub accumulator: Option<MessageAccumulator>,

    /// The client's unscheduled budget for the request, as published in
    /// its DATA headers.
    pub peer_unscheduled: u32,

    /// Completed request payload, parked until `take_request`.
    pub request: Option<Vec<u8>>,

    /// The response message, once `send_reply` has run.
    pub response: Option<OutgoingMessage<A>>,

    /// True iff the request has an entry in the scheduled-message table.
    pub scheduled: bool,
}

/// Client-side connection state for one target server.
struct SessionState<A> {
    server_address: A,

    /// True once `abort_session` has run; the session refuses new RPCs.
    aborted: bool,
}

/// Opaque capability to answer one incoming request. Returned by
/// [`Transport::take_request`], consumed by [`Transport::send_reply`].
#[derive(Debug)]
pub struct ReplyHandle {
    rpc_id: RpcId,
}

/// A receiver-driven, priority-scheduled datagram RPC transport.
///
/// All state lives in one of these per network endpoint; everything
/// mutates inside [`poll`](Self::poll) or one of the O(1) API entry
/// points, on a single dispatch thread.
pub struct Transport<D: Driver> {
    pub(crate) driver: D,
    pub(crate) config: TransportConfig,

    /// Uniquely identifies this transport as an RPC client.
    client_id: ClientId,

    /// Most message bytes that fit in one DATA packet.
    pub(crate) max_data_per_packet: u32,

    /// One round-trip's worth of bytes, rounded up to whole packets.
    pub(crate) round_trip_bytes: u32,

    /// How far each new GRANT extends the granted range at least.
    pub(crate) grant_increment: u32,

    /// Highest priority class the driver offers.
    pub(crate) highest_avail_priority: Priority,

    /// Highest priority class used for granted (scheduled) bytes; the
    /// classes above it belong to unscheduled traffic.
    pub(crate) highest_sched_priority: Priority,

    next_client_sequence: Sequence,
    next_server_sequence: Sequence,

    sessions: Vec<SessionState<D::Address>>,

    /// RPCs for which we are the client and the response is not yet
    /// complete. Keyed by our sequence number.
    pub(crate) outgoing_rpcs: HashMap<Sequence, ClientRpc<D::Address>, ahash::RandomState>,

    /// Subset of `outgoing_rpcs` with request bytes still to transmit.
    pub(crate) outgoing_requests: Vec<Sequence>,

    /// RPCs for which we are the server: at least one request byte has
    /// arrived and the last response byte has not yet left.
    pub(crate) incoming_rpcs: HashMap<RpcId, ServerRpc<D::Address>, ahash::RandomState>,

    /// Subset of `incoming_rpcs` whose response is partially transmitted.
    pub(crate) outgoing_responses: Vec<RpcId>,

    /// The sender's few-messages-with-fewest-bytes-left cache; the send
    /// selector normally looks no further than this.
    pub(crate) top_outgoing: Vec<OutKey>,

    /// True if some message outside `top_outgoing` may have transmittable
    /// bytes, so an empty top scan must fall back to scanning everything.
    pub(crate) transmit_data_slow_path: bool,

    /// All incoming messages that need granting, by RPC and direction.
    pub(crate) scheduled: HashMap<SchedKey, ScheduledMessage<D::Address>, ahash::RandomState>,

    /// Scheduled messages being granted right now: at most
    /// `max_granted_messages`, all with distinct sender hashes, sorted
    /// best-first by the priority key.
    pub(crate) active_messages: Vec<SchedKey>,

    /// Scheduled messages parked until an active slot frees up.
    pub(crate) inactive_messages: Vec<SchedKey>,

    /// Messages whose granted range may need extending; filled during
    /// packet processing, flushed once per poll.
    pub(crate) messages_to_grant: Vec<SchedKey>,

    /// Fully received requests waiting for the service layer.
    ready_requests: VecDeque<RpcId>,

    /// ABORTs queued by `cancel_request`, dispatched on the next poll.
    pending_aborts: Vec<(D::Address, RpcId)>,

    /// Scratch space for the receive batch, reused across polls.
    received_batch: Vec<Received<D::Address>>,

    /// Tick at which the next liveness check runs; 0 until the first poll.
    next_timeout_check: Tick,

    /// Hashes sender addresses for the scheduler's distinctness check.
    sender_hasher: ahash::RandomState,
}

impl<D: Driver> Transport<D> {
    /// Build a transport over `driver`. `client_id` must be unique among
    /// all clients that will ever talk to the same servers.
    pub fn new(driver: D, config: TransportConfig, client_id: ClientId) -> Self {
        config.validate();

        let mtu = driver.max_packet_size();
        assert!(
            mtu as usize > DATA_HEADER_LEN,
            "driver MTU {} cannot even carry a data header",
            mtu
        );
        let max_data_per_packet = mtu - DATA_HEADER_LEN as u32;
        assert!(
            config.small_message_threshold <= max_data_per_packet,
            "small_message_threshold must fit in one packet"
        );

        // Keep the unscheduled budget packet-aligned so the last
        // unscheduled packet is full-size.
        let round_trip_bytes =
            config.round_trip_bytes.div_ceil(max_data_per_packet) * max_data_per_packet;
        // A grant increment above the round-trip budget would let the
        // granted-but-unreceived window empty out before the next grant
        // fires, stalling both ends.
        let grant_increment = match config.grant_increment {
            0 => max_data_per_packet,
            n => n.min(round_trip_bytes),
        };

        // Unscheduled traffic owns the top priority classes, one per size
        // bracket; whatever remains below them is for grants.
        let highest_avail_priority = driver.highest_packet_priority();
        let unsched_classes = config.unsched_prio_cutoffs.len() as u8;
        let lowest_unsched_prio = highest_avail_priority.saturating_sub(unsched_classes - 1);
        let highest_sched_priority = lowest_unsched_prio.saturating_sub(1);

        log::info!(
            "transport starting: client {}, {} B/packet, {} B unscheduled, priorities 0..={} \
             (scheduled 0..={})",
            client_id,
            max_data_per_packet,
            round_trip_bytes,
            highest_avail_priority,
            highest_sched_priority,
        );

        Self {
            driver,
            config,
            client_id,
            max_data_per_packet,
            round_trip_bytes,
            grant_increment,
            highest_avail_priority,
            highest_sched_priority,
            next_client_sequence: 1,
            next_server_sequence: 1,
            sessions: Vec::new(),
            outgoing_rpcs: HashMap::default(),
            outgoing_requests: Vec::new(),
            incoming_rpcs: HashMap::default(),
            outgoing_responses: Vec::new(),
            top_outgoing: Vec::with_capacity(TOP_OUTGOING_LIMIT),
            transmit_data_slow_path: false,
            scheduled: HashMap::default(),
            active_messages: Vec::new(),
            inactive_messages: Vec::new(),
            messages_to_grant: Vec::new(),
            ready_requests: VecDeque::new(),
            pending_aborts: Vec::new(),
            received_batch: Vec::with_capacity(POLL_BATCH_SIZE),
            next_timeout_check: 0,
            sender_hasher: ahash::RandomState::new(),
        }
    }

    /// This transport's client identity.
    #[inline(always)]
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Open a session to the server at `address`.
    pub fn open_session(&mut self, address: D::Address) -> SessionId {
        let id = self.sessions.len() as SessionId;
        self.sessions.push(SessionState {
            server_address: address,
            aborted: false,
        });
        id
    }

    /// Open a session to the server named by a driver locator string.
    pub fn open_session_by_locator(&mut self, locator: &str) -> Option<SessionId> {
        let address = self.driver.address_from_locator(locator)?;
        Some(self.open_session(address))
    }

    /// Issue an RPC on `session`. The notifier fires once, with the
    /// response or a [`TransportError`]. Returns the sequence number that
    /// identifies the RPC to [`cancel_request`](Self::cancel_request).
    ///
    /// O(1) bookkeeping; never blocks on the network.
    pub fn send_request(
        &mut self,
        session: SessionId,
        request: Vec<u8>,
        notifier: impl FnOnce(Result<Vec<u8>, TransportError>) + 'static,
    ) -> Sequence {
        let sequence = self.next_client_sequence;
        self.next_client_sequence += 1;

        let sess = &self.sessions[session as usize];
        if sess.aborted {
            notifier(Err(TransportError::Canceled));
            return sequence;
        }

        let rpc_id = RpcId::new(self.client_id, sequence);
        let total = request.len() as u32;
        let mut msg = OutgoingMessage::new(request, sess.server_address.clone(), self.round_trip_bytes);
        msg.transmit_priority = self.unsched_traffic_prio(total);

        // Small single-packet requests skip the selector entirely; the
        // bookkeeping would cost more than the packet.
        let direct = total <= self.config.small_message_threshold
            && total <= self.max_data_per_packet
            && total as u64 <= u16::MAX as u64
            && total <= msg.transmit_limit;
        if direct {
            let mut buf = BytesMut::with_capacity(ALL_DATA_HEADER_LEN + total as usize);
            AllDataHeader::new(rpc_id, FROM_CLIENT, total as u16).ser(&mut buf);
            buf.extend_from_slice(&msg.buffer);
            self.driver.send_packet(&msg.recipient, &buf, msg.transmit_priority);
            msg.transmit_offset = total;
        }

        self.outgoing_rpcs.insert(
            sequence,
            ClientRpc {
                session,
                request: msg,
                response: None,
                peer_unscheduled: 0,
                notifier: Some(Box::new(notifier)),
                rpc_id,
                silent_intervals: 0,
                transmit_pending: !direct,
                scheduled: false,
            },
        );
        if !direct {
            self.outgoing_requests.push(sequence);
            self.maintain_top_outgoing(OutKey::Request(sequence));
        }
        sequence
    }

    /// Withdraw an outstanding RPC. The notifier never fires; an ABORT is
    /// dispatched to the server on the next poll. Response packets still
    /// in flight are dropped when they arrive.
    pub fn cancel_request(&mut self, sequence: Sequence) {
        if let Some(rpc) = self.delete_client_rpc(sequence) {
            self.pending_aborts
                .push((rpc.request.recipient.clone(), rpc.rpc_id));
        }
    }

    /// Mark `session` unusable and fail all of its outstanding RPCs with
    /// [`TransportError::Canceled`].
    pub fn abort_session(&mut self, session: SessionId) {
        self.sessions[session as usize].aborted = true;

        let seqs: Vec<Sequence> = self
            .outgoing_rpcs
            .iter()
            .filter(|(_, rpc)| rpc.session == session)
            .map(|(&seq, _)| seq)
            .collect();
        for seq in seqs {
            if let Some(mut rpc) = self.delete_client_rpc(seq) {
                self.pending_aborts
                    .push((rpc.request.recipient.clone(), rpc.rpc_id));
                if let Some(notifier) = rpc.notifier.take() {
                    notifier(Err(TransportError::Canceled));
                }
            }
        }
    }

    /// Describe the outstanding RPCs on `session`, for diagnostics.
    pub fn session_rpc_info(&self, session: SessionId) -> String {
        let mut info = String::new();
        for (seq, rpc) in &self.outgoing_rpcs {
            if rpc.session != session {
                continue;
            }
            if !info.is_empty() {
                info.push_str(", ");
            }
            let _ = write!(
                info,
                "rpc {} ({}/{} request bytes sent)",
                seq,
                rpc.request.transmit_offset,
                rpc.request.total_length()
            );
        }
        if info.is_empty() {
            info.push_str("no outstanding RPCs");
        }
        info
    }

    /// Hand the next fully received request to the service layer, if any.
    pub fn take_request(&mut self) -> Option<(ReplyHandle, Vec<u8>)> {
        while let Some(rpc_id) = self.ready_requests.pop_front() {
            // The RPC may have been aborted or timed out while queued.
            if let Some(rpc) = self.incoming_rpcs.get_mut(&rpc_id) {
                rpc.in_service = true;
                let payload = rpc.request.take().expect("ready request without payload");
                log::trace!(
                    "handing rpc {} (server sequence {}) to the service layer",
                    rpc_id,
                    rpc.sequence
                );
                return Some((ReplyHandle { rpc_id }, payload));
            }
        }
        None
    }

    /// Send the response for a request obtained from
    /// [`take_request`](Self::take_request).
    ///
    /// Returns [`TransportError::Canceled`] if the client cancelled the
    /// RPC in the meantime; the response is discarded.
    pub fn send_reply(&mut self, handle: ReplyHandle, response: Vec<u8>) -> Result<(), TransportError> {
        let rpc_id = handle.rpc_id;
        let cancelled = match self.incoming_rpcs.get(&rpc_id) {
            None => return Err(TransportError::Canceled),
            Some(rpc) => rpc.cancelled,
        };
        if cancelled {
            self.delete_server_rpc(rpc_id);
            return Err(TransportError::Canceled);
        }

        let total = response.len() as u32;
        let priority = self.unsched_traffic_prio(total);
        let rtt = self.round_trip_bytes;
        let direct = total <= self.config.small_message_threshold
            && total <= self.max_data_per_packet
            && total as u64 <= u16::MAX as u64
            && total <= rtt;

        let rpc = self.incoming_rpcs.get_mut(&rpc_id).unwrap();
        rpc.in_service = false;
        rpc.sending_response = true;
        rpc.silent_intervals = 0;
        let mut msg = OutgoingMessage::new(response, rpc.client_address.clone(), rtt);
        msg.transmit_priority = priority;

        if direct {
            let mut buf = BytesMut::with_capacity(ALL_DATA_HEADER_LEN + total as usize);
            AllDataHeader::new(rpc_id, FROM_SERVER, total as u16).ser(&mut buf);
            buf.extend_from_slice(&msg.buffer);
            self.driver.send_packet(&msg.recipient, &buf, priority);
            // The whole response is with the driver; the RPC is done.
            self.delete_server_rpc(rpc_id);
            return Ok(());
        }

        rpc.response = Some(msg);
        self.outgoing_responses.push(rpc_id);
        self.maintain_top_outgoing(OutKey::Response(rpc_id));
        Ok(())
    }

    /// Run one tick: dispatch queued control packets, drain a batch of
    /// received packets, flush grants, check liveness when the timer
    /// interval has elapsed, then transmit as much data as the driver
    /// will take. Returns a rough work count (zero means fully idle).
    pub fn poll(&mut self, now: Tick) -> u32 {
        let mut result = 0;

        let aborts = std::mem::take(&mut self.pending_aborts);
        result += aborts.len() as u32;
        for (address, rpc_id) in aborts {
            Self::send_control(
                &mut self.driver,
                &address,
                Opcode::Abort,
                rpc_id,
                FROM_CLIENT,
                self.highest_avail_priority,
            );
        }

        let mut batch = std::mem::take(&mut self.received_batch);
        self.driver.receive_packets(POLL_BATCH_SIZE, &mut batch);
        result += batch.len() as u32;
        for packet in batch.drain(..) {
            self.handle_packet(packet, now);
        }
        self.received_batch = batch;

        if self.next_timeout_check == 0 {
            self.next_timeout_check = now + self.config.timer_interval;
        } else if now >= self.next_timeout_check {
            self.check_timeouts();
            self.next_timeout_check = now + self.config.timer_interval;
            result += 1;
        }

        self.flush_grants();
        result + self.try_to_transmit_data(now)
    }

    /// Priority class for the unscheduled bytes of a message of `size`
    /// bytes: the smallest size bracket gets the highest class.
    pub(crate) fn unsched_traffic_prio(&self, size: u32) -> Priority {
        for (i, &cutoff) in self.config.unsched_prio_cutoffs.iter().enumerate() {
            if size <= cutoff {
                return self.highest_avail_priority.saturating_sub(i as u8);
            }
        }
        unreachable!("unsched_prio_cutoffs is terminated by u32::MAX");
    }

    /// Flags for a control packet sent back to the sender of a message
    /// travelling in direction `from_client`.
    #[inline(always)]
    pub(crate) fn reply_flags(from_client: bool) -> u8 {
        if from_client {
            FROM_SERVER
        } else {
            FROM_CLIENT
        }
    }

    /// Emit a header-only control packet (GRANT-less opcodes).
    pub(crate) fn send_control(
        driver: &mut D,
        address: &D::Address,
        opcode: Opcode,
        rpc_id: RpcId,
        flags: u8,
        priority: Priority,
    ) {
        let mut buf = BytesMut::with_capacity(COMMON_HEADER_LEN);
        ser_control(opcode, rpc_id, flags, &mut buf);
        driver.send_packet(address, &buf, priority);
    }

    /// Hash a sender address for the scheduler's distinctness check.
    #[inline]
    pub(crate) fn sender_hash(&self, address: &D::Address) -> u64 {
        self.sender_hasher.hash_one(address)
    }

    /// Look up an outgoing message by selector key.
    pub(crate) fn outgoing_ref(&self, key: OutKey) -> Option<&OutgoingMessage<D::Address>> {
        match key {
            OutKey::Request(seq) => self.outgoing_rpcs.get(&seq).map(|rpc| &rpc.request),
            OutKey::Response(id) => self
                .incoming_rpcs
                .get(&id)
                .and_then(|rpc| rpc.response.as_ref()),
        }
    }

    /// Tear down a client RPC: tables, selector state, scheduler state,
    /// and any retained driver buffers. Does not touch the notifier.
    pub(crate) fn delete_client_rpc(&mut self, sequence: Sequence) -> Option<ClientRpc<D::Address>> {
        let mut rpc = self.outgoing_rpcs.remove(&sequence)?;
        self.outgoing_requests.retain(|&s| s != sequence);
        self.remove_top(OutKey::Request(sequence));
        if rpc.scheduled {
            self.remove_scheduled(SchedKey {
                rpc_id: rpc.rpc_id,
                from_client: false,
            });
        }
        if let Some(mut acc) = rpc.response.take() {
            acc.release_buffers(&mut self.driver);
        }
        Some(rpc)
    }

    /// Fail a client RPC and fire its notifier.
    pub(crate) fn fail_client_rpc(&mut self, sequence: Sequence, error: TransportError) {
        if let Some(mut rpc) = self.delete_client_rpc(sequence) {
            log::warn!("rpc {} failed: {}", rpc.rpc_id, error);
            if let Some(notifier) = rpc.notifier.take() {
                notifier(Err(error));
            }
        }
    }

    /// Tear down a server RPC: tables, selector state, scheduler state,
    /// and any retained driver buffers.
    pub(crate) fn delete_server_rpc(&mut self, rpc_id: RpcId) {
        let Some(mut rpc) = self.incoming_rpcs.remove(&rpc_id) else {
            return;
        };
        self.outgoing_responses.retain(|&id| id != rpc_id);
        self.remove_top(OutKey::Response(rpc_id));
        if rpc.scheduled {
            self.remove_scheduled(SchedKey {
                rpc_id,
                from_client: true,
            });
        }
        if let Some(mut acc) = rpc.accumulator.take() {
            acc.release_buffers(&mut self.driver);
        }
        // A stale entry may linger in ready_requests; take_request skips it.
    }
}

/// Resolve a selector key to its outgoing message, borrowing only the two
/// RPC tables so the caller keeps the driver free for sending.
fn outgoing_entry<'a, A>(
    outgoing_rpcs: &'a mut HashMap<Sequence, ClientRpc<A>, ahash::RandomState>,
    incoming_rpcs: &'a mut HashMap<RpcId, ServerRpc<A>, ahash::RandomState>,
    key: OutKey,
) -> Option<&'a mut OutgoingMessage<A>> {
    match key {
        OutKey::Request(seq) => outgoing_rpcs.get_mut(&seq).map(|rpc| &mut rpc.request),
        OutKey::Response(id) => incoming_rpcs.get_mut(&id).and_then(|rpc| rpc.response.as_mut()),
    }
}

impl<D: Driver> Drop for Transport<D> {
    fn drop(&mut self) {
        // Shutdown path of the stolen-buffer discipline: every accumulator
        // hands its retained buffers back to the driver.
        let outstanding = self.outgoing_rpcs.len() + self.incoming_rpcs.len();
        if outstanding > 0 {
            log::warn!("transport shutting down with {} outstanding RPCs", outstanding);
        }
        for (_, rpc) in self.outgoing_rpcs.iter_mut() {
            if let Some(acc) = rpc.response.as_mut() {
                acc.release_buffers(&mut self.driver);
            }
        }
        for (_, rpc) in self.incoming_rpcs.iter_mut() {
            if let Some(acc) = rpc.accumulator.as_mut() {
                acc.release_buffers(&mut self.driver);
            }
        }
    }
}
