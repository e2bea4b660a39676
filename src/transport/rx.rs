//! Per-opcode dispatch of received packets.

use bytes::BytesMut;

use super::{outgoing_entry, ServerRpc, Transport};
use crate::accumulator::MessageAccumulator;
use crate::driver::{Driver, Received};
use crate::error::TransportError;
use crate::outgoing::OutKey;
use crate::pkthdr::*;
use crate::sched::SchedKey;
use crate::type_alias::*;

impl<D: Driver> Transport<D> {
    /// Dispatch one received packet by opcode and direction.
    pub(super) fn handle_packet(&mut self, packet: Received<D::Address>, now: Tick) {
        let header = match PacketHeader::parse(packet.as_slice()) {
            Ok(header) => header,
            Err(err) => {
                log::warn!(
                    "dropping malformed packet from {:?}: {}",
                    packet.sender,
                    err
                );
                self.driver.release(packet.steal());
                return;
            }
        };
        log::trace!(
            "received {} for rpc {} from {:?}",
            opcode_symbol(header.common().opcode as u8),
            header.common().rpc_id,
            packet.sender
        );

        if header.common().from_client() {
            self.handle_request_side(header, packet, now);
        } else {
            self.handle_response_side(header, packet, now);
        }
    }

    /// Packets travelling server-to-client: we are the client.
    fn handle_response_side(
        &mut self,
        header: PacketHeader,
        packet: Received<D::Address>,
        now: Tick,
    ) {
        let common = *header.common();
        let sequence = common.rpc_id.sequence;

        if common.rpc_id.client_id != self.client_id() {
            log::warn!(
                "dropping {} for client {} (not ours)",
                opcode_symbol(common.opcode as u8),
                common.rpc_id.client_id
            );
            self.driver.release(packet.steal());
            return;
        }

        let Some(rpc) = self.outgoing_rpcs.get_mut(&sequence) else {
            // Completed or cancelled; stragglers are expected.
            log::trace!(
                "dropping {} for unknown rpc {}",
                opcode_symbol(common.opcode as u8),
                common.rpc_id
            );
            self.driver.release(packet.steal());
            return;
        };
        rpc.silent_intervals = 0;

        match header {
            PacketHeader::AllData(_) => {
                let payload = packet.as_slice()[ALL_DATA_HEADER_LEN..].to_vec();
                self.driver.release(packet.steal());
                self.complete_client_rpc(sequence, payload);
            }
            PacketHeader::Data(h) => self.client_data(sequence, h, packet),
            PacketHeader::Grant(h) => {
                self.driver.release(packet.steal());
                if h.common.flags & RESTART != 0 {
                    self.client_restart(sequence);
                } else {
                    self.client_grant(sequence, h);
                }
            }
            PacketHeader::Resend(h) => {
                self.driver.release(packet.steal());
                if h.common.flags & RESTART != 0 {
                    self.client_restart(sequence);
                } else {
                    self.resend_outgoing(OutKey::Request(sequence), h, now);
                }
            }
            PacketHeader::Busy(_) => {
                // The counter reset above is the entire effect.
                self.driver.release(packet.steal());
            }
            PacketHeader::Abort(_) => {
                log::warn!("dropping ABORT from server for rpc {}", common.rpc_id);
                self.driver.release(packet.steal());
            }
            PacketHeader::LogTimeTrace(_) => {
                log::info!("time trace requested by server for rpc {}", common.rpc_id);
                self.driver.release(packet.steal());
            }
        }
    }

    /// A DATA packet carrying response bytes.
    fn client_data(&mut self, sequence: Sequence, h: DataHeader, packet: Received<D::Address>) {
        let zero_copy_threshold = self.config.message_zero_copy_threshold;
        let rpc_id = h.common.rpc_id;
        let key = SchedKey {
            rpc_id,
            from_client: false,
        };

        {
            let rpc = self.outgoing_rpcs.get_mut(&sequence).unwrap();
            if rpc.response.is_none() {
                rpc.response = Some(MessageAccumulator::new(h.total_length, zero_copy_threshold));
                rpc.peer_unscheduled = h.unscheduled_bytes;
            }
        }

        // A response longer than the server's unscheduled budget needs
        // grants from us; register it with the scheduler once.
        let needs_sched = {
            let rpc = &self.outgoing_rpcs[&sequence];
            !rpc.scheduled && h.total_length > h.unscheduled_bytes
        };
        if needs_sched {
            let address = self.outgoing_rpcs[&sequence].request.recipient.clone();
            self.outgoing_rpcs.get_mut(&sequence).unwrap().scheduled = true;
            self.insert_scheduled(key, address, h.unscheduled_bytes, h.total_length);
        }

        let (complete, received) = {
            let rpc = self.outgoing_rpcs.get_mut(&sequence).unwrap();
            let acc = rpc.response.as_mut().unwrap();
            let complete = acc.add_packet(&h, packet, &mut self.driver);
            (complete, acc.contiguous_length())
        };

        if complete {
            let payload = {
                let rpc = self.outgoing_rpcs.get_mut(&sequence).unwrap();
                rpc.response.as_mut().unwrap().take_message()
            };
            self.complete_client_rpc(sequence, payload);
        } else {
            self.data_packet_arrive(key, received);
        }
    }

    /// Apply a GRANT to our outgoing request.
    fn client_grant(&mut self, sequence: Sequence, h: GrantHeader) {
        let transmittable = {
            let rpc = self.outgoing_rpcs.get_mut(&sequence).unwrap();
            if !rpc.transmit_pending {
                // The request is fully transmitted; a late grant is harmless.
                return;
            }
            rpc.request.record_grant(h.offset, h.priority);
            rpc.request.transmittable()
        };
        if transmittable {
            self.maintain_top_outgoing(OutKey::Request(sequence));
        }
    }

    /// RESTART received (on GRANT or RESEND): the server lost its state
    /// for this RPC.
    fn client_restart(&mut self, sequence: Sequence) {
        let (has_response, rpc_id, total) = {
            let rpc = &self.outgoing_rpcs[&sequence];
            (
                rpc.response.is_some(),
                rpc.rpc_id,
                rpc.request.total_length(),
            )
        };
        if has_response {
            // The server already executed the request and then lost state;
            // silently re-executing would break at-most-once. Hand the
            // decision to the caller.
            self.fail_client_rpc(sequence, TransportError::TransportReset);
            return;
        }

        log::info!("server lost state for rpc {}; restarting", rpc_id);
        let priority = self.unsched_traffic_prio(total);
        let rpc = self.outgoing_rpcs.get_mut(&sequence).unwrap();
        rpc.request.restart();
        rpc.request.transmit_priority = priority;
        if !rpc.transmit_pending {
            rpc.transmit_pending = true;
            self.outgoing_requests.push(sequence);
        }
        self.maintain_top_outgoing(OutKey::Request(sequence));
    }

    /// Packets travelling client-to-server: we are the server.
    fn handle_request_side(
        &mut self,
        header: PacketHeader,
        packet: Received<D::Address>,
        now: Tick,
    ) {
        let common = *header.common();
        let rpc_id = common.rpc_id;

        if let Some(rpc) = self.incoming_rpcs.get_mut(&rpc_id) {
            rpc.silent_intervals = 0;
        }

        match header {
            PacketHeader::AllData(_) => {
                if self.incoming_rpcs.contains_key(&rpc_id) {
                    // Duplicate arrival; the table absorbs it.
                    self.driver.release(packet.steal());
                    return;
                }
                let payload = packet.as_slice()[ALL_DATA_HEADER_LEN..].to_vec();
                let client_address = packet.sender.clone();
                self.driver.release(packet.steal());
                let rpc = self.new_server_rpc(rpc_id, client_address);
                rpc.request_complete = true;
                rpc.request = Some(payload);
                self.ready_requests.push_back(rpc_id);
            }
            PacketHeader::Data(h) => self.server_data(h, packet),
            PacketHeader::Grant(h) => {
                self.driver.release(packet.steal());
                self.server_grant(h);
            }
            PacketHeader::Resend(h) => {
                let sender = packet.sender.clone();
                self.driver.release(packet.steal());
                self.server_resend(h, sender, now);
            }
            PacketHeader::Busy(_) => {
                let sender = packet.sender.clone();
                self.driver.release(packet.steal());
                if !self.incoming_rpcs.contains_key(&rpc_id) {
                    // The client is waiting on an RPC we know nothing
                    // about; tell it to start over.
                    self.send_restart(&sender, rpc_id);
                }
            }
            PacketHeader::Abort(_) => {
                self.driver.release(packet.steal());
                self.server_abort(rpc_id);
            }
            PacketHeader::LogTimeTrace(_) => {
                log::info!("time trace requested by client for rpc {}", rpc_id);
                self.driver.release(packet.steal());
            }
        }
    }

    /// A DATA packet carrying request bytes.
    fn server_data(&mut self, h: DataHeader, packet: Received<D::Address>) {
        let rpc_id = h.common.rpc_id;
        let zero_copy_threshold = self.config.message_zero_copy_threshold;
        let key = SchedKey {
            rpc_id,
            from_client: true,
        };

        if !self.incoming_rpcs.contains_key(&rpc_id) {
            if h.offset >= h.unscheduled_bytes {
                // Scheduled-range bytes can only follow our grants, and we
                // have granted nothing: we lost this RPC's state. Make the
                // client start over rather than assembling a torso.
                let sender = packet.sender.clone();
                self.driver.release(packet.steal());
                self.send_restart(&sender, rpc_id);
                return;
            }
            let client_address = packet.sender.clone();
            {
                let rpc = self.new_server_rpc(rpc_id, client_address);
                rpc.accumulator =
                    Some(MessageAccumulator::new(h.total_length, zero_copy_threshold));
                rpc.peer_unscheduled = h.unscheduled_bytes;
            }
            if h.total_length > h.unscheduled_bytes {
                let address = packet.sender.clone();
                self.incoming_rpcs.get_mut(&rpc_id).unwrap().scheduled = true;
                self.insert_scheduled(key, address, h.unscheduled_bytes, h.total_length);
            }
        }

        {
            let rpc = self.incoming_rpcs.get_mut(&rpc_id).unwrap();
            if rpc.request_complete {
                // Straggling retransmission of a request we already have.
                self.driver.release(packet.steal());
                return;
            }
        }

        let (complete, received) = {
            let rpc = self.incoming_rpcs.get_mut(&rpc_id).unwrap();
            let acc = rpc.accumulator.as_mut().unwrap();
            let complete = acc.add_packet(&h, packet, &mut self.driver);
            (complete, acc.contiguous_length())
        };

        if complete {
            let was_scheduled = {
                let rpc = self.incoming_rpcs.get_mut(&rpc_id).unwrap();
                rpc.request_complete = true;
                let mut acc = rpc.accumulator.take().unwrap();
                rpc.request = Some(acc.take_message());
                acc.release_buffers(&mut self.driver);
                std::mem::replace(&mut rpc.scheduled, false)
            };
            if was_scheduled {
                self.remove_scheduled(key);
            }
            self.ready_requests.push_back(rpc_id);
        } else {
            self.data_packet_arrive(key, received);
        }
    }

    /// Apply a GRANT from the client to our outgoing response.
    fn server_grant(&mut self, h: GrantHeader) {
        let rpc_id = h.common.rpc_id;
        let transmittable = {
            let Some(rpc) = self.incoming_rpcs.get_mut(&rpc_id) else {
                log::trace!("dropping GRANT for unknown rpc {}", rpc_id);
                return;
            };
            let Some(response) = rpc.response.as_mut() else {
                log::warn!(
                    "dropping GRANT for rpc {} with no response in flight",
                    rpc_id
                );
                return;
            };
            response.record_grant(h.offset, h.priority);
            response.transmittable()
        };
        if transmittable {
            self.maintain_top_outgoing(OutKey::Response(rpc_id));
        }
    }

    /// A RESEND from the client, asking for response bytes again.
    fn server_resend(&mut self, h: ResendHeader, sender: D::Address, now: Tick) {
        let rpc_id = h.common.rpc_id;
        match self.incoming_rpcs.get(&rpc_id) {
            None => {
                // The response was fully transmitted and its state freed,
                // or we never heard of the RPC. Either way the client must
                // start over.
                self.send_restart(&sender, rpc_id);
            }
            Some(rpc) if rpc.sending_response => {
                self.resend_outgoing(OutKey::Response(rpc_id), h, now);
            }
            Some(rpc) => {
                // Request still arriving or still executing: stay patient.
                let address = rpc.client_address.clone();
                Self::send_control(
                    &mut self.driver,
                    &address,
                    Opcode::Busy,
                    rpc_id,
                    FROM_SERVER,
                    self.highest_avail_priority,
                );
            }
        }
    }

    /// The client cancelled this RPC.
    fn server_abort(&mut self, rpc_id: RpcId) {
        let in_service = match self.incoming_rpcs.get_mut(&rpc_id) {
            None => return,
            Some(rpc) => rpc.in_service,
        };
        if in_service {
            // The service layer holds the request; tear down at reply time.
            self.incoming_rpcs.get_mut(&rpc_id).unwrap().cancelled = true;
        } else {
            self.delete_server_rpc(rpc_id);
        }
    }

    /// Retransmit the already-sent part of the requested range, clamped to
    /// what has been granted; send BUSY instead if we are stalled with
    /// nothing to resend.
    fn resend_outgoing(&mut self, key: OutKey, h: ResendHeader, now: Tick) {
        let (rpc_id, base_flags) = self.out_identity(key);
        let max_data_per_packet = self.max_data_per_packet;
        let highest_priority = self.highest_avail_priority;

        let Some(msg) = outgoing_entry(&mut self.outgoing_rpcs, &mut self.incoming_rpcs, key)
        else {
            return;
        };

        // Never send bytes past the granted limit, whatever was asked.
        let end = h
            .offset
            .saturating_add(h.length)
            .min(msg.total_length())
            .min(msg.transmit_limit);

        if h.offset >= msg.transmit_offset {
            // We haven't got that far yet. If we are stalled waiting for
            // grants, let the peer know we are alive.
            if !msg.transmittable() && !msg.fully_transmitted() {
                let address = msg.recipient.clone();
                Self::send_control(
                    &mut self.driver,
                    &address,
                    Opcode::Busy,
                    rpc_id,
                    base_flags,
                    highest_priority,
                );
            }
            return;
        }

        let resend_end = end.min(msg.transmit_offset);
        if resend_end <= h.offset {
            return;
        }

        let mut offset = h.offset;
        while offset < resend_end {
            let len = (resend_end - offset).min(max_data_per_packet);
            let mut buf = BytesMut::with_capacity(DATA_HEADER_LEN + len as usize);
            DataHeader::new(
                rpc_id,
                msg.total_length(),
                offset,
                msg.unscheduled_bytes,
                base_flags | RETRANSMISSION,
            )
            .ser(&mut buf);
            buf.extend_from_slice(&msg.buffer[offset as usize..(offset + len) as usize]);
            self.driver.send_packet(&msg.recipient, &buf, h.priority);
            offset += len;
        }
        msg.last_transmit_time = now;
    }

    /// Tell a client to clear its sender state and start this RPC over.
    fn send_restart(&mut self, address: &D::Address, rpc_id: RpcId) {
        log::info!("requesting restart of unknown rpc {}", rpc_id);
        let mut buf = BytesMut::with_capacity(RESEND_HEADER_LEN);
        ResendHeader::new(rpc_id, 0, self.round_trip_bytes, 0, FROM_SERVER | RESTART)
            .ser(&mut buf);
        self.driver
            .send_packet(address, &buf, self.highest_avail_priority);
    }

    /// Finish a client RPC successfully.
    fn complete_client_rpc(&mut self, sequence: Sequence, payload: Vec<u8>) {
        if let Some(mut rpc) = self.delete_client_rpc(sequence) {
            if let Some(notifier) = rpc.notifier.take() {
                notifier(Ok(payload));
            }
        }
    }

    /// Allocate server-side state for a freshly arrived RPC.
    fn new_server_rpc(
        &mut self,
        rpc_id: RpcId,
        client_address: D::Address,
    ) -> &mut ServerRpc<D::Address> {
        let sequence = self.next_server_sequence;
        self.next_server_sequence += 1;
        self.incoming_rpcs.entry(rpc_id).or_insert(ServerRpc {
            sequence,
            rpc_id,
            client_address,
            cancelled: false,
            request_complete: false,
            in_service: false,
            sending_response: false,
            silent_intervals: 0,
            accumulator: None,
            peer_unscheduled: 0,
            request: None,
            response: None,
            scheduled: false,
        })
    }
}
