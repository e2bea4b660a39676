//! The send selector: SRPT over all outgoing messages, with a small
//! fewest-bytes-left cache so the common case never scans everything.

use bytes::BytesMut;

use super::{outgoing_entry, Transport, TOP_OUTGOING_LIMIT};
use crate::driver::Driver;
use crate::outgoing::OutKey;
use crate::pkthdr::*;
use crate::type_alias::*;

impl<D: Driver> Transport<D> {
    /// RpcId and direction flag for an outgoing message.
    pub(super) fn out_identity(&self, key: OutKey) -> (RpcId, u8) {
        match key {
            OutKey::Request(seq) => (RpcId::new(self.client_id(), seq), FROM_CLIENT),
            OutKey::Response(id) => (id, FROM_SERVER),
        }
    }

    /// Offer a message to the top-outgoing list. Called whenever a message
    /// appears or gains transmittable bytes.
    pub(super) fn maintain_top_outgoing(&mut self, key: OutKey) {
        let Some(msg) = self.outgoing_ref(key) else {
            return;
        };
        if msg.top_choice || !msg.transmittable() {
            return;
        }
        let remaining = msg.bytes_remaining();

        if msg.total_length() <= self.config.small_message_threshold {
            // Not worth the bookkeeping; the slow path will find it.
            self.transmit_data_slow_path = true;
            return;
        }

        if self.top_outgoing.len() < TOP_OUTGOING_LIMIT {
            self.set_top_choice(key, true);
            self.top_outgoing.push(key);
            return;
        }

        // Full: the candidate must beat the worst current member.
        let mut worst: Option<(usize, u32)> = None;
        for (i, &k) in self.top_outgoing.iter().enumerate() {
            let r = self
                .outgoing_ref(k)
                .map_or(u32::MAX, |m| m.bytes_remaining());
            if worst.map_or(true, |(_, wr)| r > wr) {
                worst = Some((i, r));
            }
        }
        let (worst_idx, worst_remaining) = worst.unwrap();
        if remaining < worst_remaining {
            let worst_key = self.top_outgoing[worst_idx];
            self.set_top_choice(worst_key, false);
            // The evicted message may still have transmittable bytes.
            self.transmit_data_slow_path = true;
            self.top_outgoing[worst_idx] = key;
            self.set_top_choice(key, true);
        } else {
            self.transmit_data_slow_path = true;
        }
    }

    /// Drop a message from the top list (it completed or was deleted).
    pub(super) fn remove_top(&mut self, key: OutKey) {
        if let Some(pos) = self.top_outgoing.iter().position(|&k| k == key) {
            self.top_outgoing.swap_remove(pos);
            self.set_top_choice(key, false);
        }
    }

    fn set_top_choice(&mut self, key: OutKey, value: bool) {
        if let Some(msg) = outgoing_entry(&mut self.outgoing_rpcs, &mut self.incoming_rpcs, key) {
            msg.top_choice = value;
        }
    }

    /// Transmit data packets while the driver has queue space, always from
    /// the transmittable message with the fewest bytes remaining. Returns
    /// the number of payload bytes handed to the driver.
    pub(super) fn try_to_transmit_data(&mut self, now: Tick) -> u32 {
        let mut total_sent = 0;
        loop {
            if self.driver.transmit_queue_space() == 0 {
                break;
            }

            let key = match self.best_top_candidate() {
                Some(key) => key,
                None => {
                    if !self.transmit_data_slow_path {
                        break;
                    }
                    // Some message outside the top list may be
                    // transmittable: rebuild the list from everything.
                    self.rebuild_top_outgoing();
                    match self.best_top_candidate() {
                        Some(key) => key,
                        None => {
                            self.transmit_data_slow_path = false;
                            break;
                        }
                    }
                }
            };
            total_sent += self.transmit_one_packet(key, now);
        }
        total_sent
    }

    /// The transmittable top-list member with the fewest bytes remaining;
    /// ties go to the one that has waited longest.
    fn best_top_candidate(&self) -> Option<OutKey> {
        let mut best: Option<(u32, Tick, OutKey)> = None;
        for &key in &self.top_outgoing {
            let Some(msg) = self.outgoing_ref(key) else {
                continue;
            };
            if !msg.transmittable() {
                continue;
            }
            let cand = (msg.bytes_remaining(), msg.last_transmit_time, key);
            match best {
                Some((r, t, _)) if (cand.0, cand.1) >= (r, t) => {}
                _ => best = Some(cand),
            }
        }
        best.map(|(_, _, key)| key)
    }

    /// Rebuild the top list by scanning every outgoing message.
    fn rebuild_top_outgoing(&mut self) {
        for i in 0..self.top_outgoing.len() {
            let key = self.top_outgoing[i];
            self.set_top_choice(key, false);
        }
        self.top_outgoing.clear();

        let mut candidates: Vec<(u32, OutKey)> = Vec::new();
        for &seq in &self.outgoing_requests {
            if let Some(rpc) = self.outgoing_rpcs.get(&seq) {
                if rpc.request.transmittable() {
                    candidates.push((rpc.request.bytes_remaining(), OutKey::Request(seq)));
                }
            }
        }
        for &id in &self.outgoing_responses {
            if let Some(msg) = self.incoming_rpcs.get(&id).and_then(|rpc| rpc.response.as_ref()) {
                if msg.transmittable() {
                    candidates.push((msg.bytes_remaining(), OutKey::Response(id)));
                }
            }
        }
        candidates.sort_by_key(|&(remaining, _)| remaining);
        candidates.truncate(TOP_OUTGOING_LIMIT);
        for (_, key) in candidates {
            self.set_top_choice(key, true);
            self.top_outgoing.push(key);
        }
    }

    /// Emit one packet from `key` and handle message completion. Returns
    /// the payload bytes sent.
    fn transmit_one_packet(&mut self, key: OutKey, now: Tick) -> u32 {
        let (rpc_id, base_flags) = self.out_identity(key);
        let max_data_per_packet = self.max_data_per_packet;

        // Bytes inside the unscheduled range keep their size-bracket
        // priority even if a grant has already arrived; only bytes beyond
        // it use the granted priority.
        let unsched_priority = {
            let msg = self
                .outgoing_ref(key)
                .expect("selector picked a deleted message");
            (msg.transmit_offset < msg.unscheduled_bytes)
                .then(|| self.unsched_traffic_prio(msg.total_length()))
        };

        let msg = outgoing_entry(&mut self.outgoing_rpcs, &mut self.incoming_rpcs, key)
            .expect("selector picked a deleted message");
        debug_assert!(msg.transmittable());
        let priority = unsched_priority.unwrap_or(msg.transmit_priority);

        let total = msg.total_length();
        let offset = msg.transmit_offset;
        let len;
        let mut buf;
        if offset == 0
            && total <= max_data_per_packet
            && total <= u16::MAX as u32
            && msg.transmit_limit == total
        {
            // The whole message fits in one packet and none of it has been
            // sent: the compact header suffices.
            len = total;
            buf = BytesMut::with_capacity(ALL_DATA_HEADER_LEN + len as usize);
            AllDataHeader::new(rpc_id, base_flags, total as u16).ser(&mut buf);
            buf.extend_from_slice(&msg.buffer);
        } else {
            len = (msg.transmit_limit - offset).min(max_data_per_packet);
            buf = BytesMut::with_capacity(DATA_HEADER_LEN + len as usize);
            DataHeader::new(rpc_id, total, offset, msg.unscheduled_bytes, base_flags)
                .ser(&mut buf);
            buf.extend_from_slice(&msg.buffer[offset as usize..(offset + len) as usize]);
        }
        self.driver.send_packet(&msg.recipient, &buf, priority);
        msg.transmit_offset = offset + len;
        msg.last_transmit_time = now;
        let done = msg.fully_transmitted();

        if done {
            match key {
                OutKey::Request(seq) => {
                    // The request is fully on the wire; only the response
                    // keeps this RPC alive now.
                    self.outgoing_rpcs.get_mut(&seq).unwrap().transmit_pending = false;
                    self.outgoing_requests.retain(|&s| s != seq);
                    self.remove_top(key);
                }
                OutKey::Response(id) => {
                    // The last response byte is with the driver; the RPC
                    // is complete from our standpoint.
                    self.delete_server_rpc(id);
                }
            }
        }
        len
    }
}
