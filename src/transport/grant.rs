//! The receiver scheduler: which senders we actively grant, and at what
//! priority.

use bytes::BytesMut;

use super::Transport;
use crate::driver::Driver;
use crate::pkthdr::*;
use crate::sched::{SchedKey, SchedState, ScheduledMessage};

impl<D: Driver> Transport<D> {
    /// Register a freshly observed scheduled message and place it on the
    /// active or inactive list.
    pub(super) fn insert_scheduled(
        &mut self,
        key: SchedKey,
        address: D::Address,
        unscheduled_bytes: u32,
        total_length: u32,
    ) {
        let hash = self.sender_hash(&address);
        let message = ScheduledMessage::new(
            key.rpc_id,
            address,
            hash,
            unscheduled_bytes,
            total_length,
            key.from_client,
        );
        let prev = self.scheduled.insert(key, message);
        assert!(prev.is_none(), "scheduled message registered twice");
        self.try_to_schedule(key);
    }

    /// Place a new or re-offered message: inactive if its sender already
    /// has an active message, active if there is room or it beats the
    /// worst active message.
    pub(super) fn try_to_schedule(&mut self, key: SchedKey) {
        let hash = self.scheduled[&key].sender_hash;
        let same_sender = self
            .active_messages
            .iter()
            .any(|k| self.scheduled[k].sender_hash == hash);
        if same_sender {
            self.park_inactive(key);
            return;
        }

        if self.active_messages.len() < self.config.max_granted_messages as usize {
            self.insert_active(key);
            return;
        }

        let worst_key = *self.active_messages.last().unwrap();
        if self.scheduled[&key].precedes(&self.scheduled[&worst_key]) {
            self.active_messages.pop();
            self.park_inactive(worst_key);
            self.insert_active(key);
        } else {
            self.park_inactive(key);
        }
    }

    fn park_inactive(&mut self, key: SchedKey) {
        self.scheduled.get_mut(&key).unwrap().state = SchedState::Inactive;
        self.inactive_messages.push(key);
    }

    /// Insert into the active list at its sorted position.
    fn insert_active(&mut self, key: SchedKey) {
        let pos = self
            .active_messages
            .iter()
            .position(|k| self.scheduled[&key].precedes(&self.scheduled[k]))
            .unwrap_or(self.active_messages.len());
        self.active_messages.insert(pos, key);
        self.scheduled.get_mut(&key).unwrap().state = SchedState::Active;

        debug_assert!(
            self.active_messages.len() <= self.config.max_granted_messages as usize,
            "active list overflow"
        );
        debug_assert!(
            {
                let mut hashes: Vec<u64> = self
                    .active_messages
                    .iter()
                    .map(|k| self.scheduled[k].sender_hash)
                    .collect();
                hashes.sort_unstable();
                hashes.windows(2).all(|w| w[0] != w[1])
            },
            "two active messages share a sender"
        );
    }

    /// Re-sort one active message after its bytes-remaining changed.
    pub(super) fn adjust_scheduling_precedence(&mut self, key: SchedKey) {
        self.active_messages.retain(|&k| k != key);
        self.insert_active(key);
    }

    /// An active slot opened up: promote the best inactive message whose
    /// sender is not already active.
    pub(super) fn promote_inactive(&mut self) {
        let mut best: Option<SchedKey> = None;
        for &k in &self.inactive_messages {
            let m = &self.scheduled[&k];
            let sender_active = self
                .active_messages
                .iter()
                .any(|a| self.scheduled[a].sender_hash == m.sender_hash);
            if sender_active {
                continue;
            }
            match best {
                Some(b) if !m.precedes(&self.scheduled[&b]) => {}
                _ => best = Some(k),
            }
        }
        let Some(key) = best else {
            return;
        };
        self.inactive_messages.retain(|&k| k != key);
        self.insert_active(key);
        if !self.messages_to_grant.contains(&key) {
            self.messages_to_grant.push(key);
        }
    }

    /// Remove a scheduled message entirely (its RPC is finishing).
    pub(super) fn remove_scheduled(&mut self, key: SchedKey) {
        let Some(message) = self.scheduled.remove(&key) else {
            return;
        };
        match message.state {
            SchedState::Active => {
                self.active_messages.retain(|&k| k != key);
                self.promote_inactive();
            }
            SchedState::Inactive => self.inactive_messages.retain(|&k| k != key),
            SchedState::New | SchedState::FullyGranted => {}
        }
        self.messages_to_grant.retain(|&k| k != key);
    }

    /// Bookkeeping for a data packet of a scheduled message:
    /// `bytes_received` is the accumulator's new contiguous length.
    pub(super) fn data_packet_arrive(&mut self, key: SchedKey, bytes_received: u32) {
        let Some(message) = self.scheduled.get_mut(&key) else {
            return;
        };
        if bytes_received > message.bytes_received {
            message.bytes_received = bytes_received;
        }

        match message.state {
            SchedState::Active => {
                let wants_grant = message.grant_offset < message.total_length
                    && message.grant_offset.saturating_sub(message.bytes_received)
                        < self.round_trip_bytes;
                self.adjust_scheduling_precedence(key);
                if wants_grant && !self.messages_to_grant.contains(&key) {
                    self.messages_to_grant.push(key);
                }
            }
            SchedState::Inactive => {
                // Fewer bytes remaining may let it displace an active
                // message now; offer it again.
                self.inactive_messages.retain(|&k| k != key);
                self.try_to_schedule(key);
                let message = &self.scheduled[&key];
                if message.state == SchedState::Active
                    && message.grant_offset < message.total_length
                    && !self.messages_to_grant.contains(&key)
                {
                    self.messages_to_grant.push(key);
                }
            }
            SchedState::New | SchedState::FullyGranted => {}
        }
    }

    /// Emit the grants batched during packet processing. Each grant keeps
    /// one round-trip of granted-but-unreceived bytes outstanding and
    /// advances in `grant_increment` steps; the i-th best active message
    /// is granted at the i-th highest scheduled priority.
    pub(super) fn flush_grants(&mut self) {
        if self.messages_to_grant.is_empty() {
            return;
        }
        let keys = std::mem::take(&mut self.messages_to_grant);
        for key in keys {
            let Some(message) = self.scheduled.get(&key) else {
                continue;
            };
            if message.state != SchedState::Active {
                continue;
            }
            let rank = self
                .active_messages
                .iter()
                .position(|&k| k == key)
                .expect("active message missing from active list");
            let priority = self.highest_sched_priority.saturating_sub(rank as u8);

            let desired = message
                .bytes_received
                .saturating_add(self.round_trip_bytes)
                .min(message.total_length);
            if desired <= message.grant_offset {
                continue;
            }
            if desired < message.total_length
                && desired - message.grant_offset < self.grant_increment
            {
                // Not worth a control packet yet.
                continue;
            }

            let address = message.sender_address.clone();
            let rpc_id = message.rpc_id;
            let flags = Self::reply_flags(message.from_client);
            let fully_granted = desired == message.total_length;

            let mut buf = BytesMut::with_capacity(GRANT_HEADER_LEN);
            GrantHeader::new(rpc_id, desired, priority, flags).ser(&mut buf);
            self.driver
                .send_packet(&address, &buf, self.highest_avail_priority);
            log::trace!("granted rpc {} up to {} at priority {}", rpc_id, desired, priority);

            let message = self.scheduled.get_mut(&key).unwrap();
            message.grant_offset = desired;
            message.grant_priority = priority;
            if fully_granted {
                message.state = SchedState::FullyGranted;
                self.active_messages.retain(|&k| k != key);
                self.promote_inactive();
            }
        }
    }
}
