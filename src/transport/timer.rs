//! Liveness: silent-interval bookkeeping, probes, retransmission
//! requests, and timeouts.

use super::Transport;
use crate::driver::Driver;
use crate::error::TransportError;
use crate::pkthdr::*;
use crate::sched::SchedKey;
use crate::type_alias::*;

impl<D: Driver> Transport<D> {
    /// One liveness pass over every RPC we are tracking. Runs every
    /// `timer_interval` ticks.
    pub(super) fn check_timeouts(&mut self) {
        self.check_client_timeouts();
        self.check_server_timeouts();
    }

    fn check_client_timeouts(&mut self) {
        let sequences: Vec<Sequence> = self.outgoing_rpcs.keys().copied().collect();
        for sequence in sequences {
            let Some(rpc) = self.outgoing_rpcs.get_mut(&sequence) else {
                continue;
            };
            rpc.silent_intervals += 1;
            let silent = rpc.silent_intervals;

            if silent >= self.config.timeout_intervals {
                self.fail_client_rpc(sequence, TransportError::Timeout);
                continue;
            }
            if silent < self.config.ping_intervals {
                continue;
            }

            let rpc = &self.outgoing_rpcs[&sequence];
            let partial_response = rpc.response.as_ref().is_some_and(|acc| !acc.is_complete());
            if partial_response {
                self.resend_missing_response(sequence);
            } else if !rpc.transmit_pending && rpc.response.is_none() {
                // Request fully transmitted, nothing heard back: ping so
                // the server knows we still care.
                let address = rpc.request.recipient.clone();
                let rpc_id = rpc.rpc_id;
                Self::send_control(
                    &mut self.driver,
                    &address,
                    Opcode::Busy,
                    rpc_id,
                    FROM_CLIENT,
                    self.highest_avail_priority,
                );
            }
        }
    }

    fn check_server_timeouts(&mut self) {
        let ids: Vec<RpcId> = self.incoming_rpcs.keys().copied().collect();
        for rpc_id in ids {
            let Some(rpc) = self.incoming_rpcs.get_mut(&rpc_id) else {
                continue;
            };
            rpc.silent_intervals += 1;
            let silent = rpc.silent_intervals;

            if rpc.request_complete && !rpc.sending_response {
                // The request is executing (or queued for execution). The
                // client is rightly silent, so never time this out; keep
                // the client's timer quiet instead.
                if silent >= self.config.ping_intervals {
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
                continue;
            }

            if silent >= self.config.timeout_intervals {
                log::warn!("peer unreachable; abandoning rpc {}", rpc_id);
                self.delete_server_rpc(rpc_id);
                continue;
            }
            if silent >= self.config.ping_intervals && !rpc.request_complete {
                self.resend_missing_request(rpc_id);
            }
            // A response in flight relies on the client's RESENDs; the
            // timeout above bounds how long we keep its state.
        }
    }

    /// Ask the server to retransmit the earliest missing response range.
    fn resend_missing_response(&mut self, sequence: Sequence) {
        let rpc = &self.outgoing_rpcs[&sequence];
        let rpc_id = rpc.rpc_id;
        let address = rpc.request.recipient.clone();
        let acc = rpc.response.as_ref().unwrap();
        let prefix = acc.contiguous_length();
        let total = acc.total_length();

        let key = SchedKey {
            rpc_id,
            from_client: false,
        };
        let (up_to, priority) = match self.scheduled.get(&key) {
            Some(m) => (m.grant_offset, m.grant_priority),
            None => (total.min(rpc.peer_unscheduled), self.unsched_traffic_prio(total)),
        };
        if up_to > prefix {
            acc.request_retransmission(&mut self.driver, &address, rpc_id, up_to, priority, FROM_CLIENT);
        }
    }

    /// Ask the client to retransmit the earliest missing request range.
    fn resend_missing_request(&mut self, rpc_id: RpcId) {
        let rpc = &self.incoming_rpcs[&rpc_id];
        let Some(acc) = rpc.accumulator.as_ref() else {
            return;
        };
        let prefix = acc.contiguous_length();
        let total = acc.total_length();
        let address = rpc.client_address.clone();

        let key = SchedKey {
            rpc_id,
            from_client: true,
        };
        let (up_to, priority) = match self.scheduled.get(&key) {
            Some(m) => (m.grant_offset, m.grant_priority),
            None => (total.min(rpc.peer_unscheduled), self.unsched_traffic_prio(total)),
        };
        if up_to > prefix {
            acc.request_retransmission(&mut self.driver, &address, rpc_id, up_to, priority, FROM_SERVER);
        }
    }
}
