//! Receiver-scheduler behavior: overcommitment, sender distinctness,
//! grant priorities.

use super::*;
use crate::sched::{SchedKey, SchedState};

const SERVER: Addr = 9;

fn sched_config() -> TransportConfig {
    TransportConfig {
        // One-packet unscheduled budget so every sender's first packet is
        // on the wire before the first grant decision.
        round_trip_bytes: 1000,
        max_granted_messages: 2,
        timer_interval: 10,
        ..TransportConfig::default()
    }
}

/// Three senders with messages of 30/20/10 KB and an overcommitment
/// degree of 2: the active set stabilizes on the two smallest messages,
/// the largest parks inactive with no grants until the smallest
/// completes. Grant priorities track the active ranking.
#[test]
fn overcommit_prefers_fewest_bytes_remaining() {
    init_logger();
    let net = Network::new();
    let (mut a, _) = make_transport(&net, 1, 101, sched_config());
    let (mut b, _) = make_transport(&net, 2, 102, sched_config());
    let (mut c, _) = make_transport(&net, 3, 103, sched_config());
    let (mut server, _) = make_transport(&net, SERVER, 200, sched_config());

    let sid_a = a.open_session(SERVER);
    let sid_b = b.open_session(SERVER);
    let sid_c = c.open_session(SERVER);

    let (out_a, notify) = outcome_slot();
    a.send_request(sid_a, pattern(30_000), notify);
    let (out_b, notify) = outcome_slot();
    b.send_request(sid_b, pattern(20_000), notify);
    let (out_c, notify) = outcome_slot();
    c.send_request(sid_c, pattern(10_000), notify);

    let mut now = 0;
    for _ in 0..600 {
        now += 1;
        a.poll(now);
        b.poll(now);
        c.poll(now);
        server.poll(now);

        // The active set never exceeds D and never repeats a sender.
        assert!(server.active_messages.len() <= 2);
        let mut hashes: Vec<u64> = server
            .active_messages
            .iter()
            .map(|k| server.scheduled[k].sender_hash)
            .collect();
        hashes.sort_unstable();
        hashes.dedup();
        assert_eq!(hashes.len(), server.active_messages.len());

        serve_with(&mut server, |_| vec![1]);
        server.poll(now);
    }

    assert_eq!(out_a.borrow().clone(), Some(Ok(vec![1])));
    assert_eq!(out_b.borrow().clone(), Some(Ok(vec![1])));
    assert_eq!(out_c.borrow().clone(), Some(Ok(vec![1])));

    let net_ref = net.borrow();

    // Sender A (30 KB) was granted nothing until the 10 KB message's last
    // data packet had been sent: promotion strictly follows completion.
    let c_final_data = net_ref
        .trace
        .iter()
        .position(|e| {
            e.from == 3
                && matches!(e.header(), PacketHeader::Data(h) if h.offset == 9000
                    && h.common.flags & RETRANSMISSION == 0)
        })
        .expect("the 10 KB message never finished transmitting");
    let first_grant_to_a = net_ref
        .trace
        .iter()
        .position(|e| e.to == 1 && e.opcode() == Opcode::Grant as u8)
        .expect("the 30 KB sender was never promoted");
    assert!(
        first_grant_to_a > c_final_data,
        "grant to the inactive sender at {} before completion at {}",
        first_grant_to_a,
        c_final_data
    );

    // Grant priorities: the best active message gets the highest
    // scheduled priority (3 here), the second-best one less.
    let first_grant_prio = |to: Addr| {
        net_ref.trace.iter().find_map(|e| match e.header() {
            PacketHeader::Grant(h) if e.to == to => Some(h.priority),
            _ => None,
        })
    };
    assert_eq!(first_grant_prio(3), Some(3));
    assert_eq!(first_grant_prio(2), Some(2));
    assert_eq!(net_ref.outstanding_buffers, 0);
}

/// A second message from an already-active sender parks inactive even
/// when its priority key beats every active message.
#[test]
fn same_sender_stays_inactive() {
    init_logger();
    let net = Network::new();
    let (mut a, _) = make_transport(&net, 1, 101, sched_config());
    let (mut b, _) = make_transport(&net, 2, 102, sched_config());
    let (mut server, _) = make_transport(&net, SERVER, 200, sched_config());

    let sid_a = a.open_session(SERVER);
    let sid_b = b.open_session(SERVER);

    let (_out_a1, notify) = outcome_slot();
    let seq_a1 = a.send_request(sid_a, pattern(30_000), notify);
    let (_out_b, notify) = outcome_slot();
    b.send_request(sid_b, pattern(25_000), notify);

    // Let both become active.
    let mut now = 0;
    for _ in 0..3 {
        now += 1;
        a.poll(now);
        b.poll(now);
        server.poll(now);
    }
    let key_a1 = SchedKey {
        rpc_id: RpcId::new(101, seq_a1),
        from_client: true,
    };
    assert_eq!(server.scheduled[&key_a1].state, SchedState::Active);
    assert_eq!(server.active_messages.len(), 2);

    // A much smaller second message from sender A: its key beats every
    // active message, but its sender is already active.
    let (_out_a2, notify) = outcome_slot();
    let seq_a2 = a.send_request(sid_a, pattern(12_000), notify);
    for _ in 0..3 {
        now += 1;
        a.poll(now);
        server.poll(now);
    }

    let key_a2 = SchedKey {
        rpc_id: RpcId::new(101, seq_a2),
        from_client: true,
    };
    assert_eq!(server.scheduled[&key_a2].state, SchedState::Inactive);
    assert_eq!(server.active_messages.len(), 2);
    assert!(!server.active_messages.contains(&key_a2));
}
