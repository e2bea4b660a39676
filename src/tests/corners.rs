//! Corner cases: duplicates, garbage, cancellation, selector order.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::*;

const CLIENT: Addr = 1;
const SERVER: Addr = 9;
const SERVER2: Addr = 10;

/// Duplicate first-packet arrivals are absorbed by the incoming table:
/// one ServerRpc, one execution, one response.
#[test]
fn duplicate_all_data_absorbed() {
    init_logger();
    let net = Network::new();
    let (mut client, _) = make_transport(&net, CLIENT, 100, test_config());
    let (mut server, _) = make_transport(&net, SERVER, 200, test_config());
    let sid = client.open_session(SERVER);

    let (outcome, notify) = outcome_slot();
    client.send_request(sid, pattern(100), notify);
    net.borrow_mut().duplicate_last(SERVER);

    let executions = Rc::new(Cell::new(0));
    let mut now = 0;
    for _ in 0..10 {
        now += 1;
        client.poll(now);
        server.poll(now);
        let executions = executions.clone();
        serve_with(&mut server, move |req| {
            executions.set(executions.get() + 1);
            req
        });
        server.poll(now);
    }

    assert_eq!(executions.get(), 1);
    assert_eq!(outcome.borrow().clone(), Some(Ok(pattern(100))));
    assert!(server.incoming_rpcs.is_empty());
    assert_eq!(net.borrow().delivered(CLIENT, Opcode::AllData), 1);
}

/// Malformed packets are logged and dropped, never crash, never leak a
/// receive buffer.
#[test]
fn garbage_packets_dropped() {
    init_logger();
    let net = Network::new();
    let (mut server, _) = make_transport(&net, SERVER, 200, test_config());

    {
        let mut net = net.borrow_mut();
        net.inject(CLIENT, SERVER, vec![]);
        net.inject(CLIENT, SERVER, vec![99, 1, 2, 3]);
        net.inject(CLIENT, SERVER, vec![20, 0, 0]);
        // An ALL_DATA header promising more payload than it carries.
        net.inject(CLIENT, SERVER, {
            let mut buf = bytes::BytesMut::new();
            AllDataHeader::new(RpcId::new(5, 5), FROM_CLIENT, 500).ser(&mut buf);
            buf.to_vec()
        });
    }

    let mut now = 0;
    for _ in 0..5 {
        now += 1;
        server.poll(now);
    }
    assert!(server.incoming_rpcs.is_empty());
    assert!(server.take_request().is_none());
    assert_eq!(net.borrow().outstanding_buffers, 0);
}

/// Zero-length request and response round-trip as ALL_DATA.
#[test]
fn empty_messages() {
    init_logger();
    let net = Network::new();
    let (mut client, _) = make_transport(&net, CLIENT, 100, test_config());
    let (mut server, _) = make_transport(&net, SERVER, 200, test_config());
    let sid = client.open_session(SERVER);

    let (outcome, notify) = outcome_slot();
    client.send_request(sid, Vec::new(), notify);

    let mut now = 0;
    pump_echo(&mut client, &mut server, &mut now, 5);
    assert_eq!(outcome.borrow().clone(), Some(Ok(Vec::new())));
}

/// Cancellation removes all local state and tells the server via ABORT;
/// the notifier never fires.
#[test]
fn cancel_request_aborts_server_state() {
    init_logger();
    let net = Network::new();
    let (mut client, _) = make_transport(&net, CLIENT, 100, test_config());
    let (mut server, _) = make_transport(&net, SERVER, 200, test_config());
    let sid = client.open_session(SERVER);

    let (outcome, notify) = outcome_slot();
    let sequence = client.send_request(sid, pattern(20_000), notify);

    // Let part of the request land, then cancel.
    let mut now = 0;
    for _ in 0..3 {
        now += 1;
        client.poll(now);
        server.poll(now);
    }
    assert!(!server.incoming_rpcs.is_empty());
    client.cancel_request(sequence);

    for _ in 0..10 {
        now += 1;
        client.poll(now);
        server.poll(now);
    }

    assert!(outcome.borrow().is_none(), "cancelled RPC must not notify");
    assert!(client.outgoing_rpcs.is_empty());
    assert!(server.incoming_rpcs.is_empty());
    assert_eq!(net.borrow().delivered(SERVER, Opcode::Abort), 1);
    assert_eq!(net.borrow().outstanding_buffers, 0);
}

/// Aborting a session fails every outstanding RPC with CANCELED and
/// refuses new ones.
#[test]
fn abort_session_cancels_everything() {
    init_logger();
    let net = Network::new();
    let (mut client, _) = make_transport(&net, CLIENT, 100, test_config());
    let sid = client.open_session(SERVER);

    let (out1, notify) = outcome_slot();
    client.send_request(sid, pattern(100), notify);
    let (out2, notify) = outcome_slot();
    client.send_request(sid, pattern(20_000), notify);

    client.abort_session(sid);
    assert_eq!(out1.borrow().clone(), Some(Err(TransportError::Canceled)));
    assert_eq!(out2.borrow().clone(), Some(Err(TransportError::Canceled)));

    let (out3, notify) = outcome_slot();
    client.send_request(sid, pattern(100), notify);
    assert_eq!(out3.borrow().clone(), Some(Err(TransportError::Canceled)));
}

/// An ABORT for a request the service layer is executing defers teardown
/// until the reply; the reply is then discarded.
#[test]
fn abort_during_execution_is_deferred() {
    init_logger();
    let net = Network::new();
    let (mut client, _) = make_transport(&net, CLIENT, 100, test_config());
    let (mut server, _) = make_transport(&net, SERVER, 200, test_config());
    let sid = client.open_session(SERVER);

    let (_outcome, notify) = outcome_slot();
    let sequence = client.send_request(sid, pattern(100), notify);

    let mut now = 0;
    now += 1;
    client.poll(now);
    server.poll(now);
    let (handle, _payload) = server.take_request().expect("request not delivered");

    client.cancel_request(sequence);
    now += 1;
    client.poll(now);
    server.poll(now);

    // The RPC is marked cancelled but still present for the reply.
    assert!(!server.incoming_rpcs.is_empty());
    assert_eq!(
        server.send_reply(handle, pattern(10)),
        Err(TransportError::Canceled)
    );
    assert!(server.incoming_rpcs.is_empty());
}

/// SRPT: with one packet of transmit budget per tick, the message with
/// fewer bytes remaining always goes first and finishes first.
#[test]
fn srpt_prefers_shorter_message() {
    init_logger();
    let net = Network::new();
    let (mut client, queue_space) = make_transport(&net, CLIENT, 100, test_config());
    let (mut server1, _) = make_transport(&net, SERVER, 200, test_config());
    let (mut server2, _) = make_transport(&net, SERVER2, 201, test_config());

    let sid1 = client.open_session(SERVER);
    let sid2 = client.open_session(SERVER2);

    // Queue the longer message first; the selector must still prefer the
    // shorter one.
    queue_space.set(0);
    let (out_big, notify) = outcome_slot();
    client.send_request(sid1, pattern(9_000), notify);
    let (out_small, notify) = outcome_slot();
    client.send_request(sid2, pattern(5_000), notify);

    let mut now = 0;
    for _ in 0..200 {
        now += 1;
        // One full packet of budget per tick.
        queue_space.set(MTU);
        client.poll(now);
        server1.poll(now);
        server2.poll(now);
        serve_with(&mut server1, |_| vec![1]);
        serve_with(&mut server2, |_| vec![2]);
        server1.poll(now);
        server2.poll(now);
    }

    assert_eq!(out_big.borrow().clone(), Some(Ok(vec![1])));
    assert_eq!(out_small.borrow().clone(), Some(Ok(vec![2])));

    let net = net.borrow();
    // The first data packet on the wire belongs to the 5 KB message, and
    // the 5 KB message finishes transmitting before the 9 KB one.
    let first_data_dst = net
        .trace
        .iter()
        .find_map(|e| match e.header() {
            PacketHeader::Data(_) => Some(e.to),
            _ => None,
        })
        .expect("no data packets at all");
    assert_eq!(first_data_dst, SERVER2);

    let small_done = net
        .trace
        .iter()
        .position(|e| {
            e.to == SERVER2
                && matches!(e.header(), PacketHeader::Data(h) if h.offset == 4_000)
        })
        .expect("small message never finished");
    let big_done = net
        .trace
        .iter()
        .position(|e| {
            e.to == SERVER
                && matches!(e.header(), PacketHeader::Data(h) if h.offset == 8_000)
        })
        .expect("big message never finished");
    assert!(small_done < big_done);
}

/// More concurrent outgoing messages than the top list holds: the slow
/// path still gets every one of them onto the wire.
#[test]
fn slow_path_covers_top_list_overflow() {
    init_logger();
    let net = Network::new();
    let (mut client, _) = make_transport(&net, CLIENT, 100, test_config());
    let (mut server, _) = make_transport(&net, SERVER, 200, test_config());
    let sid = client.open_session(SERVER);

    const N: usize = 12;
    let mut outcomes = Vec::new();
    for i in 0..N {
        let (outcome, notify) = outcome_slot();
        client.send_request(sid, pattern(2_000 + i), notify);
        outcomes.push(outcome);
    }

    let mut now = 0;
    pump_echo(&mut client, &mut server, &mut now, 50);

    for (i, outcome) in outcomes.iter().enumerate() {
        assert_eq!(
            outcome.borrow().clone(),
            Some(Ok(pattern(2_000 + i))),
            "rpc {}",
            i
        );
    }
    assert_eq!(net.borrow().outstanding_buffers, 0);
}

/// Unscheduled traffic priority: smaller size brackets get higher
/// priority classes.
#[test]
fn unscheduled_priority_brackets() {
    init_logger();
    let net = Network::new();
    let (transport, _) = make_transport(&net, CLIENT, 100, test_config());

    assert_eq!(transport.unsched_traffic_prio(1), 7);
    assert_eq!(transport.unsched_traffic_prio(469), 7);
    assert_eq!(transport.unsched_traffic_prio(470), 6);
    assert_eq!(transport.unsched_traffic_prio(5_521), 6);
    assert_eq!(transport.unsched_traffic_prio(5_522), 5);
    assert_eq!(transport.unsched_traffic_prio(15_267), 5);
    assert_eq!(transport.unsched_traffic_prio(15_268), 4);
    assert_eq!(transport.unsched_traffic_prio(u32::MAX), 4);
}

/// Liveness under random data-packet loss: the RPC terminates, one way
/// or the other, without leaking buffers.
#[test]
fn random_data_loss_terminates() {
    init_logger();
    let net = Network::new();
    let (mut client, _) = make_transport(&net, CLIENT, 100, test_config());
    let (mut server, _) = make_transport(&net, SERVER, 200, test_config());
    let sid = client.open_session(SERVER);

    let mut rng = StdRng::seed_from_u64(0x5157_11e5);
    net.borrow_mut().drop_filter = Some(Box::new(move |entry| {
        matches!(entry.header(), PacketHeader::Data(_) | PacketHeader::AllData(_))
            && rng.gen_bool(0.25)
    }));

    let (outcome, notify) = outcome_slot();
    client.send_request(sid, pattern(30_000), notify);

    let mut now = 0;
    for _ in 0..5000 {
        now += 1;
        client.poll(now);
        server.poll(now);
        serve_with(&mut server, |_| pattern(20_000));
        server.poll(now);
        if outcome.borrow().is_some() {
            break;
        }
    }

    let result = outcome.borrow().clone().expect("rpc never terminated");
    if let Ok(response) = result {
        assert_eq!(response, pattern(20_000));
    }
    assert_eq!(net.borrow().outstanding_buffers, 0);
}
