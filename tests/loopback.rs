//! End-to-end scenarios over 127.0.0.1: connection setup in all three
//! modes, ordered delivery, lifecycle reaping, readiness notification.
//!
//! Timing assertions are deliberately loose; these tests share a machine
//! with everything else.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rivulet::{Error, RejectReason, Runtime, SockOpt, SocketOptions, SocketStatus};

fn localhost(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

fn wait_for<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    cond()
}

fn listener_on_ephemeral(rt: &Runtime, backlog: usize) -> (i32, u16) {
    let listener = rt.socket().unwrap();
    rt.bind(listener, localhost(0)).unwrap();
    rt.listen(listener, backlog).unwrap();
    let port = rt.sock_name(listener).unwrap().port();
    (listener, port)
}

#[test]
fn caller_listener_happy_path() {
    let rt = Runtime::new();
    let (listener, port) = listener_on_ephemeral(&rt, 10);

    let caller = rt.socket().unwrap();
    rt.connect(caller, localhost(port)).unwrap();
    assert_eq!(rt.sockstate(caller), SocketStatus::Connected);

    let (accepted, peer) = rt.accept(listener).unwrap();
    assert_eq!(rt.sockstate(accepted), SocketStatus::Connected);
    assert_eq!(peer.port(), rt.sock_name(caller).unwrap().port());
    assert_eq!(rt.peer_name(accepted).unwrap(), peer);

    // Three messages arrive in order, each as a distinct read.
    for msg in [&b"A"[..], b"B", b"C"] {
        assert_eq!(rt.send(caller, msg).unwrap(), msg.len());
    }
    for expected in [&b"A"[..], b"B", b"C"] {
        let mut buf = [0u8; 64];
        let (n, _ts) = rt.recvmsg(accepted, &mut buf).unwrap();
        assert_eq!(&buf[..n], expected);
    }

    let sent = rt.stats(caller, false).unwrap();
    assert!(sent.total.pkts_sent >= 3);
    let recv = rt.stats(accepted, false).unwrap();
    assert_eq!(recv.total.pkts_recv, 3);
    assert_eq!(recv.total.bytes_recv, 3);

    rt.close(caller).unwrap();
    rt.close(accepted).unwrap();
    rt.close(listener).unwrap();

    // The garbage collector reaps closed sockets a couple of seconds later.
    assert!(wait_for(Duration::from_secs(10), || {
        rt.sockstate(caller) == SocketStatus::Nonexist
            && rt.sockstate(accepted) == SocketStatus::Nonexist
    }));
    assert!(wait_for(Duration::from_secs(10), || {
        rt.sockstate(listener) == SocketStatus::Nonexist
    }));
}

#[test]
fn bidirectional_traffic_on_one_connection() {
    let rt = Runtime::new();
    let (listener, port) = listener_on_ephemeral(&rt, 4);
    let caller = rt.socket().unwrap();
    rt.connect(caller, localhost(port)).unwrap();
    let (accepted, _) = rt.accept(listener).unwrap();

    rt.send(caller, b"ping").unwrap();
    let mut buf = [0u8; 32];
    let n = rt.recv(accepted, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping");

    rt.send(accepted, b"pong").unwrap();
    let n = rt.recv(caller, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"pong");
}

#[test]
fn large_message_fragments_and_reassembles() {
    let rt = Runtime::new();
    let (listener, port) = listener_on_ephemeral(&rt, 4);
    let caller = rt.socket().unwrap();
    rt.connect(caller, localhost(port)).unwrap();
    let (accepted, _) = rt.accept(listener).unwrap();

    // Several packets worth of payload in one message.
    let msg: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    rt.send(caller, &msg).unwrap();
    let mut buf = vec![0u8; 8192];
    let n = rt.recv(accepted, &mut buf).unwrap();
    assert_eq!(n, msg.len());
    assert_eq!(&buf[..n], &msg[..]);
}

#[test]
fn backlog_overflow_is_rejected_with_reason() {
    let rt = Runtime::new();
    let (_listener, port) = listener_on_ephemeral(&rt, 1);

    let c1 = rt.socket().unwrap();
    let c2 = rt.socket().unwrap();
    let rt1 = rt.clone();
    let rt2 = rt.clone();
    let h1 = std::thread::spawn(move || rt1.connect(c1, localhost(port)));
    let h2 = std::thread::spawn(move || rt2.connect(c2, localhost(port)));
    let r1 = h1.join().unwrap();
    let r2 = h2.join().unwrap();

    // Exactly one caller lands; the other is told why.
    assert_eq!(r1.is_ok() as u8 + r2.is_ok() as u8, 1, "{r1:?} / {r2:?}");
    let (loser, err) = if r1.is_err() { (c1, r1.unwrap_err()) } else { (c2, r2.unwrap_err()) };
    assert_eq!(err, Error::ConnRej(RejectReason::Backlog));
    assert_eq!(rt.reject_reason(loser).unwrap(), Some(RejectReason::Backlog));
}

#[test]
fn rendezvous_connects_both_ways() {
    let rt = Runtime::new();
    let mut opts = SocketOptions::default();
    opts.rendezvous = true;

    let a = rt.socket_with(opts.clone()).unwrap();
    let b = rt.socket_with(opts).unwrap();
    rt.bind(a, localhost(0)).unwrap();
    rt.bind(b, localhost(0)).unwrap();
    let port_a = rt.sock_name(a).unwrap().port();
    let port_b = rt.sock_name(b).unwrap().port();

    let rt_a = rt.clone();
    let h = std::thread::spawn(move || rt_a.connect(a, localhost(port_b)));
    let rb = rt.connect(b, localhost(port_a));
    let ra = h.join().unwrap();
    ra.unwrap();
    rb.unwrap();
    assert_eq!(rt.sockstate(a), SocketStatus::Connected);
    assert_eq!(rt.sockstate(b), SocketStatus::Connected);

    // Symmetric traffic.
    rt.send(a, b"from-a").unwrap();
    rt.send(b, b"from-b").unwrap();
    let mut buf = [0u8; 32];
    let n = rt.recv(b, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"from-a");
    let n = rt.recv(a, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"from-b");
}

#[test]
fn connect_to_dead_port_times_out() {
    let rt = Runtime::new();
    let caller = rt.socket().unwrap();
    rt.set_option(caller, SockOpt::ConnectTimeout(Duration::from_millis(600))).unwrap();
    // A bound-but-silent UDP port: nothing will ever answer.
    let dead = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = dead.local_addr().unwrap().port();

    let started = Instant::now();
    let err = rt.connect(caller, localhost(port)).unwrap_err();
    assert!(matches!(err, Error::ConnRej(RejectReason::Timeout) | Error::ConnFail | Error::NoConn),
        "unexpected error {err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
    // The GC may already have started reaping the failed socket.
    assert!(matches!(
        rt.sockstate(caller),
        SocketStatus::Broken | SocketStatus::Closing | SocketStatus::Closed
    ));
}

#[test]
fn playout_latency_gates_delivery() {
    let rt = Runtime::new();
    let (listener, port) = listener_on_ephemeral(&rt, 4);

    let caller = rt.socket().unwrap();
    // Demand 400 ms of playout latency from the receiving side.
    rt.set_option(caller, SockOpt::PeerLatency(Duration::from_millis(400))).unwrap();
    rt.connect(caller, localhost(port)).unwrap();
    let (accepted, _) = rt.accept(listener).unwrap();
    assert!(rt.options(accepted).unwrap().latency >= Duration::from_millis(400));

    let sent_at = Instant::now();
    rt.send(caller, b"gated").unwrap();
    let mut buf = [0u8; 32];
    let n = rt.recv(accepted, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"gated");
    // Delivery respects the latency budget (generous lower bound).
    assert!(sent_at.elapsed() >= Duration::from_millis(200), "delivered too early");
}

#[test]
fn epoll_readiness_follows_the_listener() {
    let rt = Runtime::new();
    let (listener, port) = listener_on_ephemeral(&rt, 4);

    let eid = rt.epoll_create();
    rt.epoll_add_usock(eid, listener, None).unwrap();

    // Nothing pending yet.
    let (r, _) = rt.epoll_wait(eid, Some(Duration::from_millis(100))).unwrap();
    assert!(r.is_empty());

    let caller = rt.socket().unwrap();
    let rt2 = rt.clone();
    let h = std::thread::spawn(move || rt2.connect(caller, localhost(port)));

    let (r, _) = rt.epoll_wait(eid, Some(Duration::from_secs(5))).unwrap();
    assert_eq!(r, vec![listener]);
    h.join().unwrap().unwrap();

    let (accepted, _) = rt.accept(listener).unwrap();
    assert!(rt.sockstate(accepted) == SocketStatus::Connected);

    // Drained: the wait blocks again.
    let (r, _) = rt.epoll_wait(eid, Some(Duration::from_millis(200))).unwrap();
    assert!(r.is_empty());

    // Closing the listener surfaces it as an error event.
    rt.close(listener).unwrap();
    let (r, w) = rt.epoll_wait(eid, Some(Duration::from_secs(2))).unwrap();
    assert!(r.contains(&listener));
    assert!(w.contains(&listener));
    assert!(matches!(rt.accept(listener), Err(Error::NoListen) | Err(Error::InvalidSock)));

    rt.epoll_release(eid).unwrap();
}

#[test]
fn epoll_write_readiness_on_connect() {
    let rt = Runtime::new();
    let (listener, port) = listener_on_ephemeral(&rt, 4);

    let caller = rt.socket().unwrap();
    // Non-blocking connect driven to completion by the workers.
    rt.set_option(caller, SockOpt::RcvSyn(false)).unwrap();
    let eid = rt.epoll_create();
    rt.epoll_add_usock(eid, caller, None).unwrap();
    rt.connect(caller, localhost(port)).unwrap();
    // Non-blocking connect returns straight away; on loopback the workers
    // may finish the handshake before we get to look.
    assert!(matches!(
        rt.sockstate(caller),
        SocketStatus::Connecting | SocketStatus::Connected
    ));

    let (_, w) = rt.epoll_wait(eid, Some(Duration::from_secs(5))).unwrap();
    assert!(w.contains(&caller));
    assert_eq!(rt.sockstate(caller), SocketStatus::Connected);
    let _ = rt.accept(listener).unwrap();
}

#[test]
fn send_after_close_fails_with_connfail() {
    let rt = Runtime::new();
    let (listener, port) = listener_on_ephemeral(&rt, 4);
    let caller = rt.socket().unwrap();
    rt.connect(caller, localhost(port)).unwrap();
    let _ = rt.accept(listener).unwrap();

    rt.close(caller).unwrap();
    assert_eq!(rt.send(caller, b"x"), Err(Error::ConnFail));
}

#[test]
fn peer_close_breaks_the_other_end() {
    let rt = Runtime::new();
    let (listener, port) = listener_on_ephemeral(&rt, 4);
    let caller = rt.socket().unwrap();
    rt.connect(caller, localhost(port)).unwrap();
    let (accepted, _) = rt.accept(listener).unwrap();

    rt.close(caller).unwrap();
    // The shutdown notice (or silence) breaks the accepted socket.
    assert!(wait_for(Duration::from_secs(5), || rt
        .sockstate(accepted)
        .eq(&SocketStatus::Broken)
        || rt.sockstate(accepted) == SocketStatus::Closed));
    let mut buf = [0u8; 16];
    assert!(matches!(
        rt.recv(accepted, &mut buf),
        Err(Error::ConnLost) | Err(Error::InvalidSock)
    ));
}

#[test]
fn listener_port_is_rebindable_after_close() {
    let rt = Runtime::new();
    let (listener, port) = listener_on_ephemeral(&rt, 4);
    rt.close(listener).unwrap();

    // The listener slot frees immediately, even though the socket itself
    // is still being reaped.
    let fresh = rt.socket().unwrap();
    rt.bind(fresh, localhost(port)).unwrap();
    rt.listen(fresh, 4).unwrap();
    let caller = rt.socket().unwrap();
    rt.connect(caller, localhost(port)).unwrap();
    let _ = rt.accept(fresh).unwrap();
}

#[test]
fn stream_id_propagates_to_accepted_socket() {
    let rt = Runtime::new();
    let (listener, port) = listener_on_ephemeral(&rt, 4);
    let caller = rt.socket().unwrap();
    rt.set_option(caller, SockOpt::StreamId("live/cam-7".into())).unwrap();
    rt.connect(caller, localhost(port)).unwrap();
    let (accepted, _) = rt.accept(listener).unwrap();
    assert_eq!(rt.options(accepted).unwrap().stream_id, "live/cam-7");
}

#[test]
fn accept_hook_can_refuse() {
    let rt = Runtime::new();
    let (listener, port) = listener_on_ephemeral(&rt, 4);
    rt.set_accept_hook(
        listener,
        Box::new(|hs, _addr| {
            if hs.stream_id() == Some("blocked") {
                Err(RejectReason::Peer)
            } else {
                Ok(())
            }
        }),
    )
    .unwrap();

    let ok = rt.socket().unwrap();
    rt.set_option(ok, SockOpt::StreamId("allowed".into())).unwrap();
    rt.connect(ok, localhost(port)).unwrap();

    let bad = rt.socket().unwrap();
    rt.set_option(bad, SockOpt::StreamId("blocked".into())).unwrap();
    assert_eq!(
        rt.connect(bad, localhost(port)),
        Err(Error::ConnRej(RejectReason::Peer))
    );
}

#[test]
fn passphrase_mismatch_is_rejected() {
    let rt = Runtime::new();
    let listener = rt.socket().unwrap();
    rt.set_option(listener, SockOpt::Passphrase(Some("listener-secret-1".into()))).unwrap();
    rt.bind(listener, localhost(0)).unwrap();
    rt.listen(listener, 4).unwrap();
    let port = rt.sock_name(listener).unwrap().port();

    let wrong = rt.socket().unwrap();
    rt.set_option(wrong, SockOpt::Passphrase(Some("caller-secret-00".into()))).unwrap();
    assert_eq!(
        rt.connect(wrong, localhost(port)),
        Err(Error::ConnRej(RejectReason::BadSecret))
    );

    let missing = rt.socket().unwrap();
    assert_eq!(
        rt.connect(missing, localhost(port)),
        Err(Error::ConnRej(RejectReason::Unsecure))
    );

    let right = rt.socket().unwrap();
    rt.set_option(right, SockOpt::Passphrase(Some("listener-secret-1".into()))).unwrap();
    rt.connect(right, localhost(port)).unwrap();
}
