//! End-to-end behavior of the assembled stack, exercised over real sockets.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sprocket::spcore::aio::RecvBuf;
use sprocket::spcore::platform::platform;
use sprocket::spcore::stream::take_stream_output;
use sprocket::spcore::tcp::TcpListener;
use sprocket::{ids, Aio, Message, Pipe, RawProtocol, Socket, SpError, SpUrl, Stream, StreamListener};

fn wait_for_pipes(sock: &Arc<Socket>, n: usize) -> Vec<Arc<Pipe>> {
    let start = Instant::now();
    loop {
        let pipes = sock.pipes();
        if pipes.len() >= n {
            return pipes;
        }
        assert!(start.elapsed() < Duration::from_secs(5), "no pipe showed up");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn pipe_send_body(pipe: &Arc<Pipe>, body: &[u8]) {
    let aio = Aio::new_sync();
    aio.set_msg(Message::from_body(body));
    pipe.send(&aio);
    aio.wait();
    assert_eq!(aio.result(), Ok(()));
}

fn stream_send_all(stream: &dyn Stream, data: &[u8]) {
    let mut data = bytes::Bytes::copy_from_slice(data);
    while !data.is_empty() {
        let aio = Aio::new_sync();
        aio.set_iov(vec![data.clone()]).unwrap();
        stream.send(&aio);
        aio.wait();
        assert_eq!(aio.result(), Ok(()));
        let _ = data.split_to(aio.count());
    }
}

fn stream_recv_exact(stream: &dyn Stream, want: usize) -> Vec<u8> {
    let aio = Aio::new_sync();
    aio.set_recv(RecvBuf::with_want(want));
    loop {
        stream.recv(&aio);
        aio.wait();
        assert_eq!(aio.result(), Ok(()));
        let rb = aio.take_recv().unwrap();
        if rb.is_full() {
            return rb.buf.to_vec();
        }
        aio.set_recv(rb);
    }
}

/// Scenario: peers with mismatched protocol identities. The 8-byte negotiation
///  succeeds at the framing level, but the sockets reject the pairing and the
///  reject counter moves.
#[test]
fn scenario_negotiation_mismatch() {
    let pub_side = Socket::new(Box::new(RawProtocol::new(ids::PUB0, ids::SUB0)));
    let listener = pub_side.listen("tcp://127.0.0.1:0").unwrap();
    let port = listener.bound_port().unwrap();

    let req_side = Socket::new(Box::new(RawProtocol::new(ids::REQ0, ids::REP0)));
    let _dialer = req_side.dial(&format!("tcp://127.0.0.1:{}", port)).unwrap();

    let start = Instant::now();
    loop {
        let rejects = req_side.stats().rejects.load(Ordering::Relaxed)
            + pub_side.stats().rejects.load(Ordering::Relaxed);
        if rejects >= 1 {
            break;
        }
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "no rejection was counted"
        );
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(req_side.pipes().is_empty());

    req_side.close();
    pub_side.close();
    platform().reaper().flush();
}

/// Scenario: one-byte echo, checked byte-for-byte on the wire against a raw
///  TCP peer standing in for a REP implementation.
#[test]
fn scenario_one_byte_echo_wire_format() {
    let raw_listener = TcpListener::new(SpUrl::parse("tcp://127.0.0.1:0").unwrap()).unwrap();
    raw_listener.listen().unwrap();
    let port = raw_listener.local_addr().unwrap().port();

    let acc = Aio::new_sync();
    raw_listener.accept(&acc);

    let req = Socket::new(Box::new(RawProtocol::new(ids::REQ0, ids::REP0)));
    let dialer = req.dial(&format!("tcp://127.0.0.1:{}", port)).unwrap();

    acc.wait();
    assert_eq!(acc.result(), Ok(()));
    let peer = take_stream_output(&acc).unwrap();

    // the REQ side announces itself: 00 53 50 00 00 30 00 00
    let nego = stream_recv_exact(peer.as_ref(), 8);
    assert_eq!(nego, [0x00, 0x53, 0x50, 0x00, 0x00, 0x30, 0x00, 0x00]);
    // we answer as REP
    stream_send_all(
        peer.as_ref(),
        &[0x00, 0x53, 0x50, 0x00, 0x00, 0x31, 0x00, 0x00],
    );

    dialer.wait_connected().unwrap();
    let pipe = wait_for_pipes(&req, 1).remove(0);
    assert_eq!(pipe.peer(), ids::REP0);

    // REQ sends body [0x41]; on the wire: length prefix 1, then the byte
    pipe_send_body(&pipe, &[0x41]);
    let framed = stream_recv_exact(peer.as_ref(), 9);
    assert_eq!(framed, [0, 0, 0, 0, 0, 0, 0, 1, 0x41]);

    // echo the same bytes back; REQ receives the same message
    stream_send_all(peer.as_ref(), &framed);
    let aio = Aio::new_sync();
    pipe.recv(&aio);
    aio.wait();
    assert_eq!(aio.result(), Ok(()));
    assert_eq!(aio.take_msg().unwrap().body(), &[0x41]);

    req.close();
    peer.stop();
    raw_listener.close();
    platform().reaper().flush();
}

/// Scenario: an aio with a 100 ms deadline and no completion finishes with
///  timed-out between 100 and 200 ms after start.
#[test]
fn scenario_timeout_window() {
    let aio = Aio::new_sync();
    aio.set_timeout(Some(Duration::from_millis(100)));
    let begin = Instant::now();
    assert!(aio.start(Some(Box::new(|aio, rv| aio.finish_error(rv)))));
    aio.wait();
    let elapsed = begin.elapsed();
    assert_eq!(aio.result(), Err(SpError::TimedOut));
    assert!(elapsed >= Duration::from_millis(100), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(200), "{:?}", elapsed);
}

/// Scenario: FIFO, byte-exact delivery of a burst of messages per pipe, over
///  both the plain and the TLS-wrapped transport.
#[test]
fn scenario_fifo_delivery() {
    for url in ["tcp://127.0.0.1:0", "tls+tcp://127.0.0.1:0"] {
        let server = Socket::new(Box::new(RawProtocol::pair()));
        let listener = server.listen(url).unwrap();
        let dial_url = url.replace(":0", &format!(":{}", listener.bound_port().unwrap()));

        let client = Socket::new(Box::new(RawProtocol::pair()));
        let dialer = client.dial(&dial_url).unwrap();
        dialer.wait_connected().unwrap();

        let cp = wait_for_pipes(&client, 1).remove(0);
        let sp = wait_for_pipes(&server, 1).remove(0);

        let bodies: Vec<Vec<u8>> = (0..32u32)
            .map(|i| (0..64).map(|j| ((i * 7 + j) % 251) as u8).collect())
            .collect();
        for body in &bodies {
            pipe_send_body(&cp, body);
        }
        for body in &bodies {
            let aio = Aio::new_sync();
            sp.recv(&aio);
            aio.wait();
            assert_eq!(aio.result(), Ok(()), "on {}", url);
            assert_eq!(aio.take_msg().unwrap().body(), &body[..], "on {}", url);
        }

        client.close();
        server.close();
        platform().reaper().flush();
    }
}

/// Scenario: a message over the TLS transport larger than the receiver's limit
///  finishes the receive with message-too-big and delivers nothing.
#[test]
fn scenario_tls_oversize_message() {
    let server = Socket::new(Box::new(RawProtocol::pair()));
    server.set_recvmax(64 * 1024);
    let listener = server.listen("tls+tcp://127.0.0.1:0").unwrap();
    let port = listener.bound_port().unwrap();

    let client = Socket::new(Box::new(RawProtocol::pair()));
    let dialer = client.dial(&format!("tls+tcp://127.0.0.1:{}", port)).unwrap();
    dialer.wait_connected().unwrap();

    let cp = wait_for_pipes(&client, 1).remove(0);
    let sp = wait_for_pipes(&server, 1).remove(0);

    pipe_send_body(&cp, &vec![0xAAu8; 128 * 1024]);

    let aio = Aio::new_sync();
    sp.recv(&aio);
    aio.wait();
    assert_eq!(aio.result(), Err(SpError::MsgTooBig));
    assert!(aio.take_msg().is_none(), "no partial delivery");

    client.close();
    server.close();
    platform().reaper().flush();
}

/// Scenario: SP messaging across the WebSocket transport, including the HTTP
///  upgrade and message-mode framing.
#[test]
fn scenario_sp_over_websocket() {
    let server = Socket::new(Box::new(RawProtocol::pair()));
    let listener = server.listen("ws://127.0.0.1:0/sp").unwrap();
    let port = listener.bound_port().unwrap();

    let client = Socket::new(Box::new(RawProtocol::pair()));
    let dialer = client.dial(&format!("ws://127.0.0.1:{}/sp", port)).unwrap();
    dialer.wait_connected().unwrap();

    let cp = wait_for_pipes(&client, 1).remove(0);
    let sp = wait_for_pipes(&server, 1).remove(0);

    // larger than one WebSocket fragment, so fragmentation is exercised
    let body: Vec<u8> = (0..200_000u32).map(|i| (i % 249) as u8).collect();
    pipe_send_body(&cp, &body);

    let aio = Aio::new_sync();
    sp.recv(&aio);
    aio.wait();
    assert_eq!(aio.result(), Ok(()));
    assert_eq!(aio.take_msg().unwrap().body(), &body[..]);

    client.close();
    server.close();
    platform().reaper().flush();
}

/// Scenario: closing a socket fails pending receives with a lifecycle error.
#[test]
fn scenario_close_fails_pending_operations() {
    let server = Socket::new(Box::new(RawProtocol::pair()));
    let listener = server.listen("tcp://127.0.0.1:0").unwrap();
    let port = listener.bound_port().unwrap();

    let client = Socket::new(Box::new(RawProtocol::pair()));
    let dialer = client.dial(&format!("tcp://127.0.0.1:{}", port)).unwrap();
    dialer.wait_connected().unwrap();
    let cp = wait_for_pipes(&client, 1).remove(0);

    let aio = Aio::new_sync();
    cp.recv(&aio);
    client.close();
    aio.wait();
    assert!(matches!(
        aio.result(),
        Err(SpError::Closed) | Err(SpError::ConnShutdown) | Err(SpError::Stopped)
    ));

    server.close();
    platform().reaper().flush();
}
