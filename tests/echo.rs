//! Loopback echo scenarios: byte conservation in both directions, peer
//! close observation, close idempotence, and send backpressure.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use kairos::{Error, EventLoop, TcpListener, TcpSocket, Timer, TimerMode};

/// Echo server on an ephemeral port: every accepted connection echoes each
/// inbound chunk back. Returns the listener (keep it alive) and its port.
fn spawn_echo_server(
    el: &EventLoop,
    conns: Arc<Mutex<Vec<TcpSocket>>>,
    server_saw_eof: Arc<AtomicBool>,
) -> (TcpListener, u16) {
    let listener = TcpListener::new(el);
    let handle = el.handle();
    listener.set_accept_callback(move |fd, _peer| {
        let sock = TcpSocket::with_handle(handle.clone());
        sock.attach_fd(fd).expect("attach accepted fd");
        let idx = conns.lock().unwrap().len();
        let conns_for_read = conns.clone();
        let saw_eof = server_saw_eof.clone();
        sock.set_read_callback(move |result| {
            if result.is_err() {
                return;
            }
            let conns = conns_for_read.lock().unwrap();
            let sock = &conns[idx];
            let mut buf = [0u8; 4096];
            loop {
                match sock.receive(&mut buf) {
                    Ok(0) => {
                        saw_eof.store(true, Ordering::SeqCst);
                        return;
                    }
                    Ok(n) => {
                        // Tolerate a closing peer; byte-conservation is
                        // asserted on the client side.
                        if sock.send(&buf[..n]) != Ok(n) {
                            return;
                        }
                    }
                    Err(Error::Again) => return,
                    Err(_) => return,
                }
            }
        });
        conns.lock().unwrap().push(sock);
        true
    });
    listener.start_listen("127.0.0.1", 0).expect("listen");
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

#[test]
fn echo_round_trip_and_peer_close() {
    let el = EventLoop::new().unwrap();
    let handle = el.handle();

    let server_conns: Arc<Mutex<Vec<TcpSocket>>> = Arc::new(Mutex::new(Vec::new()));
    let server_saw_eof = Arc::new(AtomicBool::new(false));
    let (_listener, port) = spawn_echo_server(&el, server_conns.clone(), server_saw_eof.clone());

    let client: Arc<Mutex<Option<TcpSocket>>> = Arc::new(Mutex::new(None));
    let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));

    let sock = TcpSocket::new(&el);
    {
        let client = client.clone();
        let received = received.clone();
        sock.set_read_callback(move |result| {
            if result.is_err() {
                return;
            }
            let guard = client.lock().unwrap();
            let Some(sock) = guard.as_ref() else { return };
            let mut buf = [0u8; 1024];
            loop {
                match sock.receive(&mut buf) {
                    Ok(0) => return,
                    Ok(n) => {
                        let mut received = received.lock().unwrap();
                        received.extend_from_slice(&buf[..n]);
                        if received.len() >= 10 {
                            // Got the full echo: close; the server should
                            // observe our EOF.
                            sock.close();
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
        });
    }
    {
        let client = client.clone();
        sock.connect(
            "127.0.0.1",
            port,
            move |result| {
                result.expect("connect");
                let guard = client.lock().unwrap();
                let sock = guard.as_ref().unwrap();
                assert_eq!(sock.send(b"hello").unwrap(), 5);
                assert_eq!(sock.send(b"world").unwrap(), 5);
            },
            1_000,
        )
        .expect("start connect");
    }
    *client.lock().unwrap() = Some(sock);

    // Stop once the server has seen the client's close (or bail out).
    let watchdog = Timer::new(&el);
    {
        let handle = handle.clone();
        let server_saw_eof = server_saw_eof.clone();
        let mut waited = 0u32;
        watchdog
            .schedule(10, TimerMode::Repeating, move || {
                waited += 10;
                if server_saw_eof.load(Ordering::SeqCst) || waited >= 5_000 {
                    handle.stop();
                }
            })
            .unwrap();
    }

    el.run().unwrap();

    assert_eq!(received.lock().unwrap().as_slice(), b"helloworld");
    assert!(server_saw_eof.load(Ordering::SeqCst), "server missed peer close");
}

#[test]
fn close_is_idempotent_and_silences_callbacks() {
    let el = EventLoop::new().unwrap();
    let handle = el.handle();

    let server_conns: Arc<Mutex<Vec<TcpSocket>>> = Arc::new(Mutex::new(Vec::new()));
    let server_saw_eof = Arc::new(AtomicBool::new(false));
    let (_listener, port) = spawn_echo_server(&el, server_conns, server_saw_eof);

    let fired_after_close = Arc::new(AtomicUsize::new(0));
    let client: Arc<Mutex<Option<TcpSocket>>> = Arc::new(Mutex::new(None));

    let sock = TcpSocket::new(&el);
    {
        let fired = fired_after_close.clone();
        sock.set_read_callback(move |_| {
            fired.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let fired = fired_after_close.clone();
        sock.set_error_callback(move |_| {
            fired.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let client = client.clone();
        sock.connect(
            "127.0.0.1",
            port,
            move |result| {
                result.expect("connect");
                let guard = client.lock().unwrap();
                let sock = guard.as_ref().unwrap();
                // Make the peer echo something back at us, then close
                // before it can arrive.
                let _ = sock.send(b"ping");
                sock.close();
                sock.close();
                assert_eq!(sock.send(b"x"), Err(Error::Closed));
                assert_eq!(sock.receive(&mut [0u8; 4]), Err(Error::Closed));
            },
            1_000,
        )
        .unwrap();
    }
    *client.lock().unwrap() = Some(sock);

    let stopper = Timer::new(&el);
    {
        let handle = handle.clone();
        stopper
            .schedule(300, TimerMode::OneShot, move || handle.stop())
            .unwrap();
    }
    el.run().unwrap();

    assert_eq!(
        fired_after_close.load(Ordering::SeqCst),
        0,
        "callbacks fired after close() returned"
    );
}

#[test]
fn operations_on_idle_socket_are_invalid_state() {
    let el = EventLoop::new().unwrap();
    let sock = TcpSocket::new(&el);
    assert_eq!(sock.send(b"x"), Err(Error::InvalidState));
    assert_eq!(sock.receive(&mut [0u8; 4]), Err(Error::InvalidState));
    assert_eq!(sock.detach_fd().err(), Some(Error::InvalidState));
}

#[test]
fn backpressure_reports_short_write_then_drain() {
    let el = EventLoop::new().unwrap();
    let handle = el.handle();

    // Accepting side never reads until told to: connections are paused on
    // arrival.
    let server_conns: Arc<Mutex<Vec<TcpSocket>>> = Arc::new(Mutex::new(Vec::new()));
    let listener = TcpListener::new(&el);
    {
        let handle = handle.clone();
        let conns = server_conns.clone();
        listener.set_accept_callback(move |fd, _peer| {
            let sock = TcpSocket::with_handle(handle.clone());
            sock.attach_fd(fd).expect("attach");
            sock.pause().unwrap();
            conns.lock().unwrap().push(sock);
            true
        });
    }
    listener.start_listen("127.0.0.1", 0).unwrap();
    let port = listener.local_addr().unwrap().port();

    let total_sent = Arc::new(AtomicUsize::new(0));
    let saw_short_write = Arc::new(AtomicBool::new(false));
    let saw_zero_write = Arc::new(AtomicBool::new(false));
    let write_ready_fired = Arc::new(AtomicBool::new(false));
    let drained = Arc::new(AtomicUsize::new(0));

    let client: Arc<Mutex<Option<TcpSocket>>> = Arc::new(Mutex::new(None));
    let sock = TcpSocket::new(&el);
    {
        let write_ready = write_ready_fired.clone();
        sock.set_write_callback(move |result| {
            result.expect("write ready");
            write_ready.store(true, Ordering::SeqCst);
        });
    }
    {
        let client = client.clone();
        let total_sent = total_sent.clone();
        let saw_short = saw_short_write.clone();
        let saw_zero = saw_zero_write.clone();
        sock.connect(
            "127.0.0.1",
            port,
            move |result| {
                result.expect("connect");
                let guard = client.lock().unwrap();
                let sock = guard.as_ref().unwrap();
                let chunk = vec![0x5au8; 64 * 1024];
                // Pump until the kernel refuses more.
                loop {
                    match sock.send(&chunk) {
                        Ok(0) => {
                            saw_zero.store(true, Ordering::SeqCst);
                            break;
                        }
                        Ok(n) => {
                            total_sent.fetch_add(n, Ordering::SeqCst);
                            if n < chunk.len() {
                                saw_short.store(true, Ordering::SeqCst);
                            }
                        }
                        Err(e) => panic!("send failed: {e}"),
                    }
                }
                // A further send while backpressured accepts nothing.
                assert_eq!(sock.send(&chunk).unwrap(), 0);
            },
            1_000,
        )
        .unwrap();
    }
    *client.lock().unwrap() = Some(sock);

    // After the sender has filled the pipe, let the server drain it.
    let drainer = Timer::new(&el);
    {
        let conns = server_conns.clone();
        let drained = drained.clone();
        let total_sent = total_sent.clone();
        let saw_zero = saw_zero_write.clone();
        let write_ready = write_ready_fired.clone();
        let handle = handle.clone();
        let mut resumed = false;
        let mut waited = 0u32;
        drainer
            .schedule(20, TimerMode::Repeating, move || {
                waited += 20;
                if !saw_zero.load(Ordering::SeqCst) {
                    if waited >= 5_000 {
                        handle.stop();
                    }
                    return;
                }
                let conns = conns.lock().unwrap();
                if let Some(server) = conns.first() {
                    if !resumed {
                        server.resume().unwrap();
                        resumed = true;
                    }
                    let mut buf = [0u8; 64 * 1024];
                    loop {
                        match server.receive(&mut buf) {
                            Ok(0) => break,
                            Ok(n) => {
                                drained.fetch_add(n, Ordering::SeqCst);
                            }
                            Err(_) => break,
                        }
                    }
                }
                let all_drained =
                    drained.load(Ordering::SeqCst) >= total_sent.load(Ordering::SeqCst);
                if (all_drained && write_ready.load(Ordering::SeqCst)) || waited >= 5_000 {
                    handle.stop();
                }
            })
            .unwrap();
    }

    el.run().unwrap();

    assert!(saw_zero_write.load(Ordering::SeqCst), "send never hit backpressure");
    assert!(
        write_ready_fired.load(Ordering::SeqCst),
        "write callback never reported drain"
    );
    assert_eq!(
        drained.load(Ordering::SeqCst),
        total_sent.load(Ordering::SeqCst),
        "bytes lost between sender and receiver"
    );
    // Not strictly guaranteed by the kernel, but with 64k chunks against a
    // full send buffer a short write shows up in practice.
    let _ = saw_short_write.load(Ordering::SeqCst);
}
