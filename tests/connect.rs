//! Connect lifecycle: success, refusal, timeout, and state machine guards.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kairos::{Error, EventLoop, TcpListener, TcpSocket, Timer, TimerMode};

#[test]
fn connect_to_local_listener_succeeds_once() {
    let el = EventLoop::new().unwrap();
    let handle = el.handle();

    let listener = TcpListener::new(&el);
    listener.set_accept_callback(|_fd, _peer| false);
    listener.start_listen("127.0.0.1", 0).unwrap();
    let port = listener.local_addr().unwrap().port();

    let fired = Arc::new(AtomicUsize::new(0));
    let sock = TcpSocket::new(&el);
    {
        let fired = fired.clone();
        let handle = handle.clone();
        sock.connect(
            "127.0.0.1",
            port,
            move |result| {
                result.expect("loopback connect");
                fired.fetch_add(1, Ordering::SeqCst);
                handle.stop();
            },
            1_000,
        )
        .unwrap();
    }

    let watchdog = Timer::new(&el);
    {
        let handle = handle.clone();
        watchdog
            .schedule(5_000, TimerMode::OneShot, move || handle.stop())
            .unwrap();
    }
    el.run().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn connect_timeout_fires_once_within_window() {
    let el = EventLoop::new().unwrap();
    let handle = el.handle();

    // Non-routable blackhole address: SYNs go nowhere.
    let outcome: Arc<Mutex<Vec<(Result<(), Error>, Duration)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let started = Instant::now();

    let sock = TcpSocket::new(&el);
    {
        let outcome = outcome.clone();
        let handle = handle.clone();
        sock.connect(
            "10.255.255.1",
            1,
            move |result| {
                outcome.lock().unwrap().push((result, started.elapsed()));
                handle.stop();
            },
            200,
        )
        .unwrap();
    }

    let watchdog = Timer::new(&el);
    {
        let handle = handle.clone();
        watchdog
            .schedule(5_000, TimerMode::OneShot, move || handle.stop())
            .unwrap();
    }
    el.run().unwrap();

    let outcome = outcome.lock().unwrap();
    assert_eq!(outcome.len(), 1, "connect callback fired {} times", outcome.len());
    let (result, elapsed) = &outcome[0];
    assert_eq!(*result, Err(Error::Timeout));
    assert!(
        *elapsed >= Duration::from_millis(180) && *elapsed <= Duration::from_millis(600),
        "timeout at {elapsed:?}, expected ~200ms"
    );
}

#[test]
fn connect_refused_is_reported_once() {
    let el = EventLoop::new().unwrap();
    let handle = el.handle();

    // Grab an ephemeral port, then free it so nothing listens there.
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };

    let outcome: Arc<Mutex<Vec<Result<(), Error>>>> = Arc::new(Mutex::new(Vec::new()));
    let sock = TcpSocket::new(&el);
    let connect_result = {
        let outcome = outcome.clone();
        let handle = handle.clone();
        sock.connect(
            "127.0.0.1",
            port,
            move |result| {
                outcome.lock().unwrap().push(result);
                handle.stop();
            },
            1_000,
        )
    };

    match connect_result {
        // Loopback refusal may complete synchronously inside connect().
        Err(err) => assert_eq!(err, Error::Refused),
        Ok(()) => {
            let watchdog = Timer::new(&el);
            {
                let handle = handle.clone();
                watchdog
                    .schedule(5_000, TimerMode::OneShot, move || handle.stop())
                    .unwrap();
            }
            el.run().unwrap();
            let outcome = outcome.lock().unwrap();
            assert_eq!(outcome.len(), 1);
            assert_eq!(outcome[0], Err(Error::Refused));
        }
    }
}

#[test]
fn second_connect_fails_fast_with_invalid_state() {
    let el = EventLoop::new().unwrap();
    let sock = TcpSocket::new(&el);
    sock.connect("10.255.255.1", 1, |_| {}, 10_000).unwrap();
    assert_eq!(
        sock.connect("10.255.255.1", 1, |_| {}, 10_000),
        Err(Error::InvalidState)
    );
    sock.close();
}

#[test]
fn detach_returns_fd_and_resets_socket() {
    let el = EventLoop::new().unwrap();
    let handle = el.handle();

    let listener = TcpListener::new(&el);
    listener.set_accept_callback(|_fd, _peer| false);
    listener.start_listen("127.0.0.1", 0).unwrap();
    let port = listener.local_addr().unwrap().port();

    let client: Arc<Mutex<Option<TcpSocket>>> = Arc::new(Mutex::new(None));
    let detached = Arc::new(AtomicUsize::new(0));
    let sock = TcpSocket::new(&el);
    {
        let client = client.clone();
        let detached = detached.clone();
        let handle = handle.clone();
        sock.connect(
            "127.0.0.1",
            port,
            move |result| {
                result.expect("connect");
                let guard = client.lock().unwrap();
                let sock = guard.as_ref().unwrap();
                let fd = sock.detach_fd().expect("detach");
                assert!(fd >= 0);
                detached.store(1, Ordering::SeqCst);
                // The fd is ours now.
                unsafe {
                    libc::close(fd);
                }
                // Detached socket is reusable from IDLE.
                assert_eq!(sock.send(b"x"), Err(Error::InvalidState));
                handle.stop();
            },
            1_000,
        )
        .unwrap();
    }
    *client.lock().unwrap() = Some(sock);

    let watchdog = Timer::new(&el);
    {
        let handle = handle.clone();
        watchdog
            .schedule(5_000, TimerMode::OneShot, move || handle.stop())
            .unwrap();
    }
    el.run().unwrap();
    assert_eq!(detached.load(Ordering::SeqCst), 1);
}
