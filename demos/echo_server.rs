use std::sync::{Arc, Mutex};

use kairos::{Error, EventLoop, TcpListener, TcpSocket};

/// Minimal echo server. Every accepted connection gets its inbound bytes
/// written straight back.
///
/// Run:           cargo run --example echo_server
/// Custom port:   PORT=9000 cargo run --example echo_server
fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(7878);

    let el = EventLoop::new().expect("create event loop");
    let handle = el.handle();
    eprintln!("poll backend: {}", el.poll_type());

    let conns: Arc<Mutex<Vec<TcpSocket>>> = Arc::new(Mutex::new(Vec::new()));
    let listener = TcpListener::new(&el);
    {
        let handle = handle.clone();
        let conns = conns.clone();
        listener.set_accept_callback(move |fd, peer| {
            eprintln!("accepted {peer}");
            let sock = TcpSocket::with_handle(handle.clone());
            if sock.attach_fd(fd).is_err() {
                return false;
            }
            let idx = conns.lock().unwrap().len();
            let conns_for_read = conns.clone();
            sock.set_read_callback(move |result| {
                if result.is_err() {
                    return;
                }
                let conns = conns_for_read.lock().unwrap();
                let sock = &conns[idx];
                let mut buf = [0u8; 16384];
                loop {
                    match sock.receive(&mut buf) {
                        Ok(0) => {
                            eprintln!("peer closed");
                            return;
                        }
                        Ok(n) => {
                            if sock.send(&buf[..n]).is_err() {
                                return;
                            }
                        }
                        Err(Error::Again) => return,
                        Err(e) => {
                            eprintln!("receive error: {e}");
                            return;
                        }
                    }
                }
            });
            conns.lock().unwrap().push(sock);
            true
        });
    }
    listener.set_error_callback(|e| eprintln!("listener error: {e}"));
    listener
        .start_listen("127.0.0.1", port)
        .expect("bind listener");
    eprintln!("listening on {}", listener.local_addr().unwrap());

    el.run().expect("event loop");
}
