use std::sync::{Arc, Mutex};

use kairos::{Error, EventLoop, TcpSocket};

/// Connects to an echo server, sends one line, prints the echo, exits.
///
/// Start the peer first:  cargo run --example echo_server
/// Then run:              cargo run --example connect_echo
/// Or point elsewhere:    TARGET_HOST=10.0.0.1 TARGET_PORT=8080 cargo run --example connect_echo
fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let host = std::env::var("TARGET_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("TARGET_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(7878);

    let el = EventLoop::new().expect("create event loop");
    let handle = el.handle();

    let client: Arc<Mutex<Option<TcpSocket>>> = Arc::new(Mutex::new(None));
    let sock = TcpSocket::new(&el);
    {
        let client = client.clone();
        let handle = handle.clone();
        sock.set_read_callback(move |result| {
            if result.is_err() {
                handle.stop();
                return;
            }
            let guard = client.lock().unwrap();
            let Some(sock) = guard.as_ref() else { return };
            let mut buf = [0u8; 4096];
            match sock.receive(&mut buf) {
                Ok(0) => {
                    eprintln!("peer closed");
                    handle.stop();
                }
                Ok(n) => {
                    eprintln!("received: {}", String::from_utf8_lossy(&buf[..n]).trim());
                    sock.close();
                    handle.stop();
                }
                Err(Error::Again) => {}
                Err(e) => {
                    eprintln!("receive error: {e}");
                    handle.stop();
                }
            }
        });
    }
    {
        let client = client.clone();
        let handle = handle.clone();
        let host_for_log = host.clone();
        sock.connect(
            &host,
            port,
            move |result| match result {
                Ok(()) => {
                    eprintln!("connected to {host_for_log}:{port}");
                    let guard = client.lock().unwrap();
                    let sock = guard.as_ref().unwrap();
                    if let Err(e) = sock.send(b"Hello from kairos!\n") {
                        eprintln!("send error: {e}");
                        handle.stop();
                    }
                }
                Err(e) => {
                    eprintln!("connect failed: {e}");
                    handle.stop();
                }
            },
            5_000,
        )
        .expect("start connect");
    }
    *client.lock().unwrap() = Some(sock);

    el.run().expect("event loop");
}
