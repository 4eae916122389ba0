//! A callback-driven reactor: event loop, hierarchical timer wheel, and
//! non-blocking TCP sockets with an optional TLS layer.
//!
//! The loop multiplexes three sources of work on a single thread (fd
//! readiness, due timers, and tasks posted from any thread) and dispatches
//! each to callbacks that run on the loop thread and never block. Multiple
//! loops may coexist in one process, each on its own thread.
//!
//! ```no_run
//! use kairos::{EventLoop, TcpSocket};
//!
//! let el = EventLoop::new().unwrap();
//! let sock = TcpSocket::new(&el);
//! let handle = el.handle();
//! sock.connect(
//!     "example.com",
//!     80,
//!     move |result| {
//!         println!("connect: {result:?}");
//!         handle.stop();
//!     },
//!     5_000,
//! )
//! .unwrap();
//! el.run().unwrap();
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod event;
pub mod event_loop;
mod poll;
pub mod sock;
mod task;
pub mod timer;
pub mod tls;
mod waker;
mod wheel;

pub use buffer::BufferChain;
pub use config::Config;
pub use error::{Error, Result};
pub use event::{Event, PollType};
pub use event_loop::{EventLoop, IoCallback, LoopHandle, Token};
pub use sock::{TcpListener, TcpSocket};
pub use timer::{Timer, TimerMode};
pub use tls::{HandshakeState, SslRole, TlsProvider, TlsSession};

#[cfg(feature = "tls")]
pub use tls::RustlsProvider;
