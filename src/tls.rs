//! TLS capability boundary.
//!
//! The socket layer needs only a buffered record transform: feed ciphertext
//! in, take ciphertext out, read/write plaintext, and drive the handshake.
//! Any engine satisfying [`TlsSession`] plugs in; the `tls` feature ships a
//! rustls-backed provider.

use crate::error::Result;

/// Which end of the handshake this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslRole {
    Client,
    Server,
}

/// Handshake progress report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Done,
    /// Needs more ciphertext from the peer.
    WantRead,
    /// Has ciphertext queued for the peer.
    WantWrite,
}

/// One TLS connection's record layer, sans I/O. The socket owns the fd and
/// moves bytes between it and this session.
pub trait TlsSession: Send {
    /// Drive the handshake with whatever is buffered. Idempotent once done.
    fn handshake(&mut self) -> Result<HandshakeState>;

    fn is_handshaking(&self) -> bool;

    /// Feed ciphertext received from the wire. Returns bytes consumed.
    fn read_ciphertext(&mut self, data: &[u8]) -> Result<usize>;

    /// Read decrypted application data. `Err(Again)` means more ciphertext
    /// is needed; `Ok(0)` means the peer sent close_notify.
    fn read_plaintext(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Encrypt application data. Returns plaintext bytes accepted; the
    /// ciphertext shows up in `pending_ciphertext`.
    fn write_plaintext(&mut self, data: &[u8]) -> Result<usize>;

    /// Ciphertext waiting to be written to the wire.
    fn pending_ciphertext(&self) -> &[u8];

    /// Mark `n` bytes of pending ciphertext as written.
    fn advance_ciphertext(&mut self, n: usize);

    /// Queue a close_notify. The remaining ciphertext should still be
    /// flushed if possible.
    fn shutdown(&mut self);

    /// ALPN protocol negotiated during the handshake, if any.
    fn alpn_selected(&self) -> Option<&[u8]>;
}

/// Factory installed on a loop; sockets ask it for sessions when a
/// handshake starts.
pub trait TlsProvider: Send + Sync {
    fn new_client(&self, server_name: &str) -> Result<Box<dyn TlsSession>>;
    fn new_server(&self) -> Result<Box<dyn TlsSession>>;
}

#[cfg(feature = "tls")]
pub use rustls_provider::RustlsProvider;

#[cfg(feature = "tls")]
mod rustls_provider {
    use super::*;

    use std::io::{Cursor, Read, Write};
    use std::sync::Arc;

    use crate::error::Error;

    use bytes::BytesMut;
    use rustls::pki_types::ServerName;
    use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig,
        ServerConnection};
    use tracing::debug;

    /// rustls-backed [`TlsProvider`].
    pub struct RustlsProvider {
        client_config: Option<Arc<ClientConfig>>,
        server_config: Option<Arc<ServerConfig>>,
    }

    impl RustlsProvider {
        /// Build from pre-configured rustls configs. The caller loads
        /// certificates, roots, and ALPN lists.
        pub fn new(
            client_config: Option<Arc<ClientConfig>>,
            server_config: Option<Arc<ServerConfig>>,
        ) -> Self {
            RustlsProvider {
                client_config,
                server_config,
            }
        }

        /// Client-only provider trusting the bundled webpki roots.
        pub fn client_with_webpki_roots() -> Self {
            let roots =
                RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            RustlsProvider {
                client_config: Some(Arc::new(config)),
                server_config: None,
            }
        }
    }

    impl TlsProvider for RustlsProvider {
        fn new_client(&self, server_name: &str) -> Result<Box<dyn TlsSession>> {
            let config = self.client_config.clone().ok_or(Error::NotSupported)?;
            let name =
                ServerName::try_from(server_name.to_owned()).map_err(|_| Error::InvalidParam)?;
            let conn = ClientConnection::new(config, name).map_err(|e| {
                debug!("client session setup failed: {e}");
                Error::SslError
            })?;
            Ok(Box::new(RustlsSession::new(Connection::Client(conn))))
        }

        fn new_server(&self) -> Result<Box<dyn TlsSession>> {
            let config = self.server_config.clone().ok_or(Error::NotSupported)?;
            let conn = ServerConnection::new(config).map_err(|e| {
                debug!("server session setup failed: {e}");
                Error::SslError
            })?;
            Ok(Box::new(RustlsSession::new(Connection::Server(conn))))
        }
    }

    /// Buffered sans-IO wrapper around a rustls connection.
    struct RustlsSession {
        conn: Connection,
        /// Ciphertext queued for the wire.
        outgoing: BytesMut,
        outgoing_pos: usize,
        /// Decrypted application data not yet claimed by the socket.
        plaintext: BytesMut,
        peer_closed: bool,
    }

    impl RustlsSession {
        fn new(conn: Connection) -> Self {
            let mut session = RustlsSession {
                conn,
                outgoing: BytesMut::with_capacity(16384),
                outgoing_pos: 0,
                plaintext: BytesMut::with_capacity(16384),
                peer_closed: false,
            };
            // A client has its hello ready immediately.
            let _ = session.flush_tls_output();
            session
        }

        fn flush_tls_output(&mut self) -> Result<()> {
            while self.conn.wants_write() {
                let mut buf = Vec::with_capacity(4096);
                match self.conn.write_tls(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => self.outgoing.extend_from_slice(&buf),
                    Err(_) => return Err(Error::SslError),
                }
            }
            Ok(())
        }

        fn process(&mut self) -> Result<()> {
            let state = self.conn.process_new_packets().map_err(|e| {
                debug!("record processing failed: {e}");
                Error::SslError
            })?;
            let to_read = state.plaintext_bytes_to_read();
            if to_read > 0 {
                let mut buf = vec![0u8; to_read];
                let n = self
                    .conn
                    .reader()
                    .read(&mut buf)
                    .map_err(|_| Error::SslError)?;
                self.plaintext.extend_from_slice(&buf[..n]);
            }
            if state.peer_has_closed() {
                self.peer_closed = true;
            }
            self.flush_tls_output()
        }
    }

    impl TlsSession for RustlsSession {
        fn handshake(&mut self) -> Result<HandshakeState> {
            self.flush_tls_output()?;
            if !self.outgoing[self.outgoing_pos..].is_empty() {
                return Ok(HandshakeState::WantWrite);
            }
            if self.conn.is_handshaking() {
                return Ok(HandshakeState::WantRead);
            }
            Ok(HandshakeState::Done)
        }

        fn is_handshaking(&self) -> bool {
            self.conn.is_handshaking()
        }

        fn read_ciphertext(&mut self, data: &[u8]) -> Result<usize> {
            let mut cursor = Cursor::new(data);
            let mut consumed = 0;
            while (consumed as usize) < data.len() {
                match self.conn.read_tls(&mut cursor) {
                    Ok(0) => break,
                    Ok(n) => {
                        consumed += n as u64;
                        self.process()?;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(_) => return Err(Error::SslError),
                }
            }
            Ok(consumed as usize)
        }

        fn read_plaintext(&mut self, buf: &mut [u8]) -> Result<usize> {
            if self.plaintext.is_empty() {
                if self.peer_closed {
                    return Ok(0);
                }
                return Err(Error::Again);
            }
            let n = buf.len().min(self.plaintext.len());
            buf[..n].copy_from_slice(&self.plaintext[..n]);
            let _ = self.plaintext.split_to(n);
            Ok(n)
        }

        fn write_plaintext(&mut self, data: &[u8]) -> Result<usize> {
            if self.conn.is_handshaking() {
                return Err(Error::InvalidState);
            }
            let n = self
                .conn
                .writer()
                .write(data)
                .map_err(|_| Error::SslError)?;
            self.flush_tls_output()?;
            Ok(n)
        }

        fn pending_ciphertext(&self) -> &[u8] {
            &self.outgoing[self.outgoing_pos..]
        }

        fn advance_ciphertext(&mut self, n: usize) {
            self.outgoing_pos += n;
            if self.outgoing_pos >= self.outgoing.len() {
                self.outgoing.clear();
                self.outgoing_pos = 0;
            }
        }

        fn shutdown(&mut self) {
            self.conn.send_close_notify();
            let _ = self.flush_tls_output();
        }

        fn alpn_selected(&self) -> Option<&[u8]> {
            self.conn.alpn_protocol()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn client_session() -> Box<dyn TlsSession> {
            RustlsProvider::client_with_webpki_roots()
                .new_client("example.com")
                .unwrap()
        }

        #[test]
        fn client_starts_with_hello_pending() {
            let mut session = client_session();
            assert!(session.is_handshaking());
            assert_eq!(session.handshake().unwrap(), HandshakeState::WantWrite);
            assert!(!session.pending_ciphertext().is_empty());
        }

        #[test]
        fn advancing_all_ciphertext_wants_read() {
            let mut session = client_session();
            let n = session.pending_ciphertext().len();
            session.advance_ciphertext(n);
            assert_eq!(session.handshake().unwrap(), HandshakeState::WantRead);
        }

        #[test]
        fn garbage_ciphertext_is_ssl_error() {
            let mut session = client_session();
            let n = session.pending_ciphertext().len();
            session.advance_ciphertext(n);
            let result = session.read_ciphertext(b"this is not a tls record at all");
            assert_eq!(result, Err(Error::SslError));
        }

        #[test]
        fn plaintext_before_handshake_is_invalid_state() {
            let mut session = client_session();
            assert_eq!(session.write_plaintext(b"hi"), Err(Error::InvalidState));
            let mut buf = [0u8; 16];
            assert_eq!(session.read_plaintext(&mut buf), Err(Error::Again));
        }

        #[test]
        fn no_alpn_before_negotiation() {
            let session = client_session();
            assert!(session.alpn_selected().is_none());
        }

        #[test]
        fn provider_without_server_config_refuses_server_role() {
            let provider = RustlsProvider::client_with_webpki_roots();
            assert!(matches!(provider.new_server(), Err(Error::NotSupported)));
        }
    }
}
