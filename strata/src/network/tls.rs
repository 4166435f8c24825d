//! This module contains abstractions related to the TLS layer of driver
//! connections.
//!
//! The connection drives a [TlsSession] as a duplex byte transform:
//! ciphertext read from the socket goes in, decrypted plaintext comes out
//! for the frame codec, and any records the engine wants on the wire come
//! out as ciphertext for the socket writer. The engine owns no buffers of
//! the caller; all outputs are returned as owned byte ranges.

use std::sync::Arc;

use thiserror::Error;

use crate::network::Host;

/// Byte ranges produced by one turn of the TLS engine.
#[derive(Debug, Default)]
pub struct TlsProgress {
    /// How many bytes of the incoming ciphertext were consumed. Callers
    /// keep turning the engine until all input has been consumed.
    pub consumed: usize,
    /// Decrypted application data, ready for the frame codec.
    pub plaintext: Vec<u8>,
    /// Encrypted records that must be written to the socket.
    pub ciphertext: Vec<u8>,
}

/// A per-connection TLS engine.
pub trait TlsSession {
    /// Drives the duplex transform one step: feeds socket ciphertext and
    /// application plaintext in, takes decrypted plaintext and encrypted
    /// records out.
    fn read_write(&mut self, incoming: &[u8], outgoing: &[u8]) -> Result<TlsProgress, TlsError>;

    /// Whether the TLS handshake has completed. Driving an engine that has
    /// not yet handshaken with an empty read makes it emit its first
    /// outbound record.
    fn handshake_done(&self) -> bool;
}

/// Produces a fresh [TlsSession] for every connection.
pub trait TlsContext: Send + Sync {
    fn new_session(&self, host: &Host) -> Result<Box<dyn TlsSession>, TlsError>;
}

/// Shared, cheaply clonable handle to a [TlsContext].
pub type SharedTlsContext = Arc<dyn TlsContext>;

/// A wrapper around a TLS error.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TlsError {
    #[cfg(feature = "rustls-023")]
    #[error(transparent)]
    Rustls023(#[from] rustls::Error),
    /// The engine reported a fatal condition; the connection is closed.
    #[error("TLS session failed: {0}")]
    Fatal(String),
}

#[cfg(feature = "rustls-023")]
mod rustls_session {
    use std::io::{Read, Write};
    use std::sync::Arc;

    use rustls::pki_types::ServerName;

    use super::{TlsContext, TlsError, TlsProgress, TlsSession};
    use crate::network::Host;

    /// [TlsContext] backed by a shared rustls client configuration.
    pub struct RustlsContext {
        config: Arc<rustls::ClientConfig>,
    }

    impl RustlsContext {
        pub fn new(config: Arc<rustls::ClientConfig>) -> RustlsContext {
            RustlsContext { config }
        }
    }

    impl TlsContext for RustlsContext {
        fn new_session(&self, host: &Host) -> Result<Box<dyn TlsSession>, TlsError> {
            let server_name = ServerName::IpAddress(host.address().ip().into());
            let conn = rustls::ClientConnection::new(self.config.clone(), server_name)?;
            Ok(Box::new(RustlsSession { conn }))
        }
    }

    struct RustlsSession {
        conn: rustls::ClientConnection,
    }

    impl TlsSession for RustlsSession {
        fn read_write(
            &mut self,
            incoming: &[u8],
            outgoing: &[u8],
        ) -> Result<TlsProgress, TlsError> {
            if !outgoing.is_empty() {
                self.conn
                    .writer()
                    .write_all(outgoing)
                    .map_err(|err| TlsError::Fatal(err.to_string()))?;
            }

            let mut consumed = 0;
            let mut plaintext = Vec::new();
            if !incoming.is_empty() {
                let mut cursor = std::io::Cursor::new(incoming);
                while (cursor.position() as usize) < incoming.len() {
                    match self.conn.read_tls(&mut cursor) {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(err) => return Err(TlsError::Fatal(err.to_string())),
                    }
                }
                consumed = cursor.position() as usize;

                let state = self.conn.process_new_packets()?;
                let readable = state.plaintext_bytes_to_read();
                if readable > 0 {
                    plaintext.resize(readable, 0);
                    self.conn
                        .reader()
                        .read_exact(&mut plaintext)
                        .map_err(|err| TlsError::Fatal(err.to_string()))?;
                }
            }

            let mut ciphertext = Vec::new();
            while self.conn.wants_write() {
                self.conn
                    .write_tls(&mut ciphertext)
                    .map_err(|err| TlsError::Fatal(err.to_string()))?;
            }

            Ok(TlsProgress {
                consumed,
                plaintext,
                ciphertext,
            })
        }

        fn handshake_done(&self) -> bool {
            !self.conn.is_handshaking()
        }
    }
}

#[cfg(feature = "rustls-023")]
pub use rustls_session::RustlsContext;
