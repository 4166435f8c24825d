//! Error taxonomy of the driver core.

use thiserror::Error;

use strata_cql::frame::frame_errors::FrameError;
use strata_cql::frame::response::ResponseOpcode;

use crate::network::connection::ConnectionState;
use crate::network::tls::TlsError;

/// A fatal error that prevents a connection from being established or
/// breaks an established one. Every kind here closes the connection
/// unconditionally.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Connect timed out")]
    ConnectTimeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("Server rejected connection setup: code {code:#06x}: {reason}")]
    Db { code: i32, reason: String },
    #[error("Received unexpected {opcode:?} frame in connection state {state:?}")]
    UnexpectedFrame {
        opcode: ResponseOpcode,
        state: ConnectionState,
    },
    #[error("Received response with stream id {0} which has no pending request")]
    UnexpectedStreamId(i8),
    #[error("Connection was closed locally before setup completed")]
    Closed,
    #[error("The owning event loop has terminated")]
    EventLoopTerminated,
}

/// An error resolved into a pending request's future.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RequestError {
    #[error("Unable to allocate a stream id: all streams are in flight")]
    NoStreamsAvailable,
    #[error("Failed to serialize request: {0}")]
    Encode(#[from] FrameError),
    #[error("Connection was closed before the response arrived")]
    ConnectionClosed,
    #[error("Server error: code {code:#06x}: {reason}")]
    Db { code: i32, reason: String },
}
