//! A single connection to a database node: TCP/TLS setup, the protocol
//! handshake, and dispatch of multiplexed responses to pending requests.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error, trace, warn};

use strata_cql::frame::frame_errors::FrameError;
use strata_cql::frame::request::{startup, Options, SerializableRequest, Startup};
use strata_cql::frame::response::{self, result, Response, ResponseOpcode, Supported};
use strata_cql::frame::{
    decompress_body, Compression, FrameDecoder, ResponseFrame, SerializedRequest,
    DEFAULT_MAX_BODY_LENGTH,
};

use crate::errors::{ConnectionError, RequestError};
use crate::network::stream_storage::StreamStorage;
use crate::network::tls::SharedTlsContext;
use crate::network::Host;

/// Identifies a connection within its owning event loop.
pub(crate) type ConnectionId = usize;

/// The loop-side half of a pending request future.
pub type ResponseHandler = oneshot::Sender<Result<Response, RequestError>>;

/// Connection lifecycle. States only ever move forward; `Disconnected` is
/// terminal.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    New,
    Connected,
    Handshake,
    Supported,
    Ready,
    Disconnecting,
    Disconnected,
}

/// Configuration used for new connections.
#[derive(Clone)]
pub struct ConnectionConfig {
    pub compression: Option<Compression>,
    pub cql_version: String,
    pub tcp_nodelay: bool,
    pub connect_timeout: Duration,
    /// Upper bound on the body length of a received frame.
    pub max_frame_length: usize,
    pub tls_context: Option<SharedTlsContext>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            compression: None,
            cql_version: startup::DEFAULT_CQL_VERSION.to_string(),
            tcp_nodelay: true,
            connect_timeout: Duration::from_secs(5),
            max_frame_length: DEFAULT_MAX_BODY_LENGTH,
            tls_context: None,
        }
    }
}

/// Observer channels a connection reports into. Every field is optional;
/// an absent observer simply drops the notification.
#[derive(Default)]
pub struct ConnectionEvents {
    /// Resolved exactly once: `Ok` on reaching `Ready`, `Err` when setup
    /// fails or the connection is closed before becoming ready.
    pub connected: Option<oneshot::Sender<Result<(), ConnectionError>>>,
    /// Pinged every time a pending request resolves.
    pub request_finished: Option<mpsc::UnboundedSender<()>>,
    /// Keyspace name from every RESULT::SetKeyspace.
    pub keyspace_changed: Option<mpsc::UnboundedSender<String>>,
    /// Prepared statement id from every RESULT::Prepared.
    pub prepared: Option<mpsc::UnboundedSender<Bytes>>,
    /// Raw frames carrying a negative stream id (server-initiated events).
    pub server_events: Option<mpsc::UnboundedSender<ResponseFrame>>,
}

pub(crate) struct Connection {
    id: ConnectionId,
    host: Host,
    config: ConnectionConfig,
    state: Cell<ConnectionState>,
    streams: RefCell<StreamStorage<ResponseHandler>>,
    decoder: RefCell<FrameDecoder>,
    tls: RefCell<Option<Box<dyn crate::network::tls::TlsSession>>>,
    tls_handshake_done: Cell<bool>,
    /// Compression in effect once STARTUP has been sent.
    negotiated_compression: Cell<Option<Compression>>,
    /// The server's SUPPORTED option map, recorded during the handshake.
    supported_options: RefCell<Option<HashMap<String, Vec<String>>>>,
    /// Outgoing bytes staged until the writer future flushes them with a
    /// single write.
    write_buf: RefCell<BytesMut>,
    write_ready: Notify,
    closed: Notify,
    events: RefCell<ConnectionEvents>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        host: Host,
        config: ConnectionConfig,
        events: ConnectionEvents,
    ) -> Rc<Connection> {
        let decoder = FrameDecoder::with_max_body_length(config.max_frame_length);
        Rc::new(Connection {
            id,
            host,
            config,
            state: Cell::new(ConnectionState::New),
            streams: RefCell::new(StreamStorage::new()),
            decoder: RefCell::new(decoder),
            tls: RefCell::new(None),
            tls_handshake_done: Cell::new(false),
            negotiated_compression: Cell::new(None),
            supported_options: RefCell::new(None),
            write_buf: RefCell::new(BytesMut::new()),
            write_ready: Notify::new(),
            closed: Notify::new(),
            events: RefCell::new(events),
        })
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Task driving the connection from `New` to `Disconnected`.
    pub(crate) async fn run(self: Rc<Self>) {
        match self.drive().await {
            Ok(()) => {}
            Err(err) => {
                debug!(host = %self.host, error = %err, "connection terminated");
                self.close_with(Some(err));
            }
        }
        self.state.set(ConnectionState::Disconnected);
        trace!(host = %self.host, "connection released");
    }

    async fn drive(&self) -> Result<(), ConnectionError> {
        let stream = self.connect_tcp().await?;
        if self.state.get() >= ConnectionState::Disconnecting {
            // Closed while the TCP connect was in flight; states never
            // move backwards.
            return Ok(());
        }
        self.state.set(ConnectionState::Connected);
        debug!(host = %self.host, "connected");

        if let Some(tls_context) = &self.config.tls_context {
            let session = tls_context.new_session(&self.host)?;
            *self.tls.borrow_mut() = Some(session);
        }

        let (read_half, write_half) = stream.into_split();

        // Connected: with TLS, make the engine emit its first record;
        // without, go straight to the protocol handshake.
        self.advance()?;

        tokio::select! {
            read = self.read_pump(read_half) => read,
            write = self.write_pump(write_half) => write,
        }
    }

    async fn connect_tcp(&self) -> Result<TcpStream, ConnectionError> {
        let address = self.host.address();
        let socket = match address {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        let stream = match tokio::time::timeout(self.config.connect_timeout, socket.connect(address))
            .await
        {
            Ok(stream) => stream?,
            Err(_) => return Err(ConnectionError::ConnectTimeout),
        };
        stream.set_nodelay(self.config.tcp_nodelay)?;
        Ok(stream)
    }

    /// Single pump advancing the state machine: each call performs the
    /// action prescribed for the current state.
    fn advance(&self) -> Result<(), ConnectionError> {
        match self.state.get() {
            ConnectionState::Connected => {
                let first_records = {
                    let mut tls_guard = self.tls.borrow_mut();
                    match tls_guard.as_mut() {
                        Some(session) => Some(session.read_write(&[], &[])?.ciphertext),
                        None => None,
                    }
                };
                match first_records {
                    Some(ciphertext) => {
                        // Stay in Connected until the engine reports a
                        // finished handshake; see on_read.
                        if !ciphertext.is_empty() {
                            self.write_buf.borrow_mut().extend_from_slice(&ciphertext);
                            self.schedule_flush();
                        }
                        Ok(())
                    }
                    None => {
                        self.state.set(ConnectionState::Handshake);
                        self.advance()
                    }
                }
            }
            ConnectionState::Handshake => self.send_options(),
            ConnectionState::Supported => self.send_startup(),
            ConnectionState::Ready => {
                self.notify_ready();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn send_options(&self) -> Result<(), ConnectionError> {
        debug!(host = %self.host, "sending OPTIONS");
        self.send_handshake_frame(&Options)
    }

    fn send_startup(&self) -> Result<(), ConnectionError> {
        debug!(
            host = %self.host,
            version = %self.config.cql_version,
            compression = ?self.config.compression,
            "sending STARTUP"
        );
        let request = Startup::for_handshake(&self.config.cql_version, self.config.compression);
        self.send_handshake_frame(&request)
    }

    /// Handshake requests are fire-and-forget: sent on stream 0 with no
    /// stream reservation, since their responses are dispatched by state
    /// rather than by stream id.
    fn send_handshake_frame<R: SerializableRequest>(
        &self,
        request: &R,
    ) -> Result<(), ConnectionError> {
        // The handshake itself is never compressed; compression applies
        // from the first post-STARTUP frame.
        let frame = SerializedRequest::make(request, None)?;
        self.stage_write(frame.get_data())?;
        self.schedule_flush();
        Ok(())
    }

    /// Write path for a request submitted through the queue: reserves a
    /// stream, patches it into the frame and stages the bytes for the next
    /// socket flush. Returns whether anything was staged.
    pub(crate) fn execute(&self, mut request: SerializedRequest, handler: ResponseHandler) -> bool {
        if self.state.get() != ConnectionState::Ready {
            let _ = handler.send(Err(RequestError::ConnectionClosed));
            return false;
        }

        let stream_id = match self.streams.borrow_mut().set_stream(handler) {
            Ok(stream_id) => stream_id,
            Err(handler) => {
                error!(host = %self.host, "no stream ids available");
                let _ = handler.send(Err(RequestError::NoStreamsAvailable));
                return false;
            }
        };

        request.set_stream(stream_id);
        trace!(host = %self.host, stream = stream_id, "sending request");

        if let Err(err) = self.stage_write(request.get_data()) {
            // A failure on the write side is fatal for the connection, not
            // just for this request.
            if let Some(handler) = self.streams.borrow_mut().get_stream(stream_id) {
                let _ = handler.send(Err(RequestError::ConnectionClosed));
            }
            self.close_with(Some(err));
            return false;
        }
        true
    }

    /// Stages `data` for the writer future, encrypting it first when TLS
    /// is enabled.
    fn stage_write(&self, data: &[u8]) -> Result<(), ConnectionError> {
        let encrypted = {
            let mut tls_guard = self.tls.borrow_mut();
            match tls_guard.as_mut() {
                Some(session) => Some(session.read_write(&[], data)?.ciphertext),
                None => None,
            }
        };
        match encrypted {
            Some(ciphertext) => {
                self.write_buf.borrow_mut().extend_from_slice(&ciphertext);
            }
            None => {
                self.write_buf.borrow_mut().extend_from_slice(data);
            }
        }
        Ok(())
    }

    /// Wakes the writer future; everything staged since the last flush
    /// goes out in a single write.
    pub(crate) fn schedule_flush(&self) {
        self.write_ready.notify_one();
    }

    async fn read_pump(&self, mut read_half: OwnedReadHalf) -> Result<(), ConnectionError> {
        let mut buf = BytesMut::with_capacity(8192);
        loop {
            if self.state.get() >= ConnectionState::Disconnecting {
                return Ok(());
            }
            buf.clear();
            let n = tokio::select! {
                read = read_half.read_buf(&mut buf) => read?,
                _ = self.closed.notified() => return Ok(()),
            };
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "server closed the connection",
                )
                .into());
            }
            self.on_read(&buf[..n])?;
        }
    }

    async fn write_pump(&self, mut write_half: OwnedWriteHalf) -> Result<(), ConnectionError> {
        loop {
            if self.state.get() >= ConnectionState::Disconnecting {
                return Ok(());
            }
            tokio::select! {
                _ = self.write_ready.notified() => {}
                _ = self.closed.notified() => return Ok(()),
            }
            loop {
                let staged = self.write_buf.borrow_mut().split();
                if staged.is_empty() {
                    break;
                }
                trace!(host = %self.host, bytes = staged.len(), "flushing staged writes");
                write_half.write_all(&staged).await?;
            }
            write_half.flush().await?;
        }
    }

    /// Feeds freshly read socket bytes through TLS (when enabled) and the
    /// frame decoder, dispatching every completed frame.
    fn on_read(&self, input: &[u8]) -> Result<(), ConnectionError> {
        if self.tls.borrow().is_none() {
            return self.consume(input);
        }

        let mut remaining = input;
        while !remaining.is_empty() {
            let progress = {
                let mut tls_guard = self.tls.borrow_mut();
                match tls_guard.as_mut() {
                    Some(session) => session.read_write(remaining, &[])?,
                    None => return self.consume(remaining),
                }
            };

            if !progress.ciphertext.is_empty() {
                self.write_buf
                    .borrow_mut()
                    .extend_from_slice(&progress.ciphertext);
                self.schedule_flush();
            }
            if !progress.plaintext.is_empty() {
                self.consume(&progress.plaintext)?;
            }
            if !self.tls_handshake_done.get() {
                let done = self
                    .tls
                    .borrow()
                    .as_ref()
                    .map(|session| session.handshake_done())
                    .unwrap_or(false);
                if done {
                    self.tls_handshake_done.set(true);
                    debug!(host = %self.host, "TLS handshake complete");
                    if self.state.get() == ConnectionState::Connected {
                        self.state.set(ConnectionState::Handshake);
                        self.advance()?;
                    }
                }
            }

            if progress.consumed == 0 && progress.plaintext.is_empty() {
                return Err(crate::network::tls::TlsError::Fatal(
                    "TLS engine made no progress on buffered input".to_string(),
                )
                .into());
            }
            remaining = &remaining[progress.consumed..];
        }
        Ok(())
    }

    /// Runs the incremental decoder over `input`, dispatching every
    /// completed frame.
    fn consume(&self, input: &[u8]) -> Result<(), ConnectionError> {
        let mut remaining = input;
        while !remaining.is_empty() {
            let consumed = self.decoder.borrow_mut().consume(remaining)?;
            remaining = &remaining[consumed..];
            let frame = self.decoder.borrow_mut().take_frame();
            if let Some(frame) = frame {
                self.dispatch(frame)?;
            }
        }
        Ok(())
    }

    fn dispatch(&self, frame: ResponseFrame) -> Result<(), ConnectionError> {
        trace!(
            host = %self.host,
            opcode = ?frame.opcode,
            stream = frame.params.stream,
            "frame received"
        );

        if frame.params.stream < 0 {
            // Server-initiated event; routed to the collaborator hook.
            if let Some(sender) = &self.events.borrow().server_events {
                let _ = sender.send(frame);
            }
            return Ok(());
        }

        let body = decompress_body(
            frame.params.flags,
            self.negotiated_compression.get(),
            frame.body,
        )?;

        match (self.state.get(), frame.opcode) {
            (ConnectionState::Handshake, ResponseOpcode::Supported) => self.on_supported(&body),
            (ConnectionState::Supported, ResponseOpcode::Ready) => self.on_ready(),
            (
                ConnectionState::Handshake | ConnectionState::Supported,
                ResponseOpcode::Error,
            ) => self.on_handshake_error(&body),
            (ConnectionState::Ready, ResponseOpcode::Result) => {
                self.on_result(frame.params.stream, &body)
            }
            (ConnectionState::Ready, ResponseOpcode::Error) => {
                self.on_request_error(frame.params.stream, &body)
            }
            (state, opcode) => Err(ConnectionError::UnexpectedFrame { opcode, state }),
        }
    }

    fn on_supported(&self, body: &[u8]) -> Result<(), ConnectionError> {
        let supported = Supported::deserialize(&mut &body[..])
            .map_err(|err| FrameError::Parse(err.into()))?;
        debug!(
            host = %self.host,
            options = supported.options.len(),
            "server options received"
        );

        if let Some(compression) = self.config.compression {
            let algorithm = compression.to_string();
            let advertised = supported
                .options
                .get("COMPRESSION")
                .map(|algorithms| algorithms.iter().any(|a| *a == algorithm))
                .unwrap_or(false);
            if !advertised {
                warn!(
                    host = %self.host,
                    %compression,
                    "server does not advertise the configured compression; requesting it anyway"
                );
            }
        }

        *self.supported_options.borrow_mut() = Some(supported.options);
        self.state.set(ConnectionState::Supported);
        self.negotiated_compression.set(self.config.compression);
        self.advance()
    }

    fn on_ready(&self) -> Result<(), ConnectionError> {
        self.state.set(ConnectionState::Ready);
        self.advance()
    }

    fn notify_ready(&self) {
        let server_options = self
            .supported_options
            .borrow()
            .as_ref()
            .map(|options| options.len())
            .unwrap_or(0);
        debug!(
            host = %self.host,
            server_options,
            compression = ?self.negotiated_compression.get(),
            "connection ready"
        );
        if let Some(connected) = self.events.borrow_mut().connected.take() {
            let _ = connected.send(Ok(()));
        }
    }

    fn on_handshake_error(&self, body: &[u8]) -> Result<(), ConnectionError> {
        let err = response::Error::deserialize(&mut &body[..])
            .map_err(|err| FrameError::Parse(err.into()))?;
        warn!(
            host = %self.host,
            code = err.code,
            reason = %err.reason,
            "server rejected connection setup"
        );
        Err(ConnectionError::Db {
            code: err.code,
            reason: err.reason,
        })
    }

    fn on_result(&self, stream: i8, body: &[u8]) -> Result<(), ConnectionError> {
        let result =
            result::deserialize(&mut &body[..]).map_err(|err| FrameError::Parse(err.into()))?;

        match &result {
            result::Result::SetKeyspace(set_keyspace) => {
                if let Some(sender) = &self.events.borrow().keyspace_changed {
                    let _ = sender.send(set_keyspace.keyspace_name.clone());
                }
            }
            result::Result::Prepared(prepared) => {
                if let Some(sender) = &self.events.borrow().prepared {
                    let _ = sender.send(prepared.id.clone());
                }
            }
            _ => {}
        }

        self.resolve_stream(stream, Ok(Response::Result(result)))
    }

    fn on_request_error(&self, stream: i8, body: &[u8]) -> Result<(), ConnectionError> {
        let err = response::Error::deserialize(&mut &body[..])
            .map_err(|err| FrameError::Parse(err.into()))?;
        self.resolve_stream(
            stream,
            Err(RequestError::Db {
                code: err.code,
                reason: err.reason,
            }),
        )
    }

    fn resolve_stream(
        &self,
        stream: i8,
        outcome: Result<Response, RequestError>,
    ) -> Result<(), ConnectionError> {
        match self.streams.borrow_mut().get_stream(stream) {
            Some(handler) => {
                // The receiving side may have given up waiting; that is
                // not an error here.
                let _ = handler.send(outcome);
                if let Some(sender) = &self.events.borrow().request_finished {
                    let _ = sender.send(());
                }
                Ok(())
            }
            None => {
                debug!(host = %self.host, stream, "response for a stream with no pending request");
                Err(ConnectionError::UnexpectedStreamId(stream))
            }
        }
    }

    /// Local close; pending requests resolve with `ConnectionClosed`.
    pub(crate) fn close(&self) {
        self.close_with(None);
    }

    fn close_with(&self, error: Option<ConnectionError>) {
        if self.state.get() >= ConnectionState::Disconnecting {
            return;
        }
        debug!(host = %self.host, error = ?error, "disconnecting");
        let pre_ready = self.state.get() < ConnectionState::Ready;
        self.state.set(ConnectionState::Disconnecting);

        let pending = self.streams.borrow_mut().drain();
        let mut failed = 0usize;
        for (_, handler) in pending {
            let _ = handler.send(Err(RequestError::ConnectionClosed));
            failed += 1;
        }
        if failed > 0 {
            warn!(host = %self.host, pending = failed, "failed pending requests on close");
        }

        if pre_ready {
            if let Some(connected) = self.events.borrow_mut().connected.take() {
                let _ = connected.send(Err(error.unwrap_or(ConnectionError::Closed)));
            }
        }

        self.closed.notify_waiters();
    }
}
