//! Event loop threads that own connections.
//!
//! Each loop is an OS thread running a current-thread tokio runtime with a
//! `LocalSet`. A connection is created on one loop, lives there until it
//! is `Disconnected`, and is never touched from another thread; submitter
//! threads hold only a [ConnectionHandle] and reach the connection through
//! its loop's request queue.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use crate::errors::ConnectionError;
use crate::network::connection::{Connection, ConnectionConfig, ConnectionEvents, ConnectionId};
use crate::network::Host;

/// State owned by a single loop thread. Connections never leave it.
pub(crate) struct LoopState {
    next_connection_id: Cell<ConnectionId>,
    connections: RefCell<HashMap<ConnectionId, Rc<Connection>>>,
}

impl LoopState {
    fn new() -> Rc<LoopState> {
        Rc::new(LoopState {
            next_connection_id: Cell::new(0),
            connections: RefCell::new(HashMap::new()),
        })
    }

    pub(crate) fn connection(&self, id: ConnectionId) -> Option<Rc<Connection>> {
        self.connections.borrow().get(&id).cloned()
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Rc<LoopState> {
        Self::new()
    }
}

type LoopTask = Box<dyn FnOnce(Rc<LoopState>) + Send>;

pub(crate) enum LoopCommand {
    Connect {
        host: Host,
        config: ConnectionConfig,
        events: ConnectionEvents,
        reply: oneshot::Sender<ConnectionId>,
    },
    CloseConnection(ConnectionId),
    /// Runs a closure on the loop thread; used to install per-loop tasks
    /// such as a request queue's flusher.
    Run(LoopTask),
    Shutdown,
}

/// Handle to one event loop thread.
pub struct EventLoop {
    index: usize,
    commands: mpsc::UnboundedSender<LoopCommand>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoop {
    fn spawn(index: usize) -> std::io::Result<EventLoop> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let thread = std::thread::Builder::new()
            .name(format!("strata-loop-{index}"))
            .spawn(move || run_loop(index, receiver))?;
        Ok(EventLoop {
            index,
            commands,
            thread: Some(thread),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn send(&self, command: LoopCommand) -> bool {
        self.commands.send(command).is_ok()
    }
}

fn run_loop(index: usize, mut receiver: mpsc::UnboundedReceiver<LoopCommand>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(index, error = %err, "failed to build event loop runtime");
            return;
        }
    };
    let local = tokio::task::LocalSet::new();
    let state = LoopState::new();

    local.block_on(&runtime, async {
        while let Some(command) = receiver.recv().await {
            match command {
                LoopCommand::Connect {
                    host,
                    config,
                    events,
                    reply,
                } => {
                    let id = state.next_connection_id.get();
                    state.next_connection_id.set(id + 1);
                    let connection = Connection::new(id, host, config, events);
                    state
                        .connections
                        .borrow_mut()
                        .insert(connection.id(), connection.clone());

                    let task_state = state.clone();
                    tokio::task::spawn_local(async move {
                        connection.run().await;
                        task_state.connections.borrow_mut().remove(&id);
                    });
                    let _ = reply.send(id);
                }
                LoopCommand::CloseConnection(id) => {
                    if let Some(connection) = state.connection(id) {
                        trace!(index, id, state = ?connection.state(), "closing connection");
                        connection.close();
                    }
                }
                LoopCommand::Run(task) => task(state.clone()),
                LoopCommand::Shutdown => break,
            }
        }

        // Close whatever is still alive; close() resolves their pending
        // requests before the runtime goes away.
        let connections: Vec<_> = state.connections.borrow().values().cloned().collect();
        for connection in connections {
            connection.close();
        }
    });
    debug!(index, "event loop stopped");
}

/// A fixed-size group of event loops sharing the driver's connections.
pub struct EventLoopGroup {
    loops: Box<[EventLoop]>,
    next_loop: AtomicUsize,
}

impl EventLoopGroup {
    /// Spawns `size` event loop threads.
    pub fn new(size: usize) -> std::io::Result<EventLoopGroup> {
        assert!(size > 0, "an event loop group needs at least one loop");
        let mut loops = Vec::with_capacity(size);
        for index in 0..size {
            loops.push(EventLoop::spawn(index)?);
        }
        Ok(EventLoopGroup {
            loops: loops.into_boxed_slice(),
            next_loop: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub(crate) fn event_loop(&self, index: usize) -> &EventLoop {
        &self.loops[index]
    }

    /// Opens a connection on the next loop (round-robin). The returned
    /// handle is usable immediately; readiness and setup failures are
    /// reported through the `connected` observer.
    pub async fn connect(
        &self,
        host: Host,
        config: ConnectionConfig,
        events: ConnectionEvents,
    ) -> Result<ConnectionHandle, ConnectionError> {
        let index = self.next_loop.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        let event_loop = &self.loops[index];

        let (reply, response) = oneshot::channel();
        if !event_loop.send(LoopCommand::Connect {
            host,
            config,
            events,
            reply,
        }) {
            return Err(ConnectionError::EventLoopTerminated);
        }
        let id = response
            .await
            .map_err(|_| ConnectionError::EventLoopTerminated)?;

        Ok(ConnectionHandle {
            loop_index: index,
            id,
            commands: event_loop.commands.clone(),
        })
    }

    /// Stops every loop and joins their threads.
    pub fn shutdown(mut self) {
        self.shutdown_in_place();
    }

    fn shutdown_in_place(&mut self) {
        for event_loop in self.loops.iter() {
            let _ = event_loop.commands.send(LoopCommand::Shutdown);
        }
        for event_loop in self.loops.iter_mut() {
            if let Some(thread) = event_loop.thread.take() {
                if thread.join().is_err() {
                    warn!(index = event_loop.index, "event loop thread panicked");
                }
            }
        }
    }
}

impl Drop for EventLoopGroup {
    fn drop(&mut self) {
        self.shutdown_in_place();
    }
}

/// Opaque, thread-safe reference to a connection owned by an event loop.
///
/// Submitters never dereference the connection; the indices carried here
/// route queue items, and the owning loop resolves them back to the
/// connection object.
#[derive(Clone)]
pub struct ConnectionHandle {
    loop_index: usize,
    id: ConnectionId,
    commands: mpsc::UnboundedSender<LoopCommand>,
}

impl ConnectionHandle {
    /// Index of the event loop owning this connection.
    pub fn event_loop(&self) -> usize {
        self.loop_index
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    /// Requests an asynchronous close. Pending requests resolve with
    /// `ConnectionClosed`.
    pub fn close(&self) {
        let _ = self.commands.send(LoopCommand::CloseConnection(self.id));
    }

    #[cfg(test)]
    pub(crate) fn for_tests(loop_index: usize, id: ConnectionId) -> ConnectionHandle {
        let (commands, _receiver) = mpsc::unbounded_channel();
        ConnectionHandle {
            loop_index,
            id,
            commands,
        }
    }
}
