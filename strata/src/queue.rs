//! Request queues that coalesce flushes to reduce the number of loop
//! wakeups and system calls required to process requests.
//!
//! Submitter threads push `(connection, request)` items into the bounded
//! MPMC ring of the queue owned by the connection's event loop. The first
//! producer after an idle period claims the signalling right with a
//! compare-and-swap on `is_flushing` and wakes the loop; everyone else
//! piggybacks on the flush already in flight. The loop-side flush handler
//! drains a batch, hands each item to its connection's write path, and
//! then triggers one socket flush per touched connection.

use std::collections::HashSet;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use tokio::sync::Notify;
use tracing::{debug, trace};

use strata_cql::frame::SerializedRequest;

use crate::errors::RequestError;
use crate::eventloop::{ConnectionHandle, EventLoopGroup, LoopCommand, LoopState};
use crate::network::connection::{ConnectionId, ResponseHandler};

/// How many consecutive flushes without writes keep the back-off timer
/// armed before the queue parks on its wakeup.
const FLUSH_BACKOFF_THRESHOLD: u32 = 4;
/// Delay between back-off flush attempts.
const FLUSH_BACKOFF_INTERVAL: Duration = Duration::from_millis(1);

struct Item {
    connection: ConnectionId,
    request: SerializedRequest,
    handler: ResponseHandler,
}

/// A bounded MPMC request queue bound to one event loop.
pub struct RequestQueue {
    loop_index: usize,
    ring: ArrayQueue<Item>,
    /// A wakeup is in flight or the flush handler is running.
    is_flushing: AtomicBool,
    /// No further writes will be accepted.
    is_closing: AtomicBool,
    wakeup: Notify,
    /// Wakeup signals actually delivered to the loop; lets the coalescing
    /// behavior be observed.
    wakeups: AtomicU64,
}

impl RequestQueue {
    fn new(loop_index: usize, capacity: usize) -> Arc<RequestQueue> {
        Arc::new(RequestQueue {
            loop_index,
            ring: ArrayQueue::new(capacity),
            is_flushing: AtomicBool::new(false),
            is_closing: AtomicBool::new(false),
            wakeup: Notify::new(),
            wakeups: AtomicU64::new(0),
        })
    }

    /// Queues a request to be written on `connection` (thread-safe).
    ///
    /// Returns false when the ring is full or the queue is closing; the
    /// caller applies backpressure.
    pub fn write(
        &self,
        connection: &ConnectionHandle,
        request: SerializedRequest,
        handler: ResponseHandler,
    ) -> bool {
        debug_assert_eq!(
            connection.event_loop(),
            self.loop_index,
            "connection belongs to a different event loop"
        );
        if self.is_closing.load(Ordering::Acquire) {
            return false;
        }

        let item = Item {
            connection: connection.id(),
            request,
            handler,
        };
        if self.ring.push(item).is_err() {
            return false;
        }

        // The first producer after an idle period claims the signalling
        // right; producers that observe `is_flushing` leave the wakeup to
        // the flush cycle already in flight.
        if !self.is_flushing.swap(true, Ordering::AcqRel) {
            self.signal();
        }
        true
    }

    /// Marks the queue as closing and wakes the loop so the flusher can
    /// tear down (thread-safe).
    pub fn close_handles(&self) {
        self.is_closing.store(true, Ordering::Release);
        self.signal();
    }

    /// How many wakeup signals have been delivered so far.
    pub fn wakeup_count(&self) -> u64 {
        self.wakeups.load(Ordering::Relaxed)
    }

    fn signal(&self) {
        self.wakeups.fetch_add(1, Ordering::Relaxed);
        self.wakeup.notify_one();
    }

    /// Flush task; runs on the owning event loop.
    pub(crate) async fn flusher(self: Arc<Self>, state: Rc<LoopState>) {
        loop {
            self.wakeup.notified().await;
            if self.is_closing.load(Ordering::Acquire) {
                break;
            }

            // One wakeup services a whole burst; this inner loop exits
            // only once `is_flushing` has been released.
            let mut flushes_without_writes: u32 = 0;
            loop {
                let writes = self.handle_flush(&state);
                if writes > 0 {
                    flushes_without_writes = 0;
                    self.is_flushing.store(false, Ordering::Release);
                    // A producer that observed `is_flushing` has not
                    // signalled; re-claim and drain again if items slipped
                    // in behind the batch.
                    if !self.ring.is_empty() && !self.is_flushing.swap(true, Ordering::AcqRel) {
                        continue;
                    }
                    break;
                }

                flushes_without_writes += 1;
                if flushes_without_writes < FLUSH_BACKOFF_THRESHOLD {
                    // Absorb tight producer bursts on the timer instead of
                    // paying one wakeup per item.
                    tokio::time::sleep(FLUSH_BACKOFF_INTERVAL).await;
                    if self.is_closing.load(Ordering::Acquire) {
                        self.drain_on_close();
                        return;
                    }
                    continue;
                }
                self.is_flushing.store(false, Ordering::Release);
                break;
            }
        }
        self.drain_on_close();
    }

    /// Drains one batch on the loop thread, then triggers a single socket
    /// flush per touched connection. Returns how many requests were staged.
    fn handle_flush(&self, state: &Rc<LoopState>) -> usize {
        let mut touched: HashSet<ConnectionId> = HashSet::new();
        let mut writes = 0usize;

        // Bound one pass by the ring capacity so a hot producer cannot
        // starve the rest of the loop.
        for _ in 0..self.ring.capacity() {
            let item = match self.ring.pop() {
                Some(item) => item,
                None => break,
            };
            match state.connection(item.connection) {
                Some(connection) => {
                    if connection.execute(item.request, item.handler) {
                        writes += 1;
                        touched.insert(item.connection);
                    }
                }
                None => {
                    let _ = item.handler.send(Err(RequestError::ConnectionClosed));
                }
            }
        }

        for id in &touched {
            if let Some(connection) = state.connection(*id) {
                connection.schedule_flush();
            }
        }
        if writes > 0 {
            trace!(
                loop_index = self.loop_index,
                requests = writes,
                connections = touched.len(),
                "flushed request batch"
            );
        }
        writes
    }

    fn drain_on_close(&self) {
        let mut dropped = 0usize;
        while let Some(item) = self.ring.pop() {
            let _ = item.handler.send(Err(RequestError::ConnectionClosed));
            dropped += 1;
        }
        if dropped > 0 {
            debug!(
                loop_index = self.loop_index,
                dropped, "request queue closed with queued items"
            );
        }
    }
}

/// Maps every event loop in a group to its request queue.
///
/// Queues are allocated once at initialization and never resized; lookup
/// is by loop index. Lives as long as the group it was built from.
pub struct RequestQueueManager {
    queues: Box<[Arc<RequestQueue>]>,
}

impl RequestQueueManager {
    /// Creates one queue of `queue_size` items per loop in `group` and
    /// installs its flush task on that loop.
    pub fn new(group: &EventLoopGroup, queue_size: usize) -> RequestQueueManager {
        let mut queues = Vec::with_capacity(group.len());
        for index in 0..group.len() {
            let queue = RequestQueue::new(index, queue_size);
            let flusher_queue = queue.clone();
            group
                .event_loop(index)
                .send(LoopCommand::Run(Box::new(move |state| {
                    tokio::task::spawn_local(flusher_queue.flusher(state));
                })));
            queues.push(queue);
        }
        RequestQueueManager {
            queues: queues.into_boxed_slice(),
        }
    }

    /// The request queue serving the given event loop.
    pub fn get(&self, loop_index: usize) -> &Arc<RequestQueue> {
        &self.queues[loop_index]
    }

    /// Routes a request to the queue owned by the connection's loop.
    pub fn write(
        &self,
        connection: &ConnectionHandle,
        request: SerializedRequest,
        handler: ResponseHandler,
    ) -> bool {
        self.queues[connection.event_loop()].write(connection, request, handler)
    }

    /// Closes every queue (thread-safe).
    pub fn close_handles(&self) {
        for queue in self.queues.iter() {
            queue.close_handles();
        }
    }
}
