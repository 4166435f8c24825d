//! Connection and request-dispatch core of the Strata driver.
//!
//! The crate is organized around two cooperating subsystems:
//!
//! * [`network`] — the per-connection protocol engine: TCP (optionally TLS)
//!   setup, the OPTIONS/SUPPORTED/STARTUP/READY handshake, stream id
//!   accounting for up to 128 in-flight requests, and dispatch of response
//!   frames to the futures awaiting them.
//! * [`queue`] — the request queue and its manager: a bounded lock-free
//!   MPMC ring per event loop with a coalesced wakeup, so many submitter
//!   threads cost the loop a handful of wakeups and one socket flush per
//!   connection per batch.
//!
//! Connections are owned by the event loops of an [`EventLoopGroup`]
//! ([`eventloop`]); submitters only ever hold an opaque
//! [`ConnectionHandle`] and talk to a connection through its loop's queue.
//!
//! ```no_run
//! use std::borrow::Cow;
//! use strata::network::connection::{ConnectionConfig, ConnectionEvents};
//! use strata::network::Host;
//! use strata::{EventLoopGroup, RequestQueueManager};
//! use strata_cql::frame::request::query::QueryParameters;
//! use strata_cql::frame::request::Query;
//! use strata_cql::frame::SerializedRequest;
//! use tokio::sync::oneshot;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let group = EventLoopGroup::new(4)?;
//! let manager = RequestQueueManager::new(&group, 16 * 1024);
//!
//! let (connected_tx, connected_rx) = oneshot::channel();
//! let events = ConnectionEvents {
//!     connected: Some(connected_tx),
//!     ..Default::default()
//! };
//! let connection = group
//!     .connect(
//!         Host::new("127.0.0.1:9042".parse()?),
//!         ConnectionConfig::default(),
//!         events,
//!     )
//!     .await?;
//! connected_rx.await??;
//!
//! let query = Query {
//!     contents: Cow::Borrowed("SELECT cluster_name FROM system.local"),
//!     parameters: QueryParameters::default(),
//! };
//! let request = SerializedRequest::make(&query, None)?;
//! let (response_tx, response_rx) = oneshot::channel();
//! assert!(manager.write(&connection, request, response_tx));
//! let response = response_rx.await??;
//! # let _ = response;
//! # Ok(())
//! # }
//! ```

pub mod errors;
pub mod eventloop;
pub mod network;
pub mod queue;

pub use eventloop::{ConnectionHandle, EventLoopGroup};
pub use queue::{RequestQueue, RequestQueueManager};
pub use strata_cql::frame::Compression;
