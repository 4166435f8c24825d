//! Wire-protocol layer of the Strata driver.
//!
//! This crate implements the CQL native protocol v3 as far as the driver
//! core needs it: frame encoding and incremental decoding, the primitive
//! in-wire types, the requests sent during connection setup and query
//! execution, and the responses the connection state machine dispatches on.
//!
//! Decoding of row data beyond the RESULT kind discriminant is out of
//! scope; ROWS bodies are handed back as raw bytes.

pub mod frame;

pub use crate::frame::types::Consistency;
