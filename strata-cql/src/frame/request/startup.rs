//! CQL protocol-level representation of a `STARTUP` request.

use thiserror::Error;

use crate::frame::frame_errors::CqlRequestSerializationError;
use crate::frame::Compression;

use std::{borrow::Cow, collections::HashMap, num::TryFromIntError};

use crate::{
    frame::request::{RequestOpcode, SerializableRequest},
    frame::types,
};

/// Option key carrying the requested CQL version.
pub const CQL_VERSION: &str = "CQL_VERSION";
/// Option key carrying the requested body compression algorithm.
pub const COMPRESSION: &str = "COMPRESSION";

pub const DEFAULT_CQL_VERSION: &str = "3.0.0";

/// The CQL protocol-level representation of a `STARTUP` request,
/// used to finalise the connection negotiation phase.
pub struct Startup<'a> {
    /// The protocol options accepted by the client.
    pub options: HashMap<Cow<'a, str>, Cow<'a, str>>,
}

impl Startup<'_> {
    /// Builds the startup options for the chosen protocol version and
    /// compression algorithm.
    pub fn for_handshake(cql_version: &str, compression: Option<Compression>) -> Startup<'static> {
        let mut options = HashMap::new();
        options.insert(
            Cow::Borrowed(CQL_VERSION),
            Cow::Owned(cql_version.to_string()),
        );
        if let Some(compression) = compression {
            options.insert(
                Cow::Borrowed(COMPRESSION),
                Cow::Owned(compression.to_string()),
            );
        }
        Startup { options }
    }
}

impl SerializableRequest for Startup<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Startup;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        types::write_string_map(&self.options, buf)
            .map_err(StartupSerializationError::OptionsSerialization)
            .map_err(CqlRequestSerializationError::StartupSerialization)?;
        Ok(())
    }
}

/// An error type returned when serialization of STARTUP request fails.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum StartupSerializationError {
    /// Failed to serialize startup options.
    #[error("Malformed startup options: {0}")]
    OptionsSerialization(TryFromIntError),
}
