use std::{borrow::Cow, num::TryFromIntError};

use thiserror::Error;

use crate::frame::frame_errors::CqlRequestSerializationError;
use crate::{
    frame::request::{RequestOpcode, SerializableRequest},
    frame::types,
};

#[cfg_attr(test, derive(Debug, PartialEq, Eq))]
pub struct Query<'q> {
    pub contents: Cow<'q, str>,
    pub parameters: QueryParameters,
}

impl SerializableRequest for Query<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Query;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        types::write_long_string(&self.contents, buf)
            .map_err(QuerySerializationError::StatementStringSerialization)
            .map_err(CqlRequestSerializationError::QuerySerialization)?;
        self.parameters.serialize(buf);
        Ok(())
    }
}

#[derive(Default)]
#[cfg_attr(test, derive(Debug, PartialEq, Eq))]
pub struct QueryParameters {
    pub consistency: types::Consistency,
}

impl QueryParameters {
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        types::write_consistency(self.consistency, buf);
        // No values, paging, serial consistency or timestamp; the query
        // flags byte stays empty.
        buf.push(0);
    }
}

/// An error type returned when serialization of QUERY request fails.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum QuerySerializationError {
    /// Failed to serialize the statement text.
    #[error("Failed to serialize statement contents: {0}")]
    StatementStringSerialization(TryFromIntError),
}
