use crate::frame::frame_errors::CqlResultParseError;
use crate::frame::types;
use bytes::Bytes;
use std::result::Result as StdResult;

// RESULT kind discriminants.
const KIND_VOID: i32 = 0x0001;
const KIND_ROWS: i32 = 0x0002;
const KIND_SET_KEYSPACE: i32 = 0x0003;
const KIND_PREPARED: i32 = 0x0004;
const KIND_SCHEMA_CHANGE: i32 = 0x0005;

#[derive(Debug)]
pub struct SetKeyspace {
    pub keyspace_name: String,
}

#[derive(Debug)]
pub struct Prepared {
    pub id: Bytes,
}

/// The CQL protocol-level representation of a `RESULT` response.
///
/// Only the kind discriminant and the fields the connection dispatches on
/// are decoded here; ROWS and SCHEMA_CHANGE payloads stay raw for the
/// layers above to interpret.
#[derive(Debug)]
pub enum Result {
    Void,
    Rows(Bytes),
    SetKeyspace(SetKeyspace),
    Prepared(Prepared),
    SchemaChange(Bytes),
}

pub fn deserialize(buf: &mut &[u8]) -> StdResult<Result, CqlResultParseError> {
    let kind = types::read_int(buf)
        .map_err(|err| CqlResultParseError::ResultIdParseError(err.into()))?;

    Ok(match kind {
        KIND_VOID => Result::Void,
        KIND_ROWS => Result::Rows(Bytes::copy_from_slice(buf)),
        KIND_SET_KEYSPACE => {
            let keyspace_name = types::read_string(buf)
                .map_err(CqlResultParseError::SetKeyspaceParseError)?
                .to_owned();
            Result::SetKeyspace(SetKeyspace { keyspace_name })
        }
        KIND_PREPARED => {
            // The prepared and result metadata that follow the id are not
            // interpreted by the connection core.
            let id = Bytes::copy_from_slice(
                types::read_short_bytes(buf).map_err(CqlResultParseError::PreparedParseError)?,
            );
            Result::Prepared(Prepared { id })
        }
        KIND_SCHEMA_CHANGE => Result::SchemaChange(Bytes::copy_from_slice(buf)),
        id => return Err(CqlResultParseError::UnknownResultId(id)),
    })
}
