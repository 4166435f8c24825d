use crate::frame::frame_errors::CqlErrorParseError;
use crate::frame::types;

/// The CQL protocol-level representation of an `ERROR` response:
/// a numeric error code plus a human-readable reason.
///
/// Code-specific trailing fields are left unparsed; routing errors to
/// pending requests only needs the code and the reason.
#[derive(Debug, Clone)]
pub struct Error {
    pub code: i32,
    pub reason: String,
}

impl Error {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlErrorParseError> {
        let code = types::read_int(buf)
            .map_err(|err| CqlErrorParseError::ErrorCodeParseError(err.into()))?;
        let reason = types::read_string(buf)
            .map_err(CqlErrorParseError::ReasonParseError)?
            .to_owned();

        Ok(Error { code, reason })
    }
}
