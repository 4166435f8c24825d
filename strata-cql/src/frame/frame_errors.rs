use super::request::query::QuerySerializationError;
use super::request::startup::StartupSerializationError;
use super::TryFromPrimitiveError;
use thiserror::Error;

/// An error type returned by the frame codec.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FrameError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    RequestSerialization(#[from] CqlRequestSerializationError),
    #[error("Frame is compressed, but no compression negotiated for connection.")]
    NoCompressionNegotiated,
    #[error("Received frame marked as coming from a client")]
    FrameFromClient,
    #[error("Received a frame from version {0}, but only 3 is supported")]
    VersionNotSupported(u8),
    #[error("Frame body length {length} exceeds the configured maximum of {max}")]
    BodyLengthExceeded { length: usize, max: usize },
    #[error("Frame decompression failed.")]
    FrameDecompression,
    #[error("Frame compression failed.")]
    FrameCompression,
    #[error("Unrecognized opcode: {0}")]
    UnknownOpcode(#[from] TryFromPrimitiveError<u8>),
    #[error("Error decompressing lz4 data: {0}")]
    Lz4DecompressError(#[from] lz4_flex::block::DecompressError),
}

/// An error type returned when serialization of a CQL request fails.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum CqlRequestSerializationError {
    /// Failed to serialize STARTUP request.
    #[error("Failed to serialize STARTUP request: {0}")]
    StartupSerialization(#[from] StartupSerializationError),

    /// Failed to serialize QUERY request.
    #[error("Failed to serialize QUERY request: {0}")]
    QuerySerialization(#[from] QuerySerializationError),
}

/// An error type returned when deserialization of a CQL response fails.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ParseError {
    #[error(transparent)]
    CqlSupportedParseError(#[from] CqlSupportedParseError),
    #[error(transparent)]
    CqlErrorParseError(#[from] CqlErrorParseError),
    #[error(transparent)]
    CqlResultParseError(#[from] CqlResultParseError),
    #[error("Low-level deserialization failed: {0}")]
    LowLevelDeserializationError(#[from] LowLevelDeserializationError),
    #[error("Could not deserialize frame: {0}")]
    BadIncomingData(String),
}

/// An error type returned when deserialization of SUPPORTED response fails.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum CqlSupportedParseError {
    #[error("Malformed options map: {0}")]
    OptionsMapDeserialization(LowLevelDeserializationError),
}

/// An error type returned when deserialization of ERROR response fails.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum CqlErrorParseError {
    #[error("Malformed error code: {0}")]
    ErrorCodeParseError(LowLevelDeserializationError),
    #[error("Malformed error reason: {0}")]
    ReasonParseError(LowLevelDeserializationError),
}

/// An error type returned when deserialization of RESULT response fails.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum CqlResultParseError {
    #[error("Malformed RESULT response kind: {0}")]
    ResultIdParseError(LowLevelDeserializationError),
    #[error("Unknown RESULT response kind: {0}")]
    UnknownResultId(i32),
    #[error("'Set_keyspace' response deserialization failed: {0}")]
    SetKeyspaceParseError(LowLevelDeserializationError),
    #[error("'Prepared' response deserialization failed: {0}")]
    PreparedParseError(LowLevelDeserializationError),
}

/// A low level deserialization error.
///
/// This type of error is returned when deserialization
/// of some primitive value fails.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LowLevelDeserializationError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    TryFromIntError(#[from] std::num::TryFromIntError),
    #[error("Not enough bytes! expected: {expected}, received: {received}")]
    TooFewBytesReceived { expected: usize, received: usize },
    #[error("Unknown consistency: {0}")]
    UnknownConsistency(#[from] TryFromPrimitiveError<u16>),
    #[error("UTF8 deserialization failed: {0}")]
    UTF8DeserializationError(#[from] std::str::Utf8Error),
}
