pub mod frame_errors;
pub mod request;
pub mod response;
pub mod types;

use crate::frame::frame_errors::FrameError;
use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

use std::fmt::Display;

use request::SerializableRequest;
use response::ResponseOpcode;

/// Size of the fixed v3 frame header: version, flags, stream, opcode and
/// the 4-byte body length.
pub const HEADER_SIZE: usize = 8;

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u8 = 0x03;

/// Bit set in the version byte of frames travelling server -> client.
const DIRECTION_RESPONSE: u8 = 0x80;

// Frame flags
pub const FLAG_COMPRESSION: u8 = 0x01;
pub const FLAG_TRACING: u8 = 0x02;

/// Maximum frame body length accepted by default (256 MiB, the server's
/// own native transport limit).
pub const DEFAULT_MAX_BODY_LENGTH: usize = 256 * 1024 * 1024;

/// The wire protocol compression algorithm.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Compression {
    /// LZ4 compression algorithm.
    Lz4,
    /// Snappy compression algorithm.
    Snappy,
}

impl Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compression::Lz4 => f.write_str("lz4"),
            Compression::Snappy => f.write_str("snappy"),
        }
    }
}

/// A request frame serialized into its final wire form, except for the
/// stream id which the sender patches in once a stream slot is reserved.
pub struct SerializedRequest {
    data: Vec<u8>,
}

impl SerializedRequest {
    pub fn make<R: SerializableRequest>(
        req: &R,
        compression: Option<Compression>,
    ) -> Result<SerializedRequest, FrameError> {
        let mut flags = 0;
        let mut data = vec![0; HEADER_SIZE];

        if let Some(compression) = compression {
            flags |= FLAG_COMPRESSION;
            let body = req.to_bytes()?;
            compress_append(&body, compression, &mut data)?;
        } else {
            req.serialize(&mut data)?;
        }

        data[0] = PROTOCOL_VERSION;
        data[1] = flags;
        // Byte 2 is the stream id, left zero until set_stream.
        data[3] = R::OPCODE as u8;

        let body_len = (data.len() - HEADER_SIZE) as u32;
        data[4..8].copy_from_slice(&body_len.to_be_bytes());

        Ok(Self { data })
    }

    pub fn set_stream(&mut self, stream: i8) {
        self.data[2] = stream as u8;
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data[..]
    }
}

/// Parts of the frame header which are not determined by the
/// request/response type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameParams {
    pub version: u8,
    pub flags: u8,
    pub stream: i8,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags: 0x00,
            stream: 0,
        }
    }
}

/// A complete response frame produced by the [FrameDecoder].
#[derive(Debug, Clone)]
pub struct ResponseFrame {
    pub params: FrameParams,
    pub opcode: ResponseOpcode,
    pub body: Bytes,
}

enum DecoderState {
    Header {
        raw: [u8; HEADER_SIZE],
        filled: usize,
    },
    Body {
        params: FrameParams,
        opcode: ResponseOpcode,
        expected: usize,
        body: Vec<u8>,
    },
}

/// Incremental response frame parser.
///
/// Bytes are pushed in with [consume](FrameDecoder::consume), which is
/// invariant under chunk boundaries: a header may span many calls, and one
/// chunk may carry the tail of one frame and the head of the next. Once
/// [frame_ready](FrameDecoder::frame_ready) reports true the caller takes
/// the frame out and keeps feeding the remaining input.
pub struct FrameDecoder {
    max_body_length: usize,
    state: DecoderState,
    ready: Option<ResponseFrame>,
}

impl FrameDecoder {
    pub fn new() -> FrameDecoder {
        Self::with_max_body_length(DEFAULT_MAX_BODY_LENGTH)
    }

    pub fn with_max_body_length(max_body_length: usize) -> FrameDecoder {
        FrameDecoder {
            max_body_length,
            state: DecoderState::Header {
                raw: [0; HEADER_SIZE],
                filled: 0,
            },
            ready: None,
        }
    }

    /// Feeds `input` into the parser and returns how many bytes were
    /// consumed. Consumption stops early when a complete frame becomes
    /// available; take it with [take_frame](FrameDecoder::take_frame)
    /// before continuing.
    pub fn consume(&mut self, input: &[u8]) -> Result<usize, FrameError> {
        if self.ready.is_some() || input.is_empty() {
            return Ok(0);
        }

        match &mut self.state {
            DecoderState::Header { raw, filled } => {
                let n = (HEADER_SIZE - *filled).min(input.len());
                raw[*filled..*filled + n].copy_from_slice(&input[..n]);
                *filled += n;
                if *filled == HEADER_SIZE {
                    let (params, opcode, expected) = parse_header(raw, self.max_body_length)?;
                    if expected == 0 {
                        self.ready = Some(ResponseFrame {
                            params,
                            opcode,
                            body: Bytes::new(),
                        });
                        self.reset();
                    } else {
                        self.state = DecoderState::Body {
                            params,
                            opcode,
                            expected,
                            body: Vec::with_capacity(expected),
                        };
                    }
                }
                Ok(n)
            }
            DecoderState::Body {
                params,
                opcode,
                expected,
                body,
            } => {
                let n = (*expected - body.len()).min(input.len());
                body.extend_from_slice(&input[..n]);
                if body.len() == *expected {
                    self.ready = Some(ResponseFrame {
                        params: *params,
                        opcode: *opcode,
                        body: std::mem::take(body).into(),
                    });
                    self.reset();
                }
                Ok(n)
            }
        }
    }

    pub fn frame_ready(&self) -> bool {
        self.ready.is_some()
    }

    pub fn take_frame(&mut self) -> Option<ResponseFrame> {
        self.ready.take()
    }

    fn reset(&mut self) {
        self.state = DecoderState::Header {
            raw: [0; HEADER_SIZE],
            filled: 0,
        };
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_header(
    raw: &[u8; HEADER_SIZE],
    max_body_length: usize,
) -> Result<(FrameParams, ResponseOpcode, usize), FrameError> {
    let mut buf = &raw[..];

    let version = buf.get_u8();
    if version & DIRECTION_RESPONSE != DIRECTION_RESPONSE {
        return Err(FrameError::FrameFromClient);
    }
    if version & 0x7F != PROTOCOL_VERSION {
        return Err(FrameError::VersionNotSupported(version & 0x7F));
    }

    let flags = buf.get_u8();
    let stream = buf.get_i8();
    let opcode = ResponseOpcode::try_from(buf.get_u8())?;

    let length = buf.get_u32() as usize;
    if length > max_body_length {
        return Err(FrameError::BodyLengthExceeded {
            length,
            max: max_body_length,
        });
    }

    Ok((
        FrameParams {
            version,
            flags,
            stream,
        },
        opcode,
        length,
    ))
}

/// Undoes the body compression of a received frame, when its flags say the
/// body is compressed.
pub fn decompress_body(
    flags: u8,
    compression: Option<Compression>,
    body: Bytes,
) -> Result<Bytes, FrameError> {
    if flags & FLAG_COMPRESSION != 0 {
        match compression {
            Some(compression) => Ok(decompress(&body, compression)?.into()),
            None => Err(FrameError::NoCompressionNegotiated),
        }
    } else {
        Ok(body)
    }
}

fn compress_append(
    uncomp_body: &[u8],
    compression: Compression,
    out: &mut Vec<u8>,
) -> Result<(), FrameError> {
    match compression {
        Compression::Lz4 => {
            let uncomp_len = uncomp_body.len() as u32;
            let tmp = lz4_flex::compress(uncomp_body);
            out.reserve_exact(std::mem::size_of::<u32>() + tmp.len());
            out.put_u32(uncomp_len);
            out.extend_from_slice(&tmp[..]);
            Ok(())
        }
        Compression::Snappy => {
            let old_size = out.len();
            out.resize(old_size + snap::raw::max_compress_len(uncomp_body.len()), 0);
            let compressed_size = snap::raw::Encoder::new()
                .compress(uncomp_body, &mut out[old_size..])
                .map_err(|_| FrameError::FrameCompression)?;
            out.truncate(old_size + compressed_size);
            Ok(())
        }
    }
}

fn decompress(mut comp_body: &[u8], compression: Compression) -> Result<Vec<u8>, FrameError> {
    match compression {
        Compression::Lz4 => {
            if comp_body.len() < std::mem::size_of::<u32>() {
                return Err(FrameError::FrameDecompression);
            }
            let uncomp_len = comp_body.get_u32() as usize;
            let uncomp_body = lz4_flex::decompress(comp_body, uncomp_len)?;
            Ok(uncomp_body)
        }
        Compression::Snappy => snap::raw::Decoder::new()
            .decompress_vec(comp_body)
            .map_err(|_| FrameError::FrameDecompression),
    }
}

/// An error type for parsing an enum value from a primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No discriminant in enum `{enum_name}` matches the value `{primitive:?}`")]
pub struct TryFromPrimitiveError<T: Copy + std::fmt::Debug> {
    pub(crate) enum_name: &'static str,
    pub(crate) primitive: T,
}
