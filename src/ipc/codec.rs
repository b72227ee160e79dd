//! Line codec for the command/query channel.
//!
//! Wraps [`LinesCodec`] with a 1 MiB limit so a client that never sends a
//! newline cannot make the kernel buffer without bound. After an oversized
//! line the decoder skips to the next newline and keeps going.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Maximum request or response line: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Newline-delimited UTF-8 codec used by both server and client.
///
/// Oversized lines decode to `AppError::Ipc`, which is recoverable; I/O
/// failures decode to `AppError::Io`, which ends the connection.
#[derive(Debug)]
pub struct IpcCodec(LinesCodec);

impl IpcCodec {
    /// Codec with the [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for IpcCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for IpcCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_codec_error)
    }
}

impl Encoder<String> for IpcCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.0.encode(item, dst).map_err(map_codec_error)
    }
}

fn map_codec_error(err: LinesCodecError) -> AppError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Ipc(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
