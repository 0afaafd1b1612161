//! Framed streaming transport for Conflux.
//!
//! Two framings coexist on every session:
//!
//! - **Record framing** (`frame`): `[uvarint length][payload]`, stream
//!   terminated by a zero-length frame. An optional outer layer (`block`)
//!   groups record frames into checksummed, optionally LZ4-compressed
//!   blocks so truncation is detectable.
//! - **Command framing** (`command`): null-terminated JSON envelopes for
//!   control messages (upload/download/remove requests, ack, error).
//!
//! The same record framing is reused by WAL segment files and storage
//! chunk files; the end-of-stream acknowledgement exists only on wire
//! sessions.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod block;
pub mod command;
pub mod frame;

pub use block::{BlockReader, BlockWriter, BLOCK_MAGIC};
pub use command::{read_command, require_ack, try_read_command, write_command, Command};
pub use frame::{encode_frame, FrameReader, FrameWriter};

use conflux_core::{CompressionMethod, Result};
use tokio::io::{AsyncRead, AsyncWrite};

/// Writer over a record stream, plain or block-compressed.
pub enum RecordStreamWriter<W: AsyncWrite + Unpin + Send> {
    /// Bare record frames.
    Plain(FrameWriter<W>),
    /// Frames grouped into checksummed blocks.
    Block(BlockWriter<W>),
}

impl<W: AsyncWrite + Unpin + Send> RecordStreamWriter<W> {
    /// Pick the framing for a negotiated compression method. Plain frames
    /// for `None`; block framing otherwise.
    pub fn for_method(inner: W, method: CompressionMethod) -> Self {
        match method {
            CompressionMethod::None => RecordStreamWriter::Plain(FrameWriter::new(inner)),
            method => RecordStreamWriter::Block(BlockWriter::new(inner, method)),
        }
    }

    /// Write one record frame.
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        match self {
            RecordStreamWriter::Plain(w) => w.write_frame(payload).await,
            RecordStreamWriter::Block(w) => w.write_frame(payload).await,
        }
    }

    /// Write the zero-length terminator and flush.
    pub async fn finish(&mut self) -> Result<()> {
        match self {
            RecordStreamWriter::Plain(w) => w.finish().await,
            RecordStreamWriter::Block(w) => w.finish().await,
        }
    }

    /// Unwrap the underlying byte sink.
    pub fn into_inner(self) -> W {
        match self {
            RecordStreamWriter::Plain(w) => w.into_inner(),
            RecordStreamWriter::Block(w) => w.into_inner(),
        }
    }
}

/// Reader over a record stream, plain or block-compressed.
pub enum RecordStreamReader<R: AsyncRead + Unpin + Send> {
    /// Bare record frames.
    Plain(FrameReader<R>),
    /// Frames grouped into checksummed blocks.
    Block(BlockReader<R>),
}

impl<R: AsyncRead + Unpin + Send> RecordStreamReader<R> {
    /// Pick the framing for a negotiated compression method.
    pub fn for_method(inner: R, method: CompressionMethod) -> Self {
        match method {
            CompressionMethod::None => RecordStreamReader::Plain(FrameReader::new(inner)),
            _ => RecordStreamReader::Block(BlockReader::new(inner)),
        }
    }

    /// Next frame payload, or `None` at end of stream.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        match self {
            RecordStreamReader::Plain(r) => r.next_frame().await,
            RecordStreamReader::Block(r) => r.next_frame().await,
        }
    }

    /// Unwrap the underlying byte source.
    pub fn into_inner(self) -> R {
        match self {
            RecordStreamReader::Plain(r) => r.into_inner(),
            RecordStreamReader::Block(r) => r.into_inner(),
        }
    }

    /// True once the zero-length terminator has been read. A wire stream
    /// that ends without it was torn by the sender.
    pub fn terminated(&self) -> bool {
        match self {
            RecordStreamReader::Plain(r) => r.terminated(),
            RecordStreamReader::Block(r) => r.terminated(),
        }
    }
}
