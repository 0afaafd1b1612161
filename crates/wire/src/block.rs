//! Checksummed block framing over groups of record frames.
//!
//! Layout of one block:
//!
//! ```text
//! ┌───────────┬───────────────┬────────────────┬────────┬──────────┐
//! │ magic: u64│ original: u32 │ compressed: u32│ method │ crc: u32 │
//! └───────────┴───────────────┴────────────────┴────────┴──────────┘
//! 21-byte header, little-endian, followed by `compressed` body bytes.
//! ```
//!
//! The body decompresses to a run of record frames; frames never span
//! blocks. The checksum covers the uncompressed bytes, so a truncated or
//! bit-flipped block is rejected as `Malformed` instead of silently
//! shortening the stream. Method 0 stores the bytes as-is, method 1 is
//! LZ4 block compression.

use crate::frame::{put_uvarint, take_uvarint, MAX_FRAME_LEN};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use conflux_core::{CompressionMethod, Error, Result};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Identifies a block header. Doubles as a file-type check for chunk
/// files, which are pure block streams.
pub const BLOCK_MAGIC: u64 = u64::from_le_bytes(*b"CFXBLK01");

/// Header length in bytes.
pub const BLOCK_HEADER_LEN: usize = 21;

/// Flush threshold for the writer: a block is cut once its uncompressed
/// body reaches this size.
const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Upper bound on a block body, compressed or not. Leaves room for one
/// maximum-size frame plus whatever smaller frames were already buffered.
const MAX_BLOCK_LEN: u32 = 320 * 1024 * 1024;

fn method_byte(method: CompressionMethod) -> u8 {
    match method {
        CompressionMethod::None => 0,
        CompressionMethod::Lz4 => 1,
    }
}

fn method_from_byte(byte: u8) -> Result<CompressionMethod> {
    match byte {
        0 => Ok(CompressionMethod::None),
        1 => Ok(CompressionMethod::Lz4),
        other => Err(Error::malformed(format!(
            "unknown block compression method {other}"
        ))),
    }
}

/// Groups record frames into blocks and writes them to an async sink.
pub struct BlockWriter<W: AsyncWrite + Unpin + Send> {
    inner: W,
    method: CompressionMethod,
    buf: Vec<u8>,
    block_size: usize,
}

impl<W: AsyncWrite + Unpin + Send> BlockWriter<W> {
    /// Wrap a byte sink.
    pub fn new(inner: W, method: CompressionMethod) -> Self {
        Self::with_block_size(inner, method, DEFAULT_BLOCK_SIZE)
    }

    /// Wrap a byte sink with an explicit flush threshold.
    pub fn with_block_size(inner: W, method: CompressionMethod, block_size: usize) -> Self {
        BlockWriter {
            inner,
            method,
            buf: Vec::with_capacity(block_size.min(DEFAULT_BLOCK_SIZE)),
            block_size: block_size.max(1),
        }
    }

    /// Buffer one non-empty frame, cutting a block when the threshold is
    /// reached. Frames never span blocks.
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(Error::conflict("empty payload would terminate the stream"));
        }
        put_uvarint(&mut self.buf, payload.len() as u64);
        self.buf.extend_from_slice(payload);
        if self.buf.len() >= self.block_size {
            self.flush_block().await?;
        }
        Ok(())
    }

    /// Append the zero-length terminator, cut the final block, and flush.
    pub async fn finish(&mut self) -> Result<()> {
        self.buf.push(0u8);
        self.flush_block().await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Unwrap.
    pub fn into_inner(self) -> W {
        self.inner
    }

    async fn flush_block(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let original = std::mem::take(&mut self.buf);
        let checksum = crc32fast::hash(&original);
        let body = match self.method {
            CompressionMethod::None => original.clone(),
            CompressionMethod::Lz4 => lz4_flex::block::compress(&original),
        };

        let mut header = Vec::with_capacity(BLOCK_HEADER_LEN);
        WriteBytesExt::write_u64::<LittleEndian>(&mut header, BLOCK_MAGIC)?;
        WriteBytesExt::write_u32::<LittleEndian>(&mut header, original.len() as u32)?;
        WriteBytesExt::write_u32::<LittleEndian>(&mut header, body.len() as u32)?;
        WriteBytesExt::write_u8(&mut header, method_byte(self.method))?;
        WriteBytesExt::write_u32::<LittleEndian>(&mut header, checksum)?;

        self.inner.write_all(&header).await?;
        self.inner.write_all(&body).await?;
        Ok(())
    }
}

/// Reads record frames back out of a block stream.
pub struct BlockReader<R: AsyncRead + Unpin + Send> {
    inner: R,
    decoded: Vec<u8>,
    pos: usize,
    finished: bool,
}

impl<R: AsyncRead + Unpin + Send> BlockReader<R> {
    /// Wrap a byte source.
    pub fn new(inner: R) -> Self {
        BlockReader {
            inner,
            decoded: Vec::new(),
            pos: 0,
            finished: false,
        }
    }

    /// Unwrap. Undecoded buffered bytes are discarded.
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// True once the terminator frame has been read. Block streams can
    /// only end this way; everything else errors first.
    pub fn terminated(&self) -> bool {
        self.finished
    }

    /// Next frame payload, or `None` on the zero-length terminator.
    /// Truncated blocks, checksum mismatches, and frames torn at end of
    /// input are all `Malformed`.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }
        loop {
            let pending = &self.decoded[self.pos..];
            if let Some((len, prefix)) = take_uvarint(pending)? {
                if len == 0 {
                    self.finished = true;
                    self.pos += prefix;
                    return Ok(None);
                }
                if len > MAX_FRAME_LEN {
                    return Err(Error::malformed(format!(
                        "frame of {len} bytes exceeds limit"
                    )));
                }
                let total = prefix + len as usize;
                if pending.len() >= total {
                    let payload = pending[prefix..total].to_vec();
                    self.pos += total;
                    return Ok(Some(payload));
                }
            }
            // Frame incomplete in the decoded buffer: pull another block.
            self.read_block().await?;
        }
    }

    async fn read_block(&mut self) -> Result<()> {
        let mut header = [0u8; BLOCK_HEADER_LEN];
        match self.inner.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                // EOF between blocks is only valid when no frame is torn.
                if self.pos == self.decoded.len() {
                    return Err(Error::malformed(
                        "block stream ended without a terminator frame",
                    ));
                }
                return Err(Error::malformed("block stream ended inside a frame"));
            }
            Err(e) => return Err(e.into()),
        }

        let mut cursor = &header[..];
        let magic = ReadBytesExt::read_u64::<LittleEndian>(&mut cursor)?;
        if magic != BLOCK_MAGIC {
            return Err(Error::malformed("bad block magic"));
        }
        let original_len = ReadBytesExt::read_u32::<LittleEndian>(&mut cursor)?;
        let compressed_len = ReadBytesExt::read_u32::<LittleEndian>(&mut cursor)?;
        let method = method_from_byte(ReadBytesExt::read_u8(&mut cursor)?)?;
        let checksum = ReadBytesExt::read_u32::<LittleEndian>(&mut cursor)?;
        if original_len > MAX_BLOCK_LEN || compressed_len > MAX_BLOCK_LEN {
            return Err(Error::malformed("block size exceeds limit"));
        }

        let mut body = vec![0u8; compressed_len as usize];
        match self.inner.read_exact(&mut body).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(Error::malformed("truncated block body"));
            }
            Err(e) => return Err(e.into()),
        }

        let original = match method {
            CompressionMethod::None => {
                if original_len != compressed_len {
                    return Err(Error::malformed("stored block length mismatch"));
                }
                body
            }
            CompressionMethod::Lz4 => {
                lz4_flex::block::decompress(&body, original_len as usize)
                    .map_err(|e| Error::malformed_with("lz4 block decompression failed", e))?
            }
        };
        if crc32fast::hash(&original) != checksum {
            return Err(Error::malformed("block checksum mismatch"));
        }

        // Drop consumed bytes before growing the buffer.
        self.decoded.drain(..self.pos);
        self.pos = 0;
        self.decoded.extend_from_slice(&original);
        Ok(())
    }
}
