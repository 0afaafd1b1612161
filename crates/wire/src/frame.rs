//! Length-prefixed record frames.
//!
//! A frame is `[uvarint length][payload]`. A zero-length frame terminates
//! the stream. On disk (WAL segments), a stream may also end at a clean
//! EOF on a frame boundary; anything else (a partial length prefix, a
//! short payload) is `Malformed`, never a silent truncation.

use conflux_core::{Error, Result};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame payload.
pub const MAX_FRAME_LEN: u64 = 256 * 1024 * 1024;

/// Append a uvarint (LEB128) to a buffer.
pub(crate) fn put_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Encode one frame (length prefix plus payload) into a buffer. Used by
/// the WAL writer, which appends frames to a file it owns.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 10);
    put_uvarint(&mut buf, payload.len() as u64);
    buf.extend_from_slice(payload);
    buf
}

/// Parse a uvarint from the front of a slice. Returns the value and the
/// number of bytes consumed, or `None` if the slice ends mid-varint.
pub(crate) fn take_uvarint(buf: &[u8]) -> Result<Option<(u64, usize)>> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().enumerate() {
        if shift >= 64 {
            return Err(Error::malformed("frame length varint overflows u64"));
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        shift += 7;
    }
    Ok(None)
}

/// Writes record frames to an async byte sink.
pub struct FrameWriter<W: AsyncWrite + Unpin + Send> {
    inner: W,
}

impl<W: AsyncWrite + Unpin + Send> FrameWriter<W> {
    /// Wrap a byte sink.
    pub fn new(inner: W) -> Self {
        FrameWriter { inner }
    }

    /// Write one non-empty frame.
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(Error::conflict("empty payload would terminate the stream"));
        }
        let buf = encode_frame(payload);
        self.inner.write_all(&buf).await?;
        Ok(())
    }

    /// Write the zero-length terminator and flush.
    pub async fn finish(&mut self) -> Result<()> {
        self.inner.write_all(&[0u8]).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// The underlying sink.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Unwrap.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Reads record frames from an async byte source, tracking how many bytes
/// belong to fully decoded frames (the WAL uses this to cut a malformed
/// tail at the last valid boundary).
pub struct FrameReader<R: AsyncRead + Unpin + Send> {
    inner: R,
    consumed: u64,
    terminated: bool,
}

impl<R: AsyncRead + Unpin + Send> FrameReader<R> {
    /// Wrap a byte source.
    pub fn new(inner: R) -> Self {
        FrameReader {
            inner,
            consumed: 0,
            terminated: false,
        }
    }

    /// Bytes consumed up to the end of the last fully decoded frame.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// True once the explicit zero-length terminator has been read.
    /// Wire sessions require it; only on-disk segments may end at EOF.
    pub fn terminated(&self) -> bool {
        self.terminated
    }

    /// Next frame payload. `None` on the zero-length terminator or on a
    /// clean EOF at a frame boundary; `Malformed` on a truncated prefix
    /// or payload.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut len = 0u64;
        let mut shift = 0u32;
        let mut prefix_bytes = 0u64;
        loop {
            let byte = match self.inner.read_u8().await {
                Ok(b) => b,
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    if prefix_bytes == 0 {
                        return Ok(None);
                    }
                    return Err(Error::malformed("stream ended inside a frame length"));
                }
                Err(e) => return Err(e.into()),
            };
            prefix_bytes += 1;
            if shift >= 64 {
                return Err(Error::malformed("frame length varint overflows u64"));
            }
            len |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }

        if len == 0 {
            self.consumed += prefix_bytes;
            self.terminated = true;
            return Ok(None);
        }
        if len > MAX_FRAME_LEN {
            return Err(Error::malformed(format!("frame of {len} bytes exceeds limit")));
        }

        let mut payload = vec![0u8; len as usize];
        match self.inner.read_exact(&mut payload).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(Error::malformed("stream ended inside a frame payload"));
            }
            Err(e) => return Err(e.into()),
        }
        self.consumed += prefix_bytes + len;
        Ok(Some(payload))
    }

    /// Unwrap.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_all(bytes: &[u8]) -> (Vec<Vec<u8>>, Result<Option<Vec<u8>>>, u64) {
        let mut reader = FrameReader::new(bytes);
        let mut frames = Vec::new();
        loop {
            match reader.next_frame().await {
                Ok(Some(frame)) => frames.push(frame),
                other => {
                    let consumed = reader.consumed();
                    return (frames, other, consumed);
                }
            }
        }
    }

    #[tokio::test]
    async fn roundtrip_with_terminator() {
        let mut buf = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut buf);
            writer.write_frame(b"one").await.unwrap();
            writer.write_frame(b"second frame").await.unwrap();
            writer.finish().await.unwrap();
        }
        let (frames, end, _) = read_all(&buf).await;
        assert_eq!(frames, vec![b"one".to_vec(), b"second frame".to_vec()]);
        assert!(matches!(end, Ok(None)));
    }

    #[tokio::test]
    async fn clean_eof_ends_stream() {
        let mut buf = Vec::new();
        let mut writer = FrameWriter::new(&mut buf);
        writer.write_frame(b"only").await.unwrap();
        // no terminator: a sealed WAL segment looks like this
        let (frames, end, consumed) = read_all(&buf).await;
        assert_eq!(frames, vec![b"only".to_vec()]);
        assert!(matches!(end, Ok(None)));
        assert_eq!(consumed, buf.len() as u64);
    }

    #[tokio::test]
    async fn truncated_payload_is_malformed() {
        let mut buf = encode_frame(b"will be cut short");
        buf.truncate(buf.len() - 4);
        let (frames, end, consumed) = read_all(&buf).await;
        assert!(frames.is_empty());
        assert!(end.unwrap_err().is_malformed());
        assert_eq!(consumed, 0);
    }

    #[tokio::test]
    async fn consumed_stops_at_last_valid_frame() {
        let mut buf = Vec::new();
        buf.extend(encode_frame(b"keep me"));
        let valid = buf.len() as u64;
        let mut tail = encode_frame(b"torn tail");
        tail.truncate(3);
        buf.extend(tail);

        let (frames, end, consumed) = read_all(&buf).await;
        assert_eq!(frames, vec![b"keep me".to_vec()]);
        assert!(end.unwrap_err().is_malformed());
        assert_eq!(consumed, valid);
    }

    #[tokio::test]
    async fn empty_frame_write_is_rejected() {
        let mut writer = FrameWriter::new(Vec::new());
        let err = writer.write_frame(b"").await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn large_varint_frames() {
        let payload = vec![0xABu8; 100_000];
        let mut buf = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut buf);
            writer.write_frame(&payload).await.unwrap();
            writer.finish().await.unwrap();
        }
        let (frames, _, _) = read_all(&buf).await;
        assert_eq!(frames[0].len(), 100_000);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn any_frame_sequence_roundtrips(
                payloads in prop::collection::vec(
                    prop::collection::vec(any::<u8>(), 1..200),
                    0..20,
                )
            ) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .build()
                    .unwrap();
                rt.block_on(async {
                    let mut buf = Vec::new();
                    {
                        let mut writer = FrameWriter::new(&mut buf);
                        for payload in &payloads {
                            writer.write_frame(payload).await.unwrap();
                        }
                        writer.finish().await.unwrap();
                    }
                    let (frames, end, _) = read_all(&buf).await;
                    assert_eq!(frames, payloads);
                    assert!(matches!(end, Ok(None)));
                });
            }

            #[test]
            fn uvarint_roundtrips(value in any::<u64>()) {
                let mut buf = Vec::new();
                put_uvarint(&mut buf, value);
                let (back, consumed) = take_uvarint(&buf).unwrap().unwrap();
                prop_assert_eq!(back, value);
                prop_assert_eq!(consumed, buf.len());
            }
        }
    }
}
