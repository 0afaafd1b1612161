//! The remote store: a [`CrdtStore`] speaking the wire protocol over a
//! pooled TCP connection.
//!
//! Each session checks one connection out of the pool, opens with a
//! command envelope, streams record frames, and exchanges the
//! end-of-stream acknowledgement. The connection returns to the
//! keep-alive pool only after a clean ack; any failure or cancellation
//! drops it instead, which the far side observes as a torn stream.

use super::io_timeout;
use super::pool::{Connection, ConnectionPool, PooledStream};
use async_trait::async_trait;
use conflux_core::{
    BoxRecordSink, BoxRecordSource, BoxTombstoneSink, CompressionMethod, CrdtFunction, CrdtStore,
    Error, NetConfig, Record, RecordCodec, RecordSink, RecordSource, Result, Timestamp, Tombstone,
    TombstoneSink,
};
use conflux_wire::{
    read_command, require_ack, write_command, Command, RecordStreamReader, RecordStreamWriter,
};
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Client handle to one remote storage endpoint.
pub struct RemoteStore<F: CrdtFunction, C: RecordCodec> {
    endpoint: SocketAddr,
    pool: Arc<ConnectionPool>,
    codec: C,
    config: NetConfig,
    compression: CompressionMethod,
    _crdt: PhantomData<fn() -> F>,
}

impl<F: CrdtFunction, C: RecordCodec> RemoteStore<F, C> {
    /// A store speaking to `endpoint` through `pool`.
    pub fn new(
        endpoint: SocketAddr,
        pool: Arc<ConnectionPool>,
        codec: C,
        config: NetConfig,
        compression: CompressionMethod,
    ) -> Self {
        RemoteStore {
            endpoint,
            pool,
            codec,
            config,
            compression,
            _crdt: PhantomData,
        }
    }

    async fn open(&self, request: &Command) -> Result<Connection> {
        let mut conn = self.pool.checkout(self.endpoint).await?;
        io_timeout(
            self.config.read_write_timeout(),
            "session request",
            write_command(conn.stream_mut(), request),
        )
        .await?;
        Ok(conn)
    }
}

#[async_trait]
impl<F: CrdtFunction, C: RecordCodec> CrdtStore<F> for RemoteStore<F, C> {
    async fn upload(&self) -> Result<BoxRecordSink<F>> {
        let mut conn = self
            .open(&Command::Upload {
                compression: self.compression,
            })
            .await?;
        let stream = conn
            .take_stream()
            .ok_or_else(|| Error::conflict("connection stream unavailable"))?;
        Ok(Box::new(RemoteUploadSink::<F, C> {
            conn: Some(conn),
            writer: Some(RecordStreamWriter::for_method(stream, self.compression)),
            codec: self.codec.clone(),
            limit: self.config.read_write_timeout(),
            _crdt: PhantomData,
        }))
    }

    async fn download(&self, cutoff: Option<Timestamp>) -> Result<BoxRecordSource<F>> {
        let mut conn = self
            .open(&Command::Download {
                cutoff,
                compression: self.compression,
            })
            .await?;
        let stream = conn
            .take_stream()
            .ok_or_else(|| Error::conflict("connection stream unavailable"))?;
        Ok(Box::new(RemoteDownloadSource::<F, C> {
            conn: Some(conn),
            reader: Some(RecordStreamReader::for_method(stream, self.compression)),
            codec: self.codec.clone(),
            limit: self.config.read_write_timeout(),
            _crdt: PhantomData,
        }))
    }

    async fn remove(&self) -> Result<BoxTombstoneSink<F>> {
        let mut conn = self.open(&Command::Remove).await?;
        let stream = conn
            .take_stream()
            .ok_or_else(|| Error::conflict("connection stream unavailable"))?;
        // Tombstones are small; they always travel as bare frames.
        Ok(Box::new(RemoteRemoveSink::<F, C> {
            conn: Some(conn),
            writer: Some(RecordStreamWriter::for_method(
                stream,
                CompressionMethod::None,
            )),
            codec: self.codec.clone(),
            limit: self.config.read_write_timeout(),
            _crdt: PhantomData,
        }))
    }

    async fn size(&self) -> Result<u64> {
        Err(Error::conflict(
            "size is a local operation, not part of the wire protocol",
        ))
    }
}

/// Finish a sending session: terminator, ack exchange, connection reuse.
async fn close_sending_session(
    mut writer: RecordStreamWriter<PooledStream>,
    conn: Option<Connection>,
    limit: Duration,
) -> Result<()> {
    io_timeout(limit, "end of stream", writer.finish()).await?;
    let mut stream = writer.into_inner();
    let closing = io_timeout(limit, "session ack", read_command(&mut stream)).await?;
    let outcome = require_ack(closing);
    if let Some(mut conn) = conn {
        if outcome.is_ok() {
            conn.restore_stream(stream);
            conn.release();
        }
        // on failure the connection drops here and the socket closes
    }
    outcome
}

struct RemoteUploadSink<F: CrdtFunction, C: RecordCodec> {
    conn: Option<Connection>,
    writer: Option<RecordStreamWriter<PooledStream>>,
    codec: C,
    limit: Duration,
    _crdt: PhantomData<fn() -> F>,
}

#[async_trait]
impl<F: CrdtFunction, C: RecordCodec> RecordSink<F> for RemoteUploadSink<F, C> {
    async fn push(&mut self, record: Record<F::Key, F::State>) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::conflict("upload session already closed"))?;
        let payload = self.codec.encode(&record)?;
        io_timeout(self.limit, "record frame", writer.write_frame(&payload)).await
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        let mut this = *self;
        let writer = this
            .writer
            .take()
            .ok_or_else(|| Error::conflict("upload session already closed"))?;
        close_sending_session(writer, this.conn.take(), this.limit).await
    }
}

struct RemoteRemoveSink<F: CrdtFunction, C: RecordCodec> {
    conn: Option<Connection>,
    writer: Option<RecordStreamWriter<PooledStream>>,
    codec: C,
    limit: Duration,
    _crdt: PhantomData<fn() -> F>,
}

#[async_trait]
impl<F: CrdtFunction, C: RecordCodec> TombstoneSink<F> for RemoteRemoveSink<F, C> {
    async fn push(&mut self, tombstone: Tombstone<F::Key>) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::conflict("remove session already closed"))?;
        let payload = self.codec.encode(&tombstone)?;
        io_timeout(self.limit, "tombstone frame", writer.write_frame(&payload)).await
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        let mut this = *self;
        let writer = this
            .writer
            .take()
            .ok_or_else(|| Error::conflict("remove session already closed"))?;
        close_sending_session(writer, this.conn.take(), this.limit).await
    }
}

struct RemoteDownloadSource<F: CrdtFunction, C: RecordCodec> {
    conn: Option<Connection>,
    reader: Option<RecordStreamReader<PooledStream>>,
    codec: C,
    limit: Duration,
    _crdt: PhantomData<fn() -> F>,
}

#[async_trait]
impl<F: CrdtFunction, C: RecordCodec> RecordSource<F> for RemoteDownloadSource<F, C> {
    async fn next(&mut self) -> Result<Option<Record<F::Key, F::State>>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        match io_timeout(self.limit, "record frame", reader.next_frame()).await? {
            Some(payload) => Ok(Some(self.codec.decode(&payload)?)),
            None => {
                if !reader.terminated() {
                    return Err(Error::malformed(
                        "download stream ended without a terminator",
                    ));
                }
                // End of stream: we are the receiver, so we owe the ack.
                let Some(reader) = self.reader.take() else {
                    return Ok(None);
                };
                let mut stream = reader.into_inner();
                io_timeout(
                    self.limit,
                    "download ack",
                    write_command(&mut stream, &Command::Ack),
                )
                .await?;
                if let Some(mut conn) = self.conn.take() {
                    conn.restore_stream(stream);
                    conn.release();
                }
                Ok(None)
            }
        }
    }
}
