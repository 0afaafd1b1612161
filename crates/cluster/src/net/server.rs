//! The storage server: a TCP accept loop bridging wire sessions onto a
//! local store.

use super::io_timeout;
use super::pool::PooledStream;
use conflux_core::{
    CompressionMethod, CrdtFunction, CrdtStore, Error, NetConfig, RecordCodec, RecordSink,
    RecordSource, Result, Timestamp, Tombstone, TombstoneSink,
};
use conflux_wire::{
    read_command, require_ack, try_read_command, write_command, Command, RecordStreamReader,
    RecordStreamWriter,
};
use std::sync::Arc;
use tokio::io::BufStream;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Serves upload/download/remove sessions for one local store.
///
/// Connections are keep-alive: a client may run any number of sessions
/// sequentially on one connection. A malformed session tears the
/// connection down; an idle one expires after the keep-alive timeout.
pub struct StorageServer<F: CrdtFunction, C: RecordCodec> {
    store: Arc<dyn CrdtStore<F>>,
    codec: C,
    config: NetConfig,
}

impl<F: CrdtFunction, C: RecordCodec> StorageServer<F, C> {
    /// A server over `store`.
    pub fn new(store: Arc<dyn CrdtStore<F>>, codec: C, config: NetConfig) -> Arc<Self> {
        Arc::new(StorageServer {
            store,
            codec,
            config,
        })
    }

    /// Accept connections until shutdown flips.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "storage server listening");
        }
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let server = Arc::clone(&self);
                    let conn_shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        match server.handle_connection(stream, conn_shutdown).await {
                            Ok(()) => {}
                            Err(e) if e.is_malformed() => {
                                warn!(peer = %peer, error = %e, "session torn down")
                            }
                            Err(e) => debug!(peer = %peer, error = %e, "connection closed"),
                        }
                    });
                }
            }
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut stream = BufStream::new(stream);
        loop {
            let command = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                read = tokio::time::timeout(
                    self.config.keep_alive_timeout(),
                    try_read_command(&mut stream),
                ) => match read {
                    Err(_) => return Ok(()),       // idle expiry
                    Ok(Ok(None)) => return Ok(()), // orderly close
                    Ok(Ok(Some(command))) => command,
                    Ok(Err(e)) => return Err(e),
                },
            };
            match command {
                Command::Upload { compression } => {
                    self.handle_upload(&mut stream, compression).await?
                }
                Command::Download {
                    cutoff,
                    compression,
                } => self.handle_download(&mut stream, cutoff, compression).await?,
                Command::Remove => self.handle_remove(&mut stream).await?,
                unexpected => {
                    let message = format!("unexpected command: {unexpected:?}");
                    let _ = write_command(
                        &mut stream,
                        &Command::Error {
                            message: message.clone(),
                        },
                    )
                    .await;
                    return Err(Error::malformed(message));
                }
            }
        }
    }

    /// Receive a record stream; the ack is sent only after the store
    /// session's end-of-stream install succeeded.
    async fn handle_upload(
        &self,
        stream: &mut PooledStream,
        compression: CompressionMethod,
    ) -> Result<()> {
        let received = self.receive_records(stream, compression).await;
        match received {
            Ok(count) => {
                write_command(stream, &Command::Ack).await?;
                debug!(records = count, "upload session complete");
                Ok(())
            }
            Err(e) => {
                let _ = write_command(
                    stream,
                    &Command::Error {
                        message: e.to_string(),
                    },
                )
                .await;
                Err(e)
            }
        }
    }

    async fn receive_records(
        &self,
        stream: &mut PooledStream,
        compression: CompressionMethod,
    ) -> Result<u64> {
        let mut sink = self.store.upload().await?;
        let mut reader = RecordStreamReader::for_method(&mut *stream, compression);
        let mut count = 0u64;
        loop {
            match io_timeout(
                self.config.read_write_timeout(),
                "record frame",
                reader.next_frame(),
            )
            .await?
            {
                Some(payload) => {
                    let record = self.codec.decode(&payload)?;
                    sink.push(record).await?;
                    count += 1;
                }
                None => break,
            }
        }
        if !reader.terminated() {
            return Err(Error::malformed("record stream ended without a terminator"));
        }
        sink.finish().await?;
        Ok(count)
    }

    async fn handle_download(
        &self,
        stream: &mut PooledStream,
        cutoff: Option<Timestamp>,
        compression: CompressionMethod,
    ) -> Result<()> {
        let mut source = self.store.download(cutoff).await?;
        let mut count = 0u64;
        {
            let mut writer = RecordStreamWriter::for_method(&mut *stream, compression);
            while let Some(record) = source.next().await? {
                let payload = self.codec.encode(&record)?;
                io_timeout(
                    self.config.read_write_timeout(),
                    "record frame",
                    writer.write_frame(&payload),
                )
                .await?;
                count += 1;
            }
            io_timeout(
                self.config.read_write_timeout(),
                "end of stream",
                writer.finish(),
            )
            .await?;
        }

        // We were the sender; the client owes the closing command.
        let closing = io_timeout(
            self.config.read_write_timeout(),
            "download ack",
            read_command(stream),
        )
        .await?;
        match require_ack(closing) {
            Ok(()) => debug!(records = count, "download session complete"),
            Err(e) if e.is_malformed() => return Err(e),
            Err(e) => warn!(error = %e, "client reported download failure"),
        }
        Ok(())
    }

    async fn handle_remove(&self, stream: &mut PooledStream) -> Result<()> {
        let received = self.receive_tombstones(stream).await;
        match received {
            Ok(count) => {
                write_command(stream, &Command::Ack).await?;
                debug!(tombstones = count, "remove session complete");
                Ok(())
            }
            Err(e) => {
                let _ = write_command(
                    stream,
                    &Command::Error {
                        message: e.to_string(),
                    },
                )
                .await;
                Err(e)
            }
        }
    }

    async fn receive_tombstones(&self, stream: &mut PooledStream) -> Result<u64> {
        let mut sink = self.store.remove().await?;
        let mut reader = RecordStreamReader::for_method(&mut *stream, CompressionMethod::None);
        let mut count = 0u64;
        loop {
            match io_timeout(
                self.config.read_write_timeout(),
                "tombstone frame",
                reader.next_frame(),
            )
            .await?
            {
                Some(payload) => {
                    let tombstone: Tombstone<F::Key> = self.codec.decode(&payload)?;
                    sink.push(tombstone).await?;
                    count += 1;
                }
                None => break,
            }
        }
        if !reader.terminated() {
            return Err(Error::malformed(
                "tombstone stream ended without a terminator",
            ));
        }
        sink.finish().await?;
        Ok(count)
    }
}
