//! The write-ahead log proper: append, rotate, recover, hand off.

use crate::segment::{scan_dir, SegmentName};
use conflux_core::{
    Clock, CrdtFunction, CrdtStore, Error, Record, RecordCodec, RecordSink, Result, WalConfig,
};
use conflux_wire::frame::{encode_frame, FrameReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// What a recovery pass found and drained.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoverySummary {
    /// Sealed segments drained into storage.
    pub segments: usize,
    /// Records handed off.
    pub records: u64,
}

struct ActiveSegment {
    file: File,
    name: SegmentName,
    path: PathBuf,
    written: u64,
}

struct WalState {
    active: Option<ActiveSegment>,
    /// Sealed segments whose handoff has not succeeded yet, oldest first.
    pending_sealed: Vec<PathBuf>,
    next_sequence: u64,
    stopped: bool,
}

/// Durable append log in front of a local store.
///
/// A `put` whose future resolves is crash-recoverable: after an unplanned
/// restart, [`WriteAheadLog::start`] replays it into the store. Puts are
/// totally ordered by append position in the open segment.
pub struct WriteAheadLog<F: CrdtFunction, C: RecordCodec> {
    dir: PathBuf,
    node_id: String,
    config: WalConfig,
    codec: C,
    store: Arc<dyn CrdtStore<F>>,
    clock: Clock,
    state: Mutex<WalState>,
}

impl<F: CrdtFunction, C: RecordCodec> WriteAheadLog<F, C> {
    /// Create a log over `dir`, handing sealed segments off to `store`.
    /// The directory is created; no recovery happens until [`start`].
    ///
    /// [`start`]: WriteAheadLog::start
    pub async fn open(
        dir: impl Into<PathBuf>,
        node_id: impl Into<String>,
        config: WalConfig,
        codec: C,
        store: Arc<dyn CrdtStore<F>>,
    ) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(WriteAheadLog {
            dir,
            node_id: node_id.into(),
            config,
            codec,
            store,
            clock: Clock::new(),
            state: Mutex::new(WalState {
                active: None,
                pending_sealed: Vec::new(),
                next_sequence: 0,
                stopped: false,
            }),
        })
    }

    /// Scan the directory, seal any segment left open by a crash, drain
    /// every sealed segment into the store, and open a fresh segment.
    ///
    /// Empty and fully-malformed files are deleted; a malformed tail is
    /// dropped at the last valid frame boundary and the prefix is still
    /// drained. If a handoff fails the segment is retained and retried by
    /// the next `start()` or `flush()`.
    pub async fn start(&self) -> Result<RecoverySummary> {
        let mut state = self.state.lock().await;
        if state.stopped {
            return Err(Error::Shutdown);
        }
        if state.active.is_some() {
            return Err(Error::conflict("write-ahead log already started"));
        }

        let mut sealed = Vec::new();
        for (name, path) in scan_dir(&self.dir).await? {
            state.next_sequence = state.next_sequence.max(name.sequence + 1);
            if name.sealed {
                sealed.push((name, path));
            } else {
                // Left open by a crash: seal it and queue it like the rest.
                let sealed_name = name.sealed();
                let sealed_path = sealed_name.path_in(&self.dir);
                warn!(segment = %name.file_name(), "sealing segment left open by previous run");
                tokio::fs::rename(&path, &sealed_path).await?;
                sealed.push((sealed_name, sealed_path));
            }
        }
        sealed.sort_by_key(|(name, _)| name.sequence);

        let mut summary = RecoverySummary::default();
        let mut failed: Option<Error> = None;
        for (name, path) in sealed {
            if failed.is_some() {
                state.pending_sealed.push(path);
                continue;
            }
            match self.drain_segment(&path).await {
                Ok(records) => {
                    summary.segments += 1;
                    summary.records += records;
                    debug!(segment = %name.file_name(), records, "segment drained");
                }
                Err(e) => {
                    warn!(segment = %name.file_name(), error = %e, "handoff failed, segment retained");
                    state.pending_sealed.push(path);
                    failed = Some(e);
                }
            }
        }

        self.open_segment(&mut state).await?;
        info!(
            segments = summary.segments,
            records = summary.records,
            "write-ahead log started"
        );
        match failed {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    /// Append one record. Resolves once the frame is in the OS write
    /// buffer (and fsynced, when `sync_on_put` is set).
    pub async fn put(&self, key: F::Key, value: F::State) -> Result<()> {
        let record = Record::new(key, value, self.clock.now());
        let payload = self.codec.encode(&record)?;
        let frame = encode_frame(&payload);

        let mut state = self.state.lock().await;
        if state.stopped {
            return Err(Error::Shutdown);
        }
        if state.active.is_none() {
            self.open_segment(&mut state).await?;
        }
        let segment = state.active.as_mut().expect("segment opened above");

        if let Err(e) = append_frame(&mut segment.file, &frame, self.config.sync_on_put).await {
            // The segment may hold a torn frame now; seal it so the next
            // put starts clean and recovery can salvage the prefix.
            let err = classify_append_error(e);
            if let Err(seal_err) = self.seal_active(&mut state).await {
                warn!(error = %seal_err, "failed to seal segment after append error");
            }
            return Err(err);
        }
        segment.written += frame.len() as u64;

        if segment.written >= self.config.segment_size {
            self.seal_active(&mut state).await?;
            self.open_segment(&mut state).await?;
            // Size-triggered handoff failures keep the segment for a
            // later retry; the put itself is already durable.
            if let Err(e) = self.drain_pending(&mut state).await {
                warn!(error = %e, "handoff after rotation failed, segment retained");
            }
        }
        Ok(())
    }

    /// Seal the current segment, open a new one, and drain everything
    /// sealed so far. Resolves once the store has acknowledged every
    /// record in the sealed segments.
    pub async fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.stopped {
            return Err(Error::Shutdown);
        }
        self.rotate_and_drain(&mut state).await
    }

    /// Flush only when the open segment has unflushed appends or a prior
    /// handoff is pending. Used by the interval rotation task.
    pub async fn flush_if_dirty(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.stopped {
            return Ok(());
        }
        let dirty = state.active.as_ref().map(|a| a.written > 0).unwrap_or(false);
        if !dirty && state.pending_sealed.is_empty() {
            return Ok(());
        }
        self.rotate_and_drain(&mut state).await
    }

    /// Final flush, then refuse new writes with `Shutdown`.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.stopped {
            return Ok(());
        }
        state.stopped = true;
        let result = self.rotate_and_drain(&mut state).await;
        if let Some(active) = state.active.take() {
            // rotate_and_drain failed before sealing; keep the file for
            // the next start() rather than dropping appends.
            drop(active);
        }
        result
    }

    /// The WAL directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn rotate_and_drain(&self, state: &mut WalState) -> Result<()> {
        self.seal_active(state).await?;
        if !state.stopped {
            self.open_segment(state).await?;
        }
        self.drain_pending(state).await
    }

    async fn open_segment(&self, state: &mut WalState) -> Result<()> {
        let name = SegmentName::open(self.node_id.clone(), state.next_sequence);
        state.next_sequence += 1;
        let path = name.path_in(&self.dir);
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await
            .map_err(classify_append_error)?;
        state.active = Some(ActiveSegment {
            file,
            name,
            path,
            written: 0,
        });
        Ok(())
    }

    /// Close and rename the active segment; empty segments are unlinked
    /// instead of sealed.
    async fn seal_active(&self, state: &mut WalState) -> Result<()> {
        let Some(mut active) = state.active.take() else {
            return Ok(());
        };
        if active.written == 0 {
            drop(active.file);
            tokio::fs::remove_file(&active.path).await?;
            return Ok(());
        }
        active.file.flush().await?;
        active.file.sync_all().await?;
        drop(active.file);
        let sealed_path = active.name.sealed().path_in(&self.dir);
        tokio::fs::rename(&active.path, &sealed_path).await?;
        state.pending_sealed.push(sealed_path);
        Ok(())
    }

    async fn drain_pending(&self, state: &mut WalState) -> Result<()> {
        let pending = std::mem::take(&mut state.pending_sealed);
        for (i, path) in pending.iter().enumerate() {
            if let Err(e) = self.drain_segment(path).await {
                state.pending_sealed.extend(pending[i..].iter().cloned());
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stream a sealed segment into one upload session, then unlink it.
    /// The file is removed only after the session's end-of-stream ack.
    async fn drain_segment(&self, path: &Path) -> Result<u64> {
        let records = self.read_segment(path).await?;
        if records.is_empty() {
            tokio::fs::remove_file(path).await?;
            return Ok(0);
        }
        let count = records.len() as u64;
        let mut sink = self.store.upload().await?;
        for record in records {
            sink.push(record).await?;
        }
        sink.finish().await?;
        tokio::fs::remove_file(path).await?;
        Ok(count)
    }

    /// Read a segment up to its last valid frame boundary.
    async fn read_segment(&self, path: &Path) -> Result<Vec<Record<F::Key, F::State>>> {
        let file = File::open(path).await?;
        let mut reader = FrameReader::new(BufReader::new(file));
        let mut records = Vec::new();
        loop {
            match reader.next_frame().await {
                Ok(Some(payload)) => match self.codec.decode(&payload) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        warn!(
                            segment = %path.display(),
                            error = %e,
                            valid_bytes = reader.consumed(),
                            kept = records.len(),
                            "undecodable record, dropping segment tail"
                        );
                        break;
                    }
                },
                Ok(None) => break,
                Err(e) if e.is_malformed() => {
                    warn!(
                        segment = %path.display(),
                        error = %e,
                        valid_bytes = reader.consumed(),
                        kept = records.len(),
                        "malformed segment tail dropped"
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }
}

/// Write one frame and push it through the file's internal buffer into
/// the OS write buffer; a resolved put must survive a process crash that
/// leaves the OS running.
async fn append_frame(file: &mut File, frame: &[u8], sync: bool) -> std::io::Result<()> {
    file.write_all(frame).await?;
    file.flush().await?;
    if sync {
        file.sync_data().await?;
    }
    Ok(())
}

/// Running out of disk on the log is not retriable.
fn classify_append_error(e: std::io::Error) -> Error {
    // ENOSPC
    if e.raw_os_error() == Some(28) {
        Error::fatal_with("write-ahead log device is full", e)
    } else {
        Error::transient_with("write-ahead log append failed", e)
    }
}
