//! Metrics store backends.
//!
//! A [`MetricsStore`] receives batches drained from the event queue and
//! removes records older than a cutoff. Every backend guards its state with a
//! `parking_lot::Mutex`. The file backend rewrites its file outside that lock
//! and re-takes it only to splice in records appended during the sweep.

use crate::event::MetricEvent;
use aurora_core::config::MetricsStoreKind;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Metrics store I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to encode metric event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Metrics store is closed")]
    Closed,
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Persistence backend for metric events.
pub trait MetricsStore: Send + Sync {
    /// Backend name, used in logs.
    fn name(&self) -> &'static str;

    /// Appends a batch, preserving its order.
    fn append(&self, batch: &[MetricEvent]) -> Result<(), StoreError>;

    /// Removes every record stamped before `cutoff_millis`; returns how many.
    fn evict_before(&self, cutoff_millis: i64) -> Result<usize, StoreError>;

    /// Number of records currently held.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the stored records, oldest first.
    fn snapshot(&self) -> Result<Vec<MetricEvent>, StoreError>;

    /// Flushes and releases the backend.
    fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Opens the backend selected by `kind`.
pub fn open_store(kind: &MetricsStoreKind) -> Result<Arc<dyn MetricsStore>, StoreError> {
    let store: Arc<dyn MetricsStore> = match kind {
        MetricsStoreKind::None => Arc::new(NoopMetricsStore::default()),
        MetricsStoreKind::Memory { capacity } => Arc::new(MemoryMetricsStore::new(*capacity)),
        MetricsStoreKind::File { path } => Arc::new(FileMetricsStore::open(path)?),
    };
    info!(store = store.name(), "Metrics store opened");
    Ok(store)
}

// ============================================================================
// No-op
// ============================================================================

/// Discards everything it is given.
#[derive(Debug, Default)]
pub struct NoopMetricsStore {
    discarded: AtomicU64,
}

impl NoopMetricsStore {
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

impl MetricsStore for NoopMetricsStore {
    fn name(&self) -> &'static str {
        "none"
    }

    fn append(&self, batch: &[MetricEvent]) -> Result<(), StoreError> {
        self.discarded.fetch_add(batch.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn evict_before(&self, _cutoff_millis: i64) -> Result<usize, StoreError> {
        Ok(0)
    }

    fn len(&self) -> usize {
        0
    }

    fn snapshot(&self) -> Result<Vec<MetricEvent>, StoreError> {
        Ok(Vec::new())
    }
}

// ============================================================================
// Memory
// ============================================================================

/// Ring buffer of the most recent `capacity` events.
#[derive(Debug)]
pub struct MemoryMetricsStore {
    events: Mutex<VecDeque<MetricEvent>>,
    capacity: usize,
    overwritten: AtomicU64,
}

impl MemoryMetricsStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            overwritten: AtomicU64::new(0),
        }
    }

    /// Events pushed out of the ring by newer ones.
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }
}

impl MetricsStore for MemoryMetricsStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn append(&self, batch: &[MetricEvent]) -> Result<(), StoreError> {
        let mut events = self.events.lock();
        for event in batch {
            if events.len() == self.capacity {
                events.pop_front();
                self.overwritten.fetch_add(1, Ordering::Relaxed);
            }
            events.push_back(event.clone());
        }
        Ok(())
    }

    fn evict_before(&self, cutoff_millis: i64) -> Result<usize, StoreError> {
        let mut events = self.events.lock();
        let before = events.len();
        events.retain(|event| event.timestamp_millis >= cutoff_millis);
        Ok(before - events.len())
    }

    fn len(&self) -> usize {
        self.events.lock().len()
    }

    fn snapshot(&self) -> Result<Vec<MetricEvent>, StoreError> {
        Ok(self.events.lock().iter().cloned().collect())
    }
}

// ============================================================================
// File
// ============================================================================

struct FileState {
    writer: Option<BufWriter<File>>,
    records: usize,
}

/// JSON-lines file: one event per line, appended on write and rewritten
/// (through a temporary file and rename) on eviction.
pub struct FileMetricsStore {
    path: PathBuf,
    state: Mutex<FileState>,
    /// Serializes eviction sweeps
    sweep: Mutex<()>,
}

impl std::fmt::Debug for FileMetricsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileMetricsStore")
            .field("path", &self.path)
            .finish()
    }
}

impl FileMetricsStore {
    /// Opens (or creates) the store file and counts the records it holds.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let records = if path.exists() {
            read_events(&path)?.len()
        } else {
            0
        };
        let writer = open_append(&path)?;
        debug!(path = %path.display(), records, "File metrics store opened");

        Ok(Self {
            path,
            state: Mutex::new(FileState {
                writer: Some(writer),
                records,
            }),
            sweep: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl MetricsStore for FileMetricsStore {
    fn name(&self) -> &'static str {
        "file"
    }

    fn append(&self, batch: &[MetricEvent]) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let writer = state.writer.as_mut().ok_or(StoreError::Closed)?;
        for event in batch {
            serde_json::to_writer(&mut *writer, event)?;
            writer
                .write_all(b"\n")
                .map_err(|e| StoreError::io(&self.path, e))?;
        }
        writer.flush().map_err(|e| StoreError::io(&self.path, e))?;
        state.records += batch.len();
        Ok(())
    }

    /// Rewrites the file without expired records. The append lock is held
    /// only to note the file length and, at the end, to copy the records
    /// appended meanwhile and swap the files.
    fn evict_before(&self, cutoff_millis: i64) -> Result<usize, StoreError> {
        let _sweep = self.sweep.lock();

        let swept_len = {
            let mut state = self.state.lock();
            let writer = state.writer.as_mut().ok_or(StoreError::Closed)?;
            writer.flush().map_err(|e| StoreError::io(&self.path, e))?;
            file_len(&self.path)?
        };

        let prefix = File::open(&self.path)
            .map_err(|e| StoreError::io(&self.path, e))?
            .take(swept_len);
        let events = parse_events(prefix, &self.path)?;
        let before = events.len();
        let kept: Vec<_> = events
            .into_iter()
            .filter(|event| event.timestamp_millis >= cutoff_millis)
            .collect();
        let removed = before - kept.len();
        if removed == 0 {
            return Ok(0);
        }

        let tmp = self.tmp_path();
        let mut out = BufWriter::new(File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?);
        for event in &kept {
            serde_json::to_writer(&mut out, event)?;
            out.write_all(b"\n").map_err(|e| StoreError::io(&tmp, e))?;
        }

        let mut state = self.state.lock();
        let writer = state.writer.as_mut().ok_or(StoreError::Closed)?;
        writer.flush().map_err(|e| StoreError::io(&self.path, e))?;

        let mut tail = File::open(&self.path).map_err(|e| StoreError::io(&self.path, e))?;
        tail.seek(SeekFrom::Start(swept_len))
            .map_err(|e| StoreError::io(&self.path, e))?;
        let mut appended = Vec::new();
        tail.read_to_end(&mut appended)
            .map_err(|e| StoreError::io(&self.path, e))?;
        out.write_all(&appended).map_err(|e| StoreError::io(&tmp, e))?;
        out.flush().map_err(|e| StoreError::io(&tmp, e))?;
        drop(out);

        fs::rename(&tmp, &self.path).map_err(|e| StoreError::io(&self.path, e))?;
        state.writer = Some(open_append(&self.path)?);
        state.records = kept.len() + appended.iter().filter(|b| **b == b'\n').count();
        Ok(removed)
    }

    fn len(&self) -> usize {
        self.state.lock().records
    }

    fn snapshot(&self) -> Result<Vec<MetricEvent>, StoreError> {
        let mut state = self.state.lock();
        if let Some(writer) = state.writer.as_mut() {
            writer.flush().map_err(|e| StoreError::io(&self.path, e))?;
        }
        read_events(&self.path)
    }

    fn close(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if let Some(mut writer) = state.writer.take() {
            writer.flush().map_err(|e| StoreError::io(&self.path, e))?;
        }
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<BufWriter<File>, StoreError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(BufWriter::new)
        .map_err(|e| StoreError::io(path, e))
}

fn file_len(path: &Path) -> Result<u64, StoreError> {
    fs::metadata(path)
        .map(|meta| meta.len())
        .map_err(|e| StoreError::io(path, e))
}

fn read_events(path: &Path) -> Result<Vec<MetricEvent>, StoreError> {
    match File::open(path) {
        Ok(file) => parse_events(file, path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

fn parse_events<R: Read>(reader: R, path: &Path) -> Result<Vec<MetricEvent>, StoreError> {
    let mut events = Vec::new();
    for (index, line) in BufReader::new(reader).lines().enumerate() {
        let line = line.map_err(|e| StoreError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(event) => events.push(event),
            Err(e) => warn!(
                path = %path.display(),
                line = index + 1,
                error = %e,
                "Skipping unreadable metric record"
            ),
        }
    }
    Ok(events)
}
