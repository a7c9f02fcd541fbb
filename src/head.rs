//! Head block: the in-memory, not-yet-compacted view of recent samples, and the single
//! entry point for ingestion.
//!
//! Locking has two tiers. A head-wide `RwLock` guards the reference map and label index
//! and is never held across IO. Each series has its own `Mutex` over its chunks, taken only
//! after the WAL append for the sample has returned. New series are serialised by a
//! separate creation mutex that does span the WAL call, so a series becomes reachable only
//! once its definition is durable.

use crate::error::HeadError;
use crate::record::WalRecord;
use crate::segments::{SegmentStoreConfig, DEFAULT_SEGMENT_CAPACITY};
use crate::telemetry::{db_metrics, noop_event_listener, HeadEvent, HeadEventListener};
use crate::types::{LabelSet, Sample, SeriesRef, Timestamp};
use crate::wal::Wal;

use std::collections::HashMap;
use std::mem;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Default number of samples per chunk.
pub const DEFAULT_CHUNK_CAPACITY: usize = 120;

/// Configuration options for the head block.
#[derive(Debug, Clone)]
pub struct HeadOptions {
    /// Directory holding the WAL segments.
    pub wal_dir: PathBuf,
    /// Maximum samples per chunk before it is sealed.
    pub chunk_capacity: usize,
    /// Byte size at which the active WAL segment rotates.
    pub segment_capacity_bytes: u64,
    /// Optional upper bound on each WAL fsync.
    pub sync_timeout: Option<Duration>,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn HeadEventListener>,
}

impl Default for HeadOptions {
    fn default() -> Self {
        HeadOptions {
            wal_dir: PathBuf::from("./data/wal"),
            chunk_capacity: DEFAULT_CHUNK_CAPACITY,
            segment_capacity_bytes: DEFAULT_SEGMENT_CAPACITY,
            sync_timeout: None,
            event_listener: noop_event_listener(),
        }
    }
}

/// Append-only buffer of samples for one series.
///
/// Once a chunk is replaced by a fresh one it is never written again; sealed chunks are
/// what a compactor consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct MemChunk {
    min_time: Timestamp,
    max_time: Timestamp,
    samples: Vec<Sample>,
}

impl MemChunk {
    fn empty() -> Self {
        Self {
            min_time: 0,
            max_time: 0,
            samples: Vec::new(),
        }
    }

    fn starting_at(ts: Timestamp, capacity: usize) -> Self {
        Self {
            min_time: ts,
            max_time: ts,
            samples: Vec::with_capacity(capacity),
        }
    }

    fn push(&mut self, sample: Sample) {
        if self.samples.is_empty() {
            self.min_time = sample.timestamp;
            self.max_time = sample.timestamp;
        } else {
            self.min_time = self.min_time.min(sample.timestamp);
            self.max_time = self.max_time.max(sample.timestamp);
        }
        self.samples.push(sample);
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn min_time(&self) -> Timestamp {
        self.min_time
    }

    pub fn max_time(&self) -> Timestamp {
        self.max_time
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[derive(Debug)]
struct SeriesChunks {
    head: MemChunk,
    sealed: Vec<Arc<MemChunk>>,
    // Newest timestamp seen by this series, across chunk boundaries.
    max_time: Option<Timestamp>,
}

/// One series held in memory.
#[derive(Debug)]
pub struct MemSeries {
    series_ref: SeriesRef,
    labels: LabelSet,
    chunks: Mutex<SeriesChunks>,
}

impl MemSeries {
    fn new(series_ref: SeriesRef, labels: LabelSet) -> Self {
        Self {
            series_ref,
            labels,
            chunks: Mutex::new(SeriesChunks {
                head: MemChunk::empty(),
                sealed: Vec::new(),
                max_time: None,
            }),
        }
    }

    pub fn series_ref(&self) -> SeriesRef {
        self.series_ref
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    /// Copy of the chunk currently accepting samples.
    pub fn current_chunk(&self) -> Result<MemChunk, HeadError> {
        Ok(self.chunks.lock()?.head.clone())
    }

    /// Sealed chunks awaiting compaction, oldest first.
    pub fn sealed_chunks(&self) -> Result<Vec<Arc<MemChunk>>, HeadError> {
        Ok(self.chunks.lock()?.sealed.clone())
    }

    /// Hands the sealed chunks to the caller and forgets them.
    pub fn take_sealed_chunks(&self) -> Result<Vec<Arc<MemChunk>>, HeadError> {
        Ok(mem::take(&mut self.chunks.lock()?.sealed))
    }

    /// Number of chunks: sealed ones plus the current one.
    pub fn num_chunks(&self) -> Result<usize, HeadError> {
        Ok(self.chunks.lock()?.sealed.len() + 1)
    }

    /// Samples held in memory for this series, across all chunks.
    pub fn num_samples(&self) -> Result<usize, HeadError> {
        let c = self.chunks.lock()?;
        Ok(c.head.len() + c.sealed.iter().map(|ch| ch.len()).sum::<usize>())
    }
}

#[derive(Debug, Default)]
struct SeriesIndex {
    by_ref: HashMap<SeriesRef, Arc<MemSeries>>,
    by_labels: HashMap<LabelSet, SeriesRef>,
}

/// The in-memory head block.
#[derive(Debug)]
pub struct Head {
    series: RwLock<SeriesIndex>,
    creation: Mutex<()>,
    last_ref: AtomicU64,
    wal: Wal,
    min_time: AtomicI64,
    max_time: AtomicI64,
    chunk_capacity: usize,
    events: Arc<dyn HeadEventListener>,
}

impl Head {
    /// Opens the WAL in `options.wal_dir`, replays it into memory and returns a head ready
    /// for ingestion.
    ///
    /// Replay stops at the first damaged record; the log is then truncated at that point
    /// so new records are appended where the next replay can reach them. Series references
    /// are reassigned in the order their records are met.
    pub fn open(options: HeadOptions) -> Result<Self, HeadError> {
        if options.chunk_capacity == 0 {
            return Err(HeadError::Config(
                "chunk_capacity must be greater than zero".to_string(),
            ));
        }
        let wal = Wal::open(
            &options.wal_dir,
            SegmentStoreConfig {
                segment_capacity_bytes: options.segment_capacity_bytes,
                sync_timeout: options.sync_timeout,
                event_listener: options.event_listener.clone(),
            },
        )?;

        let head = Head {
            series: RwLock::new(SeriesIndex::default()),
            creation: Mutex::new(()),
            last_ref: AtomicU64::new(0),
            wal,
            min_time: AtomicI64::new(i64::MAX),
            max_time: AtomicI64::new(i64::MIN),
            chunk_capacity: options.chunk_capacity,
            events: options.event_listener,
        };
        head.recover()?;
        Ok(head)
    }

    fn recover(&self) -> Result<(), HeadError> {
        let mut samples = 0usize;
        let summary = Wal::replay_with(self.wal.dir(), |rec| {
            samples += self.apply_replayed(rec.record)?;
            Ok(())
        })?;

        if let Some(c) = &summary.corruption {
            self.events.on_event(HeadEvent::ReplayStopped {
                segment: c.segment,
                offset: c.offset,
                reason: c.to_string(),
            });
            self.wal.repair(c)?;
        }
        self.events.on_event(HeadEvent::ReplayCompleted {
            records: summary.records,
            series: self.num_series()?,
            samples,
        });
        Ok(())
    }

    fn apply_replayed(&self, record: WalRecord) -> Result<usize, HeadError> {
        match record {
            WalRecord::Series(labels) => {
                self.get_or_insert_series(labels)?;
                Ok(0)
            }
            WalRecord::Samples { labels, samples } => {
                let series = self.get_or_insert_series(labels)?;
                for sample in &samples {
                    self.append_to_series(&series, *sample)?;
                }
                Ok(samples.len())
            }
            WalRecord::Checkpoint => Ok(0),
        }
    }

    /// Returns the series for `labels`, creating it if needed.
    ///
    /// A new series gets the next reference and its definition is durably logged before
    /// it becomes visible. If the WAL write fails nothing is registered and the reference
    /// is never handed out.
    pub fn resolve_or_create_series(
        &self,
        labels: &LabelSet,
    ) -> Result<Arc<MemSeries>, HeadError> {
        if let Some(s) = self.series_by_labels(labels)? {
            return Ok(s);
        }

        let _creating = self.creation.lock()?;
        if let Some(s) = self.series_by_labels(labels)? {
            return Ok(s);
        }
        let series_ref = self.next_ref();
        self.wal.log_series(labels)?;
        let series = self.insert_series(series_ref, labels.clone())?;
        db_metrics::record_series_created();
        self.events.on_event(HeadEvent::SeriesCreated { series_ref });
        Ok(series)
    }

    /// Ingests one sample.
    ///
    /// The series definition (for a new series) and then the sample are made durable in
    /// the WAL before any chunk is touched, so every sample visible in memory is on disk.
    /// On error the sample must be treated as not ingested.
    pub fn append(&self, labels: &LabelSet, sample: Sample) -> Result<(), HeadError> {
        let series = self.resolve_or_create_series(labels)?;
        self.wal.log_sample(series.labels(), sample)?;
        self.append_to_series(&series, sample)?;
        db_metrics::record_sample_appended();
        Ok(())
    }

    /// Looks a series up by reference.
    ///
    /// References are never removed, so `SeriesNotFound` means the reference was never
    /// assigned by this process.
    pub fn lookup_series(&self, series_ref: SeriesRef) -> Result<Arc<MemSeries>, HeadError> {
        self.series
            .read()?
            .by_ref
            .get(&series_ref)
            .cloned()
            .ok_or(HeadError::SeriesNotFound(series_ref))
    }

    pub fn series_by_labels(
        &self,
        labels: &LabelSet,
    ) -> Result<Option<Arc<MemSeries>>, HeadError> {
        let idx = self.series.read()?;
        Ok(idx
            .by_labels
            .get(labels)
            .and_then(|r| idx.by_ref.get(r))
            .cloned())
    }

    /// All series, ordered by reference.
    pub fn all_series(&self) -> Result<Vec<Arc<MemSeries>>, HeadError> {
        let idx = self.series.read()?;
        let mut out: Vec<_> = idx.by_ref.values().cloned().collect();
        out.sort_by_key(|s| s.series_ref);
        Ok(out)
    }

    pub fn num_series(&self) -> Result<usize, HeadError> {
        Ok(self.series.read()?.by_ref.len())
    }

    /// Smallest timestamp accepted so far; `i64::MAX` while the head is empty.
    pub fn min_time(&self) -> Timestamp {
        self.min_time.load(Ordering::Acquire)
    }

    /// Largest timestamp accepted so far; `i64::MIN` while the head is empty.
    pub fn max_time(&self) -> Timestamp {
        self.max_time.load(Ordering::Acquire)
    }

    /// `(min_time, max_time)`, or `None` before the first sample.
    pub fn time_bounds(&self) -> Option<(Timestamp, Timestamp)> {
        let (min, max) = (self.min_time(), self.max_time());
        (min <= max).then_some((min, max))
    }

    pub fn chunk_capacity(&self) -> usize {
        self.chunk_capacity
    }

    pub fn wal(&self) -> &Wal {
        &self.wal
    }

    /// Marks every WAL segment older than the active one as flushed.
    pub fn checkpoint(&self) -> Result<(), HeadError> {
        self.wal.checkpoint()
    }

    /// Deletes flushed WAL segments, keeping the newest flushed one.
    pub fn clean(&self) -> Result<usize, HeadError> {
        self.wal.clean()
    }

    pub fn close(&self) -> Result<(), HeadError> {
        self.wal.close()
    }

    fn next_ref(&self) -> SeriesRef {
        self.last_ref.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn get_or_insert_series(&self, labels: LabelSet) -> Result<Arc<MemSeries>, HeadError> {
        if let Some(s) = self.series_by_labels(&labels)? {
            return Ok(s);
        }
        let series_ref = self.next_ref();
        self.insert_series(series_ref, labels)
    }

    fn insert_series(
        &self,
        series_ref: SeriesRef,
        labels: LabelSet,
    ) -> Result<Arc<MemSeries>, HeadError> {
        let mut idx = self.series.write()?;
        if let Some(existing) = idx.by_labels.get(&labels).and_then(|r| idx.by_ref.get(r)) {
            return Ok(existing.clone());
        }
        let series = Arc::new(MemSeries::new(series_ref, labels.clone()));
        idx.by_labels.insert(labels, series_ref);
        idx.by_ref.insert(series_ref, series.clone());
        Ok(series)
    }

    fn append_to_series(&self, series: &MemSeries, sample: Sample) -> Result<(), HeadError> {
        let ts = sample.timestamp;
        let mut chunks = series.chunks.lock()?;

        self.min_time.fetch_min(ts, Ordering::AcqRel);
        self.max_time.fetch_max(ts, Ordering::AcqRel);

        if chunks.head.len() >= self.chunk_capacity {
            let fresh = MemChunk::starting_at(ts, self.chunk_capacity);
            let full = mem::replace(&mut chunks.head, fresh);
            chunks.sealed.push(Arc::new(full));
            db_metrics::record_chunk_sealed();
        }

        let newest = chunks.max_time;
        match newest {
            Some(max_time) if ts < max_time => {
                db_metrics::record_out_of_order_sample();
                self.events.on_event(HeadEvent::OutOfOrderSample {
                    series_ref: series.series_ref,
                    timestamp: ts,
                    max_time,
                });
            }
            _ => chunks.max_time = Some(ts),
        }

        chunks.head.push(sample);
        Ok(())
    }
}
