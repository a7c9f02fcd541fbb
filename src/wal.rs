//! Write-Ahead Log: domain records on top of the segment store.
//!
//! Every sample record carries its full label set, so a reader can rebuild series identity
//! from sample records alone. IO failures are returned to the caller untouched; nothing is
//! retried here.

use crate::error::HeadError;
use crate::record::{decode_payload, encode_sample, encode_series, RecordType, WalRecord};
use crate::segments::{
    list_segment_ids, read_segment, segment_path, ScanStop, SegmentInfo, SegmentStore,
    SegmentStoreConfig,
};
use crate::telemetry::{HeadEvent, HeadEventListener};
use crate::types::{LabelSet, Sample};

use rayon::prelude::*;
use std::fmt;
use std::fs;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

#[derive(Debug)]
pub struct Wal {
    store: SegmentStore,
    events: Arc<dyn HeadEventListener>,
}

/// A decoded record together with where it was found.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayedRecord {
    pub segment: u64,
    pub offset: u64,
    pub record: WalRecord,
}

/// The first damaged record met during replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Corruption {
    pub segment: u64,
    /// Offset of the damaged record's header; everything before it is intact.
    pub offset: u64,
    pub reason: CorruptionReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorruptionReason {
    /// The frame itself is damaged (checksum, torn tail, unknown type).
    Frame(ScanStop),
    /// The frame is intact but its payload does not decode.
    Payload(String),
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            CorruptionReason::Frame(stop) => write!(f, "segment {}: {}", self.segment, stop),
            CorruptionReason::Payload(e) => write!(
                f,
                "segment {}: undecodable payload at offset {}: {}",
                self.segment, self.offset, e
            ),
        }
    }
}

impl Corruption {
    pub fn to_error(&self) -> HeadError {
        match &self.reason {
            CorruptionReason::Frame(ScanStop::ChecksumMismatch {
                offset,
                expected,
                actual,
            }) => HeadError::ChecksumMismatch {
                segment: self.segment,
                offset: *offset,
                expected: *expected,
                actual: *actual,
            },
            _ => HeadError::Corruption {
                details: self.to_string(),
                segment: Some(self.segment),
                offset: Some(self.offset),
            },
        }
    }
}

/// Totals from a streaming replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub segments: usize,
    pub records: usize,
    /// Where replay stopped early, if it did. Records after this point (in this segment
    /// and every later one) were not delivered.
    pub corruption: Option<Corruption>,
}

/// Every intact record of a WAL directory, in log order.
#[derive(Debug, Clone, Default)]
pub struct WalReplay {
    pub records: Vec<ReplayedRecord>,
    pub segments: usize,
    pub corruption: Option<Corruption>,
}

impl Wal {
    pub fn open<P: AsRef<Path>>(dir: P, config: SegmentStoreConfig) -> Result<Self, HeadError> {
        let events = config.event_listener.clone();
        let store = SegmentStore::open(dir, config)?;
        Ok(Self { store, events })
    }

    /// Durably records a series definition.
    pub fn log_series(&self, labels: &LabelSet) -> Result<u64, HeadError> {
        self.store
            .append_record(RecordType::Series, &encode_series(labels))
    }

    /// Durably records one sample, with its full label set.
    pub fn log_sample(&self, labels: &LabelSet, sample: Sample) -> Result<u64, HeadError> {
        self.store
            .append_record(RecordType::Samples, &encode_sample(labels, sample))
    }

    pub fn checkpoint(&self) -> Result<(), HeadError> {
        self.store.checkpoint()
    }

    pub fn clean(&self) -> Result<usize, HeadError> {
        self.store.clean()
    }

    pub fn close(&self) -> Result<(), HeadError> {
        self.store.close()
    }

    pub fn dir(&self) -> &Path {
        self.store.dir()
    }

    pub fn segments(&self) -> Result<Vec<SegmentInfo>, HeadError> {
        self.store.segments()
    }

    pub fn active_segment_id(&self) -> Result<u64, HeadError> {
        self.store.active_segment_id()
    }

    pub fn last_checkpoint(&self) -> Result<Option<SystemTime>, HeadError> {
        self.store.last_checkpoint()
    }

    /// Reads back this WAL's directory. Only meaningful while no appends are in flight;
    /// a record being written concurrently shows up as a torn tail.
    pub fn read_records(&self) -> Result<WalReplay, HeadError> {
        Self::replay(self.store.dir())
    }

    /// Truncates the log right before a damaged record so later appends are replayable.
    pub fn repair(&self, corruption: &Corruption) -> Result<usize, HeadError> {
        let removed = self
            .store
            .truncate_at(corruption.segment, corruption.offset)?;
        self.events.on_event(HeadEvent::WalRepaired {
            segment: corruption.segment,
            offset: corruption.offset,
            removed_segments: removed,
        });
        Ok(removed)
    }

    /// Collects every intact record in `dir`.
    pub fn replay<P: AsRef<Path>>(dir: P) -> Result<WalReplay, HeadError> {
        let mut records = Vec::new();
        let summary = Self::replay_with(dir, |rec| {
            records.push(rec);
            Ok(())
        })?;
        Ok(WalReplay {
            records,
            segments: summary.segments,
            corruption: summary.corruption,
        })
    }

    /// Streams every intact record in `dir` to `apply`, in log order.
    ///
    /// Segments are read and checksummed in parallel a few at a time, then applied
    /// sequentially. Replay stops at the first damaged record anywhere in the log: records
    /// are totally ordered, so nothing after a gap is applied.
    pub fn replay_with<P, F>(dir: P, mut apply: F) -> Result<ReplaySummary, HeadError>
    where
        P: AsRef<Path>,
        F: FnMut(ReplayedRecord) -> Result<(), HeadError>,
    {
        let dir = dir.as_ref();
        let ids = list_segment_ids(dir)?;
        let mut sizes = Vec::with_capacity(ids.len());
        for id in &ids {
            sizes.push(fs::metadata(segment_path(dir, *id))?.len());
        }
        let mut summary = ReplaySummary::default();
        let windows = replay_windows(
            &sizes,
            REPLAY_READ_BUDGET_BYTES,
            rayon::current_num_threads(),
        );

        'segments: for range in windows {
            let batch = &ids[range];
            let scans: Vec<_> = batch
                .par_iter()
                .map(|id| read_segment(&segment_path(dir, *id)))
                .collect();

            for (&segment, scan) in batch.iter().zip(scans) {
                let scan = scan?;
                summary.segments += 1;

                for raw in scan.records {
                    match decode_payload(raw.typ, &raw.payload) {
                        Ok(record) => {
                            summary.records += 1;
                            apply(ReplayedRecord {
                                segment,
                                offset: raw.offset,
                                record,
                            })?;
                        }
                        Err(e) => {
                            summary.corruption = Some(Corruption {
                                segment,
                                offset: raw.offset,
                                reason: CorruptionReason::Payload(e),
                            });
                            break 'segments;
                        }
                    }
                }

                if let Some(stop) = scan.stop {
                    summary.corruption = Some(Corruption {
                        segment,
                        offset: stop.offset(),
                        reason: CorruptionReason::Frame(stop),
                    });
                    break 'segments;
                }
            }
        }
        Ok(summary)
    }
}

/// Upper bound on segment bytes held in memory by one parallel replay window.
pub const REPLAY_READ_BUDGET_BYTES: u64 = 256 * 1024 * 1024;

/// Splits consecutive segments into read windows of at most `max_segments` entries whose
/// sizes sum to at most `budget`. A segment larger than the budget gets a window to itself.
fn replay_windows(sizes: &[u64], budget: u64, max_segments: usize) -> Vec<Range<usize>> {
    let max_segments = max_segments.max(1);
    let mut windows = Vec::new();
    let mut start = 0;
    let mut bytes = 0u64;
    for (i, &size) in sizes.iter().enumerate() {
        let full = i - start == max_segments || bytes.saturating_add(size) > budget;
        if i > start && full {
            windows.push(start..i);
            start = i;
            bytes = 0;
        }
        bytes = bytes.saturating_add(size);
    }
    if start < sizes.len() {
        windows.push(start..sizes.len());
    }
    windows
}
