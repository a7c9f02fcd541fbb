#![doc = include_str!("../README.md")]
// Declare modules
pub mod error;
pub mod head;
pub mod record;
pub mod segments;
pub mod telemetry;
pub mod types;
pub mod wal;

/// Error type for WAL and head operations.
pub use crate::error::{ErrorKind, HeadError};
/// The in-memory head block and its configuration.
pub use crate::head::{Head, HeadOptions, MemChunk, MemSeries};
/// Decoded WAL record and on-disk record type tags.
pub use crate::record::{RecordType, WalRecord};
/// Segmented append-only log underneath the WAL.
pub use crate::segments::{SegmentInfo, SegmentState, SegmentStore, SegmentStoreConfig};
/// Structured event hook for observability.
pub use crate::telemetry::{HeadEvent, HeadEventListener, TracingEventListener};
/// Label sets, samples and series references.
pub use crate::types::{Label, LabelSet, Sample, SeriesRef, Timestamp, Value};
/// Write-ahead log and replay results.
pub use crate::wal::{Corruption, ReplaySummary, Wal, WalReplay};
