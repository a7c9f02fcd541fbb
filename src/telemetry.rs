use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::types::{SeriesRef, Timestamp};

/// Structured, in-process event hook for observability.
///
/// The core is a library and never writes to stdout/stderr itself. Callers provide an
/// implementation that forwards these events wherever they want; [`TracingEventListener`]
/// forwards them to `tracing`.
pub trait HeadEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: HeadEvent);
}

/// Structured events emitted by the segment store, WAL and head.
#[derive(Debug, Clone, PartialEq)]
pub enum HeadEvent {
    SegmentCreated { id: u64, path: PathBuf },
    SegmentRotated { sealed: u64, active: u64, sealed_bytes: u64 },
    CheckpointCompleted { active: u64, flushed: usize },
    SegmentRemoved { id: u64 },
    SegmentRemoveFailed { id: u64, error: String },
    SyncTimedOut { segment: u64, timeout: Duration },
    /// A rejected record could not be cut off again; it may reappear on replay.
    RollbackFailed { segment: u64, offset: u64, error: String },
    DirSyncFailed { path: PathBuf, error: String },

    ReplayCompleted { records: usize, series: usize, samples: usize },
    ReplayStopped { segment: u64, offset: u64, reason: String },
    WalRepaired { segment: u64, offset: u64, removed_segments: usize },

    SeriesCreated { series_ref: SeriesRef },
    OutOfOrderSample { series_ref: SeriesRef, timestamp: Timestamp, max_time: Timestamp },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl HeadEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: HeadEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn HeadEventListener> {
    Arc::new(NoopEventListener)
}

/// Forwards every event to `tracing` under the `headwal` target.
#[derive(Debug, Default)]
pub struct TracingEventListener;

impl HeadEventListener for TracingEventListener {
    fn on_event(&self, event: HeadEvent) {
        match event {
            HeadEvent::SegmentCreated { id, path } => {
                tracing::debug!(target: "headwal", segment = id, path = %path.display(), "segment created");
            }
            HeadEvent::SegmentRotated { sealed, active, sealed_bytes } => {
                tracing::info!(target: "headwal", sealed, active, sealed_bytes, "segment rotated");
            }
            HeadEvent::CheckpointCompleted { active, flushed } => {
                tracing::info!(target: "headwal", active, flushed, "checkpoint completed");
            }
            HeadEvent::SegmentRemoved { id } => {
                tracing::debug!(target: "headwal", segment = id, "segment removed");
            }
            HeadEvent::SegmentRemoveFailed { id, error } => {
                tracing::warn!(target: "headwal", segment = id, %error, "segment removal failed");
            }
            HeadEvent::SyncTimedOut { segment, timeout } => {
                tracing::error!(target: "headwal", segment, ?timeout, "fsync timed out");
            }
            HeadEvent::RollbackFailed { segment, offset, error } => {
                tracing::error!(target: "headwal", segment, offset, %error, "rejected record could not be rolled back");
            }
            HeadEvent::DirSyncFailed { path, error } => {
                tracing::warn!(target: "headwal", path = %path.display(), %error, "directory fsync failed");
            }
            HeadEvent::ReplayCompleted { records, series, samples } => {
                tracing::info!(target: "headwal", records, series, samples, "WAL replay completed");
            }
            HeadEvent::ReplayStopped { segment, offset, reason } => {
                tracing::warn!(target: "headwal", segment, offset, %reason, "WAL replay stopped at damaged record");
            }
            HeadEvent::WalRepaired { segment, offset, removed_segments } => {
                tracing::warn!(target: "headwal", segment, offset, removed_segments, "WAL truncated after damaged record");
            }
            HeadEvent::SeriesCreated { series_ref } => {
                tracing::trace!(target: "headwal", series_ref, "series created");
            }
            HeadEvent::OutOfOrderSample { series_ref, timestamp, max_time } => {
                tracing::debug!(target: "headwal", series_ref, timestamp, max_time, "out-of-order sample accepted");
            }
        }
    }
}

/// Metrics instrumentation through the `metrics` facade.
///
/// Recording is effectively a no-op until the embedding process installs a recorder.
/// Counters are exposed as `<name>_total` by Prometheus-style exporters.
pub mod db_metrics {
    use super::*;

    use ::metrics::{describe_counter, describe_histogram, Unit};

    pub const SAMPLES_APPENDED: &str = "headwal_samples_appended";
    pub const SERIES_CREATED: &str = "headwal_series_created";
    pub const OUT_OF_ORDER_SAMPLES: &str = "headwal_out_of_order_samples";
    pub const CHUNKS_SEALED: &str = "headwal_chunks_sealed";

    pub const WAL_BYTES_WRITTEN: &str = "headwal_wal_bytes_written";
    pub const WAL_FSYNC_DURATION_SECONDS: &str = "headwal_wal_fsync_duration_seconds";
    pub const WAL_SEGMENTS_ROTATED: &str = "headwal_wal_segments_rotated";
    pub const WAL_SEGMENTS_REMOVED: &str = "headwal_wal_segments_removed";

    #[inline]
    pub fn record_sample_appended() {
        ::metrics::counter!(SAMPLES_APPENDED).increment(1);
    }

    #[inline]
    pub fn record_series_created() {
        ::metrics::counter!(SERIES_CREATED).increment(1);
    }

    #[inline]
    pub fn record_out_of_order_sample() {
        ::metrics::counter!(OUT_OF_ORDER_SAMPLES).increment(1);
    }

    #[inline]
    pub fn record_chunk_sealed() {
        ::metrics::counter!(CHUNKS_SEALED).increment(1);
    }

    #[inline]
    pub fn record_wal_bytes_written(bytes: u64) {
        if bytes > 0 {
            ::metrics::counter!(WAL_BYTES_WRITTEN).increment(bytes);
        }
    }

    #[inline]
    pub fn record_wal_fsync(duration: Duration) {
        ::metrics::histogram!(WAL_FSYNC_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    #[inline]
    pub fn record_segment_rotated() {
        ::metrics::counter!(WAL_SEGMENTS_ROTATED).increment(1);
    }

    #[inline]
    pub fn record_segments_removed(count: u64) {
        if count > 0 {
            ::metrics::counter!(WAL_SEGMENTS_REMOVED).increment(count);
        }
    }

    /// Registers descriptions for every metric. Call once after installing a recorder.
    pub fn describe_all() {
        describe_counter!(
            SAMPLES_APPENDED,
            Unit::Count,
            "Total number of samples accepted by Head::append."
        );
        describe_counter!(
            SERIES_CREATED,
            Unit::Count,
            "Total number of series created in the head."
        );
        describe_counter!(
            OUT_OF_ORDER_SAMPLES,
            Unit::Count,
            "Samples accepted with a timestamp older than their chunk's max time."
        );
        describe_counter!(
            CHUNKS_SEALED,
            Unit::Count,
            "Chunks sealed because they reached their sample capacity."
        );
        describe_counter!(
            WAL_BYTES_WRITTEN,
            Unit::Bytes,
            "Total number of bytes written to WAL segments (headers and payloads)."
        );
        describe_counter!(
            WAL_SEGMENTS_ROTATED,
            Unit::Count,
            "Number of times the active WAL segment was sealed and replaced."
        );
        describe_counter!(
            WAL_SEGMENTS_REMOVED,
            Unit::Count,
            "Number of flushed WAL segments deleted by clean."
        );
        describe_histogram!(
            WAL_FSYNC_DURATION_SECONDS,
            Unit::Seconds,
            "Duration of WAL fsync/sync_data calls."
        );
    }
}
