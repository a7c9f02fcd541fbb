//! Segment store: a directory of size-bounded, append-only WAL segment files.
//!
//! Exactly one segment is active at a time. Each record is framed, checksummed and
//! fsync'd before `append_record` returns. The capacity check runs before a write, so a
//! segment can exceed its capacity by at most one record.

use crate::error::HeadError;
use crate::record::{decode_header, encode_header, RecordType, HEADER_LEN};
use crate::telemetry::{db_metrics, noop_event_listener, HeadEvent, HeadEventListener};

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

pub const SEGMENT_PREFIX: &str = "segment-";
pub const DEFAULT_SEGMENT_CAPACITY: u64 = 128 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct SegmentStoreConfig {
    /// Byte size at which the active segment is sealed and a new one started.
    pub segment_capacity_bytes: u64,
    /// Upper bound on a single fsync. `None` waits indefinitely.
    ///
    /// When set, each fsync runs on a helper thread so the caller can give up on a
    /// stuck device and report [`HeadError::SyncTimeout`].
    pub sync_timeout: Option<Duration>,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn HeadEventListener>,
}

impl Default for SegmentStoreConfig {
    fn default() -> Self {
        Self {
            segment_capacity_bytes: DEFAULT_SEGMENT_CAPACITY,
            sync_timeout: None,
            event_listener: noop_event_listener(),
        }
    }
}

/// Lifecycle state of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// The single segment currently accepting writes.
    Active,
    /// Full, not yet covered by a checkpoint.
    Sealed,
    /// Covered by a completed checkpoint; eligible for deletion.
    Flushed,
}

/// Snapshot of one segment's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub id: u64,
    pub state: SegmentState,
    pub offset: u64,
}

#[derive(Debug)]
struct Segment {
    id: u64,
    file: Option<File>,
    offset: u64,
    state: SegmentState,
}

#[derive(Debug)]
struct StoreState {
    segments: BTreeMap<u64, Segment>,
    active: u64,
    last_checkpoint: Option<SystemTime>,
    closed: bool,
}

#[derive(Debug)]
pub struct SegmentStore {
    dir: PathBuf,
    capacity: u64,
    sync_timeout: Option<Duration>,
    events: Arc<dyn HeadEventListener>,
    // Guards the segment table and active selection. Held across write + fsync so that
    // durable records are totally ordered.
    state: Mutex<StoreState>,
}

impl SegmentStore {
    /// Opens (or creates) the segment directory.
    ///
    /// Every `segment-<digits>` file is opened read/write with its offset set to the file
    /// size. The highest ID becomes active, all others sealed. Other files are ignored.
    /// Segment 0 is created when the directory holds no segments.
    pub fn open<P: AsRef<Path>>(dir: P, config: SegmentStoreConfig) -> Result<Self, HeadError> {
        if config.segment_capacity_bytes == 0 {
            return Err(HeadError::Config(
                "segment_capacity_bytes must be greater than zero".to_string(),
            ));
        }
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let store = Self {
            dir,
            capacity: config.segment_capacity_bytes,
            sync_timeout: config.sync_timeout,
            events: config.event_listener,
            state: Mutex::new(StoreState {
                segments: BTreeMap::new(),
                active: 0,
                last_checkpoint: None,
                closed: false,
            }),
        };

        let mut segments = BTreeMap::new();
        for id in list_segment_ids(&store.dir)? {
            let file = open_segment_file(&segment_path(&store.dir, id), false)?;
            let offset = file.metadata()?.len();
            segments.insert(
                id,
                Segment {
                    id,
                    file: Some(file),
                    offset,
                    state: SegmentState::Sealed,
                },
            );
        }

        let active = match segments.keys().next_back().copied() {
            Some(id) => id,
            None => {
                let seg = store.create_segment(0)?;
                segments.insert(0, seg);
                0
            }
        };
        if let Some(seg) = segments.get_mut(&active) {
            seg.state = SegmentState::Active;
        }

        {
            let mut st = store.state.lock()?;
            st.segments = segments;
            st.active = active;
        }
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn active_segment_id(&self) -> Result<u64, HeadError> {
        Ok(self.state.lock()?.active)
    }

    /// Returns every segment currently tracked, ordered by ID.
    pub fn segments(&self) -> Result<Vec<SegmentInfo>, HeadError> {
        let st = self.state.lock()?;
        Ok(st
            .segments
            .values()
            .map(|s| SegmentInfo {
                id: s.id,
                state: s.state,
                offset: s.offset,
            })
            .collect())
    }

    /// Wall-clock time of the last completed checkpoint, if any.
    pub fn last_checkpoint(&self) -> Result<Option<SystemTime>, HeadError> {
        Ok(self.state.lock()?.last_checkpoint)
    }

    /// Frames `payload`, appends it to the active segment (rotating first if the segment
    /// is full) and fsyncs. Returns the segment offset after the write.
    pub fn append_record(&self, typ: RecordType, payload: &[u8]) -> Result<u64, HeadError> {
        let mut st = self.state.lock()?;
        self.append_locked(&mut st, typ, payload)
    }

    /// Appends a durable checkpoint marker, then marks every segment older than the
    /// active one as flushed.
    pub fn checkpoint(&self) -> Result<(), HeadError> {
        let mut st = self.state.lock()?;
        self.append_locked(&mut st, RecordType::Checkpoint, &[])?;

        let active = st.active;
        let mut flushed = 0;
        for seg in st.segments.values_mut() {
            if seg.id < active && seg.state != SegmentState::Flushed {
                seg.state = SegmentState::Flushed;
                flushed += 1;
            }
        }
        st.last_checkpoint = Some(SystemTime::now());
        self.events
            .on_event(HeadEvent::CheckpointCompleted { active, flushed });
        Ok(())
    }

    /// Deletes flushed segments oldest first, always keeping the most recently flushed
    /// one as a recovery point. Returns how many segments were removed.
    ///
    /// The first failed deletion aborts the pass. Segments removed before it stay
    /// removed; the failing segment stays tracked (flushed, handle closed) and is retried
    /// by the next pass.
    pub fn clean(&self) -> Result<usize, HeadError> {
        let mut st = self.state.lock()?;
        if st.closed {
            return Err(HeadError::Closed);
        }

        let mut flushed: Vec<u64> = st
            .segments
            .values()
            .filter(|s| s.state == SegmentState::Flushed)
            .map(|s| s.id)
            .collect();
        flushed.pop();

        let mut removed = 0usize;
        for id in flushed {
            if let Some(seg) = st.segments.get_mut(&id) {
                drop(seg.file.take());
            }
            if let Err(e) = remove_segment_file(&segment_path(&self.dir, id)) {
                self.events.on_event(HeadEvent::SegmentRemoveFailed {
                    id,
                    error: e.to_string(),
                });
                db_metrics::record_segments_removed(removed as u64);
                if removed > 0 {
                    if let Err(sync) = sync_dir(&self.dir) {
                        self.events.on_event(HeadEvent::DirSyncFailed {
                            path: self.dir.clone(),
                            error: sync.to_string(),
                        });
                    }
                }
                return Err(e.into());
            }
            st.segments.remove(&id);
            removed += 1;
            self.events.on_event(HeadEvent::SegmentRemoved { id });
        }

        if removed > 0 {
            sync_dir(&self.dir)?;
            db_metrics::record_segments_removed(removed as u64);
        }
        Ok(removed)
    }

    /// Drops every segment after `id`, truncates segment `id` to `offset` and makes it
    /// the active segment. Returns the number of later segments removed.
    ///
    /// Used after replay stops at a damaged record so that new writes land where the
    /// next replay can reach them.
    pub fn truncate_at(&self, id: u64, offset: u64) -> Result<usize, HeadError> {
        let mut st = self.state.lock()?;
        if st.closed {
            return Err(HeadError::Closed);
        }
        if !st.segments.contains_key(&id) {
            return Err(HeadError::Internal(format!(
                "cannot truncate unknown segment {}",
                id
            )));
        }

        let later: Vec<u64> = st.segments.range(id + 1..).map(|(k, _)| *k).collect();
        let mut removed = 0usize;
        for later_id in later {
            if let Some(mut seg) = st.segments.remove(&later_id) {
                drop(seg.file.take());
            }
            remove_segment_file(&segment_path(&self.dir, later_id))?;
            removed += 1;
        }

        let path = segment_path(&self.dir, id);
        let seg = st
            .segments
            .get_mut(&id)
            .ok_or_else(|| HeadError::Internal(format!("segment {} vanished", id)))?;
        if seg.file.is_none() {
            seg.file = Some(open_segment_file(&path, false)?);
        }
        let file = seg
            .file
            .as_ref()
            .ok_or_else(|| HeadError::Internal(format!("segment {} has no handle", id)))?;
        if file.metadata()?.len() > offset {
            file.set_len(offset)?;
        }
        file.sync_all()?;
        seg.offset = offset.min(file.metadata()?.len());
        seg.state = SegmentState::Active;
        st.active = id;
        sync_dir(&self.dir)?;
        Ok(removed)
    }

    /// Flushes and closes every segment handle. Later writes fail with
    /// [`HeadError::Closed`]. Calling it twice is a no-op.
    pub fn close(&self) -> Result<(), HeadError> {
        let mut st = self.state.lock()?;
        if st.closed {
            return Ok(());
        }
        st.closed = true;
        let active = st.active;
        if let Some(file) = st.segments.get_mut(&active).and_then(|s| s.file.as_mut()) {
            file.flush()?;
            file.sync_data()?;
        }
        for seg in st.segments.values_mut() {
            drop(seg.file.take());
        }
        Ok(())
    }

    fn append_locked(
        &self,
        st: &mut StoreState,
        typ: RecordType,
        payload: &[u8],
    ) -> Result<u64, HeadError> {
        if st.closed {
            return Err(HeadError::Closed);
        }
        let active_offset = st
            .segments
            .get(&st.active)
            .map(|s| s.offset)
            .ok_or_else(|| HeadError::Internal("no active segment".to_string()))?;
        if active_offset >= self.capacity {
            self.rotate_locked(st)?;
        }

        let header = encode_header(typ, payload);
        let active = st.active;
        let seg = st
            .segments
            .get_mut(&active)
            .ok_or_else(|| HeadError::Internal("no active segment".to_string()))?;
        let record_start = seg.offset;
        let file = seg
            .file
            .as_mut()
            .ok_or_else(|| HeadError::Internal(format!("segment {} has no handle", active)))?;

        let result = file
            .write_all(&header)
            .and_then(|_| file.write_all(payload))
            .map_err(HeadError::from)
            .and_then(|_| self.sync_file(active, file));
        if let Err(e) = result {
            // A rejected record must not survive to the next replay.
            if let Err(rollback) = file.set_len(record_start) {
                self.events.on_event(HeadEvent::RollbackFailed {
                    segment: active,
                    offset: record_start,
                    error: rollback.to_string(),
                });
                // Keep the offset in step with what is actually on disk.
                if let Ok(meta) = file.metadata() {
                    seg.offset = meta.len();
                }
            }
            return Err(e);
        }

        let written = (HEADER_LEN + payload.len()) as u64;
        seg.offset += written;
        db_metrics::record_wal_bytes_written(written);
        Ok(seg.offset)
    }

    fn rotate_locked(&self, st: &mut StoreState) -> Result<(), HeadError> {
        let sealed = st.active;
        let next = sealed + 1;
        let seg = self.create_segment(next)?;

        let mut sealed_bytes = 0;
        if let Some(prev) = st.segments.get_mut(&sealed) {
            prev.state = SegmentState::Sealed;
            sealed_bytes = prev.offset;
        }
        st.segments.insert(next, seg);
        st.active = next;

        db_metrics::record_segment_rotated();
        self.events.on_event(HeadEvent::SegmentRotated {
            sealed,
            active: next,
            sealed_bytes,
        });
        Ok(())
    }

    fn create_segment(&self, id: u64) -> Result<Segment, HeadError> {
        let path = segment_path(&self.dir, id);
        let file = open_segment_file(&path, true)?;
        let offset = file.metadata()?.len();
        sync_dir(&self.dir)?;
        self.events.on_event(HeadEvent::SegmentCreated { id, path });
        Ok(Segment {
            id,
            file: Some(file),
            offset,
            state: SegmentState::Active,
        })
    }

    fn sync_file(&self, segment: u64, file: &File) -> Result<(), HeadError> {
        let started = Instant::now();
        match self.sync_timeout {
            None => file.sync_data()?,
            Some(timeout) => {
                let handle = file.try_clone()?;
                let (tx, rx) = mpsc::channel();
                thread::Builder::new()
                    .name("headwal-fsync".to_string())
                    .spawn(move || {
                        let _ = tx.send(handle.sync_data());
                    })?;
                match rx.recv_timeout(timeout) {
                    Ok(res) => res?,
                    Err(RecvTimeoutError::Timeout) => {
                        self.events
                            .on_event(HeadEvent::SyncTimedOut { segment, timeout });
                        return Err(HeadError::SyncTimeout(timeout));
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(HeadError::Internal(
                            "fsync thread exited without reporting".to_string(),
                        ));
                    }
                }
            }
        }
        db_metrics::record_wal_fsync(started.elapsed());
        Ok(())
    }
}

/// Path of segment `id` inside `dir` (`segment-00000042`).
pub fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{}{:08}", SEGMENT_PREFIX, id))
}

/// Parses the ID out of a segment file name; `None` for anything else.
pub fn parse_segment_id(name: &str) -> Option<u64> {
    let digits = name.strip_prefix(SEGMENT_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Lists the IDs of all segment files in `dir`, ascending.
pub fn list_segment_ids(dir: &Path) -> Result<Vec<u64>, HeadError> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(id) = parse_segment_id(&name) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// One intact record read back from a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub typ: RecordType,
    /// Offset of the record header within the segment.
    pub offset: u64,
    pub payload: Vec<u8>,
}

/// Why a segment scan stopped before the end of the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStop {
    /// Header or payload cut short by the end of the file (torn write).
    Truncated { offset: u64 },
    ChecksumMismatch { offset: u64, expected: u32, actual: u32 },
    UnknownType { offset: u64, tag: u8 },
}

impl ScanStop {
    pub fn offset(&self) -> u64 {
        match self {
            ScanStop::Truncated { offset }
            | ScanStop::ChecksumMismatch { offset, .. }
            | ScanStop::UnknownType { offset, .. } => *offset,
        }
    }
}

impl std::fmt::Display for ScanStop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanStop::Truncated { offset } => write!(f, "truncated record at offset {}", offset),
            ScanStop::ChecksumMismatch {
                offset,
                expected,
                actual,
            } => write!(
                f,
                "CRC mismatch at offset {}: expected {:#010x}, got {:#010x}",
                offset, expected, actual
            ),
            ScanStop::UnknownType { offset, tag } => {
                write!(f, "unknown record type {} at offset {}", tag, offset)
            }
        }
    }
}

/// Result of reading a segment file front to back.
#[derive(Debug, Clone)]
pub struct SegmentScan {
    pub records: Vec<RawRecord>,
    /// Bytes covered by intact records; equals `file_len` when `stop` is `None`.
    pub valid_len: u64,
    pub file_len: u64,
    pub stop: Option<ScanStop>,
}

impl SegmentScan {
    /// Converts a checksum stop into a hard error, for callers that must not skip data.
    pub fn into_strict(self, segment: u64) -> Result<Vec<RawRecord>, HeadError> {
        match self.stop {
            None => Ok(self.records),
            Some(ScanStop::ChecksumMismatch {
                offset,
                expected,
                actual,
            }) => Err(HeadError::ChecksumMismatch {
                segment,
                offset,
                expected,
                actual,
            }),
            Some(stop) => Err(HeadError::Corruption {
                details: stop.to_string(),
                segment: Some(segment),
                offset: Some(stop.offset()),
            }),
        }
    }
}

/// Reads a segment file, validating every frame. Stops at the first damaged record;
/// nothing after it is trusted because the length field itself may be wrong.
pub fn read_segment(path: &Path) -> Result<SegmentScan, HeadError> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut offset = 0u64;

    let stop = loop {
        if offset == file_len {
            break None;
        }
        if file_len - offset < HEADER_LEN as u64 {
            break Some(ScanStop::Truncated { offset });
        }
        let mut hbuf = [0u8; HEADER_LEN];
        reader.read_exact(&mut hbuf)?;
        let header = decode_header(&hbuf);
        let typ = match RecordType::try_from(header.tag) {
            Ok(t) => t,
            Err(tag) => break Some(ScanStop::UnknownType { offset, tag }),
        };
        if header.len > file_len - offset - HEADER_LEN as u64 {
            break Some(ScanStop::Truncated { offset });
        }
        let mut payload = vec![0u8; header.len as usize];
        reader.read_exact(&mut payload)?;
        let actual = crate::record::crc32(&payload);
        if actual != header.crc {
            break Some(ScanStop::ChecksumMismatch {
                offset,
                expected: header.crc,
                actual,
            });
        }
        records.push(RawRecord {
            typ,
            offset,
            payload,
        });
        offset += HEADER_LEN as u64 + header.len;
    };

    Ok(SegmentScan {
        records,
        valid_len: offset,
        file_len,
        stop,
    })
}

fn open_segment_file(path: &Path, create: bool) -> io::Result<File> {
    OpenOptions::new()
        .create(create)
        .read(true)
        .append(true)
        .open(path)
}

fn remove_segment_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn sync_dir(dir: &Path) -> Result<(), HeadError> {
    let d = File::open(dir)?;
    d.sync_data()?;
    Ok(())
}
