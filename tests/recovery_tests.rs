use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use tempfile::tempdir;

use headwal::record::HEADER_LEN;
use headwal::segments::{list_segment_ids, segment_path};
use headwal::{
    Head, HeadEvent, HeadEventListener, HeadOptions, LabelSet, Sample, SegmentState, Wal,
};

#[derive(Debug, Default)]
struct RecordingListener {
    events: Mutex<Vec<HeadEvent>>,
}

impl RecordingListener {
    fn events(&self) -> Vec<HeadEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl HeadEventListener for RecordingListener {
    fn on_event(&self, event: HeadEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn make_options(dir: &Path, chunk_capacity: usize, segment_capacity_bytes: u64) -> HeadOptions {
    HeadOptions {
        wal_dir: dir.join("wal"),
        chunk_capacity,
        segment_capacity_bytes,
        ..HeadOptions::default()
    }
}

fn cpu() -> LabelSet {
    LabelSet::from_pairs([("__name__", "cpu")])
}

/// Every sample held for `labels`, sealed chunks first.
fn all_samples(head: &Head, labels: &LabelSet) -> Vec<Sample> {
    let Some(series) = head.series_by_labels(labels).unwrap() else {
        return Vec::new();
    };
    let mut out: Vec<Sample> = series
        .sealed_chunks()
        .unwrap()
        .iter()
        .flat_map(|c| c.samples().to_vec())
        .collect();
    out.extend_from_slice(series.current_chunk().unwrap().samples());
    out
}

#[test]
fn test_reopen_rebuilds_series_and_chunks() {
    let dir = tempdir().unwrap();
    let opts = make_options(dir.path(), 3, 1024);

    let mem = LabelSet::from_pairs([("__name__", "mem"), ("host", "a")]);
    {
        let head = Head::open(opts.clone()).unwrap();
        for t in 0..7 {
            head.append(&cpu(), Sample::new(t, t as f64)).unwrap();
            head.append(&mem, Sample::new(t * 10, -(t as f64))).unwrap();
        }
        head.close().unwrap();
    }

    let head = Head::open(opts).unwrap();
    assert_eq!(head.num_series().unwrap(), 2);
    // References are reassigned in the order series are met in the log.
    assert_eq!(head.lookup_series(1).unwrap().labels(), &cpu());
    assert_eq!(head.lookup_series(2).unwrap().labels(), &mem);

    let expected: Vec<_> = (0..7).map(|t| Sample::new(t, t as f64)).collect();
    assert_eq!(all_samples(&head, &cpu()), expected);

    let s = head.series_by_labels(&cpu()).unwrap().unwrap();
    assert_eq!(s.num_chunks().unwrap(), 3);
    assert_eq!(s.current_chunk().unwrap().samples(), &[Sample::new(6, 6.0)]);
    assert_eq!(head.time_bounds(), Some((0, 60)));

    // New series continue after the replayed references.
    let disk = LabelSet::from_pairs([("__name__", "disk")]);
    head.append(&disk, Sample::new(100, 1.0)).unwrap();
    assert_eq!(head.series_by_labels(&disk).unwrap().unwrap().series_ref(), 3);
}

#[test]
fn test_flipped_byte_stops_replay_and_reopen_repairs() {
    let dir = tempdir().unwrap();
    // Series frame is 27 bytes, sample frames 43.
    // Segments hold [S s0 s1] [s2 s3 s4] [s5 s6 s7] [s8 s9].
    let opts = make_options(dir.path(), 120, 100);
    {
        let head = Head::open(opts.clone()).unwrap();
        for t in 0..10 {
            head.append(&cpu(), Sample::new(t, 1.0)).unwrap();
        }
        head.close().unwrap();
    }
    let wal_dir = dir.path().join("wal");
    assert_eq!(list_segment_ids(&wal_dir).unwrap(), vec![0, 1, 2, 3]);

    let path = segment_path(&wal_dir, 1);
    let mut bytes = fs::read(&path).unwrap();
    bytes[HEADER_LEN + 2] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let replay = Wal::replay(&wal_dir).unwrap();
    let corruption = replay.corruption.expect("damage detected");
    assert_eq!((corruption.segment, corruption.offset), (1, 0));

    let listener = Arc::new(RecordingListener::default());
    let head = Head::open(HeadOptions {
        event_listener: listener.clone(),
        ..opts.clone()
    })
    .unwrap();

    assert_eq!(
        all_samples(&head, &cpu()),
        vec![Sample::new(0, 1.0), Sample::new(1, 1.0)]
    );
    let events = listener.events();
    assert!(events.contains(&HeadEvent::WalRepaired {
        segment: 1,
        offset: 0,
        removed_segments: 2
    }));
    assert!(events
        .iter()
        .any(|e| matches!(
            e,
            HeadEvent::ReplayStopped {
                segment: 1,
                offset: 0,
                ..
            }
        )));
    assert!(events.contains(&HeadEvent::ReplayCompleted {
        records: 3,
        series: 1,
        samples: 2
    }));
    assert_eq!(list_segment_ids(&wal_dir).unwrap(), vec![0, 1]);
    assert_eq!(head.wal().active_segment_id().unwrap(), 1);

    head.append(&cpu(), Sample::new(50, 5.0)).unwrap();
    head.close().unwrap();

    let replay = Wal::replay(&wal_dir).unwrap();
    assert!(replay.corruption.is_none());

    let head = Head::open(opts).unwrap();
    assert_eq!(
        all_samples(&head, &cpu()),
        vec![Sample::new(0, 1.0), Sample::new(1, 1.0), Sample::new(50, 5.0)]
    );
}

#[test]
fn test_torn_tail_is_truncated_on_open() {
    let dir = tempdir().unwrap();
    let opts = make_options(dir.path(), 120, 1 << 20);
    {
        let head = Head::open(opts.clone()).unwrap();
        for t in 0..3 {
            head.append(&cpu(), Sample::new(t, 2.0)).unwrap();
        }
        head.close().unwrap();
    }

    let path = segment_path(&dir.path().join("wal"), 0);
    let full_len = fs::metadata(&path).unwrap().len();
    let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(full_len - 5).unwrap();
    drop(file);

    let head = Head::open(opts.clone()).unwrap();
    assert_eq!(
        all_samples(&head, &cpu()),
        vec![Sample::new(0, 2.0), Sample::new(1, 2.0)]
    );
    // The torn record (one 43-byte sample frame) is gone from disk.
    assert_eq!(fs::metadata(&path).unwrap().len(), full_len - 43);

    head.append(&cpu(), Sample::new(9, 9.0)).unwrap();
    head.close().unwrap();

    let head = Head::open(opts).unwrap();
    assert_eq!(
        all_samples(&head, &cpu()),
        vec![Sample::new(0, 2.0), Sample::new(1, 2.0), Sample::new(9, 9.0)]
    );
}

#[test]
fn test_segments_exceed_capacity_by_at_most_one_record() {
    let dir = tempdir().unwrap();
    let capacity = 100;
    let head = Head::open(make_options(dir.path(), 120, capacity)).unwrap();
    for t in 0..40 {
        head.append(&cpu(), Sample::new(t, 0.0)).unwrap();
    }

    let segments = head.wal().segments().unwrap();
    assert!(segments.len() > 5);
    let (last, sealed) = segments.split_last().unwrap();
    assert_eq!(last.state, SegmentState::Active);
    for seg in sealed {
        assert_eq!(seg.state, SegmentState::Sealed);
        assert!(seg.offset >= capacity, "sealed early: {:?}", seg);
        assert!(seg.offset < capacity + 43, "overshoot: {:?}", seg);
    }
}

#[test]
fn test_checkpoint_and_clean_through_head() {
    let dir = tempdir().unwrap();
    let opts = make_options(dir.path(), 120, 100);
    let head = Head::open(opts.clone()).unwrap();
    for t in 0..20 {
        head.append(&cpu(), Sample::new(t, t as f64)).unwrap();
    }

    head.checkpoint().unwrap();
    assert!(head.wal().last_checkpoint().unwrap().is_some());
    let active = head.wal().active_segment_id().unwrap();
    let segments = head.wal().segments().unwrap();
    for seg in &segments {
        if seg.id < active {
            assert_eq!(seg.state, SegmentState::Flushed);
        } else {
            assert_eq!(seg.state, SegmentState::Active);
        }
    }

    let removed = head.clean().unwrap();
    assert_eq!(removed, segments.len() - 2);
    assert_eq!(head.clean().unwrap(), 0);

    let left = head.wal().segments().unwrap();
    assert_eq!(left.len(), 2);
    assert_eq!(left[0].state, SegmentState::Flushed);
    assert_eq!(left[0].id, active - 1);

    head.append(&cpu(), Sample::new(100, 1.0)).unwrap();
    head.close().unwrap();

    // Sample records carry their labels, so the series survives losing its definition.
    let head = Head::open(opts).unwrap();
    let samples = all_samples(&head, &cpu());
    assert_eq!(samples.last(), Some(&Sample::new(100, 1.0)));
    assert!(samples.len() < 21);
}

#[test]
fn test_events_reach_listener() {
    let dir = tempdir().unwrap();
    let listener = Arc::new(RecordingListener::default());
    let head = Head::open(HeadOptions {
        event_listener: listener.clone(),
        ..make_options(dir.path(), 120, 100)
    })
    .unwrap();

    head.append(&cpu(), Sample::new(10, 1.0)).unwrap();
    head.append(&cpu(), Sample::new(5, 1.0)).unwrap();
    head.append(&cpu(), Sample::new(11, 1.0)).unwrap();

    let events = listener.events();
    assert!(events.contains(&HeadEvent::SeriesCreated { series_ref: 1 }));
    assert!(events.contains(&HeadEvent::OutOfOrderSample {
        series_ref: 1,
        timestamp: 5,
        max_time: 10
    }));
    assert!(events.contains(&HeadEvent::SegmentRotated {
        sealed: 0,
        active: 1,
        sealed_bytes: 113
    }));
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 24,
        max_shrink_iters: 500,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_reopen_reproduces_every_series(
        ops in prop::collection::vec((0u8..4, -1_000i64..1_000, prop::num::f64::NORMAL), 1..120)
    ) {
        let dir = tempdir().unwrap();
        let opts = make_options(dir.path(), 4, 256);

        let mut expected: HashMap<LabelSet, Vec<Sample>> = HashMap::new();
        {
            let head = Head::open(opts.clone()).unwrap();
            for (series, ts, val) in &ops {
                let id = series.to_string();
                let labels = LabelSet::from_pairs([("__name__", "m"), ("id", id.as_str())]);
                head.append(&labels, Sample::new(*ts, *val)).unwrap();
                expected.entry(labels).or_default().push(Sample::new(*ts, *val));
            }
            head.close().unwrap();
        }

        let head = Head::open(opts).unwrap();
        prop_assert_eq!(head.num_series().unwrap(), expected.len());
        for (labels, samples) in &expected {
            prop_assert_eq!(&all_samples(&head, labels), samples);
        }
        let min = ops.iter().map(|o| o.1).min().unwrap();
        let max = ops.iter().map(|o| o.1).max().unwrap();
        prop_assert_eq!(head.time_bounds(), Some((min, max)));
    }
}
