//! Record framing and payload codec for WAL segments.
//!
//! Every record on disk is a fixed 13-byte header followed by its payload:
//!
//! ```text
//! byte 0      : record type (1 = series, 2 = samples, 3 = checkpoint)
//! bytes 1..9  : payload length, u64 big-endian
//! bytes 9..13 : CRC32 (IEEE) of the payload, u32 big-endian
//! bytes 13..  : payload
//! ```
//!
//! Series and sample payloads start with the label set: a zig-zag varint pair count, then
//! for each pair a varint-prefixed name and a varint-prefixed value. Sample payloads append
//! one or more 16-byte `(i64 timestamp, f64 value)` big-endian trailers.

use std::io::{Cursor, Read};

use crc32fast::Hasher as Crc32;

use crate::types::{Label, LabelSet, Sample};

pub const HEADER_LEN: usize = 1 + 8 + 4;
pub const SAMPLE_LEN: usize = 16;

/// Type tag of a framed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordType {
    Series = 1,
    Samples = 2,
    Checkpoint = 3,
}

impl RecordType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for RecordType {
    type Error = u8;

    fn try_from(tag: u8) -> Result<Self, u8> {
        match tag {
            1 => Ok(RecordType::Series),
            2 => Ok(RecordType::Samples),
            3 => Ok(RecordType::Checkpoint),
            other => Err(other),
        }
    }
}

/// A decoded WAL record.
#[derive(Debug, Clone, PartialEq)]
pub enum WalRecord {
    Series(LabelSet),
    Samples { labels: LabelSet, samples: Vec<Sample> },
    Checkpoint,
}

impl WalRecord {
    pub fn record_type(&self) -> RecordType {
        match self {
            WalRecord::Series(_) => RecordType::Series,
            WalRecord::Samples { .. } => RecordType::Samples,
            WalRecord::Checkpoint => RecordType::Checkpoint,
        }
    }
}

/// Decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub tag: u8,
    pub len: u64,
    pub crc: u32,
}

pub fn encode_header(typ: RecordType, payload: &[u8]) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0] = typ.as_u8();
    header[1..9].copy_from_slice(&(payload.len() as u64).to_be_bytes());
    header[9..13].copy_from_slice(&crc32(payload).to_be_bytes());
    header
}

pub fn decode_header(buf: &[u8; HEADER_LEN]) -> RecordHeader {
    let mut len = [0u8; 8];
    len.copy_from_slice(&buf[1..9]);
    let mut crc = [0u8; 4];
    crc.copy_from_slice(&buf[9..13]);
    RecordHeader {
        tag: buf[0],
        len: u64::from_be_bytes(len),
        crc: u32::from_be_bytes(crc),
    }
}

#[inline]
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut h = Crc32::new();
    h.update(bytes);
    h.finalize()
}

pub fn encode_series(labels: &LabelSet) -> Vec<u8> {
    let mut buf = Vec::with_capacity(label_set_size_hint(labels));
    write_label_set(&mut buf, labels);
    buf
}

pub fn encode_sample(labels: &LabelSet, sample: Sample) -> Vec<u8> {
    let mut buf = Vec::with_capacity(label_set_size_hint(labels) + SAMPLE_LEN);
    write_label_set(&mut buf, labels);
    write_sample(&mut buf, sample);
    buf
}

/// Decodes the payload of a record whose CRC has already been validated.
pub fn decode_payload(typ: RecordType, payload: &[u8]) -> Result<WalRecord, String> {
    match typ {
        RecordType::Checkpoint => {
            if !payload.is_empty() {
                return Err(format!("checkpoint record carries {} payload bytes", payload.len()));
            }
            Ok(WalRecord::Checkpoint)
        }
        RecordType::Series => {
            let mut cur = Cursor::new(payload);
            let labels = read_label_set(&mut cur)?;
            let rest = payload.len() - cur.position() as usize;
            if rest != 0 {
                return Err(format!("{} trailing bytes after series labels", rest));
            }
            Ok(WalRecord::Series(labels))
        }
        RecordType::Samples => {
            let mut cur = Cursor::new(payload);
            let labels = read_label_set(&mut cur)?;
            let trailer = &payload[cur.position() as usize..];
            if trailer.is_empty() || trailer.len() % SAMPLE_LEN != 0 {
                return Err(format!(
                    "sample trailer is {} bytes, expected a positive multiple of {}",
                    trailer.len(),
                    SAMPLE_LEN
                ));
            }
            let samples = trailer.chunks_exact(SAMPLE_LEN).map(read_sample).collect();
            Ok(WalRecord::Samples { labels, samples })
        }
    }
}

fn label_set_size_hint(labels: &LabelSet) -> usize {
    labels
        .iter()
        .map(|l| l.name.len() + l.value.len() + 4)
        .sum::<usize>()
        + 2
}

fn write_label_set(buf: &mut Vec<u8>, labels: &LabelSet) {
    write_varint(buf, labels.len() as i64);
    for l in labels {
        write_bytes(buf, l.name.as_bytes());
        write_bytes(buf, l.value.as_bytes());
    }
}

fn read_label_set<R: Read>(r: &mut R) -> Result<LabelSet, String> {
    let n = read_varint(r)?;
    if n < 0 {
        return Err(format!("negative label count {}", n));
    }
    let mut labels = Vec::with_capacity((n as usize).min(64));
    for _ in 0..n {
        let name = read_string(r)?;
        let value = read_string(r)?;
        labels.push(Label { name, value });
    }
    Ok(LabelSet::new(labels))
}

fn write_sample(buf: &mut Vec<u8>, sample: Sample) {
    buf.extend_from_slice(&sample.timestamp.to_be_bytes());
    buf.extend_from_slice(&sample.value.to_bits().to_be_bytes());
}

fn read_sample(b: &[u8]) -> Sample {
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&b[..8]);
    let mut v = [0u8; 8];
    v.copy_from_slice(&b[8..16]);
    Sample {
        timestamp: i64::from_be_bytes(ts),
        value: f64::from_bits(u64::from_be_bytes(v)),
    }
}

fn write_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    write_varint(buf, b.len() as i64);
    buf.extend_from_slice(b);
}

fn read_string<R: Read>(r: &mut R) -> Result<String, String> {
    let len = read_varint(r)?;
    if len < 0 {
        return Err(format!("negative string length {}", len));
    }
    let mut b = Vec::new();
    let got = r
        .by_ref()
        .take(len as u64)
        .read_to_end(&mut b)
        .map_err(|e| e.to_string())?;
    if got as i64 != len {
        return Err(format!("string truncated: wanted {} bytes, got {}", len, got));
    }
    String::from_utf8(b).map_err(|e| format!("invalid UTF-8 in label: {}", e))
}

// Zig-zag signed LEB128.
fn write_varint(buf: &mut Vec<u8>, v: i64) {
    let mut u = ((v << 1) ^ (v >> 63)) as u64;
    while u >= 0x80 {
        buf.push((u as u8) | 0x80);
        u >>= 7;
    }
    buf.push(u as u8);
}

fn read_varint<R: Read>(r: &mut R) -> Result<i64, String> {
    let mut out: u64 = 0;
    let mut shift: u32 = 0;
    for _ in 0..10 {
        let mut b = [0u8; 1];
        r.read_exact(&mut b)
            .map_err(|e| format!("Truncated varint: {}", e))?;
        let byte = b[0];
        out |= ((byte & 0x7F) as u64) << shift;
        if (byte & 0x80) == 0 {
            return Ok(((out >> 1) as i64) ^ -((out & 1) as i64));
        }
        shift += 7;
    }
    Err("Varint too long".to_string())
}
