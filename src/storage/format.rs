//! On-disk record format
//!
//! Every stored value is written as a self-describing record:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ HEADER                                       │
//! │   version: u8 = FORMAT_VERSION               │
//! │   data_type: u8                              │
//! │   flags: u8 (bit 0: payload is LZ4)          │
//! │   start: i64 (first sample index, series)    │
//! │   valid_count: u32                           │
//! │   valid: [start i64, end i64] * valid_count  │
//! │   origin_count: u32                          │
//! │   origin: [start, end, tag u64] * count      │
//! │   payload_len: u32                           │
//! ├──────────────────────────────────────────────┤
//! │ PAYLOAD (payload_len bytes)                  │
//! │   series: raw little-endian samples          │
//! │   blob:   origin u64 | version u64 | bytes   │
//! │   events: [time f64, value f32, origin u64]* │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. The whole encoded record is covered by the
//! CRC32 stored in its index entry.

use crate::storage::error::{StoreError, StoreResult};
use crate::storage::interval::{Interval, IntervalSet, TaggedInterval};
use crate::storage::types::{Blob, DataType, Event, EventSeries, Record, Samples, TimeSeries};

/// Layout version written into every record, container and checkpoint header
pub const FORMAT_VERSION: u8 = 1;

/// Container block size in bytes
pub const BLOCK_SIZE: usize = 4096;

/// Default B-link tree fan-out
pub const DEFAULT_FANOUT: usize = 64;

/// Largest dense sample window a series write or read may span
pub const MAX_SERIES_SAMPLES: u64 = 1 << 24;

/// Payloads at least this large are LZ4-compressed when compression is on
pub const COMPRESSION_THRESHOLD: usize = 512;

/// Payload is LZ4 compressed (size-prepended)
pub const FLAG_LZ4: u8 = 0b0000_0001;

const EVENT_WIDTH: usize = 8 + 4 + 8;

/// Checksum used for records, journal entries and file headers
pub fn checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// Serialize a record, compressing the payload if asked and worthwhile
pub fn encode_record(record: &Record, compress: bool) -> Vec<u8> {
    let (start, valid, origins): (i64, &[Interval], &[TaggedInterval]) = match record {
        Record::TimeSeries(ts) => (ts.start, ts.valid.as_slice(), ts.origins.as_slice()),
        _ => (0, &[], &[]),
    };

    let raw = encode_payload(record);
    let (flags, payload) = if compress && raw.len() >= COMPRESSION_THRESHOLD {
        (FLAG_LZ4, lz4_flex::compress_prepend_size(&raw))
    } else {
        (0, raw)
    };

    let mut buf = Vec::with_capacity(
        3 + 8 + 4 + valid.len() * 16 + 4 + origins.len() * 24 + 4 + payload.len(),
    );
    buf.push(FORMAT_VERSION);
    buf.push(record.data_type() as u8);
    buf.push(flags);
    buf.extend_from_slice(&start.to_le_bytes());

    buf.extend_from_slice(&(valid.len() as u32).to_le_bytes());
    for iv in valid {
        buf.extend_from_slice(&iv.start.to_le_bytes());
        buf.extend_from_slice(&iv.end.to_le_bytes());
    }

    buf.extend_from_slice(&(origins.len() as u32).to_le_bytes());
    for iv in origins {
        buf.extend_from_slice(&iv.start.to_le_bytes());
        buf.extend_from_slice(&iv.end.to_le_bytes());
        buf.extend_from_slice(&iv.tag.to_le_bytes());
    }

    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    buf
}

fn encode_payload(record: &Record) -> Vec<u8> {
    match record {
        Record::TimeSeries(ts) => match &ts.samples {
            Samples::Int(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Samples::Float(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Samples::Double(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        },
        Record::Blob(blob) => {
            let mut out = Vec::with_capacity(16 + blob.data.len());
            out.extend_from_slice(&blob.origin.to_le_bytes());
            out.extend_from_slice(&blob.version.to_le_bytes());
            out.extend_from_slice(&blob.data);
            out
        }
        Record::Events(series) => {
            let mut out = Vec::with_capacity(series.events.len() * EVENT_WIDTH);
            for e in &series.events {
                out.extend_from_slice(&e.time.to_le_bytes());
                out.extend_from_slice(&e.value.to_le_bytes());
                out.extend_from_slice(&e.origin.to_le_bytes());
            }
            out
        }
    }
}

/// Parse a record previously produced by [`encode_record`]
pub fn decode_record(bytes: &[u8]) -> StoreResult<Record> {
    let mut cursor = Cursor::new(bytes);

    let version = cursor.u8()?;
    if version != FORMAT_VERSION {
        return Err(StoreError::Corruption(format!(
            "Unsupported record format version: {}",
            version
        )));
    }
    let data_type = DataType::try_from(cursor.u8()?)?;
    let flags = cursor.u8()?;
    if flags & !FLAG_LZ4 != 0 {
        return Err(StoreError::Corruption(format!(
            "Unknown record flags: {:#010b}",
            flags
        )));
    }
    let start = cursor.i64()?;

    let valid_count = cursor.u32()? as usize;
    let mut valid = Vec::with_capacity(valid_count.min(4096));
    for _ in 0..valid_count {
        valid.push(Interval::new(cursor.i64()?, cursor.i64()?));
    }
    let origin_count = cursor.u32()? as usize;
    let mut origins = Vec::with_capacity(origin_count.min(4096));
    for _ in 0..origin_count {
        origins.push(TaggedInterval::new(cursor.i64()?, cursor.i64()?, cursor.u64()?));
    }

    let payload_len = cursor.u32()? as usize;
    let stored = cursor.take(payload_len)?;
    if !cursor.is_empty() {
        return Err(StoreError::Corruption(format!(
            "{} trailing bytes after record payload",
            cursor.remaining()
        )));
    }
    let payload = if flags & FLAG_LZ4 != 0 {
        lz4_flex::decompress_size_prepended(stored)
            .map_err(|e| StoreError::Corruption(format!("LZ4 decompression failed: {}", e)))?
    } else {
        stored.to_vec()
    };

    match data_type {
        DataType::IntSeries | DataType::FloatSeries | DataType::DoubleSeries => {
            let valid = IntervalSet::from_canonical(valid).ok_or_else(|| {
                StoreError::Corruption("valid interval set is not canonical".to_string())
            })?;
            let origins = IntervalSet::from_canonical(origins).ok_or_else(|| {
                StoreError::Corruption("origin interval set is not canonical".to_string())
            })?;
            let samples = decode_samples(data_type, &payload)?;
            Ok(Record::TimeSeries(TimeSeries {
                start,
                samples,
                valid,
                origins,
            }))
        }
        DataType::Blob => {
            let mut p = Cursor::new(&payload);
            let origin = p.u64()?;
            let version = p.u64()?;
            let data = p.take(p.remaining())?.to_vec();
            Ok(Record::Blob(Blob {
                origin,
                version,
                data,
            }))
        }
        DataType::Events => {
            if payload.len() % EVENT_WIDTH != 0 {
                return Err(StoreError::Corruption(format!(
                    "event payload length {} is not a multiple of {}",
                    payload.len(),
                    EVENT_WIDTH
                )));
            }
            let mut p = Cursor::new(&payload);
            let mut events = Vec::with_capacity(payload.len() / EVENT_WIDTH);
            while !p.is_empty() {
                events.push(Event {
                    time: f64::from_bits(p.u64()?),
                    value: f32::from_bits(p.u32()?),
                    origin: p.u64()?,
                });
            }
            Ok(Record::Events(EventSeries { events }))
        }
    }
}

fn decode_samples(data_type: DataType, payload: &[u8]) -> StoreResult<Samples> {
    let width = data_type.sample_width().unwrap_or(1);
    if payload.len() % width != 0 {
        return Err(StoreError::Corruption(format!(
            "sample payload length {} is not a multiple of {}",
            payload.len(),
            width
        )));
    }
    let chunks = payload.chunks_exact(width);
    let samples = match data_type {
        DataType::IntSeries => Samples::Int(
            chunks
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        DataType::FloatSeries => Samples::Float(
            chunks
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        DataType::DoubleSeries => Samples::Double(
            chunks
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        ),
        other => {
            return Err(StoreError::Corruption(format!(
                "{} records carry no samples",
                other
            )))
        }
    };
    Ok(samples)
}

/// Bounds-checked little-endian reader
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub(crate) fn take(&mut self, n: usize) -> StoreResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(StoreError::Corruption(format!(
                "truncated record: wanted {} bytes at offset {}, {} left",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> StoreResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> StoreResult<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub(crate) fn u32(&mut self) -> StoreResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> StoreResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub(crate) fn i64(&mut self) -> StoreResult<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_series() -> Record {
        let ts = TimeSeries::new(
            100,
            Samples::Float((0..50).map(|i| i as f32 * 0.5).collect()),
            vec![Interval::new(100, 119), Interval::new(130, 149)],
        )
        .with_origin(77);
        Record::TimeSeries(ts)
    }

    #[test]
    fn test_series_header_layout() {
        let bytes = encode_record(&sample_series(), false);
        assert_eq!(bytes[0], FORMAT_VERSION);
        assert_eq!(bytes[1], DataType::FloatSeries as u8);
        assert_eq!(bytes[2], 0);
        assert_eq!(i64::from_le_bytes(bytes[3..11].try_into().unwrap()), 100);
        assert_eq!(u32::from_le_bytes(bytes[11..15].try_into().unwrap()), 2);
        assert_eq!(decode_record(&bytes).unwrap(), sample_series());
    }

    #[test]
    fn test_large_payload_is_compressed() {
        let record = Record::Blob(Blob {
            origin: 9,
            version: 3,
            data: vec![7u8; 64 * 1024],
        });
        let plain = encode_record(&record, false);
        let packed = encode_record(&record, true);
        assert!(packed.len() < plain.len() / 10);
        assert_eq!(packed[2] & FLAG_LZ4, FLAG_LZ4);
        assert_eq!(decode_record(&packed).unwrap(), record);
    }

    #[test]
    fn test_small_payload_stays_plain() {
        let record = Record::Blob(Blob {
            origin: 1,
            version: 1,
            data: b"tiny".to_vec(),
        });
        let bytes = encode_record(&record, true);
        assert_eq!(bytes[2], 0);
        assert_eq!(decode_record(&bytes).unwrap(), record);
    }

    #[test]
    fn test_events_decode() {
        let record = Record::Events(EventSeries {
            events: vec![
                Event {
                    time: 55000.25,
                    value: 1.5,
                    origin: 4,
                },
                Event {
                    time: 55001.0,
                    value: -2.0,
                    origin: 5,
                },
            ],
        });
        let bytes = encode_record(&record, false);
        assert_eq!(decode_record(&bytes).unwrap(), record);
    }

    #[test]
    fn test_rejects_damage() {
        let mut bytes = encode_record(&sample_series(), false);

        let mut wrong_version = bytes.clone();
        wrong_version[0] = 9;
        assert!(matches!(
            decode_record(&wrong_version),
            Err(StoreError::Corruption(_))
        ));

        bytes.truncate(bytes.len() - 3);
        assert!(matches!(decode_record(&bytes), Err(StoreError::Corruption(_))));
    }

    #[test]
    fn test_rejects_non_canonical_valid_set() {
        let mut bytes = encode_record(&sample_series(), false);
        // Second valid interval starts inside the first
        bytes[31..39].copy_from_slice(&105i64.to_le_bytes());
        assert!(matches!(decode_record(&bytes), Err(StoreError::Corruption(_))));
    }
}
