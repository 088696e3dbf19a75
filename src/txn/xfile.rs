//! Transactional file layer
//!
//! Turns a client mutation plus the key's current record into a new record
//! written to fresh container blocks, and reads records back with checksum
//! verification. Nothing here touches the index; a written record only
//! becomes reachable when its transaction commits.

use crate::index::IndexEntry;
use crate::storage::allocator::Extent;
use crate::storage::container::ContainerSet;
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::format::{checksum, decode_record, encode_record};
use crate::storage::types::{Blob, Event, EventSeries, Key, Lsn, Record, TimeSeries, TxId};
use std::sync::Arc;

/// A client write, before it is merged with the stored record
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Replace `[series.start, series.end()]`; valid ranges in it are
    /// attributed to `origin`
    TimeSeries { series: TimeSeries, origin: u64 },
    /// Overwrite the blob; its version counter advances
    Blob { data: Vec<u8>, origin: u64 },
    /// Replace all events inside `[start, end]`
    Events {
        start: f64,
        end: f64,
        events: Vec<Event>,
    },
}

impl Mutation {
    /// Combine with the key's current record
    pub fn apply(self, base: Option<Record>) -> StoreResult<Record> {
        match (self, base) {
            (Mutation::TimeSeries { series, origin }, base) => {
                let update = series.with_origin(origin);
                match base {
                    Some(Record::TimeSeries(old)) if old.data_type() == update.data_type() => {
                        Ok(Record::TimeSeries(old.overlay(&update)?))
                    }
                    // New key, or a different type: the write replaces it
                    _ => Ok(Record::TimeSeries(update)),
                }
            }
            (Mutation::Blob { data, origin }, base) => {
                let version = match base {
                    Some(Record::Blob(old)) => old.version + 1,
                    _ => 1,
                };
                Ok(Record::Blob(Blob {
                    origin,
                    version,
                    data,
                }))
            }
            (Mutation::Events { start, end, events }, base) => {
                let mut series = match base {
                    Some(Record::Events(old)) => old,
                    _ => EventSeries::default(),
                };
                series.replace_window(start, end, &events)?;
                Ok(Record::Events(series))
            }
        }
    }
}

/// Record I/O against the container set
pub struct XFiles {
    containers: Arc<ContainerSet>,
    compress: bool,
}

impl XFiles {
    pub fn new(containers: Arc<ContainerSet>, compress: bool) -> Self {
        Self {
            containers,
            compress,
        }
    }

    pub fn containers(&self) -> &Arc<ContainerSet> {
        &self.containers
    }

    /// Read and verify the record an entry points at
    pub fn read(&self, key: &Key, entry: &IndexEntry) -> StoreResult<Record> {
        let bytes = self
            .containers
            .read(&entry.extent(), entry.size as usize)?;
        if checksum(&bytes) != entry.checksum {
            return Err(StoreError::Corruption(format!(
                "checksum mismatch for {} in container {} at block {}",
                key, entry.file_id, entry.offset
            )));
        }
        let record = decode_record(&bytes)?;
        if record.data_type() != entry.data_type {
            return Err(StoreError::Corruption(format!(
                "{} is indexed as {} but stores {}",
                key,
                entry.data_type,
                record.data_type()
            )));
        }
        Ok(record)
    }

    /// Write a record to newly allocated blocks. The returned entry carries
    /// no commit LSN yet.
    pub fn write(&self, key: &Key, record: &Record, tx: TxId) -> StoreResult<IndexEntry> {
        let bytes = encode_record(record, self.compress);
        let file_id = self.containers.file_id_for(key);
        let extent = self.containers.allocate(file_id, bytes.len())?;
        if let Err(e) = self.containers.write(&extent, &bytes) {
            self.free(&extent);
            return Err(e);
        }
        Ok(IndexEntry {
            file_id,
            offset: extent.block,
            length: extent.blocks,
            size: bytes.len() as u64,
            data_type: record.data_type(),
            checksum: checksum(&bytes),
            last_writer: tx,
            commit_lsn: Lsn::ZERO,
        })
    }

    /// Return blocks to the allocator. Failures are logged; a leaked extent
    /// is reclaimed by the next recovery.
    pub fn free(&self, extent: &Extent) {
        if let Err(e) = self.containers.free(extent) {
            tracing::warn!(
                "Could not free {} blocks at {} in container {}: {}",
                extent.blocks,
                extent.block,
                extent.file_id,
                e
            );
        }
    }

    pub fn sync(&self, file_id: u64) -> StoreResult<()> {
        self.containers.sync(file_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::dirhash::DirHash;
    use crate::storage::interval::{Interval, TaggedInterval};
    use crate::storage::types::Samples;
    use tempfile::tempdir;

    fn series(start: i64, len: usize, value: f64) -> TimeSeries {
        TimeSeries::dense(start, Samples::Double(vec![value; len]))
    }

    /// Overlapping writes by two tasks keep per-range provenance
    #[test]
    fn test_overlapping_series_writes() {
        let first = Mutation::TimeSeries {
            series: series(0, 100, 1.0),
            origin: 0xA,
        }
        .apply(None)
        .unwrap();
        let merged = Mutation::TimeSeries {
            series: series(50, 100, 2.0),
            origin: 0xB,
        }
        .apply(Some(first))
        .unwrap();

        let Record::TimeSeries(ts) = merged else {
            panic!("expected a time series");
        };
        assert_eq!(ts.valid.as_slice(), &[Interval::new(0, 149)]);
        assert_eq!(
            ts.origins.as_slice(),
            &[TaggedInterval::new(0, 49, 0xA), TaggedInterval::new(50, 149, 0xB)]
        );
        let Samples::Double(values) = &ts.samples else {
            panic!("expected doubles");
        };
        assert_eq!(values[49], 1.0);
        assert_eq!(values[50], 2.0);
    }

    #[test]
    fn test_blob_versions_and_type_changes() {
        let v1 = Mutation::Blob {
            data: b"one".to_vec(),
            origin: 1,
        }
        .apply(None)
        .unwrap();
        let v2 = Mutation::Blob {
            data: b"two".to_vec(),
            origin: 2,
        }
        .apply(Some(v1))
        .unwrap();
        assert!(matches!(&v2, Record::Blob(b) if b.version == 2 && b.origin == 2));

        // A series written over a blob replaces it
        let replaced = Mutation::TimeSeries {
            series: series(0, 4, 0.5),
            origin: 3,
        }
        .apply(Some(v2))
        .unwrap();
        assert!(matches!(replaced, Record::TimeSeries(_)));
    }

    #[test]
    fn test_event_window_replacement() {
        let event = |time: f64, value: f32| Event {
            time,
            value,
            origin: 1,
        };
        let base = Mutation::Events {
            start: 0.0,
            end: 10.0,
            events: vec![event(1.0, 1.0), event(5.0, 5.0), event(9.0, 9.0)],
        }
        .apply(None)
        .unwrap();
        let updated = Mutation::Events {
            start: 4.0,
            end: 6.0,
            events: vec![event(4.5, 45.0)],
        }
        .apply(Some(base))
        .unwrap();
        let Record::Events(events) = updated else {
            panic!("expected events");
        };
        let times: Vec<f64> = events.events.iter().map(|e| e.time).collect();
        assert_eq!(times, vec![1.0, 4.5, 9.0]);
    }

    #[test]
    fn test_write_then_read_verifies_checksum() {
        let dir = tempdir().unwrap();
        let dirhash = DirHash::open(dir.path(), 1000, 100, 16).unwrap();
        let files = XFiles::new(Arc::new(ContainerSet::new(dirhash, 4)), true);
        let key = Key::new("/blob/x").unwrap();
        let record = Record::Blob(Blob {
            origin: 7,
            version: 1,
            data: vec![42u8; 10_000],
        });

        let entry = files.write(&key, &record, TxId(3)).unwrap();
        assert_eq!(entry.last_writer, TxId(3));
        assert_eq!(files.read(&key, &entry).unwrap(), record);

        let mut wrong = entry.clone();
        wrong.checksum ^= 1;
        assert!(matches!(
            files.read(&key, &wrong),
            Err(StoreError::Corruption(_))
        ));
    }
}
