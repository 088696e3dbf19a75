//! Core data types for the store
//!
//! - `Key`: normalized hierarchical identifier
//! - `TxId`, `Lsn`: transaction ids and journal positions
//! - `Record` and its variants: what gets stored under a key
//! - `Xid`, `Vote`: two-phase commit vocabulary

use crate::storage::error::{StoreError, StoreResult};
use crate::storage::format::MAX_SERIES_SAMPLES;
use crate::storage::interval::{Interval, IntervalSet, TaggedInterval};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction identifier, issued by the persistent sequence generator
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxId(pub u64);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Log sequence number: position of a record in the journal
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    pub fn next(self) -> Lsn {
        Lsn(self.0 + 1)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hierarchical store key such as `/pa/flux/sap/42`
///
/// Always held in normalized form: a leading `/`, non-empty segments, no
/// trailing `/`. Ordering is byte-wise on that form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Key(String);

impl Key {
    /// Normalize and validate a key
    pub fn new(raw: impl AsRef<str>) -> StoreResult<Self> {
        let raw = raw.as_ref();
        let invalid = |reason: &str| StoreError::InvalidKey {
            key: raw.to_string(),
            reason: reason.to_string(),
        };

        let mut normalized = String::with_capacity(raw.len() + 1);
        for segment in raw.split('/').filter(|s| !s.is_empty()) {
            if segment == "." || segment == ".." {
                return Err(invalid("relative segments are not allowed"));
            }
            if segment
                .chars()
                .any(|c| c.is_whitespace() || c.is_control())
            {
                return Err(invalid("whitespace or control character in segment"));
            }
            normalized.push('/');
            normalized.push_str(segment);
        }

        if normalized.is_empty() {
            return Err(invalid("key has no segments"));
        }
        Ok(Key(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').skip(1)
    }

    /// Last segment
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    /// Everything up to the last segment, `None` for single-segment keys
    pub fn parent(&self) -> Option<Key> {
        let idx = self.0.rfind('/')?;
        if idx == 0 {
            None
        } else {
            Some(Key(self.0[..idx].to_string()))
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Key {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Key::new(s)
    }
}

impl TryFrom<String> for Key {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Key::new(value)
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        key.0
    }
}

/// Stored data type, written as the data-type byte of every record header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    IntSeries = 1,
    FloatSeries = 2,
    DoubleSeries = 3,
    Blob = 4,
    Events = 5,
}

impl DataType {
    pub fn is_time_series(self) -> bool {
        matches!(
            self,
            DataType::IntSeries | DataType::FloatSeries | DataType::DoubleSeries
        )
    }

    /// Width in bytes of one sample, for fixed-width series
    pub fn sample_width(self) -> Option<usize> {
        match self {
            DataType::IntSeries | DataType::FloatSeries => Some(4),
            DataType::DoubleSeries => Some(8),
            DataType::Blob | DataType::Events => None,
        }
    }
}

impl TryFrom<u8> for DataType {
    type Error = StoreError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(DataType::IntSeries),
            2 => Ok(DataType::FloatSeries),
            3 => Ok(DataType::DoubleSeries),
            4 => Ok(DataType::Blob),
            5 => Ok(DataType::Events),
            _ => Err(StoreError::Corruption(format!("Unknown data type: {}", value))),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::IntSeries => write!(f, "int-series"),
            DataType::FloatSeries => write!(f, "float-series"),
            DataType::DoubleSeries => write!(f, "double-series"),
            DataType::Blob => write!(f, "blob"),
            DataType::Events => write!(f, "events"),
        }
    }
}

/// Fixed-width numeric samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Samples {
    Int(Vec<i32>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

impl Samples {
    /// Zero-filled samples of the given type
    pub fn zeroed(data_type: DataType, len: usize) -> StoreResult<Self> {
        match data_type {
            DataType::IntSeries => Ok(Samples::Int(vec![0; len])),
            DataType::FloatSeries => Ok(Samples::Float(vec![0.0; len])),
            DataType::DoubleSeries => Ok(Samples::Double(vec![0.0; len])),
            other => Err(StoreError::InvalidArgument(format!(
                "{} is not a time series type",
                other
            ))),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Samples::Int(v) => v.len(),
            Samples::Float(v) => v.len(),
            Samples::Double(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Samples::Int(_) => DataType::IntSeries,
            Samples::Float(_) => DataType::FloatSeries,
            Samples::Double(_) => DataType::DoubleSeries,
        }
    }

    /// Copy `len` samples from `src[src_at..]` into `self[dst_at..]`
    pub fn copy_from(
        &mut self,
        dst_at: usize,
        src: &Samples,
        src_at: usize,
        len: usize,
    ) -> StoreResult<()> {
        match (self, src) {
            (Samples::Int(d), Samples::Int(s)) => {
                d[dst_at..dst_at + len].copy_from_slice(&s[src_at..src_at + len])
            }
            (Samples::Float(d), Samples::Float(s)) => {
                d[dst_at..dst_at + len].copy_from_slice(&s[src_at..src_at + len])
            }
            (Samples::Double(d), Samples::Double(s)) => {
                d[dst_at..dst_at + len].copy_from_slice(&s[src_at..src_at + len])
            }
            (d, s) => {
                return Err(StoreError::InvalidArgument(format!(
                    "cannot copy {} samples into {}",
                    s.data_type(),
                    d.data_type()
                )))
            }
        }
        Ok(())
    }
}

/// Number of samples in `[start, end]`, refused past `MAX_SERIES_SAMPLES`
fn window_len(start: i64, end: i64) -> StoreResult<usize> {
    let len = end.abs_diff(start).checked_add(1);
    match len {
        Some(len) if start <= end && len <= MAX_SERIES_SAMPLES => Ok(len as usize),
        _ => Err(StoreError::InvalidArgument(format!(
            "window [{}, {}] spans more than {} samples",
            start, end, MAX_SERIES_SAMPLES
        ))),
    }
}

/// A dense window of samples plus sparse validity and provenance
///
/// `samples[i]` holds the value at index `start + i`. Only indices inside
/// `valid` carry data; `origins` records which task produced each valid range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    pub start: i64,
    pub samples: Samples,
    pub valid: IntervalSet<Interval>,
    pub origins: IntervalSet<TaggedInterval>,
}

impl TimeSeries {
    /// Series whose whole window is valid
    pub fn dense(start: i64, samples: Samples) -> Self {
        let end = start.saturating_add(samples.len() as i64 - 1);
        Self {
            start,
            samples,
            valid: IntervalSet::from_intervals(Some(Interval::new(start, end))),
            origins: IntervalSet::new(),
        }
    }

    /// Series with explicit valid ranges, clipped to the sample window
    pub fn new(start: i64, samples: Samples, valid: impl IntoIterator<Item = Interval>) -> Self {
        let end = start.saturating_add(samples.len() as i64 - 1);
        let valid = IntervalSet::from_intervals(valid).clipped(start, end);
        Self {
            start,
            samples,
            valid,
            origins: IntervalSet::new(),
        }
    }

    /// Inclusive end index of the sample window
    pub fn end(&self) -> i64 {
        self.start.saturating_add(self.samples.len() as i64 - 1)
    }

    /// Refuse a sample window that runs past the index space or holds more
    /// than `MAX_SERIES_SAMPLES`
    pub fn check_window(&self) -> StoreResult<()> {
        let len = self.samples.len() as i64;
        match self.start.checked_add(len - 1) {
            Some(end) if len > 0 => window_len(self.start, end).map(|_| ()),
            Some(_) => Ok(()),
            None => Err(StoreError::InvalidArgument(format!(
                "{} samples from index {} run past the end of the index space",
                len, self.start
            ))),
        }
    }

    pub fn data_type(&self) -> DataType {
        self.samples.data_type()
    }

    /// Build the stored form from a write. Valid coverage becomes the
    /// supplied ranges and every valid range is attributed to `origin`.
    pub fn with_origin(mut self, origin: u64) -> Self {
        self.origins = IntervalSet::from_intervals(
            self.valid
                .iter()
                .map(|iv| TaggedInterval::new(iv.start, iv.end, origin)),
        );
        self
    }

    /// Overlay `update` onto `self` (both must share a sample type).
    ///
    /// The update's window `[u.start, u.end]` is replaced: validity inside it
    /// becomes exactly the update's valid ranges and provenance of those
    /// ranges becomes the update's origin tags. Coverage outside the window
    /// is untouched.
    pub fn overlay(&self, update: &TimeSeries) -> StoreResult<TimeSeries> {
        if self.data_type() != update.data_type() {
            return Err(StoreError::InvalidArgument(format!(
                "cannot write {} samples over a {}",
                update.data_type(),
                self.data_type()
            )));
        }
        if update.samples.is_empty() {
            return Ok(self.clone());
        }

        let (u_start, u_end) = (update.start, update.end());
        let mut valid = self.valid.clone();
        let mut origins = self.origins.clone();
        valid.remove(u_start, u_end);
        origins.remove(u_start, u_end);
        for iv in update.valid.iter() {
            valid.insert(*iv);
        }
        for iv in update.origins.iter() {
            origins.insert(*iv);
        }

        // Shrink the window to what is still valid so stale samples do not
        // keep the record growing forever.
        let (new_start, new_end) = match valid.bounds() {
            Some(bounds) => bounds,
            None => {
                return Ok(TimeSeries {
                    start: u_start,
                    samples: Samples::zeroed(self.data_type(), 0)?,
                    valid,
                    origins,
                })
            }
        };

        let mut samples = Samples::zeroed(self.data_type(), window_len(new_start, new_end)?)?;
        for iv in valid.iter() {
            // Left of the update window and right of it come from the old
            // version, the inside from the update.
            let left = u_start
                .checked_sub(1)
                .map(|left_end| (self, iv.start, iv.end.min(left_end)));
            let inside = Some((update, iv.start.max(u_start), iv.end.min(u_end)));
            let right = u_end
                .checked_add(1)
                .map(|right_start| (self, iv.start.max(right_start), iv.end));
            for (source, from, to) in [left, inside, right].into_iter().flatten() {
                if from > to {
                    continue;
                }
                samples.copy_from(
                    (from - new_start) as usize,
                    &source.samples,
                    (from - source.start) as usize,
                    (to - from + 1) as usize,
                )?;
            }
        }

        Ok(TimeSeries {
            start: new_start,
            samples,
            valid,
            origins,
        })
    }

    /// Extract `[start, end]`. Indices that are not valid read as zero.
    pub fn window(&self, start: i64, end: i64) -> StoreResult<TimeSeries> {
        if start > end {
            return Err(StoreError::InvalidArgument(format!(
                "empty range [{}, {}]",
                start, end
            )));
        }
        let mut samples = Samples::zeroed(self.data_type(), window_len(start, end)?)?;
        let valid = self.valid.clipped(start, end);
        for iv in valid.iter() {
            let from = iv.start.max(self.start);
            let to = iv.end.min(self.end());
            if from > to {
                continue;
            }
            samples.copy_from(
                (from - start) as usize,
                &self.samples,
                (from - self.start) as usize,
                (to - from + 1) as usize,
            )?;
        }
        Ok(TimeSeries {
            start,
            samples,
            valid,
            origins: self.origins.clipped(start, end),
        })
    }
}

/// Opaque payload plus producer id and version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    pub origin: u64,
    pub version: u64,
    pub data: Vec<u8>,
}

/// One sparse timestamped sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub time: f64,
    pub value: f32,
    pub origin: u64,
}

/// Sparse timestamped samples, sorted by time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventSeries {
    pub events: Vec<Event>,
}

impl EventSeries {
    /// Replace everything inside `[start, end]` with `events` (which must all
    /// fall inside the window).
    pub fn replace_window(&mut self, start: f64, end: f64, events: &[Event]) -> StoreResult<()> {
        if !(start <= end) {
            return Err(StoreError::InvalidArgument(format!(
                "bad event window [{}, {}]",
                start, end
            )));
        }
        if let Some(e) = events.iter().find(|e| e.time < start || e.time > end) {
            return Err(StoreError::InvalidArgument(format!(
                "event at {} lies outside window [{}, {}]",
                e.time, start, end
            )));
        }
        self.events.retain(|e| e.time < start || e.time > end);
        self.events.extend_from_slice(events);
        self.events.sort_by(|a, b| a.time.total_cmp(&b.time));
        Ok(())
    }

    /// Events with `start <= time <= end`
    pub fn window(&self, start: f64, end: f64) -> Vec<Event> {
        self.events
            .iter()
            .filter(|e| e.time >= start && e.time <= end)
            .copied()
            .collect()
    }
}

/// Value stored under a key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Record {
    TimeSeries(TimeSeries),
    Blob(Blob),
    Events(EventSeries),
}

impl Record {
    pub fn data_type(&self) -> DataType {
        match self {
            Record::TimeSeries(ts) => ts.data_type(),
            Record::Blob(_) => DataType::Blob,
            Record::Events(_) => DataType::Events,
        }
    }
}

/// External (XA) transaction branch identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Xid {
    pub format_id: i32,
    pub global_id: Vec<u8>,
    pub branch: Vec<u8>,
}

impl Xid {
    pub fn new(format_id: i32, global_id: impl Into<Vec<u8>>, branch: impl Into<Vec<u8>>) -> Self {
        Self {
            format_id,
            global_id: global_id.into(),
            branch: branch.into(),
        }
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.format_id)?;
        for b in &self.global_id {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ":")?;
        for b in &self.branch {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Outcome of the prepare phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    Commit,
    Abort,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_normalization() {
        let key = Key::new("pa//flux/sap/42/").unwrap();
        assert_eq!(key.as_str(), "/pa/flux/sap/42");
        assert_eq!(key.name(), "42");
        assert_eq!(key.parent().unwrap().as_str(), "/pa/flux/sap");
        assert_eq!(key.segments().collect::<Vec<_>>(), vec!["pa", "flux", "sap", "42"]);
        assert!(Key::new("/single").unwrap().parent().is_none());
    }

    #[test]
    fn test_key_rejects_bad_input() {
        assert!(matches!(Key::new(""), Err(StoreError::InvalidKey { .. })));
        assert!(matches!(Key::new("///"), Err(StoreError::InvalidKey { .. })));
        assert!(matches!(Key::new("/a/../b"), Err(StoreError::InvalidKey { .. })));
        assert!(matches!(Key::new("/a b"), Err(StoreError::InvalidKey { .. })));
    }

    #[test]
    fn test_key_ordering_is_bytewise() {
        let mut keys = vec![
            Key::new("/b").unwrap(),
            Key::new("/a/z").unwrap(),
            Key::new("/a").unwrap(),
            Key::new("/B").unwrap(),
        ];
        keys.sort();
        let sorted: Vec<_> = keys.iter().map(|k| k.as_str()).collect();
        assert_eq!(sorted, vec!["/B", "/a", "/a/z", "/b"]);
    }

    #[test]
    fn test_key_serde_validates() {
        let json = serde_json::to_string(&Key::new("/x/y").unwrap()).unwrap();
        assert_eq!(json, "\"/x/y\"");
        assert!(serde_json::from_str::<Key>("\"/x/../y\"").is_err());
    }

    #[test]
    fn test_window_bounds_are_capped() {
        let series = TimeSeries::dense(0, Samples::Double(vec![1.0; 8]));
        for (start, end) in [(0, i64::MAX), (i64::MIN, i64::MAX), (0, 1_000_000_000_000), (3, 2)] {
            assert!(
                matches!(series.window(start, end), Err(StoreError::InvalidArgument(_))),
                "[{}, {}]",
                start,
                end
            );
        }
        let max = MAX_SERIES_SAMPLES as i64;
        assert_eq!(series.window(-2, 9).unwrap().samples.len(), 12);
        assert!(series.window(0, max).is_err());

        // Overlaying a distant update would need one huge dense window
        let far = TimeSeries::dense(1 << 40, Samples::Double(vec![2.0; 4]));
        assert!(matches!(series.overlay(&far), Err(StoreError::InvalidArgument(_))));

        let edge = TimeSeries::dense(i64::MAX - 1, Samples::Double(vec![0.0; 4]));
        assert!(edge.check_window().is_err());
        assert_eq!(edge.end(), i64::MAX);
        assert!(TimeSeries::dense(i64::MAX - 3, Samples::Double(vec![0.0; 4]))
            .check_window()
            .is_ok());
    }

    #[test]
    fn test_overlay_replaces_window() {
        let base = TimeSeries::dense(0, Samples::Int((0..100).collect())).with_origin(1);
        let update = TimeSeries::dense(50, Samples::Int((1000..1100).collect())).with_origin(2);

        let merged = base.overlay(&update).unwrap();
        assert_eq!(merged.start, 0);
        assert_eq!(merged.end(), 149);
        assert_eq!(merged.valid.as_slice(), &[Interval::new(0, 149)]);
        assert_eq!(
            merged.origins.as_slice(),
            &[TaggedInterval::new(0, 49, 1), TaggedInterval::new(50, 149, 2)]
        );
        match &merged.samples {
            Samples::Int(v) => {
                assert_eq!(v[0], 0);
                assert_eq!(v[49], 49);
                assert_eq!(v[50], 1000);
                assert_eq!(v[149], 1099);
            }
            other => panic!("unexpected samples {:?}", other),
        }
    }

    #[test]
    fn test_overlay_with_gap_invalidates() {
        let base = TimeSeries::dense(0, Samples::Double(vec![1.0; 10])).with_origin(1);
        // Writes [2,7] but only [2,3] is valid: [4,7] becomes a gap
        let update =
            TimeSeries::new(2, Samples::Double(vec![5.0; 6]), vec![Interval::new(2, 3)]).with_origin(2);
        let merged = base.overlay(&update).unwrap();
        assert_eq!(
            merged.valid.as_slice(),
            &[Interval::new(0, 3), Interval::new(8, 9)]
        );
        let window = merged.window(0, 9).unwrap();
        assert_eq!(
            window.samples,
            Samples::Double(vec![1.0, 1.0, 5.0, 5.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0])
        );
    }

    #[test]
    fn test_overlay_type_mismatch() {
        let base = TimeSeries::dense(0, Samples::Int(vec![1, 2]));
        let update = TimeSeries::dense(0, Samples::Float(vec![1.0]));
        assert!(matches!(
            base.overlay(&update),
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_window_outside_data_reads_zero() {
        let ts = TimeSeries::dense(10, Samples::Float(vec![2.0; 5])).with_origin(3);
        let w = ts.window(8, 12).unwrap();
        assert_eq!(w.samples, Samples::Float(vec![0.0, 0.0, 2.0, 2.0, 2.0]));
        assert_eq!(w.valid.as_slice(), &[Interval::new(10, 12)]);
        assert_eq!(w.origins.as_slice(), &[TaggedInterval::new(10, 12, 3)]);
    }

    #[test]
    fn test_event_window_replacement() {
        let mut series = EventSeries::default();
        let ev = |t: f64| Event {
            time: t,
            value: t as f32,
            origin: 1,
        };
        series
            .replace_window(0.0, 10.0, &[ev(1.0), ev(5.0), ev(9.0)])
            .unwrap();
        series.replace_window(4.0, 6.0, &[ev(4.5)]).unwrap();
        let times: Vec<f64> = series.events.iter().map(|e| e.time).collect();
        assert_eq!(times, vec![1.0, 4.5, 9.0]);
        assert_eq!(series.window(2.0, 9.0).len(), 2);
        assert!(series.replace_window(0.0, 1.0, &[ev(3.0)]).is_err());
    }

    #[test]
    fn test_xid_display() {
        let xid = Xid::new(7, vec![0xab, 0x01], vec![0x02]);
        assert_eq!(xid.to_string(), "7:ab01:02");
    }
}
