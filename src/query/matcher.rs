//! Key pattern evaluation
//!
//! Matching is anchored at both ends and backtracks through `*` and
//! alternatives. Numeric elements try the longest run of digits (and '.'
//! for decimals) at the current position first, then shorter ones, so
//! `[1-3]5` matches `35`.

use crate::index::IndexEntry;
use crate::query::ast::{Element, KeyPattern};
use crate::query::error::QueryResult;
use crate::query::parser::parse_pattern;
use crate::storage::types::Key;

/// Remaining work after the current element list is exhausted
struct Continuation<'a> {
    elements: &'a [Element],
    next: Option<&'a Continuation<'a>>,
}

/// Compiled key pattern
#[derive(Debug, Clone)]
pub struct KeyMatcher {
    pattern: KeyPattern,
    prefix: String,
}

impl KeyMatcher {
    pub fn new(pattern: &str) -> QueryResult<Self> {
        Ok(Self::from_pattern(parse_pattern(pattern)?))
    }

    pub fn from_pattern(pattern: KeyPattern) -> Self {
        let prefix = pattern.literal_prefix();
        Self { pattern, prefix }
    }

    pub fn pattern(&self) -> &KeyPattern {
        &self.pattern
    }

    /// Literal text every matching key starts with; scans can begin here
    pub fn scan_prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether the key text matches, ignoring any data type restriction
    pub fn matches(&self, key: &str) -> bool {
        match_at(&self.pattern.elements, key, None)
    }

    /// Whether an indexed key satisfies both the path and the type filter
    pub fn accepts(&self, key: &Key, entry: &IndexEntry) -> bool {
        self.pattern
            .data_type
            .map_or(true, |filter| filter.accepts(entry.data_type))
            && self.matches(key.as_str())
    }
}

fn match_at(elements: &[Element], input: &str, next: Option<&Continuation<'_>>) -> bool {
    let Some((element, rest)) = elements.split_first() else {
        return match next {
            Some(cont) => match_at(cont.elements, input, cont.next),
            None => input.is_empty(),
        };
    };

    match element {
        Element::Literal(text) => input
            .strip_prefix(text.as_str())
            .is_some_and(|tail| match_at(rest, tail, next)),
        Element::Any => input
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(input.len()))
            .any(|i| match_at(rest, &input[i..], next)),
        Element::Digits => {
            let run = number_run(input, true);
            // Longest decimal first, then shorter prefixes that still parse
            (1..=run)
                .rev()
                .filter(|len| input[..*len].parse::<f64>().is_ok())
                .any(|len| match_at(rest, &input[len..], next))
        }
        Element::IntRange { start, end } => (1..=number_run(input, false))
            .rev()
            .filter(|len| {
                input[..*len]
                    .parse::<i64>()
                    .is_ok_and(|value| value >= *start && value <= *end)
            })
            .any(|len| match_at(rest, &input[len..], next)),
        Element::FloatRange { start, end } => (1..=number_run(input, true))
            .rev()
            .filter(|len| {
                input[..*len]
                    .parse::<f64>()
                    .is_ok_and(|value| value >= *start && value <= *end)
            })
            .any(|len| match_at(rest, &input[len..], next)),
        Element::Alternatives(alts) => {
            let cont = Continuation {
                elements: rest,
                next,
            };
            alts.iter()
                .any(|alt| match_at(alt, input, Some(&cont)))
        }
    }
}

/// Length of the leading run of ASCII digits (and '.' when `decimal`)
fn number_run(input: &str, decimal: bool) -> usize {
    input
        .bytes()
        .take_while(|b| b.is_ascii_digit() || (decimal && *b == b'.'))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::{DataType, Lsn, TxId};

    fn matcher(pattern: &str) -> KeyMatcher {
        KeyMatcher::new(pattern).unwrap()
    }

    fn entry(data_type: DataType) -> IndexEntry {
        IndexEntry {
            file_id: 0,
            offset: 1,
            length: 1,
            size: 10,
            data_type,
            checksum: 0,
            last_writer: TxId(1),
            commit_lsn: Lsn(1),
        }
    }

    #[test]
    fn test_literal_and_wildcard() {
        let m = matcher("/pa/targets/*");
        assert!(m.matches("/pa/targets/long/7"));
        assert!(m.matches("/pa/targets/"));
        assert!(!m.matches("/pa/target"));
        assert_eq!(m.scan_prefix(), "/pa/targets/");

        let exact = matcher("/pa/flux");
        assert!(exact.matches("/pa/flux"));
        assert!(!exact.matches("/pa/flux/1"));
    }

    #[test]
    fn test_wildcard_backtracks() {
        let m = matcher("/a/*/flux/*/7");
        assert!(m.matches("/a/x/flux/y/flux/z/7"));
        assert!(!m.matches("/a/x/flux/y/8"));

        let suffix = matcher("*:[1-3]");
        assert!(suffix.matches("/pdc/cadence:2"));
        assert!(!suffix.matches("/pdc/cadence:12"));
    }

    #[test]
    fn test_alternatives_and_ranges() {
        let m = matcher("/dv/[Correlation,Normalization]/[48]/[1-10]:\\d");
        assert!(m.matches("/dv/Correlation/48/3:1.5"));
        assert!(m.matches("/dv/Normalization/48/10:7"));
        assert!(!m.matches("/dv/Normalization/48/11:7"));
        assert!(!m.matches("/dv/Other/48/3:1"));
        assert!(!m.matches("/dv/Correlation/48/3:"));

        // An alternative that is a prefix of another must not shadow it
        let shadow = matcher("/cal/[2d,2d-black]/x");
        assert!(shadow.matches("/cal/2d-black/x"));
        assert!(shadow.matches("/cal/2d/x"));

        let mjd = matcher("/mjd/[54000.5-54001]");
        assert!(mjd.matches("/mjd/54000.75"));
        assert!(!mjd.matches("/mjd/54002"));
    }

    #[test]
    fn test_ranges_try_shorter_runs() {
        let m = matcher("/x/[1-3]5");
        assert!(m.matches("/x/35"));
        assert!(!m.matches("/x/45"));
        assert!(!m.matches("/x/3"));

        let cadence = matcher("/c/[10-20]0/*");
        assert!(cadence.matches("/c/150/a"));
        assert!(!cadence.matches("/c/250/a"));

        let float = matcher("/f/[0.5-2.5]7");
        assert!(float.matches("/f/1.57"));
        assert!(!float.matches("/f/3.57"));
    }

    #[test]
    fn test_type_filter() {
        let m = matcher("TimeSeries@/pa/*");
        let key = Key::new("/pa/flux/1").unwrap();
        assert!(m.accepts(&key, &entry(DataType::FloatSeries)));
        assert!(!m.accepts(&key, &entry(DataType::Blob)));

        let any = matcher("/pa/*");
        assert!(any.accepts(&key, &entry(DataType::Blob)));
    }
}
