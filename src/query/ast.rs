//! Key pattern syntax tree
//!
//! ```text
//! TimeSeries@/pa/flux/*
//! /cal/[2d-black,2d-bias]/[1-84]
//! b@/dv/report/\d
//! ```

use crate::query::error::{QueryError, QueryResult};
use crate::storage::types::DataType;
use std::fmt;

/// Data type restriction given before '@'
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFilter {
    /// Any of the fixed-width series types
    TimeSeries,
    Blob,
    Events,
}

impl TypeFilter {
    /// Accepts full names or their first letter, case-insensitively
    pub fn from_name(name: &str) -> QueryResult<Self> {
        let lower = name.to_ascii_lowercase();
        let found = [
            ("timeseries", TypeFilter::TimeSeries),
            ("blob", TypeFilter::Blob),
            ("events", TypeFilter::Events),
        ]
        .into_iter()
        .find(|(full, _)| lower == *full || lower == full[..1]);
        found
            .map(|(_, filter)| filter)
            .ok_or_else(|| QueryError::UnknownDataType(name.to_string()))
    }

    pub fn accepts(self, data_type: DataType) -> bool {
        match self {
            TypeFilter::TimeSeries => data_type.is_time_series(),
            TypeFilter::Blob => data_type == DataType::Blob,
            TypeFilter::Events => data_type == DataType::Events,
        }
    }
}

/// One element of a pattern
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    /// Exact text
    Literal(String),
    /// `*`: any run of characters, including '/'
    Any,
    /// `\d`: a decimal number
    Digits,
    /// `[a,b,c]`: any one of the alternatives
    Alternatives(Vec<Vec<Element>>),
    /// `[1-84]`: an integer in the inclusive range
    IntRange { start: i64, end: i64 },
    /// `[0.5-2.5]`: a decimal number in the inclusive range
    FloatRange { start: f64, end: f64 },
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Element::Literal(text) => {
                for c in text.chars() {
                    if matches!(c, '*' | '[' | ']' | ',' | '\\') {
                        write!(f, "\\")?;
                    }
                    write!(f, "{}", c)?;
                }
                Ok(())
            }
            Element::Any => write!(f, "*"),
            Element::Digits => write!(f, "\\d"),
            Element::Alternatives(alts) => {
                write!(f, "[")?;
                for (i, alt) in alts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    for element in alt {
                        write!(f, "{}", element)?;
                    }
                }
                write!(f, "]")
            }
            Element::IntRange { start, end } => write!(f, "[{}-{}]", start, end),
            Element::FloatRange { start, end } => write!(f, "[{:?}-{:?}]", start, end),
        }
    }
}

/// A parsed key pattern
#[derive(Debug, Clone, PartialEq)]
pub struct KeyPattern {
    pub data_type: Option<TypeFilter>,
    pub elements: Vec<Element>,
}

impl KeyPattern {
    /// Leading literal text every matching key must start with
    pub fn literal_prefix(&self) -> String {
        self.elements
            .iter()
            .map_while(|element| match element {
                Element::Literal(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.data_type {
            Some(TypeFilter::TimeSeries) => write!(f, "TimeSeries@")?,
            Some(TypeFilter::Blob) => write!(f, "Blob@")?,
            Some(TypeFilter::Events) => write!(f, "Events@")?,
            None => {}
        }
        for element in &self.elements {
            write!(f, "{}", element)?;
        }
        Ok(())
    }
}
