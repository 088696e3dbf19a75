//! Key Matcher
//!
//! A small pattern language for selecting groups of keys:
//!
//! - **AST**: pattern elements and the optional data type filter
//! - **Parser**: parse pattern strings into the AST (nom)
//! - **Matcher**: evaluate a pattern against keys
//!
//! # Pattern Language
//!
//! ```text
//! [TimeSeries|Blob|Events@]path
//!
//! *            any run of characters
//! \d           a decimal number
//! [a,b,c]      one of the alternatives
//! [1-84]       an integer in range
//! [0.5-2.5]    a decimal in range
//! ```
//!
//! # Examples
//!
//! ```rust,ignore
//! use tsvault::query::KeyMatcher;
//!
//! let matcher = KeyMatcher::new("TimeSeries@/pa/flux/[1-84]/*")?;
//! assert!(matcher.matches("/pa/flux/12/target9"));
//!
//! // Through the store, which scans from the literal prefix
//! let keys = store.match_keys("/cal/[2d-black,2d-bias]/*").await?;
//! ```

mod ast;
mod error;
mod matcher;
mod parser;

pub use ast::{Element, KeyPattern, TypeFilter};
pub use error::{QueryError, QueryResult};
pub use matcher::KeyMatcher;
pub use parser::parse_pattern;
