//! # Diffix
//! Anonymizing aggregation and query rewriting engine
//!
//! ## What is Diffix?
//! Diffix answers SQL counting queries over sensitive tables with sticky noise.
//! Each sensitive table declares one or more anonymization ID (AID) columns,
//! identifying the protected entities.
//!
//! ### Query rewriting
//! A query reading sensitive tables is validated against a restricted subset of SQL,
//! then rewritten: counts become AID aware anonymizing counts, simple selects are grouped into
//! implicit buckets, and a hidden low-count aggregate decides which buckets are suppressed.
//!
//! ### Sticky noise
//! Noise is seeded from the definition of a bucket (its grouping expressions and label values)
//! and from the AIDs contributing to it.
//! The same query on the same data always returns the same answer,
//! and averaging repeated queries does not remove the noise.
//!
//! ### Planning and execution
//! Rewritten queries are planned, possibly in parallel partial and final aggregation stages,
//! and run by an in-memory executor.
//!

pub mod aggregation;
pub mod config;
pub mod execution;
pub mod hash;
pub mod plan;
pub mod query;
pub mod random;
pub mod setup;
pub mod sql;
pub mod value;

pub use config::{AccessLevel, Config};
pub use execution::{Database, ResultSet};
pub use plan::Planner;
pub use value::{DataType, Value};
/// Expose sqlparser::ast as part of diffix
pub use sqlparser::{ast, dialect, parser, tokenizer};
