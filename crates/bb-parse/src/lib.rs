//! Recipe and configuration parsing core for the Bakehouse build
//! orchestrator.
//!
//! A [`Parser`] session ingests declarative build-metadata files — recipes
//! (`.bb`), class fragments (`.bbclass`), include snippets (`.inc`) and
//! configuration files (`.conf`) — resolves them through the colon-separated
//! `BBPATH` search path, records every path consulted on the datastore's
//! dependency ledger, and evaluates the resulting statement tree against a
//! [`bb_data::DataStore`].
//!
//! The session owns a stack of caches (mtime stamps, resolver LRU,
//! per-directory filename indexes with fingerprint invalidation, statement
//! trees, inherit memo) plus a [`bb_metrics::MetricsSink`] counting their
//! hits, misses, and evictions. Each cache layer has a `BB_OPT_DISABLE_*`
//! environment kill switch for diagnostics.

mod ast;
mod cache;
mod conf;
mod error;
mod index;
mod inherit;
mod lru;
mod mtime;
mod parser;
mod recipe;
mod resolve;

pub use ast::{AssignOp, Statement, StatementGroup, StatementKind};
pub use cache::StatementCache;
pub use error::ParseError;
pub use mtime::MtimeCache;
pub use parser::{
    get_file_depends, CacheOptions, Finalizer, Handled, HandlerEntry, Parser,
};
