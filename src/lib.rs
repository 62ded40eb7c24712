//! history-enrich library - shared modules for the enrichment pipeline.
//!
//! fetch: skip set + progress store -> pending keys -> batched lookups,
//! persisted to the metadata log and progress store after every batch.
//! merge: base table LEFT JOIN deduplicated metadata log (and optionally an
//! external dataset), streamed. split: songs and podcasts into two tables.

pub mod base_table;
pub mod coverage;
pub mod error;
pub mod fetcher;
pub mod lookup;
pub mod merge;
pub mod metadata_log;
pub mod models;
pub mod normalize;
pub mod progress;
pub mod progress_store;
pub mod safety;
pub mod skip_set;
pub mod split;
