//! # Halberd
//!
//! A segment-based inverted index engine with in-place doc-values updates.
//!
//! ## Features
//!
//! - Concurrent indexing into per-thread buffers, flushed as immutable segments
//! - Deletes and numeric or binary doc-values updates by term or query,
//!   applied in a single global order
//! - Two-phase, crash-safe commits with user commit data
//! - Near-real-time readers with reference-counted segment sharing
//! - Background merging with pluggable policies and schedulers
//! - Pluggable storage backends and segment codecs

pub mod analysis;
pub mod cli;
pub mod document;
pub mod error;
pub mod index;
pub mod storage;
pub mod util;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
