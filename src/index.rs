//! The segment-based index engine.
//!
//! # Architecture
//!
//! - **Mutation buffer** ([`doc_writer`]): concurrent indexing threads stage
//!   documents into per-thread buffers; deletes and doc-values updates go to
//!   one globally ordered queue ([`delete_queue`]).
//! - **Segments** ([`segment_info`], [`codec`]): immutable base files plus
//!   generation overlays for live docs ([`live_docs`]) and doc values
//!   ([`doc_values`]).
//! - **Catalog** ([`segment_infos`]): the list of segments of one commit,
//!   published atomically as `segments_N` by the two-phase [`commit`].
//! - **Resolution** ([`buffered_updates`]): frozen packets of deletes and
//!   updates applied in order to every segment they precede.
//! - **Merging** ([`merge_policy`], [`merge_scheduler`], [`merger`]).
//! - **Readers** ([`segment_reader`], [`directory_reader`], [`reader`]):
//!   reference-counted point-in-time views, on a commit or near real time
//!   on a writer.
//! - **File lifetime** ([`file_deleter`]): files are deleted once neither a
//!   kept commit, the writer nor an open reader references them.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use halberd::document::Document;
//! use halberd::index::{DirectoryReader, IndexWriter, IndexWriterConfig, LiveDocsAccess, Term};
//! use halberd::storage::memory::MemoryStorage;
//! use halberd::storage::Storage;
//!
//! # fn main() -> halberd::error::Result<()> {
//! let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
//! let writer = IndexWriter::open(Arc::clone(&storage), IndexWriterConfig::default())?;
//! for id in ["a", "b", "c"] {
//!     writer.add_document(&Document::builder().add_keyword("id", id).build())?;
//! }
//! writer.delete_documents(vec![Term::new("id", "b")])?;
//! writer.commit()?;
//!
//! let reader = DirectoryReader::open(Arc::clone(&storage))?;
//! assert_eq!(reader.num_docs(), 2);
//! reader.close()?;
//! writer.close()?;
//! # Ok(())
//! # }
//! ```

pub mod buffered_updates;
pub mod check;
pub mod codec;
pub mod commit;
pub mod config;
pub mod delete_queue;
pub mod directory_reader;
pub mod doc_values;
pub mod doc_writer;
pub mod doc_writer_per_thread;
pub mod field_infos;
pub mod file_deleter;
pub mod file_names;
pub mod flush_control;
pub mod live_docs;
pub mod merge_policy;
pub mod merge_scheduler;
pub mod merger;
pub mod query;
pub mod reader;
pub mod reader_pool;
pub mod segment_info;
pub mod segment_infos;
pub mod segment_reader;
pub mod term;
pub mod writer;

pub use check::{check_index, CheckIndexReport, SegmentCheck};
pub use codec::{Codec, CodecRegistry, LegacyCodec, StandardCodec};
pub use commit::CommitPhase;
pub use config::{IndexWriterConfig, OpenMode};
pub use directory_reader::DirectoryReader;
pub use doc_values::{DocValue, DocValuesUpdate};
pub use file_deleter::{list_commits, IndexCommit, IndexDeletionPolicy, KeepAllCommits, KeepOnlyLastCommit};
pub use merge_policy::{LogMergePolicy, MergePolicy, MergeTrigger, NoMergePolicy};
pub use merge_scheduler::{
    ConcurrentMergeScheduler, ConcurrentMergeSchedulerConfig, MergeErrorPolicy, MergeScheduler, SerialMergeScheduler,
};
pub use query::Query;
pub use reader::{DocValuesAccess, LiveDocsAccess, Reader};
pub use segment_infos::SegmentInfos;
pub use segment_reader::SegmentReader;
pub use term::Term;
pub use writer::{IndexWriter, IndexWriterStats};
