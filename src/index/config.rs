//! Index writer configuration.
//!
//! The plain-data part of [`IndexWriterConfig`] (open mode, flush thresholds,
//! close behaviour) is serde-serialisable so it can live in a config file.
//! Analyzer, codec, merge policy, merge scheduler and deletion policy are
//! trait objects supplied in code.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::analysis::{Analyzer, StandardAnalyzer};
use crate::error::{HalberdError, Result};
use crate::index::codec::{Codec, CodecRegistry, StandardCodec};
use crate::index::file_deleter::{IndexDeletionPolicy, KeepOnlyLastCommit};
use crate::index::flush_control::FlushPolicy;
use crate::index::merge_policy::{LogMergePolicy, MergePolicy};
use crate::index::merge_scheduler::{ConcurrentMergeScheduler, ConcurrentMergeSchedulerConfig, MergeScheduler};

/// How a writer treats the index it is opened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OpenMode {
    /// Start from an empty catalog, replacing any existing index on the first commit.
    Create,
    /// Open the latest commit; fail if there is none.
    Append,
    /// Append if a commit exists, create otherwise.
    #[default]
    CreateOrAppend,
}

fn default_ram_buffer_size_mb() -> Option<f64> {
    Some(16.0)
}

fn default_per_thread_hard_limit_mb() -> usize {
    1945
}

fn default_max_pending_flushes() -> usize {
    (num_cpus::get() * 2).max(2)
}

fn default_true() -> bool {
    true
}

fn default_analyzer() -> Arc<dyn Analyzer> {
    Arc::new(StandardAnalyzer)
}

fn default_codec() -> Arc<dyn Codec> {
    Arc::new(StandardCodec)
}

fn default_registry() -> Arc<CodecRegistry> {
    Arc::new(CodecRegistry::default())
}

fn default_merge_policy() -> Arc<dyn MergePolicy> {
    Arc::new(LogMergePolicy::default())
}

fn default_merge_scheduler() -> Arc<dyn MergeScheduler> {
    Arc::new(ConcurrentMergeScheduler::new(ConcurrentMergeSchedulerConfig::default()))
}

fn default_deletion_policy() -> Arc<dyn IndexDeletionPolicy> {
    Arc::new(KeepOnlyLastCommit)
}

/// Configuration of an [`IndexWriter`](crate::index::writer::IndexWriter).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexWriterConfig {
    #[serde(default)]
    pub open_mode: OpenMode,

    /// Flush once buffered documents and deletes use this much RAM.
    #[serde(default = "default_ram_buffer_size_mb")]
    pub ram_buffer_size_mb: Option<f64>,

    /// Flush a buffer once it holds this many documents.
    #[serde(default)]
    pub max_buffered_docs: Option<usize>,

    /// Freeze buffered deletes once this many are pending.
    #[serde(default)]
    pub max_buffered_delete_terms: Option<usize>,

    #[serde(default = "default_per_thread_hard_limit_mb")]
    pub per_thread_hard_limit_mb: usize,

    /// Commit pending changes when the writer is closed.
    #[serde(default = "default_true")]
    pub commit_on_close: bool,

    /// Flushes in flight before indexing threads are stalled.
    #[serde(default = "default_max_pending_flushes")]
    pub max_pending_flushes: usize,

    #[serde(skip, default = "default_analyzer")]
    pub analyzer: Arc<dyn Analyzer>,

    /// Codec new segments are written with.
    #[serde(skip, default = "default_codec")]
    pub codec: Arc<dyn Codec>,

    /// Codecs existing segments are read with.
    #[serde(skip, default = "default_registry")]
    pub codec_registry: Arc<CodecRegistry>,

    #[serde(skip, default = "default_merge_policy")]
    pub merge_policy: Arc<dyn MergePolicy>,

    #[serde(skip, default = "default_merge_scheduler")]
    pub merge_scheduler: Arc<dyn MergeScheduler>,

    #[serde(skip, default = "default_deletion_policy")]
    pub deletion_policy: Arc<dyn IndexDeletionPolicy>,
}

impl Default for IndexWriterConfig {
    fn default() -> Self {
        IndexWriterConfig {
            open_mode: OpenMode::default(),
            ram_buffer_size_mb: default_ram_buffer_size_mb(),
            max_buffered_docs: None,
            max_buffered_delete_terms: None,
            per_thread_hard_limit_mb: default_per_thread_hard_limit_mb(),
            commit_on_close: true,
            max_pending_flushes: default_max_pending_flushes(),
            analyzer: default_analyzer(),
            codec: default_codec(),
            codec_registry: default_registry(),
            merge_policy: default_merge_policy(),
            merge_scheduler: default_merge_scheduler(),
            deletion_policy: default_deletion_policy(),
        }
    }
}

impl IndexWriterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_open_mode(mut self, open_mode: OpenMode) -> Self {
        self.open_mode = open_mode;
        self
    }

    pub fn with_ram_buffer_size_mb(mut self, mb: Option<f64>) -> Self {
        self.ram_buffer_size_mb = mb;
        self
    }

    pub fn with_max_buffered_docs(mut self, docs: Option<usize>) -> Self {
        self.max_buffered_docs = docs;
        self
    }

    pub fn with_max_buffered_delete_terms(mut self, terms: Option<usize>) -> Self {
        self.max_buffered_delete_terms = terms;
        self
    }

    pub fn with_commit_on_close(mut self, commit_on_close: bool) -> Self {
        self.commit_on_close = commit_on_close;
        self
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    /// Write new segments with `codec`. It is also registered for reading.
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        if self.codec_registry.get(codec.name()).is_none() {
            let mut registry = (*self.codec_registry).clone();
            registry.register(Arc::clone(&codec));
            self.codec_registry = Arc::new(registry);
        }
        self.codec = codec;
        self
    }

    pub fn with_codec_registry(mut self, registry: Arc<CodecRegistry>) -> Self {
        self.codec_registry = registry;
        self
    }

    pub fn with_merge_policy(mut self, policy: Arc<dyn MergePolicy>) -> Self {
        self.merge_policy = policy;
        self
    }

    pub fn with_merge_scheduler(mut self, scheduler: Arc<dyn MergeScheduler>) -> Self {
        self.merge_scheduler = scheduler;
        self
    }

    pub fn with_deletion_policy(mut self, policy: Arc<dyn IndexDeletionPolicy>) -> Self {
        self.deletion_policy = policy;
        self
    }

    /// Check thresholds for values that can never work.
    pub fn validate(&self) -> Result<()> {
        if let Some(mb) = self.ram_buffer_size_mb {
            if !(mb > 0.0) {
                return Err(HalberdError::invalid_config(format!(
                    "ram_buffer_size_mb must be positive, got {mb}"
                )));
            }
        }
        if self.max_buffered_docs == Some(0) {
            return Err(HalberdError::invalid_config("max_buffered_docs must be at least 1"));
        }
        if self.max_buffered_delete_terms == Some(0) {
            return Err(HalberdError::invalid_config("max_buffered_delete_terms must be at least 1"));
        }
        if self.ram_buffer_size_mb.is_none() && self.max_buffered_docs.is_none() {
            return Err(HalberdError::invalid_config(
                "at least one of ram_buffer_size_mb and max_buffered_docs must be set",
            ));
        }
        if self.per_thread_hard_limit_mb == 0 || self.per_thread_hard_limit_mb >= 2048 {
            return Err(HalberdError::invalid_config(format!(
                "per_thread_hard_limit_mb must be in 1..2048, got {}",
                self.per_thread_hard_limit_mb
            )));
        }
        if self.codec_registry.get(self.codec.name()).is_none() {
            return Err(HalberdError::invalid_config(format!(
                "codec {} is not in the codec registry",
                self.codec.name()
            )));
        }
        Ok(())
    }

    pub fn flush_policy(&self) -> FlushPolicy {
        FlushPolicy {
            ram_buffer_size_mb: self.ram_buffer_size_mb,
            max_buffered_docs: self.max_buffered_docs,
            max_buffered_delete_terms: self.max_buffered_delete_terms,
            per_thread_hard_limit_mb: self.per_thread_hard_limit_mb,
            max_pending_flushes: self.max_pending_flushes.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::codec::LegacyCodec;

    #[test]
    fn test_defaults() {
        let config = IndexWriterConfig::default();
        assert_eq!(config.open_mode, OpenMode::CreateOrAppend);
        assert_eq!(config.ram_buffer_size_mb, Some(16.0));
        assert!(config.commit_on_close);
        assert_eq!(config.codec.name(), StandardCodec::NAME);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_round_trip_keeps_plain_fields() {
        let config = IndexWriterConfig::default()
            .with_open_mode(OpenMode::Create)
            .with_max_buffered_docs(Some(2))
            .with_commit_on_close(false);
        let json = serde_json::to_string(&config).unwrap();
        let back: IndexWriterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.open_mode, OpenMode::Create);
        assert_eq!(back.max_buffered_docs, Some(2));
        assert!(!back.commit_on_close);
        assert_eq!(back.merge_policy.name(), "log_byte_size");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: IndexWriterConfig = serde_json::from_str(r#"{"max_buffered_docs": 10}"#).unwrap();
        assert_eq!(config.ram_buffer_size_mb, Some(16.0));
        assert_eq!(config.per_thread_hard_limit_mb, 1945);
        assert_eq!(config.max_buffered_docs, Some(10));
    }

    #[test]
    fn test_validation() {
        let config = IndexWriterConfig::default().with_max_buffered_docs(Some(0));
        assert!(config.validate().is_err());

        let config = IndexWriterConfig::default()
            .with_ram_buffer_size_mb(None)
            .with_max_buffered_docs(None);
        assert!(config.validate().is_err());

        let config = IndexWriterConfig::default().with_codec_registry(Arc::new(CodecRegistry::empty()));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_with_codec_registers_it() {
        let config = IndexWriterConfig::default()
            .with_codec_registry(Arc::new(CodecRegistry::empty()))
            .with_codec(Arc::new(LegacyCodec));
        assert!(config.codec_registry.get(LegacyCodec::NAME).is_some());
        assert!(config.validate().is_ok());
    }
}
