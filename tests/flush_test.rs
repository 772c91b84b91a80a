use std::sync::Arc;

use halberd::document::Document;
use halberd::error::Result;
use halberd::index::{
    DirectoryReader, IndexWriter, IndexWriterConfig, LiveDocsAccess, NoMergePolicy, SerialMergeScheduler,
};
use halberd::storage::Storage;
use halberd::storage::memory::MemoryStorage;

fn config(max_buffered_docs: Option<usize>, ram_buffer_size_mb: Option<f64>) -> IndexWriterConfig {
    IndexWriterConfig::default()
        .with_max_buffered_docs(max_buffered_docs)
        .with_ram_buffer_size_mb(ram_buffer_size_mb)
        .with_merge_policy(Arc::new(NoMergePolicy))
        .with_merge_scheduler(Arc::new(SerialMergeScheduler::default()))
}

fn doc(i: usize) -> Document {
    Document::builder()
        .add_keyword("id", format!("doc-{i}"))
        .add_text("body", "a few words of body text to take up buffer space")
        .build()
}

#[test]
fn test_doc_count_threshold_bounds_segment_size() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let writer = IndexWriter::open(Arc::clone(&storage), config(Some(2), None))?;
    for i in 0..7 {
        writer.add_document(&doc(i))?;
    }
    // three full buffers were flushed while adding, one doc is still buffered
    assert_eq!(writer.segment_count(), 3);
    assert_eq!(writer.stats().docs_in_ram, 1);
    writer.commit()?;

    let reader = DirectoryReader::open(Arc::clone(&storage))?;
    let sizes: Vec<u32> = reader.leaves().iter().map(|s| s.max_doc()).collect();
    assert_eq!(sizes.iter().sum::<u32>(), 7);
    assert!(sizes.iter().all(|&size| size <= 2), "{sizes:?}");
    assert_eq!(sizes, vec![2, 2, 2, 1]);
    reader.close()?;
    writer.close()?;
    Ok(())
}

#[test]
fn test_explicit_flush_publishes_without_commit() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let writer = IndexWriter::open(Arc::clone(&storage), config(None, Some(16.0)))?;
    for i in 0..3 {
        writer.add_document(&doc(i))?;
    }
    assert_eq!(writer.segment_count(), 0);
    writer.flush()?;
    assert_eq!(writer.segment_count(), 1);
    assert_eq!(writer.stats().docs_in_ram, 0);
    assert!(writer.has_uncommitted_changes());
    assert!(DirectoryReader::open(Arc::clone(&storage)).is_err());

    writer.commit()?;
    assert!(!writer.has_uncommitted_changes());
    writer.close()?;
    Ok(())
}

#[test]
fn test_ram_threshold_flushes() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let writer = IndexWriter::open(Arc::clone(&storage), config(None, Some(0.01)))?;
    for i in 0..500 {
        writer.add_document(&doc(i))?;
    }
    assert!(writer.segment_count() > 1);
    assert!(writer.stats().flush.flushes_completed > 1);
    writer.commit()?;

    let reader = DirectoryReader::open(Arc::clone(&storage))?;
    assert_eq!(reader.num_docs(), 500);
    reader.close()?;
    writer.close()?;
    Ok(())
}
