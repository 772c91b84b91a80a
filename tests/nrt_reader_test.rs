use std::sync::Arc;

use halberd::document::Document;
use halberd::error::Result;
use halberd::index::{
    DirectoryReader, DocValuesAccess, IndexWriter, IndexWriterConfig, LiveDocsAccess, NoMergePolicy,
    SerialMergeScheduler, Term,
};
use halberd::storage::Storage;
use halberd::storage::memory::MemoryStorage;

fn config() -> IndexWriterConfig {
    IndexWriterConfig::default()
        .with_merge_policy(Arc::new(NoMergePolicy))
        .with_merge_scheduler(Arc::new(SerialMergeScheduler::default()))
}

fn doc(id: &str, val: i64) -> Document {
    Document::builder()
        .add_keyword("id", id)
        .add_numeric_doc_values("val", val)
        .build()
}

#[test]
fn test_open_if_changed_only_when_changed() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let writer = IndexWriter::open(Arc::clone(&storage), config())?;
    writer.add_document(&doc("a", 1))?;

    let reader = writer.reader()?;
    assert!(reader.is_near_real_time());
    assert!(reader.is_current()?);
    assert!(reader.open_if_changed()?.is_none());

    writer.add_document(&doc("b", 2))?;
    assert!(!reader.is_current()?);
    let newer = reader.open_if_changed()?.expect("a document was added");
    assert_eq!(reader.num_docs(), 1);
    assert_eq!(newer.num_docs(), 2);

    reader.close()?;
    newer.close()?;
    writer.close()?;
    Ok(())
}

#[test]
fn test_reopen_shares_unchanged_segments() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let writer = IndexWriter::open(Arc::clone(&storage), config())?;
    writer.add_document(&doc("a", 1))?;
    let first = writer.reader()?;
    assert_eq!(first.leaves().len(), 1);
    let shared = Arc::clone(&first.leaves()[0]);
    let refs_with_one_reader = shared.ref_count();

    writer.add_document(&doc("b", 2))?;
    let second = first.open_if_changed()?.expect("changed");
    assert_eq!(second.leaves().len(), 2);
    assert!(Arc::ptr_eq(&second.leaves()[0], &shared));
    assert_eq!(shared.ref_count(), refs_with_one_reader + 1);

    first.close()?;
    assert_eq!(shared.ref_count(), refs_with_one_reader);
    second.close()?;
    writer.close()?;
    Ok(())
}

#[test]
fn test_updated_segment_gets_a_new_reader() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let writer = IndexWriter::open(Arc::clone(&storage), config())?;
    writer.add_document(&doc("a", 1))?;
    writer.add_document(&doc("b", 2))?;
    let before = writer.reader()?;

    writer.delete_documents(vec![Term::new("id", "a")])?;
    writer.update_numeric_value(Term::new("id", "b"), "val", Some(20))?;
    let after = before.open_if_changed()?.expect("changed");

    assert!(!Arc::ptr_eq(&before.leaves()[0], &after.leaves()[0]));
    assert_eq!(before.num_docs(), 2);
    assert_eq!(after.num_docs(), 1);
    assert_eq!(before.numeric_value("val", 1), Some(2));
    assert_eq!(after.numeric_value("val", 1), Some(20));

    before.close()?;
    after.close()?;
    writer.close()?;
    Ok(())
}

#[test]
fn test_open_reader_pins_merged_away_files() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let writer = IndexWriter::open(Arc::clone(&storage), config().with_max_buffered_docs(Some(1)))?;
    for (i, id) in ["a", "b", "c"].into_iter().enumerate() {
        writer.add_document(&doc(id, i as i64))?;
    }
    writer.commit()?;

    let reader = writer.reader()?;
    let pinned: Vec<String> = reader.leaves().iter().flat_map(|s| s.commit_info().files()).collect();
    writer.force_merge(1)?;
    writer.commit()?;
    assert_eq!(writer.segment_count(), 1);
    for file in &pinned {
        assert!(storage.file_exists(file), "{file} deleted while a reader uses it");
    }
    assert_eq!(reader.num_docs(), 3);

    reader.close()?;
    for file in &pinned {
        assert!(!storage.file_exists(file), "{file} kept after its last reader closed");
    }
    writer.close()?;
    Ok(())
}

#[test]
fn test_committed_reader_ignores_buffered_changes() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let writer = IndexWriter::open(Arc::clone(&storage), config())?;
    writer.add_document(&doc("a", 1))?;
    writer.commit()?;

    let committed = DirectoryReader::open(Arc::clone(&storage))?;
    assert!(!committed.is_near_real_time());
    writer.add_document(&doc("b", 2))?;
    writer.flush()?;
    assert!(committed.is_current()?);
    assert!(committed.open_if_changed()?.is_none());

    writer.commit()?;
    assert!(!committed.is_current()?);
    let refreshed = committed.open_if_changed()?.expect("new commit");
    assert_eq!(refreshed.num_docs(), 2);

    committed.close()?;
    refreshed.close()?;
    writer.close()?;
    Ok(())
}

#[test]
fn test_reader_outlives_writer() -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let writer = IndexWriter::open(Arc::clone(&storage), config())?;
    writer.add_document(&doc("a", 1))?;
    let reader = writer.reader()?;
    writer.close()?;

    assert_eq!(reader.num_docs(), 1);
    assert_eq!(reader.numeric_value("val", 0), Some(1));
    assert!(!reader.is_current()?);
    reader.close()?;
    assert!(reader.close().is_err());
    Ok(())
}
