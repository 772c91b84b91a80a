use std::sync::Arc;

use halberd::document::Document;
use halberd::error::Result;
use halberd::index::{
    DirectoryReader, DocValuesAccess, IndexWriter, IndexWriterConfig, LiveDocsAccess, NoMergePolicy, Query,
    SerialMergeScheduler, Term,
};
use halberd::storage::Storage;
use halberd::storage::memory::MemoryStorage;

fn memory() -> Arc<dyn Storage> {
    Arc::new(MemoryStorage::new_default())
}

fn no_merges() -> IndexWriterConfig {
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
fn test_delete_by_query_leaves_other_docs_live() -> Result<()> {
    let storage = memory();
    let writer = IndexWriter::open(Arc::clone(&storage), no_merges())?;
    for val in 1..=3 {
        writer.add_document(&doc(&format!("doc-{val}"), val))?;
    }
    writer.delete_documents_by_query(vec![Query::NumericRange {
        field: "val".to_string(),
        lower: Some(2),
        upper: Some(2),
    }])?;
    writer.commit()?;

    let reader = DirectoryReader::open(Arc::clone(&storage))?;
    assert_eq!(reader.num_docs(), 2);
    assert_eq!(reader.max_doc(), 3);
    assert_eq!(reader.live_doc_ids(), vec![0, 2]);
    reader.close()?;
    writer.close()?;
    Ok(())
}

#[test]
fn test_delete_spans_flushed_segments() -> Result<()> {
    let storage = memory();
    let writer = IndexWriter::open(Arc::clone(&storage), no_merges().with_max_buffered_docs(Some(2)))?;
    for i in 0..6 {
        writer.add_document(&doc(if i % 2 == 0 { "even" } else { "odd" }, i))?;
    }
    writer.delete_documents(vec![Term::new("id", "even")])?;
    writer.commit()?;

    let reader = DirectoryReader::open(Arc::clone(&storage))?;
    assert!(reader.leaves().len() >= 3);
    assert_eq!(reader.num_docs(), 3);
    assert!(reader.term_docs(&Term::new("id", "even")).is_empty());
    reader.close()?;
    writer.close()?;
    Ok(())
}

#[test]
fn test_delete_only_applies_to_earlier_documents() -> Result<()> {
    let storage = memory();
    let writer = IndexWriter::open(Arc::clone(&storage), no_merges())?;
    writer.add_document(&doc("x", 1))?;
    writer.delete_documents(vec![Term::new("id", "x")])?;
    writer.add_document(&doc("x", 2))?;
    writer.commit()?;

    let reader = DirectoryReader::open(Arc::clone(&storage))?;
    let docs = reader.term_docs(&Term::new("id", "x"));
    assert_eq!(docs.len(), 1);
    assert_eq!(reader.numeric_value("val", docs[0]), Some(2));
    reader.close()?;
    writer.close()?;
    Ok(())
}

#[test]
fn test_delete_wins_over_earlier_update() -> Result<()> {
    let storage = memory();
    let writer = IndexWriter::open(Arc::clone(&storage), no_merges())?;
    writer.add_document(&doc("a", 1))?;
    writer.add_document(&doc("b", 2))?;
    writer.commit()?;

    writer.update_numeric_value(Term::new("id", "a"), "val", Some(10))?;
    writer.delete_documents(vec![Term::new("id", "a")])?;
    writer.commit()?;

    let reader = DirectoryReader::open(Arc::clone(&storage))?;
    assert_eq!(reader.num_docs(), 1);
    assert!(reader.term_docs(&Term::new("id", "a")).is_empty());
    reader.close()?;
    writer.close()?;
    Ok(())
}

#[test]
fn test_update_document_replaces() -> Result<()> {
    let storage = memory();
    let writer = IndexWriter::open(Arc::clone(&storage), no_merges())?;
    writer.add_document(&doc("a", 1))?;
    writer.commit()?;
    writer.update_document(Term::new("id", "a"), &doc("a", 5))?;
    writer.update_document(Term::new("id", "new"), &doc("new", 6))?;
    writer.commit()?;

    let reader = DirectoryReader::open(Arc::clone(&storage))?;
    assert_eq!(reader.num_docs(), 2);
    let a = reader.term_docs(&Term::new("id", "a"));
    assert_eq!(a.len(), 1);
    assert_eq!(reader.numeric_value("val", a[0]), Some(5));
    reader.close()?;
    writer.close()?;
    Ok(())
}

#[test]
fn test_unmatched_delete_changes_nothing() -> Result<()> {
    let storage = memory();
    let writer = IndexWriter::open(Arc::clone(&storage), no_merges())?;
    writer.add_document(&doc("a", 1))?;
    writer.commit()?;
    let generation = writer.stats().last_commit_generation;

    writer.delete_documents(vec![Term::new("id", "missing")])?;
    writer.commit()?;
    let reader = DirectoryReader::open(Arc::clone(&storage))?;
    assert_eq!(reader.num_docs(), 1);
    assert!(!reader.leaves()[0].commit_info().has_deletions());
    assert!(writer.stats().last_commit_generation >= generation);
    reader.close()?;
    writer.close()?;
    Ok(())
}

#[test]
fn test_delete_all() -> Result<()> {
    let storage = memory();
    let writer = IndexWriter::open(Arc::clone(&storage), no_merges().with_max_buffered_docs(Some(2)))?;
    for i in 0..5 {
        writer.add_document(&doc(&format!("doc-{i}"), i))?;
    }
    writer.commit()?;
    writer.add_document(&doc("buffered", 9))?;
    writer.delete_all()?;
    writer.add_document(&doc("after", 10))?;
    assert_eq!(writer.num_docs(), 1);
    writer.commit()?;

    let reader = DirectoryReader::open(Arc::clone(&storage))?;
    assert_eq!(reader.num_docs(), 1);
    assert_eq!(reader.term_docs(&Term::new("id", "after")).len(), 1);
    reader.close()?;
    writer.close()?;
    Ok(())
}

#[test]
fn test_delete_needs_terms() {
    let writer = IndexWriter::open(memory(), no_merges()).unwrap();
    assert!(writer.delete_documents(Vec::new()).is_err());
    assert!(writer.delete_documents_by_query(Vec::new()).is_err());
    writer.close().unwrap();
}
