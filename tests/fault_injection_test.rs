use std::sync::Arc;

use halberd::document::Document;
use halberd::error::Result;
use halberd::index::{
    DirectoryReader, IndexWriter, IndexWriterConfig, KeepAllCommits, LiveDocsAccess, NoMergePolicy, OpenMode,
    SegmentInfos, SerialMergeScheduler, Term, list_commits,
};
use halberd::storage::Storage;
use halberd::storage::faulty::{FaultOp, FaultRule, FaultyStorage};
use halberd::storage::memory::MemoryStorage;

fn config() -> IndexWriterConfig {
    IndexWriterConfig::default()
        .with_merge_policy(Arc::new(NoMergePolicy))
        .with_merge_scheduler(Arc::new(SerialMergeScheduler::default()))
}

fn add_docs(writer: &IndexWriter, prefix: &str, count: usize) -> Result<()> {
    for i in 0..count {
        writer.add_document(&Document::builder().add_keyword("id", format!("{prefix}-{i}")).build())?;
    }
    Ok(())
}

/// Every index file in storage is referenced by the latest commit.
fn assert_no_garbage(storage: &dyn Storage) -> Result<()> {
    let infos = SegmentInfos::read_latest(storage)?;
    let referenced = infos.files(true);
    for file in storage.list_files()? {
        if file != "write.lock" {
            assert!(referenced.contains(&file), "unreferenced file {file} left behind");
        }
    }
    Ok(())
}

#[test]
fn test_crash_after_prepare_shows_previous_commit() -> Result<()> {
    let inner: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let faulty = Arc::new(FaultyStorage::new(Arc::clone(&inner)));

    let writer = IndexWriter::open(faulty.clone(), config())?;
    add_docs(&writer, "first", 3)?;
    writer.commit()?;
    add_docs(&writer, "second", 4)?;
    writer.prepare_commit()?;

    faulty.crash()?;
    drop(writer);
    faulty.restart();

    let reader = DirectoryReader::open(Arc::clone(&inner))?;
    assert_eq!(reader.num_docs(), 3);
    assert!(reader.term_docs(&Term::new("id", "second-0")).is_empty());
    reader.close()?;

    // a new writer cleans up what the crashed commit left behind
    let writer = IndexWriter::open(
        Arc::clone(&inner),
        config().with_open_mode(OpenMode::Append),
    )?;
    assert_eq!(writer.num_docs(), 3);
    writer.close()?;
    assert_no_garbage(inner.as_ref())?;
    Ok(())
}

#[test]
fn test_failed_publish_keeps_previous_commit_and_retry_succeeds() -> Result<()> {
    let inner: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let faulty = Arc::new(FaultyStorage::new(Arc::clone(&inner)));

    let writer = IndexWriter::open(faulty.clone(), config())?;
    add_docs(&writer, "first", 2)?;
    writer.commit()?;
    let generation = writer.stats().last_commit_generation;

    add_docs(&writer, "second", 2)?;
    faulty.add_rule(FaultRule::new(FaultOp::Rename).matching("^pending_segments_").times(1));
    assert!(writer.commit().is_err());
    assert_eq!(writer.stats().last_commit_generation, generation);

    let reader = DirectoryReader::open(Arc::clone(&inner))?;
    assert_eq!(reader.num_docs(), 2);
    reader.close()?;

    writer.commit()?;
    let reader = DirectoryReader::open(Arc::clone(&inner))?;
    assert_eq!(reader.num_docs(), 4);
    reader.close()?;
    writer.close()?;
    assert_eq!(faulty.injected_faults(), 1);
    Ok(())
}

#[test]
fn test_failed_segment_write_loses_nothing_committed() -> Result<()> {
    let inner: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let faulty = Arc::new(FaultyStorage::new(Arc::clone(&inner)));

    let writer = IndexWriter::open(faulty.clone(), config())?;
    add_docs(&writer, "first", 2)?;
    writer.commit()?;

    add_docs(&writer, "second", 2)?;
    faulty.add_rule(FaultRule::new(FaultOp::CreateOutput).matching(r"\.pst$").times(1));
    assert!(writer.commit().is_err());
    writer.rollback()?;

    let reader = DirectoryReader::open(Arc::clone(&inner))?;
    assert_eq!(reader.num_docs(), 2);
    reader.close()?;
    Ok(())
}

#[test]
fn test_corrupt_catalog_falls_back_to_previous_commit() -> Result<()> {
    let memory = Arc::new(MemoryStorage::new_default());
    let storage: Arc<dyn Storage> = memory.clone();
    let writer = IndexWriter::open(
        Arc::clone(&storage),
        config().with_deletion_policy(Arc::new(KeepAllCommits)),
    )?;
    add_docs(&writer, "first", 2)?;
    writer.commit()?;
    add_docs(&writer, "second", 2)?;
    writer.commit()?;
    writer.close()?;

    let commits = list_commits(storage.as_ref())?;
    assert_eq!(commits.len(), 2);
    let newest = &commits[1].segments_file;
    memory.replace_contents(newest, b"not a catalog".to_vec())?;

    let reader = DirectoryReader::open(Arc::clone(&storage))?;
    assert_eq!(reader.generation(), Some(commits[0].generation));
    assert_eq!(reader.num_docs(), 2);
    reader.close()?;
    Ok(())
}
