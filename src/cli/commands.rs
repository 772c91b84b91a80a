//! Command implementations for the halberd CLI.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use serde_json::Value;

use crate::cli::args::*;
use crate::cli::output::*;
use crate::document::{Document, Field, FieldValue};
use crate::error::{HalberdError, Result};
use crate::index::check::{check_index, CheckIndexReport};
use crate::index::codec::CodecRegistry;
use crate::index::config::{IndexWriterConfig, OpenMode};
use crate::index::file_deleter::list_commits;
use crate::index::segment_infos::SegmentInfos;
use crate::index::term::Term;
use crate::index::writer::IndexWriter;
use crate::storage::file::FileStorageConfig;
use crate::storage::{Storage, StorageConfig, StorageFactory};

/// Execute a CLI command.
pub fn execute_command(args: HalberdArgs) -> Result<()> {
    match &args.command {
        Command::Info(path_args) => {
            let result = show_info(path_args)?;
            output_result("Index information", &result, &args)
        }
        Command::Commits(path_args) => {
            let result = show_commits(path_args)?;
            output_result("Commits", &result, &args)
        }
        Command::Check(path_args) => {
            let report = run_check(path_args)?;
            output_result("Index check", &report, &args)?;
            if report.clean {
                Ok(())
            } else {
                Err(HalberdError::corruption(
                    path_args.index_path.display().to_string(),
                    "index check found problems",
                ))
            }
        }
        Command::Index(index_args) => {
            let result = index_documents(index_args)?;
            output_result("Documents indexed", &result, &args)
        }
        Command::Delete(delete_args) => {
            let result = delete_documents(delete_args)?;
            output_result("Documents deleted", &result, &args)
        }
        Command::UpdateNumeric(update_args) => {
            let result = update_numeric(update_args)?;
            output_result("Doc values updated", &result, &args)
        }
        Command::ForceMerge(merge_args) => {
            let result = force_merge(merge_args)?;
            output_result("Segments merged", &result, &args)
        }
    }
}

/// File storage rooted at `path`. Read-only commands require the
/// directory to exist instead of creating it.
fn open_storage(path: &Path, must_exist: bool) -> Result<Arc<dyn Storage>> {
    if must_exist && !path.is_dir() {
        return Err(HalberdError::IndexNotFound(path.display().to_string()));
    }
    StorageFactory::create(StorageConfig::File(FileStorageConfig::new(path)))
}

fn path_string(path: &Path) -> String {
    path.display().to_string()
}

/// Describe the latest commit.
pub fn show_info(args: &IndexPathArgs) -> Result<IndexInfo> {
    let storage = open_storage(&args.index_path, true)?;
    let infos = SegmentInfos::read_latest(storage.as_ref())?;
    let segments: Vec<SegmentSummary> = infos
        .segments()
        .iter()
        .map(|segment| SegmentSummary {
            name: segment.name().to_string(),
            codec: format!("{}/{}", segment.info.codec_name, segment.info.codec_version),
            max_doc: segment.max_doc(),
            num_docs: segment.num_live(),
            del_gen: segment.del_gen(),
            dv_gen: segment.dv_gen(),
            size_in_bytes: segment.info.size_in_bytes,
        })
        .collect();
    Ok(IndexInfo {
        path: path_string(&args.index_path),
        generation: infos.generation(),
        segments_file: infos.segments_file_name(),
        version: infos.version(),
        num_docs: segments.iter().map(|s| u64::from(s.num_docs)).sum(),
        max_doc: infos.total_max_doc(),
        user_data: infos.user_data().clone(),
        segments,
    })
}

/// List the commits kept in the directory, oldest first.
pub fn show_commits(args: &IndexPathArgs) -> Result<CommitList> {
    let storage = open_storage(&args.index_path, true)?;
    let commits = list_commits(storage.as_ref())?
        .into_iter()
        .map(|commit| CommitSummary {
            generation: commit.generation,
            segments_file: commit.segments_file,
            segments: commit.segments,
            file_count: commit.files.len(),
            user_data: commit.user_data,
        })
        .collect();
    Ok(CommitList {
        path: path_string(&args.index_path),
        commits,
    })
}

pub fn run_check(args: &IndexPathArgs) -> Result<CheckIndexReport> {
    let storage = open_storage(&args.index_path, true)?;
    check_index(storage.as_ref(), &CodecRegistry::default())
}

/// Add every document of a JSON-lines file, then commit.
pub fn index_documents(args: &IndexArgs) -> Result<IndexingResult> {
    let start = Instant::now();
    let file = File::open(&args.input)?;
    let storage = open_storage(&args.index_path, false)?;

    let mut config = IndexWriterConfig::default()
        .with_open_mode(if args.create {
            OpenMode::Create
        } else {
            OpenMode::CreateOrAppend
        })
        .with_commit_on_close(!args.no_commit);
    if args.max_buffered_docs.is_some() {
        config = config.with_max_buffered_docs(args.max_buffered_docs);
    }
    if args.ram_buffer_mb.is_some() {
        config = config.with_ram_buffer_size_mb(args.ram_buffer_mb);
    }
    let writer = IndexWriter::open(storage, config)?;

    let mut indexed = 0;
    let mut failed = 0;
    for (line_number, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed = serde_json::from_str::<Value>(&line)
            .map_err(HalberdError::from)
            .and_then(|value| document_from_json(&value, &args.text_fields, args.id_field.as_deref()));
        let (doc, id) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("skipping line {}: {e}", line_number + 1);
                failed += 1;
                continue;
            }
        };
        let added = match id {
            Some(term) => writer.update_document(term, &doc),
            None => writer.add_document(&doc),
        };
        match added {
            Ok(_) => indexed += 1,
            Err(e) if e.is_per_document() => {
                warn!("document on line {} rejected: {e}", line_number + 1);
                failed += 1;
            }
            Err(e) => {
                if let Err(rollback) = writer.rollback() {
                    warn!("rollback after failed indexing: {rollback}");
                }
                return Err(e);
            }
        }
    }
    debug!("read {indexed} documents, {failed} failed");

    let generation = if args.no_commit {
        None
    } else {
        writer.commit()?;
        writer.stats().last_commit_generation
    };
    let segment_count = writer.segment_count();
    writer.close()?;
    info!("indexed {indexed} documents into {}", args.index_path.display());

    Ok(IndexingResult {
        path: path_string(&args.index_path),
        documents_indexed: indexed,
        documents_failed: failed,
        committed: !args.no_commit,
        generation,
        segment_count,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

/// Turn one JSON object into a document, and the term identifying it when
/// `id_field` is set.
///
/// Strings become keywords unless listed in `text_fields`; integers become
/// numeric doc values; booleans become keywords; floats are stored only.
pub fn document_from_json(
    value: &Value,
    text_fields: &[String],
    id_field: Option<&str>,
) -> Result<(Document, Option<Term>)> {
    let object = value
        .as_object()
        .ok_or_else(|| HalberdError::invalid_argument("document must be a JSON object"))?;
    let mut builder = Document::builder();
    let mut id = None;
    for (name, field_value) in object {
        if Some(name.as_str()) == id_field {
            let text = field_value
                .as_str()
                .ok_or_else(|| HalberdError::invalid_argument(format!("id field {name} must be a string")))?;
            builder = builder.add_keyword(name.as_str(), text);
            id = Some(Term::new(name.as_str(), text));
            continue;
        }
        let values: Vec<&Value> = match field_value {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        for value in values {
            builder = builder.add_field(json_field(name, value, text_fields)?);
        }
    }
    if let Some(field) = id_field {
        if id.is_none() {
            return Err(HalberdError::invalid_argument(format!("document has no {field} field")));
        }
    }
    Ok((builder.build(), id))
}

fn json_field(name: &str, value: &Value, text_fields: &[String]) -> Result<Field> {
    match value {
        Value::String(s) if text_fields.iter().any(|f| f == name) => Ok(Field::text(name, s.as_str())),
        Value::String(s) => Ok(Field::keyword(name, s.as_str())),
        Value::Bool(b) => Ok(Field::keyword(name, b.to_string())),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(Field::numeric_doc_values(name, i)),
            None => Ok(Field::stored(name, FieldValue::Text(n.to_string()))),
        },
        Value::Null | Value::Array(_) | Value::Object(_) => Err(HalberdError::invalid_argument(format!(
            "field {name} has an unsupported value {value}"
        ))),
    }
}

/// Live documents that match any of `terms` on the writer's current view.
fn count_matches(writer: &IndexWriter, terms: &[Term]) -> Result<usize> {
    let reader = writer.reader()?;
    let docs: BTreeSet<u32> = terms.iter().flat_map(|t| reader.term_docs(t)).collect();
    reader.close()?;
    Ok(docs.len())
}

fn open_writer(path: &Path) -> Result<IndexWriter> {
    let storage = open_storage(path, true)?;
    IndexWriter::open(storage, IndexWriterConfig::default().with_open_mode(OpenMode::Append))
}

fn finish(writer: IndexWriter, path: &Path, matched: usize, sequence_number: u64) -> Result<MutationResult> {
    writer.commit()?;
    let result = MutationResult {
        path: path_string(path),
        matched_documents: matched,
        sequence_number,
        generation: writer.stats().last_commit_generation,
        num_docs: writer.num_docs(),
    };
    writer.close()?;
    Ok(result)
}

pub fn delete_documents(args: &DeleteArgs) -> Result<MutationResult> {
    let writer = open_writer(&args.index_path)?;
    let matched = count_matches(&writer, &args.terms)?;
    let seq = writer.delete_documents(args.terms.clone())?;
    finish(writer, &args.index_path, matched, seq)
}

pub fn update_numeric(args: &UpdateNumericArgs) -> Result<MutationResult> {
    let writer = open_writer(&args.index_path)?;
    let matched = count_matches(&writer, std::slice::from_ref(&args.term))?;
    let value = if args.clear { None } else { args.value };
    let seq = writer.update_numeric_value(args.term.clone(), &args.field, value)?;
    finish(writer, &args.index_path, matched, seq)
}

pub fn force_merge(args: &ForceMergeArgs) -> Result<MergeResult> {
    let start = Instant::now();
    let writer = open_writer(&args.index_path)?;
    let segments_before = writer.segment_count();
    let max_doc_before = writer.max_doc();
    if args.deletes_only {
        writer.force_merge_deletes()?;
    } else {
        writer.force_merge(args.max_segments)?;
    }
    writer.commit()?;
    let result = MergeResult {
        path: path_string(&args.index_path),
        segments_before,
        segments_after: writer.segment_count(),
        max_doc_before,
        max_doc_after: writer.max_doc(),
        generation: writer.stats().last_commit_generation,
        duration_ms: start.elapsed().as_millis() as u64,
    };
    writer.close()?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_jsonl(dir: &TempDir, lines: &[&str]) -> std::path::PathBuf {
        let path = dir.path().join("docs.jsonl");
        let mut file = File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        path
    }

    fn index_args(index_path: &Path, input: std::path::PathBuf) -> IndexArgs {
        IndexArgs {
            index_path: index_path.to_path_buf(),
            input,
            text_fields: vec!["title".to_string()],
            id_field: Some("id".to_string()),
            create: false,
            max_buffered_docs: Some(2),
            ram_buffer_mb: None,
            no_commit: false,
        }
    }

    #[test]
    fn test_document_from_json() {
        let value = json!({"id": "a", "title": "Hello World", "tag": "x", "price": 10, "ok": true});
        let (doc, id) = document_from_json(&value, &["title".to_string()], Some("id")).unwrap();
        assert_eq!(id, Some(Term::new("id", "a")));
        assert_eq!(doc.len(), 5);
        assert_eq!(doc.get_field("title").unwrap().value, FieldValue::Text("Hello World".to_string()));
        assert_eq!(doc.get_field("price").unwrap().value, FieldValue::Integer(10));

        assert!(document_from_json(&json!(["not", "an", "object"]), &[], None).is_err());
        assert!(document_from_json(&json!({"title": "no id"}), &[], Some("id")).is_err());
        assert!(document_from_json(&json!({"nested": {"a": 1}}), &[], None).is_err());
    }

    #[test]
    fn test_index_delete_update_merge() {
        let dir = TempDir::new().unwrap();
        let index_path = dir.path().join("index");
        let input = write_jsonl(
            &dir,
            &[
                r#"{"id": "a", "title": "first", "price": 1}"#,
                r#"{"id": "b", "title": "second", "price": 2}"#,
                "not json",
                r#"{"id": "c", "title": "third", "price": 3}"#,
                r#"{"id": "a", "title": "first again", "price": 4}"#,
            ],
        );

        let indexed = index_documents(&index_args(&index_path, input)).unwrap();
        assert_eq!(indexed.documents_indexed, 4);
        assert_eq!(indexed.documents_failed, 1);
        assert!(indexed.generation.is_some());

        let path_args = IndexPathArgs {
            index_path: index_path.clone(),
        };
        let info = show_info(&path_args).unwrap();
        assert_eq!(info.num_docs, 3);

        let deleted = delete_documents(&DeleteArgs {
            index_path: index_path.clone(),
            terms: vec![Term::new("id", "b"), Term::new("id", "missing")],
        })
        .unwrap();
        assert_eq!(deleted.matched_documents, 1);
        assert_eq!(deleted.num_docs, 2);

        let updated = update_numeric(&UpdateNumericArgs {
            index_path: index_path.clone(),
            term: Term::new("id", "c"),
            field: "price".to_string(),
            value: Some(30),
            clear: false,
        })
        .unwrap();
        assert_eq!(updated.matched_documents, 1);

        let merged = force_merge(&ForceMergeArgs {
            index_path: index_path.clone(),
            max_segments: 1,
            deletes_only: false,
        })
        .unwrap();
        assert_eq!(merged.segments_after, 1);
        assert_eq!(merged.max_doc_after, 2);

        assert!(run_check(&path_args).unwrap().clean);
        let commits = show_commits(&path_args).unwrap();
        assert_eq!(commits.commits.last().map(|c| c.generation), merged.generation);
    }

    #[test]
    fn test_missing_index_is_not_created() {
        let dir = TempDir::new().unwrap();
        let index_path = dir.path().join("absent");
        let err = show_info(&IndexPathArgs {
            index_path: index_path.clone(),
        })
        .unwrap_err();
        assert!(matches!(err, HalberdError::IndexNotFound(_)));
        assert!(!index_path.exists());
    }
}
