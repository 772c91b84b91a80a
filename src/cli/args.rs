//! Command line argument parsing for the halberd CLI using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::index::term::Term;

/// Halberd - a segment-based index engine with in-place doc-values updates
#[derive(Parser, Debug, Clone)]
#[command(name = "halberd")]
#[command(about = "Inspect and maintain halberd indexes")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_about = None)]
pub struct HalberdArgs {
    /// Verbosity level (repeat for more detail)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (overrides verbose)
    #[arg(short, long)]
    pub quiet: bool,

    /// Output format
    #[arg(short = 'f', long = "format", default_value = "human")]
    pub output_format: OutputFormat,

    /// Pretty-print JSON output
    #[arg(long)]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl HalberdArgs {
    /// Effective verbosity: 0 when quiet, at least 1 otherwise.
    pub fn verbosity(&self) -> u8 {
        if self.quiet {
            0
        } else {
            match self.verbose {
                0 => 1,
                n => n,
            }
        }
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Show the segments of the latest commit
    Info(IndexPathArgs),

    /// List every commit kept in the index directory
    Commits(IndexPathArgs),

    /// Verify every file of the latest commit
    Check(IndexPathArgs),

    /// Add documents from a JSON-lines file
    Index(IndexArgs),

    /// Delete documents matching terms
    Delete(DeleteArgs),

    /// Set or clear a numeric doc value on matching documents
    #[command(name = "update-numeric")]
    UpdateNumeric(UpdateNumericArgs),

    /// Merge segments down to a maximum count
    #[command(name = "force-merge")]
    ForceMerge(ForceMergeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct IndexPathArgs {
    /// Index directory
    #[arg(env = "HALBERD_INDEX")]
    pub index_path: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct IndexArgs {
    /// Index directory
    #[arg(env = "HALBERD_INDEX")]
    pub index_path: PathBuf,

    /// JSON-lines file with one document object per line
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,

    /// String fields to analyze as text instead of indexing as keywords
    #[arg(short = 't', long = "text-field", value_delimiter = ',')]
    pub text_fields: Vec<String>,

    /// Replace documents whose value of this keyword field matches
    #[arg(long = "id-field")]
    pub id_field: Option<String>,

    /// Discard any existing commit and start an empty index
    #[arg(long)]
    pub create: bool,

    /// Flush a segment after this many buffered documents
    #[arg(long)]
    pub max_buffered_docs: Option<usize>,

    /// RAM buffer size in MB before flushing
    #[arg(long)]
    pub ram_buffer_mb: Option<f64>,

    /// Leave the changes uncommitted (they are rolled back)
    #[arg(long)]
    pub no_commit: bool,
}

#[derive(Args, Debug, Clone)]
pub struct DeleteArgs {
    /// Index directory
    #[arg(env = "HALBERD_INDEX")]
    pub index_path: PathBuf,

    /// Terms as field:value; documents matching any of them are deleted
    #[arg(required = true, value_parser = parse_term)]
    pub terms: Vec<Term>,
}

#[derive(Args, Debug, Clone)]
pub struct UpdateNumericArgs {
    /// Index directory
    #[arg(env = "HALBERD_INDEX")]
    pub index_path: PathBuf,

    /// Term selecting the documents, as field:value
    #[arg(value_parser = parse_term)]
    pub term: Term,

    /// Numeric doc-values field to update
    pub field: String,

    /// New value
    #[arg(allow_negative_numbers = true, required_unless_present = "clear", conflicts_with = "clear")]
    pub value: Option<i64>,

    /// Clear the value instead of setting one
    #[arg(long)]
    pub clear: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ForceMergeArgs {
    /// Index directory
    #[arg(env = "HALBERD_INDEX")]
    pub index_path: PathBuf,

    /// Maximum number of segments to leave
    #[arg(short = 'm', long, default_value = "1")]
    pub max_segments: usize,

    /// Only reclaim segments with deletions
    #[arg(long)]
    pub deletes_only: bool,
}

/// Output format options
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output
    Json,
}

fn parse_term(s: &str) -> Result<Term, String> {
    Term::parse(s).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity() {
        let args = HalberdArgs::try_parse_from(["halberd", "info", "/tmp/idx"]).unwrap();
        assert_eq!(args.verbosity(), 1);

        let args = HalberdArgs::try_parse_from(["halberd", "-vvv", "info", "/tmp/idx"]).unwrap();
        assert_eq!(args.verbosity(), 3);

        let args = HalberdArgs::try_parse_from(["halberd", "-q", "-vv", "info", "/tmp/idx"]).unwrap();
        assert_eq!(args.verbosity(), 0);
    }

    #[test]
    fn test_index_args() {
        let args = HalberdArgs::try_parse_from([
            "halberd",
            "--format",
            "json",
            "index",
            "/tmp/idx",
            "-i",
            "docs.jsonl",
            "-t",
            "title,body",
            "--id-field",
            "id",
            "--max-buffered-docs",
            "100",
        ])
        .unwrap();
        assert_eq!(args.output_format, OutputFormat::Json);
        match args.command {
            Command::Index(index) => {
                assert_eq!(index.text_fields, vec!["title", "body"]);
                assert_eq!(index.id_field.as_deref(), Some("id"));
                assert_eq!(index.max_buffered_docs, Some(100));
                assert!(!index.create);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_terms_need_a_field() {
        let args = HalberdArgs::try_parse_from(["halberd", "delete", "/tmp/idx", "id:a", "id:b:c"]).unwrap();
        match args.command {
            Command::Delete(delete) => assert_eq!(delete.terms, vec![Term::new("id", "a"), Term::new("id", "b:c")]),
            other => panic!("unexpected command {other:?}"),
        }
        assert!(HalberdArgs::try_parse_from(["halberd", "delete", "/tmp/idx", "novalue"]).is_err());
        assert!(HalberdArgs::try_parse_from(["halberd", "delete", "/tmp/idx", ":x"]).is_err());
    }

    #[test]
    fn test_update_numeric_value_or_clear() {
        let args =
            HalberdArgs::try_parse_from(["halberd", "update-numeric", "/tmp/idx", "id:a", "price", "-5"]).unwrap();
        match args.command {
            Command::UpdateNumeric(update) => {
                assert_eq!(update.value, Some(-5));
                assert!(!update.clear);
            }
            other => panic!("unexpected command {other:?}"),
        }

        let args =
            HalberdArgs::try_parse_from(["halberd", "update-numeric", "/tmp/idx", "id:a", "price", "--clear"]).unwrap();
        assert!(matches!(args.command, Command::UpdateNumeric(UpdateNumericArgs { clear: true, value: None, .. })));

        assert!(HalberdArgs::try_parse_from(["halberd", "update-numeric", "/tmp/idx", "id:a", "price"]).is_err());
    }

    #[test]
    fn test_force_merge_default() {
        let args = HalberdArgs::try_parse_from(["halberd", "force-merge", "/tmp/idx"]).unwrap();
        match args.command {
            Command::ForceMerge(merge) => {
                assert_eq!(merge.max_segments, 1);
                assert!(!merge.deletes_only);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
