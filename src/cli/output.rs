//! Output formatting for the halberd CLI.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cli::args::{HalberdArgs, OutputFormat};
use crate::error::Result;

/// One segment of a commit.
#[derive(Debug, Serialize, Deserialize)]
pub struct SegmentSummary {
    pub name: String,
    pub codec: String,
    pub max_doc: u32,
    pub num_docs: u32,
    pub del_gen: Option<u64>,
    pub dv_gen: Option<u64>,
    pub size_in_bytes: u64,
}

/// Result of the `info` command.
#[derive(Debug, Serialize, Deserialize)]
pub struct IndexInfo {
    pub path: String,
    pub generation: Option<u64>,
    pub segments_file: Option<String>,
    pub version: u64,
    pub num_docs: u64,
    pub max_doc: u64,
    pub user_data: BTreeMap<String, String>,
    pub segments: Vec<SegmentSummary>,
}

/// One commit listed by the `commits` command.
#[derive(Debug, Serialize, Deserialize)]
pub struct CommitSummary {
    pub generation: u64,
    pub segments_file: String,
    pub segments: Vec<String>,
    pub file_count: usize,
    pub user_data: BTreeMap<String, String>,
}

/// Result of the `commits` command.
#[derive(Debug, Serialize, Deserialize)]
pub struct CommitList {
    pub path: String,
    pub commits: Vec<CommitSummary>,
}

/// Result of the `index` command.
#[derive(Debug, Serialize, Deserialize)]
pub struct IndexingResult {
    pub path: String,
    pub documents_indexed: usize,
    pub documents_failed: usize,
    pub committed: bool,
    pub generation: Option<u64>,
    pub segment_count: usize,
    pub duration_ms: u64,
}

/// Result of the `delete` and `update-numeric` commands.
#[derive(Debug, Serialize, Deserialize)]
pub struct MutationResult {
    pub path: String,
    /// Live documents matching the terms before the change.
    pub matched_documents: usize,
    pub sequence_number: u64,
    pub generation: Option<u64>,
    pub num_docs: u64,
}

/// Result of the `force-merge` command.
#[derive(Debug, Serialize, Deserialize)]
pub struct MergeResult {
    pub path: String,
    pub segments_before: usize,
    pub segments_after: usize,
    pub max_doc_before: u64,
    pub max_doc_after: u64,
    pub generation: Option<u64>,
    pub duration_ms: u64,
}

/// Output a result in the specified format.
pub fn output_result<T: Serialize>(message: &str, result: &T, args: &HalberdArgs) -> Result<()> {
    match args.output_format {
        OutputFormat::Human => output_human(message, result, args),
        OutputFormat::Json => output_json(result, args),
    }
}

/// Output in human-readable format.
fn output_human<T: Serialize>(message: &str, result: &T, args: &HalberdArgs) -> Result<()> {
    if args.verbosity() > 0 {
        println!("{message}");
        println!("{}", "═".repeat(message.chars().count()));
    }
    let value = serde_json::to_value(result)?;
    for line in human_lines(&value) {
        println!("{line}");
    }
    Ok(())
}

/// Render a JSON value as indented `key: value` lines. Arrays of objects
/// become numbered sections.
fn human_lines(value: &serde_json::Value) -> Vec<String> {
    let mut lines = Vec::new();
    render(value, 0, &mut lines);
    lines
}

fn render(value: &serde_json::Value, depth: usize, lines: &mut Vec<String>) {
    let indent = "  ".repeat(depth);
    match value {
        serde_json::Value::Object(obj) => {
            for (key, val) in obj {
                match val {
                    serde_json::Value::Array(items) if items.iter().any(|i| i.is_object()) => {
                        lines.push(format!("{indent}{key}:"));
                        for (i, item) in items.iter().enumerate() {
                            lines.push(format!("{indent}  [{i}]"));
                            render(item, depth + 2, lines);
                        }
                    }
                    serde_json::Value::Object(inner) if !inner.is_empty() => {
                        lines.push(format!("{indent}{key}:"));
                        render(val, depth + 1, lines);
                    }
                    _ => lines.push(format!("{indent}{key}: {}", format_field(key, val))),
                }
            }
        }
        _ => lines.push(format!("{indent}{}", format_value(value))),
    }
}

fn format_field(key: &str, value: &serde_json::Value) -> String {
    match value.as_u64() {
        Some(bytes) if key.ends_with("bytes") => format_bytes(bytes),
        _ => format_value(value),
    }
}

/// Output in JSON format.
fn output_json<T: Serialize>(result: &T, args: &HalberdArgs) -> Result<()> {
    let json = if args.pretty {
        serde_json::to_string_pretty(result)?
    } else {
        serde_json::to_string(result)?
    };
    println!("{json}");
    Ok(())
}

/// Format a JSON value for display.
fn format_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Array(arr) => {
            let formatted_values = arr.iter().map(format_value).collect::<Vec<_>>().join(", ");
            format!("[{formatted_values}]")
        }
        serde_json::Value::Object(obj) if obj.is_empty() => "{}".to_string(),
        serde_json::Value::Object(_) => "[object]".to_string(),
        serde_json::Value::Null => "-".to_string(),
    }
}

/// Format a byte count with a binary unit.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    let unit = UNITS[unit_index];
    if unit_index == 0 {
        format!("{bytes} {unit}")
    } else {
        format!("{size:.1} {unit}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.0 KB");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(1048576), "1.0 MB");
        assert_eq!(format_bytes(1073741824), "1.0 GB");
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(&json!("test")), "test");
        assert_eq!(format_value(&json!(42)), "42");
        assert_eq!(format_value(&json!(false)), "false");
        assert_eq!(format_value(&json!(null)), "-");
        assert_eq!(format_value(&json!(["_0", "_1"])), "[_0, _1]");
    }

    #[test]
    fn test_human_lines_nest_sections() {
        let value = json!({
            "generation": 3,
            "segments": [{"name": "_0", "size_in_bytes": 2048}],
            "user_data": {},
        });
        assert_eq!(
            human_lines(&value),
            vec![
                "generation: 3",
                "segments:",
                "  [0]",
                "    name: _0",
                "    size_in_bytes: 2.0 KB",
                "user_data: {}",
            ]
        );
    }
}
