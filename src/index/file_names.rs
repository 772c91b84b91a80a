//! Index file naming.
//!
//! ```text
//! segments_N            catalog of commit generation N (N in base 36)
//! pending_segments_N    prepared, not yet committed catalog
//! _S.si                 segment info
//! _S.pst / .fdt / .dvd  postings, stored fields, base doc values
//! _S_G.liv              live docs, generation G
//! _S_G.dvu              doc-values updates, generation G
//! write.lock            writer lock
//! ```

use lazy_static::lazy_static;
use regex::Regex;

pub const SEGMENTS: &str = "segments";
pub const PENDING_SEGMENTS: &str = "pending_segments";
pub const WRITE_LOCK_NAME: &str = "write.lock";

pub const SEGMENT_INFO_EXTENSION: &str = "si";
pub const POSTINGS_EXTENSION: &str = "pst";
pub const STORED_FIELDS_EXTENSION: &str = "fdt";
pub const DOC_VALUES_EXTENSION: &str = "dvd";
pub const LIVE_DOCS_EXTENSION: &str = "liv";
pub const DOC_VALUES_UPDATE_EXTENSION: &str = "dvu";

lazy_static! {
    static ref SEGMENT_FILE: Regex =
        Regex::new(r"^(_[a-z0-9]+)(?:_([a-z0-9]+))?\.([a-z]+)$").expect("segment file pattern");
    static ref CATALOG_FILE: Regex =
        Regex::new(r"^(segments|pending_segments)_([a-z0-9]+)$").expect("catalog file pattern");
}

/// Encode a number in lowercase base 36.
pub fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Decode a lowercase base-36 number.
pub fn from_base36(text: &str) -> Option<u64> {
    u64::from_str_radix(text, 36).ok()
}

/// `segments_N` for commit generation `generation`.
pub fn segments_file_name(generation: u64) -> String {
    format!("{SEGMENTS}_{}", to_base36(generation))
}

/// `pending_segments_N` for commit generation `generation`.
pub fn pending_segments_file_name(generation: u64) -> String {
    format!("{PENDING_SEGMENTS}_{}", to_base36(generation))
}

/// `_S` for segment counter value `counter`.
pub fn segment_name(counter: u64) -> String {
    format!("_{}", to_base36(counter))
}

/// `_S.ext`.
pub fn segment_file_name(segment: &str, extension: &str) -> String {
    format!("{segment}.{extension}")
}

/// `_S_G.ext`.
pub fn generation_file_name(segment: &str, generation: u64, extension: &str) -> String {
    format!("{segment}_{}.{extension}", to_base36(generation))
}

/// Generation of a `segments_N` file.
pub fn commit_generation(file_name: &str) -> Option<u64> {
    let caps = CATALOG_FILE.captures(file_name)?;
    if &caps[1] != SEGMENTS {
        return None;
    }
    from_base36(&caps[2])
}

/// True for `pending_segments_N`.
pub fn is_pending_catalog(file_name: &str) -> bool {
    CATALOG_FILE
        .captures(file_name)
        .is_some_and(|caps| &caps[1] == PENDING_SEGMENTS)
}

/// Segment name of a per-segment file.
pub fn parse_segment_name(file_name: &str) -> Option<&str> {
    SEGMENT_FILE
        .captures(file_name)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Overlay generation of a per-segment file, if it has one.
pub fn parse_generation(file_name: &str) -> Option<u64> {
    SEGMENT_FILE
        .captures(file_name)
        .and_then(|caps| caps.get(2))
        .and_then(|m| from_base36(m.as_str()))
}

/// True for any file this engine writes, except the lock.
pub fn is_index_file(file_name: &str) -> bool {
    SEGMENT_FILE.is_match(file_name) || CATALOG_FILE.is_match(file_name)
}

/// Newest `segments_N` generation among `files`.
pub fn last_commit_generation<S: AsRef<str>>(files: &[S]) -> Option<u64> {
    files.iter().filter_map(|f| commit_generation(f.as_ref())).max()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base36() {
        for value in [0u64, 1, 35, 36, 1295, 1296, u64::MAX] {
            assert_eq!(from_base36(&to_base36(value)), Some(value));
        }
        assert_eq!(to_base36(36), "10");
        assert_eq!(segments_file_name(10), "segments_a");
    }

    #[test]
    fn test_parse_names() {
        assert_eq!(commit_generation("segments_a"), Some(10));
        assert_eq!(commit_generation("pending_segments_a"), None);
        assert!(is_pending_catalog("pending_segments_2"));
        assert_eq!(commit_generation("segments"), None);

        assert_eq!(parse_segment_name("_1z.si"), Some("_1z"));
        assert_eq!(parse_segment_name("_1z_3.liv"), Some("_1z"));
        assert_eq!(parse_generation("_1z_3.liv"), Some(3));
        assert_eq!(parse_generation("_1z.pst"), None);
        assert_eq!(generation_file_name("_4", 11, LIVE_DOCS_EXTENSION), "_4_b.liv");

        assert!(is_index_file("_0.dvd"));
        assert!(is_index_file("segments_1"));
        assert!(!is_index_file(WRITE_LOCK_NAME));
        assert!(!is_index_file("notes.txt"));
    }

    #[test]
    fn test_last_commit_generation() {
        let files = ["_0.si", "segments_2", "segments_a", "pending_segments_z"];
        assert_eq!(last_commit_generation(&files), Some(10));
        assert_eq!(last_commit_generation::<&str>(&[]), None);
    }
}
