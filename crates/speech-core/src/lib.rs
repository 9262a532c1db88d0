//! Tabular stores shared by the labeling pipeline.
//!
//! Entities are the upstream cleaned speeches, one per `(year, category)`.
//! Labels are the sparse per-task outputs keyed the same way. Both live on
//! disk as CSV and are rewritten atomically.

use anyhow::Result;
use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::Path;

mod entity;
mod labels;
mod merged;

pub use entity::{Entity, EntityKey, EntityStore, ENTITY_COLUMNS};
pub use labels::{find_unlabeled, LabelBatch, LabelStore, KEY_COLUMNS};
pub use merged::{merge_for_output, read_merged, write_merged, MergedRow, MergedTable};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("duplicate entity for key ({year}, {category}) in {path}")]
    DuplicateEntity {
        path: String,
        year: i32,
        category: String,
    },
    #[error("{path}: missing required column '{column}'")]
    MissingColumn { path: String, column: String },
    #[error("{path}: line {line}: invalid year '{value}'")]
    InvalidYear {
        path: String,
        line: u64,
        value: String,
    },
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Write `bytes` to `path` through a sibling temp file and a rename, so a
/// killed process never leaves a truncated store behind.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Trimmed single-line preview of a long text, for log lines.
pub fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut out: String = flat.chars().take(max_chars).collect();
    out.push_str("...");
    out
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_contents_and_leaves_no_temp_files() {
        let dir = testutil::temp_dir("atomic");
        let path = dir.join("labels.csv");
        atomic_write_bytes(&path, b"first").expect("write 1");
        atomic_write_bytes(&path, b"second").expect("write 2");
        assert_eq!(fs::read_to_string(&path).expect("read"), "second");
        let leftovers = fs::read_dir(&dir)
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .count();
        assert_eq!(leftovers, 0);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn preview_flattens_and_truncates() {
        assert_eq!(preview("a\n b   c", 10), "a b c");
        assert_eq!(preview("abcdefghijkl", 5), "abcde...");
    }
}
