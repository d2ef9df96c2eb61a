//! Split annotation files.
//!
//! Each split (`train.csv`, `val.csv`, `test.csv`) lists one video per line
//! as `<relative path><separator><integer label>`.

use std::fs;
use std::path::{Path, PathBuf};

use action_core::{DataSplit, Error, Result};
use tracing::debug;

/// One annotated video
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoRecord {
    /// Directory of extracted frames
    pub path: PathBuf,
    pub label: usize,
}

/// Location of the annotation file for `split` under `data_dir`.
pub fn split_file_path(data_dir: &Path, split: DataSplit) -> PathBuf {
    data_dir.join(format!("{}.csv", split.file_stem()))
}

/// Parse split-file contents. `source` only names the file in error messages.
pub fn parse_split(content: &str, source: &str, prefix: &Path, separator: &str) -> Result<Vec<VideoRecord>> {
    let mut records = Vec::new();

    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let split = if separator.trim().is_empty() {
            line.rsplit_once(char::is_whitespace)
        } else {
            line.rsplit_once(separator)
        };
        let (path, label) = split.ok_or_else(|| {
            Error::Dataset(format!("{source}:{}: expected '<path>{separator}<label>'", line_no + 1))
        })?;
        let label = label.trim().parse::<usize>().map_err(|e| {
            Error::Dataset(format!("{source}:{}: invalid label '{}': {e}", line_no + 1, label.trim()))
        })?;

        records.push(VideoRecord {
            path: prefix.join(path.trim()),
            label,
        });
    }

    Ok(records)
}

/// Read the annotation file of `split`, joining every path under `prefix`.
pub fn read_split(data_dir: &Path, split: DataSplit, prefix: &Path, separator: &str) -> Result<Vec<VideoRecord>> {
    let path = split_file_path(data_dir, split);
    let content = fs::read_to_string(&path).map_err(|e| {
        Error::NotFound(format!("split file {} could not be read: {e}", path.display()))
    })?;
    let records = parse_split(&content, &path.display().to_string(), prefix, separator)?;
    if records.is_empty() {
        return Err(Error::Dataset(format!("split file {} lists no videos", path.display())));
    }
    debug!("Read {} videos from {}", records.len(), path.display());
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_space_separated() {
        let content = "ApplyEyeMakeup/v_01 0\n\nBasketball/v_02   7\n";
        let records = parse_split(content, "train.csv", Path::new("/videos"), " ").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].path, PathBuf::from("/videos/ApplyEyeMakeup/v_01"));
        assert_eq!(records[1].label, 7);
    }

    #[test]
    fn test_parse_comma_separated_path_with_spaces() {
        let content = "abseiling/clip one,3\n";
        let records = parse_split(content, "val.csv", Path::new(""), ",").unwrap();
        assert_eq!(records[0].path, PathBuf::from("abseiling/clip one"));
        assert_eq!(records[0].label, 3);
    }

    #[test]
    fn test_malformed_line_names_location() {
        let err = parse_split("a 1\nbroken\n", "val.csv", Path::new(""), " ").unwrap_err();
        assert!(err.to_string().contains("val.csv:2"));

        let err = parse_split("a x\n", "val.csv", Path::new(""), " ").unwrap_err();
        assert!(matches!(err, Error::Dataset(_)));
    }

    #[test]
    fn test_read_split_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = read_split(dir.path(), DataSplit::Train, Path::new(""), " ");
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_read_split_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("val.csv"), "v0 1\nv1 0\n").unwrap();
        let records = read_split(dir.path(), DataSplit::Val, Path::new("root"), " ").unwrap();
        assert_eq!(records[1].path, PathBuf::from("root/v1"));
    }
}
