//! Removes stale capture files before a run begins.
//!
//! Capture files from a prior run would be indistinguishable from this run's
//! output, so any failure to remove one is a fatal startup error rather than
//! something to skip over. The sweep runs whether or not capture is enabled
//! for the current run, matching the file pattern the [`crate::planner`]
//! assigns.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::planner::{CAPTURE_PREFIX, CAPTURE_SUFFIX};

/// Errors produced by [`clean`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error reading the capture directory
    #[error("Failed to read capture directory {path:?}: {source}")]
    ReadDir {
        /// Directory path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// Error reading a directory entry
    #[error("Failed to read directory entry in {dir:?}: {source}")]
    ReadDirEntry {
        /// Directory path
        dir: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// Error removing a stale capture file
    #[error("Failed to remove stale capture file {path:?}: {source}")]
    Remove {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
}

/// Whether `name` matches the capture-file pattern.
#[must_use]
pub fn is_capture_file(name: &str) -> bool {
    name.starts_with(CAPTURE_PREFIX) && name.ends_with(CAPTURE_SUFFIX)
}

/// Remove every stale capture file in `dir`
///
/// Returns the number of files removed. Idempotent: a second sweep with no
/// intervening run removes nothing and succeeds.
///
/// # Errors
///
/// Returns an error if the directory cannot be read or any matching file
/// cannot be removed.
pub fn clean(dir: &Path) -> Result<usize, Error> {
    let mut removed = 0;

    for entry in fs::read_dir(dir).map_err(|source| Error::ReadDir {
        path: dir.to_path_buf(),
        source: Box::new(source),
    })? {
        let entry = entry.map_err(|source| Error::ReadDirEntry {
            dir: dir.to_path_buf(),
            source: Box::new(source),
        })?;
        let path = entry.path();

        let matches = path.is_file()
            && path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(is_capture_file);
        if !matches {
            continue;
        }

        fs::remove_file(&path).map_err(|source| Error::Remove {
            path: path.clone(),
            source: Box::new(source),
        })?;
        debug!("removed stale capture file {}", path.display());
        removed += 1;
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicate_matches_the_capture_pattern() {
        assert!(is_capture_file("dump_0.txt"));
        assert!(is_capture_file("dump_17.txt"));

        assert!(!is_capture_file("dump_0.json"));
        assert!(!is_capture_file("notes.txt"));
        assert!(!is_capture_file("report_dump_0.txt"));
    }

    #[test]
    fn removes_only_matching_files() -> Result<(), Error> {
        let temp_dir = tempfile::tempdir().expect("directory could not be created");
        for name in ["dump_0.txt", "dump_12.txt", "dump_x.txt"] {
            fs::write(temp_dir.path().join(name), b"stale").expect("write failed");
        }
        fs::write(temp_dir.path().join("notes.txt"), b"keep").expect("write failed");
        fs::write(temp_dir.path().join("dump_1.json"), b"keep").expect("write failed");

        let removed = clean(temp_dir.path())?;
        assert_eq!(removed, 3);

        assert!(temp_dir.path().join("notes.txt").exists());
        assert!(temp_dir.path().join("dump_1.json").exists());
        assert!(!temp_dir.path().join("dump_0.txt").exists());
        Ok(())
    }

    #[test]
    fn second_sweep_is_a_no_op() -> Result<(), Error> {
        let temp_dir = tempfile::tempdir().expect("directory could not be created");
        fs::write(temp_dir.path().join("dump_3.txt"), b"stale").expect("write failed");

        assert_eq!(clean(temp_dir.path())?, 1);
        assert_eq!(clean(temp_dir.path())?, 0);
        Ok(())
    }

    #[test]
    fn directories_matching_the_pattern_are_left_alone() -> Result<(), Error> {
        let temp_dir = tempfile::tempdir().expect("directory could not be created");
        fs::create_dir(temp_dir.path().join("dump_9.txt")).expect("mkdir failed");

        assert_eq!(clean(temp_dir.path())?, 0);
        assert!(temp_dir.path().join("dump_9.txt").is_dir());
        Ok(())
    }

    #[test]
    fn missing_directory_is_an_error() {
        let temp_dir = tempfile::tempdir().expect("directory could not be created");
        let gone = temp_dir.path().join("nope");

        let result = clean(&gone);
        assert!(matches!(result, Err(Error::ReadDir { .. })));
    }
}
