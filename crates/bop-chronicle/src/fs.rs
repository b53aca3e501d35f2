//! Directory layout and file helpers for chronicle storage.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{ChronicleError, ChronicleResult};

/// Name of the data file inside a cycle directory.
pub const DATA_FILE_NAME: &str = "data";

/// Name of the index file inside a cycle directory.
pub const INDEX_FILE_NAME: &str = "index";

/// Resolves paths under a chronicle root.
///
/// ```text
/// <root>/<cycle name>/data
/// <root>/<cycle name>/index
/// ```
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_root(&self) -> ChronicleResult<()> {
        fs::create_dir_all(&self.root).map_err(ChronicleError::from)
    }

    #[inline]
    pub fn cycle_dir(&self, cycle_name: &str) -> PathBuf {
        self.root.join(cycle_name)
    }

    #[inline]
    pub fn data_path(&self, cycle_name: &str) -> PathBuf {
        self.cycle_dir(cycle_name).join(DATA_FILE_NAME)
    }

    #[inline]
    pub fn index_path(&self, cycle_name: &str) -> PathBuf {
        self.cycle_dir(cycle_name).join(INDEX_FILE_NAME)
    }

    /// Names of every subdirectory of the root holding both cycle files.
    pub fn cycle_dir_names(&self) -> ChronicleResult<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if self.data_path(&name).is_file() && self.index_path(&name).is_file() {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Removes the whole chronicle directory tree.
    pub fn remove_all(&self) -> ChronicleResult<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Opens `path` read/write, creating it empty when missing.
pub fn open_or_create_file(path: &Path) -> ChronicleResult<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(ChronicleError::from)
}

/// Opens an existing file read/write.
pub fn open_existing_file(path: &Path) -> ChronicleResult<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(ChronicleError::from)
}

/// Grows `file` to at least `len` bytes. Never shrinks.
pub fn ensure_len(file: &File, len: u64) -> ChronicleResult<()> {
    let current = file.metadata()?.len();
    if current < len {
        file.set_len(len)?;
    }
    Ok(())
}

/// Flushes directory metadata so newly created entries survive a crash.
pub fn fsync_dir(path: &Path) -> ChronicleResult<()> {
    #[cfg(unix)]
    {
        let dir = File::open(path)?;
        match dir.sync_all() {
            Ok(()) => Ok(()),
            Err(err) if sync_unsupported(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

pub(crate) fn sync_unsupported(err: &io::Error) -> bool {
    if matches!(err.kind(), io::ErrorKind::Unsupported) {
        return true;
    }
    if let Some(code) = err.raw_os_error() {
        if code == libc::ENOSYS || code == libc::EINVAL || code == libc::ENOTSUP {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn cycle_dir_names_require_both_files() {
        let tmp = TempDir::new().expect("tempdir");
        let layout = Layout::new(tmp.path().join("chronicle"));
        assert!(layout.cycle_dir_names().expect("missing root").is_empty());

        layout.ensure_root().expect("root");
        fs::create_dir_all(layout.cycle_dir("20240101")).expect("dir");
        File::create(layout.data_path("20240101")).expect("data");
        assert!(layout.cycle_dir_names().expect("list").is_empty());

        File::create(layout.index_path("20240101")).expect("index");
        assert_eq!(layout.cycle_dir_names().expect("list"), vec!["20240101"]);
    }

    #[test]
    fn ensure_len_never_shrinks() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("file");
        let file = open_or_create_file(&path).expect("create");
        ensure_len(&file, 8192).expect("grow");
        ensure_len(&file, 4096).expect("no-op");
        assert_eq!(file.metadata().expect("meta").len(), 8192);
    }

    #[test]
    fn remove_all_tolerates_missing_root() {
        let tmp = TempDir::new().expect("tempdir");
        let layout = Layout::new(tmp.path().join("absent"));
        layout.remove_all().expect("missing root is fine");
    }
}
