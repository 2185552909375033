//! File system utils.

use std::{
    ffi::OsString,
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use fs2::FileExt;

pub struct FsHandler;

impl FsHandler {
    /// Create the parent directory of `path` if it doesn't exist.
    pub fn create_parent_dir(path: &Path) -> io::Result<()> {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                std::fs::create_dir_all(parent)?;
                tracing::trace!("Ensured directory exists: {}", parent.display());
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Replace the content of `path` so that a crash leaves either the old or
    /// the new content on disk, never a truncated file.
    ///
    /// The content goes to a sibling temporary file which is synced, then
    /// renamed over `path`. On unix the parent directory is synced as well so
    /// the rename itself survives a power loss.
    pub fn write_durable(path: &Path, contents: &[u8]) -> io::Result<()> {
        let tmp_path = Self::sibling(path, ".tmp");

        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(contents)?;
            file.sync_all()?;
        }

        std::fs::rename(&tmp_path, path)?;

        #[cfg(unix)]
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            File::open(parent)?.sync_all()?;
        }

        Ok(())
    }

    /// Try to take an exclusive lock on `path`, creating the file if needed.
    ///
    /// Returns `Ok(None)` if another process (or another handle in this
    /// process) already holds the lock.
    pub fn try_lock_exclusive(path: &Path) -> io::Result<Option<LockFile>> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => return Ok(None),
            Err(e) => return Err(e),
        }

        // Informational only; the lock itself is what matters.
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;

        tracing::debug!(path = %path.display(), "Acquired exclusive lock");

        Ok(Some(LockFile {
            file,
            path: path.to_path_buf(),
        }))
    }

    /// `path` with `suffix` appended to its file name (`ledger.json` -> `ledger.json.lock`).
    pub fn sibling(path: &Path, suffix: &str) -> PathBuf {
        let mut name: OsString = path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }
}

/// An exclusive lock held until dropped.
#[derive(Debug)]
pub struct LockFile {
    file: File,
    path: PathBuf,
}

impl LockFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::error!(err = ?e, path = %self.path.display(), "Failed to release lock");
        } else {
            tracing::debug!(path = %self.path.display(), "Released exclusive lock");
        }
    }
}
