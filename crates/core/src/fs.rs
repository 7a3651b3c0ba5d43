//! Atomic publish primitives shared by the local caches
//!
//! Everything here is blocking; async callers run it under `spawn_blocking`.

use crate::{Error, Result};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Create a temp file in the same directory as `dest`, creating the
/// directory if needed, so a later rename is atomic.
///
/// # Errors
///
/// Returns error if the directory or the temp file cannot be created
pub fn temp_file_beside(dest: &Path) -> Result<NamedTempFile> {
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
    NamedTempFile::new_in(parent).map_err(|e| Error::io(e, parent, "create_temp"))
}

/// Publish a fully written temp file at `dest`.
///
/// # Errors
///
/// Returns error if the rename fails
pub fn persist(tmp: NamedTempFile, dest: &Path) -> Result<()> {
    tmp.persist(dest)
        .map(|_| ())
        .map_err(|e| Error::io(e.error, dest, "rename"))
}

/// Write `data` to `dest` through a temp file and atomic rename.
///
/// # Errors
///
/// Returns error if any I/O step fails
pub fn write_atomically(dest: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = temp_file_beside(dest)?;
    tmp.write_all(data)
        .map_err(|e| Error::io(e, tmp.path(), "write"))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::io(e, tmp.path(), "sync"))?;
    persist(tmp, dest)
}

/// Copy `src` to `dest` through a temp file and atomic rename.
///
/// Returns the number of bytes copied.
///
/// # Errors
///
/// Returns error if any I/O step fails
pub fn copy_atomically(src: &Path, dest: &Path) -> Result<u64> {
    let mut input = fs::File::open(src).map_err(|e| Error::io(e, src, "open"))?;
    let mut tmp = temp_file_beside(dest)?;
    let copied = io::copy(&mut input, tmp.as_file_mut()).map_err(|e| Error::io(e, src, "copy"))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::io(e, tmp.path(), "sync"))?;
    persist(tmp, dest)?;
    Ok(copied)
}

/// Remove a file, treating absence as success.
///
/// Returns whether a file was removed.
///
/// # Errors
///
/// Returns error for failures other than `NotFound`
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io(e, path, "remove_file")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomically_creates_parents() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("a/b/file");
        write_atomically(&dest, b"hello").unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"hello");
    }

    #[test]
    fn test_copy_leaves_no_temp_files() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::write(&src, b"payload").unwrap();
        let dest = tmp.path().join("out/dest");
        assert_eq!(copy_atomically(&src, &dest).unwrap(), 7);
        let entries: Vec<_> = fs::read_dir(tmp.path().join("out")).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_remove_if_exists() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("f");
        assert!(!remove_if_exists(&path).unwrap());
        fs::write(&path, b"").unwrap();
        assert!(remove_if_exists(&path).unwrap());
    }
}
