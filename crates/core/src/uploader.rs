//! Archiving build outputs into a single cacheable artifact.
//!
//! Outputs are packed into a zstd-compressed tar archive. Entries use
//! deterministic headers: mtimes and ownership are zeroed and modes collapse
//! to `0o755`/`0o644`, so executable bits survive while identical outputs
//! produce identical archives.

use crate::cache::ArtifactCache;
use crate::info::{ArtifactInfo, ArtifactSource};
use crate::rule_key::RuleKey;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

const ZSTD_LEVEL: i32 = 3;

/// Pack `paths` (relative to `root`) into `dest` as a `tar.zst` archive.
///
/// Directories are added recursively. Symlinks are archived as links.
///
/// # Errors
///
/// Returns error if a path is absolute or escapes `root`, or if any output
/// cannot be read
pub fn pack(root: &Path, paths: &[PathBuf], dest: &Path) -> Result<()> {
    let mut sorted: Vec<&PathBuf> = paths.iter().collect();
    sorted.sort();
    sorted.dedup();
    for path in &sorted {
        check_relative(path)?;
    }

    let file = fs::File::create(dest).map_err(|e| Error::io(e, dest, "create"))?;
    let enc = zstd::Encoder::new(file, ZSTD_LEVEL)
        .map_err(|e| Error::io(e, dest, "zstd encoder"))?;
    let mut builder = tar::Builder::new(enc);
    builder.mode(tar::HeaderMode::Deterministic);
    builder.follow_symlinks(false);

    for path in sorted {
        let full = root.join(path);
        let meta = fs::symlink_metadata(&full).map_err(|e| Error::io(e, &full, "stat"))?;
        if meta.is_dir() {
            builder
                .append_dir_all(path, &full)
                .map_err(|e| Error::io(e, &full, "archive directory"))?;
        } else {
            builder
                .append_path_with_name(&full, path)
                .map_err(|e| Error::io(e, &full, "archive file"))?;
        }
    }

    let enc = builder
        .into_inner()
        .map_err(|e| Error::io(e, dest, "tar finalize"))?;
    enc.finish().map_err(|e| Error::io(e, dest, "zstd finish"))?;
    Ok(())
}

/// Restore an archive produced by [`pack`] under `dest`.
///
/// # Errors
///
/// Returns error if the archive is corrupt or cannot be written out
pub fn unpack(archive: &Path, dest: &Path) -> Result<()> {
    let file = fs::File::open(archive).map_err(|e| Error::io(e, archive, "open"))?;
    let dec = zstd::Decoder::new(file).map_err(|e| Error::io(e, archive, "zstd decoder"))?;
    fs::create_dir_all(dest).map_err(|e| Error::io(e, dest, "create_dir_all"))?;
    let mut tar = tar::Archive::new(dec);
    tar.set_overwrite(true);
    tar.unpack(dest).map_err(|e| Error::io(e, archive, "unpack"))?;
    Ok(())
}

fn check_relative(path: &Path) -> Result<()> {
    let escapes = path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes || path.as_os_str().is_empty() {
        return Err(Error::configuration(format!(
            "Output path '{}' must be relative to the output root",
            path.display()
        )));
    }
    Ok(())
}

/// Packs outputs and stores them under a set of rule keys.
#[derive(Debug, Clone, Default)]
pub struct ArtifactUploader {
    build_target: Option<String>,
    metadata: BTreeMap<String, String>,
}

impl ArtifactUploader {
    /// Uploader with no target or metadata
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the build target on every upload
    #[must_use]
    pub fn build_target(mut self, target: impl Into<String>) -> Self {
        self.build_target = Some(target.into());
        self
    }

    /// Attach metadata to every upload
    #[must_use]
    pub fn metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Archive `paths` under `root` and store the archive in `cache`.
    ///
    /// Returns `false` without doing any work if the cache is readonly.
    ///
    /// # Errors
    ///
    /// Returns error if packing or the store fails
    pub async fn upload(
        &self,
        cache: &dyn ArtifactCache,
        rule_keys: impl IntoIterator<Item = RuleKey>,
        root: &Path,
        paths: &[PathBuf],
    ) -> Result<bool> {
        if !cache.read_mode().is_writable() {
            debug!(cache = %cache.name(), "Skipping upload to readonly cache");
            return Ok(false);
        }

        let mut builder = ArtifactInfo::builder()
            .rule_keys(rule_keys)
            .metadata_entries(self.metadata.clone());
        if let Some(target) = &self.build_target {
            builder = builder.build_target(target.clone());
        }
        let info = builder.build()?;

        let archive = tempfile::Builder::new()
            .prefix(".artcache-upload")
            .suffix(".tar.zst")
            .tempfile()
            .map_err(|e| Error::io_no_path(e, "create archive"))?
            .into_temp_path();

        let archive_path = archive.to_path_buf();
        let root = root.to_path_buf();
        let paths = paths.to_vec();
        tokio::task::spawn_blocking(move || pack(&root, &paths, &archive_path))
            .await
            .map_err(|e| Error::task("pack", &e))??;

        cache
            .store(&info, &ArtifactSource::move_from(archive.to_path_buf()))
            .await?;
        drop(archive);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::{CacheReadMode, CacheResultType};
    use crate::test_utils::MemoryArtifactCache;
    use tempfile::TempDir;

    fn key(hex: &str) -> RuleKey {
        RuleKey::from_hex(hex).unwrap()
    }

    fn outputs(tmp: &TempDir) -> PathBuf {
        let root = tmp.path().join("out");
        fs::create_dir_all(root.join("lib/nested")).unwrap();
        fs::write(root.join("lib/a.txt"), "a").unwrap();
        fs::write(root.join("lib/nested/b.txt"), "b").unwrap();
        fs::write(root.join("tool"), "#!/bin/sh\necho hi\n").unwrap();
        root
    }

    #[test]
    fn test_pack_unpack_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let root = outputs(&tmp);
        let archive = tmp.path().join("a.tar.zst");
        pack(&root, &[PathBuf::from("lib"), PathBuf::from("tool")], &archive).unwrap();

        let dest = tmp.path().join("restored");
        unpack(&archive, &dest).unwrap();
        assert_eq!(fs::read_to_string(dest.join("lib/a.txt")).unwrap(), "a");
        assert_eq!(fs::read_to_string(dest.join("lib/nested/b.txt")).unwrap(), "b");
        assert!(dest.join("tool").is_file());
    }

    #[test]
    fn test_pack_is_deterministic() {
        let tmp = TempDir::new().unwrap();
        let root = outputs(&tmp);
        let first = tmp.path().join("1.tar.zst");
        let second = tmp.path().join("2.tar.zst");
        pack(&root, &[PathBuf::from("tool"), PathBuf::from("lib")], &first).unwrap();
        pack(&root, &[PathBuf::from("lib"), PathBuf::from("tool")], &second).unwrap();
        assert_eq!(fs::read(first).unwrap(), fs::read(second).unwrap());
    }

    #[test]
    fn test_pack_rejects_escaping_paths() {
        let tmp = TempDir::new().unwrap();
        let root = outputs(&tmp);
        let archive = tmp.path().join("a.tar.zst");
        assert!(pack(&root, &[PathBuf::from("../etc")], &archive).is_err());
        assert!(pack(&root, &[PathBuf::from("/etc")], &archive).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_executable_bit_survives() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let root = outputs(&tmp);
        fs::set_permissions(root.join("tool"), fs::Permissions::from_mode(0o755)).unwrap();
        let archive = tmp.path().join("a.tar.zst");
        pack(&root, &[PathBuf::from("tool"), PathBuf::from("lib")], &archive).unwrap();

        let dest = tmp.path().join("restored");
        unpack(&archive, &dest).unwrap();
        let tool = fs::metadata(dest.join("tool")).unwrap().permissions().mode();
        let plain = fs::metadata(dest.join("lib/a.txt")).unwrap().permissions().mode();
        assert_ne!(tool & 0o111, 0);
        assert_eq!(plain & 0o111, 0);
    }

    #[tokio::test]
    async fn test_upload_stores_archive_under_every_key() {
        let tmp = TempDir::new().unwrap();
        let root = outputs(&tmp);
        let cache = MemoryArtifactCache::new("mem");

        let stored = ArtifactUploader::new()
            .build_target("//app:bin")
            .upload(&cache, [key("aa"), key("bb")], &root, &[PathBuf::from("lib")])
            .await
            .unwrap();
        assert!(stored);
        assert_eq!(cache.len(), 2);

        let fetched = tmp.path().join("fetched.tar.zst");
        let result = cache.fetch(None, &key("bb"), &fetched).await;
        assert_eq!(result.kind(), CacheResultType::Hit);
        let dest = tmp.path().join("restored");
        unpack(&fetched, &dest).unwrap();
        assert_eq!(fs::read_to_string(dest.join("lib/nested/b.txt")).unwrap(), "b");
    }

    #[tokio::test]
    async fn test_upload_skips_readonly_cache() {
        let tmp = TempDir::new().unwrap();
        let root = outputs(&tmp);
        let cache = MemoryArtifactCache::with_mode("ro", CacheReadMode::ReadOnly);
        let stored = ArtifactUploader::new()
            .upload(&cache, [key("aa")], &root, &[PathBuf::from("tool")])
            .await
            .unwrap();
        assert!(!stored);
        assert!(cache.is_empty());
    }
}
