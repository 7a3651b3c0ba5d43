//! Content-addressed storage for second-level blobs
//!
//! Blobs are addressed by their SHA-256 digest and size. The local store uses
//! a two-level directory structure to keep directories small:
//!
//! ```text
//! <root>/
//!   ab/
//!     cd/
//!       abcdef123456... (blob)
//! ```

use crate::fs::{copy_atomically, persist, remove_if_exists, temp_file_beside};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// SHA-256 digest plus size of a blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest {
    hash: String,
    size: u64,
}

impl Digest {
    /// Validate a digest.
    ///
    /// # Errors
    ///
    /// Returns error unless `hash` is 64 hex characters
    pub fn new(hash: &str, size: u64) -> Result<Self> {
        if hash.len() != 64 {
            return Err(Error::invalid_key(format!(
                "Digest must be 64 hex characters, got {}",
                hash.len()
            )));
        }
        if !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::invalid_key("Digest must contain only hex digits"));
        }
        Ok(Self {
            hash: hash.to_ascii_lowercase(),
            size,
        })
    }

    /// Digest of in-memory data
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        use sha2::Digest as _;
        Self {
            hash: hex::encode(Sha256::digest(data)),
            size: data.len() as u64,
        }
    }

    /// Digest of a file, streamed.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read
    pub fn of_file(path: &Path) -> Result<Self> {
        let file = fs::File::open(path).map_err(|e| Error::io(e, path, "open"))?;
        let mut reader = HashingReader::new(file);
        io::copy(&mut reader, &mut io::sink()).map_err(|e| Error::io(e, path, "read"))?;
        Ok(reader.finish())
    }

    /// Lower-case hex hash
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Blob size in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash, self.size)
    }
}

/// Reader adapter that hashes and counts what passes through it.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    size: u64,
}

impl<R: Read> HashingReader<R> {
    /// Wrap `inner`
    pub fn new(inner: R) -> Self {
        use sha2::Digest as _;
        Self {
            inner,
            hasher: Sha256::new(),
            size: 0,
        }
    }

    /// Digest of everything read so far
    pub fn finish(self) -> Digest {
        use sha2::Digest as _;
        Digest {
            hash: hex::encode(self.hasher.finalize()),
            size: self.size,
        }
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use sha2::Digest as _;
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.size += n as u64;
        Ok(n)
    }
}

/// A store of blobs addressed by digest.
#[async_trait]
pub trait ContentAddressedStorage: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Subset of `digests` the store does not have.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be queried
    async fn find_missing(&self, digests: &[Digest]) -> Result<Vec<Digest>>;

    /// Upload the file at `source`, which must match `digest`.
    ///
    /// # Errors
    ///
    /// Returns error if the upload fails
    async fn upload(&self, digest: &Digest, source: &Path) -> Result<()>;

    /// Download the blob into `output`. Returns `false` if it is absent.
    ///
    /// # Errors
    ///
    /// Returns error if the download fails or the content does not match
    async fn fetch_to(&self, digest: &Digest, output: &Path) -> Result<bool>;

    /// Release transport resources
    ///
    /// # Errors
    ///
    /// Returns error if teardown fails
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Content-addressed store in a local directory.
#[derive(Debug, Clone)]
pub struct DirContentStore {
    root: PathBuf,
}

impl DirContentStore {
    /// Create a store at the given root directory
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path of a blob: `{root}/{hash[0:2]}/{hash[2:4]}/{hash}`
    #[must_use]
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.hash();
        self.root.join(&hex[0..2]).join(&hex[2..4]).join(hex)
    }

    /// Whether a blob exists with the expected size
    #[must_use]
    pub fn exists(&self, digest: &Digest) -> bool {
        fs::metadata(self.blob_path(digest)).is_ok_and(|m| m.is_file() && m.len() == digest.size())
    }

    fn store_blocking(&self, digest: &Digest, source: &Path) -> Result<()> {
        if self.exists(digest) {
            return Ok(());
        }
        let actual = Digest::of_file(source)?;
        if actual != *digest {
            return Err(Error::invalid_key(format!(
                "Blob {} does not match expected digest {digest}",
                actual
            )));
        }
        copy_atomically(source, &self.blob_path(digest))?;
        Ok(())
    }

    fn load_blocking(&self, digest: &Digest, output: &Path) -> Result<bool> {
        let path = self.blob_path(digest);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(Error::io(e, path, "open")),
        };
        let mut reader = HashingReader::new(file);
        let mut tmp = temp_file_beside(output)?;
        io::copy(&mut reader, tmp.as_file_mut()).map_err(|e| Error::io(e, &path, "copy"))?;
        tmp.flush().map_err(|e| Error::io(e, tmp.path(), "flush"))?;

        // Verify integrity before publishing
        let computed = reader.finish();
        if computed != *digest {
            return Err(Error::invalid_key(format!(
                "Blob integrity check failed: expected {digest}, computed {computed}"
            )));
        }
        persist(tmp, output)?;
        Ok(true)
    }

    /// Delete a blob
    ///
    /// # Errors
    ///
    /// Returns error if IO operations fail
    pub fn delete(&self, digest: &Digest) -> Result<()> {
        remove_if_exists(&self.blob_path(digest)).map(|_| ())
    }

    /// List all blobs in the store
    ///
    /// # Errors
    ///
    /// Returns error if directory traversal fails
    pub fn list(&self) -> Result<Vec<Digest>> {
        let mut blobs = Vec::new();
        if !self.root.exists() {
            return Ok(blobs);
        }
        for entry in WalkDir::new(&self.root).min_depth(3).max_depth(3) {
            let entry = entry.map_err(|e| {
                Error::io(
                    e.into_io_error()
                        .unwrap_or_else(|| io::Error::other("directory loop")),
                    &self.root,
                    "walk",
                )
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                let size = entry.metadata().map(|m| m.len()).unwrap_or_default();
                if let Ok(digest) = Digest::new(name, size) {
                    blobs.push(digest);
                }
            }
        }
        Ok(blobs)
    }

    /// Get total size of all blobs in the store
    ///
    /// # Errors
    ///
    /// Returns error if directory traversal fails
    pub fn total_size(&self) -> Result<u64> {
        Ok(self.list()?.iter().map(Digest::size).sum())
    }
}

#[async_trait]
impl ContentAddressedStorage for DirContentStore {
    fn name(&self) -> &str {
        "dir-cas"
    }

    async fn find_missing(&self, digests: &[Digest]) -> Result<Vec<Digest>> {
        Ok(digests
            .iter()
            .filter(|d| !self.exists(d))
            .cloned()
            .collect())
    }

    async fn upload(&self, digest: &Digest, source: &Path) -> Result<()> {
        let store = self.clone();
        let digest = digest.clone();
        let source = source.to_path_buf();
        tokio::task::spawn_blocking(move || store.store_blocking(&digest, &source))
            .await
            .map_err(|e| Error::task("cas upload", &e))?
    }

    async fn fetch_to(&self, digest: &Digest, output: &Path) -> Result<bool> {
        let store = self.clone();
        let digest = digest.clone();
        let output = output.to_path_buf();
        tokio::task::spawn_blocking(move || store.load_blocking(&digest, &output))
            .await
            .map_err(|e| Error::task("cas fetch", &e))?
    }
}
