//! HTTP client for a remote content-addressed store

use crate::error::{RemoteError, Result};
use crate::protocol::{self, DigestList, FIND_MISSING_PATH};
use crate::transport::{HttpRequest, RequestBody, SharedHttpService};
use artcache_core::{ContentAddressedStorage, Digest};
use async_trait::async_trait;
use futures::StreamExt;
use sha2::{Digest as _, Sha256};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Content-addressed store reached over HTTP.
///
/// Blobs live at `cas/blobs/<hash>/<size>`; `cas/find_missing` answers which
/// digests the server lacks.
pub struct HttpContentStore {
    name: String,
    service: SharedHttpService,
}

impl HttpContentStore {
    /// Client sending requests through `service`
    #[must_use]
    pub fn new(name: impl Into<String>, service: SharedHttpService) -> Self {
        Self {
            name: name.into(),
            service,
        }
    }

    async fn try_find_missing(&self, digests: &[Digest]) -> Result<Vec<Digest>> {
        let request = HttpRequest::post_json(
            FIND_MISSING_PATH,
            &DigestList {
                digests: digests.to_vec(),
            },
        )?;
        let response = self.service.make_request(request).await?;
        if !response.is_success() {
            return Err(RemoteError::status(response.status(), response.url()));
        }
        let body = response.bytes().await?;
        let missing: DigestList = serde_json::from_slice(&body)
            .map_err(|e| RemoteError::protocol(format!("Malformed find_missing response: {e}")))?;
        Ok(missing.digests)
    }

    async fn try_upload(&self, digest: &Digest, source: &Path) -> Result<()> {
        let request = HttpRequest::put(
            protocol::blob_path(digest),
            RequestBody::File(source.to_path_buf()),
        )
        .header("Content-Type", "application/octet-stream");
        let response = self.service.make_request(request).await?;
        if !response.is_success() {
            return Err(RemoteError::status(response.status(), response.url()));
        }
        Ok(())
    }

    async fn try_fetch(&self, digest: &Digest, output: &Path) -> Result<bool> {
        let response = self
            .service
            .make_request(HttpRequest::get(protocol::blob_path(digest)))
            .await?;
        if response.status() == 404 {
            return Ok(false);
        }
        if !response.is_success() {
            return Err(RemoteError::status(response.status(), response.url()));
        }

        let tmp = artcache_core::fs::temp_file_beside(output)
            .map_err(|e| RemoteError::protocol(format!("Cannot stage blob: {e}")))?;
        let std_file = tmp
            .as_file()
            .try_clone()
            .map_err(|e| RemoteError::io(e, tmp.path(), "clone"))?;
        let mut file = tokio::fs::File::from_std(std_file);

        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut body = response.into_body();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            size += chunk.len() as u64;
            file.write_all(&chunk)
                .await
                .map_err(|e| RemoteError::io(e, tmp.path(), "write"))?;
        }
        file.flush()
            .await
            .map_err(|e| RemoteError::io(e, tmp.path(), "flush"))?;
        drop(file);

        let actual = hex::encode(hasher.finalize());
        if size != digest.size() || actual != digest.hash() {
            return Err(RemoteError::protocol(format!(
                "CAS returned {actual}/{size} for {digest}"
            )));
        }
        artcache_core::fs::persist(tmp, output)
            .map_err(|e| RemoteError::protocol(format!("Cannot publish blob: {e}")))?;
        Ok(true)
    }
}

#[async_trait]
impl ContentAddressedStorage for HttpContentStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find_missing(&self, digests: &[Digest]) -> artcache_core::Result<Vec<Digest>> {
        if digests.is_empty() {
            return Ok(Vec::new());
        }
        self.try_find_missing(digests)
            .await
            .map_err(|e| e.into_cache_error(&self.name))
    }

    async fn upload(&self, digest: &Digest, source: &Path) -> artcache_core::Result<()> {
        debug!(cas = %self.name, digest = %digest, "Uploading blob");
        self.try_upload(digest, source)
            .await
            .map_err(|e| e.into_cache_error(&self.name))
    }

    async fn fetch_to(&self, digest: &Digest, output: &Path) -> artcache_core::Result<bool> {
        self.try_fetch(digest, output)
            .await
            .map_err(|e| e.into_cache_error(&self.name))
    }

    async fn close(&self) -> artcache_core::Result<()> {
        self.service.close();
        Ok(())
    }
}
