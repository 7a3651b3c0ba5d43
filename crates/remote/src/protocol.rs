//! Wire format shared by the network cache and cache servers.
//!
//! An artifact travels as a *frame*: a big-endian `u32` header length, a JSON
//! header describing the artifact, then the raw payload. The header carries the
//! payload size and SHA-256 so the receiver can verify the body before it is
//! published.
//!
//! Batch endpoints speak JSON. Batch fetch results embed whole frames as
//! base64 strings.

use crate::error::{RemoteError, Result};
use artcache_core::{ArtifactInfo, Digest, RuleKey};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Largest JSON header a receiver accepts
pub const MAX_HEADER_LEN: usize = 1 << 20;

/// Path used to store an artifact
pub const STORE_PATH: &str = "artifacts/key";

/// Path of the artifact stored under `key`
#[must_use]
pub fn artifact_path(key: &RuleKey) -> String {
    format!("{STORE_PATH}/{key}")
}

/// Path of a batch operation below `endpoint`, e.g. `hybrid_thrift/fetch`
#[must_use]
pub fn batch_path(endpoint: &str, operation: &str) -> String {
    let endpoint = endpoint.trim_matches('/');
    if endpoint.is_empty() {
        operation.to_string()
    } else {
        format!("{endpoint}/{operation}")
    }
}

/// Header of an artifact frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// Keys the artifact is stored under
    pub rule_keys: Vec<RuleKey>,
    /// Build target provenance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_target: Option<String>,
    /// Artifact metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Payload length in bytes
    pub payload_size: u64,
    /// Lower-case hex SHA-256 of the payload
    pub payload_sha256: String,
}

impl FrameHeader {
    /// Header for `info` with the given payload digest
    #[must_use]
    pub fn new(info: &ArtifactInfo, payload: &Digest) -> Self {
        Self {
            rule_keys: info.rule_keys().iter().cloned().collect(),
            build_target: info.build_target().map(str::to_string),
            metadata: info.metadata().clone(),
            payload_size: payload.size(),
            payload_sha256: payload.hash().to_string(),
        }
    }

    /// Rebuild the artifact info carried by the header.
    ///
    /// # Errors
    ///
    /// Returns error if the header lists no rule keys
    pub fn to_info(&self) -> Result<ArtifactInfo> {
        let mut builder = ArtifactInfo::builder()
            .rule_keys(self.rule_keys.iter().cloned())
            .metadata_entries(self.metadata.clone());
        if let Some(target) = &self.build_target {
            builder = builder.build_target(target.clone());
        }
        builder
            .build()
            .map_err(|e| RemoteError::protocol(format!("Invalid frame header: {e}")))
    }

    /// Length prefix followed by the JSON header
    fn encode(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)
            .map_err(|e| RemoteError::serialization(format!("Failed to encode frame header: {e}")))?;
        let len = u32::try_from(json.len())
            .ok()
            .filter(|len| (*len as usize) <= MAX_HEADER_LEN)
            .ok_or_else(|| RemoteError::protocol("Frame header too large"))?;
        let mut out = Vec::with_capacity(4 + json.len());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&json);
        Ok(out)
    }
}

/// Encode an in-memory artifact as a frame.
///
/// # Errors
///
/// Returns error if the header cannot be serialized
pub fn encode_frame(info: &ArtifactInfo, payload: &[u8]) -> Result<Bytes> {
    let header = FrameHeader::new(info, &Digest::of(payload)).encode()?;
    let mut frame = BytesMut::with_capacity(header.len() + payload.len());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(payload);
    Ok(frame.freeze())
}

/// Write the frame for `source` to a temp file.
///
/// Blocking: hashes the source once, then copies it behind the header.
///
/// # Errors
///
/// Returns error if the source cannot be read or the temp file written
pub fn write_frame_file(info: &ArtifactInfo, source: &Path) -> Result<NamedTempFile> {
    let digest = Digest::of_file(source)
        .map_err(|e| RemoteError::protocol(format!("Failed to hash {}: {e}", source.display())))?;
    let header = FrameHeader::new(info, &digest).encode()?;

    let mut tmp = NamedTempFile::new().map_err(|e| RemoteError::io_no_path(e, "create_temp"))?;
    tmp.write_all(&header)
        .map_err(|e| RemoteError::io(e, tmp.path(), "write"))?;
    let mut input = std::fs::File::open(source).map_err(|e| RemoteError::io(e, source, "open"))?;
    let copied = io::copy(&mut input, &mut tmp).map_err(|e| RemoteError::io(e, source, "copy"))?;
    if copied != digest.size() {
        return Err(RemoteError::protocol(format!(
            "{} changed while it was being framed",
            source.display()
        )));
    }
    tmp.flush().map_err(|e| RemoteError::io(e, tmp.path(), "flush"))?;
    Ok(tmp)
}

/// Decode and verify a complete in-memory frame.
///
/// # Errors
///
/// Returns error if the frame is truncated, oversized or fails verification
pub fn decode_frame(frame: &[u8]) -> Result<(FrameHeader, Bytes)> {
    let mut decoder = FrameDecoder::new();
    let payload = decoder.push(frame)?;
    let header = decoder.finish()?;
    Ok((header, payload))
}

/// Incremental frame parser.
///
/// Feed body chunks with [`FrameDecoder::push`]; each call returns the part of
/// the chunk that belongs to the payload. [`FrameDecoder::finish`] checks the
/// payload against the header.
#[derive(Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    header: Option<FrameHeader>,
    hasher: Sha256,
    received: u64,
}

impl FrameDecoder {
    /// Decoder expecting a new frame
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The header, once it has been fully received
    #[must_use]
    pub fn header(&self) -> Option<&FrameHeader> {
        self.header.as_ref()
    }

    /// Payload bytes received so far
    #[must_use]
    pub fn payload_received(&self) -> u64 {
        self.received
    }

    /// Consume the next body chunk.
    ///
    /// # Errors
    ///
    /// Returns error on a malformed header or a payload longer than declared
    pub fn push(&mut self, chunk: &[u8]) -> Result<Bytes> {
        if self.header.is_some() {
            return self.accept_payload(chunk);
        }

        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() < 4 {
            return Ok(Bytes::new());
        }
        let len = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;
        if len > MAX_HEADER_LEN {
            return Err(RemoteError::protocol(format!(
                "Frame header of {len} bytes exceeds the {MAX_HEADER_LEN} byte limit"
            )));
        }
        if self.buffer.len() < 4 + len {
            return Ok(Bytes::new());
        }

        let rest = self.buffer.split_off(4 + len);
        let header: FrameHeader = serde_json::from_slice(&self.buffer[4..])
            .map_err(|e| RemoteError::protocol(format!("Malformed frame header: {e}")))?;
        if header.rule_keys.is_empty() {
            return Err(RemoteError::protocol("Frame header lists no rule keys"));
        }
        self.header = Some(header);
        self.buffer.clear();
        self.accept_payload(&rest)
    }

    fn accept_payload(&mut self, data: &[u8]) -> Result<Bytes> {
        let declared = self.header.as_ref().map_or(0, |h| h.payload_size);
        self.received += data.len() as u64;
        if self.received > declared {
            return Err(RemoteError::protocol(format!(
                "Payload exceeds its declared size of {declared} bytes"
            )));
        }
        self.hasher.update(data);
        Ok(Bytes::copy_from_slice(data))
    }

    /// Verify the payload and return the header.
    ///
    /// # Errors
    ///
    /// Returns error if the frame ended early or the digest does not match
    pub fn finish(self) -> Result<FrameHeader> {
        let header = self
            .header
            .ok_or_else(|| RemoteError::protocol("Frame ended before its header"))?;
        if self.received != header.payload_size {
            return Err(RemoteError::protocol(format!(
                "Payload truncated: received {} of {} bytes",
                self.received, header.payload_size
            )));
        }
        let actual = hex::encode(self.hasher.finalize());
        if !actual.eq_ignore_ascii_case(&header.payload_sha256) {
            return Err(RemoteError::protocol(format!(
                "Payload digest mismatch: expected {}, got {actual}",
                header.payload_sha256
            )));
        }
        Ok(header)
    }
}

/// Body of batch fetch, contains and delete requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchKeysRequest {
    /// Keys to operate on
    pub rule_keys: Vec<RuleKey>,
}

/// Per-key outcome in a batch response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    /// Artifact returned in `frame`
    Hit,
    /// Artifact exists (contains requests only)
    Contains,
    /// Not present
    Miss,
    /// The server failed for this key
    Error,
}

/// One entry of a batch fetch or contains response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    /// Key this entry answers
    pub rule_key: RuleKey,
    /// Outcome
    pub status: BatchStatus,
    /// Base64 frame, for hits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<String>,
    /// Server-side error text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchResult {
    fn of(rule_key: RuleKey, status: BatchStatus) -> Self {
        Self {
            rule_key,
            status,
            frame: None,
            error: None,
        }
    }

    /// A hit carrying `frame`
    #[must_use]
    pub fn hit(rule_key: RuleKey, frame: &[u8]) -> Self {
        Self {
            frame: Some(BASE64.encode(frame)),
            ..Self::of(rule_key, BatchStatus::Hit)
        }
    }

    /// The key exists
    #[must_use]
    pub fn contains(rule_key: RuleKey) -> Self {
        Self::of(rule_key, BatchStatus::Contains)
    }

    /// The key is absent
    #[must_use]
    pub fn miss(rule_key: RuleKey) -> Self {
        Self::of(rule_key, BatchStatus::Miss)
    }

    /// The server failed for this key
    #[must_use]
    pub fn error(rule_key: RuleKey, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::of(rule_key, BatchStatus::Error)
        }
    }

    /// Decoded frame bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the entry has no frame or it is not valid base64
    pub fn frame_bytes(&self) -> Result<Vec<u8>> {
        let encoded = self
            .frame
            .as_deref()
            .ok_or_else(|| RemoteError::protocol(format!("Hit for {} has no frame", self.rule_key)))?;
        BASE64
            .decode(encoded)
            .map_err(|e| RemoteError::protocol(format!("Frame for {} is not base64: {e}", self.rule_key)))
    }
}

/// Response of the batch fetch and contains endpoints
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResponse {
    /// One entry per answered key
    pub results: Vec<BatchResult>,
}

/// Response of the batch delete endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDeleteResponse {
    /// Keys that were present and are now gone
    pub deleted: Vec<RuleKey>,
}

/// Body of a CAS `find_missing` request and response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestList {
    /// Blob digests
    pub digests: Vec<Digest>,
}

/// Path of a CAS blob
#[must_use]
pub fn blob_path(digest: &Digest) -> String {
    format!("cas/blobs/{}/{}", digest.hash(), digest.size())
}

/// Path of the CAS `find_missing` endpoint
pub const FIND_MISSING_PATH: &str = "cas/find_missing";

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ArtifactInfo {
        ArtifactInfo::builder()
            .rule_key(RuleKey::from_hex("deadbeef").unwrap())
            .build_target("//app:lib")
            .metadata("build-id", "42")
            .build()
            .unwrap()
    }

    #[test]
    fn test_frame_decodes_byte_by_byte() {
        let frame = encode_frame(&info(), b"payload bytes").unwrap();

        let mut decoder = FrameDecoder::new();
        let mut payload = Vec::new();
        for byte in frame.iter() {
            payload.extend_from_slice(&decoder.push(&[*byte]).unwrap());
        }
        let header = decoder.finish().unwrap();

        assert_eq!(payload, b"payload bytes");
        assert_eq!(header.payload_size, 13);
        assert_eq!(header.build_target.as_deref(), Some("//app:lib"));
        assert_eq!(header.to_info().unwrap(), info());
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let frame = encode_frame(&info(), b"payload bytes").unwrap();
        let err = decode_frame(&frame[..frame.len() - 1]).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_corrupt_payload_rejected() {
        let mut frame = encode_frame(&info(), b"payload bytes").unwrap().to_vec();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let err = decode_frame(&frame).unwrap_err();
        assert!(err.to_string().contains("digest mismatch"));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut frame = encode_frame(&info(), b"abc").unwrap().to_vec();
        frame.push(b'!');
        assert!(decode_frame(&frame).is_err());
    }

    #[test]
    fn test_garbage_header_rejected() {
        let mut frame = 5u32.to_be_bytes().to_vec();
        frame.extend_from_slice(b"nope!");
        assert!(decode_frame(&frame).is_err());

        let huge = u32::MAX.to_be_bytes();
        assert!(FrameDecoder::new().push(&huge).is_err());
    }

    #[test]
    fn test_frame_file_matches_in_memory_frame() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("artifact");
        std::fs::write(&source, b"from disk").unwrap();

        let tmp = write_frame_file(&info(), &source).unwrap();
        let on_disk = std::fs::read(tmp.path()).unwrap();
        assert_eq!(on_disk, encode_frame(&info(), b"from disk").unwrap().as_ref());
    }

    #[test]
    fn test_batch_result_frames_are_base64() {
        let key = RuleKey::from_hex("aa").unwrap();
        let hit = BatchResult::hit(key.clone(), b"\x00\x01frame");
        assert_eq!(hit.frame_bytes().unwrap(), b"\x00\x01frame");

        let json = serde_json::to_value(BatchResult::miss(key.clone())).unwrap();
        assert_eq!(json, serde_json::json!({"rule_key": "aa", "status": "miss"}));

        let mut broken = BatchResult::hit(key, b"x");
        broken.frame = Some("***".into());
        assert!(broken.frame_bytes().is_err());
    }

    #[test]
    fn test_paths() {
        let key = RuleKey::from_hex("abcd").unwrap();
        assert_eq!(artifact_path(&key), "artifacts/key/abcd");
        assert_eq!(batch_path("/hybrid_thrift/", "fetch"), "hybrid_thrift/fetch");
        assert_eq!(batch_path("", "delete"), "delete");
    }
}
