//! Disk-backed multipart upload state.
//!
//! Every upload owns a scratch directory
//! `{root}/{bucket}/{uploadId}/` containing `meta.json` (the upload
//! record), `part-<n>` payload files and `part-<n>.meta` sidecars. The
//! scratch directory survives restarts; CompleteMultipartUpload assembles
//! the parts and the caller stores the result through the object engine
//! before the scratch is removed. A failed Complete leaves the scratch in
//! place so the client can retry.

use crate::api::S3Error;
use crate::types::{MultipartUploadMeta, PartMeta};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use md5::{Digest, Md5};
use sha2::Sha256;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::NamedTempFile;
use tokio::fs;
use tracing::{debug, instrument, warn};

/// Result of assembling a completed multipart upload
#[derive(Debug)]
pub struct CompletedUpload {
    pub data: Bytes,
    /// Composite ETag, unquoted: `hex(MD5(concat of part MD5s))-N`
    pub etag: String,
    pub content_type: Option<String>,
    pub user_metadata: HashMap<String, String>,
}

/// One page of a ListParts scan.
pub struct PartListing {
    pub parts: Vec<PartMeta>,
    pub is_truncated: bool,
    pub next_part_number_marker: Option<u32>,
}

/// One page of a ListMultipartUploads scan.
pub struct UploadListing {
    pub uploads: Vec<MultipartUploadMeta>,
    pub is_truncated: bool,
    pub next_key_marker: Option<String>,
    pub next_upload_id_marker: Option<String>,
}

/// Filesystem-backed store for in-progress multipart uploads.
pub struct MultipartStore {
    root: PathBuf,
    id_counter: AtomicU64,
}

fn valid_upload_id(id: &str) -> bool {
    id.len() == 32 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

async fn atomic_write(path: &Path, data: &[u8]) -> Result<(), std::io::Error> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path with no parent"))?
        .to_path_buf();
    let path = path.to_path_buf();
    let data = data.to_vec();
    tokio::task::spawn_blocking(move || {
        let mut tmp = NamedTempFile::new_in(&parent)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(std::io::Error::other)?
}

impl MultipartStore {
    pub async fn new(root: PathBuf) -> Result<Self, std::io::Error> {
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            id_counter: AtomicU64::new(0),
        })
    }

    fn upload_dir(&self, bucket: &str, upload_id: &str) -> PathBuf {
        self.root.join(bucket).join(upload_id)
    }

    fn part_path(dir: &Path, part_number: u32) -> PathBuf {
        dir.join(format!("part-{}", part_number))
    }

    fn part_meta_path(dir: &Path, part_number: u32) -> PathBuf {
        dir.join(format!("part-{}.meta", part_number))
    }

    /// Create a new multipart upload, returns the upload ID.
    #[instrument(skip(self, user_metadata))]
    pub async fn create(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        user_metadata: HashMap<String, String>,
    ) -> Result<String, S3Error> {
        let counter = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let nanos = now.timestamp_nanos_opt().unwrap_or(0);

        // SHA256(counter + timestamp_nanos + bucket + key), first 32 hex chars
        let mut hasher = Sha256::new();
        hasher.update(counter.to_le_bytes());
        hasher.update(nanos.to_le_bytes());
        hasher.update(bucket.as_bytes());
        hasher.update(key.as_bytes());
        let hash = hasher.finalize();
        let upload_id = hex::encode(&hash[..16]); // 32 hex chars

        let meta = MultipartUploadMeta {
            upload_id: upload_id.clone(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            content_type,
            user_metadata,
            initiated_at: now,
        };

        let dir = self.upload_dir(bucket, &upload_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| S3Error::InternalError(e.to_string()))?;
        let json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| S3Error::InternalError(e.to_string()))?;
        atomic_write(&dir.join("meta.json"), &json)
            .await
            .map_err(|e| S3Error::InternalError(e.to_string()))?;

        debug!("Created multipart upload {} for {}/{}", upload_id, bucket, key);
        Ok(upload_id)
    }

    /// Load the upload record, verifying it targets the expected key.
    async fn load_meta(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<MultipartUploadMeta, S3Error> {
        if !valid_upload_id(upload_id) {
            return Err(S3Error::NoSuchUpload(upload_id.to_string()));
        }
        let path = self.upload_dir(bucket, upload_id).join("meta.json");
        let data = fs::read(&path)
            .await
            .map_err(|_| S3Error::NoSuchUpload(upload_id.to_string()))?;
        let meta: MultipartUploadMeta = serde_json::from_slice(&data)
            .map_err(|e| S3Error::InternalError(e.to_string()))?;
        if meta.bucket != bucket || meta.key != key {
            return Err(S3Error::NoSuchUpload(upload_id.to_string()));
        }
        Ok(meta)
    }

    /// Upload a part, returns the unquoted ETag (MD5 hex). Re-uploading the
    /// same part number replaces the previous data.
    #[instrument(skip(self, data))]
    pub async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String, S3Error> {
        if !(1..=10000).contains(&part_number) {
            return Err(S3Error::InvalidArgument(
                "Part number must be between 1 and 10000".to_string(),
            ));
        }
        self.load_meta(bucket, key, upload_id).await?;

        let md5_hex = hex::encode(Md5::digest(&data));
        let meta = PartMeta {
            part_number,
            etag: md5_hex.clone(),
            size: data.len() as u64,
            last_modified: Utc::now(),
        };

        let dir = self.upload_dir(bucket, upload_id);
        atomic_write(&Self::part_path(&dir, part_number), &data)
            .await
            .map_err(|e| S3Error::InternalError(e.to_string()))?;
        let json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| S3Error::InternalError(e.to_string()))?;
        atomic_write(&Self::part_meta_path(&dir, part_number), &json)
            .await
            .map_err(|e| S3Error::InternalError(e.to_string()))?;

        Ok(md5_hex)
    }

    /// Assemble parts into a single object. Does NOT remove the scratch;
    /// the caller calls `remove()` after the object engine write succeeds,
    /// so a failed store leaves the upload retryable.
    #[instrument(skip(self, requested_parts))]
    pub async fn complete(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        requested_parts: &[(u32, String)],
    ) -> Result<CompletedUpload, S3Error> {
        let upload = self.load_meta(bucket, key, upload_id).await?;

        if requested_parts.is_empty() {
            return Err(S3Error::InvalidPart(
                "You must specify at least one part".to_string(),
            ));
        }

        // Order is the caller's part-number order after sorting; duplicates
        // are the only rejection. Gaps (1, 3, 7) are fine.
        let mut parts: Vec<(u32, String)> = requested_parts.to_vec();
        parts.sort_by_key(|(n, _)| *n);
        for window in parts.windows(2) {
            if window[0].0 == window[1].0 {
                return Err(S3Error::InvalidPartOrder);
            }
        }

        let dir = self.upload_dir(bucket, upload_id);
        let mut md5_concat = Vec::with_capacity(parts.len() * 16);
        let mut assembled = BytesMut::new();

        for (part_number, requested_etag) in &parts {
            let meta_raw = fs::read(Self::part_meta_path(&dir, *part_number))
                .await
                .map_err(|_| {
                    S3Error::InvalidPart(format!("Part {} has not been uploaded", part_number))
                })?;
            let part_meta: PartMeta = serde_json::from_slice(&meta_raw)
                .map_err(|e| S3Error::InternalError(e.to_string()))?;

            let requested_clean = requested_etag.trim_matches('"');
            if requested_clean != part_meta.etag {
                return Err(S3Error::InvalidPart(format!(
                    "ETag mismatch for part {}: expected \"{}\", got \"{}\"",
                    part_number, part_meta.etag, requested_clean
                )));
            }

            let raw_md5 = hex::decode(&part_meta.etag)
                .map_err(|e| S3Error::InternalError(e.to_string()))?;
            md5_concat.extend_from_slice(&raw_md5);

            let data = fs::read(Self::part_path(&dir, *part_number))
                .await
                .map_err(|e| S3Error::InternalError(e.to_string()))?;
            assembled.extend_from_slice(&data);
        }

        // S3-compatible multipart ETag: MD5(concat of part MD5 raw bytes)-N
        let etag = format!("{}-{}", hex::encode(Md5::digest(&md5_concat)), parts.len());

        Ok(CompletedUpload {
            data: assembled.freeze(),
            etag,
            content_type: upload.content_type,
            user_metadata: upload.user_metadata,
        })
    }

    /// Remove the scratch directory after successful finalization; prunes
    /// the per-bucket scratch parent when it becomes empty.
    pub async fn remove(&self, bucket: &str, upload_id: &str) {
        if !valid_upload_id(upload_id) {
            return;
        }
        let dir = self.upload_dir(bucket, upload_id);
        if let Err(e) = fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove multipart scratch {:?}: {}", dir, e);
            }
        }
        let _ = fs::remove_dir(self.root.join(bucket)).await;
    }

    /// Abort a multipart upload.
    #[instrument(skip(self))]
    pub async fn abort(&self, bucket: &str, key: &str, upload_id: &str) -> Result<(), S3Error> {
        self.load_meta(bucket, key, upload_id).await?;
        self.remove(bucket, upload_id).await;
        Ok(())
    }

    /// List parts ordered by part number with marker pagination.
    #[instrument(skip(self))]
    pub async fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number_marker: Option<u32>,
        max_parts: u32,
    ) -> Result<PartListing, S3Error> {
        self.load_meta(bucket, key, upload_id).await?;

        let dir = self.upload_dir(bucket, upload_id);
        let mut parts: Vec<PartMeta> = Vec::new();
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| S3Error::InternalError(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| S3Error::InternalError(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("part-") && name.ends_with(".meta") {
                if let Ok(raw) = fs::read(entry.path()).await {
                    if let Ok(meta) = serde_json::from_slice::<PartMeta>(&raw) {
                        parts.push(meta);
                    }
                }
            }
        }
        parts.sort_by_key(|p| p.part_number);

        let marker = part_number_marker.unwrap_or(0);
        let remaining: Vec<PartMeta> =
            parts.into_iter().filter(|p| p.part_number > marker).collect();
        let is_truncated = remaining.len() as u32 > max_parts;
        let page: Vec<PartMeta> = remaining.into_iter().take(max_parts as usize).collect();
        let next_part_number_marker = if is_truncated {
            page.last().map(|p| p.part_number)
        } else {
            None
        };

        Ok(PartListing {
            parts: page,
            is_truncated,
            next_part_number_marker,
        })
    }

    /// List in-progress uploads for a bucket ordered by (key, uploadId).
    #[instrument(skip(self))]
    pub async fn list_uploads(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        key_marker: Option<&str>,
        upload_id_marker: Option<&str>,
        max_uploads: u32,
    ) -> Result<UploadListing, S3Error> {
        let bucket_dir = self.root.join(bucket);
        let mut uploads: Vec<MultipartUploadMeta> = Vec::new();

        if fs::try_exists(&bucket_dir).await.unwrap_or(false) {
            let mut entries = fs::read_dir(&bucket_dir)
                .await
                .map_err(|e| S3Error::InternalError(e.to_string()))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| S3Error::InternalError(e.to_string()))?
            {
                let meta_path = entry.path().join("meta.json");
                if let Ok(raw) = fs::read(&meta_path).await {
                    if let Ok(meta) = serde_json::from_slice::<MultipartUploadMeta>(&raw) {
                        if let Some(p) = prefix {
                            if !meta.key.starts_with(p) {
                                continue;
                            }
                        }
                        uploads.push(meta);
                    }
                }
            }
        }

        uploads.sort_by(|a, b| {
            a.key
                .cmp(&b.key)
                .then_with(|| a.upload_id.cmp(&b.upload_id))
        });

        let key_marker = key_marker.unwrap_or("");
        let upload_id_marker = upload_id_marker.unwrap_or("");
        let remaining: Vec<MultipartUploadMeta> = uploads
            .into_iter()
            .filter(|u| {
                (u.key.as_str(), u.upload_id.as_str()) > (key_marker, upload_id_marker)
            })
            .collect();

        let is_truncated = remaining.len() as u32 > max_uploads;
        let page: Vec<MultipartUploadMeta> =
            remaining.into_iter().take(max_uploads as usize).collect();
        let (next_key_marker, next_upload_id_marker) = if is_truncated {
            match page.last() {
                Some(last) => (Some(last.key.clone()), Some(last.upload_id.clone())),
                None => (None, None),
            }
        } else {
            (None, None)
        };

        Ok(UploadListing {
            uploads: page,
            is_truncated,
            next_key_marker,
            next_upload_id_marker,
        })
    }

    /// Remove scratch directories older than `max_age`. Runs from the
    /// periodic sweeper with plain blocking IO.
    pub fn cleanup_expired(&self, max_age: std::time::Duration) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::hours(1));

        let buckets = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for bucket in buckets.flatten() {
            let uploads = match std::fs::read_dir(bucket.path()) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for upload in uploads.flatten() {
                let meta_path = upload.path().join("meta.json");
                let expired = std::fs::read(&meta_path)
                    .ok()
                    .and_then(|raw| serde_json::from_slice::<MultipartUploadMeta>(&raw).ok())
                    .map(|meta| meta.initiated_at < cutoff)
                    // Unreadable records are stale debris from interrupted
                    // creates; sweep them too.
                    .unwrap_or(true);
                if expired {
                    debug!("Sweeping expired multipart scratch {:?}", upload.path());
                    let _ = std::fs::remove_dir_all(upload.path());
                }
            }
            let _ = std::fs::remove_dir(bucket.path());
        }
    }
}
