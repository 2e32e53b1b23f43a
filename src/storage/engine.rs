//! On-disk object engine with per-file metadata sidecars and optional
//! per-key version history.
//!
//! Storage layout:
//! ```text
//! {root}/{bucket}/
//!   {key}                          # Current object bytes (unversioned path)
//!   {key}.meta.json                # Metadata sidecar (JSON)
//!   {key}.versions/
//!     .latest                      # Version id of the current version
//!     {versionId}                  # Version bytes
//!     {versionId}.meta.json        # Version metadata sidecar
//! ```
//!
//! Each bucket is a real subdirectory under the root; keys map to nested
//! directories with every path segment escaped. A key is "versioned" when
//! its `.versions/` directory exists; reads consult the `.latest` marker
//! first and fall back to the unversioned path. The marker file is the
//! single source of truth for which version is current; the sentinel
//! value `null` points it at the unversioned file (suspended-mode writes).
//!
//! All mutations go through write-to-temp + fsync + rename so a crash
//! leaves either the old state or the complete new version.

use crate::types::{
    new_version_id, validate_object_key, ObjectMeta, VersioningState, NULL_VERSION_ID,
};
use bytes::Bytes;
use chrono::Utc;
use futures::stream::BoxStream;
use md5::{Digest, Md5};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument, warn};

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("Bucket not empty: {0}")]
    BucketNotEmpty(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Content-MD5 mismatch")]
    DigestMismatch,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Other(String),
}

/// Options carried alongside the bytes on a write.
#[derive(Debug, Default, Clone)]
pub struct WriteOptions {
    pub content_type: Option<String>,
    pub user_metadata: HashMap<String, String>,
    /// Raw MD5 digest from a Content-MD5 header; validated against the body.
    pub content_md5: Option<[u8; 16]>,
    /// Multipart completions supply their composite ETag here.
    pub etag_override: Option<String>,
}

/// Outcome of a delete operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// A delete marker version was appended (versioning Enabled).
    MarkerCreated { version_id: String },
    /// A specific version was permanently removed (idempotent).
    VersionRemoved,
    /// Every file for the key was unlinked.
    Removed,
}

/// One page of a `listObjects` scan.
#[derive(Debug, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectMeta>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_marker: Option<String>,
}

/// One page of a `listAllVersions` scan.
#[derive(Debug, Default)]
pub struct VersionsPage {
    pub versions: Vec<ObjectMeta>,
    pub delete_markers: Vec<ObjectMeta>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_key_marker: Option<String>,
    pub next_version_id_marker: Option<String>,
}

/// Resolved filesystem locations for one object key.
struct KeyPaths {
    data: PathBuf,
    meta: PathBuf,
    versions: PathBuf,
}

/// Async-safe path existence check (avoids blocking the Tokio runtime)
async fn path_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

/// Async-safe directory check
async fn is_dir(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// Atomically write data to a file using write-to-temp + fsync + rename.
async fn atomic_write(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let parent = path
        .parent()
        .ok_or_else(|| StorageError::Other("Cannot atomic-write to a path with no parent".into()))?
        .to_path_buf();
    let path = path.to_path_buf();
    let data = data.to_vec();

    tokio::task::spawn_blocking(move || {
        let mut tmp = NamedTempFile::new_in(&parent)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| StorageError::Io(e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| StorageError::Other(format!("spawn_blocking join failed: {}", e)))?
}

/// Escape one key segment for use as a filesystem name. Only '%' needs
/// escaping to keep decoding unambiguous; the empty segment produced by a
/// trailing-slash key (directory marker) becomes the reserved name `%2F`.
fn escape_segment(segment: &str) -> String {
    if segment.is_empty() {
        return "%2F".to_string();
    }
    segment.replace('%', "%25")
}

/// Inverse of `escape_segment`.
fn unescape_segment(name: &str) -> String {
    if name == "%2F" {
        return String::new();
    }
    name.replace("%25", "%")
}

const META_SUFFIX: &str = ".meta.json";
const VERSIONS_SUFFIX: &str = ".versions";
const LATEST_MARKER: &str = ".latest";

/// Version ids embed into filesystem paths, so anything but the 32-char
/// hex shape (or the "null" sentinel) is rejected before path assembly.
fn valid_version_id(vid: &str) -> bool {
    vid == NULL_VERSION_ID
        || (vid.len() == 32 && vid.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')))
}

pub struct ObjectStore {
    /// Root directory for all buckets
    root: PathBuf,
}

impl ObjectStore {
    /// Create the engine rooted at the given directory, creating it if needed.
    pub async fn new(root: PathBuf) -> Result<Self, StorageError> {
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    /// Assemble the filesystem locations for a key, rejecting anything that
    /// would escape the bucket root.
    fn key_paths(&self, bucket: &str, key: &str) -> Result<KeyPaths, StorageError> {
        validate_object_key(key).map_err(|e| StorageError::InvalidKey(e.to_string()))?;

        let mut data = self.bucket_dir(bucket);
        // Empty segments (trailing-slash directory markers, "a//b") map to
        // the reserved %2F name, keeping the key→path mapping total.
        for segment in key.split('/') {
            data.push(escape_segment(segment));
        }

        let file_name = data
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StorageError::InvalidKey(key.to_string()))?
            .to_string();
        let meta = data.with_file_name(format!("{}{}", file_name, META_SUFFIX));
        let versions = data.with_file_name(format!("{}{}", file_name, VERSIONS_SUFFIX));
        Ok(KeyPaths {
            data,
            meta,
            versions,
        })
    }

    // === Bucket directory operations ===

    #[instrument(skip(self))]
    pub async fn create_bucket_dir(&self, bucket: &str) -> Result<(), StorageError> {
        let dir = self.bucket_dir(bucket);
        fs::create_dir_all(&dir).await?;
        debug!("Created bucket directory: {:?}", dir);
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn remove_bucket_dir(&self, bucket: &str) -> Result<(), StorageError> {
        let dir = self.bucket_dir(bucket);
        if path_exists(&dir).await {
            fs::remove_dir_all(&dir).await?;
            debug!("Removed bucket directory: {:?}", dir);
        }
        Ok(())
    }

    // === Write path ===

    /// Store an object honouring the bucket's versioning state. Returns the
    /// metadata of the version that became current.
    #[instrument(skip(self, data, opts))]
    pub async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: &[u8],
        opts: WriteOptions,
        versioning: VersioningState,
    ) -> Result<ObjectMeta, StorageError> {
        let paths = self.key_paths(bucket, key)?;

        let md5: [u8; 16] = Md5::digest(data).into();
        if let Some(expected) = opts.content_md5 {
            if expected != md5 {
                return Err(StorageError::DigestMismatch);
            }
        }
        let etag = opts.etag_override.clone().unwrap_or_else(|| hex::encode(md5));

        let mut meta = ObjectMeta {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size: data.len() as u64,
            content_type: opts.content_type,
            etag,
            updated_at: Utc::now(),
            user_metadata: opts.user_metadata,
            version_id: None,
            is_delete_marker: false,
            is_latest: true,
        };

        match versioning {
            VersioningState::Disabled => {
                self.write_pair(&paths.data, &paths.meta, data, &meta).await?;
            }
            VersioningState::Enabled => {
                let vid = new_version_id();
                meta.version_id = Some(vid.clone());
                fs::create_dir_all(&paths.versions).await?;
                let vdata = paths.versions.join(&vid);
                let vmeta = paths.versions.join(format!("{}{}", vid, META_SUFFIX));
                self.write_pair(&vdata, &vmeta, data, &meta).await?;
                // Marker flip is the commit point: readers see the previous
                // latest until this rename lands.
                atomic_write(&paths.versions.join(LATEST_MARKER), vid.as_bytes()).await?;
            }
            VersioningState::Suspended => {
                meta.version_id = Some(NULL_VERSION_ID.to_string());
                self.write_pair(&paths.data, &paths.meta, data, &meta).await?;
                if is_dir(&paths.versions).await {
                    atomic_write(
                        &paths.versions.join(LATEST_MARKER),
                        NULL_VERSION_ID.as_bytes(),
                    )
                    .await?;
                }
            }
        }

        debug!(
            "Stored {}/{} ({} bytes, version {:?})",
            bucket,
            key,
            data.len(),
            meta.version_id
        );
        Ok(meta)
    }

    async fn write_pair(
        &self,
        data_path: &Path,
        meta_path: &Path,
        data: &[u8],
        meta: &ObjectMeta,
    ) -> Result<(), StorageError> {
        if let Some(parent) = data_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        atomic_write(data_path, data).await?;
        let json = serde_json::to_vec_pretty(meta)?;
        atomic_write(meta_path, &json).await?;
        Ok(())
    }

    // === Read path ===

    async fn read_sidecar(&self, meta_path: &Path) -> Result<ObjectMeta, StorageError> {
        if !path_exists(meta_path).await {
            return Err(StorageError::NotFound(meta_path.display().to_string()));
        }
        let data = fs::read(meta_path).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Read the `.latest` marker, if the key has a version directory.
    async fn latest_version_id(&self, paths: &KeyPaths) -> Result<Option<String>, StorageError> {
        let marker = paths.versions.join(LATEST_MARKER);
        if !path_exists(&marker).await {
            return Ok(None);
        }
        let raw = fs::read_to_string(&marker).await?;
        Ok(Some(raw.trim().to_string()))
    }

    /// Resolve a key (and optional explicit version) to its data path and
    /// sidecar. Does not interpret delete markers; callers decide.
    async fn resolve(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<(PathBuf, ObjectMeta), StorageError> {
        let paths = self.key_paths(bucket, key)?;
        let not_found = || StorageError::NotFound(format!("{}/{}", bucket, key));

        match version_id {
            Some(NULL_VERSION_ID) => {
                let mut meta = self.read_sidecar(&paths.meta).await.map_err(|_| not_found())?;
                let latest = self.latest_version_id(&paths).await?;
                meta.is_latest = latest.is_none() || latest.as_deref() == Some(NULL_VERSION_ID);
                Ok((paths.data, meta))
            }
            Some(vid) => {
                if !valid_version_id(vid) {
                    return Err(StorageError::InvalidKey(format!(
                        "Invalid version id: {}",
                        vid
                    )));
                }
                let vmeta = paths.versions.join(format!("{}{}", vid, META_SUFFIX));
                let mut meta = self.read_sidecar(&vmeta).await.map_err(|_| not_found())?;
                let latest = self.latest_version_id(&paths).await?;
                meta.is_latest = latest.as_deref() == Some(vid);
                Ok((paths.versions.join(vid), meta))
            }
            None => {
                // Versioned path first, then the unversioned fallback.
                if let Some(latest) = self.latest_version_id(&paths).await? {
                    if latest == NULL_VERSION_ID {
                        let mut meta =
                            self.read_sidecar(&paths.meta).await.map_err(|_| not_found())?;
                        meta.is_latest = true;
                        return Ok((paths.data, meta));
                    }
                    let vmeta = paths.versions.join(format!("{}{}", latest, META_SUFFIX));
                    let mut meta = self.read_sidecar(&vmeta).await.map_err(|_| not_found())?;
                    meta.is_latest = true;
                    return Ok((paths.versions.join(latest), meta));
                }
                let mut meta = self.read_sidecar(&paths.meta).await.map_err(|_| not_found())?;
                meta.is_latest = true;
                Ok((paths.data, meta))
            }
        }
    }

    /// Metadata for a key/version. With no explicit version id a latest
    /// delete marker reads as `NoSuchKey`.
    #[instrument(skip(self))]
    pub async fn head(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<ObjectMeta, StorageError> {
        let (_, meta) = self.resolve(bucket, key, version_id).await?;
        if meta.is_delete_marker && version_id.is_none() {
            return Err(StorageError::NotFound(format!("{}/{}", bucket, key)));
        }
        Ok(meta)
    }

    /// Full object read (used by copy and small responses).
    #[instrument(skip(self))]
    pub async fn get(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<(Bytes, ObjectMeta), StorageError> {
        let (data_path, meta) = self.resolve(bucket, key, version_id).await?;
        if meta.is_delete_marker && version_id.is_none() {
            return Err(StorageError::NotFound(format!("{}/{}", bucket, key)));
        }
        let data = fs::read(&data_path).await?;
        Ok((Bytes::from(data), meta))
    }

    /// Stream an object's bytes without buffering the whole file.
    #[instrument(skip(self))]
    pub async fn get_stream(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<(BoxStream<'static, Result<Bytes, std::io::Error>>, ObjectMeta), StorageError>
    {
        let (data_path, meta) = self.resolve(bucket, key, version_id).await?;
        if meta.is_delete_marker && version_id.is_none() {
            return Err(StorageError::NotFound(format!("{}/{}", bucket, key)));
        }
        let file = fs::File::open(&data_path).await?;
        Ok((Box::pin(ReaderStream::new(file)), meta))
    }

    /// Read `len` bytes starting at `start` from a resolved version.
    #[instrument(skip(self))]
    pub async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
        start: u64,
        len: u64,
    ) -> Result<(Bytes, ObjectMeta), StorageError> {
        let (data_path, meta) = self.resolve(bucket, key, version_id).await?;
        if meta.is_delete_marker && version_id.is_none() {
            return Err(StorageError::NotFound(format!("{}/{}", bucket, key)));
        }
        let mut file = fs::File::open(&data_path).await?;
        file.seek(std::io::SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf).await?;
        Ok((Bytes::from(buf), meta))
    }

    // === Delete path ===

    /// Delete a key or one of its versions per the bucket's versioning state.
    #[instrument(skip(self))]
    pub async fn delete(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
        versioning: VersioningState,
    ) -> Result<DeleteOutcome, StorageError> {
        let paths = self.key_paths(bucket, key)?;

        if let Some(vid) = version_id {
            if !valid_version_id(vid) {
                return Err(StorageError::InvalidKey(format!(
                    "Invalid version id: {}",
                    vid
                )));
            }
            self.delete_version(&paths, vid).await?;
            self.prune_empty_parents(bucket, &paths.data).await;
            return Ok(DeleteOutcome::VersionRemoved);
        }

        match versioning {
            VersioningState::Enabled => {
                // Appending a delete marker to a key that has never existed
                // still succeeds; S3 mints a marker regardless.
                let vid = new_version_id();
                let meta = ObjectMeta {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    size: 0,
                    content_type: None,
                    etag: hex::encode(Md5::digest(b"")),
                    updated_at: Utc::now(),
                    user_metadata: HashMap::new(),
                    version_id: Some(vid.clone()),
                    is_delete_marker: true,
                    is_latest: true,
                };
                fs::create_dir_all(&paths.versions).await?;
                let vdata = paths.versions.join(&vid);
                let vmeta = paths.versions.join(format!("{}{}", vid, META_SUFFIX));
                self.write_pair(&vdata, &vmeta, b"", &meta).await?;
                atomic_write(&paths.versions.join(LATEST_MARKER), vid.as_bytes()).await?;
                Ok(DeleteOutcome::MarkerCreated { version_id: vid })
            }
            VersioningState::Disabled | VersioningState::Suspended => {
                remove_if_exists(&paths.meta).await?;
                remove_if_exists(&paths.data).await?;
                if is_dir(&paths.versions).await {
                    fs::remove_dir_all(&paths.versions).await?;
                }
                self.prune_empty_parents(bucket, &paths.data).await;
                Ok(DeleteOutcome::Removed)
            }
        }
    }

    /// Permanently remove one version; succeeds when it is already gone.
    async fn delete_version(&self, paths: &KeyPaths, vid: &str) -> Result<(), StorageError> {
        if vid == NULL_VERSION_ID {
            remove_if_exists(&paths.meta).await?;
            remove_if_exists(&paths.data).await?;
        } else {
            remove_if_exists(&paths.versions.join(format!("{}{}", vid, META_SUFFIX))).await?;
            remove_if_exists(&paths.versions.join(vid)).await?;
        }

        // If the removed version was current, promote the next-newest one.
        if let Some(latest) = self.latest_version_id(paths).await? {
            if latest == vid {
                self.repoint_latest(paths).await?;
            }
        }
        Ok(())
    }

    /// Recompute the `.latest` marker after the current version was removed:
    /// newest remaining version by creation timestamp, the unversioned file
    /// counting as version `null`. Removes the version directory when
    /// nothing remains in it.
    async fn repoint_latest(&self, paths: &KeyPaths) -> Result<(), StorageError> {
        let mut candidates: Vec<(chrono::DateTime<Utc>, String)> = Vec::new();

        if is_dir(&paths.versions).await {
            let mut entries = fs::read_dir(&paths.versions).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if let Some(vid) = name.strip_suffix(META_SUFFIX) {
                    if let Ok(meta) = self.read_sidecar(&entry.path()).await {
                        candidates.push((meta.updated_at, vid.to_string()));
                    }
                }
            }
        }
        if path_exists(&paths.meta).await {
            if let Ok(meta) = self.read_sidecar(&paths.meta).await {
                candidates.push((meta.updated_at, NULL_VERSION_ID.to_string()));
            }
        }

        candidates.sort_by(|a, b| b.0.cmp(&a.0));
        match candidates.first() {
            Some((_, vid)) => {
                atomic_write(&paths.versions.join(LATEST_MARKER), vid.as_bytes()).await?;
            }
            None => {
                if is_dir(&paths.versions).await {
                    fs::remove_dir_all(&paths.versions).await?;
                }
            }
        }
        Ok(())
    }

    /// Remove now-empty intermediate directories up to the bucket root.
    async fn prune_empty_parents(&self, bucket: &str, from: &Path) {
        let bucket_dir = self.bucket_dir(bucket);
        let mut dir = from.parent().map(Path::to_path_buf);
        while let Some(d) = dir {
            if d == bucket_dir || !d.starts_with(&bucket_dir) {
                break;
            }
            if fs::remove_dir(&d).await.is_err() {
                break; // not empty (or already gone)
            }
            dir = d.parent().map(Path::to_path_buf);
        }
    }

    // === Listing ===

    /// Collect the current (latest, non-delete-marker handling left to the
    /// caller) version of every key in the bucket, sorted by key.
    async fn collect_current(
        &self,
        bucket: &str,
    ) -> Result<BTreeMap<String, ObjectMeta>, StorageError> {
        let dir = self.bucket_dir(bucket);
        let mut out = BTreeMap::new();
        if !is_dir(&dir).await {
            return Ok(out);
        }
        self.walk_current(&dir, String::new(), &mut out).await?;
        Ok(out)
    }

    fn walk_current<'a>(
        &'a self,
        dir: &'a Path,
        key_prefix: String,
        out: &'a mut BTreeMap<String, ObjectMeta>,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<(), StorageError>> + Send + 'a>,
    > {
        Box::pin(async move {
            let mut entries = fs::read_dir(dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().to_string();
                let ft = entry.file_type().await?;

                if ft.is_dir() {
                    if let Some(base) = name.strip_suffix(VERSIONS_SUFFIX) {
                        let key = format!("{}{}", key_prefix, unescape_segment(base));
                        if let Some(meta) = self.current_from_versions(&path).await? {
                            out.insert(key, meta);
                        }
                    } else {
                        let child_prefix = format!("{}{}/", key_prefix, unescape_segment(&name));
                        self.walk_current(&path, child_prefix, out).await?;
                    }
                    continue;
                }

                if name.ends_with(META_SUFFIX) {
                    continue; // sidecars are read alongside their data files
                }
                // Unversioned data file: current unless a version directory
                // with a non-null marker overrides it.
                let meta_path = path.with_file_name(format!("{}{}", name, META_SUFFIX));
                let versions = path.with_file_name(format!("{}{}", name, VERSIONS_SUFFIX));
                let marker = versions.join(LATEST_MARKER);
                if path_exists(&marker).await {
                    let latest = fs::read_to_string(&marker).await?;
                    if latest.trim() != NULL_VERSION_ID {
                        continue; // versioned entry wins; handled via the dir
                    }
                }
                match self.read_sidecar(&meta_path).await {
                    Ok(mut meta) => {
                        meta.is_latest = true;
                        out.insert(format!("{}{}", key_prefix, unescape_segment(&name)), meta);
                    }
                    Err(_) => {
                        warn!("Orphaned data file (no sidecar): {}", path.display());
                    }
                }
            }
            Ok(())
        })
    }

    /// Resolve the current version stored inside a `.versions/` directory.
    /// Returns `None` when the marker points at the unversioned file (that
    /// entry is picked up by the plain-file branch of the walk) or when the
    /// directory has no marker.
    async fn current_from_versions(
        &self,
        versions: &Path,
    ) -> Result<Option<ObjectMeta>, StorageError> {
        let marker = versions.join(LATEST_MARKER);
        if !path_exists(&marker).await {
            return Ok(None);
        }
        let vid = fs::read_to_string(&marker).await?.trim().to_string();
        if vid == NULL_VERSION_ID {
            return Ok(None);
        }
        let vmeta = versions.join(format!("{}{}", vid, META_SUFFIX));
        match self.read_sidecar(&vmeta).await {
            Ok(mut meta) => {
                meta.is_latest = true;
                Ok(Some(meta))
            }
            Err(_) => Ok(None),
        }
    }

    /// List current objects with prefix filtering, delimiter grouping and
    /// marker pagination. Keys whose latest version is a delete marker are
    /// excluded. Common prefixes count toward `max_keys` like S3.
    #[instrument(skip(self))]
    pub async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
        marker: Option<&str>,
        max_keys: u32,
    ) -> Result<ListPage, StorageError> {
        let current = self.collect_current(bucket).await?;
        let marker = marker.unwrap_or("");

        let mut page = ListPage::default();
        let mut seen_prefixes: Vec<String> = Vec::new();
        let mut count: u32 = 0;

        for (key, meta) in current.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            if meta.is_delete_marker {
                continue;
            }

            // Roll up into a common prefix when the delimiter appears after
            // the listing prefix.
            let entry_name = match delimiter {
                Some(d) if !d.is_empty() => key[prefix.len()..]
                    .find(d)
                    .map(|idx| key[..prefix.len() + idx + d.len()].to_string()),
                _ => None,
            };

            match entry_name {
                Some(cp) => {
                    if cp.as_str() <= marker {
                        continue;
                    }
                    if seen_prefixes.last() == Some(&cp) {
                        continue;
                    }
                    if count >= max_keys {
                        page.is_truncated = true;
                        break;
                    }
                    count += 1;
                    page.next_marker = Some(cp.clone());
                    seen_prefixes.push(cp);
                }
                None => {
                    if key.as_str() <= marker {
                        continue;
                    }
                    if count >= max_keys {
                        page.is_truncated = true;
                        break;
                    }
                    count += 1;
                    page.next_marker = Some(key.clone());
                    page.objects.push(meta.clone());
                }
            }
        }

        page.common_prefixes = seen_prefixes;
        if !page.is_truncated {
            page.next_marker = None;
        }
        Ok(page)
    }

    /// Enumerate every version of every key under `prefix`, ordered by key
    /// then by creation time (newest first within a key).
    #[instrument(skip(self))]
    pub async fn list_versions(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
        key_marker: Option<&str>,
        version_id_marker: Option<&str>,
        max_keys: u32,
    ) -> Result<VersionsPage, StorageError> {
        let all = self.collect_versions(bucket).await?;
        let key_marker = key_marker.unwrap_or("");
        let version_id_marker = version_id_marker.unwrap_or("");

        let mut page = VersionsPage::default();
        let mut seen_prefixes: Vec<String> = Vec::new();
        let mut count: u32 = 0;

        'outer: for (key, versions) in all.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }

            let cp = match delimiter {
                Some(d) if !d.is_empty() => key[prefix.len()..]
                    .find(d)
                    .map(|idx| key[..prefix.len() + idx + d.len()].to_string()),
                _ => None,
            };

            if let Some(cp) = cp {
                if cp.as_str() <= key_marker {
                    continue;
                }
                if seen_prefixes.last() == Some(&cp) {
                    continue;
                }
                if count >= max_keys {
                    page.is_truncated = true;
                    break;
                }
                count += 1;
                page.next_key_marker = Some(cp.clone());
                page.next_version_id_marker = None;
                seen_prefixes.push(cp);
                continue;
            }

            // Key-marker pagination: skip keys before the marker entirely;
            // within the marker key, skip versions up to and including the
            // version-id marker.
            if key.as_str() < key_marker {
                continue;
            }
            let mut past_marker = key.as_str() > key_marker || version_id_marker.is_empty();
            if key.as_str() == key_marker && version_id_marker.is_empty() {
                continue; // key-marker alone means "start after this key"
            }

            for meta in versions {
                if !past_marker {
                    if meta.version_id_or_null() == version_id_marker {
                        past_marker = true;
                    }
                    continue;
                }
                if count >= max_keys {
                    page.is_truncated = true;
                    break 'outer;
                }
                count += 1;
                page.next_key_marker = Some(key.clone());
                page.next_version_id_marker = Some(meta.version_id_or_null().to_string());
                if meta.is_delete_marker {
                    page.delete_markers.push(meta.clone());
                } else {
                    page.versions.push(meta.clone());
                }
            }
        }

        page.common_prefixes = seen_prefixes;
        if !page.is_truncated {
            page.next_key_marker = None;
            page.next_version_id_marker = None;
        }
        Ok(page)
    }

    /// Every version of every key, sorted by key, newest first per key.
    async fn collect_versions(
        &self,
        bucket: &str,
    ) -> Result<BTreeMap<String, Vec<ObjectMeta>>, StorageError> {
        let dir = self.bucket_dir(bucket);
        let mut out = BTreeMap::new();
        if !is_dir(&dir).await {
            return Ok(out);
        }
        self.walk_versions(&dir, String::new(), &mut out).await?;
        for versions in out.values_mut() {
            versions.sort_by(|a, b| {
                b.updated_at
                    .cmp(&a.updated_at)
                    .then_with(|| a.version_id_or_null().cmp(b.version_id_or_null()))
            });
        }
        Ok(out)
    }

    fn walk_versions<'a>(
        &'a self,
        dir: &'a Path,
        key_prefix: String,
        out: &'a mut BTreeMap<String, Vec<ObjectMeta>>,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<(), StorageError>> + Send + 'a>,
    > {
        Box::pin(async move {
            let mut entries = fs::read_dir(dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().to_string();
                let ft = entry.file_type().await?;

                if ft.is_dir() {
                    if let Some(base) = name.strip_suffix(VERSIONS_SUFFIX) {
                        let key = format!("{}{}", key_prefix, unescape_segment(base));
                        let latest = {
                            let marker = path.join(LATEST_MARKER);
                            if path_exists(&marker).await {
                                Some(fs::read_to_string(&marker).await?.trim().to_string())
                            } else {
                                None
                            }
                        };
                        let mut ventries = fs::read_dir(&path).await?;
                        while let Some(ventry) = ventries.next_entry().await? {
                            let vname = ventry.file_name().to_string_lossy().to_string();
                            if let Some(vid) = vname.strip_suffix(META_SUFFIX) {
                                if let Ok(mut meta) = self.read_sidecar(&ventry.path()).await {
                                    meta.is_latest = latest.as_deref() == Some(vid);
                                    out.entry(key.clone()).or_default().push(meta);
                                }
                            }
                        }
                    } else {
                        let child_prefix = format!("{}{}/", key_prefix, unescape_segment(&name));
                        self.walk_versions(&path, child_prefix, out).await?;
                    }
                    continue;
                }

                if name.ends_with(META_SUFFIX) {
                    continue;
                }
                let meta_path = path.with_file_name(format!("{}{}", name, META_SUFFIX));
                if let Ok(mut meta) = self.read_sidecar(&meta_path).await {
                    let key = format!("{}{}", key_prefix, unescape_segment(&name));
                    // The unversioned object participates as version "null".
                    let versions = path.with_file_name(format!("{}{}", name, VERSIONS_SUFFIX));
                    let marker = versions.join(LATEST_MARKER);
                    meta.is_latest = if path_exists(&marker).await {
                        fs::read_to_string(&marker).await?.trim() == NULL_VERSION_ID
                    } else {
                        true
                    };
                    if meta.version_id.is_none() {
                        meta.version_id = Some(NULL_VERSION_ID.to_string());
                    }
                    out.entry(key).or_default().push(meta);
                }
            }
            Ok(())
        })
    }

    /// True when any key resolves to a current non-delete-marker object.
    /// Gates bucket deletion.
    #[instrument(skip(self))]
    pub async fn has_any_objects(&self, bucket: &str) -> Result<bool, StorageError> {
        let current = self.collect_current(bucket).await?;
        Ok(current.values().any(|meta| !meta.is_delete_marker))
    }
}

async fn remove_if_exists(path: &Path) -> Result<(), StorageError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
