//! Object storage for the stage.
//!
//! Staged files live either in S3 (the warehouse bulk-loads from there) or on
//! the local filesystem. A staged file's location is a plain string, built by
//! concatenating the stage prefix, the table name and `.txt.gz`.

mod local;
mod s3;

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use object_store::multipart::{MultipartStore, PartId};
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use regex::Regex;
use snafu::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::debug;

use crate::config::MB;
use crate::emit;
use crate::error::{InvalidUrlSnafu, ObjectStoreSnafu, StorageError};
use crate::metrics::events::{
    ActiveMultipartParts, MultipartUploadCompleted, RequestStatus, StorageOperation,
    StorageRequest, StorageRequestDuration,
};

pub use local::LocalConfig;
pub use s3::S3Config;

/// Suffix of every staged file.
pub const STAGE_SUFFIX: &str = ".txt.gz";

/// Location of a table's staged file: `{prefix}{table}.txt.gz`.
pub fn stage_path(prefix: &str, table: &str) -> String {
    format!("{prefix}{table}{STAGE_SUFFIX}")
}

/// Multipart upload tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOptions {
    pub part_size: usize,
    /// Payloads smaller than this use a single PUT.
    pub min_multipart_size: usize,
    pub max_concurrent_parts: usize,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            part_size: 32 * MB,
            min_multipart_size: 5 * MB,
            max_concurrent_parts: 8,
        }
    }
}

/// Storage provider that abstracts over the stage backends.
#[derive(Clone)]
pub struct StorageProvider {
    pub(crate) config: BackendConfig,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    /// MultipartStore for parallel part uploads with explicit part numbering.
    /// S3 supports this; the local filesystem does not.
    pub(crate) multipart_store: Option<Arc<dyn MultipartStore>>,
    pub(crate) canonical_url: String,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

// URL patterns for the supported backends
const S3_PATH: &str =
    r"^https://s3\.(?P<region>[\w\-]+)\.amazonaws\.com/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_VIRTUAL: &str =
    r"^https://(?P<bucket>[a-z0-9\-\.]+)\.s3\.(?P<region>[\w\-]+)\.amazonaws\.com(/(?P<key>.+))?$";
const S3_URL: &str = r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_ENDPOINT_URL: &str = r"^[sS]3[aA]?::(?<protocol>https?)://(?P<endpoint>[^:/]+):(?<port>\d+)/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";

const FILE_URI: &str = r"^file://(?P<path>.*)$";
const FILE_URL: &str = r"^file:(?P<path>.*)$";
const FILE_PATH: &str = r"^/(?P<path>.*)$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    S3,
    Local,
}

fn matchers() -> &'static [(Backend, Vec<Regex>)] {
    static MATCHERS: OnceLock<Vec<(Backend, Vec<Regex>)>> = OnceLock::new();
    MATCHERS.get_or_init(|| {
        let compile = |patterns: &[&str]| {
            patterns
                .iter()
                .map(|p| Regex::new(p).expect("storage URL pattern must compile"))
                .collect::<Vec<_>>()
        };
        vec![
            (
                Backend::S3,
                compile(&[S3_PATH, S3_VIRTUAL, S3_ENDPOINT_URL, S3_URL]),
            ),
            (Backend::Local, compile(&[FILE_URI, FILE_URL, FILE_PATH])),
        ]
    })
}

/// Backend configuration enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Local(LocalConfig),
}

impl BackendConfig {
    /// Parse a URL into a backend configuration.
    ///
    /// With `with_key`, a local path's final component becomes the key and
    /// the rest becomes the root directory. S3 URLs always carry their key.
    pub fn parse_url(url: &str, with_key: bool) -> Result<Self, StorageError> {
        for (backend, patterns) in matchers() {
            if let Some(matches) = patterns.iter().find_map(|r| r.captures(url)) {
                return match backend {
                    Backend::S3 => Ok(Self::parse_s3(matches)),
                    Backend::Local => Ok(Self::parse_local(matches, with_key)),
                };
            }
        }

        InvalidUrlSnafu {
            url: url.to_string(),
        }
        .fail()
    }

    fn parse_s3(matches: regex::Captures) -> Self {
        let bucket = matches
            .name("bucket")
            .expect("bucket should always be available")
            .as_str()
            .to_string();

        let region = std::env::var("AWS_DEFAULT_REGION")
            .ok()
            .or_else(|| matches.name("region").map(|m| m.as_str().to_string()));

        let endpoint = std::env::var("AWS_ENDPOINT").ok().or_else(|| {
            matches.name("endpoint").map(|endpoint| {
                let port = matches
                    .name("port")
                    .and_then(|p| p.as_str().parse::<u16>().ok())
                    .unwrap_or(443);
                let protocol = matches
                    .name("protocol")
                    .map(|p| p.as_str())
                    .unwrap_or("https");
                format!("{}://{}:{}", protocol, endpoint.as_str(), port)
            })
        });

        let key = matches.name("key").map(|m| m.as_str().into());

        BackendConfig::S3(S3Config {
            endpoint,
            region,
            bucket,
            key,
        })
    }

    fn parse_local(matches: regex::Captures, with_key: bool) -> Self {
        let path = matches
            .name("path")
            .expect("path regex must contain a path group")
            .as_str();

        let mut path = if !path.starts_with('/') {
            std::path::PathBuf::from(format!("/{path}"))
        } else {
            std::path::PathBuf::from(path)
        };

        let key = if with_key {
            let key = path
                .file_name()
                .map(|k| Path::from(k.to_string_lossy().as_ref()));
            path.pop();
            key
        } else {
            None
        };

        BackendConfig::Local(LocalConfig {
            path: path.to_string_lossy().into_owned(),
            key,
        })
    }

    pub(crate) fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::S3(s3) => s3.key.as_ref(),
            BackendConfig::Local(local) => local.key.as_ref(),
        }
    }

    fn take_key(&mut self) -> Option<Path> {
        match self {
            BackendConfig::S3(s3) => s3.key.take(),
            BackendConfig::Local(local) => local.key.take(),
        }
    }
}

impl StorageProvider {
    /// Create a storage provider rooted at `url`. Paths passed to other
    /// methods are relative to it.
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        let config = BackendConfig::parse_url(url, false)?;
        Self::construct(config, options).await
    }

    /// Create a storage provider for the object at `url`, returning the
    /// provider together with the object's path within it.
    pub async fn for_object_url(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<(Self, Path), StorageError> {
        let mut config = BackendConfig::parse_url(url, true)?;
        let key = config.take_key().context(InvalidUrlSnafu {
            url: url.to_string(),
        })?;
        let provider = Self::construct(config, options).await?;
        Ok((provider, key))
    }

    async fn construct(
        config: BackendConfig,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        match config {
            BackendConfig::S3(config) => Self::construct_s3(config, options).await,
            BackendConfig::Local(config) => Self::construct_local(config).await,
        }
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    /// Get the contents of a file.
    pub async fn get(&self, path: impl Into<Path>) -> Result<Bytes, StorageError> {
        let path = path.into();
        let start = Instant::now();
        let result = self.object_store.get(&self.qualify_path(&path)).await;

        emit!(StorageRequest {
            operation: StorageOperation::Get,
            status: RequestStatus::from_result(&result),
        });
        emit!(StorageRequestDuration {
            operation: StorageOperation::Get,
            duration: start.elapsed(),
        });

        result
            .context(ObjectStoreSnafu)?
            .bytes()
            .await
            .context(ObjectStoreSnafu)
    }

    /// Put a payload to a path, replacing any existing object.
    pub async fn put_payload(&self, path: &Path, payload: PutPayload) -> Result<(), StorageError> {
        let path = self.qualify_path(path);
        let start = Instant::now();
        let result = self.object_store.put(&path, payload).await;

        emit!(StorageRequest {
            operation: StorageOperation::Put,
            status: RequestStatus::from_result(&result),
        });
        emit!(StorageRequestDuration {
            operation: StorageOperation::Put,
            duration: start.elapsed(),
        });

        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Upload bytes using parallel multipart upload.
    ///
    /// Uses the `MultipartStore` trait which provides explicit part numbering,
    /// allowing parts to be uploaded in parallel. Small payloads and backends
    /// without `MultipartStore` fall back to a single PUT.
    pub async fn put_multipart_bytes(
        &self,
        path: &Path,
        bytes: Bytes,
        upload: &UploadOptions,
    ) -> Result<(), StorageError> {
        let multipart_store = match &self.multipart_store {
            Some(store) if bytes.len() >= upload.min_multipart_size => store.clone(),
            _ => return self.put_payload(path, PutPayload::from(bytes)).await,
        };
        let qualified_path = self.qualify_path(path).into_owned();

        let create_start = Instant::now();
        let create_result = multipart_store.create_multipart(&qualified_path).await;
        emit!(StorageRequest {
            operation: StorageOperation::CreateMultipart,
            status: RequestStatus::from_result(&create_result),
        });
        emit!(StorageRequestDuration {
            operation: StorageOperation::CreateMultipart,
            duration: create_start.elapsed(),
        });
        let multipart_id = create_result.context(ObjectStoreSnafu)?;

        let part_size = upload.part_size.max(1);
        let parts: Vec<(usize, Bytes)> = (0..)
            .zip((0..bytes.len()).step_by(part_size))
            .map(|(i, offset)| {
                let end = std::cmp::min(offset + part_size, bytes.len());
                (i, bytes.slice(offset..end))
            })
            .collect();

        let total_parts = parts.len();
        debug!(
            "Starting parallel multipart upload for {} ({} bytes, {} parts, concurrency={})",
            path,
            bytes.len(),
            total_parts,
            upload.max_concurrent_parts
        );

        let multipart_id = Arc::new(multipart_id);
        let qualified_path = Arc::new(qualified_path);
        let active_parts = Arc::new(AtomicUsize::new(0));

        let mut results: Vec<(usize, PartId)> = futures::stream::iter(parts)
            .map(|(idx, data)| {
                let multipart_store = multipart_store.clone();
                let qualified_path = qualified_path.clone();
                let multipart_id = multipart_id.clone();
                let active_parts = active_parts.clone();
                async move {
                    let count = active_parts.fetch_add(1, Ordering::Relaxed) + 1;
                    emit!(ActiveMultipartParts { count });

                    let part_start = Instant::now();
                    let result = multipart_store
                        .put_part(&qualified_path, &multipart_id, idx, data.into())
                        .await;

                    emit!(StorageRequest {
                        operation: StorageOperation::PutPart,
                        status: RequestStatus::from_result(&result),
                    });
                    emit!(StorageRequestDuration {
                        operation: StorageOperation::PutPart,
                        duration: part_start.elapsed(),
                    });

                    let count = active_parts.fetch_sub(1, Ordering::Relaxed) - 1;
                    emit!(ActiveMultipartParts { count });

                    let part_id = result.context(ObjectStoreSnafu)?;
                    debug!("Uploaded part {}/{}", idx + 1, total_parts);
                    Ok::<_, StorageError>((idx, part_id))
                }
            })
            .buffer_unordered(upload.max_concurrent_parts.max(1))
            .try_collect()
            .await?;

        // Parts may complete out of order
        results.sort_by_key(|(idx, _)| *idx);
        let part_ids: Vec<PartId> = results.into_iter().map(|(_, id)| id).collect();

        let complete_start = Instant::now();
        let complete_result = multipart_store
            .complete_multipart(&qualified_path, &multipart_id, part_ids)
            .await;

        emit!(StorageRequest {
            operation: StorageOperation::CompleteMultipart,
            status: RequestStatus::from_result(&complete_result),
        });
        emit!(StorageRequestDuration {
            operation: StorageOperation::CompleteMultipart,
            duration: complete_start.elapsed(),
        });

        complete_result.context(ObjectStoreSnafu)?;
        emit!(MultipartUploadCompleted);
        debug!("Completed parallel multipart upload for {}", path);

        Ok(())
    }
}

/// Write `bytes` to the object at `url`, replacing any previous contents.
pub async fn write_object(
    url: &str,
    bytes: Bytes,
    options: HashMap<String, String>,
    upload: &UploadOptions,
) -> Result<(), StorageError> {
    let (storage, path) = StorageProvider::for_object_url(url, options).await?;
    storage.put_multipart_bytes(&path, bytes, upload).await
}

/// Read the whole object at `url`.
pub async fn read_object(
    url: &str,
    options: HashMap<String, String>,
) -> Result<Bytes, StorageError> {
    let (storage, path) = StorageProvider::for_object_url(url, options).await?;
    storage.get(path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_stage_path_is_plain_concatenation() {
        assert_eq!(
            stage_path("s3://bucket/exports/", "users"),
            "s3://bucket/exports/users.txt.gz"
        );
        assert_eq!(
            stage_path("s3://bucket/run42_", "users"),
            "s3://bucket/run42_users.txt.gz"
        );
    }

    #[test]
    fn test_s3_url_parsing() {
        let config = BackendConfig::parse_url("s3://mybucket/path/to/users.txt.gz", true).unwrap();
        match config {
            BackendConfig::S3(s3) => {
                assert_eq!(s3.bucket, "mybucket");
                assert_eq!(s3.key, Some(Path::from("path/to/users.txt.gz")));
            }
            _ => panic!("Expected S3 config"),
        }
    }

    #[test]
    fn test_local_url_parsing() {
        let config = BackendConfig::parse_url("/local/stage/users.txt.gz", true).unwrap();
        match config {
            BackendConfig::Local(local) => {
                assert_eq!(local.path, "/local/stage");
                assert_eq!(local.key, Some(Path::from("users.txt.gz")));
            }
            _ => panic!("Expected Local config"),
        }

        let config = BackendConfig::parse_url("file:///local/stage", false).unwrap();
        assert_eq!(
            config,
            BackendConfig::Local(LocalConfig {
                path: "/local/stage".to_string(),
                key: None,
            })
        );
    }

    #[test]
    fn test_unsupported_url_rejected() {
        assert!(matches!(
            BackendConfig::parse_url("gs://bucket/users.txt.gz", true),
            Err(StorageError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn test_write_then_read_object() {
        let temp_dir = TempDir::new().unwrap();
        let prefix = format!("{}/nested/stage/", temp_dir.path().display());
        let url = stage_path(&prefix, "users");

        write_object(
            &url,
            Bytes::from_static(b"first"),
            HashMap::new(),
            &UploadOptions::default(),
        )
        .await
        .unwrap();
        write_object(
            &url,
            Bytes::from_static(b"second"),
            HashMap::new(),
            &UploadOptions::default(),
        )
        .await
        .unwrap();

        let content = read_object(&url, HashMap::new()).await.unwrap();
        assert_eq!(content.as_ref(), b"second");
    }

    #[tokio::test]
    async fn test_provider_paths_are_relative_to_root() {
        let temp_dir = TempDir::new().unwrap();
        let root = format!("{}/stage", temp_dir.path().display());
        let storage = StorageProvider::for_url_with_options(&root, HashMap::new())
            .await
            .unwrap();

        storage
            .put_payload(&Path::from("orders.txt.gz"), Bytes::from_static(b"x").into())
            .await
            .unwrap();

        assert!(temp_dir.path().join("stage/orders.txt.gz").exists());
        let missing = storage.get("absent.txt.gz").await.unwrap_err();
        assert!(matches!(
            missing,
            StorageError::ObjectStore {
                source: object_store::Error::NotFound { .. }
            }
        ));
    }
}
