//! S3-compatible object storage backend.
//!
//! [`S3Backend`] implements the [`StorageBackend`] contract using the
//! `object_store` crate, supporting any S3-compatible endpoint: AWS S3,
//! MinIO, Ceph, OSS in S3 mode, etc.
//!
//! Create-only writes use `put_opts` with [`PutMode::Create`], which maps to
//! the `If-None-Match: *` header. Object stores have no directories, so
//! `mkdir` is a no-op and a directory "exists" when anything lives under it.
//! Listings may lag behind writes; the protocols size their sleeps with
//! [`listing_accuracy`](StorageBackend::listing_accuracy).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore, PutMode, PutOptions, PutPayload};
use tracing::{debug, instrument};

use trackfs_core::error::TrackfsError;
use trackfs_core::storage::{
    BackendCapabilities, ListingConsistency, RenameSupport, StorageBackend, StorageEntry,
};
use trackfs_core::Result;

/// Default write-to-list visibility bound for object storage.
const DEFAULT_LISTING_ACCURACY: Duration = Duration::from_secs(1);

/// A [`StorageBackend`] backed by any S3-compatible object storage.
///
/// Configured from a URI like `s3://bucket/prefix?region=eu-west-1`.
pub struct S3Backend {
    store: Box<dyn ObjectStore>,
    bucket: String,
    prefix: String,
    listing_accuracy: Duration,
}

impl S3Backend {
    /// Create a new `S3Backend` from an S3 URI.
    ///
    /// # URI Format
    ///
    /// `s3://bucket/prefix?region=us-east-1&endpoint=http://minio:9000`
    ///
    /// Environment variables `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`,
    /// and `AWS_REGION` are used as fallbacks for credentials and region.
    pub fn new(uri: &str) -> Result<Self> {
        let (bucket, prefix) = parse_s3_uri(uri)?;

        let mut builder = AmazonS3Builder::from_env().with_bucket_name(&bucket);

        if let Some(region) = extract_query_param(uri, "region") {
            builder = builder.with_region(&region);
        }

        // MinIO / custom S3-compatible services
        if let Some(endpoint) = extract_query_param(uri, "endpoint") {
            builder = builder.with_endpoint(&endpoint).with_allow_http(true);
        }

        let store = builder.build().map_err(|e| {
            TrackfsError::storage(format!("Failed to create S3 client for {uri}"), e)
        })?;

        let listing_accuracy = extract_query_param(uri, "listing_accuracy_ms")
            .and_then(|ms| ms.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_LISTING_ACCURACY);

        debug!(bucket = %bucket, prefix = %prefix, "S3Backend initialised");

        Ok(Self {
            store: Box::new(store),
            bucket,
            prefix,
            listing_accuracy,
        })
    }

    /// Build the full object path from a key.
    fn full_path(&self, key: &str) -> ObjectPath {
        let key = key.trim_matches('/');
        match (self.prefix.is_empty(), key.is_empty()) {
            (true, _) => ObjectPath::from(key),
            (false, true) => ObjectPath::from(self.prefix.as_str()),
            (false, false) => ObjectPath::from(format!("{}/{}", self.prefix, key)),
        }
    }

    fn entry(&self, meta: &ObjectMeta) -> StorageEntry {
        let name = meta.location.filename().unwrap_or_default();
        StorageEntry::new(
            name,
            meta.last_modified,
            format!("s3://{}/{}", self.bucket, meta.location),
        )
    }

    async fn list_all(&self, key: &str) -> Result<Vec<ObjectMeta>> {
        let prefix = self.full_path(key);
        self.store
            .list(Some(&prefix))
            .try_collect()
            .await
            .map_err(|e| TrackfsError::storage(format!("S3 list failed for prefix {key}"), e))
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn name(&self) -> &'static str {
        "s3"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            atomic_create: true,
            listing: ListingConsistency::Eventual,
            rename: RenameSupport::OverwriteOnly,
        }
    }

    fn listing_accuracy(&self) -> Duration {
        self.listing_accuracy
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn exists(&self, key: &str) -> Result<bool> {
        if key.ends_with('/') {
            let listed = self
                .store
                .list_with_delimiter(Some(&self.full_path(key)))
                .await
                .map_err(|e| TrackfsError::storage(format!("S3 list failed for {key}"), e))?;
            return Ok(!listed.objects.is_empty() || !listed.common_prefixes.is_empty());
        }
        match self.store.head(&self.full_path(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(TrackfsError::storage(format!("S3 head failed for {key}"), e)),
        }
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn read(&self, key: &str) -> Result<Bytes> {
        let path = self.full_path(key);
        let result = self.store.get(&path).await.map_err(|e| match e {
            object_store::Error::NotFound { .. } => TrackfsError::NotFound {
                key: key.to_string(),
            },
            other => TrackfsError::storage(format!("S3 get failed for {key}"), other),
        })?;
        result
            .bytes()
            .await
            .map_err(|e| TrackfsError::storage(format!("S3 get bytes failed for {key}"), e))
    }

    #[instrument(skip(self, data), fields(key = %key, size = data.len()))]
    async fn write(&self, key: &str, data: Bytes, create_or_overwrite: bool) -> Result<()> {
        let path = self.full_path(key);
        if create_or_overwrite {
            self.store
                .put(&path, PutPayload::from(data))
                .await
                .map_err(|e| TrackfsError::storage(format!("S3 put failed for {key}"), e))?;
            return Ok(());
        }

        let opts = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };
        match self.store.put_opts(&path, PutPayload::from(data), opts).await {
            Ok(_) => Ok(()),
            // Some S3-compatible stores return Precondition instead of AlreadyExists
            Err(object_store::Error::AlreadyExists { .. })
            | Err(object_store::Error::Precondition { .. }) => Err(TrackfsError::AlreadyExists {
                key: key.to_string(),
            }),
            Err(e) => Err(TrackfsError::storage(
                format!("S3 conditional put failed for {key}"),
                e,
            )),
        }
    }

    async fn write_no_promise(&self, key: &str, data: Bytes) -> Result<()> {
        self.write(key, data, true).await
    }

    async fn mkdir(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key, recursive))]
    async fn delete(&self, key: &str, recursive: bool) -> Result<()> {
        if !recursive {
            // S3 delete is idempotent and does not error if key is missing
            return self
                .store
                .delete(&self.full_path(key))
                .await
                .map_err(|e| TrackfsError::storage(format!("S3 delete failed for {key}"), e));
        }

        let objects = self.list_all(key).await?;
        for meta in &objects {
            match self.store.delete(&meta.location).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => {
                    return Err(TrackfsError::storage(
                        format!("S3 delete failed for {}", meta.location),
                        e,
                    ))
                }
            }
        }
        debug!("Deleted {} objects under {}", objects.len(), key);
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key, recursive))]
    async fn list(&self, key: &str, recursive: bool) -> Result<Vec<StorageEntry>> {
        let objects = if recursive {
            self.list_all(key).await?
        } else {
            self.store
                .list_with_delimiter(Some(&self.full_path(key)))
                .await
                .map_err(|e| TrackfsError::storage(format!("S3 list failed for {key}"), e))?
                .objects
        };

        let mut results: Vec<StorageEntry> = objects.iter().map(|m| self.entry(m)).collect();
        results.sort_by(|a, b| a.absolute_path().cmp(b.absolute_path()));
        Ok(results)
    }

    #[instrument(skip(self), fields(src = %src, dst = %dst, overwrite))]
    async fn rename(&self, src: &str, dst: &str, overwrite: bool) -> Result<()> {
        if !overwrite {
            return Err(TrackfsError::Unsupported {
                operation: "rename without overwrite",
                backend: "s3",
            });
        }
        self.store
            .rename(&self.full_path(src), &self.full_path(dst))
            .await
            .map_err(|e| TrackfsError::storage(format!("S3 rename failed for {src}"), e))
    }
}

/// Parse an S3 URI into (bucket, prefix).
///
/// `s3://bucket/prefix/path` → `("bucket", "prefix/path")`
/// `s3://bucket` → `("bucket", "")`
fn parse_s3_uri(uri: &str) -> Result<(String, String)> {
    let stripped = uri
        .strip_prefix("s3://")
        .ok_or_else(|| TrackfsError::Config {
            message: format!("S3 URI must start with 's3://': {uri}"),
        })?;

    // Remove query string before parsing path
    let path_part = stripped.split('?').next().unwrap_or(stripped);

    let mut parts = path_part.splitn(2, '/');
    let bucket = parts.next().unwrap_or("").to_string();
    let prefix = parts.next().unwrap_or("").trim_matches('/').to_string();

    if bucket.is_empty() {
        return Err(TrackfsError::Config {
            message: format!("S3 URI must include a bucket name: {uri}"),
        });
    }

    Ok((bucket, prefix))
}

/// Extract a query parameter value from a URI.
fn extract_query_param(uri: &str, param: &str) -> Option<String> {
    let query = uri.split('?').nth(1)?;
    for pair in query.split('&') {
        let mut kv = pair.splitn(2, '=');
        if kv.next()? == param {
            return kv.next().map(|v| v.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_s3_uri_with_prefix() {
        let (bucket, prefix) = parse_s3_uri("s3://my-bucket/tables/orders/").unwrap();
        assert_eq!(bucket, "my-bucket");
        assert_eq!(prefix, "tables/orders");
    }

    #[test]
    fn test_parse_s3_uri_no_prefix() {
        let (bucket, prefix) = parse_s3_uri("s3://my-bucket").unwrap();
        assert_eq!(bucket, "my-bucket");
        assert_eq!(prefix, "");
    }

    #[test]
    fn test_parse_s3_uri_with_query() {
        let (bucket, prefix) = parse_s3_uri("s3://my-bucket/prefix?region=eu-west-1").unwrap();
        assert_eq!(bucket, "my-bucket");
        assert_eq!(prefix, "prefix");
    }

    #[test]
    fn test_parse_s3_uri_invalid() {
        assert!(parse_s3_uri("http://example.com").is_err());
        assert!(parse_s3_uri("s3://").is_err());
    }

    #[test]
    fn test_extract_query_param() {
        assert_eq!(
            extract_query_param("s3://bucket?region=us-east-1", "region"),
            Some("us-east-1".to_string())
        );
        assert_eq!(
            extract_query_param(
                "s3://bucket?region=us-east-1&listing_accuracy_ms=2500",
                "listing_accuracy_ms"
            ),
            Some("2500".to_string())
        );
        assert_eq!(extract_query_param("s3://bucket", "region"), None);
    }
}
