use crate::object_store::{
    ListPage, MD5_METADATA_KEY, Metadata, ObjectEntry, ObjectMeta, ObjectStore, md5_from_etag,
};
use crate::storage::StorageType;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    Delete, MetadataDirective, ObjectIdentifier, ServerSideEncryption, StorageClass,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use debpool_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub bucket: String,
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible services (MinIO, Ceph, ...).
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub path_style: bool,
    pub storage_class: Option<String>,
    pub server_side_encryption: Option<String>,
}

pub struct S3Store {
    client: Client,
    config: S3Config,
}

impl S3Store {
    pub async fn new(config: S3Config) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;

        let mut builder = S3ConfigBuilder::from(&sdk_config).force_path_style(config.path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            builder = builder.credentials_provider(Credentials::new(
                access_key, secret_key, None, None, "debpool",
            ));
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            config,
        })
    }

    pub async fn with_endpoint(bucket: String, endpoint: String) -> Result<Self> {
        Self::new(S3Config {
            bucket,
            endpoint: Some(endpoint),
            path_style: true,
            ..Default::default()
        })
        .await
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    /// Fails early when the bucket is missing or not accessible.
    pub async fn check_bucket(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.config.bucket)
            .send()
            .await
            .map_err(|e| {
                Error::Backend(format!(
                    "Bucket {} not accessible: {}",
                    self.config.bucket,
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }
}

fn backend_error(operation: &str, key: &str, e: impl std::error::Error) -> Error {
    Error::Backend(format!(
        "S3 {} {} failed: {}",
        operation,
        key,
        DisplayErrorContext(e)
    ))
}

/// `Content-MD5` header value: the raw digest, base64 encoded.
fn content_md5_header(md5_hex: &str) -> Option<String> {
    hex::decode(md5_hex)
        .ok()
        .filter(|raw| raw.len() == 16)
        .map(|raw| STANDARD.encode(raw))
}

fn copy_source(bucket: &str, key: &str) -> String {
    format!("{}/{}", bucket, urlencoding::encode(key))
}

#[async_trait]
impl ObjectStore for S3Store {
    fn storage_type(&self) -> StorageType {
        StorageType::S3
    }

    async fn put_object(&self, key: &str, data: Bytes, metadata: &Metadata) -> Result<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .set_metadata(Some(metadata.clone()))
            .body(ByteStream::from(data));

        // lets S3 reject a corrupted upload
        if let Some(header) = metadata
            .get(MD5_METADATA_KEY)
            .and_then(|md5| content_md5_header(md5))
        {
            request = request.content_md5(header);
        }
        if let Some(class) = &self.config.storage_class {
            request = request.storage_class(StorageClass::from(class.as_str()));
        }
        if let Some(sse) = &self.config.server_side_encryption {
            request = request.server_side_encryption(ServerSideEncryption::from(sse.as_str()));
        }

        request
            .send()
            .await
            .map_err(|e| backend_error("put", key, e))?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Bytes> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                return Err(Error::not_found(key));
            }
            Err(e) => return Err(backend_error("get", key, e)),
        };

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| Error::Backend(format!("Failed to read body of {}: {}", key, e)))?;
        Ok(data.into_bytes())
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectMeta>> {
        match self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => Ok(Some(ObjectMeta {
                size: response.content_length().unwrap_or(0).max(0) as u64,
                md5: response.e_tag().and_then(md5_from_etag),
                metadata: response.metadata().cloned().unwrap_or_default(),
            })),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(None),
            Err(e) => Err(backend_error("head", key, e)),
        }
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| backend_error("delete", key, e))?;
        Ok(())
    }

    async fn delete_objects(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let objects = keys
            .iter()
            .map(|key| ObjectIdentifier::builder().key(key).build())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::InvalidInput(e.to_string()))?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .map_err(|e| Error::InvalidInput(e.to_string()))?;

        let response = self
            .client
            .delete_objects()
            .bucket(&self.config.bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| backend_error("bulk delete", &keys[0], e))?;

        if let Some(failed) = response.errors().first() {
            return Err(Error::Backend(format!(
                "S3 bulk delete failed for {} of {} keys, first {}: {}",
                response.errors().len(),
                keys.len(),
                failed.key().unwrap_or_default(),
                failed.message().unwrap_or_default()
            )));
        }
        debug!(count = keys.len(), "Deleted S3 objects");
        Ok(())
    }

    async fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        marker: Option<&str>,
    ) -> Result<ListPage> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(&self.config.bucket)
            .prefix(prefix)
            .set_delimiter(delimiter.map(str::to_string))
            .set_continuation_token(marker.map(str::to_string))
            .send()
            .await
            .map_err(|e| backend_error("list", prefix, e))?;

        let objects = response
            .contents()
            .iter()
            .filter_map(|object| {
                Some(ObjectEntry {
                    key: object.key()?.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    md5: object.e_tag().and_then(md5_from_etag),
                })
            })
            .collect();
        let common_prefixes = response
            .common_prefixes()
            .iter()
            .filter_map(|p| p.prefix().map(str::to_string))
            .collect();
        let next_marker = if response.is_truncated().unwrap_or(false) {
            response.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        Ok(ListPage {
            objects,
            common_prefixes,
            next_marker,
        })
    }

    async fn copy_object(&self, src: &str, dst: &str, metadata: Option<&Metadata>) -> Result<()> {
        let mut request = self
            .client
            .copy_object()
            .bucket(&self.config.bucket)
            .copy_source(copy_source(&self.config.bucket, src))
            .key(dst);
        if let Some(metadata) = metadata {
            request = request
                .metadata_directive(MetadataDirective::Replace)
                .set_metadata(Some(metadata.clone()));
        }
        if let Some(class) = &self.config.storage_class {
            request = request.storage_class(StorageClass::from(class.as_str()));
        }

        match request.send().await {
            Ok(_) => Ok(()),
            Err(e)
                if e.as_service_error()
                    .is_some_and(|se| se.meta().code() == Some("NoSuchKey")) =>
            {
                Err(Error::not_found(src))
            }
            Err(e) => Err(backend_error("copy", src, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_md5_header() {
        // md5("hello")
        assert_eq!(
            content_md5_header("5d41402abc4b2a76b9719d911017c592").as_deref(),
            Some("XUFAKrxLKna5cZ2REBfFkg==")
        );
        assert_eq!(content_md5_header("not-hex"), None);
    }

    #[test]
    fn test_copy_source_is_encoded() {
        assert_eq!(
            copy_source("repo", "pool/main/g/g++/g++_1.0.deb"),
            "repo/pool%2Fmain%2Fg%2Fg%2B%2B%2Fg%2B%2B_1.0.deb"
        );
    }
}
