use crate::object_store::{
    ListPage, Lease, Metadata, ObjectEntry, ObjectMeta, ObjectStore, is_md5_hex,
};
use crate::storage::StorageType;
use async_trait::async_trait;
use azure_core::StatusCode;
use azure_core::request_options::{LeaseId, Metadata as AzureMetadata, NextMarker};
use azure_identity::{ClientSecretCredential, DefaultAzureCredential, TokenCredentialOptions};
use azure_storage::{ConnectionString, StorageCredentials};
use azure_storage_blobs::blob::CopyStatus;
use azure_storage_blobs::container::operations::BlobItem;
use azure_storage_blobs::prelude::{BlobClient, BlobServiceClient, ContainerClient};
use bytes::Bytes;
use dashmap::DashMap;
use debpool_core::{Error, Result};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const LEASE_DURATION: Duration = Duration::from_secs(60);
const COPY_POLL_INTERVAL: Duration = Duration::from_millis(200);
const COPY_POLL_ATTEMPTS: u32 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AzureAuthMethod {
    ConnectionString {
        connection_string: String,
    },
    SasToken {
        account_name: String,
        sas_token: String,
    },
    /// Picks up the environment's identity (managed identity, workload
    /// identity, `AZURE_CLIENT_ID`/`AZURE_CLIENT_SECRET`, Azure CLI).
    ManagedIdentity {
        account_name: String,
    },
    ServicePrincipal {
        account_name: String,
        client_id: String,
        client_secret: String,
        tenant_id: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureConfig {
    #[serde(flatten)]
    pub auth: AzureAuthMethod,
    pub container: String,
}

/// Azure Blob Storage container as an object store. Supports leases, which
/// keep a renamed blob from being replaced while it is copied.
pub struct AzureStore {
    container: ContainerClient,
    leases: DashMap<String, LeaseId>,
}

impl AzureStore {
    pub async fn new(config: AzureConfig) -> Result<Self> {
        let credentials = create_credentials(&config.auth)?;
        let client = BlobServiceClient::new(extract_account_name(&config.auth), credentials);
        Ok(Self {
            container: client.container_client(&config.container),
            leases: DashMap::new(),
        })
    }

    pub async fn with_connection_string(
        connection_string: String,
        container: String,
    ) -> Result<Self> {
        Self::new(AzureConfig {
            auth: AzureAuthMethod::ConnectionString { connection_string },
            container,
        })
        .await
    }

    fn blob_client(&self, key: &str) -> BlobClient {
        self.container.blob_client(key)
    }

    /// Waits for an asynchronous server-side copy to settle.
    async fn wait_for_copy(&self, dst: &str) -> Result<()> {
        let blob = self.blob_client(dst);
        for _ in 0..COPY_POLL_ATTEMPTS {
            let properties = blob
                .get_properties()
                .await
                .map_err(|e| backend_error("get properties", dst, e))?;
            match properties.blob.properties.copy_status {
                None | Some(CopyStatus::Success) => return Ok(()),
                Some(CopyStatus::Pending) => tokio::time::sleep(COPY_POLL_INTERVAL).await,
                Some(status) => {
                    return Err(Error::Backend(format!(
                        "Azure copy to {} ended with status {:?}",
                        dst, status
                    )));
                }
            }
        }
        Err(Error::Backend(format!("Azure copy to {} timed out", dst)))
    }
}

fn create_credentials(auth: &AzureAuthMethod) -> Result<StorageCredentials> {
    match auth {
        AzureAuthMethod::ConnectionString { connection_string } => {
            ConnectionString::new(connection_string)
                .and_then(|parsed| parsed.storage_credentials())
                .map_err(|e| Error::Backend(format!("Invalid connection string: {}", e)))
        }
        AzureAuthMethod::SasToken { sas_token, .. } => StorageCredentials::sas_token(sas_token)
            .map_err(|e| Error::Backend(format!("Invalid SAS token: {}", e))),
        AzureAuthMethod::ManagedIdentity { .. } => {
            let credential = DefaultAzureCredential::create(TokenCredentialOptions::default())
                .map_err(|e| Error::Backend(format!("Azure identity unavailable: {}", e)))?;
            Ok(StorageCredentials::token_credential(Arc::new(credential)))
        }
        AzureAuthMethod::ServicePrincipal {
            client_id,
            client_secret,
            tenant_id,
            ..
        } => {
            let options = TokenCredentialOptions::default();
            let authority_host = options
                .authority_host()
                .map_err(|e| Error::Backend(format!("Invalid Azure authority host: {}", e)))?;
            let credential = ClientSecretCredential::new(
                options.http_client(),
                authority_host,
                tenant_id.clone(),
                client_id.clone(),
                client_secret.clone(),
            );
            Ok(StorageCredentials::token_credential(Arc::new(credential)))
        }
    }
}

fn extract_account_name(auth: &AzureAuthMethod) -> String {
    match auth {
        AzureAuthMethod::ConnectionString { connection_string } => connection_string
            .split(';')
            .find_map(|part| part.strip_prefix("AccountName="))
            .unwrap_or("unknown")
            .to_string(),
        AzureAuthMethod::SasToken { account_name, .. }
        | AzureAuthMethod::ManagedIdentity { account_name, .. }
        | AzureAuthMethod::ServicePrincipal { account_name, .. } => account_name.clone(),
    }
}

fn is_not_found(e: &azure_core::Error) -> bool {
    e.as_http_error()
        .is_some_and(|http| http.status() == StatusCode::NotFound)
}

fn backend_error(operation: &str, key: &str, e: azure_core::Error) -> Error {
    Error::Backend(format!("Azure {} {} failed: {}", operation, key, e))
}

fn to_azure_metadata(metadata: &Metadata) -> AzureMetadata {
    let mut converted = AzureMetadata::new();
    for (key, value) in metadata {
        converted.insert(key.clone(), value.clone());
    }
    converted
}

fn lease_key(lease: &Lease) -> String {
    format!("{}\n{}", lease.key, lease.id)
}

#[async_trait]
impl ObjectStore for AzureStore {
    fn storage_type(&self) -> StorageType {
        StorageType::Azure
    }

    async fn put_object(&self, key: &str, data: Bytes, metadata: &Metadata) -> Result<()> {
        self.blob_client(key)
            .put_block_blob(data)
            .metadata(to_azure_metadata(metadata))
            .await
            .map_err(|e| backend_error("put", key, e))?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Bytes> {
        match self.blob_client(key).get_content().await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if is_not_found(&e) => Err(Error::not_found(key)),
            Err(e) => Err(backend_error("get", key, e)),
        }
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectMeta>> {
        match self.blob_client(key).get_properties().await {
            Ok(response) => {
                let blob = response.blob;
                Ok(Some(ObjectMeta {
                    size: blob.properties.content_length,
                    md5: blob
                        .properties
                        .content_md5
                        .map(|md5| hex::encode(md5.bytes()))
                        .filter(|md5| is_md5_hex(md5)),
                    metadata: blob.metadata.unwrap_or_default(),
                }))
            }
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(backend_error("head", key, e)),
        }
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        match self.blob_client(key).delete().await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(backend_error("delete", key, e)),
        }
    }

    async fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        marker: Option<&str>,
    ) -> Result<ListPage> {
        let mut request = self.container.list_blobs().prefix(prefix.to_string());
        if let Some(delimiter) = delimiter {
            request = request.delimiter(delimiter.to_string());
        }
        if let Some(marker) = marker {
            request = request.marker(NextMarker::new(marker.to_string()));
        }

        let mut stream = request.into_stream();
        let Some(response) = stream.next().await else {
            return Ok(ListPage::default());
        };
        let response = response.map_err(|e| backend_error("list", prefix, e))?;

        let mut page = ListPage {
            next_marker: response
                .next_marker
                .as_ref()
                .map(|marker| marker.as_str().to_string()),
            ..Default::default()
        };
        for item in response.blobs.items {
            match item {
                BlobItem::Blob(blob) => page.objects.push(ObjectEntry {
                    key: blob.name,
                    size: blob.properties.content_length,
                    md5: blob
                        .properties
                        .content_md5
                        .map(|md5| hex::encode(md5.bytes())),
                }),
                BlobItem::BlobPrefix(prefix) => page.common_prefixes.push(prefix.name),
            }
        }
        Ok(page)
    }

    async fn copy_object(&self, src: &str, dst: &str, metadata: Option<&Metadata>) -> Result<()> {
        let source_url = self
            .blob_client(src)
            .url()
            .map_err(|e| backend_error("resolve url", src, e))?;

        let mut request = self.blob_client(dst).copy(source_url);
        if let Some(metadata) = metadata {
            request = request.metadata(to_azure_metadata(metadata));
        }
        match request.await {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => return Err(Error::not_found(src)),
            Err(e) => return Err(backend_error("copy", src, e)),
        }
        self.wait_for_copy(dst).await
    }

    async fn acquire_lease(&self, key: &str) -> Result<Option<Lease>> {
        let response = match self.blob_client(key).acquire_lease(LEASE_DURATION).await {
            Ok(response) => response,
            Err(e) if is_not_found(&e) => return Err(Error::not_found(key)),
            Err(e) => return Err(backend_error("acquire lease", key, e)),
        };
        let lease = Lease {
            key: key.to_string(),
            id: response.lease_id.to_string(),
        };
        self.leases.insert(lease_key(&lease), response.lease_id);
        debug!(key, "Acquired blob lease");
        Ok(Some(lease))
    }

    async fn release_lease(&self, lease: &Lease) -> Result<()> {
        let Some((_, lease_id)) = self.leases.remove(&lease_key(lease)) else {
            warn!(key = %lease.key, "Releasing a lease this store did not acquire");
            return Ok(());
        };
        self.blob_client(&lease.key)
            .blob_lease_client(lease_id)
            .release()
            .await
            .map_err(|e| backend_error("release lease", &lease.key, e))?;
        Ok(())
    }
}
