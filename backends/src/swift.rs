//! OpenStack Swift container as an object store, spoken over plain HTTP.

use crate::object_store::{
    ListPage, MD5_METADATA_KEY, Metadata, ObjectEntry, ObjectMeta, ObjectStore, md5_from_etag,
};
use crate::storage::StorageType;
use async_trait::async_trait;
use bytes::Bytes;
use debpool_core::{Error, Result};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, HeaderMap};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

const OBJECT_META_PREFIX: &str = "x-object-meta-";
const LIST_LIMIT: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwiftConfig {
    /// v1 auth endpoint, e.g. `https://swift.example.com/auth/v1.0`.
    pub auth_url: String,
    pub username: String,
    pub api_key: String,
    pub container: String,
}

#[derive(Debug)]
struct Session {
    storage_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListItem {
    Object {
        name: String,
        bytes: u64,
        hash: Option<String>,
    },
    Subdir {
        subdir: String,
    },
}

#[derive(Debug, Deserialize)]
struct BulkDeleteReport {
    #[serde(rename = "Errors", default)]
    errors: Vec<(String, String)>,
    #[serde(rename = "Response Status", default)]
    response_status: String,
}

pub struct SwiftStore {
    http: Client,
    config: SwiftConfig,
    session: Mutex<Option<Arc<Session>>>,
}

impl SwiftStore {
    pub fn new(config: SwiftConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("debpool/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Backend(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            config,
            session: Mutex::new(None),
        })
    }

    async fn session(&self, refresh: bool) -> Result<Arc<Session>> {
        let mut session = self.session.lock().await;
        if let Some(current) = session.as_ref().filter(|_| !refresh) {
            return Ok(current.clone());
        }

        let response = self
            .http
            .get(&self.config.auth_url)
            .header("X-Auth-User", &self.config.username)
            .header("X-Auth-Key", &self.config.api_key)
            .send()
            .await
            .map_err(request_error)?;
        if !response.status().is_success() {
            return Err(Error::Backend(format!(
                "Swift authentication failed: HTTP {}",
                response.status()
            )));
        }

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| Error::Backend(format!("Swift auth response lacks {}", name)))
        };
        let fresh = Arc::new(Session {
            storage_url: header("X-Storage-Url")?,
            token: header("X-Auth-Token")?,
        });
        debug!(storage_url = %fresh.storage_url, "Authenticated with Swift");
        *session = Some(fresh.clone());
        Ok(fresh)
    }

    /// Sends a request, authenticating again once if the token expired.
    async fn send<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&Session) -> RequestBuilder,
    {
        let session = self.session(false).await?;
        let response = build(&session)
            .header("X-Auth-Token", &session.token)
            .send()
            .await
            .map_err(request_error)?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let session = self.session(true).await?;
        build(&session)
            .header("X-Auth-Token", &session.token)
            .send()
            .await
            .map_err(request_error)
    }

    fn object_url(&self, session: &Session, key: &str) -> String {
        format!(
            "{}/{}/{}",
            session.storage_url.trim_end_matches('/'),
            urlencoding::encode(&self.config.container),
            encode_key(key)
        )
    }

    fn object_request(&self, method: Method, key: &str) -> impl Fn(&Session) -> RequestBuilder {
        move |session| self.http.request(method.clone(), self.object_url(session, key))
    }
}

fn request_error(e: reqwest::Error) -> Error {
    Error::Backend(format!("Swift request failed: {}", e))
}

fn status_error(operation: &str, key: &str, status: StatusCode) -> Error {
    Error::Backend(format!("Swift {} {} failed: HTTP {}", operation, key, status))
}

/// Percent-encodes each path segment, keeping the separators.
fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn metadata_from_headers(headers: &HeaderMap) -> Metadata {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(OBJECT_META_PREFIX)?;
            Some((key.to_string(), value.to_str().ok()?.to_string()))
        })
        .collect()
}

fn page_from_listing(items: Vec<ListItem>) -> ListPage {
    let full = items.len() >= LIST_LIMIT;
    let mut page = ListPage::default();
    let mut last = None;
    for item in items {
        match item {
            ListItem::Object { name, bytes, hash } => {
                last = Some(name.clone());
                page.objects.push(ObjectEntry {
                    key: name,
                    size: bytes,
                    md5: hash.as_deref().and_then(md5_from_etag),
                });
            }
            ListItem::Subdir { subdir } => {
                last = Some(subdir.clone());
                page.common_prefixes.push(subdir);
            }
        }
    }
    if full {
        page.next_marker = last;
    }
    page
}

#[async_trait]
impl ObjectStore for SwiftStore {
    fn storage_type(&self) -> StorageType {
        StorageType::Swift
    }

    async fn put_object(&self, key: &str, data: Bytes, metadata: &Metadata) -> Result<()> {
        let response = self
            .send(|session| {
                let mut request = self
                    .http
                    .put(self.object_url(session, key))
                    .body(data.clone());
                // Swift verifies the upload against the ETag
                if let Some(md5) = metadata.get(MD5_METADATA_KEY) {
                    request = request.header(ETAG, md5);
                }
                for (name, value) in metadata {
                    request = request.header(format!("{}{}", OBJECT_META_PREFIX, name), value);
                }
                request
            })
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::UNPROCESSABLE_ENTITY => Err(Error::ChecksumMismatch {
                path: key.to_string(),
                field: "md5",
                expected: metadata.get(MD5_METADATA_KEY).cloned().unwrap_or_default(),
                actual: "rejected by server".to_string(),
            }),
            status => Err(status_error("put", key, status)),
        }
    }

    async fn get_object(&self, key: &str) -> Result<Bytes> {
        let response = self.send(self.object_request(Method::GET, key)).await?;
        match response.status() {
            status if status.is_success() => response.bytes().await.map_err(request_error),
            StatusCode::NOT_FOUND => Err(Error::not_found(key)),
            status => Err(status_error("get", key, status)),
        }
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectMeta>> {
        let response = self.send(self.object_request(Method::HEAD, key)).await?;
        match response.status() {
            status if status.is_success() => {
                let headers = response.headers();
                let size = headers
                    .get(CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                let md5 = headers
                    .get(ETAG)
                    .and_then(|v| v.to_str().ok())
                    .and_then(md5_from_etag);
                Ok(Some(ObjectMeta {
                    size,
                    md5,
                    metadata: metadata_from_headers(headers),
                }))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(status_error("head", key, status)),
        }
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let response = self.send(self.object_request(Method::DELETE, key)).await?;
        match response.status() {
            status if status.is_success() || status == StatusCode::NOT_FOUND => Ok(()),
            status => Err(status_error("delete", key, status)),
        }
    }

    async fn delete_objects(&self, keys: &[String]) -> Result<()> {
        let container = urlencoding::encode(&self.config.container).into_owned();
        let body = keys
            .iter()
            .map(|key| format!("/{}/{}", container, encode_key(key)))
            .collect::<Vec<_>>()
            .join("\n");

        let response = self
            .send(|session| {
                self.http
                    .post(format!("{}?bulk-delete", session.storage_url.trim_end_matches('/')))
                    .header(CONTENT_TYPE, "text/plain")
                    .header("Accept", "application/json")
                    .body(body.clone())
            })
            .await?;
        match response.status() {
            // bulk middleware not installed
            StatusCode::NOT_FOUND | StatusCode::NOT_IMPLEMENTED | StatusCode::METHOD_NOT_ALLOWED => {
                return Err(Error::Unsupported {
                    backend: "swift",
                    operation: "bulk delete",
                });
            }
            status if !status.is_success() => {
                return Err(status_error("bulk delete", &container, status));
            }
            _ => {}
        }

        let report: BulkDeleteReport = response.json().await.map_err(request_error)?;
        if let Some((name, status)) = report.errors.first() {
            return Err(Error::Backend(format!(
                "Swift bulk delete failed for {} of {} objects ({}), first {}: {}",
                report.errors.len(),
                keys.len(),
                report.response_status,
                name,
                status
            )));
        }
        Ok(())
    }

    async fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        marker: Option<&str>,
    ) -> Result<ListPage> {
        let limit = LIST_LIMIT.to_string();
        let response = self
            .send(|session| {
                let mut query = vec![("format", "json"), ("prefix", prefix), ("limit", limit.as_str())];
                if let Some(delimiter) = delimiter {
                    query.push(("delimiter", delimiter));
                }
                if let Some(marker) = marker {
                    query.push(("marker", marker));
                }
                self.http
                    .get(format!(
                        "{}/{}",
                        session.storage_url.trim_end_matches('/'),
                        urlencoding::encode(&self.config.container)
                    ))
                    .query(&query)
            })
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(ListPage::default()),
            status if status.is_success() => {
                let items: Vec<ListItem> = response.json().await.map_err(request_error)?;
                Ok(page_from_listing(items))
            }
            status => Err(status_error("list", prefix, status)),
        }
    }

    async fn copy_object(&self, src: &str, dst: &str, metadata: Option<&Metadata>) -> Result<()> {
        let copy_from = format!(
            "/{}/{}",
            urlencoding::encode(&self.config.container),
            encode_key(src)
        );
        let response = self
            .send(|session| {
                let mut request = self
                    .http
                    .put(self.object_url(session, dst))
                    .header("X-Copy-From", &copy_from)
                    .header(CONTENT_LENGTH, 0);
                if let Some(metadata) = metadata {
                    request = request.header("X-Fresh-Metadata", "true");
                    for (name, value) in metadata {
                        request =
                            request.header(format!("{}{}", OBJECT_META_PREFIX, name), value);
                    }
                }
                request
            })
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(Error::not_found(src)),
            status => Err(status_error("copy", src, status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_encode_key_keeps_separators() {
        assert_eq!(
            encode_key("pool/main/g/g++/g++ 1.deb"),
            "pool/main/g/g%2B%2B/g%2B%2B%201.deb"
        );
    }

    #[test]
    fn test_metadata_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-object-meta-md5", HeaderValue::from_static("abc"));
        headers.insert("x-object-meta-symlink", HeaderValue::from_static("dists/a"));
        headers.insert("x-trans-id", HeaderValue::from_static("tx1"));

        let metadata = metadata_from_headers(&headers);
        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata["md5"], "abc");
        assert_eq!(metadata["symlink"], "dists/a");
    }

    #[test]
    fn test_page_from_listing() {
        let items: Vec<ListItem> = serde_json::from_str(
            r#"[
                {"name": "dists/Release", "bytes": 12, "hash": "5d41402abc4b2a76b9719d911017c592",
                 "last_modified": "2024-01-01T00:00:00", "content_type": "text/plain"},
                {"subdir": "pool/"}
            ]"#,
        )
        .unwrap();

        let page = page_from_listing(items);
        assert_eq!(page.objects.len(), 1);
        assert_eq!(page.objects[0].size, 12);
        assert_eq!(
            page.objects[0].md5.as_deref(),
            Some("5d41402abc4b2a76b9719d911017c592")
        );
        assert_eq!(page.common_prefixes, vec!["pool/"]);
        assert!(page.next_marker.is_none());
    }
}
