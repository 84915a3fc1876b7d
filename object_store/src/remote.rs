use crate::{
    range_header_value, Error, ErrorKind, ListPage, ObjectEntry, ObjectMeta, ObjectStore, Path,
    Result,
};
use async_trait::async_trait;
use backoff::{Backoff, BackoffConfig, RetryClass};
use bytes::Bytes;
use reqwest::{header, Method, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Configuration of the remote HTTP backend.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Base URL objects are addressed under, e.g. `https://host/bucket`.
    pub base_url: String,
    /// Optional bearer token attached to every request.
    pub token: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Retry policy for transient failures.
    pub backoff: BackoffConfig,
}

impl RemoteConfig {
    /// Config with default timeout and retry policy.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            timeout: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Path-addressed HTTP [`ObjectStore`].
///
/// Reads use inclusive `Range` headers (suffix form for negative starts);
/// conditional writes use `If-Match`/`If-None-Match` and surface `412` as
/// [`ErrorKind::ETagMismatch`]. Transient failures (connect/timeout, 429,
/// 502, 503, 504) retry with exponential backoff; everything else
/// surfaces immediately.
#[derive(Debug)]
pub struct RemoteHttpStore {
    config: RemoteConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    objects: Vec<ListObject>,
    #[serde(rename = "nextToken")]
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListObject {
    path: String,
    size: u64,
}

fn status_kind(status: StatusCode) -> ErrorKind {
    match status {
        StatusCode::NOT_FOUND => ErrorKind::NotFound,
        StatusCode::CONFLICT => ErrorKind::AlreadyExists,
        StatusCode::PRECONDITION_FAILED => ErrorKind::ETagMismatch,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorKind::PermissionDenied,
        StatusCode::PAYLOAD_TOO_LARGE | StatusCode::INSUFFICIENT_STORAGE => ErrorKind::Quota,
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => ErrorKind::Network,
        _ => ErrorKind::Unknown,
    }
}

fn classify(e: &Error) -> RetryClass {
    // only transport-level trouble is worth another attempt; 4xx and
    // precondition failures will not get better by retrying
    if e.kind() == ErrorKind::Network {
        RetryClass::Transient
    } else {
        RetryClass::Fatal
    }
}

impl RemoteHttpStore {
    /// Create a store talking to `config.base_url`.
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| {
                Error::new(ErrorKind::Network, None)
                    .with_context("building http client".into())
                    .with_source(e)
            })?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &Path) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, url);
        if let Some(token) = &self.config.token {
            req = req.bearer_auth(token);
        }
        req
    }

    async fn send(
        &self,
        path: &Path,
        build: impl Fn() -> reqwest::RequestBuilder + Send + Sync,
    ) -> Result<Response> {
        let path_str = path.as_str().to_string();
        Backoff::new(&self.config.backoff)
            .retry_classified(
                "remote_object_store",
                || {
                    let req = build();
                    let path_str = path_str.clone();
                    async move {
                        let response = req.send().await.map_err(|e| {
                            Error::new(ErrorKind::Network, Some(path_str.clone())).with_source(e)
                        })?;
                        let status = response.status();
                        if status.is_success() {
                            Ok(response)
                        } else {
                            Err(Error::new(status_kind(status), Some(path_str))
                                .with_context(format!("http status {status}")))
                        }
                    }
                },
                classify,
            )
            .await
    }

    fn response_etag(response: &Response) -> Option<String> {
        response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim_matches('"').to_string())
    }
}

#[async_trait]
impl ObjectStore for RemoteHttpStore {
    async fn read(&self, path: &Path) -> Result<Bytes> {
        let url = self.url(path);
        let response = self.send(path, || self.request(Method::GET, &url)).await?;
        response
            .bytes()
            .await
            .map_err(|e| Error::new(ErrorKind::Network, Some(path.as_str().into())).with_source(e))
    }

    async fn read_range(&self, path: &Path, start: i64, end: i64) -> Result<Bytes> {
        let url = self.url(path);
        let range = range_header_value(start, end);
        debug!(path = %path, %range, "remote range read");
        let response = self
            .send(path, || {
                self.request(Method::GET, &url).header(header::RANGE, &range)
            })
            .await?;
        response
            .bytes()
            .await
            .map_err(|e| Error::new(ErrorKind::Network, Some(path.as_str().into())).with_source(e))
    }

    async fn stat(&self, path: &Path) -> Result<ObjectMeta> {
        let url = self.url(path);
        let response = self.send(path, || self.request(Method::HEAD, &url)).await?;

        let size = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let mtime = response
            .headers()
            .get(header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| chrono::DateTime::parse_from_rfc2822(s).ok())
            .map(|dt| dt.timestamp_millis())
            .unwrap_or(0);

        Ok(ObjectMeta {
            size,
            mtime,
            etag: Self::response_etag(&response),
        })
    }

    async fn list(&self, prefix: &Path, token: Option<String>) -> Result<ListPage> {
        let mut url = format!("{}?list=1", self.url(prefix));
        if let Some(token) = &token {
            url.push_str(&format!("&token={token}"));
        }
        let response = self.send(prefix, || self.request(Method::GET, &url)).await?;
        let body: ListResponse = response.json().await.map_err(|e| {
            Error::new(ErrorKind::Network, Some(prefix.as_str().into())).with_source(e)
        })?;

        let mut objects = Vec::with_capacity(body.objects.len());
        for o in body.objects {
            objects.push(ObjectEntry {
                path: Path::parse(&o.path)?,
                size: o.size,
            });
        }
        Ok(ListPage {
            objects,
            next_token: body.next_token,
        })
    }

    async fn write(&self, path: &Path, bytes: Bytes) -> Result<()> {
        let url = self.url(path);
        self.send(path, || {
            self.request(Method::PUT, &url).body(bytes.clone())
        })
        .await?;
        Ok(())
    }

    async fn write_atomic(&self, path: &Path, bytes: Bytes) -> Result<()> {
        // HTTP PUT is atomic at the object level by contract
        self.write(path, bytes).await
    }

    async fn write_conditional(
        &self,
        path: &Path,
        bytes: Bytes,
        if_match: Option<&str>,
    ) -> Result<String> {
        let url = self.url(path);
        let response = self
            .send(path, || {
                let req = self.request(Method::PUT, &url).body(bytes.clone());
                match if_match {
                    Some(etag) => req.header(header::IF_MATCH, format!("\"{etag}\"")),
                    None => req.header(header::IF_NONE_MATCH, "*"),
                }
            })
            .await
            .map_err(|e| {
                // If-None-Match: * failing means the object already exists
                if if_match.is_none() && e.is_precondition_failed() {
                    Error::new(ErrorKind::AlreadyExists, Some(path.as_str().into()))
                } else {
                    e
                }
            })?;

        Ok(Self::response_etag(&response).unwrap_or_default())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let url = self.url(path);
        self.send(path, || self.request(Method::DELETE, &url)).await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &Path) -> Result<usize> {
        let entries = self.list_all(prefix).await?;
        let n = entries.len();
        for entry in entries {
            self.delete(&entry.path).await?;
        }
        Ok(n)
    }

    async fn mkdir(&self, _path: &Path) -> Result<()> {
        // flat keyspace; directories are implicit
        Ok(())
    }

    async fn rmdir(&self, path: &Path) -> Result<()> {
        let page = self.list(path, None).await?;
        if !page.objects.is_empty() {
            return Err(Error::new(
                ErrorKind::DirectoryNotEmpty,
                Some(path.as_str().into()),
            ));
        }
        Ok(())
    }

    fn type_name(&self) -> &'static str {
        "remote"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(status_kind(StatusCode::NOT_FOUND), ErrorKind::NotFound);
        assert_eq!(
            status_kind(StatusCode::PRECONDITION_FAILED),
            ErrorKind::ETagMismatch
        );
        assert_eq!(status_kind(StatusCode::FORBIDDEN), ErrorKind::PermissionDenied);
        // retryable service pressure maps to the transient class
        for status in [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ] {
            assert_eq!(status_kind(status), ErrorKind::Network);
        }
        assert_eq!(status_kind(StatusCode::IM_A_TEAPOT), ErrorKind::Unknown);
    }

    #[test]
    fn only_network_errors_retry() {
        let transient = Error::new(ErrorKind::Network, None);
        let fatal = Error::new(ErrorKind::ETagMismatch, None);
        assert_eq!(classify(&transient), RetryClass::Transient);
        assert_eq!(classify(&fatal), RetryClass::Fatal);
        assert_eq!(
            classify(&Error::new(ErrorKind::NotFound, None)),
            RetryClass::Fatal
        );
    }
}
