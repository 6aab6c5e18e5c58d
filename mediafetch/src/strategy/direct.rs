//! Plain streamed download of an already-known media URL.

use std::path::Path;
use std::sync::Arc;

use super::{BoxFuture, HttpTransport, MediaMetadata, SourceStrategy};
use crate::error::FetchError;
use crate::model::ProgressReporter;
use crate::proxy::ProxyRotator;

/// Streams a direct media URL to disk with byte-range resume.
///
/// Optionally routes through the proxy pool, reporting each outcome back to
/// the rotator.
#[derive(Debug)]
pub struct DirectCdnFetch {
    name: String,
    transport: Arc<HttpTransport>,
    proxies: Option<Arc<ProxyRotator>>,
}

impl DirectCdnFetch {
    pub fn new(transport: Arc<HttpTransport>) -> Self {
        Self {
            name: "direct".to_string(),
            transport,
            proxies: None,
        }
    }

    /// Route downloads through the proxy pool.
    pub fn with_proxies(mut self, proxies: Arc<ProxyRotator>) -> Self {
        self.proxies = Some(proxies);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    async fn download(&self, url: &str, dest: &Path, progress: &ProgressReporter) -> Result<u64, FetchError> {
        validate_http_url(url)?;

        let proxy = self.proxies.as_ref().and_then(|p| p.select());
        let result = self
            .transport
            .stream_to_file(url, dest, proxy.as_deref(), &[], progress)
            .await;

        if let (Some(rotator), Some(proxy)) = (&self.proxies, &proxy) {
            rotator.report_result(proxy, &result);
        }
        result
    }
}

/// Rejects anything that is not an absolute http(s) URL.
pub(crate) fn validate_http_url(url: &str) -> Result<url::Url, FetchError> {
    let parsed = url::Url::parse(url).map_err(|e| FetchError::InvalidUrl(format!("{}: {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(FetchError::InvalidUrl(format!(
            "unsupported scheme '{}' in {}",
            other, url
        ))),
    }
}

impl SourceStrategy for DirectCdnFetch {
    fn name(&self) -> &str {
        &self.name
    }

    fn extract_metadata<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<MediaMetadata, FetchError>> {
        Box::pin(async move {
            let parsed = validate_http_url(url)?;
            let title = parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string());
            Ok(MediaMetadata {
                title,
                media_url: Some(url.to_string()),
                ..Default::default()
            })
        })
    }

    fn fetch<'a>(
        &'a self,
        url: &'a str,
        dest: &'a Path,
        progress: &'a ProgressReporter,
    ) -> BoxFuture<'a, Result<u64, FetchError>> {
        Box::pin(self.download(url, dest, progress))
    }
}
