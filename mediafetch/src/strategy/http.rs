//! Async HTTP transport shared by the scraping and CDN strategies.
//!
//! This module provides:
//! - Direct and proxied `reqwest` clients (proxied clients cached per endpoint)
//! - Page fetches and JSON API calls with status classification
//! - Streamed downloads with Range resume, free-space precheck and
//!   Content-Length verification

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, RANGE, SET_COOKIE};
use reqwest::{Client, RequestBuilder, StatusCode};
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::error::{ErrorClass, FetchError};
use crate::model::ProgressReporter;
use crate::proxy::ProxyEndpoint;

/// Browser-like user agent; several platforms refuse obvious bots.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Default TCP/TLS connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;

/// Default timeout for page and API calls in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default number of Range resumes within one stream.
pub const DEFAULT_MAX_RESUMES: u32 = 2;

/// Free space required relative to the announced payload.
pub const DEFAULT_MIN_FREE_SPACE_RATIO: f64 = 1.2;

/// Buffer size for writing streamed bodies (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Configuration for [`HttpTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    pub user_agent: String,
    pub connect_timeout: Duration,
    /// Whole-request timeout for pages and API calls; streams are bounded by
    /// the orchestrator's attempt timeout instead.
    pub request_timeout: Duration,
    pub max_resumes: u32,
    pub min_free_space_ratio: f64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_resumes: DEFAULT_MAX_RESUMES,
            min_free_space_ratio: DEFAULT_MIN_FREE_SPACE_RATIO,
        }
    }
}

/// Reports free space on the volume holding a directory.
pub trait SpaceProbe: Send + Sync {
    /// Bytes available to unprivileged writers, `None` when unknown.
    fn available_bytes(&self, dir: &Path) -> Option<u64>;
}

/// [`SpaceProbe`] backed by `statvfs(3)`; reports unknown on other platforms.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatvfsProbe;

#[cfg(unix)]
impl SpaceProbe for StatvfsProbe {
    #[allow(clippy::unnecessary_cast)]
    fn available_bytes(&self, dir: &Path) -> Option<u64> {
        use std::os::unix::ffi::OsStrExt;

        let path = std::ffi::CString::new(dir.as_os_str().as_bytes()).ok()?;
        // SAFETY: `path` is a valid NUL-terminated string and `stat` is a
        // plain C struct fully written by statvfs on success.
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(path.as_ptr(), &mut stat) };
        if rc != 0 {
            return None;
        }
        Some((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
    }
}

#[cfg(not(unix))]
impl SpaceProbe for StatvfsProbe {
    fn available_bytes(&self, _dir: &Path) -> Option<u64> {
        None
    }
}

/// A fetched HTML/text page.
#[derive(Debug, Clone)]
pub struct PageResponse {
    /// URL after redirects.
    pub final_url: String,
    pub body: String,
    /// `name=value` pairs from `Set-Cookie` headers.
    pub cookies: Vec<(String, String)>,
}

impl PageResponse {
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// HTTP client pool with optional proxy routing.
pub struct HttpTransport {
    config: TransportConfig,
    direct: Client,
    proxied: DashMap<String, Client>,
    space: Arc<dyn SpaceProbe>,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("config", &self.config)
            .field("proxied_clients", &self.proxied.len())
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> Result<Self, FetchError> {
        let direct = build_client(&config, None)?;
        Ok(Self {
            config,
            direct,
            proxied: DashMap::new(),
            space: Arc::new(StatvfsProbe),
        })
    }

    /// Replace the free-space probe.
    pub fn with_space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.space = probe;
        self
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Client routed through `proxy`, or the direct client.
    pub fn client(&self, proxy: Option<&ProxyEndpoint>) -> Result<Client, FetchError> {
        let Some(proxy) = proxy else {
            return Ok(self.direct.clone());
        };
        let key = proxy.to_url();
        if let Some(client) = self.proxied.get(&key) {
            return Ok(client.clone());
        }
        let client = build_client(&self.config, Some(proxy))?;
        self.proxied.insert(key, client.clone());
        Ok(client)
    }

    /// GETs a text page, following redirects.
    pub async fn get_page(
        &self,
        url: &str,
        proxy: Option<&ProxyEndpoint>,
        headers: &[(&str, &str)],
    ) -> Result<PageResponse, FetchError> {
        let client = self.client(proxy)?;
        let request = with_headers(client.get(url), headers).timeout(self.config.request_timeout);
        let response = request.send().await?;
        check_status(response.status(), url)?;

        let final_url = response.url().to_string();
        let cookies = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(parse_set_cookie)
            .collect();
        let body = response.text().await?;

        Ok(PageResponse {
            final_url,
            body,
            cookies,
        })
    }

    /// POSTs a JSON body and parses a JSON answer.
    pub async fn post_json(
        &self,
        url: &str,
        proxy: Option<&ProxyEndpoint>,
        body: &serde_json::Value,
        headers: &[(&str, &str)],
    ) -> Result<serde_json::Value, FetchError> {
        let client = self.client(proxy)?;
        let request = with_headers(client.post(url), headers)
            .header("Accept", "application/json")
            .json(body)
            .timeout(self.config.request_timeout);
        let response = request.send().await?;
        check_status(response.status(), url)?;

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            FetchError::UnsupportedContent(format!("invalid JSON from {}: {}", url, e))
        })
    }

    /// Streams `url` into `dest`.
    ///
    /// Resumes with `Range: bytes=N-` from whatever `dest` already holds,
    /// both for a pre-existing partial file and after a transient failure
    /// mid-stream (up to `max_resumes` times). Only a stream that delivered
    /// bytes is resumed; a failure before the first byte is returned so the
    /// caller's retry policy sees it. A 200 answer to a ranged request
    /// restarts from zero.
    ///
    /// On error the file is truncated to zero length, so a failed call never
    /// leaves a non-empty partial file behind. Deleting it is left to the
    /// file lifecycle manager.
    pub async fn stream_to_file(
        &self,
        url: &str,
        dest: &Path,
        proxy: Option<&ProxyEndpoint>,
        headers: &[(&str, &str)],
        progress: &ProgressReporter,
    ) -> Result<u64, FetchError> {
        let client = self.client(proxy)?;
        let mut resumes = 0;

        loop {
            let offset = existing_len(dest).await;
            let result = self
                .stream_once(&client, url, dest, offset, headers, progress)
                .await;
            let reached = existing_len(dest).await;
            match result {
                Ok(size) => return Ok(size),
                Err(e)
                    if e.class() == ErrorClass::Retryable
                        && reached > offset
                        && resumes < self.config.max_resumes =>
                {
                    resumes += 1;
                    let offset = reached;
                    tracing::warn!(
                        url,
                        resume = resumes,
                        offset,
                        error = %e,
                        "Stream interrupted, resuming"
                    );
                }
                Err(e) => {
                    truncate_partial(dest).await;
                    return Err(e);
                }
            }
        }
    }

    async fn stream_once(
        &self,
        client: &Client,
        url: &str,
        dest: &Path,
        offset: u64,
        headers: &[(&str, &str)],
        progress: &ProgressReporter,
    ) -> Result<u64, FetchError> {
        let mut request = with_headers(client.get(url), headers);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }
        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            truncate_partial(dest).await;
            return Err(FetchError::NetworkTransient(format!(
                "range {}- not satisfiable for {}, restarting",
                offset, url
            )));
        }
        check_status(status, url)?;

        if let Some(content_type) = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            let content_type = content_type.to_ascii_lowercase();
            if is_document_type(&content_type) {
                return Err(FetchError::UnsupportedContent(format!(
                    "{} served {} instead of media",
                    url, content_type
                )));
            }
        }

        let resuming = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
        let start = if resuming { offset } else { 0 };
        let body_len = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        let expected_total = body_len.map(|len| start + len);

        if let Some(len) = body_len {
            self.ensure_space(dest, len)?;
        }

        let file = if resuming {
            tokio::fs::OpenOptions::new().append(true).open(dest).await
        } else {
            tokio::fs::File::create(dest).await
        }
        .map_err(map_write_error)?;
        let mut writer = BufWriter::with_capacity(BUFFER_SIZE, file);

        let mut written = start;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            writer.write_all(&chunk).await.map_err(map_write_error)?;
            written += chunk.len() as u64;
            progress.report(written, expected_total);
        }
        writer.flush().await.map_err(map_write_error)?;

        if written == 0 {
            return Err(FetchError::NetworkTransient(format!("{} returned an empty body", url)));
        }
        if let Some(expected) = expected_total {
            if written < expected {
                return Err(FetchError::Truncated {
                    expected,
                    actual: written,
                });
            }
        }
        Ok(written)
    }

    fn ensure_space(&self, dest: &Path, needed: u64) -> Result<(), FetchError> {
        let dir = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let Some(available) = self.space.available_bytes(dir) else {
            return Ok(());
        };
        let required = (needed as f64 * self.config.min_free_space_ratio) as u64;
        if available < required {
            return Err(FetchError::ResourceExhausted(format!(
                "need {} bytes free in {}, only {} available",
                required,
                dir.display(),
                available
            )));
        }
        Ok(())
    }
}

fn build_client(config: &TransportConfig, proxy: Option<&ProxyEndpoint>) -> Result<Client, FetchError> {
    let mut builder = Client::builder()
        .user_agent(config.user_agent.clone())
        .connect_timeout(config.connect_timeout);
    if let Some(proxy) = proxy {
        builder = builder.proxy(proxy.to_reqwest_proxy()?);
    }
    builder
        .build()
        .map_err(|e| FetchError::NetworkTransient(format!("failed to build HTTP client: {}", e)))
}

fn with_headers(mut request: RequestBuilder, headers: &[(&str, &str)]) -> RequestBuilder {
    for (name, value) in headers {
        request = request.header(*name, *value);
    }
    request
}

fn check_status(status: StatusCode, url: &str) -> Result<(), FetchError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(FetchError::from_status(status.as_u16(), url))
    }
}

fn parse_set_cookie(header: &str) -> Option<(String, String)> {
    let pair = header.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    Some((name.trim().to_string(), value.trim().to_string()))
}

/// Content types that carry a page or API document rather than media:
/// every `text/*` type plus JSON and XML documents.
fn is_document_type(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    essence.starts_with("text/")
        || matches!(essence, "application/json" | "application/xml" | "application/xhtml+xml")
        || essence.ends_with("+json")
        || essence.ends_with("+xml")
}

fn map_write_error(e: io::Error) -> FetchError {
    #[cfg(unix)]
    if e.raw_os_error() == Some(libc::ENOSPC) {
        return FetchError::ResourceExhausted("no space left on device".to_string());
    }
    FetchError::Io(e)
}

async fn existing_len(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

async fn truncate_partial(path: &Path) {
    if let Ok(file) = tokio::fs::OpenOptions::new().write(true).open(path).await {
        if let Err(e) = file.set_len(0).await {
            tracing::warn!(path = %path.display(), error = %e, "Failed to truncate partial file");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Probe reporting a fixed amount of free space.
    pub(crate) struct FixedSpace(pub Option<u64>);

    impl SpaceProbe for FixedSpace {
        fn available_bytes(&self, _dir: &Path) -> Option<u64> {
            self.0
        }
    }

    pub(crate) fn transport() -> HttpTransport {
        HttpTransport::new(TransportConfig::default())
            .unwrap()
            .with_space_probe(Arc::new(FixedSpace(None)))
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_stream_writes_full_body() {
        let server = MockServer::start().await;
        let body = payload(200_000);
        Mock::given(method("GET"))
            .and(path("/video.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");
        let size = transport()
            .stream_to_file(
                &format!("{}/video.mp4", server.uri()),
                &dest,
                None,
                &[],
                &ProgressReporter::silent(),
            )
            .await
            .unwrap();

        assert_eq!(size, 200_000);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
    }

    #[tokio::test]
    async fn test_stream_resumes_existing_partial_file() {
        let server = MockServer::start().await;
        let body = payload(1000);
        Mock::given(method("GET"))
            .and(path("/video.mp4"))
            .and(header("range", "bytes=400-"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(body[400..].to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");
        std::fs::write(&dest, &body[..400]).unwrap();

        let size = transport()
            .stream_to_file(
                &format!("{}/video.mp4", server.uri()),
                &dest,
                None,
                &[],
                &ProgressReporter::silent(),
            )
            .await
            .unwrap();

        assert_eq!(size, 1000);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
    }

    #[tokio::test]
    async fn test_full_response_to_range_request_restarts() {
        let server = MockServer::start().await;
        let body = payload(500);
        Mock::given(method("GET"))
            .and(path("/video.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");
        std::fs::write(&dest, b"stale-prefix").unwrap();

        let size = transport()
            .stream_to_file(
                &format!("{}/video.mp4", server.uri()),
                &dest,
                None,
                &[],
                &ProgressReporter::silent(),
            )
            .await
            .unwrap();

        assert_eq!(size, 500);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
    }

    #[tokio::test]
    async fn test_not_found_is_terminal_and_leaves_no_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");
        let err = transport()
            .stream_to_file(&server.uri(), &dest, None, &[], &ProgressReporter::silent())
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::NotFound(_)));
        assert_eq!(existing_len(&dest).await, 0);
    }

    async fn stream_typed_body(content_type: &str, body: &str) -> (Result<u64, FetchError>, u64) {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body.as_bytes().to_vec(), content_type))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");
        let result = transport()
            .stream_to_file(&server.uri(), &dest, None, &[], &ProgressReporter::silent())
            .await;
        (result, existing_len(&dest).await)
    }

    #[tokio::test]
    async fn test_html_body_is_unsupported_content() {
        let (result, written) =
            stream_typed_body("text/html; charset=utf-8", "<html>login required</html>").await;

        let err = result.unwrap_err();
        assert!(matches!(err, FetchError::UnsupportedContent(_)));
        assert_eq!(err.class(), crate::error::ErrorClass::Terminal);
        assert_eq!(written, 0);
    }

    #[tokio::test]
    async fn test_plain_text_body_is_unsupported_content() {
        let (result, written) = stream_typed_body("text/plain", "Please log in to continue.").await;

        assert!(matches!(result, Err(FetchError::UnsupportedContent(_))));
        assert_eq!(written, 0);
    }

    #[tokio::test]
    async fn test_xml_error_body_is_unsupported_content() {
        let (result, _) = stream_typed_body("application/xml", "<Error>AccessDenied</Error>").await;

        assert!(matches!(result, Err(FetchError::UnsupportedContent(_))));
    }

    #[test]
    fn test_document_types() {
        assert!(is_document_type("text/plain"));
        assert!(is_document_type("text/html; charset=utf-8"));
        assert!(is_document_type("application/json"));
        assert!(is_document_type("application/problem+json"));
        assert!(is_document_type("application/xml"));
        assert!(!is_document_type("video/mp4"));
        assert!(!is_document_type("application/octet-stream"));
        assert!(!is_document_type("application/vnd.apple.mpegurl"));
    }

    #[tokio::test]
    async fn test_insufficient_space_is_resource_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(1000)))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(TransportConfig::default())
            .unwrap()
            .with_space_probe(Arc::new(FixedSpace(Some(1100))));
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");
        let err = transport
            .stream_to_file(&server.uri(), &dest, None, &[], &ProgressReporter::silent())
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::ResourceExhausted(_)));
        assert!(err.is_request_fatal());
        assert_eq!(existing_len(&dest).await, 0);
    }

    #[tokio::test]
    async fn test_server_error_before_first_byte_is_not_repeated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let err = transport()
            .stream_to_file(
                &server.uri(),
                &dir.path().join("out"),
                None,
                &[],
                &ProgressReporter::silent(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::NetworkTransient(_)));
    }

    #[tokio::test]
    async fn test_get_page_collects_cookies_and_final_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/landing"))
            .respond_with(
                ResponseTemplate::new(200)
                    .append_header("set-cookie", "did=web_abc123; Path=/; HttpOnly")
                    .append_header("set-cookie", "other=1")
                    .set_body_string("<html>ok</html>"),
            )
            .mount(&server)
            .await;

        let page = transport()
            .get_page(&format!("{}/landing", server.uri()), None, &[])
            .await
            .unwrap();

        assert_eq!(page.cookie("did"), Some("web_abc123"));
        assert_eq!(page.cookie("other"), Some("1"));
        assert!(page.final_url.ends_with("/landing"));
        assert_eq!(page.body, "<html>ok</html>");
    }

    #[tokio::test]
    async fn test_post_json_rejects_non_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = transport()
            .post_json(&server.uri(), None, &serde_json::json!({"url": "x"}), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::UnsupportedContent(_)));
    }

    #[test]
    fn test_parse_set_cookie() {
        assert_eq!(
            parse_set_cookie("a=b; Path=/"),
            Some(("a".to_string(), "b".to_string()))
        );
        assert_eq!(parse_set_cookie("garbage"), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_statvfs_reports_space_for_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(StatvfsProbe.available_bytes(dir.path()).is_some());
        assert!(StatvfsProbe
            .available_bytes(Path::new("/definitely/not/here"))
            .is_none());
    }
}
