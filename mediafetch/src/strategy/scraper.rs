//! Host-specific scraping through public pages and third-party APIs.
//!
//! A single [`ApiScraper`] type covers every host; what differs per host is
//! captured by its [`ScrapeProfile`]:
//!
//! | Profile     | Resolution step                                   | Stream |
//! |-------------|---------------------------------------------------|--------|
//! | `instagram` | reel page, regex over embedded JSON               | direct |
//! | `kuaishou`  | short-link redirect, `did` cookie, GraphQL query  | direct |
//! | `rednote`   | watermark-removal API                             | direct |
//! | `cobalt`    | cobalt API (`redirect`, `tunnel`, `picker`)       | direct |
//!
//! Resolution calls go through the proxy pool when one is attached. The media
//! stream itself is fetched without a proxy. Each call makes exactly one
//! resolution request; retries belong to the orchestrator.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use rand::Rng;
use regex::Regex;
use serde_json::{json, Value};

use super::direct::validate_http_url;
use super::media::{select_best_media, MediaCandidate};
use super::{BoxFuture, HttpTransport, MediaMetadata, SourceStrategy};
use crate::error::FetchError;
use crate::model::ProgressReporter;
use crate::proxy::{ProxyEndpoint, ProxyRotator};

/// Default Instagram web origin.
pub const DEFAULT_INSTAGRAM_BASE_URL: &str = "https://www.instagram.com";

/// Default Kuaishou web origin.
pub const DEFAULT_KUAISHOU_BASE_URL: &str = "https://www.kuaishou.com";

/// Default watermark-removal endpoint used for RedNote.
pub const DEFAULT_REDNOTE_API_URL: &str = "https://rndownloader.app/api/watermark";

/// Default cobalt API endpoint.
pub const DEFAULT_COBALT_API_URL: &str = "https://api.cobalt.tools/";

const KUAISHOU_DETAIL_QUERY: &str = "query visionVideoDetail($photoId: String, $type: String, $page: String) {
  visionVideoDetail(photoId: $photoId, type: $type, page: $page) {
    photo {
      id
      duration
      caption
      coverUrl
      photoUrl
      photoH265Url
      manifest
    }
  }
}
";

/// Which host a scraper instance talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScrapeProfile {
    Instagram,
    Kuaishou,
    RedNote,
    Cobalt,
}

impl ScrapeProfile {
    /// Strategy name used in attempt logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapeProfile::Instagram => "instagram",
            ScrapeProfile::Kuaishou => "kuaishou",
            ScrapeProfile::RedNote => "rednote",
            ScrapeProfile::Cobalt => "cobalt",
        }
    }
}

impl fmt::Display for ScrapeProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Endpoints and credentials for the scrape profiles.
#[derive(Clone, PartialEq)]
pub struct ScraperConfig {
    pub instagram_base_url: String,
    pub kuaishou_base_url: String,
    pub rednote_api_url: String,
    pub cobalt_api_url: String,
    /// Bearer token for cobalt instances that require one.
    pub cobalt_token: Option<String>,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            instagram_base_url: DEFAULT_INSTAGRAM_BASE_URL.to_string(),
            kuaishou_base_url: DEFAULT_KUAISHOU_BASE_URL.to_string(),
            rednote_api_url: DEFAULT_REDNOTE_API_URL.to_string(),
            cobalt_api_url: DEFAULT_COBALT_API_URL.to_string(),
            cobalt_token: None,
        }
    }
}

impl fmt::Debug for ScraperConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScraperConfig")
            .field("instagram_base_url", &self.instagram_base_url)
            .field("kuaishou_base_url", &self.kuaishou_base_url)
            .field("rednote_api_url", &self.rednote_api_url)
            .field("cobalt_api_url", &self.cobalt_api_url)
            .field("cobalt_token", &self.cobalt_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Outcome of the resolution step: candidate streams plus descriptive data.
#[derive(Debug, Default)]
struct Resolved {
    candidates: Vec<MediaCandidate>,
    title: Option<String>,
    duration_secs: Option<f64>,
    thumbnail: Option<String>,
    /// Sent as `Referer` when streaming the chosen candidate.
    referer: Option<String>,
}

impl Resolved {
    fn best(&self) -> Result<&MediaCandidate, FetchError> {
        select_best_media(&self.candidates)
            .ok_or_else(|| FetchError::UnsupportedContent("no downloadable media found".to_string()))
    }
}

/// Strategy that resolves a direct media URL from a host-specific API and
/// streams it.
#[derive(Debug)]
pub struct ApiScraper {
    profile: ScrapeProfile,
    config: ScraperConfig,
    transport: Arc<HttpTransport>,
    proxies: Option<Arc<ProxyRotator>>,
}

impl ApiScraper {
    pub fn new(profile: ScrapeProfile, config: ScraperConfig, transport: Arc<HttpTransport>) -> Self {
        Self {
            profile,
            config,
            transport,
            proxies: None,
        }
    }

    /// Route resolution calls through the proxy pool.
    pub fn with_proxies(mut self, proxies: Arc<ProxyRotator>) -> Self {
        self.proxies = Some(proxies);
        self
    }

    pub fn profile(&self) -> ScrapeProfile {
        self.profile
    }

    async fn resolve(&self, url: &str) -> Result<Resolved, FetchError> {
        validate_http_url(url)?;
        let proxy = self.proxies.as_ref().and_then(|p| p.select());
        let result = match self.profile {
            ScrapeProfile::Instagram => self.resolve_instagram(url, proxy.as_deref()).await,
            ScrapeProfile::Kuaishou => self.resolve_kuaishou(url, proxy.as_deref()).await,
            ScrapeProfile::RedNote => self.resolve_rednote(url, proxy.as_deref()).await,
            ScrapeProfile::Cobalt => self.resolve_cobalt(url, proxy.as_deref()).await,
        };
        if let (Some(rotator), Some(proxy)) = (&self.proxies, &proxy) {
            rotator.report_result(proxy, &result);
        }
        result
    }

    async fn resolve_instagram(&self, url: &str, proxy: Option<&ProxyEndpoint>) -> Result<Resolved, FetchError> {
        let shortcode = instagram_shortcode(url)
            .ok_or_else(|| FetchError::InvalidUrl(format!("no Instagram shortcode in {}", url)))?;
        let base = self.config.instagram_base_url.trim_end_matches('/');
        let page_url = format!("{}/reel/{}/", base, shortcode);

        let page = self
            .transport
            .get_page(&page_url, proxy, &[("Accept-Language", "en-US,en;q=0.9")])
            .await?;
        if page.final_url.contains("/accounts/login") {
            return Err(FetchError::AuthOrAccessDenied(format!(
                "Instagram requires login for {}",
                shortcode
            )));
        }

        let candidates = instagram_candidates(&page.body);
        if candidates.is_empty() {
            return Err(FetchError::UnsupportedContent(format!(
                "no video URL in Instagram page for {}",
                shortcode
            )));
        }

        Ok(Resolved {
            candidates,
            title: meta_property(&page.body, "og:title"),
            thumbnail: meta_property(&page.body, "og:image"),
            referer: Some(format!("{}/", base)),
            ..Default::default()
        })
    }

    async fn resolve_kuaishou(&self, url: &str, proxy: Option<&ProxyEndpoint>) -> Result<Resolved, FetchError> {
        let base = self.config.kuaishou_base_url.trim_end_matches('/');

        let photo_id = match kuaishou_photo_id(url) {
            Some(id) => id,
            None => {
                // short links only reveal the id after redirects
                let landing = self.transport.get_page(url, proxy, &[]).await?;
                kuaishou_photo_id(&landing.final_url).ok_or_else(|| {
                    FetchError::InvalidUrl(format!("{} did not resolve to a Kuaishou video", url))
                })?
            }
        };

        let page_url = format!("{}/short-video/{}", base, photo_id);
        let page = self.transport.get_page(&page_url, proxy, &[]).await?;
        let did = page
            .cookie("did")
            .map(str::to_string)
            .unwrap_or_else(generate_did);
        tracing::debug!(photo_id = %photo_id, did = %did, "Resolved Kuaishou video id");

        let payload = json!({
            "operationName": "visionVideoDetail",
            "variables": { "photoId": photo_id, "page": "detail" },
            "query": KUAISHOU_DETAIL_QUERY,
        });
        let cookie = format!("did={}", did);
        let response = self
            .transport
            .post_json(
                &format!("{}/graphql", base),
                proxy,
                &payload,
                &[("Cookie", cookie.as_str()), ("Referer", page_url.as_str()), ("Origin", base)],
            )
            .await?;

        let photo = response
            .pointer("/data/visionVideoDetail/photo")
            .filter(|p| !p.is_null())
            .ok_or_else(|| FetchError::NotFound(format!("Kuaishou returned no photo for {}", photo_id)))?;

        Ok(Resolved {
            candidates: kuaishou_candidates(photo),
            title: photo.get("caption").and_then(Value::as_str).map(str::to_string),
            duration_secs: photo.get("duration").and_then(Value::as_f64).map(|ms| ms / 1000.0),
            thumbnail: photo.get("coverUrl").and_then(Value::as_str).map(str::to_string),
            referer: Some(format!("{}/", base)),
        })
    }

    async fn resolve_rednote(&self, url: &str, proxy: Option<&ProxyEndpoint>) -> Result<Resolved, FetchError> {
        let response = self
            .transport
            .post_json(&self.config.rednote_api_url, proxy, &json!({ "url": url }), &[])
            .await?;

        let video_url = response
            .get("video_url")
            .or_else(|| response.pointer("/data/video_url"))
            .and_then(Value::as_str)
            .filter(|u| !u.is_empty());

        match video_url {
            Some(video_url) => Ok(Resolved {
                candidates: vec![MediaCandidate::new(video_url)],
                title: response.get("title").and_then(Value::as_str).map(str::to_string),
                ..Default::default()
            }),
            None => {
                let message = response
                    .get("error")
                    .or_else(|| response.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("no video_url in response");
                Err(FetchError::NotFound(format!("RedNote: {}", message)))
            }
        }
    }

    async fn resolve_cobalt(&self, url: &str, proxy: Option<&ProxyEndpoint>) -> Result<Resolved, FetchError> {
        let auth = self.config.cobalt_token.as_ref().map(|t| format!("Bearer {}", t));
        let mut headers: Vec<(&str, &str)> = Vec::new();
        if let Some(auth) = &auth {
            headers.push(("Authorization", auth.as_str()));
        }

        let response = self
            .transport
            .post_json(&self.config.cobalt_api_url, proxy, &json!({ "url": url }), &headers)
            .await?;
        cobalt_resolution(&response)
    }

    async fn download(&self, url: &str, dest: &Path, progress: &ProgressReporter) -> Result<u64, FetchError> {
        let resolved = self.resolve(url).await?;
        let best = resolved.best()?;
        validate_http_url(&best.url)?;

        tracing::debug!(
            strategy = self.profile.as_str(),
            media_url = %best.url,
            candidates = resolved.candidates.len(),
            "Streaming resolved media"
        );

        let mut headers: Vec<(&str, &str)> = Vec::new();
        if let Some(referer) = &resolved.referer {
            headers.push(("Referer", referer.as_str()));
        }
        self.transport
            .stream_to_file(&best.url, dest, None, &headers, progress)
            .await
    }

    async fn metadata(&self, url: &str) -> Result<MediaMetadata, FetchError> {
        let resolved = self.resolve(url).await?;
        let media_url = resolved.best()?.url.clone();
        Ok(MediaMetadata {
            title: resolved.title,
            duration_secs: resolved.duration_secs,
            uploader: None,
            thumbnail: resolved.thumbnail,
            media_url: Some(media_url),
        })
    }
}

impl SourceStrategy for ApiScraper {
    fn name(&self) -> &str {
        self.profile.as_str()
    }

    fn extract_metadata<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<MediaMetadata, FetchError>> {
        Box::pin(self.metadata(url))
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

fn shortcode_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"/(?:p|reels?|tv)/([A-Za-z0-9_-]+)").unwrap())
}

fn instagram_video_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r#""video_url":"([^"]+)""#,
            r#""videoUrl":"([^"]+)""#,
            r#"videoUrl":\s*"([^"]+)""#,
            r#""src":"([^"]+\.mp4[^"]*)""#,
            r#"(https://[^"]*\.cdninstagram\.com/[^"]*\.mp4[^"]*)"#,
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

fn kuaishou_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"/(?:short-video|photo|fw/photo)/([A-Za-z0-9_-]+)").unwrap())
}

fn instagram_shortcode(url: &str) -> Option<String> {
    shortcode_pattern()
        .captures(url)
        .map(|c| c[1].to_string())
}

/// Video URLs embedded in an Instagram page, in pattern order, de-duplicated.
fn instagram_candidates(body: &str) -> Vec<MediaCandidate> {
    let mut urls: Vec<String> = Vec::new();
    for pattern in instagram_video_patterns() {
        for caps in pattern.captures_iter(body) {
            let url = unescape_json_url(&caps[1]);
            let on_cdn = url.contains("cdninstagram.com") || url.contains("fbcdn.net");
            if url.contains(".mp4") && on_cdn && !urls.contains(&url) {
                urls.push(url);
            }
        }
    }
    urls.into_iter().map(MediaCandidate::new).collect()
}

fn kuaishou_photo_id(url: &str) -> Option<String> {
    kuaishou_id_pattern()
        .captures(url)
        .map(|c| c[1].to_string())
}

/// Representations from the DASH-like manifest first, then the flat URLs.
fn kuaishou_candidates(photo: &Value) -> Vec<MediaCandidate> {
    let mut candidates = Vec::new();

    let sets = photo
        .pointer("/manifest/adaptationSet")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for rep in sets
        .iter()
        .filter_map(|set| set.get("representation").and_then(Value::as_array))
        .flatten()
    {
        let Some(url) = rep.get("url").and_then(Value::as_str) else {
            continue;
        };
        let mut candidate = MediaCandidate::new(url);
        let dims = (
            rep.get("width").and_then(Value::as_u64),
            rep.get("height").and_then(Value::as_u64),
        );
        if let (Some(w), Some(h)) = dims {
            candidate = candidate.with_resolution(w as u32, h as u32);
        }
        let bitrate = rep
            .get("avgBitrate")
            .or_else(|| rep.get("maxBitrate"))
            .and_then(Value::as_u64);
        if let Some(bitrate) = bitrate {
            candidate = candidate.with_bitrate(bitrate);
        }
        candidates.push(candidate);
    }

    for key in ["photoUrl", "photoH265Url"] {
        if let Some(url) = photo.get(key).and_then(Value::as_str) {
            candidates.push(MediaCandidate::new(url));
        }
    }
    candidates
}

/// Interprets a cobalt API answer.
fn cobalt_resolution(response: &Value) -> Result<Resolved, FetchError> {
    let status = response.get("status").and_then(Value::as_str).unwrap_or("");
    match status {
        "redirect" | "tunnel" | "stream" => {
            let url = response
                .get("url")
                .and_then(Value::as_str)
                .ok_or_else(|| FetchError::UnsupportedContent("cobalt answer without url".to_string()))?;
            Ok(Resolved {
                candidates: vec![MediaCandidate::new(url)],
                title: response.get("filename").and_then(Value::as_str).map(str::to_string),
                ..Default::default()
            })
        }
        "picker" => {
            let items = response
                .get("picker")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let candidates: Vec<MediaCandidate> = items
                .iter()
                .filter(|item| item.get("type").and_then(Value::as_str).unwrap_or("video") == "video")
                .filter_map(|item| item.get("url").and_then(Value::as_str))
                .map(MediaCandidate::new)
                .collect();
            if candidates.is_empty() {
                return Err(FetchError::UnsupportedContent(
                    "cobalt picker holds no video".to_string(),
                ));
            }
            Ok(Resolved {
                candidates,
                ..Default::default()
            })
        }
        "error" => {
            let code = response
                .pointer("/error/code")
                .or_else(|| response.get("text"))
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            Err(cobalt_error(code))
        }
        other => Err(FetchError::UnsupportedContent(format!(
            "unexpected cobalt status '{}'",
            other
        ))),
    }
}

fn cobalt_error(code: &str) -> FetchError {
    let detail = format!("cobalt: {}", code);
    if code.contains("auth") {
        FetchError::AuthOrAccessDenied(detail)
    } else if code.contains("rate") || code.contains("timeout") || code.contains("fetch.fail") {
        FetchError::NetworkTransient(detail)
    } else if code.contains("unavailable") || code.contains("empty") || code.contains("not_found") {
        FetchError::NotFound(detail)
    } else {
        FetchError::UnsupportedContent(detail)
    }
}

fn meta_property(body: &str, property: &str) -> Option<String> {
    let pattern = format!(
        r#"<meta[^>]+property="{}"[^>]+content="([^"]*)""#,
        regex::escape(property)
    );
    Regex::new(&pattern)
        .ok()?
        .captures(body)
        .map(|c| c[1].replace("&amp;", "&"))
        .filter(|s| !s.is_empty())
}

fn unescape_json_url(raw: &str) -> String {
    raw.replace("\\u0026", "&")
        .replace("\\/", "/")
        .replace("&amp;", "&")
}

fn generate_did() -> String {
    format!("web_{:032x}", rand::rng().random::<u128>())
}
