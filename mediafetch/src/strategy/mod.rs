//! Source strategies: one replaceable algorithm per class of media source.
//!
//! # Architecture
//!
//! ```text
//!                    ┌────────────────────┐
//!                    │   SourceStrategy   │  one attempt, pre-classified errors
//!                    └─────────┬──────────┘
//!        ┌─────────────────────┼──────────────────────┐
//!        ▼                     ▼                      ▼
//! ┌──────────────┐   ┌───────────────────┐   ┌────────────────┐
//! │GenericExtract│   │    ApiScraper     │   │ DirectCdnFetch │
//! │ (yt-dlp)     │   │ (ScrapeProfile)   │   │                │
//! └──────┬───────┘   └────────┬──────────┘   └───────┬────────┘
//!        │                    │ select_best_media     │
//!        │                    ▼                       ▼
//!        │            ┌──────────────────────────────────┐
//!        └──proxy────▶│  HttpTransport + ProxyRotator    │
//!                     └──────────────────────────────────┘
//! ```
//!
//! Every strategy honours the same contract:
//!
//! - writes only to the destination path it is given
//! - never leaves a non-empty truncated file behind on error
//! - keeps no per-request mutable state, so one instance serves
//!   concurrent requests
//! - returns errors that [`RetryPolicy::classify`](crate::retry::RetryPolicy::classify)
//!   can place without host-specific knowledge

mod direct;
mod generic;
mod http;
mod media;
mod scraper;

pub use direct::DirectCdnFetch;
pub use generic::{ExtractorConfig, GenericExtractor, DEFAULT_FORMAT_SELECTOR};
pub use http::{
    HttpTransport, PageResponse, SpaceProbe, StatvfsProbe, TransportConfig, DEFAULT_USER_AGENT,
};
pub use media::{select_best_media, MediaCandidate};
pub use scraper::{ApiScraper, ScrapeProfile, ScraperConfig};

#[cfg(test)]
pub(crate) use http::tests::transport as test_transport;

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use crate::error::FetchError;
use crate::model::ProgressReporter;

/// Boxed future type for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Descriptive information about a media item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaMetadata {
    pub title: Option<String>,
    pub duration_secs: Option<f64>,
    pub uploader: Option<String>,
    pub thumbnail: Option<String>,
    /// Direct media URL when the strategy resolved one.
    pub media_url: Option<String>,
}

/// One way of turning a URL into a file on disk.
///
/// Implementations perform exactly one attempt per call; retries, timeouts
/// and fallback are the orchestrator's job.
pub trait SourceStrategy: Send + Sync {
    /// Stable name used in attempt logs and configuration.
    fn name(&self) -> &str;

    /// Resolves descriptive metadata without downloading the media.
    fn extract_metadata<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<MediaMetadata, FetchError>>;

    /// Downloads the media behind `url` into `dest` and returns its size.
    ///
    /// # Arguments
    ///
    /// * `url` - Page or media URL supplied by the caller
    /// * `dest` - Temp path allocated for this attempt
    /// * `progress` - Byte-level progress sink for this attempt
    fn fetch<'a>(
        &'a self,
        url: &'a str,
        dest: &'a Path,
        progress: &'a ProgressReporter,
    ) -> BoxFuture<'a, Result<u64, FetchError>>;
}
