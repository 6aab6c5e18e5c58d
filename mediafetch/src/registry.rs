//! Platform → fallback chain lookup.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::platform::Platform;
use crate::proxy::ProxyRotator;
use crate::strategy::{
    ApiScraper, DirectCdnFetch, ExtractorConfig, GenericExtractor, HttpTransport, ScrapeProfile,
    ScraperConfig, SourceStrategy,
};

/// Ordered strategy lists keyed by platform.
///
/// A platform without a chain of its own is served by the
/// [`Platform::Generic`] chain, so lookups never fail.
#[derive(Default)]
pub struct StrategyRegistry {
    chains: HashMap<Platform, Vec<Arc<dyn SourceStrategy>>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the standard chains.
    ///
    /// | Platform  | Chain                                   |
    /// |-----------|-----------------------------------------|
    /// | youtube   | `ytdlp` → `cobalt`                      |
    /// | instagram | `instagram` (proxied) → `ytdlp` (proxied) |
    /// | kuaishou  | `kuaishou` (proxied) → `ytdlp`          |
    /// | rednote   | `rednote` → `ytdlp`                     |
    /// | generic   | `cobalt` → `ytdlp` → `direct`           |
    pub fn standard(
        transport: Arc<HttpTransport>,
        proxies: Option<Arc<ProxyRotator>>,
        scraper: &ScraperConfig,
        extractor: &ExtractorConfig,
    ) -> Self {
        let with_pool = |e: GenericExtractor| match &proxies {
            Some(pool) => e.with_proxies(Arc::clone(pool)),
            None => e,
        };
        let scrape = |profile: ScrapeProfile, proxied: bool| {
            let s = ApiScraper::new(profile, scraper.clone(), Arc::clone(&transport));
            match (&proxies, proxied) {
                (Some(pool), true) => s.with_proxies(Arc::clone(pool)),
                _ => s,
            }
        };

        let ytdlp: Arc<dyn SourceStrategy> = Arc::new(with_pool(GenericExtractor::new(extractor.clone())));
        let ytdlp_proxied: Arc<dyn SourceStrategy> = Arc::new(with_pool(GenericExtractor::new(ExtractorConfig {
            use_proxy: true,
            ..extractor.clone()
        })));
        let cobalt: Arc<dyn SourceStrategy> = Arc::new(scrape(ScrapeProfile::Cobalt, false));
        let direct: Arc<dyn SourceStrategy> = Arc::new(DirectCdnFetch::new(Arc::clone(&transport)));

        let instagram: Arc<dyn SourceStrategy> = Arc::new(scrape(ScrapeProfile::Instagram, true));
        let kuaishou: Arc<dyn SourceStrategy> = Arc::new(scrape(ScrapeProfile::Kuaishou, true));
        let rednote: Arc<dyn SourceStrategy> = Arc::new(scrape(ScrapeProfile::RedNote, false));

        let mut registry = Self::new();
        registry.register(Platform::YouTube, vec![Arc::clone(&ytdlp), Arc::clone(&cobalt)]);
        registry.register(Platform::Instagram, vec![instagram, ytdlp_proxied]);
        registry.register(Platform::Kuaishou, vec![kuaishou, Arc::clone(&ytdlp)]);
        registry.register(Platform::RedNote, vec![rednote, Arc::clone(&ytdlp)]);
        registry.register(Platform::Generic, vec![cobalt, ytdlp, direct]);
        registry
    }

    /// Replaces the chain for `platform`.
    pub fn register(&mut self, platform: Platform, chain: Vec<Arc<dyn SourceStrategy>>) {
        self.chains.insert(platform, chain);
    }

    /// Appends one strategy to the end of `platform`'s chain.
    pub fn append(&mut self, platform: Platform, strategy: Arc<dyn SourceStrategy>) {
        self.chains.entry(platform).or_default().push(strategy);
    }

    /// Strategies for `platform` in priority order.
    ///
    /// Falls back to the generic chain when `platform` has none.
    pub fn chain(&self, platform: Platform) -> &[Arc<dyn SourceStrategy>] {
        match self.chains.get(&platform) {
            Some(chain) if !chain.is_empty() => chain,
            _ => self
                .chains
                .get(&Platform::Generic)
                .map(Vec::as_slice)
                .unwrap_or_default(),
        }
    }

    /// Strategy names of the effective chain for `platform`.
    pub fn chain_names(&self, platform: Platform) -> Vec<String> {
        self.chain(platform).iter().map(|s| s.name().to_string()).collect()
    }

    /// Whether `platform` has a chain of its own.
    pub fn has_chain(&self, platform: Platform) -> bool {
        self.chains.get(&platform).is_some_and(|c| !c.is_empty())
    }
}

impl fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for platform in Platform::ALL {
            if self.has_chain(platform) {
                map.entry(&platform.as_str(), &self.chain_names(platform));
            }
        }
        map.finish()
    }
}
