//! Platform identification.
//!
//! A URL is mapped to a [`Platform`] by a single host-based classifier. The
//! platform is the lookup key for the strategy registry; adding a platform
//! means adding a variant here and a chain in the registry.

use std::fmt;
use std::str::FromStr;

use url::Url;

/// Media platforms with a dedicated strategy chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    YouTube,
    Instagram,
    Kuaishou,
    RedNote,
    /// Anything not recognised; served by the generic chain.
    Generic,
}

/// Host suffixes recognised for each platform.
const HOST_TABLE: &[(&str, Platform)] = &[
    ("youtube.com", Platform::YouTube),
    ("youtu.be", Platform::YouTube),
    ("instagram.com", Platform::Instagram),
    ("kuaishou.com", Platform::Kuaishou),
    ("xiaohongshu.com", Platform::RedNote),
    ("xhslink.com", Platform::RedNote),
];

impl Platform {
    /// Every platform, in display order.
    pub const ALL: [Platform; 5] = [
        Platform::YouTube,
        Platform::Instagram,
        Platform::Kuaishou,
        Platform::RedNote,
        Platform::Generic,
    ];

    /// Classifies a URL by its host. Unparseable URLs are `Generic`.
    pub fn classify(url: &str) -> Platform {
        let Some(host) = host_of(url) else {
            return Platform::Generic;
        };
        HOST_TABLE
            .iter()
            .find(|(suffix, _)| host == *suffix || host.ends_with(&format!(".{}", suffix)))
            .map(|(_, platform)| *platform)
            .unwrap_or(Platform::Generic)
    }

    /// Stable lowercase identifier, used in config sections and temp file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::YouTube => "youtube",
            Platform::Instagram => "instagram",
            Platform::Kuaishou => "kuaishou",
            Platform::RedNote => "rednote",
            Platform::Generic => "generic",
        }
    }
}

fn host_of(url: &str) -> Option<String> {
    let trimmed = url.trim();
    let parsed = Url::parse(trimmed)
        .or_else(|_| Url::parse(&format!("https://{}", trimmed)))
        .ok()?;
    parsed.host_str().map(|h| h.to_ascii_lowercase())
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "youtube" | "yt" => Ok(Platform::YouTube),
            "instagram" | "ig" => Ok(Platform::Instagram),
            "kuaishou" => Ok(Platform::Kuaishou),
            "rednote" | "xiaohongshu" | "xhs" => Ok(Platform::RedNote),
            "generic" => Ok(Platform::Generic),
            other => Err(format!("unknown platform '{}'", other)),
        }
    }
}
