//! Deterministic choice among media variants.

/// One downloadable variant found in an API response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaCandidate {
    pub url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub bitrate: Option<u64>,
}

impl MediaCandidate {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            width: None,
            height: None,
            bitrate: None,
        }
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn with_bitrate(mut self, bitrate: u64) -> Self {
        self.bitrate = Some(bitrate);
        self
    }

    /// Pixel count, zero when the resolution is unknown.
    pub fn pixels(&self) -> u64 {
        match (self.width, self.height) {
            (Some(w), Some(h)) => u64::from(w) * u64::from(h),
            (None, Some(h)) => u64::from(h),
            _ => 0,
        }
    }

    fn rank(&self) -> (u64, u64) {
        (self.pixels(), self.bitrate.unwrap_or(0))
    }
}

/// Picks the highest-resolution candidate.
///
/// Ties are broken by bitrate, then by earliest position, so the same input
/// always yields the same choice. Candidates with an empty URL are ignored.
pub fn select_best_media(candidates: &[MediaCandidate]) -> Option<&MediaCandidate> {
    candidates
        .iter()
        .filter(|c| !c.url.is_empty())
        .fold(None, |best: Option<&MediaCandidate>, c| match best {
            Some(b) if b.rank() >= c.rank() => Some(b),
            _ => Some(c),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_picks_highest_resolution() {
        let candidates = vec![
            MediaCandidate::new("sd").with_resolution(640, 360),
            MediaCandidate::new("fhd").with_resolution(1920, 1080),
            MediaCandidate::new("hd").with_resolution(1280, 720),
        ];
        assert_eq!(select_best_media(&candidates).unwrap().url, "fhd");
    }

    #[test]
    fn test_bitrate_breaks_resolution_ties() {
        let candidates = vec![
            MediaCandidate::new("low").with_resolution(1280, 720).with_bitrate(1_000),
            MediaCandidate::new("high").with_resolution(1280, 720).with_bitrate(3_000),
        ];
        assert_eq!(select_best_media(&candidates).unwrap().url, "high");
    }

    #[test]
    fn test_first_wins_on_full_tie() {
        let candidates = vec![
            MediaCandidate::new("a"),
            MediaCandidate::new("b"),
            MediaCandidate::new("c"),
        ];
        assert_eq!(select_best_media(&candidates).unwrap().url, "a");
    }

    #[test]
    fn test_known_resolution_beats_unknown() {
        let candidates = vec![
            MediaCandidate::new("unknown"),
            MediaCandidate::new("tiny").with_resolution(2, 2),
        ];
        assert_eq!(select_best_media(&candidates).unwrap().url, "tiny");
    }

    #[test]
    fn test_empty_input_and_empty_urls() {
        assert!(select_best_media(&[]).is_none());
        assert!(select_best_media(&[MediaCandidate::new("")]).is_none());
    }
}
