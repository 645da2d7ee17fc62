//! Encoder configuration.

use super::tokens::DEFAULT_PAGE_SIZE;

/// How hard the mode decision works per macroblock. Derived from the
/// method setting, never chosen directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RdLevel {
    /// Distortion-only refinement with fixed mode rates.
    None,
    /// Full rate-distortion search over the intra modes.
    Basic,
    /// Like `Basic`, plus one trellis requantization of the winner.
    Trellis,
    /// Trellis quantization inside every candidate evaluation.
    TrellisAll,
}

/// How the residual partition is produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmissionStrategy {
    /// Buffer tokens during the scan, pick probabilities from the recorded
    /// statistics, then replay. Smaller output, more memory.
    TwoPassTokens,
    /// Write the arithmetic stream directly with the default probabilities.
    SinglePass,
}

/// Settings for encoding one frame.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct EncoderConfig {
    /// Encoding quality (0.0 = smallest, 100.0 = best). Default: 75.0.
    pub quality: f32,
    /// Quality/speed tradeoff (0 = fast, 6 = slower but better). Default: 4.
    pub method: u8,
    /// Number of quantization segments (1-4). Default: 4.
    pub segments: usize,
    /// Spatial noise shaping strength (0-100). Default: 50.
    pub sns_strength: u8,
    /// Loop filter strength estimate (0-100). Default: 60.
    pub filter_strength: u8,
    /// Loop filter sharpness (0-7). Default: 0.
    pub filter_sharpness: u8,
    /// Run the alpha compression on a worker thread. Default: false.
    pub use_threads: bool,
    /// Residual partition production. Default: two-pass tokens.
    pub emission: EmissionStrategy,
    /// Tokens per page of the token buffer.
    pub token_page_size: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl EncoderConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            quality: 75.0,
            method: 4,
            segments: 4,
            sns_strength: 50,
            filter_strength: 60,
            filter_sharpness: 0,
            use_threads: false,
            emission: EmissionStrategy::TwoPassTokens,
            token_page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Set encoding quality (0.0 = smallest file, 100.0 = best quality).
    #[must_use]
    pub fn with_quality(mut self, quality: f32) -> Self {
        self.quality = quality.clamp(0.0, 100.0);
        self
    }

    /// Set method (0 = fastest, 6 = slowest but best compression).
    #[must_use]
    pub fn with_method(mut self, method: u8) -> Self {
        self.method = method.min(6);
        self
    }

    /// Set the number of segments for adaptive quantization (1-4).
    #[must_use]
    pub fn with_segments(mut self, segments: usize) -> Self {
        self.segments = segments.clamp(1, 4);
        self
    }

    /// Set spatial noise shaping strength (0-100).
    /// Higher values preserve more texture detail.
    #[must_use]
    pub fn with_sns_strength(mut self, strength: u8) -> Self {
        self.sns_strength = strength.min(100);
        self
    }

    /// Set the loop filter strength estimate (0-100).
    #[must_use]
    pub fn with_filter_strength(mut self, strength: u8) -> Self {
        self.filter_strength = strength.min(100);
        self
    }

    /// Set loop filter sharpness (0-7).
    #[must_use]
    pub fn with_filter_sharpness(mut self, sharpness: u8) -> Self {
        self.filter_sharpness = sharpness.min(7);
        self
    }

    /// Run side tasks on a worker thread instead of inline.
    #[must_use]
    pub fn with_threads(mut self, enable: bool) -> Self {
        self.use_threads = enable;
        self
    }

    #[must_use]
    pub fn with_emission_strategy(mut self, emission: EmissionStrategy) -> Self {
        self.emission = emission;
        self
    }

    /// Set the token buffer page capacity, in tokens.
    #[must_use]
    pub fn with_token_page_size(mut self, size: usize) -> Self {
        self.token_page_size = size.max(1);
        self
    }

    /// RD level implied by the method setting.
    #[must_use]
    pub fn rd_level(&self) -> RdLevel {
        match self.method {
            6 => RdLevel::TrellisAll,
            5 => RdLevel::Trellis,
            3..=4 => RdLevel::Basic,
            _ => RdLevel::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rd_level_tracks_method() {
        assert_eq!(EncoderConfig::new().with_method(0).rd_level(), RdLevel::None);
        assert_eq!(EncoderConfig::new().with_method(2).rd_level(), RdLevel::None);
        assert_eq!(EncoderConfig::new().with_method(3).rd_level(), RdLevel::Basic);
        assert_eq!(
            EncoderConfig::new().with_method(5).rd_level(),
            RdLevel::Trellis
        );
        assert_eq!(
            EncoderConfig::new().with_method(6).rd_level(),
            RdLevel::TrellisAll
        );
        // out-of-range methods clamp instead of erroring
        assert_eq!(
            EncoderConfig::new().with_method(9).rd_level(),
            RdLevel::TrellisAll
        );
    }

    #[test]
    fn settings_clamp_to_their_ranges() {
        let c = EncoderConfig::new()
            .with_quality(150.0)
            .with_segments(7)
            .with_sns_strength(255)
            .with_filter_sharpness(20);
        assert_eq!(c.quality, 100.0);
        assert_eq!(c.segments, 4);
        assert_eq!(c.sns_strength, 100);
        assert_eq!(c.filter_sharpness, 7);
    }
}
