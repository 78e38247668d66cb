//! Tunable parameters.
//!
//! Every recognizer gets its own immutable config struct, built once and passed
//! by reference. All structs deserialize from TOML with missing fields falling
//! back to the constants below.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AlignError, Result};

// Audio Processing Parameters
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;
pub const DEFAULT_WINDOW_SIZE: usize = 4096;
pub const DEFAULT_OVERLAP_RATIO: f64 = 0.5;

// Peak Finding Parameters
pub const DEFAULT_AMP_MIN: f64 = 10.0;
pub const PEAK_NEIGHBORHOOD_SIZE: usize = 20;
pub const DEFAULT_FREQ_THRESHOLD: f64 = 200.0;

// Hashing Parameters
pub const DEFAULT_FAN_VALUE: usize = 15;
pub const MIN_HASH_TIME_DELTA: u32 = 0;
pub const MAX_HASH_TIME_DELTA: u32 = 200;

// Matching Parameters
pub const DEFAULT_FILTER_MATCHES: f64 = 1.0;
pub const MIN_OFFSET_GAP: u32 = 2;
pub const MAX_ALTERNATES: usize = 10;

// Ranking tables: (strength threshold, score), checked top to bottom
pub const RANKINGS_NO_LOCALITY: &[(f64, u8)] = &[
    (8.0, 10),
    (6.0, 9),
    (4.0, 8),
    (3.0, 7),
    (2.0, 6),
    (1.5, 5),
    (1.0, 4),
    (0.0, 1),
];
pub const RANKINGS_LOCALITY: &[(f64, u8)] = &[
    (15.0, 10),
    (12.0, 9),
    (9.0, 8),
    (7.0, 7),
    (5.5, 6),
    (3.0, 5),
    (2.0, 4),
    (0.0, 1),
];
// (next / this confidence ratio, amount subtracted from the score)
pub const RANKINGS_MINUS: &[(f64, i8)] = &[
    (0.95, 4),
    (0.9, 3),
    (0.85, 1),
    (0.8, 0),
    (0.75, -1),
    (0.7, -2),
    (0.65, -3),
    (0.1, -4),
    (0.0, 0),
];

// Correlation Parameters
pub const CORRELATION_SAMPLE_RATE: u32 = 8000;
pub const CORRELATION_MIN_GAP_SECONDS: f64 = 0.5;

// Visual Parameters
pub const VOLUME_THRESHOLD: u8 = 216;
pub const VOLUME_FLOOR: u8 = 10;

pub const DEFAULT_EXTENSIONS: &[&str] = &["wav"];

/// Spectrogram, peak and hash parameters for the fingerprinter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    /// Rate every decoded file is resampled to before analysis.
    pub sample_rate: u32,
    /// FFT window length in samples.
    pub fft_window_size: usize,
    /// Fraction of each window shared with the next one.
    pub overlap_ratio: f64,
    /// Maximum number of targets paired with one anchor peak.
    pub fan_value: usize,
    /// Minimum magnitude in dB for a peak.
    pub amp_min: f64,
    /// Radius of the maximum filter, in frames and bins.
    pub peak_neighborhood_size: usize,
    pub min_hash_time_delta: u32,
    pub max_hash_time_delta: u32,
    /// Maximum bin distance between anchor and target, unbounded when `None`.
    pub max_hash_freq_delta: Option<u32>,
    /// Bins below this frequency (Hz) never yield peaks.
    pub freq_threshold: f64,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            fft_window_size: DEFAULT_WINDOW_SIZE,
            overlap_ratio: DEFAULT_OVERLAP_RATIO,
            fan_value: DEFAULT_FAN_VALUE,
            amp_min: DEFAULT_AMP_MIN,
            peak_neighborhood_size: PEAK_NEIGHBORHOOD_SIZE,
            min_hash_time_delta: MIN_HASH_TIME_DELTA,
            max_hash_time_delta: MAX_HASH_TIME_DELTA,
            max_hash_freq_delta: None,
            freq_threshold: DEFAULT_FREQ_THRESHOLD,
        }
    }
}

impl FingerprintConfig {
    /// Preset trading speed for recall. Level 1 is the fastest, 4 the most
    /// thorough; 2 matches the defaults. Out-of-range levels are clamped.
    pub fn with_accuracy(level: u8) -> Self {
        let mut config = Self::default();
        config.set_accuracy(level);
        config
    }

    /// Applies an accuracy preset to the peak and pairing parameters only.
    pub fn set_accuracy(&mut self, level: u8) {
        let (fan_value, peak_neighborhood_size, amp_min) = match level.clamp(1, 4) {
            1 => (5, 30, 20.0),
            2 => (DEFAULT_FAN_VALUE, PEAK_NEIGHBORHOOD_SIZE, DEFAULT_AMP_MIN),
            3 => (20, 15, 5.0),
            _ => (30, 10, 0.0),
        };
        self.fan_value = fan_value;
        self.peak_neighborhood_size = peak_neighborhood_size;
        self.amp_min = amp_min;
    }

    /// Samples between the starts of consecutive frames, never zero.
    pub fn hop_size(&self) -> usize {
        let hop = (self.fft_window_size as f64 * (1.0 - self.overlap_ratio)).round() as usize;
        hop.max(1)
    }

    /// Converts a frame offset into seconds.
    pub fn frames_to_seconds(&self, frames: f64) -> f64 {
        frames * self.hop_size() as f64 / self.sample_rate as f64
    }

    pub fn seconds_to_frames(&self, seconds: f64) -> f64 {
        seconds * self.sample_rate as f64 / self.hop_size() as f64
    }
}

/// Options for fingerprint recognition and consensus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizeOptions {
    /// Hypotheses with a confidence below this are dropped.
    pub filter_matches: Option<f64>,
    /// Window in seconds within which supporting hashes must fall.
    pub locality: Option<f64>,
    /// Drops alternates weaker than this fraction of the best hypothesis.
    pub locality_filter_prop: Option<f64>,
    /// Largest absolute offset in seconds worth reporting.
    pub max_lags: Option<f64>,
    /// Offsets closer than this many frames to a stronger one are merged.
    pub min_offset_gap: u32,
    pub max_alternates: usize,
}

impl Default for RecognizeOptions {
    fn default() -> Self {
        Self {
            filter_matches: None,
            locality: None,
            locality_filter_prop: None,
            max_lags: None,
            min_offset_gap: MIN_OFFSET_GAP,
            max_alternates: MAX_ALTERNATES,
        }
    }
}

/// Cross-correlation recognizer parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Signals are decimated to this rate before correlating.
    pub sample_rate: u32,
    /// Normalized peak height below which a lag is ignored.
    pub filter_matches: f64,
    pub max_lags: Option<f64>,
    /// Lags closer than this to a stronger peak are merged into it.
    pub min_gap_seconds: f64,
    pub max_alternates: usize,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            sample_rate: CORRELATION_SAMPLE_RATE,
            filter_matches: 0.0,
            max_lags: None,
            min_gap_seconds: CORRELATION_MIN_GAP_SECONDS,
            max_alternates: MAX_ALTERNATES,
        }
    }
}

/// Score reported by the spectrogram-image recognizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisualStrength {
    Ssim,
    Mse,
}

/// Spectrogram-image recognizer parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualConfig {
    /// Windows whose loudest pixel is below this are skipped.
    pub volume_threshold: u8,
    /// Pixels below this are zeroed.
    pub volume_floor: u8,
    pub vert_scaling: f64,
    pub horiz_scaling: f64,
    /// Seconds of target spectrogram slid across each partner.
    pub img_width: f64,
    pub strength: VisualStrength,
    pub filter_matches: Option<f64>,
    pub max_lags: Option<f64>,
    pub max_alternates: usize,
}

impl Default for VisualConfig {
    fn default() -> Self {
        Self {
            volume_threshold: VOLUME_THRESHOLD,
            volume_floor: VOLUME_FLOOR,
            vert_scaling: 1.0,
            horiz_scaling: 1.0,
            img_width: 1.0,
            strength: VisualStrength::Ssim,
            filter_matches: None,
            max_lags: None,
            max_alternates: MAX_ALTERNATES,
        }
    }
}

/// Top-level settings for an [`crate::session::Aligner`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignerConfig {
    pub fingerprint: FingerprintConfig,
    pub recognize: RecognizeOptions,
    pub correlation: CorrelationConfig,
    pub visual: VisualConfig,
    /// Worker threads; `None` uses every core, values below 1 mean one.
    pub num_processors: Option<i64>,
    /// Peak-normalize decoded audio.
    pub normalize_audio: bool,
    /// File extensions picked up when scanning directories.
    pub extensions: Vec<String>,
    /// Fingerprint accuracy preset (1 to 4). When set it overrides the
    /// fan value, neighborhood and amplitude floor in `fingerprint`.
    pub accuracy: Option<u8>,
}

impl Default for AlignerConfig {
    fn default() -> Self {
        Self {
            fingerprint: FingerprintConfig::default(),
            recognize: RecognizeOptions::default(),
            correlation: CorrelationConfig::default(),
            visual: VisualConfig::default(),
            num_processors: None,
            normalize_audio: true,
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            accuracy: None,
        }
    }
}

impl AlignerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| AlignError::Config(e.to_string()))
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Fingerprint parameters with the accuracy preset applied.
    pub fn effective_fingerprint(&self) -> FingerprintConfig {
        let mut fingerprint = self.fingerprint.clone();
        if let Some(level) = self.accuracy {
            fingerprint.set_accuracy(level);
        }
        fingerprint
    }

    /// Resolved worker count.
    pub fn worker_count(&self) -> usize {
        match self.num_processors {
            Some(n) if n <= 0 => 1,
            Some(n) => n as usize,
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_is_half_window_by_default() {
        let config = FingerprintConfig::default();
        assert_eq!(config.hop_size(), 2048);
        let secs = config.frames_to_seconds(1.0);
        assert!((secs - 2048.0 / 44100.0).abs() < 1e-12);
        assert!((config.seconds_to_frames(secs) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn accuracy_levels_are_clamped() {
        assert_eq!(FingerprintConfig::with_accuracy(2), FingerprintConfig::default());
        assert_eq!(
            FingerprintConfig::with_accuracy(0),
            FingerprintConfig::with_accuracy(1)
        );
        assert_eq!(
            FingerprintConfig::with_accuracy(9),
            FingerprintConfig::with_accuracy(4)
        );
    }

    #[test]
    fn visual_defaults() {
        let visual = VisualConfig::default();
        assert_eq!(visual.volume_threshold, 216);
        assert_eq!(visual.volume_floor, 10);
        assert_eq!(visual.img_width, 1.0);
    }

    #[test]
    fn accuracy_preset_keeps_analysis_settings() {
        let config = AlignerConfig::from_toml_str(
            r#"
            accuracy = 4

            [fingerprint]
            sample_rate = 8000
            fan_value = 7
            "#,
        )
        .unwrap();
        let fingerprint = config.effective_fingerprint();
        assert_eq!(fingerprint.sample_rate, 8000);
        assert_eq!(fingerprint.fan_value, 30);
        assert_eq!(fingerprint.peak_neighborhood_size, 10);
        assert_eq!(config.fingerprint.fan_value, 7);

        let plain = AlignerConfig::default();
        assert_eq!(plain.effective_fingerprint(), plain.fingerprint);
    }

    #[test]
    fn non_positive_worker_count_degrades_to_one() {
        let mut config = AlignerConfig::default();
        config.num_processors = Some(0);
        assert_eq!(config.worker_count(), 1);
        config.num_processors = Some(-3);
        assert_eq!(config.worker_count(), 1);
        config.num_processors = Some(6);
        assert_eq!(config.worker_count(), 6);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = AlignerConfig::from_toml_str(
            r#"
            num_processors = 2

            [fingerprint]
            fan_value = 7

            [recognize]
            filter_matches = 3.0
            "#,
        )
        .unwrap();
        assert_eq!(config.num_processors, Some(2));
        assert_eq!(config.fingerprint.fan_value, 7);
        assert_eq!(config.fingerprint.fft_window_size, DEFAULT_WINDOW_SIZE);
        assert_eq!(config.recognize.filter_matches, Some(3.0));
        assert_eq!(config.recognize.max_alternates, MAX_ALTERNATES);
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let err = AlignerConfig::from_toml_str("num_processors = \"many\"").unwrap_err();
        assert!(matches!(err, AlignError::Config(_)));
    }
}
