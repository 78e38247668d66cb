//! Pluggable recognition techniques.
//!
//! Each technique prepares a per-file representation once, then compares a
//! target against any set of prepared partners. All of them emit the same
//! [`MatchResult`] shape so the resolver never needs to know which one ran.

use std::time::Instant;

use crate::audio::{DecodedAudio, resample, to_i16};
use crate::config::{FingerprintConfig, RecognizeOptions};
use crate::consensus::{ConsensusParams, consensus};
use crate::hashing::{Fingerprints, fingerprint};
use crate::matching::find_candidates;
use crate::types::{MatchResult, Technique};

pub trait Recognizer: Sync {
    type Prepared: Send + Sync;

    fn technique(&self) -> Technique;

    fn prepare(&self, audio: &DecodedAudio) -> Self::Prepared;

    /// Compares `target` with every entry of `against` whose name differs from
    /// `target_name`. `None` when nothing matched.
    fn recognize(
        &self,
        target_name: &str,
        target: &Self::Prepared,
        against: &[(&str, &Self::Prepared)],
    ) -> Option<MatchResult>;
}

/// Spectral fingerprint matching with offset consensus.
#[derive(Debug, Clone, Default)]
pub struct FingerprintRecognizer {
    pub config: FingerprintConfig,
    pub options: RecognizeOptions,
}

impl FingerprintRecognizer {
    pub fn new(config: FingerprintConfig, options: RecognizeOptions) -> Self {
        Self { config, options }
    }

    /// Fingerprints a signal, resampling first if it is not at the configured rate.
    pub fn fingerprint_audio(&self, audio: &DecodedAudio) -> Fingerprints {
        if audio.sample_rate == self.config.sample_rate {
            return fingerprint(&audio.samples, &self.config);
        }
        let samples: Vec<f64> = audio.samples.iter().map(|&s| s as f64).collect();
        let resampled = to_i16(&resample(&samples, audio.sample_rate, self.config.sample_rate));
        fingerprint(&resampled, &self.config)
    }

    /// Runs the matcher and consensus against arbitrary stored fingerprints,
    /// for instance the records of a [`crate::db::Store`].
    pub fn match_entries<'a>(
        &self,
        target_name: &str,
        target: &Fingerprints,
        entries: impl IntoIterator<Item = (&'a str, &'a Fingerprints)>,
    ) -> Option<MatchResult> {
        let start = Instant::now();
        let candidates = find_candidates(target, entries, Some(target_name));
        if candidates.is_empty() {
            tracing::debug!(file = target_name, "no candidate matches");
            return None;
        }

        let params = ConsensusParams::from_options(&self.options, &self.config);
        let match_info = consensus(&candidates, &params, &self.config);
        if match_info.is_empty() {
            return None;
        }

        Some(MatchResult {
            query: target_name.to_string(),
            technique: Technique::Fingerprints,
            hash_count: target.hash_count(),
            elapsed_seconds: start.elapsed().as_secs_f64(),
            match_info,
        })
    }
}

impl Recognizer for FingerprintRecognizer {
    type Prepared = Fingerprints;

    fn technique(&self) -> Technique {
        Technique::Fingerprints
    }

    fn prepare(&self, audio: &DecodedAudio) -> Fingerprints {
        self.fingerprint_audio(audio)
    }

    fn recognize(
        &self,
        target_name: &str,
        target: &Fingerprints,
        against: &[(&str, &Fingerprints)],
    ) -> Option<MatchResult> {
        self.match_entries(target_name, target, against.iter().copied())
    }
}
