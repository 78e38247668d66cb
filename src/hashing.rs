//! Constellation hashing: pairs of spectral peaks packed into `u64` keys.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::FingerprintConfig;
use crate::spectrogram::{Peak, compute_spectrogram, find_peaks};

pub type FingerprintHash = u64;

// Bit packing: anchor bin | target bin | time delta, 16 bits each.
const FREQ_BITS: u32 = 16;
const DELTA_BITS: u32 = 16;
const FIELD_MASK: u64 = (1 << 16) - 1;

/// Hash → anchor frames where it occurred in one file. Repeated frames are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprints(HashMap<FingerprintHash, Vec<u32>>);

impl Fingerprints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, hash: FingerprintHash, frame: u32) {
        self.0.entry(hash).or_default().push(frame);
    }

    pub fn get(&self, hash: FingerprintHash) -> Option<&[u32]> {
        self.0.get(&hash).map(Vec::as_slice)
    }

    /// Number of distinct hashes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of (hash, frame) entries.
    pub fn hash_count(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (FingerprintHash, &[u32])> + '_ {
        self.0.iter().map(|(&hash, frames)| (hash, frames.as_slice()))
    }

    /// Appends every entry of `other`.
    pub fn merge(&mut self, other: Fingerprints) {
        for (hash, frames) in other.0 {
            self.0.entry(hash).or_default().extend(frames);
        }
    }
}

impl FromIterator<(FingerprintHash, u32)> for Fingerprints {
    fn from_iter<I: IntoIterator<Item = (FingerprintHash, u32)>>(iter: I) -> Self {
        let mut fingerprints = Fingerprints::new();
        for (hash, frame) in iter {
            fingerprints.insert(hash, frame);
        }
        fingerprints
    }
}

/// Fingerprints a mono signal sampled at `config.sample_rate`.
pub fn fingerprint(samples: &[i16], config: &FingerprintConfig) -> Fingerprints {
    let spectrogram = compute_spectrogram(samples, config);
    let peaks = find_peaks(&spectrogram, config);
    let fingerprints = generate_constellation_hashes(&peaks, config);
    tracing::debug!(
        peaks = peaks.len(),
        hashes = fingerprints.hash_count(),
        "fingerprinted signal"
    );
    fingerprints
}

/// Pairs each anchor with up to `fan_value` later peaks inside the target zone.
/// `peaks` must be sorted by frame then bin.
pub fn generate_constellation_hashes(peaks: &[Peak], config: &FingerprintConfig) -> Fingerprints {
    let mut fingerprints = Fingerprints::new();

    for (i, anchor) in peaks.iter().enumerate() {
        let mut paired = 0;
        for target in &peaks[i + 1..] {
            if paired == config.fan_value {
                break;
            }
            let time_delta = target.frame - anchor.frame;
            if time_delta > config.max_hash_time_delta {
                break;
            }
            if time_delta < config.min_hash_time_delta {
                continue;
            }
            if let Some(max_df) = config.max_hash_freq_delta {
                if target.bin.abs_diff(anchor.bin) > max_df {
                    continue;
                }
            }

            let hash = compute_hash(anchor.bin, target.bin, time_delta);
            fingerprints.insert(hash, anchor.frame);
            paired += 1;
        }
    }

    fingerprints
}

pub fn compute_hash(anchor_bin: u32, target_bin: u32, time_delta: u32) -> FingerprintHash {
    let mut hash = time_delta as u64 & FIELD_MASK;
    hash |= (target_bin as u64 & FIELD_MASK) << DELTA_BITS;
    hash |= (anchor_bin as u64 & FIELD_MASK) << (DELTA_BITS + FREQ_BITS);
    hash
}
