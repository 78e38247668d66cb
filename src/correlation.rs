//! Cross-correlation of raw PCM.
//!
//! Slower and less robust to noise than fingerprints, but exact to the sample
//! and usable on material with few spectral peaks.

use std::time::Instant;

use rustfft::{FftPlanner, num_complex::Complex};

use crate::audio::{DecodedAudio, resample};
use crate::config::{CorrelationConfig, RANKINGS_NO_LOCALITY};
use crate::consensus::{rank_hypotheses, select_separated};
use crate::recognizer::Recognizer;
use crate::types::{Hypothesis, MatchInfo, MatchResult, Technique};

/// Decimated, zero-mean signal with its energy.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationSignal {
    pub samples: Vec<f64>,
    pub energy: f64,
}

impl CorrelationSignal {
    pub fn new(mut samples: Vec<f64>) -> Self {
        if !samples.is_empty() {
            let mean = samples.iter().sum::<f64>() / samples.len() as f64;
            samples.iter_mut().for_each(|s| *s -= mean);
        }
        let energy = samples.iter().map(|s| s * s).sum();
        Self { samples, energy }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CorrelationRecognizer {
    pub config: CorrelationConfig,
}

impl CorrelationRecognizer {
    pub fn new(config: CorrelationConfig) -> Self {
        Self { config }
    }

    fn correlate_pair(
        &self,
        target: &CorrelationSignal,
        partner: &CorrelationSignal,
    ) -> Option<MatchInfo> {
        if target.energy <= 0.0 || partner.energy <= 0.0 {
            return None;
        }
        let rate = self.config.sample_rate as f64;
        let n = target.samples.len();
        let m = partner.samples.len();
        let corr = cross_correlate(&target.samples, &partner.samples);
        let norm = (target.energy * partner.energy).sqrt();

        // index i holds lag i - (n - 1)
        let lag_of = |i: usize| i as i64 - (n as i64 - 1);
        let max_lag = self.config.max_lags.map(|secs| secs * rate);

        let mut peaks: Vec<(i64, f64)> = Vec::new();
        for i in 0..corr.len() {
            let value = corr[i] / norm;
            let left = if i > 0 { corr[i - 1] / norm } else { f64::NEG_INFINITY };
            let right = corr.get(i + 1).map_or(f64::NEG_INFINITY, |c| c / norm);
            if value > left && value >= right && value > 0.0 {
                peaks.push((lag_of(i), value));
            }
        }
        if peaks.is_empty() {
            return None;
        }
        let background = peaks.iter().map(|p| p.1.abs()).sum::<f64>() / peaks.len() as f64;

        peaks.retain(|&(lag, value)| {
            value >= self.config.filter_matches
                && max_lag.is_none_or(|max| (lag as f64).abs() <= max)
        });
        peaks.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let min_gap = (self.config.min_gap_seconds * rate).round() as i64;
        let max_alternates = self.config.max_alternates.max(1);
        let selected = select_separated(peaks, |p| *p, min_gap, None, max_alternates);
        if selected.is_empty() {
            return None;
        }

        let confidences: Vec<f64> = selected.iter().map(|p| p.1).collect();
        let strengths: Vec<f64> = confidences
            .iter()
            .map(|c| if background > 0.0 { c / background } else { 0.0 })
            .collect();
        let rankings = rank_hypotheses(&confidences, &strengths, RANKINGS_NO_LOCALITY);

        let hypotheses = selected
            .iter()
            .zip(rankings)
            .map(|(&(lag, value), ranking)| {
                let start = (-lag).max(0);
                let end = (n as i64).min(m as i64 - lag);
                let overlap = (end - start).max(0) as u32;
                Hypothesis {
                    offset_frames: lag,
                    offset_seconds: round5(lag as f64 / rate),
                    confidence: value,
                    match_time: round5(start as f64 / rate),
                    locality_frames: overlap,
                    locality_seconds: round5(overlap as f64 / rate),
                    ranking,
                }
            })
            .collect();
        Some(MatchInfo { hypotheses })
    }
}

impl Recognizer for CorrelationRecognizer {
    type Prepared = CorrelationSignal;

    fn technique(&self) -> Technique {
        Technique::Correlation
    }

    fn prepare(&self, audio: &DecodedAudio) -> CorrelationSignal {
        let samples: Vec<f64> = audio.samples.iter().map(|&s| s as f64).collect();
        CorrelationSignal::new(resample(&samples, audio.sample_rate, self.config.sample_rate))
    }

    fn recognize(
        &self,
        target_name: &str,
        target: &CorrelationSignal,
        against: &[(&str, &CorrelationSignal)],
    ) -> Option<MatchResult> {
        let start = Instant::now();
        let match_info: std::collections::BTreeMap<String, MatchInfo> = against
            .iter()
            .filter(|(name, _)| *name != target_name)
            .filter_map(|(name, partner)| {
                let info = self.correlate_pair(target, partner)?;
                tracing::debug!(target = target_name, partner = *name, "correlated");
                Some((name.to_string(), info))
            })
            .collect();
        if match_info.is_empty() {
            return None;
        }
        Some(MatchResult {
            query: target_name.to_string(),
            technique: Technique::Correlation,
            hash_count: 0,
            elapsed_seconds: start.elapsed().as_secs_f64(),
            match_info,
        })
    }
}

/// Full linear cross-correlation `c[k] = sum_t x[t] * y[t + k]` for
/// `k = -(len(x) - 1) ..= len(y) - 1`, returned in that order.
pub fn cross_correlate(x: &[f64], y: &[f64]) -> Vec<f64> {
    let (n, m) = (x.len(), y.len());
    if n == 0 || m == 0 {
        return Vec::new();
    }
    let size = (n + m - 1).next_power_of_two();

    let mut planner = FftPlanner::new();
    let forward = planner.plan_fft_forward(size);
    let inverse = planner.plan_fft_inverse(size);

    let mut xs = vec![Complex::new(0.0, 0.0); size];
    let mut ys = vec![Complex::new(0.0, 0.0); size];
    for (slot, &v) in xs.iter_mut().zip(x) {
        slot.re = v;
    }
    for (slot, &v) in ys.iter_mut().zip(y) {
        slot.re = v;
    }
    forward.process(&mut xs);
    forward.process(&mut ys);
    for (a, b) in xs.iter_mut().zip(&ys) {
        *a = a.conj() * b;
    }
    inverse.process(&mut xs);

    let scale = 1.0 / size as f64;
    // negative lags wrap around to the end of the buffer
    (1..n)
        .rev()
        .map(|k| xs[size - k].re * scale)
        .chain((0..m).map(|k| xs[k].re * scale))
        .collect()
}

fn round5(value: f64) -> f64 {
    (value * 1e5).round() / 1e5
}
