//! Short-time Fourier analysis and constellation peak picking.

use std::f64::consts::PI;
use std::sync::Arc;

use rustfft::{Fft, FftPlanner, num_complex::Complex};

use crate::config::FingerprintConfig;

/// A local spectral maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Peak {
    pub frame: u32,
    pub bin: u32,
}

pub fn hamming_window(window_size: usize) -> Vec<f64> {
    if window_size < 2 {
        return vec![1.0; window_size];
    }
    (0..window_size)
        .map(|n| {
            // 0.54 - 0.46 * cos(2 * pi * n / (N - 1))
            let value = 2.0 * PI * (n as f64) / (window_size as f64 - 1.0);
            0.54 - 0.46 * value.cos()
        })
        .collect()
}

pub fn hz_to_bin(hz: f64, window_size: usize, sample_rate: u32) -> usize {
    let freq_res = sample_rate as f64 / window_size as f64;
    (hz.max(0.0) / freq_res).round() as usize
}

/// Power spectral density in dB, one row per frame, `window / 2 + 1` bins per row.
///
/// Signals shorter than one window produce no frames. Bins with zero power
/// (silence) read as 0 dB rather than negative infinity.
pub fn compute_spectrogram(samples: &[i16], config: &FingerprintConfig) -> Vec<Vec<f64>> {
    let window_size = config.fft_window_size;
    let hop_size = config.hop_size();
    if window_size == 0 || samples.len() < window_size {
        return Vec::new();
    }

    let window = hamming_window(window_size);
    let window_power: f64 = window.iter().map(|w| w * w).sum();
    let scale = 1.0 / (config.sample_rate as f64 * window_power);
    let num_bins = window_size / 2 + 1;

    let mut planner = FftPlanner::new();
    let fft: Arc<dyn Fft<f64>> = planner.plan_fft_forward(window_size);
    let mut buffer = vec![Complex::new(0.0, 0.0); window_size];

    let mut spectrogram = Vec::with_capacity((samples.len() - window_size) / hop_size + 1);
    for chunk in samples.windows(window_size).step_by(hop_size) {
        for ((slot, &sample), &coeff) in buffer.iter_mut().zip(chunk).zip(&window) {
            *slot = Complex::new(sample as f64 * coeff, 0.0);
        }
        fft.process(&mut buffer);

        let row: Vec<f64> = buffer[..num_bins]
            .iter()
            .enumerate()
            .map(|(bin, value)| {
                let mut power = value.norm_sqr() * scale;
                // one-sided: fold the negative frequencies back in
                if bin != 0 && !(window_size % 2 == 0 && bin == num_bins - 1) {
                    power *= 2.0;
                }
                let db = 10.0 * power.log10();
                if db.is_finite() { db } else { 0.0 }
            })
            .collect();
        spectrogram.push(row);
    }

    tracing::debug!(
        frames = spectrogram.len(),
        bins = num_bins,
        "spectrogram computed"
    );
    spectrogram
}

/// Sliding maximum over `values` with a window reaching `radius` either side.
fn sliding_max(values: &[f64], radius: usize, out: &mut Vec<f64>) {
    out.clear();
    let len = values.len();
    for i in 0..len {
        let lo = i.saturating_sub(radius);
        let hi = (i + radius + 1).min(len);
        let max = values[lo..hi].iter().copied().fold(f64::NEG_INFINITY, f64::max);
        out.push(max);
    }
}

/// Rectangular 2-D maximum filter of the given radius in both axes.
pub fn maximum_filter(spectrogram: &[Vec<f64>], radius: usize) -> Vec<Vec<f64>> {
    let mut scratch = Vec::new();
    let along_bins: Vec<Vec<f64>> = spectrogram
        .iter()
        .map(|row| {
            sliding_max(row, radius, &mut scratch);
            scratch.clone()
        })
        .collect();

    let frames = along_bins.len();
    let bins = along_bins.first().map_or(0, Vec::len);
    let mut filtered = vec![vec![0.0; bins]; frames];
    let mut column = Vec::with_capacity(frames);
    for bin in 0..bins {
        column.clear();
        column.extend(along_bins.iter().map(|row| row[bin]));
        sliding_max(&column, radius, &mut scratch);
        for (frame, &value) in scratch.iter().enumerate() {
            filtered[frame][bin] = value;
        }
    }
    filtered
}

/// Cells equal to their neighborhood maximum, louder than `amp_min` and above
/// the frequency floor, sorted by frame then bin.
pub fn find_peaks(spectrogram: &[Vec<f64>], config: &FingerprintConfig) -> Vec<Peak> {
    if spectrogram.is_empty() {
        return Vec::new();
    }

    let floor_bin = hz_to_bin(config.freq_threshold, config.fft_window_size, config.sample_rate);
    let amp_min = config.amp_min;
    let local_max = maximum_filter(spectrogram, config.peak_neighborhood_size);

    let mut peaks: Vec<Peak> = spectrogram
        .iter()
        .zip(&local_max)
        .enumerate()
        .flat_map(|(frame, (row, max_row))| {
            row.iter()
                .zip(max_row)
                .enumerate()
                .skip(floor_bin)
                .filter(move |(_, (value, max))| *value == *max && **value > amp_min)
                .map(move |(bin, _)| Peak {
                    frame: frame as u32,
                    bin: bin as u32,
                })
        })
        .collect();

    peaks.sort_unstable();
    tracing::debug!("Found {} peaks", peaks.len());
    peaks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> FingerprintConfig {
        FingerprintConfig {
            sample_rate: 8192,
            fft_window_size: 1024,
            peak_neighborhood_size: 5,
            freq_threshold: 0.0,
            ..FingerprintConfig::default()
        }
    }

    fn sine(freq: f64, sample_rate: u32, len: usize) -> Vec<i16> {
        (0..len)
            .map(|n| {
                let t = n as f64 / sample_rate as f64;
                (10000.0 * (2.0 * PI * freq * t).sin()) as i16
            })
            .collect()
    }

    #[test]
    fn hamming_window_is_symmetric() {
        let window = hamming_window(16);
        assert!((window[0] - 0.08).abs() < 1e-12);
        for i in 0..8 {
            assert!((window[i] - window[15 - i]).abs() < 1e-12);
        }
    }

    #[test]
    fn frame_count_follows_hop() {
        let config = small_config();
        let samples = vec![0i16; 1024 + 512 * 9];
        let spec = compute_spectrogram(&samples, &config);
        assert_eq!(spec.len(), 10);
        assert_eq!(spec[0].len(), 513);
        assert!(spec.iter().flatten().all(|&db| db == 0.0));
    }

    #[test]
    fn short_signal_has_no_frames() {
        let config = small_config();
        assert!(compute_spectrogram(&[1, 2, 3], &config).is_empty());
    }

    #[test]
    fn sine_peak_lands_on_its_bin() {
        let config = small_config();
        // 1000 Hz at 8 Hz per bin
        let samples = sine(1000.0, 8192, 8192);
        let spec = compute_spectrogram(&samples, &config);
        let peaks = find_peaks(&spec, &config);
        assert!(!peaks.is_empty());
        let expected = hz_to_bin(1000.0, 1024, 8192) as u32;
        assert!(peaks.iter().all(|p| p.bin.abs_diff(expected) <= 1));
    }

    #[test]
    fn maximum_filter_spreads_the_max() {
        let grid = vec![
            vec![0.0, 0.0, 0.0, 0.0],
            vec![0.0, 9.0, 0.0, 0.0],
            vec![0.0, 0.0, 0.0, 0.0],
            vec![0.0, 0.0, 0.0, 1.0],
        ];
        let filtered = maximum_filter(&grid, 1);
        assert_eq!(filtered[0][0], 9.0);
        assert_eq!(filtered[2][2], 9.0);
        assert_eq!(filtered[3][3], 1.0);
        assert_eq!(filtered[0][3], 0.0);
    }

    #[test]
    fn silence_has_no_peaks() {
        let config = small_config();
        let spec = compute_spectrogram(&vec![0i16; 8192], &config);
        assert!(find_peaks(&spec, &config).is_empty());
    }

    #[test]
    fn frequency_floor_drops_low_bins() {
        let mut config = small_config();
        config.freq_threshold = 2000.0;
        let samples = sine(1000.0, 8192, 8192);
        let spec = compute_spectrogram(&samples, &config);
        let floor = hz_to_bin(2000.0, 1024, 8192) as u32;
        assert!(find_peaks(&spec, &config).iter().all(|p| p.bin >= floor));
    }
}
