//! Alignment by comparing spectrogram images.
//!
//! Each file becomes a grayscale picture of its spectrogram, time along x and
//! low frequencies at the bottom. A short slice of the target picture is slid
//! along the partner's and scored for similarity at every column.

use std::time::Instant;

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};

use crate::audio::{DecodedAudio, resample, to_i16};
use crate::config::{
    FingerprintConfig, MIN_OFFSET_GAP, RANKINGS_NO_LOCALITY, VisualConfig, VisualStrength,
};
use crate::consensus::{rank_hypotheses, select_separated};
use crate::recognizer::Recognizer;
use crate::spectrogram::compute_spectrogram;
use crate::types::{Hypothesis, MatchInfo, MatchResult, Technique};

const SSIM_C1: f64 = (0.01 * 255.0) * (0.01 * 255.0);
const SSIM_C2: f64 = (0.03 * 255.0) * (0.03 * 255.0);

/// Renders a dB spectrogram (`[frame][bin]`) as an 8-bit image scaled between
/// its quietest (but not below 0 dB) and loudest cells. Pixels darker than
/// `floor` are zeroed.
pub fn spectrogram_to_image(spectrogram: &[Vec<f64>], floor: u8) -> GrayImage {
    let width = spectrogram.len();
    let height = spectrogram.first().map_or(0, Vec::len);
    if width == 0 || height == 0 {
        return GrayImage::new(0, 0);
    }

    // anything at or below 0 dB, silence included, renders black
    let (min_db, max_db) = spectrogram
        .iter()
        .flatten()
        .filter(|v| v.is_finite())
        .fold((f64::MAX, f64::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let min_db = min_db.max(0.0);
    let range = if max_db - min_db < 1e-6 { 1.0 } else { max_db - min_db };

    let mut img = GrayImage::new(width as u32, height as u32);
    for (t, row) in spectrogram.iter().enumerate() {
        for (f, &db) in row.iter().enumerate() {
            let scaled = ((db - min_db) / range).clamp(0.0, 1.0);
            let mut intensity = (scaled * 255.0).round() as u8;
            if intensity < floor {
                intensity = 0;
            }
            img.put_pixel(t as u32, (height - 1 - f) as u32, Luma([intensity]));
        }
    }
    img
}

#[derive(Debug, Clone, Default)]
pub struct VisualRecognizer {
    pub fingerprint: FingerprintConfig,
    pub config: VisualConfig,
}

impl VisualRecognizer {
    pub fn new(fingerprint: FingerprintConfig, config: VisualConfig) -> Self {
        Self { fingerprint, config }
    }

    fn columns_to_seconds(&self, columns: f64) -> f64 {
        self.fingerprint.frames_to_seconds(columns / self.config.horiz_scaling)
    }

    fn template_width(&self) -> u32 {
        let frames = self.fingerprint.seconds_to_frames(self.config.img_width);
        (frames * self.config.horiz_scaling).round().max(1.0) as u32
    }

    /// First template-wide window of the target loud enough to compare.
    fn pick_template(&self, target: &GrayImage) -> Option<u32> {
        let width = self.template_width();
        if target.width() < width {
            return None;
        }
        let column_max = column_maxima(target);
        (0..=target.width() - width)
            .step_by(width as usize)
            .find(|&start| window_max(&column_max, start, width) >= self.config.volume_threshold)
    }

    fn compare(
        &self,
        target: &GrayImage,
        template_start: u32,
        partner: &GrayImage,
    ) -> Option<MatchInfo> {
        let width = self.template_width();
        let height = target.height().min(partner.height());
        if height == 0 || partner.width() < width {
            return None;
        }

        let column_max = column_maxima(partner);
        let scores: Vec<Option<f64>> = (0..=partner.width() - width)
            .map(|start| {
                if window_max(&column_max, start, width) < self.config.volume_threshold {
                    return None;
                }
                let similarity = match self.config.strength {
                    VisualStrength::Ssim => {
                        ssim(target, template_start, partner, start, width, height)
                    }
                    VisualStrength::Mse => {
                        1.0 / mse(target, template_start, partner, start, width, height).max(1e-6)
                    }
                };
                Some(similarity)
            })
            .collect();

        let evaluated: Vec<f64> = scores.iter().flatten().copied().collect();
        if evaluated.is_empty() {
            return None;
        }
        let background = evaluated.iter().map(|s| s.abs()).sum::<f64>() / evaluated.len() as f64;

        let value = |i: usize| scores.get(i).copied().flatten().unwrap_or(f64::NEG_INFINITY);
        let max_lag = self.config.max_lags;
        let mut peaks: Vec<(i64, f64)> = (0..scores.len())
            .filter_map(|i| {
                let score = scores[i]?;
                let left = if i > 0 { value(i - 1) } else { f64::NEG_INFINITY };
                (score > left && score >= value(i + 1))
                    .then(|| (i as i64 - template_start as i64, score))
            })
            .filter(|&(lag, score)| {
                self.config.filter_matches.is_none_or(|min| score >= min)
                    && max_lag.is_none_or(|max| self.columns_to_seconds(lag as f64).abs() <= max)
            })
            .collect();
        peaks.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let selected = select_separated(
            peaks,
            |p| *p,
            MIN_OFFSET_GAP as i64,
            None,
            self.config.max_alternates.max(1),
        );
        if selected.is_empty() {
            return None;
        }

        let confidences: Vec<f64> = selected.iter().map(|p| p.1).collect();
        let strengths: Vec<f64> = confidences
            .iter()
            .map(|c| if background > 0.0 { c / background } else { 0.0 })
            .collect();
        let rankings = rank_hypotheses(&confidences, &strengths, RANKINGS_NO_LOCALITY);

        let locality_frames = (width as f64 / self.config.horiz_scaling).round() as u32;
        let hypotheses = selected
            .iter()
            .zip(rankings)
            .map(|(&(lag, score), ranking)| Hypothesis {
                offset_frames: (lag as f64 / self.config.horiz_scaling).round() as i64,
                offset_seconds: round5(self.columns_to_seconds(lag as f64)),
                confidence: score,
                match_time: round5(self.columns_to_seconds(template_start as f64)),
                locality_frames,
                locality_seconds: round5(
                    self.fingerprint.frames_to_seconds(locality_frames as f64),
                ),
                ranking,
            })
            .collect();
        Some(MatchInfo { hypotheses })
    }
}

impl Recognizer for VisualRecognizer {
    type Prepared = GrayImage;

    fn technique(&self) -> Technique {
        Technique::Visual
    }

    fn prepare(&self, audio: &DecodedAudio) -> GrayImage {
        let spectrogram = if audio.sample_rate == self.fingerprint.sample_rate {
            compute_spectrogram(&audio.samples, &self.fingerprint)
        } else {
            let samples: Vec<f64> = audio.samples.iter().map(|&s| s as f64).collect();
            let resampled =
                to_i16(&resample(&samples, audio.sample_rate, self.fingerprint.sample_rate));
            compute_spectrogram(&resampled, &self.fingerprint)
        };
        let img = spectrogram_to_image(&spectrogram, self.config.volume_floor);
        let unscaled = self.config.horiz_scaling == 1.0 && self.config.vert_scaling == 1.0;
        if img.width() == 0 || unscaled {
            return img;
        }
        let width = (img.width() as f64 * self.config.horiz_scaling).round().max(1.0) as u32;
        let height = (img.height() as f64 * self.config.vert_scaling).round().max(1.0) as u32;
        imageops::resize(&img, width, height, FilterType::Triangle)
    }

    fn recognize(
        &self,
        target_name: &str,
        target: &GrayImage,
        against: &[(&str, &GrayImage)],
    ) -> Option<MatchResult> {
        let start = Instant::now();
        let Some(template_start) = self.pick_template(target) else {
            tracing::debug!(file = target_name, "no window above the volume threshold");
            return None;
        };

        let match_info: std::collections::BTreeMap<String, MatchInfo> = against
            .iter()
            .filter(|(name, _)| *name != target_name)
            .filter_map(|(name, partner)| {
                let info = self.compare(target, template_start, partner)?;
                Some((name.to_string(), info))
            })
            .collect();
        if match_info.is_empty() {
            return None;
        }
        Some(MatchResult {
            query: target_name.to_string(),
            technique: Technique::Visual,
            hash_count: 0,
            elapsed_seconds: start.elapsed().as_secs_f64(),
            match_info,
        })
    }
}

fn column_maxima(img: &GrayImage) -> Vec<u8> {
    let width = img.width() as usize;
    let mut maxima = vec![0u8; width];
    for row in img.as_raw().chunks_exact(width.max(1)) {
        for (max, &px) in maxima.iter_mut().zip(row) {
            *max = (*max).max(px);
        }
    }
    maxima
}

fn window_max(column_max: &[u8], start: u32, width: u32) -> u8 {
    let start = start as usize;
    column_max[start..start + width as usize].iter().copied().max().unwrap_or(0)
}

/// Pixel pairs of two equally sized windows, row by row.
fn window_pairs<'a>(
    a: &'a GrayImage,
    a_start: u32,
    b: &'a GrayImage,
    b_start: u32,
    width: u32,
    height: u32,
) -> impl Iterator<Item = (f64, f64)> + 'a {
    let (aw, bw) = (a.width() as usize, b.width() as usize);
    let (a_raw, b_raw) = (a.as_raw(), b.as_raw());
    (0..height as usize).flat_map(move |y| {
        let ar = &a_raw[y * aw + a_start as usize..][..width as usize];
        let br = &b_raw[y * bw + b_start as usize..][..width as usize];
        ar.iter().zip(br).map(|(&p, &q)| (p as f64, q as f64))
    })
}

fn ssim(a: &GrayImage, a_start: u32, b: &GrayImage, b_start: u32, width: u32, height: u32) -> f64 {
    let count = (width * height) as f64;
    let (sum_a, sum_b) = window_pairs(a, a_start, b, b_start, width, height)
        .fold((0.0, 0.0), |(sa, sb), (x, y)| (sa + x, sb + y));
    let (mu_a, mu_b) = (sum_a / count, sum_b / count);
    let (var_a, var_b, cov) = window_pairs(a, a_start, b, b_start, width, height).fold(
        (0.0, 0.0, 0.0),
        |(va, vb, c), (x, y)| {
            let (dx, dy) = (x - mu_a, y - mu_b);
            (va + dx * dx, vb + dy * dy, c + dx * dy)
        },
    );
    let (var_a, var_b, cov) = (var_a / count, var_b / count, cov / count);
    ((2.0 * mu_a * mu_b + SSIM_C1) * (2.0 * cov + SSIM_C2))
        / ((mu_a * mu_a + mu_b * mu_b + SSIM_C1) * (var_a + var_b + SSIM_C2))
}

fn mse(a: &GrayImage, a_start: u32, b: &GrayImage, b_start: u32, width: u32, height: u32) -> f64 {
    let count = (width * height) as f64;
    window_pairs(a, a_start, b, b_start, width, height)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        / count
}

fn round5(value: f64) -> f64 {
    (value * 1e5).round() / 1e5
}
