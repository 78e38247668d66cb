//! Decoding and writing audio files.
//!
//! The core only ever sees mono `i16` PCM at one sample rate. Anything that
//! can produce that plus a content hash can stand in for [`WavDecoder`].

use std::io::Cursor;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{AlignError, Result};

/// Peak normalization leaves 0.1 dB of headroom.
const NORMALIZE_HEADROOM_DB: f64 = 0.1;

/// Decoded mono signal plus the hash of the bytes it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub name: String,
    pub path: PathBuf,
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub content_hash: String,
}

impl DecodedAudio {
    /// Wraps an in-memory signal; the content hash covers the sample bytes.
    pub fn from_samples(name: impl Into<String>, samples: Vec<i16>, sample_rate: u32) -> Self {
        let name = name.into();
        let mut hasher = Sha256::new();
        for sample in &samples {
            hasher.update(sample.to_le_bytes());
        }
        Self {
            path: PathBuf::from(&name),
            name,
            samples,
            sample_rate,
            content_hash: format!("{:x}", hasher.finalize()),
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Keeps the `[start, end)` seconds of the signal. An `end` at or below
    /// zero, or past the end, keeps everything from `start` on.
    pub fn trim(&mut self, start: f64, end: f64) {
        let duration = self.duration_seconds();
        let end = if end <= 0.0 { duration } else { end.min(duration) };
        let rate = self.sample_rate as f64;
        let first = ((start.max(0.0) * rate).round() as usize).min(self.samples.len());
        let last = ((end * rate).round() as usize).clamp(first, self.samples.len());
        self.samples.truncate(last);
        self.samples.drain(..first);
    }
}

/// Codec boundary.
pub trait AudioDecoder: Sync {
    fn decode(&self, path: &Path) -> Result<DecodedAudio>;
}

/// WAV decoder backed by `hound`.
#[derive(Debug, Clone)]
pub struct WavDecoder {
    pub target_sample_rate: u32,
    pub normalize: bool,
}

impl WavDecoder {
    pub fn new(target_sample_rate: u32, normalize: bool) -> Self {
        Self {
            target_sample_rate,
            normalize,
        }
    }
}

impl AudioDecoder for WavDecoder {
    fn decode(&self, path: &Path) -> Result<DecodedAudio> {
        let bytes = std::fs::read(path).map_err(|e| decode_error(path, e))?;
        let content_hash = content_hash(&bytes);

        let mut reader =
            hound::WavReader::new(Cursor::new(bytes)).map_err(|e| decode_error(path, e))?;
        let spec = reader.spec();
        if spec.channels == 0 {
            return Err(decode_error(path, "file declares zero channels"));
        }

        let interleaved: Vec<f64> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .map(|s| s.map(|s| s as f64 * i16::MAX as f64))
                .collect::<std::result::Result<_, _>>(),
            hound::SampleFormat::Int if spec.bits_per_sample <= 16 => {
                let scale = (1i32 << (16 - spec.bits_per_sample)) as f64;
                reader
                    .samples::<i16>()
                    .map(|s| s.map(|s| s as f64 * scale))
                    .collect::<std::result::Result<_, _>>()
            }
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample - 16)) as f64;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|s| s as f64 / scale))
                    .collect::<std::result::Result<_, _>>()
            }
        }
        .map_err(|e| decode_error(path, e))?;

        tracing::debug!(
            path = %path.display(),
            sample_rate = spec.sample_rate,
            channels = spec.channels,
            bits = spec.bits_per_sample,
            "decoded wav"
        );

        let mono = downmix(&interleaved, spec.channels as usize);
        let mut resampled = resample(&mono, spec.sample_rate, self.target_sample_rate);
        if self.normalize {
            normalize_peak(&mut resampled);
        }

        Ok(DecodedAudio {
            name: file_name(path),
            path: path.to_path_buf(),
            samples: to_i16(&resampled),
            sample_rate: self.target_sample_rate,
            content_hash,
        })
    }
}

fn decode_error(path: &Path, reason: impl ToString) -> AlignError {
    AlignError::Decode {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Hex SHA-256 of raw file bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Base name of a path, used as the file identifier everywhere.
pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Averages interleaved channels into one.
pub fn downmix(interleaved: &[f64], channels: usize) -> Vec<f64> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f64>() / channels as f64)
        .collect()
}

/// Linear-interpolation resampler, both directions.
pub fn resample(samples: &[f64], original_sample_rate: u32, target_sample_rate: u32) -> Vec<f64> {
    if original_sample_rate == target_sample_rate || samples.is_empty() || target_sample_rate == 0 {
        return samples.to_vec();
    }

    let step = original_sample_rate as f64 / target_sample_rate as f64;
    let out_len = (samples.len() as f64 / step).floor() as usize;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos.floor() as usize;
            let frac = pos - idx as f64;
            let a = samples[idx.min(samples.len() - 1)];
            let b = samples.get(idx + 1).copied().unwrap_or(a);
            a + (b - a) * frac
        })
        .collect()
}

/// Scales so the loudest sample sits just under full scale. Silence is left alone.
pub fn normalize_peak(samples: &mut [f64]) {
    let peak = samples.iter().fold(0.0_f64, |acc, s| acc.max(s.abs()));
    if !peak.is_finite() || peak <= 0.0 {
        return;
    }
    let target = i16::MAX as f64 * 10f64.powf(-NORMALIZE_HEADROOM_DB / 20.0);
    let gain = target / peak;
    for sample in samples.iter_mut() {
        *sample *= gain;
    }
}

pub fn to_i16(samples: &[f64]) -> Vec<i16> {
    samples
        .iter()
        .map(|s| s.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16)
        .collect()
}

/// Writes a mono 16-bit WAV.
pub fn write_wav(path: &Path, samples: &[i16], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Every file under `dir` (recursively) whose extension is in `extensions`,
/// compared case-insensitively. `"*"` accepts everything. Sorted by path.
pub fn find_files(dir: &Path, extensions: &[String]) -> Vec<PathBuf> {
    let accept_all = extensions.iter().any(|e| e == "*");
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("skipping unreadable entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            accept_all
                || path
                    .extension()
                    .map(|ext| {
                        let ext = ext.to_string_lossy();
                        extensions
                            .iter()
                            .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(&ext))
                    })
                    .unwrap_or(false)
        })
        .collect();
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_keeps_the_requested_seconds() {
        let mut audio = DecodedAudio::from_samples("a.wav", (0..1000).collect(), 100);
        assert_eq!(audio.duration_seconds(), 10.0);

        audio.trim(2.5, 4.0);
        assert_eq!(audio.samples.len(), 150);
        assert_eq!(audio.samples[0], 250);
        assert_eq!(audio.duration_seconds(), 1.5);

        let mut audio = DecodedAudio::from_samples("a.wav", (0..1000).collect(), 100);
        audio.trim(9.0, -1.0);
        assert_eq!(audio.samples, (900..1000).collect::<Vec<i16>>());

        audio.trim(20.0, 30.0);
        assert!(audio.samples.is_empty());
        assert_eq!(audio.duration_seconds(), 0.0);
    }

    #[test]
    fn downmix_averages_channels() {
        let stereo = [100.0, 300.0, -50.0, 50.0];
        assert_eq!(downmix(&stereo, 2), vec![200.0, 0.0]);
        assert_eq!(downmix(&stereo, 1), stereo.to_vec());
    }

    #[test]
    fn resample_halves_length_when_downsampling() {
        let ramp: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let half = resample(&ramp, 16000, 8000);
        assert_eq!(half.len(), 50);
        assert_eq!(half[10], 20.0);

        let double = resample(&ramp, 8000, 16000);
        assert_eq!(double.len(), 200);
        assert!((double[3] - 1.5).abs() < 1e-9);
    }

    #[test]
    fn normalize_leaves_silence_untouched() {
        let mut silence = vec![0.0; 16];
        normalize_peak(&mut silence);
        assert!(silence.iter().all(|&s| s == 0.0));

        let mut quiet = vec![100.0, -200.0];
        normalize_peak(&mut quiet);
        assert!(quiet[1] < -32000.0 && quiet[1] >= -32767.0);
    }

    #[test]
    fn decode_round_trips_written_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let samples: Vec<i16> = (0..8000).map(|i| ((i % 100) as i16 - 50) * 100).collect();
        write_wav(&path, &samples, 8000).unwrap();

        let decoded = WavDecoder::new(8000, false).decode(&path).unwrap();
        assert_eq!(decoded.name, "tone.wav");
        assert_eq!(decoded.samples, samples);
        assert_eq!(decoded.content_hash.len(), 64);

        let again = WavDecoder::new(8000, false).decode(&path).unwrap();
        assert_eq!(again.content_hash, decoded.content_hash);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.wav");
        std::fs::write(&path, b"definitely not riff data").unwrap();
        let err = WavDecoder::new(8000, true).decode(&path).unwrap_err();
        assert!(matches!(err, AlignError::Decode { .. }));
    }

    #[test]
    fn find_files_filters_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("a.WAV"), b"").unwrap();
        std::fs::write(dir.path().join("nested/b.wav"), b"").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();

        let found = find_files(dir.path(), &["wav".to_string()]);
        let names: Vec<String> = found.iter().map(|p| file_name(p)).collect();
        assert_eq!(names, vec!["a.WAV", "b.wav"]);

        assert_eq!(find_files(dir.path(), &["*".to_string()]).len(), 3);
    }
}
