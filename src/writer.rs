//! Writes aligned copies of the input files and their mixdown.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::audio::{AudioDecoder, normalize_peak, to_i16, write_wav};
use crate::error::Result;
use crate::resolve::ShiftTable;

/// Name of the mixdown written next to the shifted files.
pub const MIXDOWN_NAME: &str = "total.wav";

/// Decodes `path`, prepends `seconds` of silence and writes it into
/// `destination` as `<stem>.wav`. Returns the written path and the samples.
pub fn shift_write_file(
    path: &Path,
    destination: &Path,
    seconds: f64,
    decoder: &dyn AudioDecoder,
) -> Result<(PathBuf, Vec<i16>, u32)> {
    let audio = decoder.decode(path)?;
    let pad = (seconds.max(0.0) * audio.sample_rate as f64).round() as usize;
    let mut samples = vec![0i16; pad];
    samples.extend_from_slice(&audio.samples);

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| audio.name.clone());
    let out = destination.join(format!("{stem}.wav"));
    write_wav(&out, &samples, audio.sample_rate)?;
    tracing::debug!(file = %out.display(), padding = seconds, "wrote shifted file");
    Ok((out, samples, audio.sample_rate))
}

/// Writes every placed file padded so the shared content lines up, then
/// `total.wav` with all of them mixed. Files that fail to decode are skipped
/// with a warning. Returns the paths written, mixdown last.
pub fn write_shifted_files(
    table: &ShiftTable,
    destination: &Path,
    names_and_paths: &BTreeMap<String, PathBuf>,
    decoder: &dyn AudioDecoder,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(destination)?;
    let max_shift = table.max_shift();

    let mut written = Vec::new();
    let mut tracks: Vec<Vec<i16>> = Vec::new();
    let mut mix_rate = None;
    for (name, &shift) in &table.shifts {
        let Some(path) = names_and_paths.get(name) else {
            tracing::warn!(file = name.as_str(), "no path known, not written");
            continue;
        };
        match shift_write_file(path, destination, max_shift - shift, decoder) {
            Ok((out, samples, rate)) => {
                if *mix_rate.get_or_insert(rate) == rate {
                    tracks.push(samples);
                } else {
                    tracing::warn!(
                        file = name.as_str(),
                        rate,
                        "sample rate differs, left out of the mixdown"
                    );
                }
                written.push(out);
            }
            Err(e) => tracing::warn!(file = name.as_str(), "could not write shifted file: {}", e),
        }
    }

    if let Some(rate) = mix_rate {
        let total = destination.join(MIXDOWN_NAME);
        write_wav(&total, &mixdown(&tracks), rate)?;
        tracing::info!("wrote {} aligned file(s) and {}", written.len(), total.display());
        written.push(total);
    }
    Ok(written)
}

/// Sums the tracks after lowering each by `3 * log2(count)` dB, then peak
/// normalizes the result.
pub fn mixdown(tracks: &[Vec<i16>]) -> Vec<i16> {
    if tracks.is_empty() {
        return Vec::new();
    }
    let attenuation_db = 3.0 * (tracks.len() as f64).log2();
    let gain = 10f64.powf(-attenuation_db / 20.0);
    let len = tracks.iter().map(Vec::len).max().unwrap_or(0);

    let mut mix = vec![0.0; len];
    for track in tracks {
        for (acc, &s) in mix.iter_mut().zip(track) {
            *acc += s as f64 * gain;
        }
    }
    normalize_peak(&mut mix);
    to_i16(&mix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::WavDecoder;

    #[test]
    fn mixdown_is_as_long_as_the_longest_track() {
        let mix = mixdown(&[vec![1000; 10], vec![-1000; 4]]);
        assert_eq!(mix.len(), 10);
        // the overlap cancels, the tail carries the longer track alone
        assert_eq!(mix[0], 0);
        assert!(mix[9] > 32000);
        assert!(mixdown(&[]).is_empty());
    }

    #[test]
    fn shifted_files_are_padded_to_line_up() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let a = src.path().join("a.wav");
        let b = src.path().join("b.wav");
        write_wav(&a, &vec![500; 1000], 1000).unwrap();
        write_wav(&b, &vec![500; 1000], 1000).unwrap();

        let table = ShiftTable {
            reference: "a.wav".into(),
            shifts: [("a.wav".to_string(), 0.5), ("b.wav".to_string(), 0.0)].into(),
            unaligned: vec![],
        };
        let paths: BTreeMap<String, PathBuf> =
            [("a.wav".to_string(), a), ("b.wav".to_string(), b)].into();
        let decoder = WavDecoder::new(1000, false);
        let out_dir = dst.path().join("aligned");
        let written = write_shifted_files(&table, &out_dir, &paths, &decoder).unwrap();

        assert_eq!(written.len(), 3);
        assert_eq!(written.last().unwrap().file_name().unwrap(), MIXDOWN_NAME);
        let a_out = decoder.decode(&out_dir.join("a.wav")).unwrap();
        let b_out = decoder.decode(&out_dir.join("b.wav")).unwrap();
        assert_eq!(a_out.samples.len(), 1000);
        assert_eq!(b_out.samples.len(), 1500);
        assert!(b_out.samples[..500].iter().all(|&s| s == 0));
        let total = decoder.decode(&out_dir.join(MIXDOWN_NAME)).unwrap();
        assert_eq!(total.samples.len(), 1500);
    }
}
