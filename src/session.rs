//! The user-facing entry point.
//!
//! An [`Aligner`] owns the configuration, a fingerprint [`Store`] and the
//! decoder. Batches of files are decoded and analysed on a bounded worker
//! pool; the store is only written from the calling thread.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::audio::{AudioDecoder, WavDecoder, find_files};
use crate::config::{AlignerConfig, RecognizeOptions};
use crate::correlation::CorrelationRecognizer;
use crate::db::{FingerprintRecord, Store};
use crate::error::{AlignError, Result};
use crate::hashing::Fingerprints;
use crate::recognizer::{FingerprintRecognizer, Recognizer};
use crate::resolve::{ShiftTable, resolve};
use crate::types::{MatchResult, Technique};
use crate::visual::VisualRecognizer;
use crate::writer::write_shifted_files;

/// Files to align: everything matching the configured extensions under a
/// directory, or an explicit list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlignInput {
    Directory(PathBuf),
    Files(Vec<PathBuf>),
}

/// A file that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedFile {
    pub path: PathBuf,
    pub reason: String,
}

/// Outcome of fingerprinting a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub added: usize,
    /// Already stored, by name or by content.
    pub skipped: usize,
    pub failed: Vec<FailedFile>,
}

/// Shifts for every file plus the evidence they were derived from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentResult {
    pub technique: Technique,
    /// File every shift was anchored to, `None` when nothing matched.
    pub reference: Option<String>,
    /// Seconds of lead-in each file has over the earliest one.
    pub shifts: BTreeMap<String, f64>,
    pub unaligned: Vec<String>,
    /// Every query's result; `None` when it matched nothing.
    pub match_info: BTreeMap<String, Option<MatchResult>>,
    pub names_and_paths: BTreeMap<String, PathBuf>,
    pub failed: Vec<FailedFile>,
    /// Files written to the destination, mixdown last.
    pub written: Vec<PathBuf>,
}

impl AlignmentResult {
    fn from_parts(
        technique: Technique,
        table: Option<ShiftTable>,
        match_info: BTreeMap<String, Option<MatchResult>>,
        names_and_paths: BTreeMap<String, PathBuf>,
        failed: Vec<FailedFile>,
    ) -> Self {
        let (reference, shifts) = match table {
            Some(table) => (Some(table.reference), table.shifts),
            None => (None, BTreeMap::new()),
        };
        let unaligned = names_and_paths
            .keys()
            .filter(|name| !shifts.contains_key(*name))
            .cloned()
            .collect();
        Self {
            technique,
            reference,
            shifts,
            unaligned,
            match_info,
            names_and_paths,
            failed,
            written: Vec::new(),
        }
    }

    /// The shifts as a table the writer accepts.
    pub fn shift_table(&self) -> Option<ShiftTable> {
        Some(ShiftTable {
            reference: self.reference.clone()?,
            shifts: self.shifts.clone(),
            unaligned: self.unaligned.clone(),
        })
    }
}

/// Recomputes the shifts of `result` from its stored match info, following
/// the hypothesis at `index` of every pair instead of the best one. Nothing
/// is written.
pub fn recalc_shifts_index(result: &AlignmentResult, index: usize) -> AlignmentResult {
    let table = resolve(&result.match_info, index);
    AlignmentResult::from_parts(
        result.technique,
        table,
        result.match_info.clone(),
        result.names_and_paths.clone(),
        result.failed.clone(),
    )
}

pub struct Aligner {
    config: AlignerConfig,
    store: Store,
    decoder: Box<dyn AudioDecoder + Send>,
}

impl Default for Aligner {
    fn default() -> Self {
        Self::new(AlignerConfig::default())
    }
}

impl Aligner {
    pub fn new(config: AlignerConfig) -> Self {
        let decoder = WavDecoder::new(config.fingerprint.sample_rate, config.normalize_audio);
        Self {
            config,
            store: Store::new(),
            decoder: Box::new(decoder),
        }
    }

    /// Swaps the codec, e.g. for one that handles more containers.
    pub fn with_decoder(mut self, decoder: impl AudioDecoder + Send + 'static) -> Self {
        self.decoder = Box::new(decoder);
        self
    }

    pub fn config(&self) -> &AlignerConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    fn pool(&self) -> Result<rayon::ThreadPool> {
        let threads = self.config.worker_count();
        tracing::debug!(threads, "starting worker pool");
        Ok(rayon::ThreadPoolBuilder::new().num_threads(threads).build()?)
    }

    fn fingerprint_recognizer(&self, options: &RecognizeOptions) -> FingerprintRecognizer {
        FingerprintRecognizer::new(self.config.effective_fingerprint(), options.clone())
    }

    pub fn load_fingerprints(&mut self, path: &Path) -> Result<usize> {
        self.store.load(path)
    }

    pub fn save_fingerprints(&self, path: &Path) -> Result<()> {
        self.store.save(path)
    }

    /// Fingerprints one file into the store, optionally under another name.
    pub fn fingerprint_file(&mut self, path: &Path, name: Option<&str>) -> Result<()> {
        let mut audio = self.decoder.decode(path)?;
        if let Some(name) = name {
            audio.name = name.to_string();
        }
        if self.store.contains_name(&audio.name) || self.store.contains_hash(&audio.content_hash) {
            return Err(AlignError::AlreadyFingerprinted { name: audio.name });
        }
        let fingerprints = self.fingerprint_recognizer(&self.config.recognize).prepare(&audio);
        tracing::info!(
            file = audio.name.as_str(),
            hashes = fingerprints.hash_count(),
            "fingerprinted"
        );
        self.store.append(FingerprintRecord {
            name: audio.name,
            fingerprints,
            content_hash: audio.content_hash,
        })
    }

    pub fn fingerprint_directory(&mut self, dir: &Path) -> Result<BatchReport> {
        let files = list_directory(dir, &self.config.extensions)?;
        self.fingerprint_files(&files)
    }

    /// Decodes and fingerprints files in parallel, then stores them one by
    /// one. Undecodable files land in the report instead of failing the batch.
    pub fn fingerprint_files(&mut self, paths: &[PathBuf]) -> Result<BatchReport> {
        let start = Instant::now();
        let mut report = BatchReport::default();

        let pending: Vec<&PathBuf> = paths
            .iter()
            .filter(|path| {
                let known = self.store.contains_name(&crate::audio::file_name(path));
                if known {
                    tracing::warn!(file = %path.display(), "already fingerprinted, skipping");
                    report.skipped += 1;
                }
                !known
            })
            .collect();

        let pool = self.pool()?;
        let recognizer = self.fingerprint_recognizer(&self.config.recognize);
        let decoder = &self.decoder;
        let outcomes: Vec<(PathBuf, Result<FingerprintRecord>)> = pool.install(|| {
            pending
                .par_iter()
                .map(|path| {
                    let record = decoder.decode(path).map(|audio| FingerprintRecord {
                        fingerprints: recognizer.prepare(&audio),
                        name: audio.name,
                        content_hash: audio.content_hash,
                    });
                    (path.to_path_buf(), record)
                })
                .collect()
        });

        for (path, outcome) in outcomes {
            match outcome.and_then(|record| self.store.append(record)) {
                Ok(()) => report.added += 1,
                Err(e @ AlignError::AlreadyFingerprinted { .. }) => {
                    tracing::warn!("{}", e);
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::warn!(file = %path.display(), "skipping: {}", e);
                    report.failed.push(FailedFile {
                        path,
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            added = report.added,
            skipped = report.skipped,
            failed = report.failed.len(),
            elapsed = start.elapsed().as_secs_f64(),
            "fingerprinting finished"
        );
        Ok(report)
    }

    /// Matches one file against everything in the store.
    pub fn recognize(
        &self,
        path: &Path,
        options: &RecognizeOptions,
    ) -> Result<Option<MatchResult>> {
        let audio = self.decoder.decode(path)?;
        let recognizer = self.fingerprint_recognizer(options);
        let fingerprints = recognizer.prepare(&audio);
        Ok(recognizer.match_entries(&audio.name, &fingerprints, self.store.entries()))
    }

    /// Matches already computed fingerprints against the store.
    pub fn recognize_fingerprints(
        &self,
        name: &str,
        fingerprints: &Fingerprints,
        options: &RecognizeOptions,
    ) -> Option<MatchResult> {
        self.fingerprint_recognizer(options)
            .match_entries(name, fingerprints, self.store.entries())
    }

    /// Aligns every input file with every other one. The store is left
    /// untouched. With a destination, shifted copies and a mixdown are
    /// written there.
    pub fn align(
        &self,
        input: AlignInput,
        technique: &str,
        destination: Option<&Path>,
    ) -> Result<AlignmentResult> {
        let technique: Technique = technique.parse()?;
        let paths = self.resolve_input(input)?;
        self.align_technique(technique, &paths, None, destination)
    }

    /// Aligns every file of `against` to `target` alone. Files are only
    /// compared with the target, never with each other.
    ///
    /// `start_end` limits the target to a `(start, end)` range in seconds; an
    /// `end` at or below zero runs to the end of the file. Shifts are still
    /// reported against the whole target.
    pub fn target_align(
        &self,
        target: &Path,
        start_end: Option<(f64, f64)>,
        against: AlignInput,
        technique: &str,
        destination: Option<&Path>,
    ) -> Result<AlignmentResult> {
        let technique: Technique = technique.parse()?;
        let backwards = |&(start, end): &(f64, f64)| start < 0.0 || (end > 0.0 && end <= start);
        if let Some((start, end)) = start_end.filter(backwards) {
            return Err(AlignError::InvalidRange { start, end });
        }
        let mut paths = vec![target.to_path_buf()];
        paths.extend(self.resolve_input(against)?);
        let target = Target {
            name: crate::audio::file_name(target),
            start_end,
        };
        self.align_technique(technique, &paths, Some(&target), destination)
    }

    /// Writes shifted copies for a result, e.g. after [`recalc_shifts_index`].
    pub fn write_alignment(
        &self,
        result: &AlignmentResult,
        destination: &Path,
    ) -> Result<Vec<PathBuf>> {
        match result.shift_table() {
            Some(table) => {
                write_shifted_files(&table, destination, &result.names_and_paths, &*self.decoder)
            }
            None => Ok(Vec::new()),
        }
    }

    fn resolve_input(&self, input: AlignInput) -> Result<Vec<PathBuf>> {
        match input {
            AlignInput::Directory(dir) => list_directory(&dir, &self.config.extensions),
            AlignInput::Files(files) => Ok(files),
        }
    }

    fn align_technique(
        &self,
        technique: Technique,
        paths: &[PathBuf],
        target: Option<&Target>,
        destination: Option<&Path>,
    ) -> Result<AlignmentResult> {
        match technique {
            Technique::Fingerprints => {
                let recognizer = self.fingerprint_recognizer(&self.config.recognize);
                self.align_with(&recognizer, paths, target, destination)
            }
            Technique::Correlation => {
                let recognizer = CorrelationRecognizer::new(self.config.correlation.clone());
                self.align_with(&recognizer, paths, target, destination)
            }
            Technique::Visual => {
                let recognizer = VisualRecognizer::new(
                    self.config.effective_fingerprint(),
                    self.config.visual.clone(),
                );
                self.align_with(&recognizer, paths, target, destination)
            }
        }
    }

    fn align_with<R: Recognizer>(
        &self,
        recognizer: &R,
        paths: &[PathBuf],
        target: Option<&Target>,
        destination: Option<&Path>,
    ) -> Result<AlignmentResult> {
        let start = Instant::now();
        let pool = self.pool()?;
        let decoder = &self.decoder;

        let decoded: Vec<(PathBuf, Result<(String, PathBuf, R::Prepared)>)> = pool.install(|| {
            paths
                .par_iter()
                .map(|path| {
                    let outcome = decoder.decode(path).map(|mut audio| {
                        if let Some((from, to)) = target.and_then(|t| t.range_for(&audio.name)) {
                            audio.trim(from, to);
                        }
                        let prepared = recognizer.prepare(&audio);
                        (audio.name, audio.path, prepared)
                    });
                    (path.clone(), outcome)
                })
                .collect()
        });

        let mut names_and_paths = BTreeMap::new();
        let mut prepared: Vec<(String, R::Prepared)> = Vec::new();
        let mut failed = Vec::new();
        for (path, outcome) in decoded {
            match outcome {
                Ok((name, file_path, data)) => {
                    if names_and_paths.contains_key(&name) {
                        tracing::warn!(
                            file = %file_path.display(),
                            "another file is already named {}, skipping",
                            name
                        );
                        continue;
                    }
                    names_and_paths.insert(name.clone(), file_path);
                    prepared.push((name, data));
                }
                Err(e) => {
                    tracing::warn!(file = %path.display(), "skipping: {}", e);
                    failed.push(FailedFile {
                        path,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let against: Vec<(&str, &R::Prepared)> = prepared
            .iter()
            .map(|(name, data)| (name.as_str(), data))
            .collect();
        let queries: Vec<&(String, R::Prepared)> = prepared
            .iter()
            .filter(|(name, _)| target.is_none_or(|t| *name == t.name))
            .collect();
        let match_info: BTreeMap<String, Option<MatchResult>> = pool
            .install(|| {
                queries
                    .par_iter()
                    .map(|(name, data)| {
                        let mut result = recognizer.recognize(name, data, &against);
                        let range = target.and_then(|t| t.range_for(name));
                        if let (Some(result), Some((from, _))) = (result.as_mut(), range) {
                            result.shift_query_start(from);
                        }
                        (name.clone(), result)
                    })
                    .collect::<Vec<_>>()
            })
            .into_iter()
            .collect();

        let table = resolve(&match_info, 0);
        let mut result = AlignmentResult::from_parts(
            recognizer.technique(),
            table,
            match_info,
            names_and_paths,
            failed,
        );
        if let (Some(destination), Some(table)) = (destination, result.shift_table()) {
            result.written =
                write_shifted_files(&table, destination, &result.names_and_paths, &**decoder)?;
        }

        tracing::info!(
            technique = %result.technique,
            elapsed = start.elapsed().as_secs_f64(),
            "{} out of {} found and aligned",
            result.shifts.len(),
            result.names_and_paths.len()
        );
        Ok(result)
    }
}

/// The only query of a target alignment.
struct Target {
    name: String,
    start_end: Option<(f64, f64)>,
}

impl Target {
    fn range_for(&self, name: &str) -> Option<(f64, f64)> {
        if self.name == name { self.start_end } else { None }
    }
}

fn list_directory(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} is not a directory", dir.display()),
        )
        .into());
    }
    Ok(find_files(dir, extensions))
}
