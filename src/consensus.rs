//! Offset voting over candidate matches.
//!
//! Every candidate votes for `(file, offset)`. The cell with the most votes is
//! the best alignment; lower cells for the same file become ranked alternates
//! once near-duplicates of stronger offsets are merged away.

use std::collections::{BTreeMap, HashMap};

use crate::config::{
    DEFAULT_FILTER_MATCHES, FingerprintConfig, RANKINGS_LOCALITY, RANKINGS_MINUS,
    RANKINGS_NO_LOCALITY, RecognizeOptions,
};
use crate::matching::Candidate;
use crate::types::{Hypothesis, MatchInfo};

/// Consensus parameters in frame units.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusParams {
    pub filter_matches: f64,
    pub locality_frames: Option<u32>,
    pub locality_filter_prop: Option<f64>,
    pub max_lag_frames: Option<f64>,
    pub min_offset_gap: u32,
    pub max_alternates: usize,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self::from_options(&RecognizeOptions::default(), &FingerprintConfig::default())
    }
}

impl ConsensusParams {
    pub fn from_options(options: &RecognizeOptions, config: &FingerprintConfig) -> Self {
        Self {
            filter_matches: options.filter_matches.unwrap_or(DEFAULT_FILTER_MATCHES),
            locality_frames: options
                .locality
                .map(|secs| config.seconds_to_frames(secs).round().max(0.0) as u32),
            locality_filter_prop: options.locality_filter_prop,
            max_lag_frames: options.max_lags.map(|secs| config.seconds_to_frames(secs)),
            min_offset_gap: options.min_offset_gap,
            max_alternates: options.max_alternates.max(1),
        }
    }
}

/// Winning `(file, offset)` cell over all candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BestMatch {
    pub file: String,
    pub offset: i64,
    pub confidence: usize,
}

/// The single most-voted cell. Ties go to the lower offset, then the smaller
/// file name.
pub fn best_match(candidates: &[Candidate<'_>]) -> Option<BestMatch> {
    let mut histogram: HashMap<i64, HashMap<&str, usize>> = HashMap::new();
    for candidate in candidates {
        *histogram
            .entry(candidate.offset)
            .or_default()
            .entry(candidate.file)
            .or_default() += 1;
    }

    histogram
        .iter()
        .flat_map(|(&offset, files)| files.iter().map(move |(&file, &count)| (file, offset, count)))
        .max_by(|a, b| {
            a.2.cmp(&b.2)
                .then_with(|| b.1.cmp(&a.1))
                .then_with(|| b.0.cmp(a.0))
        })
        .map(|(file, offset, confidence)| BestMatch {
            file: file.to_string(),
            offset,
            confidence,
        })
}

/// One histogram cell after locality has been applied.
#[derive(Debug, Clone, Copy)]
struct Cell {
    offset: i64,
    confidence: f64,
    start_frame: u32,
    span: u32,
}

/// Ranked hypotheses for every file that survives filtering.
pub fn consensus(
    candidates: &[Candidate<'_>],
    params: &ConsensusParams,
    config: &FingerprintConfig,
) -> BTreeMap<String, MatchInfo> {
    let mut histogram: HashMap<&str, HashMap<i64, Vec<u32>>> = HashMap::new();
    for candidate in candidates {
        histogram
            .entry(candidate.file)
            .or_default()
            .entry(candidate.offset)
            .or_default()
            .push(candidate.query_frame);
    }

    let ranking_table = if params.locality_frames.is_some() {
        RANKINGS_LOCALITY
    } else {
        RANKINGS_NO_LOCALITY
    };

    let mut results = BTreeMap::new();
    for (file, offsets) in histogram {
        let mut cells: Vec<Cell> = offsets
            .into_iter()
            .map(|(offset, mut frames)| {
                frames.sort_unstable();
                score_cell(offset, &frames, params.locality_frames)
            })
            .collect();
        let mean = cells.iter().map(|c| c.confidence).sum::<f64>() / cells.len() as f64;

        cells.retain(|c| {
            c.confidence >= params.filter_matches
                && params
                    .max_lag_frames
                    .is_none_or(|max| (c.offset as f64).abs() <= max)
        });
        cells.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.offset.cmp(&b.offset))
        });

        let selected = select_separated(
            cells,
            |c| (c.offset, c.confidence),
            params.min_offset_gap as i64,
            params.locality_filter_prop,
            params.max_alternates,
        );
        if selected.is_empty() {
            continue;
        }

        let confidences: Vec<f64> = selected.iter().map(|c| c.confidence).collect();
        let strengths: Vec<f64> = confidences
            .iter()
            .map(|c| if mean > 0.0 { c / mean } else { 0.0 })
            .collect();
        let rankings = rank_hypotheses(&confidences, &strengths, ranking_table);

        let hypotheses = selected
            .iter()
            .zip(rankings)
            .map(|(cell, ranking)| Hypothesis {
                offset_frames: cell.offset,
                offset_seconds: round5(config.frames_to_seconds(cell.offset as f64)),
                confidence: cell.confidence,
                match_time: round5(config.frames_to_seconds(cell.start_frame as f64)),
                locality_frames: cell.span,
                locality_seconds: round5(config.frames_to_seconds(cell.span as f64)),
                ranking,
            })
            .collect();
        results.insert(file.to_string(), MatchInfo { hypotheses });
    }

    results
}

/// Confidence, start and span of one offset's supporting query frames.
/// `frames` must be sorted. With a locality window the confidence is the most
/// frames that fit inside any one window.
fn score_cell(offset: i64, frames: &[u32], locality: Option<u32>) -> Cell {
    let first = frames.first().copied().unwrap_or(0);
    let last = frames.last().copied().unwrap_or(0);
    let Some(window) = locality else {
        return Cell {
            offset,
            confidence: frames.len() as f64,
            start_frame: first,
            span: last - first,
        };
    };

    let mut best = (0usize, first, 0u32);
    let mut lo = 0;
    for hi in 0..frames.len() {
        while frames[hi] - frames[lo] > window {
            lo += 1;
        }
        let count = hi - lo + 1;
        if count > best.0 {
            best = (count, frames[lo], frames[hi] - frames[lo]);
        }
    }
    Cell {
        offset,
        confidence: best.0 as f64,
        start_frame: best.1,
        span: best.2,
    }
}

/// Walks `sorted` (strongest first) keeping entries whose offset is more than
/// `min_gap` away from every kept one. Entries weaker than `prop` times the
/// strongest are dropped. Stops at `max` kept entries.
pub fn select_separated<T>(
    sorted: Vec<T>,
    key: impl Fn(&T) -> (i64, f64),
    min_gap: i64,
    prop: Option<f64>,
    max: usize,
) -> Vec<T> {
    let mut kept: Vec<T> = Vec::new();
    let mut top = None;
    for item in sorted {
        if kept.len() >= max {
            break;
        }
        let (offset, confidence) = key(&item);
        let top_confidence = *top.get_or_insert(confidence);
        if let Some(prop) = prop {
            if confidence < prop * top_confidence {
                continue;
            }
        }
        if kept.iter().any(|k| (key(k).0 - offset).abs() <= min_gap) {
            continue;
        }
        kept.push(item);
    }
    kept
}

/// Scores 1..=10 per hypothesis: a base score from how far the hypothesis
/// stands above the background, adjusted by how close the next one trails it.
pub fn rank_hypotheses(confidences: &[f64], strengths: &[f64], table: &[(f64, u8)]) -> Vec<u8> {
    confidences
        .iter()
        .zip(strengths)
        .enumerate()
        .map(|(i, (&confidence, &strength))| {
            let base = table
                .iter()
                .find(|(threshold, _)| strength >= *threshold)
                .map_or(1, |&(_, score)| score) as i16;
            let ratio = match confidences.get(i + 1) {
                Some(&next) if confidence > 0.0 => next / confidence,
                _ => 0.0,
            };
            let minus = RANKINGS_MINUS
                .iter()
                .find(|(threshold, _)| ratio >= *threshold)
                .map_or(0, |&(_, minus)| minus) as i16;
            (base - minus).clamp(1, 10) as u8
        })
        .collect()
}

fn round5(value: f64) -> f64 {
    (value * 1e5).round() / 1e5
}
