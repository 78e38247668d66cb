//! Turns pairwise match results into one shared timeline.
//!
//! The reference file is the one matched to the most partners. Files it
//! matched directly take its offsets; everything else is reached through
//! chains of already-placed files until a pass places nothing new.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::types::{Hypothesis, MatchInfo, MatchResult};

/// Per-file shift in seconds, all non-negative, plus the files that could not
/// be placed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShiftTable {
    pub reference: String,
    pub shifts: BTreeMap<String, f64>,
    pub unaligned: Vec<String>,
}

impl ShiftTable {
    pub fn max_shift(&self) -> f64 {
        self.shifts.values().copied().fold(0.0, f64::max)
    }
}

fn link(info: &MatchInfo, match_index: usize) -> Option<&Hypothesis> {
    info.get(match_index)
}

/// Resolves shifts using the hypothesis at `match_index` of every pair.
///
/// Returns `None` when no query matched anything.
pub fn resolve(
    total: &BTreeMap<String, Option<MatchResult>>,
    match_index: usize,
) -> Option<ShiftTable> {
    let reference = choose_reference(total, match_index)?;

    let mut shifts: BTreeMap<String, f64> = BTreeMap::new();
    shifts.insert(reference.clone(), 0.0);
    if let Some(Some(result)) = total.get(&reference) {
        for (partner, info) in &result.match_info {
            if let Some(h) = link(info, match_index) {
                shifts.entry(partner.clone()).or_insert(h.offset_seconds);
            }
        }
    }

    let mut names: BTreeSet<&str> = BTreeSet::new();
    for (name, result) in total {
        names.insert(name.as_str());
        if let Some(result) = result {
            names.extend(result.match_info.keys().map(String::as_str));
        }
    }

    let mut passes = 0;
    loop {
        passes += 1;
        let mut progress = false;
        for &name in &names {
            if shifts.contains_key(name) {
                continue;
            }
            if let Some(shift) = transitive_shift(total, &shifts, name, match_index) {
                tracing::debug!(file = name, shift, "placed through a transitive match");
                shifts.insert(name.to_string(), shift);
                progress = true;
            }
        }
        if !progress {
            break;
        }
    }

    let min = shifts.values().copied().fold(f64::INFINITY, f64::min);
    for shift in shifts.values_mut() {
        *shift = round5(*shift - min);
    }

    let unaligned: Vec<String> = names
        .iter()
        .filter(|n| !shifts.contains_key(**n))
        .map(|n| n.to_string())
        .collect();
    if !unaligned.is_empty() {
        tracing::warn!("could not place {} file(s): {:?}", unaligned.len(), unaligned);
    }
    tracing::debug!(passes, reference = %reference, "resolved shifts");

    Some(ShiftTable {
        reference,
        shifts,
        unaligned,
    })
}

/// Most partners wins; ties go to the larger summed confidence, then to the
/// earlier name.
fn choose_reference(
    total: &BTreeMap<String, Option<MatchResult>>,
    match_index: usize,
) -> Option<String> {
    let mut best: Option<(&str, usize, f64)> = None;
    for (name, result) in total {
        let Some(result) = result else { continue };
        let links: Vec<&Hypothesis> = result
            .match_info
            .values()
            .filter_map(|info| link(info, match_index))
            .collect();
        if links.is_empty() {
            continue;
        }
        let strength: f64 = links.iter().map(|h| h.confidence).sum();
        let better = match best {
            None => true,
            Some((_, count, total_strength)) => {
                links.len() > count || (links.len() == count && strength > total_strength)
            }
        };
        if better {
            best = Some((name.as_str(), links.len(), strength));
        }
    }
    best.map(|(name, _, _)| name.to_string())
}

/// Strongest link from `name` to any placed file, in either direction.
fn transitive_shift(
    total: &BTreeMap<String, Option<MatchResult>>,
    shifts: &BTreeMap<String, f64>,
    name: &str,
    match_index: usize,
) -> Option<f64> {
    let mut best: Option<(f64, f64)> = None;
    let mut consider = |confidence: f64, shift: f64| {
        if best.is_none_or(|(c, _)| confidence > c) {
            best = Some((confidence, shift));
        }
    };

    // its own matches against placed files
    if let Some(Some(result)) = total.get(name) {
        for (partner, info) in &result.match_info {
            if let (Some(&placed), Some(h)) = (shifts.get(partner), link(info, match_index)) {
                consider(h.confidence, placed - h.offset_seconds);
            }
        }
    }

    // placed files that matched it
    for (other, result) in total {
        let (Some(&placed), Some(result)) = (shifts.get(other), result) else {
            continue;
        };
        if let Some(h) = result.match_info.get(name).and_then(|info| link(info, match_index)) {
            consider(h.confidence, placed + h.offset_seconds);
        }
    }

    best.map(|(_, shift)| shift)
}

fn round5(value: f64) -> f64 {
    (value * 1e5).round() / 1e5
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Technique;

    fn hypothesis(offset_seconds: f64, confidence: f64) -> Hypothesis {
        Hypothesis {
            offset_frames: 0,
            offset_seconds,
            confidence,
            match_time: 0.0,
            locality_frames: 0,
            locality_seconds: 0.0,
            ranking: 1,
        }
    }

    fn result(query: &str, links: &[(&str, &[(f64, f64)])]) -> Option<MatchResult> {
        Some(MatchResult {
            query: query.to_string(),
            technique: Technique::Fingerprints,
            hash_count: 0,
            elapsed_seconds: 0.0,
            match_info: links
                .iter()
                .map(|(partner, hs)| {
                    let hypotheses = hs.iter().map(|&(o, c)| hypothesis(o, c)).collect();
                    (partner.to_string(), MatchInfo { hypotheses })
                })
                .collect(),
        })
    }

    #[test]
    fn chained_matches_reach_every_file() {
        let mut total = BTreeMap::new();
        total.insert("a".to_string(), result("a", &[("b", &[(5.0, 50.0)])]));
        total.insert(
            "b".to_string(),
            result("b", &[("a", &[(-5.0, 50.0)]), ("c", &[(-3.0, 40.0)])]),
        );
        total.insert("c".to_string(), result("c", &[("b", &[(3.0, 40.0)])]));
        total.insert("d".to_string(), None);

        let table = resolve(&total, 0).unwrap();
        assert_eq!(table.reference, "b");
        let a = table.shifts["a"];
        let c = table.shifts["c"];
        assert!((c - a - 2.0).abs() < 1e-9);
        assert!(table.shifts.values().all(|&s| s >= 0.0));
        assert_eq!(table.shifts.values().copied().fold(f64::INFINITY, f64::min), 0.0);
        assert_eq!(table.unaligned, vec!["d"]);
    }

    #[test]
    fn one_directional_chain_is_followed() {
        // only a and b reported matches; c appears solely in b's result
        let mut total = BTreeMap::new();
        total.insert(
            "a".to_string(),
            result("a", &[("b", &[(5.0, 10.0)]), ("x", &[(1.0, 10.0)])]),
        );
        total.insert("b".to_string(), result("b", &[("c", &[(-3.0, 10.0)])]));
        total.insert("c".to_string(), None);

        let table = resolve(&total, 0).unwrap();
        assert_eq!(table.reference, "a");
        assert_eq!(table.shifts["a"], 0.0);
        assert_eq!(table.shifts["b"], 5.0);
        assert_eq!(table.shifts["c"], 2.0);
        assert_eq!(table.shifts["x"], 1.0);
        assert!(table.unaligned.is_empty());
    }

    #[test]
    fn ties_on_partner_count_use_confidence() {
        let mut total = BTreeMap::new();
        total.insert("a".to_string(), result("a", &[("b", &[(1.0, 5.0)])]));
        total.insert("b".to_string(), result("b", &[("a", &[(-1.0, 9.0)])]));
        let table = resolve(&total, 0).unwrap();
        assert_eq!(table.reference, "b");
        assert_eq!(table.shifts["a"], 0.0);
        assert_eq!(table.shifts["b"], 1.0);
    }

    #[test]
    fn negative_shifts_are_normalized() {
        let mut total = BTreeMap::new();
        total.insert(
            "file1".to_string(),
            result("file1", &[("file2", &[(2.0, 9.0)]), ("file3", &[(-1.0, 9.0)])]),
        );
        let table = resolve(&total, 0).unwrap();
        assert_eq!(table.shifts["file1"], 1.0);
        assert_eq!(table.shifts["file2"], 3.0);
        assert_eq!(table.shifts["file3"], 0.0);
    }

    #[test]
    fn nothing_matched_resolves_to_none() {
        let mut total = BTreeMap::new();
        total.insert("a".to_string(), None);
        total.insert("b".to_string(), None);
        assert!(resolve(&total, 0).is_none());
    }

    #[test]
    fn alternate_index_uses_lower_ranked_offsets() {
        let mut total = BTreeMap::new();
        total.insert(
            "a".to_string(),
            result("a", &[("b", &[(4.0, 30.0), (7.0, 20.0)]), ("c", &[(1.0, 10.0)])]),
        );
        let first = resolve(&total, 0).unwrap();
        assert_eq!(first.shifts["b"], 4.0);

        let second = resolve(&total, 1).unwrap();
        assert_eq!(second.shifts["b"], 7.0);
        // c has no second hypothesis and cannot be placed at that index
        assert_eq!(second.unaligned, vec!["c"]);
    }

    #[test]
    fn isolated_cycle_terminates() {
        // e and f only match each other, never anything placed
        let mut total = BTreeMap::new();
        total.insert(
            "a".to_string(),
            result("a", &[("b", &[(1.0, 10.0)]), ("c", &[(2.0, 10.0)])]),
        );
        total.insert("e".to_string(), result("e", &[("f", &[(1.0, 3.0)])]));
        total.insert("f".to_string(), result("f", &[("e", &[(-1.0, 3.0)])]));
        let table = resolve(&total, 0).unwrap();
        assert_eq!(table.unaligned, vec!["e", "f"]);
    }
}
