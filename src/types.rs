//! Match result shapes shared by every recognizer.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AlignError;

/// Candidate-generation front end used by an alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Technique {
    Fingerprints,
    Correlation,
    Visual,
}

impl FromStr for Technique {
    type Err = AlignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fingerprints" | "fingerprint" => Ok(Technique::Fingerprints),
            "correlation" => Ok(Technique::Correlation),
            "visual" => Ok(Technique::Visual),
            _ => Err(AlignError::InvalidTechnique(s.to_string())),
        }
    }
}

impl fmt::Display for Technique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Technique::Fingerprints => "fingerprints",
            Technique::Correlation => "correlation",
            Technique::Visual => "visual",
        };
        f.write_str(name)
    }
}

/// One ranked explanation of how a partner file lines up with the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    /// Partner position minus query position, in analysis frames (samples
    /// for correlation).
    pub offset_frames: i64,
    /// Same offset in seconds. Positive means the shared audio sits later in
    /// the partner than in the query.
    pub offset_seconds: f64,
    /// Higher is better; units depend on the technique.
    pub confidence: f64,
    /// Seconds into the query where the supporting evidence starts.
    pub match_time: f64,
    pub locality_frames: u32,
    pub locality_seconds: f64,
    /// 1 (weak) to 10 (unambiguous).
    pub ranking: u8,
}

/// Hypotheses for one partner, best first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchInfo {
    pub hypotheses: Vec<Hypothesis>,
}

impl MatchInfo {
    pub fn best(&self) -> Option<&Hypothesis> {
        self.hypotheses.first()
    }

    pub fn get(&self, index: usize) -> Option<&Hypothesis> {
        self.hypotheses.get(index)
    }
}

/// Everything one query matched. A query that matched nothing has no
/// `MatchResult` at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub query: String,
    pub technique: Technique,
    /// Hashes in the query; zero for techniques that do not hash.
    pub hash_count: usize,
    pub elapsed_seconds: f64,
    pub match_info: BTreeMap<String, MatchInfo>,
}

impl MatchResult {
    /// Re-expresses the seconds of every hypothesis for a query that was cut
    /// to begin `seconds` into its file. Frame offsets stay relative to the
    /// analysed excerpt.
    pub fn shift_query_start(&mut self, seconds: f64) {
        for info in self.match_info.values_mut() {
            for hypothesis in &mut info.hypotheses {
                hypothesis.offset_seconds = round5(hypothesis.offset_seconds - seconds);
                hypothesis.match_time = round5(hypothesis.match_time + seconds);
            }
        }
    }
}

fn round5(value: f64) -> f64 {
    (value * 1e5).round() / 1e5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn technique_parsing() {
        assert_eq!("fingerprints".parse::<Technique>().unwrap(), Technique::Fingerprints);
        assert_eq!("Correlation".parse::<Technique>().unwrap(), Technique::Correlation);
        assert_eq!("visual".parse::<Technique>().unwrap(), Technique::Visual);
        let err = "telepathy".parse::<Technique>().unwrap_err();
        assert!(matches!(err, AlignError::InvalidTechnique(ref t) if t == "telepathy"));
    }

    #[test]
    fn trimmed_query_times_refer_to_the_whole_file() {
        let hypothesis = Hypothesis {
            offset_frames: 16,
            offset_seconds: 1.0,
            confidence: 12.0,
            match_time: 0.5,
            locality_frames: 0,
            locality_seconds: 0.0,
            ranking: 6,
        };
        let mut result = MatchResult {
            query: "target.wav".into(),
            technique: Technique::Fingerprints,
            hash_count: 40,
            elapsed_seconds: 0.0,
            match_info: [(
                "other.wav".to_string(),
                MatchInfo {
                    hypotheses: vec![hypothesis],
                },
            )]
            .into(),
        };
        result.shift_query_start(2.25);
        let best = result.match_info["other.wav"].best().unwrap();
        assert_eq!(best.offset_seconds, -1.25);
        assert_eq!(best.match_time, 2.75);
        assert_eq!(best.offset_frames, 16);
    }

    #[test]
    fn technique_display_parses_back() {
        for technique in [Technique::Fingerprints, Technique::Correlation, Technique::Visual] {
            assert_eq!(technique.to_string().parse::<Technique>().unwrap(), technique);
        }
    }
}
