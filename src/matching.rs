//! Hash co-occurrence search between a query and stored fingerprints.

use crate::hashing::Fingerprints;

/// One shared hash occurrence between the query and a stored file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate<'a> {
    pub file: &'a str,
    /// Stored frame minus query frame.
    pub offset: i64,
    /// Frame in the query where the hash occurred.
    pub query_frame: u32,
}

/// Every `(stored file, offset)` co-occurrence of the query's hashes.
///
/// A hash seen `k` times in the query and `m` times in a stored file yields
/// `k × m` candidates. Nothing is filtered; `exclude` skips one stored name,
/// normally the query itself.
pub fn find_candidates<'a>(
    query: &Fingerprints,
    entries: impl IntoIterator<Item = (&'a str, &'a Fingerprints)>,
    exclude: Option<&str>,
) -> Vec<Candidate<'a>> {
    let mut candidates = Vec::new();

    for (name, stored) in entries {
        if exclude == Some(name) {
            continue;
        }
        // walk whichever side has fewer distinct hashes
        if query.len() <= stored.len() {
            for (hash, query_frames) in query.iter() {
                if let Some(stored_frames) = stored.get(hash) {
                    push_pairs(&mut candidates, name, stored_frames, query_frames);
                }
            }
        } else {
            for (hash, stored_frames) in stored.iter() {
                if let Some(query_frames) = query.get(hash) {
                    push_pairs(&mut candidates, name, stored_frames, query_frames);
                }
            }
        }
    }

    tracing::debug!("found {} candidate matches", candidates.len());
    candidates
}

fn push_pairs<'a>(out: &mut Vec<Candidate<'a>>, file: &'a str, stored: &[u32], query: &[u32]) {
    for &query_frame in query {
        for &stored_frame in stored {
            out.push(Candidate {
                file,
                offset: stored_frame as i64 - query_frame as i64,
                query_frame,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combinatorial_pairs_per_shared_hash() {
        let query: Fingerprints = vec![(1, 0), (1, 10), (2, 5)].into_iter().collect();
        let stored: Fingerprints = vec![(1, 3), (1, 13), (1, 23), (3, 0)].into_iter().collect();
        let candidates = find_candidates(&query, [("s.wav", &stored)], None);
        // hash 1: 2 query × 3 stored; hash 2 and 3 unshared
        assert_eq!(candidates.len(), 6);
        let mut offsets: Vec<i64> = candidates.iter().map(|c| c.offset).collect();
        offsets.sort();
        assert_eq!(offsets, vec![-7, 3, 3, 13, 13, 23]);
    }

    #[test]
    fn exclusion_skips_the_named_file() {
        let query: Fingerprints = vec![(1, 0)].into_iter().collect();
        let entries = [("self.wav", &query), ("other.wav", &query)];
        let candidates = find_candidates(&query, entries, Some("self.wav"));
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].file, "other.wav");
        assert_eq!(candidates[0].offset, 0);
    }

    #[test]
    fn empty_query_matches_nothing() {
        let stored: Fingerprints = vec![(1, 0)].into_iter().collect();
        assert!(find_candidates(&Fingerprints::new(), [("s.wav", &stored)], None).is_empty());
    }

    #[test]
    fn iteration_side_does_not_change_results() {
        let small: Fingerprints = vec![(1, 2)].into_iter().collect();
        let large: Fingerprints = vec![(1, 9), (2, 0), (3, 0)].into_iter().collect();
        let a = find_candidates(&small, [("l", &large)], None);
        let b = find_candidates(&large, [("s", &small)], None);
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].offset, 7);
        assert_eq!(b[0].offset, -7);
        assert_eq!(b[0].query_frame, 9);
    }
}
