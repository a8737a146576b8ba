use std::collections::BTreeSet;
use std::sync::Mutex;

use ensemble_types::round3;

/// A node's declared capability tags plus fuzzy matching of free-text
/// requirement strings against them.
///
/// Plain substring matching is too brittle for requirement phrases produced
/// by an upstream decomposition step, so scoring uses Ratcliff/Obershelp
/// character-sequence similarity: graceful degradation without semantic
/// embeddings.
pub struct CapabilityMatcher {
    tags: Mutex<BTreeSet<String>>,
}

impl CapabilityMatcher {
    /// Build a matcher from declared tags. Tags are lower-cased and
    /// deduplicated (set semantics).
    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tags = tags
            .into_iter()
            .map(|t| t.as_ref().to_lowercase())
            .collect();
        Self {
            tags: Mutex::new(tags),
        }
    }

    /// Add a tag. Idempotent.
    pub fn add(&self, tag: &str) {
        let mut tags = self.tags.lock().unwrap_or_else(|e| e.into_inner());
        tags.insert(tag.to_lowercase());
    }

    /// Remove a tag. Idempotent.
    pub fn remove(&self, tag: &str) {
        let mut tags = self.tags.lock().unwrap_or_else(|e| e.into_inner());
        tags.remove(&tag.to_lowercase());
    }

    /// Snapshot of the declared tags, sorted.
    pub fn list(&self) -> Vec<String> {
        let tags = self.tags.lock().unwrap_or_else(|e| e.into_inner());
        tags.iter().cloned().collect()
    }

    /// Score `requirement` against every declared tag and return the best
    /// similarity ratio, in [0, 1] rounded to three decimals. An empty
    /// capability set scores 0.0.
    pub fn match_requirement(&self, requirement: &str) -> f64 {
        let requirement = requirement.to_lowercase();
        let tags = self.tags.lock().unwrap_or_else(|e| e.into_inner());
        let best = tags
            .iter()
            .map(|tag| sequence_ratio(tag, &requirement))
            .fold(0.0_f64, f64::max);
        round3(best)
    }

    /// Whether the best match reaches `threshold`.
    pub fn match_and_filter(&self, requirement: &str, threshold: f64) -> bool {
        self.match_requirement(requirement) >= threshold
    }
}

/// Ratcliff/Obershelp similarity of two strings: twice the total size of
/// all matching blocks over the combined length. Symmetric, 1.0 for equal
/// strings, 0.0 for disjoint ones.
pub fn sequence_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let matched = matching_total(&a, &b);
    2.0 * matched as f64 / (a.len() + b.len()) as f64
}

/// Total size of matching blocks: the longest common substring, then the
/// same recursively on the pieces to its left and right.
fn matching_total(a: &[char], b: &[char]) -> usize {
    let (ai, bi, size) = longest_block(a, b);
    if size == 0 {
        return 0;
    }
    size + matching_total(&a[..ai], &b[..bi]) + matching_total(&a[ai + size..], &b[bi + size..])
}

/// Longest common substring of `a` and `b`, earliest occurrence first.
/// Returns (start in a, start in b, length).
fn longest_block(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let mut best = (0, 0, 0);
    let mut prev = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        let mut cur = vec![0usize; b.len() + 1];
        for (j, cb) in b.iter().enumerate() {
            if ca == cb {
                let run = prev[j] + 1;
                cur[j + 1] = run;
                if run > best.2 {
                    best = (i + 1 - run, j + 1 - run, run);
                }
            }
        }
        prev = cur;
    }
    best
}
