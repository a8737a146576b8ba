use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use ensemble_types::{round3, unix_now, NodeId};

/// Default number of outcome scores retained per peer.
pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

/// Exponential decay applied per step of history age.
const DECAY: f64 = 0.95;

/// Trust score returned for a peer with no recorded history.
const NEUTRAL_TRUST: f64 = 0.5;

struct PeerHistory {
    scores: VecDeque<f64>,
    last_update: i64,
}

/// Bounded, time-ordered outcome history per peer, collapsed on demand
/// into a recency-weighted trust score.
pub struct ReputationTracker {
    capacity: usize,
    histories: Mutex<HashMap<NodeId, PeerHistory>>,
}

impl ReputationTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            histories: Mutex::new(HashMap::new()),
        }
    }

    /// Record one outcome for a peer. Scores are clamped to [0, 1]; the
    /// oldest entry is evicted once the per-peer capacity is exceeded.
    pub fn record_outcome(&self, peer_id: &str, score: f64) {
        let score = score.clamp(0.0, 1.0);
        let mut histories = self.histories.lock().unwrap_or_else(|e| e.into_inner());
        let history = histories
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerHistory {
                scores: VecDeque::new(),
                last_update: 0,
            });
        history.scores.push_back(score);
        while history.scores.len() > self.capacity {
            history.scores.pop_front();
        }
        history.last_update = unix_now();
    }

    /// Recency-weighted trust in [0, 1]: entries are weighted
    /// `DECAY^age` (most recent first) and averaged over the weight sum,
    /// rounded to three decimals. No history yields the neutral 0.5.
    pub fn trust_score(&self, peer_id: &str) -> f64 {
        let histories = self.histories.lock().unwrap_or_else(|e| e.into_inner());
        let Some(history) = histories.get(peer_id) else {
            return NEUTRAL_TRUST;
        };
        if history.scores.is_empty() {
            return NEUTRAL_TRUST;
        }
        let mut weighted_sum = 0.0;
        let mut normalizer = 0.0;
        for (age, score) in history.scores.iter().rev().enumerate() {
            let weight = DECAY.powi(age as i32);
            weighted_sum += score * weight;
            normalizer += weight;
        }
        round3(weighted_sum / normalizer)
    }

    /// Snapshot of trust scores for every known peer.
    pub fn all_scores(&self) -> HashMap<NodeId, f64> {
        let peer_ids: Vec<NodeId> = {
            let histories = self.histories.lock().unwrap_or_else(|e| e.into_inner());
            histories.keys().cloned().collect()
        };
        peer_ids
            .into_iter()
            .map(|id| {
                let score = self.trust_score(&id);
                (id, score)
            })
            .collect()
    }

    /// Unix timestamp of the last recorded outcome for a peer.
    pub fn last_update(&self, peer_id: &str) -> Option<i64> {
        let histories = self.histories.lock().unwrap_or_else(|e| e.into_inner());
        histories.get(peer_id).map(|h| h.last_update)
    }
}

impl Default for ReputationTracker {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
