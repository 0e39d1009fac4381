//! No-repeat n-gram banning.
//!
//! For each lane, every n-gram in its history is indexed by its first `n - 1` tokens. The
//! tokens banned for the next step are those that followed the lane's current `n - 1`-token
//! suffix anywhere earlier in its history. The index is rebuilt from the lane's current
//! history row on every call: rows are permuted between steps, so a lane index carries no
//! identity of its own.

use std::collections::{BTreeSet, HashMap};

/// Stateless n-gram ban calculator for a fixed window size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NgramBanTracker {
    n: usize,
}

impl NgramBanTracker {
    /// `n == 0` disables banning.
    #[must_use]
    pub fn new(n: usize) -> Self {
        Self { n }
    }

    #[must_use]
    pub fn ngram_size(&self) -> usize {
        self.n
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.n > 0
    }

    /// Banned continuation sets, one per lane, in lane order.
    #[must_use]
    pub fn banned_tokens(&self, histories: &[Vec<u32>]) -> Vec<BTreeSet<u32>> {
        histories
            .iter()
            .map(|history| self.banned_for_lane(history))
            .collect()
    }

    /// Tokens that would complete an n-gram already present in `history`.
    #[must_use]
    pub fn banned_for_lane(&self, history: &[u32]) -> BTreeSet<u32> {
        let n = self.n;
        let cur_len = history.len();
        if n == 0 || cur_len + 1 < n {
            return BTreeSet::new();
        }

        let mut seen: HashMap<&[u32], BTreeSet<u32>> = HashMap::new();
        for ngram in history.windows(n) {
            let (prefix, last) = ngram.split_at(n - 1);
            seen.entry(prefix).or_default().insert(last[0]);
        }

        let suffix = &history[cur_len + 1 - n..];
        seen.remove(suffix).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(tokens: &[u32]) -> BTreeSet<u32> {
        tokens.iter().copied().collect()
    }

    #[test]
    fn test_disabled_bans_nothing() {
        let tracker = NgramBanTracker::new(0);
        assert!(tracker.banned_for_lane(&[1, 2, 1, 2, 1]).is_empty());
    }

    #[test]
    fn test_short_history_bans_nothing() {
        let tracker = NgramBanTracker::new(3);
        // cur_len + 1 < n
        assert!(tracker.banned_for_lane(&[7]).is_empty());
        assert!(tracker.banned_for_lane(&[]).is_empty());
    }

    #[test]
    fn test_bigram_bans_follower_of_last_token() {
        let tracker = NgramBanTracker::new(2);
        // "1 2" and "1 3" were seen; the lane ends on 1.
        assert_eq!(tracker.banned_for_lane(&[1, 2, 1, 3, 1]), set(&[2, 3]));
        // Ends on 3, which was never followed by anything.
        assert!(tracker.banned_for_lane(&[1, 2, 1, 3]).is_empty());
    }

    #[test]
    fn test_trigram_uses_two_token_suffix() {
        let tracker = NgramBanTracker::new(3);
        let banned = tracker.banned_for_lane(&[5, 6, 7, 5, 6]);
        assert_eq!(banned, set(&[7]));
    }

    #[test]
    fn test_unigram_bans_every_seen_token() {
        let tracker = NgramBanTracker::new(1);
        assert_eq!(tracker.banned_for_lane(&[4, 9, 4]), set(&[4, 9]));
    }

    #[test]
    fn test_lanes_are_independent() {
        let tracker = NgramBanTracker::new(2);
        let histories = vec![vec![1, 2, 1], vec![1, 3, 3]];
        let banned = tracker.banned_tokens(&histories);
        assert_eq!(banned.len(), 2);
        assert_eq!(banned[0], set(&[2]));
        assert_eq!(banned[1], set(&[3]));
    }
}
