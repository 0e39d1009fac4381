//! Score post-processing applied before log-softmax.
//!
//! Three transforms run in order on the raw `(lanes, vocab)` score rows:
//! repetition penalty, minimum-length end-marker suppression, and no-repeat n-gram banning.

use std::collections::BTreeSet;

use crate::error::{DecodeError, Result};
use crate::inference::ngram::NgramBanTracker;

/// Applies repetition, minimum-length and n-gram constraints to raw scores in place.
#[derive(Debug, Clone)]
pub struct PenaltyEngine {
    pub repetition_penalty: f32,
    pub min_length: usize,
    pub eos_token_ids: Vec<u32>,
    ngram: NgramBanTracker,
}

impl PenaltyEngine {
    #[must_use]
    pub fn new(
        repetition_penalty: f32,
        no_repeat_ngram_size: usize,
        min_length: usize,
        eos_token_ids: Vec<u32>,
    ) -> Self {
        Self {
            repetition_penalty,
            min_length,
            eos_token_ids,
            ngram: NgramBanTracker::new(no_repeat_ngram_size),
        }
    }

    /// Post-process `scores` for generation step `step`.
    ///
    /// `histories` holds one row per lane with exactly `step` tokens each; at step 0 the rows
    /// are empty and only minimum-length suppression can apply.
    ///
    /// # Errors
    /// Returns [`DecodeError::ShapeMismatch`] when lane counts, history lengths, or token ids
    /// do not fit the score matrix.
    pub fn apply(
        &self,
        scores: &mut [Vec<f32>],
        histories: &[Vec<u32>],
        step: usize,
    ) -> Result<()> {
        DecodeError::check("history lanes", scores.len(), histories.len())?;
        for history in histories {
            DecodeError::check("history length", step, history.len())?;
        }
        let has_history = step > 0;

        if has_history && (self.repetition_penalty - 1.0).abs() > f32::EPSILON {
            for (row, history) in scores.iter_mut().zip(histories) {
                let distinct: BTreeSet<u32> = history.iter().copied().collect();
                for token in distinct {
                    let score = score_mut(row, token)?;
                    // Negative scores are multiplied so the penalty always lowers them.
                    if *score < 0.0 {
                        *score *= self.repetition_penalty;
                    } else {
                        *score /= self.repetition_penalty;
                    }
                }
            }
        }

        if step < self.min_length {
            for row in scores.iter_mut() {
                for &eos in &self.eos_token_ids {
                    *score_mut(row, eos)? = f32::NEG_INFINITY;
                }
            }
        }

        if has_history && self.ngram.is_enabled() {
            let banned = self.ngram.banned_tokens(histories);
            for (row, tokens) in scores.iter_mut().zip(banned) {
                for token in tokens {
                    *score_mut(row, token)? = f32::NEG_INFINITY;
                }
            }
        }

        Ok(())
    }
}

fn score_mut(row: &mut [f32], token: u32) -> Result<&mut f32> {
    let vocab = row.len();
    row.get_mut(token as usize)
        .ok_or(DecodeError::ShapeMismatch {
            what: "token id within vocabulary",
            expected: vocab,
            actual: token as usize,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(rep: f32, ngram: usize, min_len: usize) -> PenaltyEngine {
        PenaltyEngine::new(rep, ngram, min_len, vec![4])
    }

    #[test]
    fn test_repetition_penalty_halves_positive_score() {
        let mut scores = vec![vec![1.0, 1.0, 1.0, 3.0, 1.0]];
        engine(2.0, 0, 0).apply(&mut scores, &[vec![3]], 1).unwrap();
        assert!((scores[0][3] - 1.5).abs() < 1e-6);
        assert!((scores[0][0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_repetition_penalty_multiplies_negative_score() {
        let mut scores = vec![vec![-2.0, 0.0, 0.0, 0.0, 0.0]];
        engine(2.0, 0, 0)
            .apply(&mut scores, &[vec![0, 0]], 2)
            .unwrap();
        // Applied once per distinct token, not per occurrence.
        assert!((scores[0][0] + 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_repetition_penalty_skipped_at_step_zero() {
        let mut scores = vec![vec![3.0; 5]];
        engine(2.0, 0, 0).apply(&mut scores, &[vec![]], 0).unwrap();
        assert!(scores[0].iter().all(|&v| (v - 3.0).abs() < 1e-6));
    }

    #[test]
    fn test_min_length_blocks_eos_on_every_lane() {
        let mut scores = vec![vec![0.0, 0.0, 0.0, 0.0, 10.0]; 3];
        engine(1.0, 0, 1)
            .apply(&mut scores, &[vec![], vec![], vec![]], 0)
            .unwrap();
        assert!(scores.iter().all(|row| row[4] == f32::NEG_INFINITY));

        let mut scores = vec![vec![0.0, 0.0, 0.0, 0.0, 10.0]];
        engine(1.0, 0, 1).apply(&mut scores, &[vec![1]], 1).unwrap();
        assert!(scores[0][4].is_finite());
    }

    #[test]
    fn test_ngram_ban_sets_neg_inf() {
        let mut scores = vec![vec![0.5; 5], vec![0.5; 5]];
        let histories = vec![vec![1, 2, 1], vec![3, 3, 3]];
        engine(1.0, 2, 0).apply(&mut scores, &histories, 3).unwrap();
        assert_eq!(scores[0][2], f32::NEG_INFINITY);
        assert_eq!(scores[1][3], f32::NEG_INFINITY);
        assert_eq!(scores[0].iter().filter(|v| v.is_finite()).count(), 4);
    }

    #[test]
    fn test_shape_mismatch_is_an_error() {
        let mut scores = vec![vec![0.0; 5]];
        let err = engine(1.0, 0, 0).apply(&mut scores, &[vec![], vec![]], 0);
        assert!(matches!(err, Err(DecodeError::ShapeMismatch { .. })));

        let err = engine(1.0, 0, 0).apply(&mut scores, &[vec![1]], 2);
        assert!(matches!(err, Err(DecodeError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_eos_outside_vocab_is_an_error() {
        let mut scores = vec![vec![0.0; 3]];
        let err = engine(1.0, 0, 5).apply(&mut scores, &[vec![]], 0);
        assert!(matches!(err, Err(DecodeError::ShapeMismatch { .. })));
    }
}
