//! Per-step beam expansion.
//!
//! Turns post-processed score rows into log-probabilities, extends every live beam, keeps the
//! best `num_beams` continuations per batch item, and reports the lane permutation the caller
//! uses to gather history, context window, and cache rows.

use std::cmp::Ordering;

use crate::error::{DecodeError, Result};

/// Result of one beam step. All vectors are lane-ordered (`batch_size * num_beams`).
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    /// Cumulative score of each new lane.
    pub beam_scores: Vec<f32>,
    /// Beam within the batch item each new lane continues from.
    pub beam_ids: Vec<usize>,
    /// Token appended to each new lane.
    pub tokens: Vec<u32>,
    /// Source lane for each new lane: `batch_item * num_beams + beam_id`.
    pub permutation: Vec<u32>,
}

/// Top-k beam selection over a `(batch_size * num_beams, vocab)` score matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeamStepper {
    batch_size: usize,
    num_beams: usize,
}

impl BeamStepper {
    #[must_use]
    pub fn new(batch_size: usize, num_beams: usize) -> Self {
        Self {
            batch_size,
            num_beams,
        }
    }

    #[must_use]
    pub fn num_lanes(&self) -> usize {
        self.batch_size * self.num_beams
    }

    /// Select the next `num_beams` hypotheses for every batch item.
    ///
    /// At step 0 every lane of an item holds the same prefix, so only the item's first lane
    /// is expanded and `beam_scores` is ignored. Later steps rank
    /// `beam_scores[lane] + log_prob[lane, token]` over the item's `num_beams * vocab`
    /// candidates. Ties go to the lower flattened index (lower beam, then lower token).
    ///
    /// # Errors
    /// Returns [`DecodeError::ShapeMismatch`] if the score matrix or `beam_scores` disagree
    /// with the lane count or `vocab_size`, or if the vocabulary is smaller than the beam.
    #[allow(clippy::cast_possible_truncation)]
    pub fn step(
        &self,
        scores: &[Vec<f32>],
        beam_scores: &[f32],
        step: usize,
        vocab_size: usize,
    ) -> Result<StepOutput> {
        let lanes = self.num_lanes();
        DecodeError::check("score lanes", lanes, scores.len())?;
        DecodeError::check("beam score lanes", lanes, beam_scores.len())?;
        for row in scores {
            DecodeError::check("vocabulary size", vocab_size, row.len())?;
        }
        if vocab_size < self.num_beams {
            return Err(DecodeError::ShapeMismatch {
                what: "vocabulary at least as wide as the beam",
                expected: self.num_beams,
                actual: vocab_size,
            });
        }

        let log_probs: Vec<Vec<f32>> = scores.iter().map(|row| log_softmax(row)).collect();

        let mut out = StepOutput {
            beam_scores: Vec::with_capacity(lanes),
            beam_ids: Vec::with_capacity(lanes),
            tokens: Vec::with_capacity(lanes),
            permutation: Vec::with_capacity(lanes),
        };

        for item in 0..self.batch_size {
            let offset = item * self.num_beams;
            let candidates: Vec<(usize, f32)> = if step == 0 {
                log_probs[offset].iter().copied().enumerate().collect()
            } else {
                (0..self.num_beams)
                    .flat_map(|beam| {
                        let base = beam_scores[offset + beam];
                        log_probs[offset + beam]
                            .iter()
                            .enumerate()
                            .map(move |(token, &lp)| (beam * vocab_size + token, base + lp))
                    })
                    .collect()
            };

            for (flat, score) in top_k(candidates, self.num_beams) {
                let beam_id = flat / vocab_size;
                out.beam_scores.push(rank_key(score));
                out.beam_ids.push(beam_id);
                out.tokens.push((flat % vocab_size) as u32);
                out.permutation.push((offset + beam_id) as u32);
            }
        }

        Ok(out)
    }
}

/// Numerically stable `ln(softmax(row))`.
///
/// `+inf` entries share all of the mass (`-ln(count)` each, everything else `-inf`). A row
/// with no finite or `+inf` value maps to all `-inf`. NaN entries get `-inf`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn log_softmax(row: &[f32]) -> Vec<f32> {
    let is_pos_inf = |v: f32| v.is_infinite() && v.is_sign_positive();
    let pos_inf = row.iter().filter(|&&v| is_pos_inf(v)).count();
    if pos_inf > 0 {
        let share = -(pos_inf as f32).ln();
        return row
            .iter()
            .map(|&v| if is_pos_inf(v) { share } else { f32::NEG_INFINITY })
            .collect();
    }

    let max = row
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return vec![f32::NEG_INFINITY; row.len()];
    }

    let sum: f32 = row
        .iter()
        .map(|&v| if v.is_nan() { 0.0 } else { (v - max).exp() })
        .sum();
    let log_sum = sum.ln();

    row.iter()
        .map(|&v| {
            if v.is_nan() {
                f32::NEG_INFINITY
            } else {
                v - max - log_sum
            }
        })
        .collect()
}

/// NaN ranks as `-inf` so selection is total and never panics.
fn rank_key(v: f32) -> f32 {
    if v.is_nan() { f32::NEG_INFINITY } else { v }
}

/// Descending by score, ascending by index on ties.
fn compare(a: &(usize, f32), b: &(usize, f32)) -> Ordering {
    rank_key(b.1)
        .partial_cmp(&rank_key(a.1))
        .unwrap_or(Ordering::Equal)
        .then(a.0.cmp(&b.0))
}

/// The `k` best `(index, score)` pairs, best first.
fn top_k(mut candidates: Vec<(usize, f32)>, k: usize) -> Vec<(usize, f32)> {
    if k == 0 {
        return Vec::new();
    }
    if candidates.len() > k {
        candidates.select_nth_unstable_by(k - 1, compare);
        candidates.truncate(k);
    }
    candidates.sort_by(compare);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_softmax_is_normalised() {
        let lp = log_softmax(&[1.0, 2.0, 3.0]);
        let total: f32 = lp.iter().map(|v| v.exp()).sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert!(lp.iter().all(|&v| v <= 0.0));
    }

    #[test]
    fn test_log_softmax_large_logits_do_not_overflow() {
        let lp = log_softmax(&[1000.0, 1000.0]);
        assert!((lp[0] - (0.5_f32).ln()).abs() < 1e-5);
    }

    #[test]
    fn test_log_softmax_keeps_masked_entries_at_neg_inf() {
        let lp = log_softmax(&[0.0, f32::NEG_INFINITY]);
        assert_eq!(lp[1], f32::NEG_INFINITY);
        assert!(lp[0].abs() < 1e-6);
    }

    #[test]
    fn test_log_softmax_all_masked() {
        let lp = log_softmax(&[f32::NEG_INFINITY; 3]);
        assert!(lp.iter().all(|&v| v == f32::NEG_INFINITY));
    }

    #[test]
    fn test_step_zero_expands_first_lane_only() {
        let stepper = BeamStepper::new(1, 2);
        // Lane 1 would prefer token 0, but at step 0 only lane 0 counts.
        let scores = vec![vec![0.0, 5.0, 4.0], vec![9.0, 0.0, 0.0]];
        let out = stepper.step(&scores, &[0.0, 0.0], 0, 3).unwrap();
        assert_eq!(out.tokens, vec![1, 2]);
        assert_eq!(out.beam_ids, vec![0, 0]);
        assert_eq!(out.permutation, vec![0, 0]);
    }

    #[test]
    fn test_later_steps_add_beam_scores() {
        let stepper = BeamStepper::new(1, 2);
        let scores = vec![vec![0.0, 0.0], vec![0.0, 0.0]];
        // Beam 1 is far ahead, so both continuations come from it.
        let out = stepper.step(&scores, &[-10.0, -1.0], 3, 2).unwrap();
        assert_eq!(out.beam_ids, vec![1, 1]);
        assert_eq!(out.tokens, vec![0, 1]);
        assert_eq!(out.permutation, vec![1, 1]);
        let expected = -1.0 + (0.5_f32).ln();
        assert!((out.beam_scores[0] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_ties_prefer_lower_beam_then_lower_token() {
        let stepper = BeamStepper::new(1, 3);
        let scores = vec![vec![0.0; 4]; 3];
        let out = stepper.step(&scores, &[0.0, 0.0, 0.0], 1, 4).unwrap();
        assert_eq!(out.beam_ids, vec![0, 0, 0]);
        assert_eq!(out.tokens, vec![0, 1, 2]);
    }

    #[test]
    fn test_permutation_is_offset_per_batch_item() {
        let stepper = BeamStepper::new(2, 2);
        let scores = vec![
            vec![0.0, 1.0],
            vec![0.0, 1.0],
            vec![3.0, 0.0],
            vec![0.0, 3.0],
        ];
        let out = stepper.step(&scores, &[-5.0, 0.0, 0.0, -5.0], 2, 2).unwrap();
        assert_eq!(out.permutation, vec![1, 1, 2, 2]);
        assert_eq!(out.tokens, vec![1, 0, 0, 1]);
    }

    #[test]
    fn test_all_neg_inf_still_selects_deterministically() {
        let stepper = BeamStepper::new(1, 2);
        let scores = vec![vec![f32::NEG_INFINITY; 3]; 2];
        let out = stepper
            .step(&scores, &[f32::NEG_INFINITY, f32::NEG_INFINITY], 4, 3)
            .unwrap();
        assert_eq!(out.tokens, vec![0, 1]);
        assert_eq!(out.beam_ids, vec![0, 0]);
        assert!(out.beam_scores.iter().all(|&s| s == f32::NEG_INFINITY));
    }

    #[test]
    fn test_log_softmax_positive_infinity_takes_all_mass() {
        let lp = log_softmax(&[f32::INFINITY, 0.0, 0.0]);
        assert_eq!(lp, vec![0.0, f32::NEG_INFINITY, f32::NEG_INFINITY]);

        let lp = log_softmax(&[f32::INFINITY, 1.0, f32::INFINITY]);
        assert!((lp[0] - (0.5_f32).ln()).abs() < 1e-6);
        assert_eq!(lp[1], f32::NEG_INFINITY);
        assert_eq!(lp[0], lp[2]);
    }

    #[test]
    fn test_step_never_stores_nan_scores() {
        let stepper = BeamStepper::new(1, 2);
        let scores = vec![vec![f32::INFINITY, 0.0, f32::NAN], vec![0.0, 0.0, 0.0]];
        let out = stepper.step(&scores, &[0.0, 0.0], 0, 3).unwrap();
        assert_eq!(out.tokens[0], 0);
        assert_eq!(out.beam_scores[0], 0.0);
        assert!(out.beam_scores.iter().all(|s| !s.is_nan()));

        let out = stepper
            .step(&[vec![0.0; 3], vec![0.0; 3]], &[f32::NAN, -1.0], 1, 3)
            .unwrap();
        assert_eq!(out.beam_ids, vec![1, 1]);
        assert!(out.beam_scores.iter().all(|s| !s.is_nan()));
    }

    #[test]
    fn test_vocab_mismatch_is_an_error() {
        let stepper = BeamStepper::new(1, 1);
        let err = stepper.step(&[vec![0.0; 3]], &[0.0], 0, 4);
        assert!(matches!(err, Err(DecodeError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_beam_wider_than_vocab_is_an_error() {
        let stepper = BeamStepper::new(1, 3);
        let err = stepper.step(&[vec![0.0; 2], vec![0.0; 2], vec![0.0; 2]], &[0.0; 3], 0, 2);
        assert!(matches!(err, Err(DecodeError::ShapeMismatch { .. })));
    }
}
