//! Finished-hypothesis bookkeeping.
//!
//! Keeps the best length-normalised sequence seen so far for each batch item. Lanes captured
//! on an end marker are frozen by setting their cumulative score to `-inf`: the lane keeps its
//! slot and history row but can never again win a top-k selection.

use tracing::trace;

use crate::error::{DecodeError, Result};

/// Best finalised sequence for one batch item.
#[derive(Debug, Clone, PartialEq)]
pub struct BestCandidate {
    pub tokens: Vec<u32>,
    /// Cumulative log-probability divided by `len ^ length_penalty`.
    pub score: f32,
}

/// Per-batch-item best candidate tracker.
#[derive(Debug, Clone)]
pub struct CandidateTracker {
    num_beams: usize,
    length_penalty: f32,
    best: Vec<Option<BestCandidate>>,
}

impl CandidateTracker {
    #[must_use]
    pub fn new(batch_size: usize, num_beams: usize, length_penalty: f32) -> Self {
        Self {
            num_beams,
            length_penalty,
            best: vec![None; batch_size],
        }
    }

    /// Normalise a cumulative score for a sequence of `len` tokens.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn normalized_score(&self, score: f32, len: usize) -> f32 {
        let normalized = score / (len as f32).powf(self.length_penalty);
        // NaN would never compare greater and could pin a stored best forever.
        if normalized.is_nan() {
            f32::NEG_INFINITY
        } else {
            normalized
        }
    }

    /// Offer lanes as candidates.
    ///
    /// With `eos_token_ids = Some(..)` only lanes whose last token is an end marker are
    /// offered, and each of them is frozen afterwards. With `None` every lane is offered and
    /// nothing is frozen; this is the final flush after the last step. Returns the number of
    /// batch items whose best candidate improved.
    ///
    /// # Errors
    /// Returns [`DecodeError::ShapeMismatch`] if `histories` and `beam_scores` disagree with
    /// the tracker's lane count.
    pub fn capture(
        &mut self,
        histories: &[Vec<u32>],
        beam_scores: &mut [f32],
        eos_token_ids: Option<&[u32]>,
    ) -> Result<usize> {
        let lanes = self.best.len() * self.num_beams;
        DecodeError::check("candidate lanes", lanes, histories.len())?;
        DecodeError::check("candidate beam scores", lanes, beam_scores.len())?;

        let mut improved = 0;
        for (lane, history) in histories.iter().enumerate() {
            let Some(&last) = history.last() else {
                continue;
            };
            if let Some(eos) = eos_token_ids
                && !eos.contains(&last)
            {
                continue;
            }

            let item = lane / self.num_beams;
            let score = self.normalized_score(beam_scores[lane], history.len());
            let replace = match &self.best[item] {
                None => true,
                Some(current) => score > current.score,
            };
            if replace {
                trace!(item, lane, score, len = history.len(), "captured candidate");
                self.best[item] = Some(BestCandidate {
                    tokens: history.clone(),
                    score,
                });
                improved += 1;
            }

            if eos_token_ids.is_some() {
                beam_scores[lane] = f32::NEG_INFINITY;
            }
        }

        Ok(improved)
    }

    #[must_use]
    pub fn best(&self) -> &[Option<BestCandidate>] {
        &self.best
    }

    #[must_use]
    pub fn into_best(self) -> Vec<Option<BestCandidate>> {
        self.best
    }
}
