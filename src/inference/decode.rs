//! Batched beam-search decode loop.
//!
//! One step: score the context window, post-process the scores, pick the next beams, gather
//! history / window / cache rows through the step's lane permutation, append the new tokens,
//! then capture lanes that just produced an end marker. After the final step every lane is
//! offered once more so each batch item ends with some sequence.
//!
//! The loop always runs the full horizon. Frozen lanes sit at `-inf` and are never chosen as
//! continuation sources while any finite candidate remains.

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::data::{Batch, DecodeResult};
use crate::error::{DecodeError, Result};
use crate::inference::beam::BeamStepper;
use crate::inference::candidates::CandidateTracker;
use crate::inference::penalties::PenaltyEngine;
use crate::inference::scorer::{KvCache, Scorer};

/// Conventional GPT-2 end-of-text id.
pub const GPT2_EOT_ID: u32 = 50256;

/// Beam search settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeConfig {
    pub batch_size: usize,
    pub num_beams: usize,
    /// Number of generation steps.
    pub max_length: usize,
    /// End markers are suppressed for steps `0..min_length`.
    pub min_length: usize,
    pub length_penalty: f32,
    pub repetition_penalty: f32,
    /// 0 disables n-gram banning.
    pub no_repeat_ngram_size: usize,
    /// Sliding context window presented to the scorer.
    pub seq_len: usize,
    pub eos_token_ids: Vec<u32>,
    pub pad_token_id: u32,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            num_beams: 4,
            max_length: 256,
            min_length: 0,
            length_penalty: 0.0,
            repetition_penalty: 1.0,
            no_repeat_ngram_size: 6,
            seq_len: 1024,
            eos_token_ids: vec![GPT2_EOT_ID],
            pad_token_id: GPT2_EOT_ID,
        }
    }
}

impl DecodeConfig {
    /// Validate that the settings describe a runnable search.
    ///
    /// # Errors
    /// Returns a description of the first inconsistent setting.
    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.batch_size == 0 {
            return Err("batch_size must be positive");
        }
        if self.num_beams == 0 {
            return Err("num_beams must be positive");
        }
        if self.max_length == 0 {
            return Err("max_length must be positive");
        }
        if self.seq_len == 0 {
            return Err("seq_len must be positive");
        }
        if !(self.repetition_penalty.is_finite() && self.repetition_penalty > 0.0) {
            return Err("repetition_penalty must be finite and positive");
        }
        if !self.length_penalty.is_finite() {
            return Err("length_penalty must be finite");
        }
        if self.eos_token_ids.is_empty() {
            return Err("eos_token_ids must not be empty");
        }
        Ok(())
    }

    fn penalty_engine(&self) -> PenaltyEngine {
        PenaltyEngine::new(
            self.repetition_penalty,
            self.no_repeat_ngram_size,
            self.min_length,
            self.eos_token_ids.clone(),
        )
    }
}

/// Per-request search state.
pub struct DecodeLoop {
    config: DecodeConfig,
    ids: Vec<u64>,
    vocab_size: usize,
    step: usize,
    /// Lane-ordered cumulative scores.
    beam_scores: Vec<f32>,
    /// Generated tokens per lane; every row has `step` entries.
    histories: Vec<Vec<u32>>,
    /// Sliding window per lane; every row has the same width.
    context: Vec<Vec<u32>>,
    cache: Option<KvCache>,
    /// Source lane of every current lane, from the most recent step.
    permutation: Vec<u32>,
    penalties: PenaltyEngine,
    stepper: BeamStepper,
    tracker: CandidateTracker,
}

impl DecodeLoop {
    /// Expand each batch row to `num_beams` lanes and initialise scores at 0.
    ///
    /// # Errors
    /// Returns [`DecodeError::InvalidConfig`] for an invalid config and
    /// [`DecodeError::ShapeMismatch`] for ragged or empty rows, or a beam wider than the
    /// vocabulary.
    pub fn new(batch: &Batch, config: &DecodeConfig, vocab_size: usize) -> Result<Self> {
        config.validate().map_err(DecodeError::InvalidConfig)?;
        if config.min_length > config.max_length {
            warn!(
                min_length = config.min_length,
                max_length = config.max_length,
                "min_length exceeds max_length; end markers stay suppressed for every step"
            );
        }
        DecodeError::check("batch rows", batch.len(), batch.rows.len())?;
        DecodeError::check("batch query lengths", batch.len(), batch.query_lens.len())?;
        if batch.len() > config.batch_size {
            return Err(DecodeError::ShapeMismatch {
                what: "batch no larger than batch_size",
                expected: config.batch_size,
                actual: batch.len(),
            });
        }
        if vocab_size < config.num_beams {
            return Err(DecodeError::ShapeMismatch {
                what: "vocabulary at least as wide as the beam",
                expected: config.num_beams,
                actual: vocab_size,
            });
        }

        let width = batch.width();
        if width == 0 && !batch.is_empty() {
            return Err(DecodeError::ShapeMismatch {
                what: "non-empty query rows",
                expected: 1,
                actual: 0,
            });
        }
        for (row, &query_len) in batch.rows.iter().zip(&batch.query_lens) {
            DecodeError::check("query row width", width, row.len())?;
            if query_len > width {
                return Err(DecodeError::ShapeMismatch {
                    what: "query length within the row",
                    expected: width,
                    actual: query_len,
                });
            }
        }
        debug!(
            items = batch.len(),
            width,
            pad_tokens = batch.query_lens.iter().map(|&len| width - len).sum::<usize>(),
            "batch collated"
        );

        let num_beams = config.num_beams;
        let keep = width.min(config.seq_len);
        let context: Vec<Vec<u32>> = batch
            .rows
            .iter()
            .flat_map(|row| std::iter::repeat_n(row[width - keep..].to_vec(), num_beams))
            .collect();
        let lanes = context.len();

        Ok(Self {
            ids: batch.ids.clone(),
            vocab_size,
            step: 0,
            beam_scores: vec![0.0; lanes],
            histories: vec![Vec::new(); lanes],
            context,
            cache: None,
            permutation: Vec::new(),
            penalties: config.penalty_engine(),
            stepper: BeamStepper::new(batch.len(), num_beams),
            tracker: CandidateTracker::new(batch.len(), num_beams, config.length_penalty),
            config: config.clone(),
        })
    }

    /// Steps executed so far.
    #[must_use]
    pub fn steps_taken(&self) -> usize {
        self.step
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.step >= self.config.max_length
    }

    #[must_use]
    pub fn beam_scores(&self) -> &[f32] {
        &self.beam_scores
    }

    #[must_use]
    pub fn histories(&self) -> &[Vec<u32>] {
        &self.histories
    }

    #[must_use]
    pub fn context(&self) -> &[Vec<u32>] {
        &self.context
    }

    #[must_use]
    pub fn cache(&self) -> Option<&KvCache> {
        self.cache.as_ref()
    }

    /// Lane permutation applied by the last step (`new_lane -> source_lane`); empty before
    /// the first step. Callers holding their own lane-parallel state gather it with this.
    #[must_use]
    pub fn last_permutation(&self) -> &[u32] {
        &self.permutation
    }

    #[must_use]
    pub fn tracker(&self) -> &CandidateTracker {
        &self.tracker
    }

    /// Execute one generation step.
    ///
    /// # Errors
    /// Returns [`DecodeError::Exhausted`] once `max_length` steps have run, a
    /// [`DecodeError::ShapeMismatch`] if the scorer's output does not match the lanes or
    /// vocabulary, or any scorer error.
    pub fn step<S: Scorer + ?Sized>(&mut self, scorer: &mut S) -> Result<()> {
        if self.is_exhausted() {
            return Err(DecodeError::Exhausted {
                max_length: self.config.max_length,
            });
        }
        let lanes = self.context.len();
        if lanes == 0 {
            self.step += 1;
            return Ok(());
        }

        let window = self.window_tensor(scorer)?;
        let output = scorer.score(&window, self.cache.as_ref())?;

        let (rows, vocab) = output.logits.dims2()?;
        DecodeError::check("scorer lanes", lanes, rows)?;
        DecodeError::check("scorer vocabulary", self.vocab_size, vocab)?;
        let mut scores = output.logits.to_dtype(DType::F32)?.to_vec2::<f32>()?;

        self.penalties
            .apply(&mut scores, &self.histories, self.step)?;
        let selected = self
            .stepper
            .step(&scores, &self.beam_scores, self.step, self.vocab_size)?;

        let seq_len = self.config.seq_len;
        let mut histories = Vec::with_capacity(lanes);
        let mut context = Vec::with_capacity(lanes);
        for (&src, &token) in selected.permutation.iter().zip(&selected.tokens) {
            let src = src as usize;

            let mut history = Vec::with_capacity(self.histories[src].len() + 1);
            history.extend_from_slice(&self.histories[src]);
            history.push(token);
            histories.push(history);

            let prev = &self.context[src];
            let skip = (prev.len() + 1).saturating_sub(seq_len);
            let mut row: Vec<u32> = prev.iter().skip(skip).copied().collect();
            row.push(token);
            context.push(row);
        }

        self.cache = match output.cache {
            Some(cache) => {
                let perm = Tensor::from_vec(selected.permutation.clone(), lanes, scorer.device())?;
                Some(cache.reorder(&perm)?)
            }
            None => None,
        };
        self.histories = histories;
        self.context = context;
        self.beam_scores = selected.beam_scores;
        self.permutation = selected.permutation;

        let captured = self.tracker.capture(
            &self.histories,
            &mut self.beam_scores,
            Some(self.config.eos_token_ids.as_slice()),
        )?;

        debug!(
            step = self.step,
            lanes,
            captured,
            best_live = ?self.best_live_scores(),
            "decode step"
        );
        self.step += 1;
        Ok(())
    }

    /// Flush every lane as a candidate and return one result per batch item, in batch order.
    ///
    /// Items that never captured a sequence (only possible when no step ran) come back empty
    /// with a `-inf` score.
    ///
    /// # Errors
    /// Returns [`DecodeError::ShapeMismatch`] if internal lane bookkeeping is inconsistent.
    pub fn finish(mut self) -> Result<Vec<DecodeResult>> {
        self.tracker
            .capture(&self.histories, &mut self.beam_scores, None)?;

        let results = self
            .ids
            .iter()
            .zip(self.tracker.into_best())
            .map(|(&id, best)| match best {
                Some(best) => DecodeResult {
                    id,
                    tokens: best.tokens,
                    score: best.score,
                },
                None => DecodeResult {
                    id,
                    tokens: Vec::new(),
                    score: f32::NEG_INFINITY,
                },
            })
            .collect();
        Ok(results)
    }

    fn window_tensor<S: Scorer + ?Sized>(&self, scorer: &S) -> Result<Tensor> {
        let lanes = self.context.len();
        let width = self.context.first().map_or(0, Vec::len);
        let flat: Vec<u32> = self.context.iter().flatten().copied().collect();
        Ok(Tensor::from_vec(flat, (lanes, width), scorer.device())?)
    }

    /// Highest live (finite) beam score per batch item.
    fn best_live_scores(&self) -> Vec<Option<f32>> {
        self.beam_scores
            .chunks(self.config.num_beams)
            .map(|beams| {
                beams
                    .iter()
                    .copied()
                    .filter(|s| s.is_finite())
                    .reduce(f32::max)
            })
            .collect()
    }
}

/// Run the full beam search over one collated batch.
///
/// # Errors
/// Returns any error from [`DecodeLoop::new`], [`DecodeLoop::step`], or [`DecodeLoop::finish`].
pub fn run<S: Scorer + ?Sized>(
    batch: &Batch,
    scorer: &mut S,
    config: &DecodeConfig,
) -> Result<Vec<DecodeResult>> {
    let mut state = DecodeLoop::new(batch, config, scorer.vocab_size())?;
    while !state.is_exhausted() {
        state.step(scorer)?;
    }
    state.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    use crate::inference::scorer::ScorerOutput;

    /// Returns the same logits row for every lane.
    struct FixedScorer {
        device: Device,
        row: Vec<f32>,
        calls: usize,
    }

    impl Scorer for FixedScorer {
        fn device(&self) -> &Device {
            &self.device
        }

        fn vocab_size(&self) -> usize {
            self.row.len()
        }

        fn score(
            &mut self,
            context: &Tensor,
            _cache: Option<&KvCache>,
        ) -> candle_core::Result<ScorerOutput> {
            self.calls += 1;
            let (lanes, _) = context.dims2()?;
            let data: Vec<f32> = (0..lanes).flat_map(|_| self.row.clone()).collect();
            Ok(ScorerOutput {
                logits: Tensor::from_vec(data, (lanes, self.row.len()), &self.device)?,
                cache: None,
            })
        }
    }

    fn batch(rows: Vec<Vec<u32>>) -> Batch {
        Batch {
            ids: (0..rows.len() as u64).collect(),
            query_lens: rows.iter().map(Vec::len).collect(),
            rows,
        }
    }

    fn config(num_beams: usize, max_length: usize) -> DecodeConfig {
        DecodeConfig {
            batch_size: 2,
            num_beams,
            max_length,
            no_repeat_ngram_size: 0,
            seq_len: 4,
            eos_token_ids: vec![4],
            pad_token_id: 0,
            ..DecodeConfig::default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(DecodeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let bad = DecodeConfig {
            eos_token_ids: Vec::new(),
            ..DecodeConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = DecodeConfig {
            repetition_penalty: 0.0,
            ..DecodeConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_dominant_eos_yields_single_token() {
        let mut scorer = FixedScorer {
            device: Device::Cpu,
            row: vec![0.0, 0.0, 0.0, 0.0, 10.0],
            calls: 0,
        };
        let cfg = config(2, 5);
        let results = run(&batch(vec![vec![1, 2], vec![3, 3]]), &mut scorer, &cfg).unwrap();

        let expected = crate::inference::beam::log_softmax(&scorer.row)[4];
        assert_eq!(results.len(), 2);
        for r in &results {
            assert_eq!(r.tokens, vec![4]);
            assert!((r.score - expected).abs() < 1e-6);
        }
        // No early exit: every step issues a scorer call.
        assert_eq!(scorer.calls, 5);
    }

    #[test]
    fn test_min_length_beyond_horizon_suppresses_every_end_marker() {
        let cfg = DecodeConfig {
            min_length: 10,
            ..config(2, 3)
        };
        assert!(cfg.validate().is_ok());

        let mut scorer = FixedScorer {
            device: Device::Cpu,
            row: vec![0.0, 0.0, 0.0, 1.0, 10.0],
            calls: 0,
        };
        let results = run(&batch(vec![vec![1, 2]]), &mut scorer, &cfg).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tokens.len(), 3);
        assert!(!results[0].tokens.contains(&4));
        assert!(results[0].score.is_finite());
    }

    #[test]
    fn test_query_length_wider_than_row_rejected() {
        let cfg = config(1, 2);
        let bad = Batch {
            ids: vec![0],
            rows: vec![vec![1, 2]],
            query_lens: vec![3],
        };
        assert!(matches!(
            DecodeLoop::new(&bad, &cfg, 5),
            Err(DecodeError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_context_window_slides() {
        let mut scorer = FixedScorer {
            device: Device::Cpu,
            row: vec![0.0, 5.0, 0.0, 0.0, 0.0],
            calls: 0,
        };
        let cfg = config(1, 3);
        let mut state = DecodeLoop::new(&batch(vec![vec![7, 8, 9]]), &cfg, 5).unwrap();
        state.step(&mut scorer).unwrap();
        assert_eq!(state.context()[0], vec![7, 8, 9, 1]);
        state.step(&mut scorer).unwrap();
        assert_eq!(state.context()[0], vec![8, 9, 1, 1]);
        assert_eq!(state.histories()[0], vec![1, 1]);
    }

    #[test]
    fn test_step_after_horizon_is_an_error() {
        let mut scorer = FixedScorer {
            device: Device::Cpu,
            row: vec![0.0; 5],
            calls: 0,
        };
        let cfg = config(1, 1);
        let mut state = DecodeLoop::new(&batch(vec![vec![1]]), &cfg, 5).unwrap();
        state.step(&mut scorer).unwrap();
        assert!(state.is_exhausted());
        assert!(matches!(
            state.step(&mut scorer),
            Err(DecodeError::Exhausted { max_length: 1 })
        ));
    }

    #[test]
    fn test_finish_before_any_step_returns_empty_results() {
        let cfg = config(2, 3);
        let state = DecodeLoop::new(&batch(vec![vec![1]]), &cfg, 5).unwrap();
        let results = state.finish().unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].tokens.is_empty());
        assert_eq!(results[0].score, f32::NEG_INFINITY);
    }

    #[test]
    fn test_vocab_mismatch_fails_fast() {
        let mut scorer = FixedScorer {
            device: Device::Cpu,
            row: vec![0.0; 6],
            calls: 0,
        };
        let cfg = config(1, 2);
        let mut state = DecodeLoop::new(&batch(vec![vec![1]]), &cfg, 5).unwrap();
        assert!(matches!(
            state.step(&mut scorer),
            Err(DecodeError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let cfg = config(1, 2);
        let ragged = Batch {
            ids: vec![0, 1],
            rows: vec![vec![1, 2], vec![3]],
            query_lens: vec![2, 1],
        };
        assert!(matches!(
            DecodeLoop::new(&ragged, &cfg, 5),
            Err(DecodeError::ShapeMismatch { .. })
        ));
    }
}
