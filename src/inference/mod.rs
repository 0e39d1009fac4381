//! Beam-search decoding engine.

pub mod beam;
pub mod candidates;
pub mod decode;
pub mod ngram;
pub mod penalties;
pub mod scorer;

pub use beam::{BeamStepper, StepOutput};
pub use candidates::{BestCandidate, CandidateTracker};
pub use decode::{DecodeConfig, DecodeLoop, run};
pub use ngram::NgramBanTracker;
pub use penalties::PenaltyEngine;
pub use scorer::{KvCache, Scorer, ScorerOutput};
