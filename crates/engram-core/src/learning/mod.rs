//! Stage 4: Learned Models
//!
//! Three small learners driven by outcome feedback:
//!
//! - [`ImportanceModel`]: should this event be stored and ranked high
//! - [`DecayLearner`]: per-topic exponential decay rates
//! - [`RetrievalRanker`]: 8-feature relevance model with a heuristic
//!   fallback until warmed
//!
//! All three share the dense-network kernel in [`nn`]; the [`LearningLoop`]
//! routes a single feedback record into each of them.

mod decay;
mod feedback;
mod importance;
mod nn;
mod ranker;

pub use decay::DecayLearner;
pub use feedback::{FeedbackOutcome, LearningLoop};
pub use importance::ImportanceModel;
pub use nn::FeedForwardNet;
pub use ranker::RetrievalRanker;
