//! Traits shared by model implementations.

mod causal_lm;
pub use causal_lm::CausalLM;

mod stage;
pub use stage::{PipelineStage, StageInput, StageOutput};
