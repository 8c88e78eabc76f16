//! LLaMA models.

mod config;
pub use config::{LlamaParams, ModelArgs, ModelArgsError, ModelArgsOverrides};

mod decoder;
pub use decoder::{LlamaBlock, LlamaBlockError};

mod stage;
pub use stage::{LlamaStage, LlamaStageError};
