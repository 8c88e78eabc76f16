use candle_core::Tensor;
use llama_dispatch_layers::kv_cache::KeyValueCache;

use crate::error::BoxedError;

/// Input of a pipeline stage.
#[derive(Clone, Debug)]
pub enum StageInput {
    /// Piece identifiers, for the first stage.
    ///
    /// *Shape:* `(batch_size, seq_len)`
    Pieces(Tensor),

    /// Hidden representations from the previous stage.
    ///
    /// *Shape:* `(batch_size, seq_len, hidden_width)`
    Hidden(Tensor),
}

/// Output of a pipeline stage.
#[derive(Clone, Debug)]
pub enum StageOutput {
    /// Hidden representations for the next stage.
    ///
    /// *Shape:* `(batch_size, seq_len, hidden_width)`
    Hidden(Tensor),

    /// Logits of the last sequence position, in `f32`. Only returned by
    /// the last stage.
    ///
    /// *Shape:* `(batch_size, n_pieces)`
    Logits(Tensor),
}

/// A contiguous block of model layers.
pub trait PipelineStage {
    /// Run the stage on new sequence positions.
    ///
    /// * `input` - Pieces or hidden representations of the new positions.
    /// * `index_pos` - Position of the first new element.
    /// * `cache` - Key-value cache of the stage's layers.
    fn forward(
        &self,
        input: StageInput,
        index_pos: usize,
        cache: &mut KeyValueCache,
    ) -> Result<StageOutput, BoxedError>;

    /// Create an empty cache for the stage's layers.
    fn new_cache(&self) -> KeyValueCache;
}
