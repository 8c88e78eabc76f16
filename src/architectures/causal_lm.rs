use candle_core::Tensor;

use crate::error::BoxedError;

/// A causal language model with a key-value cache.
pub trait CausalLM {
    /// Clear the cache before decoding a new batch.
    fn reset(&mut self) -> Result<(), BoxedError>;

    /// Predict the pieces following `piece_ids`.
    ///
    /// * `piece_ids` - Pieces of the new positions.
    ///   *Shape:* `(batch_size, seq_len)`
    /// * `index_pos` - Position of the first new piece. Earlier positions
    ///   must be in the cache.
    ///
    /// Returns the `f32` logits of the last position.
    /// *Shape:* `(batch_size, n_pieces)`
    fn last_logits(&mut self, piece_ids: &Tensor, index_pos: usize) -> Result<Tensor, BoxedError>;
}
