pub mod renaming_backend;

#[cfg(test)]
#[path = "../../testdata/tiny_parameters.rs"]
mod tiny_parameters;

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use candle_core::Tensor;

    use super::tiny_parameters::{tiny_parameters, TinyDims};
    use crate::models::llama::{LlamaParams, ModelArgs, ModelArgsOverrides};

    pub use llama_dispatch_layers::util::assert_tensor_eq;

    /// Word-level tokenizer with the vocabulary of the tiny model.
    pub const TINY_TOKENIZER_JSON: &str = include_str!("../../testdata/tokenizer.json");

    /// Arguments of a tiny model with grouped-query attention.
    pub fn tiny_args() -> ModelArgs {
        let params = LlamaParams {
            dim: 16,
            n_layers: 2,
            n_heads: 4,
            n_kv_heads: Some(2),
            vocab_size: -1,
            multiple_of: 8,
            ffn_dim_multiplier: None,
            norm_eps: 1e-5,
            rope_theta: None,
            max_seq_len: Some(32),
            max_batch_size: Some(2),
        };
        ModelArgs::new(params, &ModelArgsOverrides::default()).vocab_size(12)
    }

    /// Random parameters for `args`, with original parameter names.
    ///
    /// When `with_output` is `false`, the output projection is tied to the
    /// piece embeddings.
    pub fn tiny_checkpoint(args: &ModelArgs, with_output: bool) -> HashMap<String, Tensor> {
        let dims = TinyDims {
            dim: args.dim,
            n_layers: args.n_layers,
            kv_width: args.n_kv_heads * args.head_dim(),
            ffn_width: args.ffn_hidden_dim(),
            n_pieces: args.vocab_size.expect("vocab size must be set"),
        };
        tiny_parameters(&dims, with_output)
    }
}
