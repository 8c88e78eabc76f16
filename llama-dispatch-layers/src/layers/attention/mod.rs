use candle_core::{DType, Module, Tensor, D};
use candle_nn::Linear;
use snafu::{ensure, ResultExt, Snafu};

use crate::kv_cache::LayerCache;
use crate::layers::linear::linear_no_bias;
use crate::layers::rotary::RotaryEmbeddings;
use crate::varbuilder::VarBuilder;

mod mask;
pub use mask::{CausalMask, CausalMaskError};

#[derive(Debug, Snafu)]
pub enum SelfAttentionError {
    #[snafu(display("Cannot build attention projection"))]
    BuildProjection { source: candle_core::Error },

    #[snafu(display(
        "Hidden width ({hidden_width}) must be divisible by the number of query heads ({n_query_heads})"
    ))]
    IncorrectHiddenWidth {
        hidden_width: usize,
        n_query_heads: usize,
    },

    #[snafu(display(
        "Number of query heads ({n_query_heads}) must be a multiple of the number of key-value heads ({n_key_value_heads})"
    ))]
    IncorrectNKeyValueHeads {
        n_query_heads: usize,
        n_key_value_heads: usize,
    },
}

/// Attention head configuration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AttentionHeads {
    /// Number of query heads.
    pub n_query_heads: usize,

    /// Number of key-value heads.
    ///
    /// When this is smaller than the number of query heads, key-value
    /// heads are shared by groups of query heads.
    pub n_key_value_heads: usize,
}

/// Self-attention configuration.
#[derive(Clone, Debug)]
pub struct SelfAttentionConfig {
    pub attention_heads: AttentionHeads,
    pub hidden_width: usize,
}

impl SelfAttentionConfig {
    /// Attention head configuration.
    pub fn attention_heads(mut self, attention_heads: AttentionHeads) -> Self {
        self.attention_heads = attention_heads;
        self
    }

    /// Hidden width of the transformer.
    ///
    /// Default: `4096`
    pub fn hidden_width(mut self, hidden_width: usize) -> Self {
        self.hidden_width = hidden_width;
        self
    }

    /// Build the attention layer.
    ///
    /// The query, key, value and output projections are read from
    /// `wq`, `wk`, `wv` and `wo`.
    pub fn build(&self, vb: VarBuilder) -> Result<SelfAttention, SelfAttentionError> {
        let AttentionHeads {
            n_query_heads,
            n_key_value_heads,
        } = self.attention_heads;
        let hidden_width = self.hidden_width;

        ensure!(
            n_query_heads > 0 && hidden_width % n_query_heads == 0,
            IncorrectHiddenWidthSnafu {
                hidden_width,
                n_query_heads
            }
        );
        ensure!(
            n_key_value_heads > 0 && n_query_heads % n_key_value_heads == 0,
            IncorrectNKeyValueHeadsSnafu {
                n_query_heads,
                n_key_value_heads
            }
        );

        let head_width = hidden_width / n_query_heads;
        let kv_width = n_key_value_heads * head_width;

        Ok(SelfAttention {
            query: linear_no_bias(hidden_width, hidden_width, vb.push_prefix("wq"))
                .context(BuildProjectionSnafu)?,
            key: linear_no_bias(hidden_width, kv_width, vb.push_prefix("wk"))
                .context(BuildProjectionSnafu)?,
            value: linear_no_bias(hidden_width, kv_width, vb.push_prefix("wv"))
                .context(BuildProjectionSnafu)?,
            output: linear_no_bias(hidden_width, hidden_width, vb.push_prefix("wo"))
                .context(BuildProjectionSnafu)?,
            attention_heads: self.attention_heads,
            head_width,
        })
    }
}

impl Default for SelfAttentionConfig {
    fn default() -> Self {
        SelfAttentionConfig {
            attention_heads: AttentionHeads {
                n_query_heads: 32,
                n_key_value_heads: 32,
            },
            hidden_width: 4096,
        }
    }
}

/// Causal self-attention with rotary embeddings.
#[derive(Clone, Debug)]
pub struct SelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    attention_heads: AttentionHeads,
    head_width: usize,
}

impl SelfAttention {
    /// Apply self-attention to the input.
    ///
    /// * `xs` - Hidden representations of the new positions.
    ///   *Shape:* `(batch_size, seq_len, hidden_width)`
    /// * `rotary` - Rotary embeddings on the same device as the layer.
    /// * `mask` - Causal mask, `None` when a single position is added.
    /// * `index_pos` - Position of the first element of `xs`.
    /// * `cache` - Keys and values of earlier positions.
    ///
    /// Returns the attention output.
    /// *Shape:* `(batch_size, seq_len, hidden_width)`
    pub fn forward(
        &self,
        xs: &Tensor,
        rotary: &RotaryEmbeddings,
        mask: Option<&CausalMask>,
        index_pos: usize,
        cache: &mut LayerCache,
    ) -> Result<Tensor, candle_core::Error> {
        let (batch_size, seq_len, hidden_width) = xs.dims3()?;
        let AttentionHeads {
            n_query_heads,
            n_key_value_heads,
        } = self.attention_heads;

        let query = self.split_heads(self.query.forward(xs)?, n_query_heads)?;
        let key = self.split_heads(self.key.forward(xs)?, n_key_value_heads)?;
        let value = self.split_heads(self.value.forward(xs)?, n_key_value_heads)?;

        let query = rotary.apply(&query, index_pos)?;
        let key = rotary.apply(&key, index_pos)?;

        let (key, value) = cache.update(key, value)?;
        let n_rep = n_query_heads / n_key_value_heads;
        let key = repeat_kv(key, n_rep)?;
        let value = repeat_kv(value, n_rep)?;

        let dtype = query.dtype();
        let scale = (self.head_width as f64).sqrt();
        let scores = (query
            .to_dtype(DType::F32)?
            .matmul(&key.to_dtype(DType::F32)?.t()?)?
            / scale)?;
        let scores = match mask {
            Some(mask) => mask.apply(&scores)?,
            None => scores,
        };
        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?.to_dtype(dtype)?;
        let attention = weights.matmul(&value.contiguous()?)?;

        let attention = attention
            .transpose(1, 2)?
            .reshape((batch_size, seq_len, hidden_width))?;
        self.output.forward(&attention)
    }

    fn split_heads(&self, xs: Tensor, n_heads: usize) -> Result<Tensor, candle_core::Error> {
        let (batch_size, seq_len, _) = xs.dims3()?;
        xs.reshape((batch_size, seq_len, n_heads, self.head_width))?
            .transpose(1, 2)?
            .contiguous()
    }
}

/// Repeat key-value heads for grouped-query attention.
///
/// *Shape:* `(batch_size, n_key_value_heads, seq_len, head_width)` to
/// `(batch_size, n_key_value_heads * n_rep, seq_len, head_width)`.
pub fn repeat_kv(xs: Tensor, n_rep: usize) -> Result<Tensor, candle_core::Error> {
    if n_rep == 1 {
        return Ok(xs);
    }

    let (batch_size, n_kv_heads, seq_len, head_width) = xs.dims4()?;
    xs.unsqueeze(2)?
        .expand((batch_size, n_kv_heads, n_rep, seq_len, head_width))?
        .reshape((batch_size, n_kv_heads * n_rep, seq_len, head_width))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use candle_core::{DType, Device, IndexOp, Tensor};

    use super::{repeat_kv, AttentionHeads, CausalMask, SelfAttentionConfig, SelfAttentionError};
    use crate::kv_cache::LayerCache;
    use crate::layers::rotary::RotaryEmbeddingsConfig;
    use crate::util::assert_tensor_eq;
    use crate::varbuilder::VarBuilder;

    fn attention_vb(hidden_width: usize, kv_width: usize) -> VarBuilder {
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        for (name, out_width) in [
            ("wq", hidden_width),
            ("wk", kv_width),
            ("wv", kv_width),
            ("wo", hidden_width),
        ] {
            tensors.insert(
                format!("{name}.weight"),
                Tensor::randn(0f32, 0.5, (out_width, hidden_width), &device).unwrap(),
            );
        }
        VarBuilder::from_tensors(tensors, DType::F32, device)
    }

    #[test]
    fn incremental_decoding_matches_full_sequence() {
        let device = Device::Cpu;
        let attention = SelfAttentionConfig::default()
            .attention_heads(AttentionHeads {
                n_query_heads: 4,
                n_key_value_heads: 2,
            })
            .hidden_width(8)
            .build(attention_vb(8, 4))
            .unwrap();
        let rotary = RotaryEmbeddingsConfig::default()
            .head_width(2)
            .seq_len(16)
            .build(DType::F32, &device)
            .unwrap();
        let xs = Tensor::randn(0f32, 1., (2, 4, 8), &device).unwrap();

        let mut cache = LayerCache::default();
        let mask = CausalMask::new(4, 0, &device).unwrap();
        let full = attention
            .forward(&xs, &rotary, Some(&mask), 0, &mut cache)
            .unwrap();

        let mut cache = LayerCache::default();
        let mask = CausalMask::new(3, 0, &device).unwrap();
        let _ = attention
            .forward(&xs.narrow(1, 0, 3).unwrap(), &rotary, Some(&mask), 0, &mut cache)
            .unwrap();
        let last = attention
            .forward(&xs.narrow(1, 3, 1).unwrap(), &rotary, None, 3, &mut cache)
            .unwrap();

        assert_eq!(cache.seq_len(), 4);
        assert_tensor_eq::<f32>(
            last.i((.., 0, ..)).unwrap(),
            full.i((.., 3, ..)).unwrap(),
            1e-4,
        );
    }

    #[test]
    fn key_value_heads_must_divide_query_heads() {
        let result = SelfAttentionConfig::default()
            .attention_heads(AttentionHeads {
                n_query_heads: 4,
                n_key_value_heads: 3,
            })
            .hidden_width(8)
            .build(attention_vb(8, 6));
        assert!(matches!(
            result,
            Err(SelfAttentionError::IncorrectNKeyValueHeads { .. })
        ));
    }

    #[test]
    fn repeat_kv_duplicates_heads_in_groups() {
        let xs = Tensor::arange(0f32, 4., &Device::Cpu)
            .unwrap()
            .reshape((1, 2, 1, 2))
            .unwrap();
        let repeated: Vec<f32> = repeat_kv(xs, 2)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(repeated, vec![0., 1., 0., 1., 2., 3., 2., 3.]);
    }
}
