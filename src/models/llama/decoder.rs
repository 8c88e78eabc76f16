use candle_core::{Device, Module, Tensor};
use snafu::{ResultExt, Snafu};

use llama_dispatch_layers::kv_cache::LayerCache;
use llama_dispatch_layers::layers::attention::{CausalMask, SelfAttention, SelfAttentionError};
use llama_dispatch_layers::layers::feedforward::SwiGluFeedForward;
use llama_dispatch_layers::layers::layer_norm::RmsNorm;
use llama_dispatch_layers::layers::rotary::RotaryEmbeddings;
use llama_dispatch_layers::varbuilder::VarBuilder;

use crate::models::llama::config::ModelArgs;

#[derive(Debug, Snafu)]
pub enum LlamaBlockError {
    #[snafu(display("Cannot build attention"))]
    BuildAttention { source: SelfAttentionError },

    #[snafu(display("Cannot build feed-forward layer"))]
    BuildFeedForward { source: candle_core::Error },

    #[snafu(display("Cannot build {name} norm"))]
    BuildNorm {
        source: candle_core::Error,
        name: String,
    },
}

/// LLaMA transformer block.
///
/// Attention and feed-forward layers are both preceded by an RMS norm and
/// wrapped in a residual connection.
#[derive(Clone, Debug)]
pub struct LlamaBlock {
    attention_norm: RmsNorm,
    attention: SelfAttention,
    ffn_norm: RmsNorm,
    feed_forward: SwiGluFeedForward,
    rotary: RotaryEmbeddings,
    device: Device,
}

impl LlamaBlock {
    /// Build a block from the parameters in `vb` (prefix `layers.N`).
    ///
    /// The rotary embeddings must be on the same device as `vb`.
    pub fn new(
        args: &ModelArgs,
        vb: VarBuilder,
        rotary: RotaryEmbeddings,
    ) -> Result<Self, LlamaBlockError> {
        let norm = args.norm_config();
        Ok(LlamaBlock {
            attention_norm: norm
                .build(vb.push_prefix("attention_norm"))
                .context(BuildNormSnafu {
                    name: "attention",
                })?,
            attention: args
                .attention_config()
                .build(vb.push_prefix("attention"))
                .context(BuildAttentionSnafu)?,
            ffn_norm: norm
                .build(vb.push_prefix("ffn_norm"))
                .context(BuildNormSnafu {
                    name: "feed-forward",
                })?,
            feed_forward: args
                .feedforward_config()
                .build(vb.push_prefix("feed_forward"))
                .context(BuildFeedForwardSnafu)?,
            rotary,
            device: vb.device().clone(),
        })
    }

    /// Device on which the block's parameters are stored.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Apply the block.
    ///
    /// * `xs` - Hidden representations on the block's device.
    ///   *Shape:* `(batch_size, seq_len, hidden_width)`
    /// * `mask` - Causal mask on the block's device.
    /// * `index_pos` - Position of the first element of `xs`.
    /// * `cache` - Key-value cache of this block.
    pub fn forward(
        &self,
        xs: &Tensor,
        mask: Option<&CausalMask>,
        index_pos: usize,
        cache: &mut LayerCache,
    ) -> Result<Tensor, candle_core::Error> {
        let attention = self.attention.forward(
            &self.attention_norm.forward(xs)?,
            &self.rotary,
            mask,
            index_pos,
            cache,
        )?;
        let hidden = (xs + attention)?;
        let feed_forward = self
            .feed_forward
            .forward(&self.ffn_norm.forward(&hidden)?)?;
        hidden + feed_forward
    }
}
