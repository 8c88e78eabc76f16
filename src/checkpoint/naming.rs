use std::sync::Arc;

use candle_nn::var_builder::SimpleBackend;
use snafu::Snafu;

use crate::util::renaming_backend::RenamingBackend;

#[derive(Debug, Snafu)]
pub enum ParameterNamingError {
    #[snafu(display(
        "Cannot determine parameter naming, checkpoint has neither `tok_embeddings.weight` nor `model.embed_tokens.weight`"
    ))]
    UnknownNaming,
}

/// Parameter naming conventions of LLaMA checkpoints.
///
/// The model uses the names of the original LLaMA checkpoints internally,
/// e.g. `layers.0.attention.wq.weight`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParameterNaming {
    /// Original checkpoint names, e.g. `layers.0.attention.wq.weight`.
    Meta,

    /// Names of converted checkpoints, e.g. `model.layers.0.self_attn.q_proj.weight`.
    HuggingFace,
}

impl ParameterNaming {
    /// Detect the naming convention from the tensors in a checkpoint.
    pub fn detect(backend: &dyn SimpleBackend) -> Result<Self, ParameterNamingError> {
        if backend.contains_tensor("tok_embeddings.weight") {
            Ok(ParameterNaming::Meta)
        } else if backend.contains_tensor("model.embed_tokens.weight") {
            Ok(ParameterNaming::HuggingFace)
        } else {
            UnknownNamingSnafu.fail()
        }
    }

    /// Whether rotary embeddings rotate interleaved pairs.
    ///
    /// The conversion to the Hugging Face layout permutes the query and
    /// key projections, so that halves are rotated instead.
    pub fn interleaved_rotary(self) -> bool {
        self == ParameterNaming::Meta
    }

    /// Wrap a backend, so that it can be queried with internal names.
    pub fn wrap(self, backend: Arc<dyn SimpleBackend>) -> Arc<dyn SimpleBackend> {
        match self {
            ParameterNaming::Meta => backend,
            ParameterNaming::HuggingFace => {
                Arc::new(RenamingBackend::new(backend, hf_rename_parameter))
            }
        }
    }
}

fn hf_rename_parameter(name: &str) -> String {
    let mut name = if let Some(output) = name.strip_prefix("output.") {
        format!("lm_head.{output}")
    } else {
        format!("model.{name}")
    };
    name = name.replace("tok_embeddings", "embed_tokens");

    // Attention layer.
    name = name.replace("attention_norm", "input_layernorm");
    name = name.replace("attention.wq", "self_attn.q_proj");
    name = name.replace("attention.wk", "self_attn.k_proj");
    name = name.replace("attention.wv", "self_attn.v_proj");
    name = name.replace("attention.wo", "self_attn.o_proj");

    // Feed-forward layer.
    name = name.replace("ffn_norm", "post_attention_layernorm");
    name = name.replace("feed_forward.w1", "mlp.gate_proj");
    name = name.replace("feed_forward.w2", "mlp.down_proj");
    name = name.replace("feed_forward.w3", "mlp.up_proj");

    name
}
