use std::collections::HashMap;
use std::fs;
use std::path::Path;

use candle_core::Tensor;
use llama_dispatch::models::llama::{LlamaParams, ModelArgs, ModelArgsOverrides};
use tempfile::TempDir;

#[path = "../../testdata/tiny_parameters.rs"]
mod tiny_parameters;
use tiny_parameters::{tiny_parameters, TinyDims};

pub const MODEL: &str = "tiny";

pub const PARAMS_JSON: &str = r#"{
  "dim": 16,
  "n_layers": 4,
  "n_heads": 4,
  "n_kv_heads": 2,
  "multiple_of": 8,
  "norm_eps": 1e-05,
  "vocab_size": -1
}"#;

pub const TOKENIZER_JSON: &str = include_str!("../../testdata/tokenizer.json");

pub const N_PIECES: usize = 12;

/// Parameter naming of a stored checkpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Naming {
    /// Original LLaMA names (`layers.0.attention.wq.weight`).
    Meta,
    /// Hugging Face transformers names (`model.layers.0.self_attn.q_proj.weight`).
    HuggingFace,
}

fn tiny_args() -> ModelArgs {
    let params: LlamaParams = serde_json::from_str(PARAMS_JSON).expect("Invalid params");
    ModelArgs::new(params, &ModelArgsOverrides::default()).vocab_size(N_PIECES)
}

/// Random parameters of the tiny model with original LLaMA names.
pub fn random_parameters(with_output: bool) -> HashMap<String, Tensor> {
    let args = tiny_args();
    let dims = TinyDims {
        dim: args.dim,
        n_layers: args.n_layers,
        kv_width: args.n_kv_heads * args.head_dim(),
        ffn_width: args.ffn_hidden_dim(),
        n_pieces: N_PIECES,
    };
    tiny_parameters(&dims, with_output)
}

/// A checkpoint directory with a tiny random model.
pub struct TinyCheckpoint {
    pub dir: TempDir,
}

impl TinyCheckpoint {
    /// Write the checkpoint, `with_output` controls whether the output
    /// projection is stored or tied to the piece embeddings.
    pub fn new(with_output: bool) -> Self {
        Self::write(&random_parameters(with_output), Naming::Meta)
    }

    /// Write `parameters` (with original names) using `naming`.
    pub fn write(parameters: &HashMap<String, Tensor>, naming: Naming) -> Self {
        let dir = TempDir::new().expect("Cannot create temporary directory");
        let model_dir = dir.path().join(MODEL);
        fs::create_dir(&model_dir).expect("Cannot create model directory");
        fs::write(model_dir.join("params.json"), PARAMS_JSON).expect("Cannot write params");
        fs::write(dir.path().join("tokenizer.json"), TOKENIZER_JSON)
            .expect("Cannot write tokenizer");

        let tensors = match naming {
            Naming::Meta => parameters.clone(),
            Naming::HuggingFace => to_hf_layout(parameters, &tiny_args()),
        };
        candle_core::safetensors::save(&tensors, model_dir.join("model.safetensors"))
            .expect("Cannot write weights");

        TinyCheckpoint { dir }
    }

    pub fn llama_path(&self) -> &Path {
        self.dir.path()
    }
}

/// Convert to the Hugging Face layout: rename parameters and permute the
/// query/key projections so that rotary embeddings rotate halves.
fn to_hf_layout(parameters: &HashMap<String, Tensor>, args: &ModelArgs) -> HashMap<String, Tensor> {
    parameters
        .iter()
        .map(|(name, tensor)| {
            let tensor = if name.ends_with("attention.wq.weight") {
                permute_rotary(tensor, args.n_heads, args.head_dim())
            } else if name.ends_with("attention.wk.weight") {
                permute_rotary(tensor, args.n_kv_heads, args.head_dim())
            } else {
                tensor.clone()
            };
            (hf_name(name), tensor)
        })
        .collect()
}

fn permute_rotary(weight: &Tensor, n_heads: usize, head_dim: usize) -> Tensor {
    let (rows, cols) = weight.dims2().expect("Projection must be a matrix");
    weight
        .reshape((n_heads, head_dim / 2, 2, cols))
        .and_then(|weight| weight.transpose(1, 2))
        .and_then(|weight| weight.contiguous())
        .and_then(|weight| weight.reshape((rows, cols)))
        .expect("Cannot permute projection")
}

fn hf_name(name: &str) -> String {
    match name {
        "tok_embeddings.weight" => "model.embed_tokens.weight".to_string(),
        "norm.weight" => "model.norm.weight".to_string(),
        "output.weight" => "lm_head.weight".to_string(),
        layer_name => {
            let mut hf_name = format!("model.{layer_name}");
            for (meta, hf) in [
                ("attention.wq", "self_attn.q_proj"),
                ("attention.wk", "self_attn.k_proj"),
                ("attention.wv", "self_attn.v_proj"),
                ("attention.wo", "self_attn.o_proj"),
                ("feed_forward.w1", "mlp.gate_proj"),
                ("feed_forward.w2", "mlp.down_proj"),
                ("feed_forward.w3", "mlp.up_proj"),
                ("attention_norm", "input_layernorm"),
                ("ffn_norm", "post_attention_layernorm"),
            ] {
                hf_name = hf_name.replace(meta, hf);
            }
            hf_name
        }
    }
}
