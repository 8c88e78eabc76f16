use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};

use llama_dispatch_layers::layers::attention::{AttentionHeads, SelfAttentionConfig};
use llama_dispatch_layers::layers::feedforward::SwiGluFeedForwardConfig;
use llama_dispatch_layers::layers::layer_norm::RmsNormConfig;
use llama_dispatch_layers::layers::rotary::RotaryEmbeddingsConfig;

#[derive(Debug, Snafu)]
pub enum ModelArgsError {
    #[snafu(display("Cannot open model parameters for reading: {}", path.to_string_lossy()))]
    OpenParams { source: io::Error, path: PathBuf },

    #[snafu(display("Cannot parse model parameters: {}", path.to_string_lossy()))]
    ParseParams {
        source: serde_json::Error,
        path: PathBuf,
    },

    #[snafu(display("Model dimensionality ({dim}) must be divisible by the number of heads ({n_heads})"))]
    IncorrectDim { dim: usize, n_heads: usize },

    #[snafu(display(
        "Number of heads ({n_heads}) must be a multiple of the number of key-value heads ({n_kv_heads})"
    ))]
    IncorrectNKvHeads { n_heads: usize, n_kv_heads: usize },

    #[snafu(display("Model argument `{name}` must be larger than zero"))]
    Zero { name: String },

    #[snafu(display("Vocabulary size is not known, it must be set from the tokenizer"))]
    UnknownVocabSize,
}

/// Model parameters as stored in `params.json`.
///
/// Original checkpoints store `-1` as the vocabulary size, the size is then
/// taken from the tokenizer.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct LlamaParams {
    pub dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    #[serde(default)]
    pub n_kv_heads: Option<usize>,
    #[serde(default = "default_vocab_size")]
    pub vocab_size: i64,
    #[serde(default = "default_multiple_of")]
    pub multiple_of: usize,
    #[serde(default)]
    pub ffn_dim_multiplier: Option<f64>,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
    #[serde(default)]
    pub rope_theta: Option<f32>,
    #[serde(default)]
    pub max_seq_len: Option<usize>,
    #[serde(default)]
    pub max_batch_size: Option<usize>,
}

fn default_vocab_size() -> i64 {
    -1
}

fn default_multiple_of() -> usize {
    256
}

fn default_norm_eps() -> f64 {
    1e-5
}

impl LlamaParams {
    /// Read model parameters from a JSON file.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, ModelArgsError> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path).context(OpenParamsSnafu { path })?);
        serde_json::from_reader(reader).context(ParseParamsSnafu { path })
    }
}

/// Caller overrides of model arguments.
///
/// Overrides are applied after the model parameters were read, so they take
/// precedence over `params.json`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ModelArgsOverrides {
    pub max_seq_len: Option<usize>,
    pub max_batch_size: Option<usize>,
    pub norm_eps: Option<f64>,
    pub rope_theta: Option<f32>,
    pub n_kv_heads: Option<usize>,
}

impl ModelArgsOverrides {
    /// Maximum sequence length (prompt and generated pieces).
    pub fn max_seq_len(mut self, max_seq_len: usize) -> Self {
        self.max_seq_len = Some(max_seq_len);
        self
    }

    /// Maximum number of prompts that are processed together.
    pub fn max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = Some(max_batch_size);
        self
    }

    /// Epsilon of the RMS norms.
    pub fn norm_eps(mut self, norm_eps: f64) -> Self {
        self.norm_eps = Some(norm_eps);
        self
    }

    /// Base of the rotary embedding frequencies.
    pub fn rope_theta(mut self, rope_theta: f32) -> Self {
        self.rope_theta = Some(rope_theta);
        self
    }

    /// Number of key-value heads.
    pub fn n_kv_heads(mut self, n_kv_heads: usize) -> Self {
        self.n_kv_heads = Some(n_kv_heads);
        self
    }
}

/// LLaMA model arguments.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ModelArgs {
    pub dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub vocab_size: Option<usize>,
    pub multiple_of: usize,
    pub ffn_dim_multiplier: Option<f64>,
    pub norm_eps: f64,
    pub rope_theta: f32,
    pub max_seq_len: usize,
    pub max_batch_size: usize,
}

impl ModelArgs {
    /// Merge defaults, model parameters and overrides, in that order.
    pub fn new(params: LlamaParams, overrides: &ModelArgsOverrides) -> Self {
        ModelArgs {
            dim: params.dim,
            n_layers: params.n_layers,
            n_heads: params.n_heads,
            n_kv_heads: overrides
                .n_kv_heads
                .or(params.n_kv_heads)
                .unwrap_or(params.n_heads),
            vocab_size: usize::try_from(params.vocab_size).ok(),
            multiple_of: params.multiple_of,
            ffn_dim_multiplier: params.ffn_dim_multiplier,
            norm_eps: overrides.norm_eps.unwrap_or(params.norm_eps),
            rope_theta: overrides
                .rope_theta
                .or(params.rope_theta)
                .unwrap_or(10_000.),
            max_seq_len: overrides
                .max_seq_len
                .or(params.max_seq_len)
                .unwrap_or(2048),
            max_batch_size: overrides
                .max_batch_size
                .or(params.max_batch_size)
                .unwrap_or(1),
        }
    }

    /// Set the vocabulary size, usually to the number of tokenizer pieces.
    pub fn vocab_size(mut self, vocab_size: usize) -> Self {
        self.vocab_size = Some(vocab_size);
        self
    }

    /// Check that the arguments describe a valid model.
    pub fn validate(&self) -> Result<(), ModelArgsError> {
        for (name, value) in [
            ("dim", self.dim),
            ("n_layers", self.n_layers),
            ("n_heads", self.n_heads),
            ("n_kv_heads", self.n_kv_heads),
            ("multiple_of", self.multiple_of),
            ("max_seq_len", self.max_seq_len),
            ("max_batch_size", self.max_batch_size),
        ] {
            ensure!(value > 0, ZeroSnafu { name });
        }

        ensure!(
            self.dim % self.n_heads == 0,
            IncorrectDimSnafu {
                dim: self.dim,
                n_heads: self.n_heads
            }
        );
        ensure!(
            self.n_heads % self.n_kv_heads == 0,
            IncorrectNKvHeadsSnafu {
                n_heads: self.n_heads,
                n_kv_heads: self.n_kv_heads
            }
        );
        ensure!(
            matches!(self.vocab_size, Some(vocab_size) if vocab_size > 0),
            UnknownVocabSizeSnafu
        );

        Ok(())
    }

    /// Width of an attention head.
    pub fn head_dim(&self) -> usize {
        self.dim / self.n_heads
    }

    /// Width of the gated feed-forward representation.
    pub fn ffn_hidden_dim(&self) -> usize {
        let mut hidden_dim = 2 * (4 * self.dim) / 3;
        if let Some(multiplier) = self.ffn_dim_multiplier {
            hidden_dim = (multiplier * hidden_dim as f64) as usize;
        }
        self.multiple_of * hidden_dim.div_ceil(self.multiple_of)
    }

    pub(crate) fn attention_config(&self) -> SelfAttentionConfig {
        SelfAttentionConfig::default()
            .attention_heads(AttentionHeads {
                n_query_heads: self.n_heads,
                n_key_value_heads: self.n_kv_heads,
            })
            .hidden_width(self.dim)
    }

    pub(crate) fn feedforward_config(&self) -> SwiGluFeedForwardConfig {
        SwiGluFeedForwardConfig::default()
            .hidden_width(self.dim)
            .intermediate_width(self.ffn_hidden_dim())
    }

    pub(crate) fn norm_config(&self) -> RmsNormConfig {
        RmsNormConfig::default().eps(self.norm_eps).size(self.dim)
    }

    /// Rotations are precomputed for twice the maximum sequence length.
    pub(crate) fn rotary_config(&self, interleaved: bool) -> RotaryEmbeddingsConfig {
        RotaryEmbeddingsConfig::default()
            .base(self.rope_theta)
            .head_width(self.head_dim())
            .interleaved(interleaved)
            .seq_len(2 * self.max_seq_len)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use snafu::{report, ResultExt, Whatever};
    use tempfile::TempDir;

    use super::{LlamaParams, ModelArgs, ModelArgsError, ModelArgsOverrides};

    fn params_7b() -> LlamaParams {
        serde_json::from_str(
            r#"{"dim": 4096, "multiple_of": 256, "n_heads": 32, "n_layers": 32, "norm_eps": 1e-06, "vocab_size": -1}"#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_are_applied_before_overrides() {
        let args = ModelArgs::new(params_7b(), &ModelArgsOverrides::default());
        assert_eq!(args.max_seq_len, 2048);
        assert_eq!(args.max_batch_size, 1);
        assert_eq!(args.n_kv_heads, 32);
        assert_eq!(args.vocab_size, None);
        assert_eq!(args.rope_theta, 10_000.);

        let args = ModelArgs::new(
            params_7b(),
            &ModelArgsOverrides::default()
                .max_batch_size(2)
                .max_seq_len(512),
        );
        assert_eq!(args.max_seq_len, 512);
        assert_eq!(args.max_batch_size, 2);
    }

    #[test]
    fn params_take_precedence_over_defaults() {
        let mut params = params_7b();
        params.max_seq_len = Some(4096);
        let args = ModelArgs::new(params, &ModelArgsOverrides::default());
        assert_eq!(args.max_seq_len, 4096);
    }

    #[test]
    fn ffn_hidden_dim_is_rounded_to_multiple() {
        let args = ModelArgs::new(params_7b(), &ModelArgsOverrides::default());
        assert_eq!(args.ffn_hidden_dim(), 11008);
        assert_eq!(args.head_dim(), 128);

        let params: LlamaParams = serde_json::from_str(
            r#"{"dim": 8192, "multiple_of": 4096, "ffn_dim_multiplier": 1.3, "n_heads": 64, "n_kv_heads": 8, "n_layers": 80, "norm_eps": 1e-05, "vocab_size": -1}"#,
        )
        .unwrap();
        let args = ModelArgs::new(params, &ModelArgsOverrides::default());
        assert_eq!(args.ffn_hidden_dim(), 28672);
        assert_eq!(args.n_kv_heads, 8);
    }

    #[test]
    fn vocab_size_must_be_known() {
        let args = ModelArgs::new(params_7b(), &ModelArgsOverrides::default());
        assert!(matches!(
            args.validate(),
            Err(ModelArgsError::UnknownVocabSize)
        ));
        assert!(args.vocab_size(32000).validate().is_ok());
    }

    #[test]
    fn heads_must_divide_dim() {
        let mut params = params_7b();
        params.n_heads = 30;
        let args = ModelArgs::new(params, &ModelArgsOverrides::default()).vocab_size(32000);
        assert!(matches!(
            args.validate(),
            Err(ModelArgsError::IncorrectDim { .. })
        ));

        let args = ModelArgs::new(
            params_7b(),
            &ModelArgsOverrides::default().max_batch_size(0),
        )
        .vocab_size(32000);
        assert!(matches!(args.validate(), Err(ModelArgsError::Zero { .. })));
    }

    #[test]
    #[report]
    fn params_are_read_from_file() -> Result<(), Whatever> {
        let dir = TempDir::new().whatever_context("Cannot create temporary directory")?;
        let path = dir.path().join("params.json");
        fs::write(
            &path,
            r#"{"dim": 64, "n_layers": 2, "n_heads": 4, "vocab_size": 100}"#,
        )
        .whatever_context("Cannot write parameters")?;

        let params = LlamaParams::read(&path).whatever_context("Cannot read parameters")?;
        assert_eq!(params.dim, 64);
        assert_eq!(params.vocab_size, 100);
        assert_eq!(params.multiple_of, 256);
        assert_eq!(params.norm_eps, 1e-5);

        Ok(())
    }
}
