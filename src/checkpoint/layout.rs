use std::path::{Path, PathBuf};

use snafu::{ensure, OptionExt, ResultExt, Snafu};

use super::weights::{CheckpointError, WeightFiles};

static PARAMS_JSON: &str = "params.json";
static TOKENIZER_JSON: &str = "tokenizer.json";

#[derive(Debug, Snafu)]
pub enum CheckpointLayoutError {
    #[snafu(display("Model {model} does not exist: {}", path.to_string_lossy()))]
    ModelDirMissing { model: String, path: PathBuf },

    #[snafu(display("Model {model} does not exist: no weights in {}", path.to_string_lossy()))]
    WeightsMissing { model: String, path: PathBuf },

    #[snafu(display("Model {model} does not exist: missing {}", path.to_string_lossy()))]
    ParamsMissing { model: String, path: PathBuf },

    #[snafu(display("Missing tokenizer in {}", llama_path.to_string_lossy()))]
    TokenizerMissing { llama_path: PathBuf },

    #[snafu(display("Cannot look up weights of model {model}"))]
    FindWeights {
        source: CheckpointError,
        model: String,
    },
}

/// Files that make up a LLaMA checkpoint.
///
/// The layout is `<llama_path>/<model>/{weights, params.json}` with a
/// tokenizer that is shared by all models in `<llama_path>/tokenizer.json`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CheckpointLayout {
    pub model_dir: PathBuf,
    pub params_path: PathBuf,
    pub weights: WeightFiles,
    pub tokenizer_path: PathBuf,
}

impl CheckpointLayout {
    /// Check that all files of a checkpoint are present.
    ///
    /// The model directory, weights, model parameters and tokenizer are
    /// checked in that order. The first missing file is reported.
    pub fn resolve(
        llama_path: impl AsRef<Path>,
        model: &str,
    ) -> Result<CheckpointLayout, CheckpointLayoutError> {
        let llama_path = llama_path.as_ref();
        let model_dir = llama_path.join(model);
        ensure!(
            model_dir.is_dir(),
            ModelDirMissingSnafu {
                model,
                path: &model_dir
            }
        );

        let weights = WeightFiles::find(&model_dir)
            .context(FindWeightsSnafu { model })?
            .context(WeightsMissingSnafu {
                model,
                path: &model_dir,
            })?;

        let params_path = model_dir.join(PARAMS_JSON);
        ensure!(
            params_path.is_file(),
            ParamsMissingSnafu {
                model,
                path: &params_path
            }
        );

        let tokenizer_path = llama_path.join(TOKENIZER_JSON);
        ensure!(
            tokenizer_path.is_file(),
            TokenizerMissingSnafu { llama_path }
        );

        Ok(CheckpointLayout {
            model_dir,
            params_path,
            weights,
            tokenizer_path,
        })
    }
}
