use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use candle_core::pickle::PthTensors;
use candle_core::safetensors::MmapedSafetensors;
use candle_nn::var_builder::SimpleBackend;
use regex::Regex;
use serde::Deserialize;
use snafu::{ensure, ResultExt, Snafu};

static PYTORCH_STATE_DICT: &str = "state_dict.pth";
static SAFETENSORS_INDEX: &str = "model.safetensors.index.json";
static SAFETENSORS_SINGLE: &str = "model.safetensors";
static SAFETENSORS_CONSOLIDATED: &str = "consolidated.safetensors";

#[derive(Debug, Snafu)]
pub enum CheckpointError {
    #[snafu(display("Cannot open or load checkpoint"))]
    LoadCheckpoint { source: candle_core::Error },

    #[snafu(display("Cannot open SafeTensors index file: {}", path.to_string_lossy()))]
    OpenSafeTensorsIndex { source: io::Error, path: PathBuf },

    #[snafu(display("Cannot parse SafeTensors index file: {}", path.to_string_lossy()))]
    ParseSafeTensorsIndex {
        source: serde_json::Error,
        path: PathBuf,
    },

    #[snafu(display("Cannot read model directory: {}", path.to_string_lossy()))]
    ReadModelDir { source: io::Error, path: PathBuf },

    #[snafu(display("SafeTensors shard does not exist: {}", path.to_string_lossy()))]
    ShardMissing { path: PathBuf },

    #[snafu(display(
        "Checkpoint is split in {n_shards} tensor-parallel files, merge them into {PYTORCH_STATE_DICT}"
    ))]
    UnmergedShards { n_shards: usize },
}

/// Checkpoint formats.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Checkpoint {
    /// PyTorch pickled state dict.
    PyTorch,
    /// One or more SafeTensors files.
    SafeTensors,
}

impl Checkpoint {
    /// Open the checkpoint files as a parameter backend.
    pub fn load(self, paths: &[PathBuf]) -> Result<Arc<dyn SimpleBackend>, CheckpointError> {
        match self {
            Checkpoint::PyTorch => Self::load_pytorch(paths),
            Checkpoint::SafeTensors => Self::load_safetensors(paths),
        }
    }

    fn load_pytorch(paths: &[PathBuf]) -> Result<Arc<dyn SimpleBackend>, CheckpointError> {
        ensure!(
            paths.len() == 1,
            UnmergedShardsSnafu {
                n_shards: paths.len()
            }
        );
        let tensors = PthTensors::new(&paths[0], None).context(LoadCheckpointSnafu)?;
        Ok(Arc::new(tensors))
    }

    fn load_safetensors(paths: &[PathBuf]) -> Result<Arc<dyn SimpleBackend>, CheckpointError> {
        Ok(Arc::new(unsafe {
            MmapedSafetensors::multi(paths).context(LoadCheckpointSnafu)?
        }))
    }
}

/// The weight files of a model.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WeightFiles {
    pub checkpoint: Checkpoint,
    pub paths: Vec<PathBuf>,
}

impl WeightFiles {
    /// Find the weight files in a model directory.
    ///
    /// Candidates are tried in order: `state_dict.pth`, a sharded SafeTensors
    /// checkpoint with an index, `model.safetensors`,
    /// `consolidated.safetensors` and `consolidated.NN.pth`.
    ///
    /// Returns `None` if the directory does not contain weights.
    pub fn find(model_dir: &Path) -> Result<Option<WeightFiles>, CheckpointError> {
        let state_dict = model_dir.join(PYTORCH_STATE_DICT);
        if state_dict.is_file() {
            return Ok(Some(WeightFiles {
                checkpoint: Checkpoint::PyTorch,
                paths: vec![state_dict],
            }));
        }

        let index = model_dir.join(SAFETENSORS_INDEX);
        if index.is_file() {
            return Ok(Some(WeightFiles {
                checkpoint: Checkpoint::SafeTensors,
                paths: Self::safetensors_shards(model_dir, &index)?,
            }));
        }

        for name in [SAFETENSORS_SINGLE, SAFETENSORS_CONSOLIDATED] {
            let path = model_dir.join(name);
            if path.is_file() {
                return Ok(Some(WeightFiles {
                    checkpoint: Checkpoint::SafeTensors,
                    paths: vec![path],
                }));
            }
        }

        let consolidated = Self::consolidated_pytorch(model_dir)?;
        if consolidated.is_empty() {
            Ok(None)
        } else {
            Ok(Some(WeightFiles {
                checkpoint: Checkpoint::PyTorch,
                paths: consolidated,
            }))
        }
    }

    /// Open the weight files as a parameter backend.
    pub fn load(&self) -> Result<Arc<dyn SimpleBackend>, CheckpointError> {
        self.checkpoint.load(&self.paths)
    }

    fn safetensors_shards(model_dir: &Path, index_path: &Path) -> Result<Vec<PathBuf>, CheckpointError> {
        let index_file = BufReader::new(
            File::open(index_path).context(OpenSafeTensorsIndexSnafu { path: index_path })?,
        );
        let index: SafeTensorsIndex = serde_json::from_reader(index_file)
            .context(ParseSafeTensorsIndexSnafu { path: index_path })?;

        index
            .shards()
            .into_iter()
            .map(|shard_name| {
                let path = model_dir.join(shard_name);
                ensure!(path.is_file(), ShardMissingSnafu { path });
                Ok(path)
            })
            .collect()
    }

    fn consolidated_pytorch(model_dir: &Path) -> Result<Vec<PathBuf>, CheckpointError> {
        static CONSOLIDATED_RE: OnceLock<Regex> = OnceLock::new();
        let consolidated_re = CONSOLIDATED_RE
            .get_or_init(|| Regex::new(r"^consolidated\.\d+\.pth$").expect("Invalid regex"));

        let entries =
            std::fs::read_dir(model_dir).context(ReadModelDirSnafu { path: model_dir })?;
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.context(ReadModelDirSnafu { path: model_dir })?;
            if consolidated_re.is_match(&entry.file_name().to_string_lossy()) {
                paths.push(entry.path());
            }
        }
        paths.sort();

        Ok(paths)
    }
}

#[derive(Debug, Deserialize)]
struct SafeTensorsIndex {
    weight_map: HashMap<String, String>,
}

impl SafeTensorsIndex {
    /// Get the names of the shards, sorted.
    fn shards(&self) -> BTreeSet<String> {
        self.weight_map.values().cloned().collect()
    }
}
