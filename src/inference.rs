//! Loading a LLaMA checkpoint into a pipeline and generating text.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use candle_core::{DType, Device};
use llama_dispatch_layers::varbuilder::VarBuilder;
use snafu::{ResultExt, Snafu};

use crate::checkpoint::{
    CheckpointError, CheckpointLayout, CheckpointLayoutError, ParameterNaming,
    ParameterNamingError,
};
use crate::distributed::{Pipeline, PipelineError, ProcessGroup};
use crate::generation::{GenerateOptions, GenerationStats, Generator, GeneratorError};
use crate::models::llama::{
    LlamaParams, LlamaStage, LlamaStageError, ModelArgs, ModelArgsError, ModelArgsOverrides,
};
use crate::placement::{
    DeviceId, DeviceMap, DeviceMapError, DeviceMapSpec, PartitionError, PipelinePartition,
};
use crate::tokenizers::{HfTokenizer, Tokenizer, TokenizerError};

#[derive(Debug, Snafu)]
pub enum InferenceError {
    #[snafu(display("Cannot resolve checkpoint"))]
    Layout { source: CheckpointLayoutError },

    #[snafu(display("Cannot read model parameters"))]
    Params { source: ModelArgsError },

    #[snafu(display("Cannot load tokenizer"))]
    LoadTokenizer { source: TokenizerError },

    #[snafu(display("Cannot partition model over the process group"))]
    Partition { source: PartitionError },

    #[snafu(display("Cannot place model on devices"))]
    Placement { source: DeviceMapError },

    #[snafu(display("Cannot load weights"))]
    Weights { source: CheckpointError },

    #[snafu(display("Cannot determine parameter names"))]
    Naming { source: ParameterNamingError },

    #[snafu(display("Cannot load model stage"))]
    Stage { source: LlamaStageError },

    #[snafu(display("Pipeline error"))]
    Pipeline { source: PipelineError },

    #[snafu(display("Cannot generate"))]
    Generate { source: GeneratorError },
}

/// Options for loading a model.
#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub device_map: DeviceMapSpec,
    pub overrides: ModelArgsOverrides,
    pub dtype: Option<DType>,
    pub local_devices: Vec<DeviceId>,
}

impl LoadOptions {
    /// Placement of this rank's layers on its devices.
    ///
    /// Default: [DeviceMapSpec::Auto]
    pub fn device_map(mut self, device_map: DeviceMapSpec) -> Self {
        self.device_map = device_map;
        self
    }

    /// Overrides of the model parameters in `params.json`.
    pub fn overrides(mut self, overrides: ModelArgsOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Data type of the parameters.
    ///
    /// Default: `f16` when a CUDA device is used, `f32` otherwise.
    pub fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    /// Devices that this process may use.
    ///
    /// Default: the CPU.
    pub fn local_devices(mut self, local_devices: Vec<DeviceId>) -> Self {
        self.local_devices = local_devices;
        self
    }
}

/// A LLaMA model that is loaded on the ranks of a process group.
pub struct LlamaInference {
    args: ModelArgs,
    device_map: DeviceMap,
    generator: Generator,
    pipeline: Pipeline,
}

impl LlamaInference {
    /// Load `model` from `llama_path` and join the pipeline.
    ///
    /// Every rank of `group` must call this function. It returns once all
    /// ranks have loaded their layers.
    pub fn new(
        llama_path: impl AsRef<Path>,
        model: &str,
        options: &LoadOptions,
        group: Box<dyn ProcessGroup>,
    ) -> Result<Self, InferenceError> {
        let rank = group.rank();
        let layout = CheckpointLayout::resolve(llama_path, model).context(LayoutSnafu)?;
        log::info!("Loading {model} from {}", layout.model_dir.to_string_lossy());

        let params = LlamaParams::read(&layout.params_path).context(ParamsSnafu)?;
        let tokenizer =
            HfTokenizer::from_file(&layout.tokenizer_path).context(LoadTokenizerSnafu)?;
        let args = ModelArgs::new(params, &options.overrides).vocab_size(tokenizer.n_words());
        args.validate().context(ParamsSnafu)?;

        let partition =
            PipelinePartition::new(args.n_layers, group.world_size()).context(PartitionSnafu)?;
        let local_devices = if options.local_devices.is_empty() {
            vec![DeviceId::Cpu]
        } else {
            options.local_devices.clone()
        };
        let device_map = DeviceMap::build(&options.device_map, &partition, rank, &local_devices)
            .context(PlacementSnafu)?;
        for (module, device) in device_map.modules() {
            log::debug!("Rank {rank} places {module} on {device}");
        }
        let devices = device_map.open_devices().context(PlacementSnafu)?;

        let backend = layout.weights.load().context(WeightsSnafu)?;
        let naming = ParameterNaming::detect(backend.as_ref()).context(NamingSnafu)?;
        log::info!("Checkpoint uses {naming:?} parameter names");

        let dtype = options.dtype.unwrap_or_else(|| {
            if device_map.devices().iter().any(|device| device.is_cuda()) {
                DType::F16
            } else {
                DType::F32
            }
        });
        let vb = VarBuilder::from_backend(naming.wrap(backend), dtype, Device::Cpu);
        let stage = LlamaStage::load(
            &args,
            vb,
            naming.interleaved_rotary(),
            &device_map,
            &devices,
        )
        .context(StageSnafu)?;
        log::info!(
            "Rank {rank} loaded layers {:?} in {dtype:?} (embeddings: {}, output: {})",
            stage.layers(),
            stage.is_first(),
            stage.is_last()
        );

        let mut pipeline = Pipeline::new(Box::new(stage), group);
        pipeline.barrier().context(PipelineSnafu)?;

        let generator = Generator::new(
            Arc::new(tokenizer),
            args.max_seq_len,
            args.max_batch_size,
        );

        Ok(LlamaInference {
            args,
            device_map,
            generator,
            pipeline,
        })
    }

    /// Model arguments after applying overrides.
    pub fn args(&self) -> &ModelArgs {
        &self.args
    }

    /// Placement of this rank's modules.
    pub fn device_map(&self) -> &DeviceMap {
        &self.device_map
    }

    pub fn rank(&self) -> usize {
        self.pipeline.rank()
    }

    /// Generate continuations of `prompts`, only on rank 0.
    ///
    /// Returns the prompts with their continuations and generation
    /// statistics.
    pub fn generate<S: AsRef<str>>(
        &mut self,
        prompts: &[S],
        options: &GenerateOptions,
    ) -> Result<(Vec<String>, GenerationStats), InferenceError> {
        let start = Instant::now();
        let (texts, mut stats) = self
            .generator
            .generate(&mut self.pipeline, prompts, options)
            .context(GenerateSnafu)?;
        stats.finish(start.elapsed());
        Ok((texts, stats))
    }

    /// Run this rank's stage for rank 0 until it shuts down the pipeline.
    pub fn serve(&mut self) -> Result<(), InferenceError> {
        self.pipeline.serve().context(PipelineSnafu)
    }

    /// Stop the other ranks, only on rank 0.
    pub fn shutdown(&mut self) -> Result<(), InferenceError> {
        self.pipeline.shutdown().context(PipelineSnafu)
    }
}
