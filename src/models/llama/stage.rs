use std::collections::HashMap;
use std::ops::Range;

use candle_core::{DType, Module, Tensor};
use candle_nn::Linear;
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use llama_dispatch_layers::kv_cache::KeyValueCache;
use llama_dispatch_layers::layers::attention::{CausalMask, CausalMaskError};
use llama_dispatch_layers::layers::embedding::{embedding, Embedding};
use llama_dispatch_layers::layers::layer_norm::RmsNorm;
use llama_dispatch_layers::layers::linear::linear_no_bias;
use llama_dispatch_layers::layers::rotary::RotaryEmbeddings;
use llama_dispatch_layers::varbuilder::VarBuilder;

use crate::architectures::{PipelineStage, StageInput, StageOutput};
use crate::error::BoxedError;
use crate::models::llama::config::{ModelArgs, ModelArgsError};
use crate::models::llama::decoder::{LlamaBlock, LlamaBlockError};
use crate::placement::{DeviceId, DeviceMap, DeviceMapError, Devices};

#[derive(Debug, Snafu)]
pub enum LlamaStageError {
    #[snafu(display("Invalid model arguments"))]
    InvalidArgs { source: ModelArgsError },

    #[snafu(display("Cannot get device"))]
    Device { source: DeviceMapError },

    #[snafu(display("Cannot build piece embeddings"))]
    BuildEmbeddings { source: candle_core::Error },

    #[snafu(display("Cannot build rotary embeddings"))]
    BuildRotary { source: candle_core::Error },

    #[snafu(display("Cannot build layer {layer}"))]
    BuildBlock {
        source: LlamaBlockError,
        layer: usize,
    },

    #[snafu(display("Cannot build output layer"))]
    BuildOutput { source: candle_core::Error },

    #[snafu(display("Layers of a stage must be contiguous, layer {layer} follows layer {previous}"))]
    NonContiguousLayers { layer: usize, previous: usize },

    #[snafu(display("Stage does not run the piece embeddings"))]
    NotFirstStage,

    #[snafu(display("Stage input must have at least one position"))]
    EmptyInput,

    #[snafu(display("Cache has {cached} positions, but input starts at position {index_pos}"))]
    CachePosition { cached: usize, index_pos: usize },

    #[snafu(display("Cache has no entry for layer {layer} of the stage"))]
    MissingLayerCache { layer: usize },

    #[snafu(display("Cannot create causal mask"))]
    Mask { source: CausalMaskError },

    #[snafu(display("Cannot run stage"))]
    Forward { source: candle_core::Error },
}

/// Final norm and output projection.
#[derive(Clone, Debug)]
struct LlamaHead {
    norm: RmsNorm,
    output: Linear,
}

impl LlamaHead {
    fn forward(&self, last_hidden: &Tensor) -> Result<Tensor, candle_core::Error> {
        let device = self.norm.weight().device();
        let last_hidden = last_hidden.to_device(device)?;
        self.output
            .forward(&self.norm.forward(&last_hidden)?)?
            .squeeze(1)?
            .to_dtype(DType::F32)
    }
}

/// The layers of a LLaMA model that are run by one rank.
///
/// The first stage embeds pieces, the last stage computes logits. In a
/// single-process setup, the only stage does both.
#[derive(Clone, Debug)]
pub struct LlamaStage {
    embeddings: Option<Embedding>,
    blocks: Vec<LlamaBlock>,
    head: Option<LlamaHead>,
    layers: Range<usize>,
    dtype: DType,
}

impl LlamaStage {
    /// Load the layers that the device map places on this rank.
    ///
    /// * `args` - Model arguments, the vocabulary size must be set.
    /// * `vb` - Parameters with model-internal names.
    /// * `interleaved_rotary` - Rotate interleaved pairs of query/key elements.
    /// * `device_map` - Devices of this rank's modules.
    /// * `devices` - Opened devices of the device map.
    pub fn load(
        args: &ModelArgs,
        vb: VarBuilder,
        interleaved_rotary: bool,
        device_map: &DeviceMap,
        devices: &Devices,
    ) -> Result<Self, LlamaStageError> {
        args.validate().context(InvalidArgsSnafu)?;
        let n_pieces = args.vocab_size.unwrap_or_default();

        let embeddings = device_map
            .embeddings()
            .map(|id| {
                let device = devices.get(id).context(DeviceSnafu)?;
                embedding(
                    n_pieces,
                    args.dim,
                    vb.on_device(device.clone()).push_prefix("tok_embeddings"),
                )
                .context(BuildEmbeddingsSnafu)
            })
            .transpose()?;

        let mut rotaries: HashMap<DeviceId, RotaryEmbeddings> = HashMap::new();
        let mut blocks = Vec::new();
        let mut layers: Option<Range<usize>> = None;
        for (layer, id) in device_map.layers() {
            if let Some(layers) = &layers {
                ensure!(
                    layers.end == layer,
                    NonContiguousLayersSnafu {
                        layer,
                        previous: layers.end - 1
                    }
                );
            }

            let device = devices.get(id).context(DeviceSnafu)?;
            let rotary = match rotaries.get(&id) {
                Some(rotary) => rotary.clone(),
                None => {
                    let rotary = args
                        .rotary_config(interleaved_rotary)
                        .build(vb.dtype(), device)
                        .context(BuildRotarySnafu)?;
                    rotaries.insert(id, rotary.clone());
                    rotary
                }
            };

            blocks.push(
                LlamaBlock::new(
                    args,
                    vb.on_device(device.clone())
                        .push_prefix("layers")
                        .push_prefix(layer),
                    rotary,
                )
                .context(BuildBlockSnafu { layer })?,
            );
            log::debug!("Loaded layer {layer} on {id}");

            layers = Some(match layers {
                Some(layers) => layers.start..layer + 1,
                None => layer..layer + 1,
            });
        }

        let head = device_map
            .head()
            .map(|id| Self::load_head(args, &vb, n_pieces, devices, id))
            .transpose()?;

        Ok(LlamaStage {
            embeddings,
            blocks,
            head,
            layers: layers.unwrap_or(0..0),
            dtype: vb.dtype(),
        })
    }

    fn load_head(
        args: &ModelArgs,
        vb: &VarBuilder,
        n_pieces: usize,
        devices: &Devices,
        id: DeviceId,
    ) -> Result<LlamaHead, LlamaStageError> {
        let vb = vb.on_device(devices.get(id).context(DeviceSnafu)?.clone());
        let norm = args
            .norm_config()
            .build(vb.push_prefix("norm"))
            .context(BuildOutputSnafu)?;

        // Models with tied embeddings do not store an output projection.
        let output_prefix = if vb.contains_tensor("output.weight") {
            "output"
        } else {
            log::info!("Checkpoint has no output projection, using piece embeddings");
            "tok_embeddings"
        };
        let output = linear_no_bias(args.dim, n_pieces, vb.push_prefix(output_prefix))
            .context(BuildOutputSnafu)?;

        Ok(LlamaHead { norm, output })
    }

    /// Model layers that are run by this stage.
    pub fn layers(&self) -> Range<usize> {
        self.layers.clone()
    }

    /// Whether this stage embeds pieces.
    pub fn is_first(&self) -> bool {
        self.embeddings.is_some()
    }

    /// Whether this stage computes logits.
    pub fn is_last(&self) -> bool {
        self.head.is_some()
    }

    /// Run the stage, see [PipelineStage::forward].
    pub fn forward(
        &self,
        input: StageInput,
        index_pos: usize,
        cache: &mut KeyValueCache,
    ) -> Result<StageOutput, LlamaStageError> {
        let cached = cache.seq_len();
        ensure!(cached == index_pos, CachePositionSnafu { cached, index_pos });
        ensure!(
            cache.n_layers() == self.blocks.len(),
            MissingLayerCacheSnafu {
                layer: cache.n_layers().min(self.blocks.len())
            }
        );

        let mut xs = match input {
            StageInput::Pieces(piece_ids) => {
                let embeddings = self.embeddings.as_ref().context(NotFirstStageSnafu)?;
                piece_ids
                    .to_device(embeddings.device())
                    .and_then(|piece_ids| embeddings.forward(&piece_ids))
                    .context(ForwardSnafu)?
            }
            StageInput::Hidden(hidden) => hidden.to_dtype(self.dtype).context(ForwardSnafu)?,
        };

        let seq_len = xs.dim(1).context(ForwardSnafu)?;
        ensure!(seq_len > 0, EmptyInputSnafu);

        let mut mask: Option<CausalMask> = None;
        for (idx, block) in self.blocks.iter().enumerate() {
            if !xs.device().same_device(block.device()) {
                xs = xs.to_device(block.device()).context(ForwardSnafu)?;
            }

            // A single new position can attend to all cached positions.
            if seq_len > 1 {
                mask = match mask {
                    None => Some(
                        CausalMask::new(seq_len, index_pos, block.device()).context(MaskSnafu)?,
                    ),
                    Some(mask) if !mask.bool_mask().device().same_device(block.device()) => {
                        Some(mask.to_device(block.device()).context(ForwardSnafu)?)
                    }
                    mask => mask,
                };
            }

            let layer_cache = cache
                .layer_mut(idx)
                .context(MissingLayerCacheSnafu { layer: idx })?;
            xs = block
                .forward(&xs, mask.as_ref(), index_pos, layer_cache)
                .context(ForwardSnafu)?;
        }

        match &self.head {
            Some(head) => {
                let last_hidden = xs.narrow(1, seq_len - 1, 1).context(ForwardSnafu)?;
                Ok(StageOutput::Logits(
                    head.forward(&last_hidden).context(ForwardSnafu)?,
                ))
            }
            None => Ok(StageOutput::Hidden(xs)),
        }
    }
}

impl PipelineStage for LlamaStage {
    fn forward(
        &self,
        input: StageInput,
        index_pos: usize,
        cache: &mut KeyValueCache,
    ) -> Result<StageOutput, BoxedError> {
        Ok(LlamaStage::forward(self, input, index_pos, cache)?)
    }

    fn new_cache(&self) -> KeyValueCache {
        KeyValueCache::new(self.blocks.len())
    }
}
