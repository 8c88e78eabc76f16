use std::ops::Range;

use snafu::{ensure, Snafu};

#[derive(Debug, Snafu)]
pub enum PartitionError {
    #[snafu(display("Cannot split a model over zero ranks"))]
    ZeroWorldSize,

    #[snafu(display("Cannot split {n_layers} layers over {world_size} ranks"))]
    TooFewLayers { n_layers: usize, world_size: usize },
}

/// Split of the transformer layers over pipeline ranks.
///
/// Every rank owns a contiguous block of layers. When the number of layers
/// is not divisible by the number of ranks, the first `n_layers %
/// world_size` ranks own one extra layer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PipelinePartition {
    n_layers: usize,
    world_size: usize,
}

impl PipelinePartition {
    pub fn new(n_layers: usize, world_size: usize) -> Result<Self, PartitionError> {
        ensure!(world_size > 0, ZeroWorldSizeSnafu);
        ensure!(
            n_layers >= world_size,
            TooFewLayersSnafu {
                n_layers,
                world_size
            }
        );
        Ok(PipelinePartition {
            n_layers,
            world_size,
        })
    }

    pub fn n_layers(&self) -> usize {
        self.n_layers
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Layers owned by `rank`.
    pub fn layers(&self, rank: usize) -> Range<usize> {
        if rank >= self.world_size {
            return self.n_layers..self.n_layers;
        }

        let (start, len) = block(self.n_layers, self.world_size, rank);
        start..start + len
    }

    /// Whether `rank` runs the embeddings.
    pub fn is_first(&self, rank: usize) -> bool {
        rank == 0
    }

    /// Whether `rank` runs the final norm and the output projection.
    pub fn is_last(&self, rank: usize) -> bool {
        rank + 1 == self.world_size
    }
}

/// Check whether `layer` is run by `rank`.
///
/// This is the predicate that is used to build the device map of a
/// rank. It returns `false` for invalid partitions.
pub fn is_valid_layer(rank: usize, world_size: usize, layer: usize, n_layers: usize) -> bool {
    PipelinePartition::new(n_layers, world_size)
        .map(|partition| partition.layers(rank).contains(&layer))
        .unwrap_or(false)
}

/// Start and length of block `index` when `n` items are split in `n_blocks`
/// balanced contiguous blocks.
pub(crate) fn block(n: usize, n_blocks: usize, index: usize) -> (usize, usize) {
    let base = n / n_blocks;
    let extra = n % n_blocks;
    let start = index * base + index.min(extra);
    let len = base + usize::from(index < extra);
    (start, len)
}
