//! Piece embeddings.

use candle_core::{Device, Module, Tensor};

use crate::varbuilder::VarBuilder;

/// Lookup table from piece identifiers to hidden representations.
#[derive(Clone, Debug)]
pub struct Embedding {
    embeddings: Tensor,
}

impl Embedding {
    /// Device that the piece identifiers must be on.
    pub fn device(&self) -> &Device {
        self.embeddings.device()
    }
}

impl Module for Embedding {
    /// Embed pieces.
    ///
    /// * `piece_ids` - *Shape:* `(batch_size, seq_len)`
    ///
    /// Returns the embeddings with shape `(batch_size, seq_len, hidden_size)`.
    fn forward(&self, piece_ids: &Tensor) -> Result<Tensor, candle_core::Error> {
        let (_, hidden_size) = self.embeddings.dims2()?;
        let mut dims = piece_ids.dims().to_vec();
        dims.push(hidden_size);
        self.embeddings
            .index_select(&piece_ids.flatten_all()?, 0)?
            .reshape(dims)
    }
}

/// Read an embedding matrix of shape `(n_pieces, hidden_size)`.
pub fn embedding(
    n_pieces: usize,
    hidden_size: usize,
    vb: VarBuilder,
) -> Result<Embedding, candle_core::Error> {
    let embeddings = vb.get((n_pieces, hidden_size), "weight")?;
    Ok(Embedding { embeddings })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use candle_core::{DType, Device, Module, Tensor};
    use ndarray::array;

    use super::embedding;
    use crate::util::assert_tensor_eq;
    use crate::varbuilder::VarBuilder;

    #[test]
    fn embedding_looks_up_rows() {
        let mut tensors = HashMap::new();
        tensors.insert(
            "weight".to_string(),
            Tensor::new(&[[0f32, 0.], [1., 2.], [3., 4.]], &Device::Cpu).unwrap(),
        );
        let vb = VarBuilder::from_tensors(tensors, DType::F32, Device::Cpu);
        let embeddings = embedding(3, 2, vb).unwrap();

        let ids = Tensor::new(&[[2u32, 1], [0, 2]], &Device::Cpu).unwrap();
        let output = embeddings.forward(&ids).unwrap();

        assert_tensor_eq::<f32>(
            output,
            array![[[3f32, 4.], [1., 2.]], [[0., 0.], [3., 4.]]],
            1e-6,
        );
    }
}
