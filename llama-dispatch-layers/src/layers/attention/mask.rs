use candle_core::{Device, Tensor};
use snafu::{ensure, ResultExt, Snafu};

/// Errors for attention masks.
#[derive(Debug, Snafu)]
pub enum CausalMaskError {
    #[snafu(display("Cannot create causal mask tensor"))]
    CreateMask { source: candle_core::Error },

    #[snafu(display("Causal mask needs at least one query position"))]
    EmptySequence,
}

/// Causal attention mask.
///
/// Queries cover the positions `index_pos..index_pos + seq_len`, keys cover
/// all positions up to the last query (cached keys included). A query may
/// attend to keys at its own position or before. Mask elements that are set
/// to `1` are ignored during attention calculation.
#[derive(Clone, Debug)]
pub struct CausalMask {
    pub(crate) bool_mask: Tensor,
}

impl CausalMask {
    /// Create a causal mask.
    ///
    /// * `seq_len` - Number of new positions (queries).
    /// * `index_pos` - Number of positions in the key-value cache.
    /// * `device` - Device to create the mask on.
    pub fn new(seq_len: usize, index_pos: usize, device: &Device) -> Result<Self, CausalMaskError> {
        ensure!(seq_len > 0, EmptySequenceSnafu);

        let kv_len = index_pos + seq_len;
        let mask: Vec<u8> = (0..seq_len)
            .flat_map(|i| (0..kv_len).map(move |j| u8::from(j > i + index_pos)))
            .collect();

        Ok(CausalMask {
            bool_mask: Tensor::from_vec(mask, (seq_len, kv_len), device).context(CreateMaskSnafu)?,
        })
    }

    /// Boolean mask tensor.
    /// *Shape:* `(seq_len, index_pos + seq_len)`
    pub fn bool_mask(&self) -> &Tensor {
        &self.bool_mask
    }

    /// Copy the mask to another device.
    pub fn to_device(&self, device: &Device) -> Result<Self, candle_core::Error> {
        Ok(CausalMask {
            bool_mask: self.bool_mask.to_device(device)?,
        })
    }

    /// Set masked attention scores to negative infinity.
    ///
    /// * `scores` - Attention scores.
    ///   *Shape:* `(batch_size, n_heads, seq_len, index_pos + seq_len)`
    pub fn apply(&self, scores: &Tensor) -> Result<Tensor, candle_core::Error> {
        let mask = self.bool_mask.broadcast_as(scores.shape())?;
        let neg_inf = Tensor::new(f32::NEG_INFINITY, scores.device())?
            .to_dtype(scores.dtype())?
            .broadcast_as(scores.shape())?;
        mask.where_cond(&neg_inf, scores)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use ndarray::array;

    use super::{CausalMask, CausalMaskError};
    use crate::util::assert_tensor_eq;

    #[test]
    fn mask_accounts_for_cached_positions() {
        let mask = CausalMask::new(3, 1, &Device::Cpu).unwrap();
        assert_tensor_eq::<u8>(
            mask.bool_mask().clone(),
            array![[0u8, 0, 1, 1], [0, 0, 0, 1], [0, 0, 0, 0]],
            0,
        );
    }

    #[test]
    fn masked_scores_become_negative_infinity() {
        let mask = CausalMask::new(2, 0, &Device::Cpu).unwrap();
        let scores = Tensor::ones((1, 1, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let masked: Vec<f32> = mask
            .apply(&scores)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(masked, vec![1., f32::NEG_INFINITY, 1., 1.]);
    }

    #[test]
    fn mask_keeps_its_values_on_another_device() {
        let mask = CausalMask::new(2, 1, &Device::Cpu).unwrap();
        let moved = mask.to_device(&Device::Cpu).unwrap();
        assert!(moved.bool_mask().device().is_cpu());
        assert_tensor_eq::<u8>(
            moved.bool_mask().clone(),
            array![[0u8, 0, 1], [0, 0, 0]],
            0,
        );
    }

    #[test]
    fn empty_sequence_is_rejected() {
        assert!(matches!(
            CausalMask::new(0, 4, &Device::Cpu),
            Err(CausalMaskError::EmptySequence)
        ));
    }
}
