use candle_core::{DType, Module, Tensor, D};

use crate::varbuilder::VarBuilder;

/// RMS norm configuration.
#[derive(Clone, Debug)]
pub struct RmsNormConfig {
    pub eps: f64,
    pub size: usize,
}

impl RmsNormConfig {
    /// Epsilon value.
    ///
    /// Default: `1e-6`
    pub fn eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Dimensionality of the layer.
    ///
    /// Default: `4096`
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Build the norm, reading its weight from `vb`.
    pub fn build(&self, vb: VarBuilder) -> Result<RmsNorm, candle_core::Error> {
        let weight = vb.get(self.size, "weight")?;
        Ok(RmsNorm::new(weight, self.eps))
    }
}

impl Default for RmsNormConfig {
    fn default() -> Self {
        Self {
            eps: 1e-6,
            size: 4096,
        }
    }
}

/// Root mean square layer normalization.
///
/// Normalization is done in single precision when the input is in half
/// precision, the result is converted back to the input type before the
/// weight is applied.
#[derive(Clone, Debug)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    pub fn new(weight: Tensor, eps: f64) -> Self {
        RmsNorm { weight, eps }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

impl Module for RmsNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor, candle_core::Error> {
        let x_dtype = x.dtype();
        let internal_dtype = match x_dtype {
            DType::F16 | DType::BF16 => DType::F32,
            d => d,
        };
        let hidden_size = x.dim(D::Minus1)?;
        let x = x.to_dtype(internal_dtype)?;
        let norm_x = (x.sqr()?.sum_keepdim(D::Minus1)? / hidden_size as f64)?;
        let x_normed = x.broadcast_div(&(norm_x + self.eps)?.sqrt()?)?;
        x_normed.to_dtype(x_dtype)?.broadcast_mul(&self.weight)
    }
}
