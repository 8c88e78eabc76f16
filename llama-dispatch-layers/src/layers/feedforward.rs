use candle_core::{Module, Tensor};
use candle_nn::Linear;

use crate::layers::linear::linear_no_bias;
use crate::varbuilder::VarBuilder;

/// Gated feed-forward configuration.
#[derive(Clone, Debug)]
pub struct SwiGluFeedForwardConfig {
    pub hidden_width: usize,
    pub intermediate_width: usize,
}

impl SwiGluFeedForwardConfig {
    /// Hidden width of the transformer.
    ///
    /// Default: `4096`
    pub fn hidden_width(mut self, hidden_width: usize) -> Self {
        self.hidden_width = hidden_width;
        self
    }

    /// Width of the gated intermediate representation.
    ///
    /// Default: `11008`
    pub fn intermediate_width(mut self, intermediate_width: usize) -> Self {
        self.intermediate_width = intermediate_width;
        self
    }

    /// Build the feed-forward layer.
    ///
    /// Parameters are read from `w1` (gate), `w2` (output) and `w3`
    /// (intermediate).
    pub fn build(&self, vb: VarBuilder) -> Result<SwiGluFeedForward, candle_core::Error> {
        Ok(SwiGluFeedForward {
            gate: linear_no_bias(
                self.hidden_width,
                self.intermediate_width,
                vb.push_prefix("w1"),
            )?,
            output: linear_no_bias(
                self.intermediate_width,
                self.hidden_width,
                vb.push_prefix("w2"),
            )?,
            intermediate: linear_no_bias(
                self.hidden_width,
                self.intermediate_width,
                vb.push_prefix("w3"),
            )?,
        })
    }
}

impl Default for SwiGluFeedForwardConfig {
    fn default() -> Self {
        SwiGluFeedForwardConfig {
            hidden_width: 4096,
            intermediate_width: 11008,
        }
    }
}

/// Feed-forward layer with a SiLU-gated linear unit.
#[derive(Clone, Debug)]
pub struct SwiGluFeedForward {
    gate: Linear,
    intermediate: Linear,
    output: Linear,
}

impl Module for SwiGluFeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor, candle_core::Error> {
        let gate = self.gate.forward(xs)?.silu()?;
        let intermediate = self.intermediate.forward(xs)?;
        self.output.forward(&(gate * intermediate)?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use candle_core::{DType, Device, Module, Tensor};
    use ndarray::array;

    use super::SwiGluFeedForwardConfig;
    use crate::util::assert_tensor_eq;
    use crate::varbuilder::VarBuilder;

    #[test]
    fn gate_is_applied_to_intermediate() {
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert(
            "w1.weight".to_string(),
            Tensor::new(&[[1f32, 0.]], &device).unwrap(),
        );
        tensors.insert(
            "w3.weight".to_string(),
            Tensor::new(&[[0f32, 1.]], &device).unwrap(),
        );
        tensors.insert(
            "w2.weight".to_string(),
            Tensor::new(&[[1f32], [2.]], &device).unwrap(),
        );
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device.clone());
        let ffn = SwiGluFeedForwardConfig::default()
            .hidden_width(2)
            .intermediate_width(1)
            .build(vb)
            .unwrap();

        let xs = Tensor::new(&[[2f32, 3.]], &device).unwrap();
        let silu_2 = 2f32 / (1. + (-2f32).exp());
        assert_tensor_eq::<f32>(
            ffn.forward(&xs).unwrap(),
            array![[silu_2 * 3., silu_2 * 6.]],
            1e-5,
        );
    }
}
