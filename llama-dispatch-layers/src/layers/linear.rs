use candle_nn::Linear;

use crate::varbuilder::VarBuilder;

/// Linear projection without bias.
///
/// The weight matrix has the shape `(out_size, in_size)`, the layout that
/// is used by LLaMA checkpoints.
pub fn linear_no_bias(
    in_size: usize,
    out_size: usize,
    vb: VarBuilder,
) -> Result<Linear, candle_core::Error> {
    let weight = vb.get((out_size, in_size), "weight")?;
    Ok(Linear::new(weight, None))
}
