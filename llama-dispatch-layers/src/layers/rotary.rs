use candle_core::{DType, Device, Tensor};
use candle_nn::rotary_emb::{rope, rope_i};

/// Rotary embeddings configuration.
#[derive(Clone, Debug)]
pub struct RotaryEmbeddingsConfig {
    pub base: f32,
    pub head_width: usize,
    pub interleaved: bool,
    pub seq_len: usize,
}

impl RotaryEmbeddingsConfig {
    /// Base used for the frequencies.
    ///
    /// Default: `10000.0`
    pub fn base(mut self, base: f32) -> Self {
        self.base = base;
        self
    }

    /// Width of an attention head.
    ///
    /// Default: `128`
    pub fn head_width(mut self, head_width: usize) -> Self {
        self.head_width = head_width;
        self
    }

    /// Rotate interleaved pairs `(x[2i], x[2i + 1])`.
    ///
    /// Checkpoints in the original LLaMA layout rotate interleaved pairs,
    /// checkpoints that were converted to the Hugging Face layout rotate
    /// `(x[i], x[i + head_width / 2])`.
    ///
    /// Default: `true`
    pub fn interleaved(mut self, interleaved: bool) -> Self {
        self.interleaved = interleaved;
        self
    }

    /// Number of positions to precompute.
    ///
    /// Default: `4096`
    pub fn seq_len(mut self, seq_len: usize) -> Self {
        self.seq_len = seq_len;
        self
    }

    /// Precompute the rotations on `device`.
    pub fn build(&self, dtype: DType, device: &Device) -> Result<RotaryEmbeddings, candle_core::Error> {
        let inv_freq: Vec<f32> = (0..self.head_width)
            .step_by(2)
            .map(|i| 1f32 / self.base.powf(i as f32 / self.head_width as f32))
            .collect();
        let n_freqs = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, n_freqs), device)?;
        let positions = Tensor::arange(0u32, self.seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((self.seq_len, 1))?;
        let freqs = positions.matmul(&inv_freq)?;

        Ok(RotaryEmbeddings {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
            interleaved: self.interleaved,
        })
    }
}

impl Default for RotaryEmbeddingsConfig {
    fn default() -> Self {
        RotaryEmbeddingsConfig {
            base: 10_000.,
            head_width: 128,
            interleaved: true,
            seq_len: 4096,
        }
    }
}

/// Precomputed rotary embeddings.
///
/// Cloning is cheap, the cosine and sine tables are shared.
#[derive(Clone, Debug)]
pub struct RotaryEmbeddings {
    cos: Tensor,
    sin: Tensor,
    interleaved: bool,
}

impl RotaryEmbeddings {
    /// Rotate queries or keys.
    ///
    /// * `xs` - Queries or keys.
    ///   *Shape:* `(batch_size, n_heads, seq_len, head_width)`
    /// * `index_pos` - Position of the first element of the sequence.
    pub fn apply(&self, xs: &Tensor, index_pos: usize) -> Result<Tensor, candle_core::Error> {
        let (_, _, seq_len, _) = xs.dims4()?;
        let cos = self.cos.narrow(0, index_pos, seq_len)?;
        let sin = self.sin.narrow(0, index_pos, seq_len)?;
        let xs = xs.contiguous()?;
        if self.interleaved {
            rope_i(&xs, &cos, &sin)
        } else {
            rope(&xs, &cos, &sin)
        }
    }
}
