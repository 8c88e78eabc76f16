use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};

/// Sizes of a tiny LLaMA model.
pub struct TinyDims {
    pub dim: usize,
    pub n_layers: usize,
    pub kv_width: usize,
    pub ffn_width: usize,
    pub n_pieces: usize,
}

/// Random parameters with original LLaMA names.
///
/// Norm weights are ones. When `with_output` is `false`, the output
/// projection is tied to the piece embeddings.
pub fn tiny_parameters(dims: &TinyDims, with_output: bool) -> HashMap<String, Tensor> {
    let device = Device::Cpu;
    let TinyDims {
        dim,
        n_layers,
        kv_width,
        ffn_width,
        n_pieces,
    } = *dims;
    let random = |shape: (usize, usize)| {
        Tensor::randn(0f32, 0.3, shape, &device).expect("Cannot create random tensor")
    };
    let ones = |size: usize| Tensor::ones(size, DType::F32, &device).expect("Cannot create tensor");

    let mut tensors = HashMap::new();
    tensors.insert("tok_embeddings.weight".to_string(), random((n_pieces, dim)));
    for layer in 0..n_layers {
        for (name, tensor) in [
            ("attention.wq.weight", random((dim, dim))),
            ("attention.wk.weight", random((kv_width, dim))),
            ("attention.wv.weight", random((kv_width, dim))),
            ("attention.wo.weight", random((dim, dim))),
            ("feed_forward.w1.weight", random((ffn_width, dim))),
            ("feed_forward.w2.weight", random((dim, ffn_width))),
            ("feed_forward.w3.weight", random((ffn_width, dim))),
            ("attention_norm.weight", ones(dim)),
            ("ffn_norm.weight", ones(dim)),
        ] {
            tensors.insert(format!("layers.{layer}.{name}"), tensor);
        }
    }
    tensors.insert("norm.weight".to_string(), ones(dim));
    if with_output {
        tensors.insert("output.weight".to_string(), random((n_pieces, dim)));
    }

    tensors
}
