use candle_core::Tensor;

/// Cached keys and values of a single attention layer.
///
/// Keys and values have the shape `(batch_size, n_key_value_heads, seq_len,
/// head_width)` and grow along the sequence axis.
#[derive(Clone, Debug, Default)]
pub struct LayerCache {
    key: Option<Tensor>,
    value: Option<Tensor>,
}

impl LayerCache {
    /// Append keys and values of new positions.
    ///
    /// Returns the keys and values of all positions seen so far.
    pub fn update(
        &mut self,
        key: Tensor,
        value: Tensor,
    ) -> Result<(Tensor, Tensor), candle_core::Error> {
        let (key, value) = match (self.key.take(), self.value.take()) {
            (Some(cached_key), Some(cached_value)) => (
                Tensor::cat(&[&cached_key, &key], 2)?,
                Tensor::cat(&[&cached_value, &value], 2)?,
            ),
            _ => (key, value),
        };

        self.key = Some(key.clone());
        self.value = Some(value.clone());

        Ok((key, value))
    }

    /// Number of cached positions.
    pub fn seq_len(&self) -> usize {
        self.key
            .as_ref()
            .and_then(|key| key.dim(2).ok())
            .unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.key = None;
        self.value = None;
    }
}

/// Key-value cache for the layers of a model (stage).
///
/// Layers are addressed by their index within the stage, not by their
/// index within the full model.
#[derive(Clone, Debug)]
pub struct KeyValueCache {
    layers: Vec<LayerCache>,
}

impl KeyValueCache {
    /// Create an empty cache for `n_layers` layers.
    pub fn new(n_layers: usize) -> Self {
        KeyValueCache {
            layers: vec![LayerCache::default(); n_layers],
        }
    }

    /// Get the cache of a layer.
    ///
    /// Returns `None` if the layer index is out of bounds.
    pub fn layer_mut(&mut self, layer: usize) -> Option<&mut LayerCache> {
        self.layers.get_mut(layer)
    }

    /// Number of layers covered by this cache.
    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Number of cached positions.
    pub fn seq_len(&self) -> usize {
        self.layers.first().map(LayerCache::seq_len).unwrap_or(0)
    }

    /// Remove all cached keys and values.
    pub fn reset(&mut self) {
        self.layers.iter_mut().for_each(LayerCache::clear);
    }
}
