use std::sync::Arc;

use candle_core::{DType, Device, Shape, Tensor};
use candle_nn::var_builder::SimpleBackend;
use candle_nn::Init;

/// Backend that renames parameters before looking them up.
///
/// Model code uses one set of parameter names, `rename` maps them to the
/// names that are used by a checkpoint.
pub struct RenamingBackend<F> {
    inner: Arc<dyn SimpleBackend>,
    rename: F,
}

impl<F> RenamingBackend<F>
where
    F: Fn(&str) -> String + Send + Sync,
{
    pub fn new(inner: Arc<dyn SimpleBackend>, rename: F) -> Self {
        RenamingBackend { inner, rename }
    }
}

impl<F> SimpleBackend for RenamingBackend<F>
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn get(
        &self,
        s: Shape,
        name: &str,
        h: Init,
        dtype: DType,
        dev: &Device,
    ) -> Result<Tensor, candle_core::Error> {
        self.inner.get(s, &(self.rename)(name), h, dtype, dev)
    }

    fn contains_tensor(&self, name: &str) -> bool {
        self.inner.contains_tensor(&(self.rename)(name))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use candle_core::{DType, Device, Tensor};
    use candle_nn::var_builder::SimpleBackend;
    use candle_nn::Init;

    use super::RenamingBackend;

    #[test]
    fn lookups_use_renamed_parameters() {
        let mut tensors = HashMap::new();
        tensors.insert(
            "model.norm.weight".to_string(),
            Tensor::ones(2, DType::F32, &Device::Cpu).unwrap(),
        );
        let backend = RenamingBackend::new(Arc::new(tensors), |name: &str| format!("model.{name}"));

        assert!(backend.contains_tensor("norm.weight"));
        assert!(!backend.contains_tensor("model.norm.weight"));
        let weight = backend
            .get(2.into(), "norm.weight", Init::Const(0.), DType::F32, &Device::Cpu)
            .unwrap();
        assert_eq!(weight.dims(), &[2]);
    }
}
