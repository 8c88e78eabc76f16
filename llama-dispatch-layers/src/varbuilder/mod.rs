use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use candle_core::{DType, Device, Shape, Tensor};
use candle_nn::{var_builder::SimpleBackend, Init};

/// Builder for model parameters.
///
/// This is similar to Candle's `VarBuilder`, except that the backend is
/// shared. A single memory-mapped checkpoint can then hand out parameters
/// for different devices: [VarBuilder::on_device] returns a builder that
/// places every parameter it reads on another device, without opening the
/// checkpoint again.
#[derive(Clone)]
pub struct VarBuilder {
    backend: Arc<dyn SimpleBackend>,
    path: Vec<String>,
    dtype: DType,
    device: Device,
}

impl VarBuilder {
    /// Construct a new `VarBuilder` from a backend.
    pub fn from_backend(backend: Arc<dyn SimpleBackend>, dtype: DType, device: Device) -> Self {
        VarBuilder {
            backend,
            path: Vec::new(),
            dtype,
            device,
        }
    }

    /// Construct a `VarBuilder` from in-memory tensors.
    pub fn from_tensors(tensors: HashMap<String, Tensor>, dtype: DType, device: Device) -> Self {
        Self::from_backend(Arc::new(tensors), dtype, device)
    }

    /// Get the data type of retrieved parameters.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// The device on which retrieved parameters are placed.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Returns a new `VarBuilder` with the prefix set to `prefix`.
    pub fn push_prefix<S: ToString>(&self, s: S) -> Self {
        let mut path = self.path.clone();
        path.push(s.to_string());
        VarBuilder {
            backend: self.backend.clone(),
            path,
            dtype: self.dtype,
            device: self.device.clone(),
        }
    }

    /// Returns a new `VarBuilder` that places parameters on `device`.
    ///
    /// The prefix and data type are retained.
    pub fn on_device(&self, device: Device) -> Self {
        VarBuilder {
            backend: self.backend.clone(),
            path: self.path.clone(),
            dtype: self.dtype,
            device,
        }
    }

    /// Check whether the backend has a parameter with the given name.
    ///
    /// The name is resolved relative to the current prefix.
    pub fn contains_tensor(&self, name: &str) -> bool {
        self.backend.contains_tensor(&self.path(name))
    }

    /// Retrieve the tensor.
    ///
    /// - `s` - Shape of the tensor.
    /// - `name` - Name of the tensor.
    pub fn get<S: Into<Shape>>(&self, s: S, name: &str) -> Result<Tensor, candle_core::Error> {
        self.backend.get(
            s.into(),
            &self.path(name),
            Init::Const(0.),
            self.dtype,
            &self.device,
        )
    }

    fn path(&self, name: &str) -> String {
        if self.path.is_empty() {
            name.to_string()
        } else {
            format!("{}.{name}", self.path.join("."))
        }
    }
}

impl fmt::Debug for VarBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VarBuilder")
            .field("path", &self.path)
            .field("dtype", &self.dtype)
            .field("device", &self.device)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use candle_core::{DType, Device, Tensor};

    use super::VarBuilder;

    #[test]
    fn prefixes_are_joined_with_dots() {
        let mut tensors = HashMap::new();
        tensors.insert(
            "layers.3.attention.wq.weight".to_string(),
            Tensor::ones((2, 2), DType::F32, &Device::Cpu).unwrap(),
        );
        let vb = VarBuilder::from_tensors(tensors, DType::F32, Device::Cpu);

        let attention = vb.push_prefix("layers").push_prefix(3).push_prefix("attention");
        assert!(attention.contains_tensor("wq.weight"));
        assert!(!attention.contains_tensor("wk.weight"));
        assert!(!vb.contains_tensor("wq.weight"));

        let weight = attention.push_prefix("wq").get((2, 2), "weight").unwrap();
        assert_eq!(weight.dims(), &[2, 2]);
    }

    #[test]
    fn parameters_are_converted_to_builder_dtype() {
        let mut tensors = HashMap::new();
        tensors.insert(
            "norm.weight".to_string(),
            Tensor::ones(4, DType::F32, &Device::Cpu).unwrap(),
        );
        let vb = VarBuilder::from_tensors(tensors, DType::F16, Device::Cpu);
        let weight = vb.push_prefix("norm").get(4, "weight").unwrap();
        assert_eq!(weight.dtype(), DType::F16);
    }

    #[test]
    fn shape_mismatch_is_an_error() {
        let mut tensors = HashMap::new();
        tensors.insert(
            "norm.weight".to_string(),
            Tensor::ones(4, DType::F32, &Device::Cpu).unwrap(),
        );
        let vb = VarBuilder::from_tensors(tensors, DType::F32, Device::Cpu);
        assert!(vb.push_prefix("norm").get(8, "weight").is_err());
    }
}
