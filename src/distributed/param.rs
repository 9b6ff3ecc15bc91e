//! Learnable parameters as seen by the gradient engines.

use crate::utils::error::Result;
use candle_core::backprop::GradStore;
use candle_core::Tensor;
use candle_nn::VarMap;

/// Parallelism metadata attached to a parameter at model construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParallelMeta {
    /// Storage aliased by several logical layers (e.g. tied embeddings).
    /// Shared parameters never contribute to the global norm.
    pub shared: bool,
    /// Partitioned across the tensor-parallel group.
    pub tensor_model_parallel: bool,
    /// Gradient depends on the full sequence while activations are split
    /// along it (layer norms under sequence parallelism).
    pub sequence_parallel_enabled: bool,
}

/// One learnable tensor's gradient plus its metadata.
///
/// The engines only read or replace `grad`; the parameter itself stays
/// owned by the model.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub grad: Option<Tensor>,
    pub meta: ParallelMeta,
}

impl Parameter {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), grad: None, meta: ParallelMeta::default() }
    }

    pub fn with_grad(mut self, grad: Tensor) -> Self {
        self.grad = Some(grad);
        self
    }

    pub fn with_meta(mut self, meta: ParallelMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn shared(mut self) -> Self {
        self.meta.shared = true;
        self
    }

    pub fn tensor_model_parallel(mut self) -> Self {
        self.meta.tensor_model_parallel = true;
        self
    }

    pub fn sequence_parallel(mut self) -> Self {
        self.meta.sequence_parallel_enabled = true;
        self
    }

    pub fn has_grad(&self) -> bool {
        self.grad.is_some()
    }
}

/// Build parameters from a `VarMap` and the gradients of a backward pass.
///
/// Parameters are sorted by name so every rank sees the same order.
/// Variables without a gradient get `grad: None`.
pub fn params_from_varmap<F>(varmap: &VarMap, grads: &GradStore, meta_for: F) -> Result<Vec<Parameter>>
where
    F: Fn(&str) -> ParallelMeta,
{
    let data = varmap
        .data()
        .lock()
        .map_err(|e| candle_core::Error::Msg(format!("varmap lock poisoned: {}", e)))?;

    let mut names: Vec<&String> = data.keys().collect();
    names.sort();

    Ok(names
        .into_iter()
        .map(|name| Parameter {
            name: name.clone(),
            grad: grads.get(data[name].as_tensor()).cloned(),
            meta: meta_for(name),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Module, VarBuilder};

    #[test]
    fn test_params_from_varmap() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let fc = candle_nn::linear(3, 2, vb.pp("fc"))?;

        let x = Tensor::ones((4, 3), DType::F32, &device)?;
        let loss = fc.forward(&x)?.sum_all()?;
        let grads = loss.backward()?;

        let params = params_from_varmap(&varmap, &grads, |name| ParallelMeta {
            tensor_model_parallel: name.ends_with("weight"),
            ..Default::default()
        })?;

        let names: Vec<&str> = params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["fc.bias", "fc.weight"]);
        assert!(params.iter().all(Parameter::has_grad));
        assert!(params[1].meta.tensor_model_parallel);
        assert!(!params[0].meta.tensor_model_parallel);

        // d(sum(xW^T + b))/db = batch size
        let bias_grad = params[0].grad.as_ref().unwrap().to_vec1::<f32>()?;
        assert_eq!(bias_grad, vec![4.0, 4.0]);
        Ok(())
    }

    #[test]
    fn test_builders() {
        let p = Parameter::new("embed").shared().sequence_parallel();
        assert!(p.meta.shared);
        assert!(p.meta.sequence_parallel_enabled);
        assert!(!p.meta.tensor_model_parallel);
        assert!(!p.has_grad());
    }
}
