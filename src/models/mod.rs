/// Classifier capability, built-in architectures and the name registry
use std::collections::HashMap;

use candle_core::{Tensor, Var};

use crate::config::ChannelLayout;
use crate::{EvalError, Result};

pub mod convnet;
pub mod loader;
pub mod registry;

pub use convnet::{ConvNet, LinearProbe};
pub use loader::{apply_state_dict, load_init_weights};
pub use registry::ModelRegistry;

/// Everything an architecture factory needs to size a model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub num_classes: usize,
    /// Side of the square input crop
    pub image_size: usize,
    pub in_channels: usize,
    /// Layout of incoming image batches
    pub layout: ChannelLayout,
}

impl ModelSpec {
    pub fn new(num_classes: usize, image_size: usize, layout: ChannelLayout) -> Self {
        Self {
            num_classes,
            image_size,
            in_channels: 3,
            layout,
        }
    }
}

/// An image classifier, consumed as an opaque forward pass
///
/// Parameters are exposed as named `Var`s so state can be saved and restored
/// without knowing the architecture.
pub trait Classifier: Send {
    /// Map an image batch to `[batch, num_classes]` logits
    fn forward(&self, images: &Tensor) -> candle_core::Result<Tensor>;

    /// Toggle train-only behaviour such as dropout
    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    /// Named parameters, sorted by name
    fn parameters(&self) -> Result<Vec<(String, Var)>>;

    /// Snapshot of all parameters
    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        Ok(self
            .parameters()?
            .into_iter()
            .map(|(name, var)| var.as_tensor().copy().map(|t| (name, t)))
            .collect::<candle_core::Result<HashMap<_, _>>>()?)
    }

    /// Overwrite every parameter from `state`
    ///
    /// Fails when a parameter is missing, when `state` holds unknown names,
    /// or when shapes disagree.
    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        let parameters = self.parameters()?;
        apply_state_dict(&parameters, state)
    }

    fn num_parameters(&self) -> Result<usize> {
        Ok(self
            .parameters()?
            .iter()
            .map(|(_, var)| var.as_tensor().elem_count())
            .sum())
    }
}

/// Collect a `VarMap`'s variables as sorted `(name, var)` pairs
pub(crate) fn sorted_vars(varmap: &candle_nn::VarMap) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| EvalError::Model("parameter map poisoned".to_string()))?;
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}
