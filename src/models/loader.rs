/// Weight loading into an existing classifier
use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor, Var};

use super::Classifier;
use crate::evaluation::checkpoint::CheckpointStore;
use crate::{EvalError, Result};

/// Copy named tensors into matching variables
///
/// # Arguments
/// * `parameters` - Target variables as `(name, var)` pairs
/// * `state` - Source tensors by name, on any device
///
/// # Returns
/// An error naming the first missing parameter, every unused entry, or the
/// first shape mismatch. Nothing is written unless every check passes.
pub fn apply_state_dict(parameters: &[(String, Var)], state: &HashMap<String, Tensor>) -> Result<()> {
    let mut staged = Vec::with_capacity(parameters.len());
    for (name, var) in parameters {
        let tensor = state
            .get(name)
            .ok_or_else(|| EvalError::Model(format!("state is missing parameter {}", name)))?;
        if tensor.dims() != var.as_tensor().dims() {
            return Err(EvalError::Model(format!(
                "shape mismatch for {}: expected {:?}, got {:?}",
                name,
                var.as_tensor().dims(),
                tensor.dims()
            )));
        }
        let tensor = tensor
            .to_device(var.as_tensor().device())?
            .to_dtype(var.as_tensor().dtype())?;
        staged.push((var, tensor));
    }

    if state.len() != parameters.len() {
        let mut extra: Vec<&str> = state
            .keys()
            .filter(|k| !parameters.iter().any(|(name, _)| name == *k))
            .map(String::as_str)
            .collect();
        extra.sort_unstable();
        return Err(EvalError::Model(format!(
            "state contains unused parameters: {}",
            extra.join(", ")
        )));
    }

    for (var, tensor) in staged {
        var.set(&tensor)?;
    }
    Ok(())
}

/// Initialize a classifier from the model state of a checkpoint
///
/// Only model weights are taken; epoch, best metric and optimizer state are
/// ignored. A missing file is a configuration error here, unlike resume.
pub fn load_init_weights<P: AsRef<Path>>(model: &mut dyn Classifier, path: P, device: &Device) -> Result<()> {
    let path = path.as_ref();
    let checkpoint = match CheckpointStore::load(path, device) {
        Err(EvalError::CheckpointNotFound(p)) => {
            return Err(EvalError::Configuration(format!(
                "init weights {} do not exist",
                p.display()
            )))
        }
        other => other?,
    };

    model.load_state_dict(&checkpoint.model_state)?;
    log::info!(
        "Initialized {} parameters from {:?} (arch {})",
        checkpoint.model_state.len(),
        path,
        checkpoint.arch
    );
    Ok(())
}
