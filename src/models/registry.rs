/// Architecture name to factory mapping
use std::collections::BTreeMap;
use std::sync::Arc;

use candle_core::Device;

use super::{Classifier, ConvNet, LinearProbe, ModelSpec};
use crate::{EvalError, Result};

/// Builds a classifier for a spec on a device
pub type ModelFactory = Arc<dyn Fn(&ModelSpec, &Device) -> Result<Box<dyn Classifier>> + Send + Sync>;

/// Registry of available architectures
#[derive(Clone, Default)]
pub struct ModelRegistry {
    factories: BTreeMap<String, ModelFactory>,
}

impl ModelRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `convnet` and `linear`
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("convnet", |spec, device| {
            Ok(Box::new(ConvNet::new(spec, device)?) as Box<dyn Classifier>)
        });
        registry.register("linear", |spec, device| {
            Ok(Box::new(LinearProbe::new(spec, device)?) as Box<dyn Classifier>)
        });
        registry
    }

    /// Add or replace an architecture
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&ModelSpec, &Device) -> Result<Box<dyn Classifier>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names in sorted order
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Instantiate `name`
    ///
    /// # Returns
    /// The model in inference mode, or a configuration error listing the
    /// known architectures
    pub fn build(&self, name: &str, spec: &ModelSpec, device: &Device) -> Result<Box<dyn Classifier>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            EvalError::Configuration(format!(
                "unsupported architecture '{}' (available: {})",
                name,
                self.names().join(", ")
            ))
        })?;
        let mut model = factory(spec, device)?;
        model.set_training(false);
        log::info!(
            "Created model '{}' with {} parameters",
            name,
            model.num_parameters()?
        );
        Ok(model)
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelLayout;

    #[test]
    fn test_builtin_names() {
        let registry = ModelRegistry::with_builtin();
        assert_eq!(registry.names(), vec!["convnet", "linear"]);
        assert!(registry.contains("linear"));
    }

    #[test]
    fn test_unknown_arch_lists_available() {
        let registry = ModelRegistry::with_builtin();
        let spec = ModelSpec::new(10, 8, ChannelLayout::Nchw);
        let err = registry.build("inception_v3", &spec, &Device::Cpu).err().unwrap();
        assert!(matches!(err, EvalError::Configuration(_)));
        assert!(err.to_string().contains("convnet, linear"));
    }

    #[test]
    fn test_built_models_start_in_inference_mode() -> Result<()> {
        let registry = ModelRegistry::with_builtin();
        let spec = ModelSpec::new(3, 8, ChannelLayout::Nchw);
        let model = registry.build("convnet", &spec, &Device::Cpu)?;
        assert!(!model.is_training());
        Ok(())
    }

    #[test]
    fn test_custom_registration() -> Result<()> {
        let mut registry = ModelRegistry::new();
        registry.register("tiny", |spec, device| {
            Ok(Box::new(LinearProbe::new(spec, device)?) as Box<dyn Classifier>)
        });
        let model = registry.build("tiny", &ModelSpec::new(2, 2, ChannelLayout::Nchw), &Device::Cpu)?;
        assert_eq!(model.num_parameters()?, 2 * 12 + 2);
        Ok(())
    }
}
