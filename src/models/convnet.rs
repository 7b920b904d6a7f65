/// Small built-in classifiers
///
/// Both accept NCHW or NHWC batches (per `ModelSpec::layout`) and convert to
/// NCHW internally, so saved weights do not depend on the input layout.
use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Linear, VarBuilder, VarMap};

use super::{sorted_vars, Classifier, ModelSpec};
use crate::config::ChannelLayout;
use crate::{EvalError, Result};

fn to_nchw(images: &Tensor, layout: ChannelLayout) -> candle_core::Result<Tensor> {
    match layout {
        ChannelLayout::Nchw => Ok(images.clone()),
        ChannelLayout::Nhwc => images.permute((0, 3, 1, 2))?.contiguous(),
    }
}

fn check_spec(spec: &ModelSpec) -> Result<()> {
    if spec.num_classes == 0 || spec.image_size == 0 || spec.in_channels == 0 {
        return Err(EvalError::Configuration(format!(
            "invalid model spec: {:?}",
            spec
        )));
    }
    Ok(())
}

/// Two strided conv/relu stages, max-pool, global average pool, linear head
pub struct ConvNet {
    conv1: Conv2d,
    conv2: Conv2d,
    head: Linear,
    dropout: f32,
    layout: ChannelLayout,
    training: bool,
    varmap: VarMap,
}

impl ConvNet {
    pub const WIDTHS: [usize; 2] = [16, 32];

    /// Build a freshly initialized network on `device`
    pub fn new(spec: &ModelSpec, device: &Device) -> Result<Self> {
        check_spec(spec)?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let cfg = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };

        let conv1 = conv2d(spec.in_channels, Self::WIDTHS[0], 3, cfg, vb.pp("conv1"))?;
        let conv2 = conv2d(Self::WIDTHS[0], Self::WIDTHS[1], 3, cfg, vb.pp("conv2"))?;
        let head = linear(Self::WIDTHS[1], spec.num_classes, vb.pp("head"))?;

        Ok(Self {
            conv1,
            conv2,
            head,
            dropout: 0.2,
            layout: spec.layout,
            training: false,
            varmap,
        })
    }
}

impl Classifier for ConvNet {
    fn forward(&self, images: &Tensor) -> candle_core::Result<Tensor> {
        let x = to_nchw(images, self.layout)?;
        let x = self.conv1.forward(&x)?.relu()?;
        let x = self.conv2.forward(&x)?.relu()?;

        let (_, _, h, w) = x.dims4()?;
        let x = if h >= 2 && w >= 2 { x.max_pool2d(2)? } else { x };

        // global average pool: [b, c, h, w] -> [b, c]
        let x = x.mean(3)?.mean(2)?;
        let x = if self.training {
            candle_nn::ops::dropout(&x, self.dropout)?
        } else {
            x
        };
        self.head.forward(&x)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn parameters(&self) -> Result<Vec<(String, Var)>> {
        sorted_vars(&self.varmap)
    }
}

/// Flatten + single linear layer
pub struct LinearProbe {
    head: Linear,
    layout: ChannelLayout,
    training: bool,
    varmap: VarMap,
}

impl LinearProbe {
    pub fn new(spec: &ModelSpec, device: &Device) -> Result<Self> {
        check_spec(spec)?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let in_dim = spec.in_channels * spec.image_size * spec.image_size;
        let head = linear(in_dim, spec.num_classes, vb.pp("head"))?;
        Ok(Self {
            head,
            layout: spec.layout,
            training: false,
            varmap,
        })
    }
}

impl Classifier for LinearProbe {
    fn forward(&self, images: &Tensor) -> candle_core::Result<Tensor> {
        let x = to_nchw(images, self.layout)?.flatten_from(1)?;
        self.head.forward(&x)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn parameters(&self) -> Result<Vec<(String, Var)>> {
        sorted_vars(&self.varmap)
    }
}
