/// Image preprocessing: decode, geometric transform, normalize, layout
///
/// Geometry always runs on the host in u8. The normalize and layout step runs
/// either on the host (`ExecutionTarget::Host`) or on the compute device
/// (`ExecutionTarget::Device`), in both cases computing `(x - mean) / std` in f32.
use candle_core::{DType, Device, Tensor};
use image::imageops::{self, FilterType};
use image::RgbImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{ChannelLayout, EvalConfig, ExecutionTarget};
use crate::utils::mix_seed;
use crate::{EvalError, Result};

/// ImageNet channel means, in 0..255 pixel units
pub const IMAGENET_MEAN: [f32; 3] = [0.485 * 255.0, 0.456 * 255.0, 0.406 * 255.0];

/// ImageNet channel standard deviations, in 0..255 pixel units
pub const IMAGENET_STD: [f32; 3] = [0.229 * 255.0, 0.224 * 255.0, 0.225 * 255.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Random-resized-crop and mirror
    Train,
    /// Resize shorter side, centre crop
    Eval,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub mode: Mode,
    /// Output side length
    pub crop_size: usize,
    /// Shorter-side target before the eval centre crop
    pub val_size: usize,
    pub layout: ChannelLayout,
    pub target: ExecutionTarget,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    /// Probability of a horizontal flip in train mode
    pub mirror_probability: f64,
    /// Area fraction range for random-resized-crop
    pub scale: (f64, f64),
    /// Aspect ratio range for random-resized-crop
    pub ratio: (f64, f64),
    /// Rejection-sampling attempts before the centre-crop fallback
    pub attempts: usize,
    /// Per-rank augmentation seed
    pub seed: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Eval,
            crop_size: 224,
            val_size: 256,
            layout: ChannelLayout::Nchw,
            target: ExecutionTarget::Host,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
            mirror_probability: 0.5,
            scale: (0.1, 1.0),
            ratio: (0.8, 1.25),
            attempts: 100,
            seed: 0,
        }
    }
}

impl PipelineConfig {
    /// Build a pipeline config for one rank
    pub fn from_eval_config(config: &EvalConfig, mode: Mode, rank: usize) -> Self {
        Self {
            mode,
            crop_size: config.crop_size,
            val_size: config.val_size,
            layout: config.layout(),
            target: config.target,
            seed: config.rank_seed(rank),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.crop_size == 0 || self.val_size < self.crop_size {
            return Err(EvalError::Configuration(format!(
                "invalid pipeline geometry: crop {} / resize {}",
                self.crop_size, self.val_size
            )));
        }
        let (lo, hi) = self.scale;
        if !(lo > 0.0 && lo <= hi && hi <= 1.0) {
            return Err(EvalError::Configuration(format!(
                "scale range must satisfy 0 < lo <= hi <= 1, got {:?}",
                self.scale
            )));
        }
        let (lo, hi) = self.ratio;
        if !(lo > 0.0 && lo <= hi) {
            return Err(EvalError::Configuration(format!(
                "ratio range must satisfy 0 < lo <= hi, got {:?}",
                self.ratio
            )));
        }
        if !(0.0..=1.0).contains(&self.mirror_probability) {
            return Err(EvalError::Configuration(
                "mirror_probability must be within [0, 1]".to_string(),
            ));
        }
        if self.std.iter().any(|&s| s <= 0.0) {
            return Err(EvalError::Configuration(
                "normalization std must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// A decoded, cropped `crop × crop × 3` image in HWC u8 order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedImage {
    pub pixels: Vec<u8>,
    pub size: usize,
}

/// A corrupt sample replaced by its nearest decodable neighbour
#[derive(Debug, Clone, PartialEq)]
pub struct DataQualityEvent {
    pub epoch: usize,
    /// Dataset position that failed to decode
    pub dataset_index: usize,
    /// Dataset position used in its place
    pub substitute_index: usize,
    pub reason: String,
}

/// Decode and transform samples into model-ready tensors
#[derive(Debug, Clone)]
pub struct PreprocessingPipeline {
    config: PipelineConfig,
}

impl PreprocessingPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.config.mode
    }

    /// Decode encoded bytes to RGB8
    pub fn decode(&self, bytes: &[u8]) -> Result<RgbImage> {
        let decoded = image::load_from_memory(bytes)
            .map_err(|e| EvalError::DataQuality(format!("corrupt image: {}", e)))?;
        let rgb = decoded.to_rgb8();
        if rgb.width() == 0 || rgb.height() == 0 {
            return Err(EvalError::DataQuality("corrupt image: zero-sized".to_string()));
        }
        Ok(rgb)
    }

    /// Decode and transform one sample
    ///
    /// # Arguments
    /// * `bytes` - Encoded image
    /// * `epoch` - Current epoch, part of the augmentation key
    /// * `dataset_index` - Dataset position, part of the augmentation key
    ///
    /// # Returns
    /// The cropped image, or a data-quality error when the bytes do not decode
    pub fn prepare(&self, bytes: &[u8], epoch: usize, dataset_index: usize) -> Result<PreparedImage> {
        let rgb = self.decode(bytes)?;
        let out = match self.config.mode {
            Mode::Eval => self.eval_transform(&rgb),
            Mode::Train => {
                let mut rng = self.sample_rng(epoch, dataset_index);
                self.train_transform(&rgb, &mut rng)
            }
        };
        Ok(PreparedImage {
            pixels: out.into_raw(),
            size: self.config.crop_size,
        })
    }

    fn sample_rng(&self, epoch: usize, dataset_index: usize) -> StdRng {
        let key = mix_seed(mix_seed(self.config.seed, epoch as u64), dataset_index as u64);
        StdRng::seed_from_u64(key)
    }

    /// Resize so the shorter side is `val_size`, then centre crop
    pub fn eval_transform(&self, img: &RgbImage) -> RgbImage {
        let (w, h) = img.dimensions();
        let target = self.config.val_size as u32;
        let (nw, nh) = if w <= h {
            (target, scale_side(h, target, w))
        } else {
            (scale_side(w, target, h), target)
        };
        let resized = imageops::resize(img, nw, nh, FilterType::Triangle);
        let crop = self.config.crop_size as u32;
        let x = (nw - crop) / 2;
        let y = (nh - crop) / 2;
        imageops::crop_imm(&resized, x, y, crop, crop).to_image()
    }

    /// Random-resized-crop, resize to `crop × crop`, random mirror
    pub fn train_transform<R: Rng>(&self, img: &RgbImage, rng: &mut R) -> RgbImage {
        let (x, y, cw, ch) = self.sample_crop_window(img.width(), img.height(), rng);
        let window = imageops::crop_imm(img, x, y, cw, ch).to_image();
        let crop = self.config.crop_size as u32;
        let resized = imageops::resize(&window, crop, crop, FilterType::Triangle);
        if rng.gen_bool(self.config.mirror_probability) {
            imageops::flip_horizontal(&resized)
        } else {
            resized
        }
    }

    /// Pick a crop window `(x, y, width, height)` inside a `w × h` image
    pub fn sample_crop_window<R: Rng>(&self, w: u32, h: u32, rng: &mut R) -> (u32, u32, u32, u32) {
        let area = (w as f64) * (h as f64);
        let (scale_lo, scale_hi) = self.config.scale;
        let (ratio_lo, ratio_hi) = self.config.ratio;
        let (log_lo, log_hi) = (ratio_lo.ln(), ratio_hi.ln());

        for _ in 0..self.config.attempts {
            let target_area = area * rng.gen_range(scale_lo..=scale_hi);
            let aspect = rng.gen_range(log_lo..=log_hi).exp();
            let cw = (target_area * aspect).sqrt().round() as u32;
            let ch = (target_area / aspect).sqrt().round() as u32;
            if cw > 0 && ch > 0 && cw <= w && ch <= h {
                let x = rng.gen_range(0..=w - cw);
                let y = rng.gen_range(0..=h - ch);
                return (x, y, cw, ch);
            }
        }

        // Fallback: whole image, aspect clamped into range
        let in_ratio = w as f64 / h as f64;
        let (cw, ch) = if in_ratio < ratio_lo {
            (w, ((w as f64 / ratio_lo).round() as u32).clamp(1, h))
        } else if in_ratio > ratio_hi {
            (((h as f64 * ratio_hi).round() as u32).clamp(1, w), h)
        } else {
            (w, h)
        };
        ((w - cw) / 2, (h - ch) / 2, cw, ch)
    }

    /// Assemble prepared images into a normalized f32 batch on `device`
    ///
    /// # Returns
    /// `[n, 3, crop, crop]` (NCHW) or `[n, crop, crop, 3]` (NHWC)
    pub fn to_tensor(&self, images: &[PreparedImage], device: &Device) -> Result<Tensor> {
        let n = images.len();
        let s = self.config.crop_size;
        if n == 0 {
            return Err(EvalError::Configuration("cannot assemble an empty batch".to_string()));
        }
        if let Some(bad) = images.iter().find(|img| img.size != s || img.pixels.len() != s * s * 3) {
            return Err(EvalError::Model(format!(
                "prepared image of side {} does not match crop size {}",
                bad.size, s
            )));
        }

        match self.config.target {
            ExecutionTarget::Host => self.normalize_on_host(images, device),
            ExecutionTarget::Device => self.normalize_on_device(images, device),
        }
    }

    fn normalize_on_host(&self, images: &[PreparedImage], device: &Device) -> Result<Tensor> {
        let n = images.len();
        let s = self.config.crop_size;
        let plane = s * s;
        let mean = self.config.mean;
        let std = self.config.std;
        let mut data = vec![0f32; n * plane * 3];

        for (i, img) in images.iter().enumerate() {
            let out = &mut data[i * plane * 3..(i + 1) * plane * 3];
            for (p, px) in img.pixels.chunks_exact(3).enumerate() {
                for c in 0..3 {
                    let v = (px[c] as f32 - mean[c]) / std[c];
                    match self.config.layout {
                        ChannelLayout::Nchw => out[c * plane + p] = v,
                        ChannelLayout::Nhwc => out[p * 3 + c] = v,
                    }
                }
            }
        }

        let tensor = match self.config.layout {
            ChannelLayout::Nchw => Tensor::from_vec(data, (n, 3, s, s), &Device::Cpu)?,
            ChannelLayout::Nhwc => Tensor::from_vec(data, (n, s, s, 3), &Device::Cpu)?,
        };
        Ok(tensor.to_device(device)?)
    }

    fn normalize_on_device(&self, images: &[PreparedImage], device: &Device) -> Result<Tensor> {
        let n = images.len();
        let s = self.config.crop_size;
        let mut raw = Vec::with_capacity(n * s * s * 3);
        for img in images {
            raw.extend_from_slice(&img.pixels);
        }

        let x = Tensor::from_vec(raw, (n, s, s, 3), device)?.to_dtype(DType::F32)?;
        let mean = Tensor::new(&self.config.mean, device)?.reshape((1, 1, 1, 3))?;
        let std = Tensor::new(&self.config.std, device)?.reshape((1, 1, 1, 3))?;
        let x = x.broadcast_sub(&mean)?.broadcast_div(&std)?;

        let x = match self.config.layout {
            ChannelLayout::Nhwc => x,
            ChannelLayout::Nchw => x.permute((0, 3, 1, 2))?.contiguous()?,
        };
        Ok(x)
    }
}

/// Scale `side` by `target / reference`, never below `target`
fn scale_side(side: u32, target: u32, reference: u32) -> u32 {
    let scaled = (side as f64 * target as f64 / reference as f64).round() as u32;
    scaled.max(target)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgb};
    use std::io::Cursor;

    pub(crate) fn encode_png(width: u32, height: u32, seed: u8) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([
                (x as u8).wrapping_mul(7).wrapping_add(seed),
                (y as u8).wrapping_mul(11),
                seed.wrapping_mul(3),
            ])
        });
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    fn pipeline(mode: Mode, target: ExecutionTarget, layout: ChannelLayout) -> PreprocessingPipeline {
        PreprocessingPipeline::new(PipelineConfig {
            mode,
            crop_size: 8,
            val_size: 10,
            target,
            layout,
            seed: 5,
            ..PipelineConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_corrupt_bytes_are_data_quality_errors() {
        let p = pipeline(Mode::Eval, ExecutionTarget::Host, ChannelLayout::Nchw);
        let err = p.prepare(b"definitely not an image", 0, 0).unwrap_err();
        assert!(matches!(err, EvalError::DataQuality(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_eval_transform_crops_to_square() {
        let p = pipeline(Mode::Eval, ExecutionTarget::Host, ChannelLayout::Nchw);
        let img = p.prepare(&encode_png(31, 17, 1), 0, 0).unwrap();
        assert_eq!(img.size, 8);
        assert_eq!(img.pixels.len(), 8 * 8 * 3);
    }

    #[test]
    fn test_eval_is_deterministic_across_epochs() {
        let p = pipeline(Mode::Eval, ExecutionTarget::Host, ChannelLayout::Nchw);
        let bytes = encode_png(20, 24, 9);
        assert_eq!(p.prepare(&bytes, 0, 3).unwrap(), p.prepare(&bytes, 7, 3).unwrap());
    }

    #[test]
    fn test_train_randomness_is_keyed_per_sample() {
        let p = pipeline(Mode::Train, ExecutionTarget::Host, ChannelLayout::Nchw);
        let bytes = encode_png(40, 32, 2);
        let a = p.prepare(&bytes, 1, 4).unwrap();
        let b = p.prepare(&bytes, 1, 4).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.pixels.len(), 8 * 8 * 3);
    }

    #[test]
    fn test_crop_window_stays_inside_image() {
        let p = pipeline(Mode::Train, ExecutionTarget::Host, ChannelLayout::Nchw);
        let mut rng = StdRng::seed_from_u64(1);
        for (w, h) in [(64, 48), (5, 300), (300, 5), (1, 1)] {
            for _ in 0..50 {
                let (x, y, cw, ch) = p.sample_crop_window(w, h, &mut rng);
                assert!(cw >= 1 && ch >= 1);
                assert!(x + cw <= w && y + ch <= h);
            }
        }
    }

    #[test]
    fn test_extreme_aspect_falls_back_to_centre_crop() {
        let p = pipeline(Mode::Train, ExecutionTarget::Host, ChannelLayout::Nchw);
        let mut rng = StdRng::seed_from_u64(3);
        // no sampled window fits, so every call lands on the clamped centre crop
        for _ in 0..5 {
            assert_eq!(p.sample_crop_window(5, 300, &mut rng), (0, 147, 5, 6));
            assert_eq!(p.sample_crop_window(300, 5, &mut rng), (147, 0, 6, 5));
        }
    }

    #[test]
    fn test_fallback_ratio_is_clamped_into_range() {
        let p = pipeline(Mode::Train, ExecutionTarget::Host, ChannelLayout::Nchw);
        let (lo, hi) = p.config().ratio;
        let mut rng = StdRng::seed_from_u64(4);
        for (w, h) in [(4, 200), (200, 4), (5, 300), (300, 5)] {
            let (x, y, cw, ch) = p.sample_crop_window(w, h, &mut rng);
            let ratio = cw as f64 / ch as f64;
            assert!(ratio >= lo && ratio <= hi, "{}x{} gave {}x{}", w, h, cw, ch);
            assert_eq!((x, y), ((w - cw) / 2, (h - ch) / 2));
        }
    }

    #[test]
    fn test_host_and_device_targets_agree() -> Result<()> {
        let bytes = [encode_png(12, 12, 3), encode_png(16, 10, 4)];
        for layout in [ChannelLayout::Nchw, ChannelLayout::Nhwc] {
            let host = pipeline(Mode::Eval, ExecutionTarget::Host, layout);
            let dev = pipeline(Mode::Eval, ExecutionTarget::Device, layout);
            let prepared: Vec<PreparedImage> = bytes
                .iter()
                .enumerate()
                .map(|(i, b)| host.prepare(b, 0, i))
                .collect::<Result<_>>()?;

            let a = host.to_tensor(&prepared, &Device::Cpu)?;
            let b = dev.to_tensor(&prepared, &Device::Cpu)?;
            assert_eq!(a.dims(), b.dims());
            let diff = (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
            assert!(diff < 1e-5, "layout {:?} diff {}", layout, diff);
        }
        Ok(())
    }

    #[test]
    fn test_layout_shapes() -> Result<()> {
        let prepared = vec![PreparedImage { pixels: vec![128; 8 * 8 * 3], size: 8 }; 2];
        let nchw = pipeline(Mode::Eval, ExecutionTarget::Host, ChannelLayout::Nchw)
            .to_tensor(&prepared, &Device::Cpu)?;
        let nhwc = pipeline(Mode::Eval, ExecutionTarget::Host, ChannelLayout::Nhwc)
            .to_tensor(&prepared, &Device::Cpu)?;
        assert_eq!(nchw.dims(), &[2, 3, 8, 8]);
        assert_eq!(nhwc.dims(), &[2, 8, 8, 3]);
        Ok(())
    }

    #[test]
    fn test_normalization_values() -> Result<()> {
        let px = vec![255u8; 8 * 8 * 3];
        let t = pipeline(Mode::Eval, ExecutionTarget::Host, ChannelLayout::Nchw)
            .to_tensor(&[PreparedImage { pixels: px, size: 8 }], &Device::Cpu)?;
        let v = t.flatten_all()?.to_vec1::<f32>()?;
        let expected = (255.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0];
        assert!((v[0] - expected).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_invalid_geometry_rejected() {
        let result = PreprocessingPipeline::new(PipelineConfig {
            crop_size: 300,
            val_size: 256,
            ..PipelineConfig::default()
        });
        assert!(matches!(result, Err(EvalError::Configuration(_))));
    }
}
