//! Convolution, normalization, and resampling blocks for the U-Net.
//!
//! - [`FeatureMapNorm`] — affine layer-normalization over a full
//!   (C, H, W) feature map; candle's `LayerNorm` covers only the last
//!   dimension, so this is hand-rolled
//! - [`ConvBlock`] — norm → conv → act → conv → act at fixed resolution
//! - [`TimeProjection`] — maps the time embedding to a stage's channel
//!   count for broadcast addition onto the feature map
//! - [`Downsample`] / [`Upsample`] — ×2 spatial resampling, channel count
//!   preserved; the deepest level carries an extra conv to bridge the
//!   odd 7→3 transition

use candle_core::{Module, Tensor};
use candle_nn::{
    Activation, Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig, Init, Linear,
    VarBuilder,
};

use crate::Result;

// ---------------------------------------------------------------------------
// Full feature-map layer normalization
// ---------------------------------------------------------------------------

/// LayerNorm over the (C, H, W) axes with a learned per-element affine.
#[derive(Debug, Clone)]
pub struct FeatureMapNorm {
    weight: Tensor, // [C, H, W]
    bias: Tensor,   // [C, H, W]
    eps: f64,
}

impl FeatureMapNorm {
    pub fn new(vb: VarBuilder, shape: (usize, usize, usize), eps: f64) -> Result<Self> {
        let weight = vb.get_with_hints(shape, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(shape, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }

    /// Normalize a `[B, C, H, W]` tensor over its last three axes.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim((1, 2, 3))?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim((1, 2, 3))?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        let out = normed
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)?;
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Resolution block: norm → conv → act → conv → act
// ---------------------------------------------------------------------------

/// Normalize-convolve-activate unit operating at a fixed resolution.
///
/// Optional full-map normalization, then conv(C_in→C_out) and
/// conv(C_out→C_out), both 3×3 stride 1 padding 1, each followed by the
/// activation (SiLU unless overridden). Spatial size is preserved.
#[derive(Debug, Clone)]
pub struct ConvBlock {
    norm: Option<FeatureMapNorm>,
    conv1: Conv2d,
    conv2: Conv2d,
    act: Activation,
}

impl ConvBlock {
    /// `shape` is the (C_in, H, W) of the incoming feature map; it sizes
    /// the normalization parameters.
    pub fn new(
        vb: VarBuilder,
        shape: (usize, usize, usize),
        out_channels: usize,
        normalize: bool,
    ) -> Result<Self> {
        Self::with_activation(vb, shape, out_channels, normalize, Activation::Silu)
    }

    pub fn with_activation(
        vb: VarBuilder,
        shape: (usize, usize, usize),
        out_channels: usize,
        normalize: bool,
        act: Activation,
    ) -> Result<Self> {
        let (in_channels, _h, _w) = shape;
        let norm = if normalize {
            Some(FeatureMapNorm::new(vb.pp("ln"), shape, 1e-5)?)
        } else {
            None
        };
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv1 = candle_nn::conv2d(in_channels, out_channels, 3, cfg, vb.pp("conv1"))?;
        let conv2 = candle_nn::conv2d(out_channels, out_channels, 3, cfg, vb.pp("conv2"))?;
        Ok(Self {
            norm,
            conv1,
            conv2,
            act,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = match &self.norm {
            Some(norm) => norm.forward(x)?,
            None => x.clone(),
        };
        let x = self.conv1.forward(&x)?.apply(&self.act)?;
        self.conv2.forward(&x)?.apply(&self.act).map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// Time projection: linear → SiLU → linear
// ---------------------------------------------------------------------------

/// Feed-forward transform mapping the time embedding to a stage's channel
/// count: linear(D→C) → SiLU → linear(C→C).
#[derive(Debug, Clone)]
pub struct TimeProjection {
    linear1: Linear,
    linear2: Linear,
}

impl TimeProjection {
    pub fn new(vb: VarBuilder, embed_dim: usize, channels: usize) -> Result<Self> {
        let linear1 = candle_nn::linear(embed_dim, channels, vb.pp("linear1"))?;
        let linear2 = candle_nn::linear(channels, channels, vb.pp("linear2"))?;
        Ok(Self { linear1, linear2 })
    }

    /// `temb`: `[B, D]` → `[B, C, 1, 1]`, ready for broadcast addition
    /// onto a `[B, C, H, W]` feature map.
    pub fn forward(&self, temb: &Tensor) -> Result<Tensor> {
        let (b, _d) = temb.dims2()?;
        let out = temb.apply(&self.linear1)?.silu()?.apply(&self.linear2)?;
        let c = out.dim(1)?;
        Ok(out.reshape((b, c, 1, 1))?)
    }
}

// ---------------------------------------------------------------------------
// Resampling transforms
// ---------------------------------------------------------------------------

/// Halve spatial resolution with a strided 4×4 conv, channels preserved.
#[derive(Debug, Clone)]
pub struct Downsample {
    pre: Option<Conv2d>,
    conv: Conv2d,
}

impl Downsample {
    pub fn new(vb: VarBuilder, channels: usize) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let conv = candle_nn::conv2d(channels, channels, 4, cfg, vb.pp("conv"))?;
        Ok(Self { pre: None, conv })
    }

    /// Variant with an extra 2×2 stride-1 conv + SiLU in front, bridging
    /// the odd 7→3 transition (7→6→3).
    pub fn new_deep(vb: VarBuilder, channels: usize) -> Result<Self> {
        let pre = candle_nn::conv2d(channels, channels, 2, Default::default(), vb.pp("pre"))?;
        let cfg = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let conv = candle_nn::conv2d(channels, channels, 4, cfg, vb.pp("conv"))?;
        Ok(Self {
            pre: Some(pre),
            conv,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = match &self.pre {
            Some(pre) => pre.forward(x)?.silu()?,
            None => x.clone(),
        };
        self.conv.forward(&x).map_err(Into::into)
    }
}

/// Double spatial resolution with a transposed 4×4 conv, channels
/// preserved.
#[derive(Debug, Clone)]
pub struct Upsample {
    conv: ConvTranspose2d,
    post: Option<ConvTranspose2d>,
}

impl Upsample {
    pub fn new(vb: VarBuilder, channels: usize) -> Result<Self> {
        let cfg = ConvTranspose2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let conv = candle_nn::conv_transpose2d(channels, channels, 4, cfg, vb.pp("conv"))?;
        Ok(Self { conv, post: None })
    }

    /// Variant with SiLU + an extra 2×2 stride-1 transposed conv after,
    /// mirroring [`Downsample::new_deep`] (3→6→7).
    pub fn new_deep(vb: VarBuilder, channels: usize) -> Result<Self> {
        let cfg = ConvTranspose2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let conv = candle_nn::conv_transpose2d(channels, channels, 4, cfg, vb.pp("conv"))?;
        let post = candle_nn::conv_transpose2d(
            channels,
            channels,
            2,
            Default::default(),
            vb.pp("post"),
        )?;
        Ok(Self {
            conv,
            post: Some(post),
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.conv.forward(x)?;
        match &self.post {
            Some(post) => post.forward(&x.silu()?).map_err(Into::into),
            None => Ok(x),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    #[test]
    fn feature_map_norm_shape() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let norm = FeatureMapNorm::new(vb, (10, 8, 8), 1e-5).unwrap();
        let x = Tensor::randn(0.0_f32, 1.0, (2, 10, 8, 8), &device).unwrap();
        let out = norm.forward(&x).unwrap();
        assert_eq!(out.dims(), &[2, 10, 8, 8]);
    }

    #[test]
    fn feature_map_norm_standardizes() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let norm = FeatureMapNorm::new(vb, (4, 6, 6), 1e-5).unwrap();
        let x = Tensor::randn(3.0_f32, 2.0, (1, 4, 6, 6), &device).unwrap();
        let out = norm.forward(&x).unwrap();
        // Fresh weight = 1, bias = 0: output mean ≈ 0, variance ≈ 1.
        let mean: f32 = out.mean_all().unwrap().to_scalar().unwrap();
        let var: f32 = out.sqr().unwrap().mean_all().unwrap().to_scalar().unwrap();
        assert!(mean.abs() < 1e-5, "mean = {mean}");
        assert!((var - 1.0).abs() < 1e-3, "var = {var}");
    }

    #[test]
    fn conv_block_changes_channels() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let block = ConvBlock::new(vb, (1, 28, 28), 10, true).unwrap();
        let x = Tensor::randn(0.0_f32, 1.0, (2, 1, 28, 28), &device).unwrap();
        let out = block.forward(&x).unwrap();
        assert_eq!(out.dims(), &[2, 10, 28, 28]);
    }

    #[test]
    fn conv_block_without_norm() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let block = ConvBlock::new(vb, (10, 28, 28), 10, false).unwrap();
        let x = Tensor::randn(0.0_f32, 1.0, (1, 10, 28, 28), &device).unwrap();
        let out = block.forward(&x).unwrap();
        assert_eq!(out.dims(), &[1, 10, 28, 28]);
    }

    #[test]
    fn conv_block_custom_activation() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let block = ConvBlock::with_activation(vb, (4, 8, 8), 4, true, Activation::Relu).unwrap();
        let x = Tensor::randn(0.0_f32, 1.0, (1, 4, 8, 8), &device).unwrap();
        let out = block.forward(&x).unwrap();
        assert_eq!(out.dims(), &[1, 4, 8, 8]);
        // ReLU output is non-negative.
        let min: f32 = out.min_all().unwrap().to_scalar().unwrap();
        assert!(min >= 0.0);
    }

    #[test]
    fn time_projection_shape() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let te = TimeProjection::new(vb, 100, 40).unwrap();
        let temb = Tensor::randn(0.0_f32, 1.0, (3, 100), &device).unwrap();
        let out = te.forward(&temb).unwrap();
        assert_eq!(out.dims(), &[3, 40, 1, 1]);
    }

    #[test]
    fn downsample_halves_spatial() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let down = Downsample::new(vb, 10).unwrap();
        let x = Tensor::randn(0.0_f32, 1.0, (1, 10, 28, 28), &device).unwrap();
        let out = down.forward(&x).unwrap();
        assert_eq!(out.dims(), &[1, 10, 14, 14]);
    }

    #[test]
    fn deep_downsample_7_to_3() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let down = Downsample::new_deep(vb, 40).unwrap();
        let x = Tensor::randn(0.0_f32, 1.0, (1, 40, 7, 7), &device).unwrap();
        let out = down.forward(&x).unwrap();
        assert_eq!(out.dims(), &[1, 40, 3, 3]);
    }

    #[test]
    fn upsample_doubles_spatial() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let up = Upsample::new(vb, 20).unwrap();
        let x = Tensor::randn(0.0_f32, 1.0, (1, 20, 7, 7), &device).unwrap();
        let out = up.forward(&x).unwrap();
        assert_eq!(out.dims(), &[1, 20, 14, 14]);
    }

    #[test]
    fn deep_upsample_3_to_7() {
        let device = Device::Cpu;
        let (_vm, vb) = make_vb(&device);
        let up = Upsample::new_deep(vb, 40).unwrap();
        let x = Tensor::randn(0.0_f32, 1.0, (1, 40, 3, 3), &device).unwrap();
        let out = up.forward(&x).unwrap();
        assert_eq!(out.dims(), &[1, 40, 7, 7]);
    }
}
