//! Multi-resolution noise predictor.
//!
//! A 3-level encoder, a bottleneck, and a 3-level decoder with skip
//! concatenation. Every stage receives the projected time embedding as a
//! broadcast addition before its convolution stack.
//!
//! ```text
//! x [B,1,28,28] ─ enc1 (1→10, 28²) ─ down1 ─ enc2 (10→20, 14²) ─ down2 ─ enc3 (20→40, 7²) ─ down3 ─┐
//!                    │ skip                     │ skip                      │ skip                  │
//!                    ▼                          ▼                          ▼                        ▼
//! out [B,1,28,28] ◄─ conv ◄─ dec3 (20→10) ◄─ up3 ◄─ dec2 (40→10) ◄─ up2 ◄─ dec1 (80→20) ◄─ up1 ◄─ mid (40→40, 3²)
//! ```
//!
//! Each skip concatenation doubles the channel count exactly: 40+40 = 80
//! at 7², 20+20 = 40 at 14², 10+10 = 20 at 28². down3/up1 carry an extra
//! conv to bridge the odd 7→3 spatial transition.

use candle_core::{Module, Tensor};
use candle_nn::{Conv2dConfig, VarBuilder};

use crate::config::UNetConfig;
use crate::model::blocks::{ConvBlock, Downsample, TimeProjection, Upsample};
use crate::model::embedding::TimeEmbedding;
use crate::{Error, Result};

/// Channel plan for one resolution stage: the stage's input channel count
/// followed by the output of each of its three blocks.
#[derive(Debug, Clone, Copy)]
struct LevelSpec {
    spatial: usize,
    channels: [usize; 4],
    norm_last: bool,
}

const ENCODER_SPECS: [LevelSpec; 3] = [
    LevelSpec { spatial: 28, channels: [1, 10, 10, 10], norm_last: true },
    LevelSpec { spatial: 14, channels: [10, 20, 20, 20], norm_last: true },
    LevelSpec { spatial: 7, channels: [20, 40, 40, 40], norm_last: true },
];

const BOTTLENECK_SPEC: LevelSpec = LevelSpec {
    spatial: 3,
    channels: [40, 20, 20, 40],
    norm_last: true,
};

// Decoder inputs are the concatenation of the symmetric encoder output
// with the upsampled lower stage, so channels[0] is double the matching
// encoder's channels[3]. The final block of the last stage skips
// normalization.
const DECODER_SPECS: [LevelSpec; 3] = [
    LevelSpec { spatial: 7, channels: [80, 40, 20, 20], norm_last: true },
    LevelSpec { spatial: 14, channels: [40, 20, 10, 10], norm_last: true },
    LevelSpec { spatial: 28, channels: [20, 10, 10, 10], norm_last: false },
];

/// One resolution stage: a time projection plus three [`ConvBlock`]s at a
/// fixed spatial size.
#[derive(Debug, Clone)]
struct ResolutionLevel {
    te: TimeProjection,
    blocks: Vec<ConvBlock>,
}

impl ResolutionLevel {
    fn new(vb: VarBuilder, embed_dim: usize, spec: &LevelSpec) -> Result<Self> {
        let te = TimeProjection::new(vb.pp("te"), embed_dim, spec.channels[0])?;
        let mut blocks = Vec::with_capacity(3);
        for i in 0..3 {
            let normalize = spec.norm_last || i < 2;
            blocks.push(ConvBlock::new(
                vb.pp(format!("block{}", i + 1)),
                (spec.channels[i], spec.spatial, spec.spatial),
                spec.channels[i + 1],
                normalize,
            )?);
        }
        Ok(Self { te, blocks })
    }

    /// Inject the projected time embedding, then run the block stack.
    fn forward(&self, x: &Tensor, temb: &Tensor) -> Result<Tensor> {
        let mut x = x.broadcast_add(&self.te.forward(temb)?)?;
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        Ok(x)
    }
}

/// The denoising U-Net.
///
/// Parameters are created through the caller's [`VarBuilder`], so an
/// external training loop or checkpoint loader owns them; the fixed
/// embedding table is not registered there. A forward pass has no mutable
/// state: identical parameters and inputs give identical outputs.
#[derive(Debug, Clone)]
pub struct UNet {
    time_emb: TimeEmbedding,
    encoders: Vec<ResolutionLevel>,
    downs: Vec<Downsample>,
    mid: ResolutionLevel,
    ups: Vec<Upsample>,
    decoders: Vec<ResolutionLevel>,
    conv_out: candle_nn::Conv2d,
    config: UNetConfig,
}

impl UNet {
    pub fn new(config: &UNetConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        tracing::debug!(
            n_steps = config.n_steps,
            time_embed_dim = config.time_embed_dim,
            "building denoising U-Net"
        );

        let d = config.time_embed_dim;
        let time_emb = TimeEmbedding::new(config.n_steps, d, vb.device())?;

        let mut encoders = Vec::with_capacity(ENCODER_SPECS.len());
        for (i, spec) in ENCODER_SPECS.iter().enumerate() {
            encoders.push(ResolutionLevel::new(vb.pp(format!("enc{}", i + 1)), d, spec)?);
        }
        let downs = vec![
            Downsample::new(vb.pp("down1"), ENCODER_SPECS[0].channels[3])?,
            Downsample::new(vb.pp("down2"), ENCODER_SPECS[1].channels[3])?,
            Downsample::new_deep(vb.pp("down3"), ENCODER_SPECS[2].channels[3])?,
        ];

        let mid = ResolutionLevel::new(vb.pp("mid"), d, &BOTTLENECK_SPEC)?;

        let ups = vec![
            Upsample::new_deep(vb.pp("up1"), BOTTLENECK_SPEC.channels[3])?,
            Upsample::new(vb.pp("up2"), DECODER_SPECS[0].channels[3])?,
            Upsample::new(vb.pp("up3"), DECODER_SPECS[1].channels[3])?,
        ];
        let mut decoders = Vec::with_capacity(DECODER_SPECS.len());
        for (i, spec) in DECODER_SPECS.iter().enumerate() {
            decoders.push(ResolutionLevel::new(vb.pp(format!("dec{}", i + 1)), d, spec)?);
        }

        let cfg3x3 = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv_out = candle_nn::conv2d(
            DECODER_SPECS[2].channels[3],
            config.in_channels,
            3,
            cfg3x3,
            vb.pp("conv_out"),
        )?;

        Ok(Self {
            time_emb,
            encoders,
            downs,
            mid,
            ups,
            decoders,
            conv_out,
            config: config.clone(),
        })
    }

    /// Predict the noise component of `x` at time-steps `t`.
    ///
    /// - `x`: `[B, 1, 28, 28]` noisy image batch
    /// - `t`: `[B]` integer time-step batch, values in `[0, n_steps)`
    ///
    /// Returns a tensor of the same shape as `x`.
    pub fn forward(&self, x: &Tensor, t: &Tensor) -> Result<Tensor> {
        self.check_input(x, t)?;
        let temb = self.time_emb.forward(t)?;

        let out1 = self.encoders[0].forward(x, &temb)?; // [B, 10, 28, 28]
        let down1 = self.downs[0].forward(&out1)?;
        let out2 = self.encoders[1].forward(&down1, &temb)?; // [B, 20, 14, 14]
        let down2 = self.downs[1].forward(&out2)?;
        let out3 = self.encoders[2].forward(&down2, &temb)?; // [B, 40, 7, 7]

        let mid = self.mid.forward(&self.downs[2].forward(&out3)?, &temb)?; // [B, 40, 3, 3]

        let x = Tensor::cat(&[&out3, &self.ups[0].forward(&mid)?], 1)?; // [B, 80, 7, 7]
        let x = self.decoders[0].forward(&x, &temb)?; // [B, 20, 7, 7]
        let x = Tensor::cat(&[&out2, &self.ups[1].forward(&x)?], 1)?; // [B, 40, 14, 14]
        let x = self.decoders[1].forward(&x, &temb)?; // [B, 10, 14, 14]
        let x = Tensor::cat(&[&out1, &self.ups[2].forward(&x)?], 1)?; // [B, 20, 28, 28]
        let x = self.decoders[2].forward(&x, &temb)?; // [B, 10, 28, 28]

        self.conv_out.forward(&x).map_err(Into::into)
    }

    fn check_input(&self, x: &Tensor, t: &Tensor) -> Result<()> {
        let (b, c, h, w) = x.dims4().map_err(|_| {
            Error::Shape(format!(
                "expected a [B, C, H, W] image batch, got {:?}",
                x.shape()
            ))
        })?;
        let cfg = &self.config;
        if c != cfg.in_channels || h != cfg.image_size || w != cfg.image_size {
            return Err(Error::Shape(format!(
                "expected [B, {}, {}, {}] input, got [{b}, {c}, {h}, {w}]",
                cfg.in_channels, cfg.image_size, cfg.image_size
            )));
        }
        let tb = t.dims1().map_err(|_| {
            Error::Shape(format!(
                "expected a [B] time-step batch, got {:?}",
                t.shape()
            ))
        })?;
        if tb != b {
            return Err(Error::Shape(format!(
                "image batch ({b}) and time-step batch ({tb}) differ"
            )));
        }
        Ok(())
    }
}
