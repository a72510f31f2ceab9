//! Denoising U-Net for DDPM image diffusion in pure Rust.
//!
//! A candle-based implementation of the noise-prediction network used
//! inside a denoising diffusion probabilistic model for 28×28 grayscale
//! images. Given a noisy image batch and a batch of diffusion time-step
//! indices, the network predicts the noise component at that step.
//!
//! ## Architecture
//!
//! ```text
//! x [B,1,28,28] → enc1 (1→10) ─ down ─ enc2 (10→20) ─ down ─ enc3 (20→40) ─ down ─ mid (40→40)
//!                  │ skip               │ skip                │ skip                  │
//! out [B,1,28,28] ← conv ← dec3 (20→10) ← up ← dec2 (40→10) ← up ← dec1 (80→20) ← up ─┘
//! ```
//!
//! Every stage additively injects a learned projection of a fixed
//! sinusoidal time embedding before its convolution stack; decoder stages
//! concatenate the symmetric encoder output channel-wise.
//!
//! The diffusion schedule, sampler, training loop, and persistence are
//! external collaborators: parameters live in the caller's
//! [`candle_nn::VarBuilder`], and a forward pass is a pure function of
//! (parameters, input, time-step).
//!
//! ## Modules
//!
//! - [`config`] — network hyperparameters
//! - [`model`] — embedding table, building blocks, the U-Net itself

pub mod config;
pub mod model;

mod error;

pub use config::UNetConfig;
pub use error::{Error, Result};
pub use model::unet::UNet;
