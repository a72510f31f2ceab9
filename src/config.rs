//! Configuration for the denoising U-Net.
//!
//! Defaults match the reference MNIST diffusion setup: a 1000-step
//! schedule, 100-dimensional time embedding, 1×28×28 inputs.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Top-level network configuration.
///
/// All values are fixed at construction and immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UNetConfig {
    /// Number of discrete diffusion steps N; valid time-steps are [0, N).
    pub n_steps: usize,
    /// Dimension of the sinusoidal time embedding.
    pub time_embed_dim: usize,
    /// Input/output image channels.
    pub in_channels: usize,
    /// Input/output spatial size (square images).
    pub image_size: usize,
}

impl Default for UNetConfig {
    fn default() -> Self {
        Self {
            n_steps: 1000,
            time_embed_dim: 100,
            in_channels: 1,
            image_size: 28,
        }
    }
}

impl UNetConfig {
    /// Check the configuration before building the network.
    pub fn validate(&self) -> Result<()> {
        if self.n_steps == 0 {
            return Err(Error::Config("n_steps must be positive".into()));
        }
        if self.time_embed_dim == 0 {
            return Err(Error::Config("time_embed_dim must be positive".into()));
        }
        // The level wiring (channel counts and normalization shapes) is
        // fixed to the 1x28x28 contract.
        if self.in_channels != 1 || self.image_size != 28 {
            return Err(Error::Config(format!(
                "unsupported input geometry {}x{}x{}; the network is wired for 1x28x28",
                self.in_channels, self.image_size, self.image_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = UNetConfig::default();
        assert_eq!(cfg.n_steps, 1000);
        assert_eq!(cfg.time_embed_dim, 100);
        assert_eq!(cfg.in_channels, 1);
        assert_eq!(cfg.image_size, 28);
        cfg.validate().unwrap();
    }

    #[test]
    fn zero_steps_rejected() {
        let cfg = UNetConfig {
            n_steps: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn unsupported_geometry_rejected() {
        let cfg = UNetConfig {
            image_size: 32,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn serde_roundtrip() {
        let cfg = UNetConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: UNetConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.n_steps, cfg.n_steps);
        assert_eq!(back.time_embed_dim, cfg.time_embed_dim);
        assert_eq!(back.in_channels, cfg.in_channels);
        assert_eq!(back.image_size, cfg.image_size);
    }
}
