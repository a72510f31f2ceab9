//! Error types for ddpm-unet.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// Input tensor shape does not match the network contract.
    #[error("shape: {0}")]
    Shape(String),

    /// Diffusion time-step index outside the configured schedule.
    #[error("timestep {t} out of range for {n_steps}-step schedule")]
    Timestep { t: u32, n_steps: usize },
}
