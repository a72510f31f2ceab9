//! Sinusoidal time-step embedding for diffusion conditioning.
//!
//! A fixed (non-learned) table maps each discrete time-step to a
//! d-dimensional vector with interleaved sine/cosine columns:
//!
//! ```text
//! emb[t, j] = sin(t · ω_j)   for even j
//! emb[t, j] = cos(t · ω_j)   for odd j      ω_j = 1 / 10000^(2j/d)
//! ```
//!
//! The table is computed once at construction on the target device and
//! shared by reference across forward calls. It is never registered as a
//! trainable variable.

use candle_core::{DType, Device, Tensor};

use crate::{Error, Result};

/// Build the (n_steps, dim) sinusoidal embedding table.
///
/// The frequency exponent is exactly 2j/d, matching the positional
/// encoding of "Attention Is All You Need". Deterministic: no random
/// state is involved.
pub fn sinusoidal_embedding(n_steps: usize, dim: usize, device: &Device) -> Result<Tensor> {
    let mut data = Vec::with_capacity(n_steps * dim);
    for t in 0..n_steps {
        for j in 0..dim {
            let omega = 1.0 / 10000f64.powf(2.0 * j as f64 / dim as f64);
            let arg = t as f64 * omega;
            let v = if j % 2 == 0 { arg.sin() } else { arg.cos() };
            data.push(v as f32);
        }
    }
    Ok(Tensor::from_vec(data, (n_steps, dim), device)?)
}

/// Frozen lookup table from time-step index to embedding vector.
#[derive(Debug, Clone)]
pub struct TimeEmbedding {
    table: Tensor,
    n_steps: usize,
}

impl TimeEmbedding {
    pub fn new(n_steps: usize, dim: usize, device: &Device) -> Result<Self> {
        let table = sinusoidal_embedding(n_steps, dim, device)?;
        Ok(Self { table, n_steps })
    }

    /// Look up embeddings for a batch of time-steps.
    ///
    /// `t`: integer tensor of shape `[B]` with values in `[0, n_steps)`.
    /// Returns `[B, dim]`. An index at or beyond `n_steps` is an error,
    /// never a silent wrap.
    pub fn forward(&self, t: &Tensor) -> Result<Tensor> {
        let t = t.to_dtype(DType::U32)?;
        for &idx in t.to_vec1::<u32>()?.iter() {
            if idx as usize >= self.n_steps {
                return Err(Error::Timestep {
                    t: idx,
                    n_steps: self.n_steps,
                });
            }
        }
        Ok(self.table.index_select(&t, 0)?)
    }
}
