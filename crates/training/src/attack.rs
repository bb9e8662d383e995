//! L∞ projected gradient descent attack.
//!
//! Starting from the clean batch (optionally jittered uniformly inside the
//! ball), the attacker repeatedly moves along the sign of the input gradient
//! of the attack loss, then projects back into the `epsilon` ball around the
//! clean images and into the valid pixel domain.

use candle_core::{DType, Tensor};
use rand::{
    distributions::{Distribution, Uniform},
    rngs::StdRng,
    SeedableRng,
};

use crate::{objective::Objective, TrainingConfig, TrainingError};

/// Loss the attacker ascends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttackLoss {
    /// Cross entropy on the true label (`xent`).
    CrossEntropy,
    /// `-relu(correct - max_wrong + 50)` (`cw`).
    Margin,
}

impl AttackLoss {
    /// Unknown names fall back to cross entropy with a warning.
    pub fn from_name(name: &str) -> Self {
        match name {
            "xent" => Self::CrossEntropy,
            "cw" => Self::Margin,
            other => {
                log::warn!("unknown attack loss '{}', using xent", other);
                Self::CrossEntropy
            }
        }
    }
}

/// Configuration for the PGD attacker.
#[derive(Debug, Clone)]
pub struct AttackConfig {
    /// Radius of the L∞ ball around the clean images.
    pub epsilon: f64,
    /// Number of gradient steps.
    pub num_steps: usize,
    /// Size of each signed gradient step.
    pub step_size: f64,
    /// Start from a uniform sample inside the ball instead of the clean images.
    pub random_start: bool,
    pub loss: AttackLoss,
    /// Valid pixel range.
    pub domain: (f64, f64),
    /// Seed of the random-start stream.
    pub seed: u64,
}

impl AttackConfig {
    pub fn from_training(config: &TrainingConfig) -> Self {
        Self {
            epsilon: config.epsilon,
            num_steps: config.num_steps,
            step_size: config.step_size,
            random_start: config.random_start,
            loss: AttackLoss::from_name(&config.loss_func),
            domain: (0.0, 1.0),
            seed: config.np_random_seed,
        }
    }

    fn validate(&self) -> Result<(), TrainingError> {
        let (low, high) = self.domain;
        if !(self.epsilon.is_finite() && self.epsilon >= 0.0) {
            return Err(TrainingError::initialization("attack epsilon must be >= 0"));
        }
        if !(self.step_size.is_finite() && self.step_size >= 0.0) {
            return Err(TrainingError::initialization(
                "attack step size must be >= 0",
            ));
        }
        if !(low.is_finite() && high.is_finite() && low <= high) {
            return Err(TrainingError::initialization(format!(
                "attack domain ({}, {}) is not a valid interval",
                low, high
            )));
        }
        Ok(())
    }
}

/// Mixes the stream index into the seed of the random-start generator.
const STREAM_MIX: u64 = 0x9e37_79b9_7f4a_7c15;

pub struct LinfPgdAttack {
    config: AttackConfig,
    rng: StdRng,
}

impl LinfPgdAttack {
    pub fn new(config: AttackConfig) -> Result<Self, TrainingError> {
        config.validate()?;
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self { config, rng })
    }

    /// Restarts the random-start stream at `stream`, so the noise drawn for
    /// a given global step does not depend on how many calls preceded it.
    pub fn reseed(&mut self, stream: u64) {
        let seed = self.config.seed ^ stream.wrapping_add(1).wrapping_mul(STREAM_MIX);
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Returns adversarial images with the shape of `images`, each element
    /// within `epsilon` of the original and inside the domain.
    pub fn perturb<O>(
        &mut self,
        objective: &O,
        images: &Tensor,
        labels: &Tensor,
    ) -> Result<Tensor, TrainingError>
    where
        O: Objective + ?Sized,
    {
        let (low, high) = self.config.domain;
        let epsilon = self.config.epsilon;

        let start = if self.config.random_start {
            (images + self.uniform_noise(images)?)?
        } else {
            images.clone()
        };
        let mut x = start.clamp(low, high)?;

        let lower = images.affine(1.0, -epsilon)?;
        let upper = images.affine(1.0, epsilon)?;

        for _ in 0..self.config.num_steps {
            let grad = objective.input_gradient(&x, labels, self.config.loss)?;
            let step = sign(&grad)?.affine(self.config.step_size, 0.0)?;
            x = (x + step)?;
            x = x.maximum(&lower)?.minimum(&upper)?;
            x = x.clamp(low, high)?;
        }

        Ok(x)
    }

    fn uniform_noise(&mut self, like: &Tensor) -> Result<Tensor, TrainingError> {
        // anything wider than the domain is clipped away afterwards
        let (low, high) = self.config.domain;
        let radius = self.config.epsilon.min(high - low) as f32;
        let dist = Uniform::new_inclusive(-radius, radius);
        let values: Vec<f32> = (0..like.elem_count())
            .map(|_| dist.sample(&mut self.rng))
            .collect();
        Ok(Tensor::from_vec(values, like.dims(), like.device())?.to_dtype(like.dtype())?)
    }
}

/// Elementwise sign with `sign(0) = 0`.
fn sign(tensor: &Tensor) -> Result<Tensor, TrainingError> {
    let positive = tensor.gt(0f64)?.to_dtype(DType::F32)?;
    let negative = tensor.lt(0f64)?.to_dtype(DType::F32)?;
    Ok((positive - negative)?.to_dtype(tensor.dtype())?)
}
