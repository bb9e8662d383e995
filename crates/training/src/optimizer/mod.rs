use std::collections::HashMap;

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::TrainingError;

#[derive(Debug, Clone, Copy)]
pub struct MomentumConfig {
    pub learning_rate: f64,
    pub momentum: f64,
}

/// Heavy-ball momentum SGD: `v = momentum * v + g`, `p = p - lr * v`.
#[derive(Debug)]
pub struct MomentumOptimizer {
    config: MomentumConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    accumulator: Tensor,
}

impl MomentumOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: MomentumConfig,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let accumulator = tensor.zeros_like()?;
            params.push(ParameterSlot {
                name,
                param: var,
                accumulator,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    /// Number of updates applied so far, including restored ones.
    pub fn steps(&self) -> usize {
        self.step
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<(), TrainingError> {
        let MomentumConfig {
            learning_rate,
            momentum,
        } = self.config;

        for slot in &mut self.params {
            let Some(grad) = grads.get(slot.param.as_tensor()) else {
                continue;
            };
            let grad = grad.to_dtype(slot.accumulator.dtype())?;
            let accumulator = slot.accumulator.affine(momentum, 0.0)?.add(&grad)?;
            let update = accumulator.affine(learning_rate, 0.0)?;
            let next = slot.param.as_tensor().sub(&update)?;
            slot.param.set(&next)?;
            slot.accumulator = accumulator;
        }

        self.step += 1;
        Ok(())
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let shape = slot.param.as_tensor().dims().to_vec();
            let accumulator = slot
                .accumulator
                .to_dtype(DType::F32)?
                .flatten_all()?
                .to_vec1::<f32>()?;
            parameters.push(ParameterState {
                name: slot.name.clone(),
                shape,
                accumulator,
            });
        }

        Ok(OptimizerState {
            step: self.step,
            momentum: self.config.momentum,
            parameters,
        })
    }

    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        for slot in &mut self.params {
            let saved = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::restore(format!(
                    "optimizer state missing parameter '{}'",
                    slot.name
                ))
            })?;

            let dims = slot.param.as_tensor().dims().to_vec();
            if dims != saved.shape {
                return Err(TrainingError::restore(format!(
                    "optimizer state shape mismatch for '{}': expected {:?} got {:?}",
                    slot.name, dims, saved.shape
                )));
            }
            let expected: usize = dims.iter().product();
            if saved.accumulator.len() != expected {
                return Err(TrainingError::restore(format!(
                    "optimizer state size mismatch for '{}'",
                    slot.name
                )));
            }

            let tensor = slot.param.as_tensor();
            slot.accumulator =
                Tensor::from_vec(saved.accumulator, dims.as_slice(), tensor.device())?
                    .to_dtype(tensor.dtype())?;
        }

        if !by_name.is_empty() {
            return Err(TrainingError::restore(
                "optimizer state has extra parameters not present in the model",
            ));
        }

        self.step = state.step;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: usize,
    pub momentum: f64,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub accumulator: Vec<f32>,
}
