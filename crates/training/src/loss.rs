use candle_core::{DType, Tensor, D};
use candle_nn::{encoding::one_hot, ops};

use crate::TrainingError;

/// Margin used by the `cw` attack loss.
const CW_CONFIDENCE: f64 = 50.0;
/// Large constant that masks the true class out of the wrong-logit max.
const CW_MASK_PENALTY: f64 = 1e4;

/// Cross entropy over `[batch, classes]` logits and `[batch]` class ids.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self
    }

    /// Per-example negative log-likelihood of the target class.
    pub fn per_example(&self, logits: &Tensor, targets: &Tensor) -> Result<Tensor, TrainingError> {
        let (batch, classes) = check_logits(logits, targets)?;
        if classes == 0 {
            return Err(TrainingError::runtime(
                "logits class dimension must be greater than zero",
            ));
        }
        let log_probs = ops::log_softmax(logits, D::Minus1)?;
        let targets = targets.reshape((batch, 1))?;
        Ok(log_probs.gather(&targets, 1)?.neg()?.squeeze(1)?)
    }

    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainingError> {
        let nll = self.per_example(logits, targets)?;
        let batch = nll.dims()[0];
        if batch == 0 {
            return Err(TrainingError::runtime(
                "no examples available for loss computation",
            ));
        }

        let summed = nll.sum_all()?;
        let mean = summed.affine(1.0 / batch as f64, 0.0)?;
        let summed_value = summed.to_dtype(DType::F32)?.to_vec0::<f32>()?;

        let predictions = logits.argmax(D::Minus1)?;
        let correct = predictions
            .eq(targets)?
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_vec0::<f32>()?
            .round() as usize;

        Ok(LossOutput {
            loss: mean,
            metrics: LossMetrics {
                summed_loss: summed_value,
                examples: batch,
                correct,
            },
        })
    }
}

/// Summed `cw` margin loss `-relu(correct - max_wrong + 50)`.
pub fn margin_loss(logits: &Tensor, targets: &Tensor) -> Result<Tensor, TrainingError> {
    let (_, classes) = check_logits(logits, targets)?;
    let mask = one_hot(targets.clone(), classes, 1f32, 0f32)?.to_dtype(logits.dtype())?;
    let correct = (&mask * logits)?.sum(1)?;
    let wrong = ((mask.affine(-1.0, 1.0)? * logits)? - mask.affine(CW_MASK_PENALTY, 0.0)?)?
        .max(1)?;
    let margin = (correct - wrong)?.affine(1.0, CW_CONFIDENCE)?.relu()?;
    Ok(margin.neg()?.sum_all()?)
}

fn check_logits(logits: &Tensor, targets: &Tensor) -> Result<(usize, usize), TrainingError> {
    let dims = logits.dims();
    if dims.len() != 2 {
        return Err(TrainingError::runtime(format!(
            "classification loss expects [batch, classes] logits, got {:?}",
            dims
        )));
    }
    if targets.dims() != [dims[0]] {
        return Err(TrainingError::runtime(format!(
            "targets {:?} must match logits batch dimension {}",
            targets.dims(),
            dims[0]
        )));
    }
    Ok((dims[0], dims[1]))
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Mean cross entropy, attached to the autodiff graph.
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

#[derive(Debug, Clone)]
pub struct LossMetrics {
    summed_loss: f32,
    examples: usize,
    correct: usize,
}

impl LossMetrics {
    pub fn summed_loss(&self) -> f32 {
        self.summed_loss
    }

    pub fn average_loss(&self) -> f32 {
        if self.examples == 0 {
            0.0
        } else {
            self.summed_loss / self.examples as f32
        }
    }

    pub fn examples(&self) -> usize {
        self.examples
    }

    pub fn correct(&self) -> usize {
        self.correct
    }

    pub fn accuracy(&self) -> f32 {
        if self.examples == 0 {
            0.0
        } else {
            self.correct as f32 / self.examples as f32
        }
    }
}

/// Which two terms make up the optimized objective; fixed for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingObjective {
    /// Natural cross entropy plus the attribution regularizer.
    Ar,
    /// Adversarial cross entropy plus the attribution regularizer.
    AdvAr,
    /// Plain adversarial cross entropy.
    Adversarial,
}

impl TrainingObjective {
    pub fn from_name(name: &str) -> Self {
        match name {
            "ar" => Self::Ar,
            "adv_ar" => Self::AdvAr,
            _ => Self::Adversarial,
        }
    }

    pub fn uses_attribution(&self) -> bool {
        matches!(self, Self::Ar | Self::AdvAr)
    }
}

/// Differentiable scalar terms produced by an objective for one batch.
#[derive(Debug, Clone)]
pub struct LossTerms {
    pub natural_xent: Tensor,
    pub adversarial_xent: Tensor,
    /// Unscaled attribution regularizer; absent when it was not requested.
    pub attribution: Option<Tensor>,
    pub weight_decay: Tensor,
}

/// Assembles `base + lambda * attribution + weight_decay * l2`.
#[derive(Debug, Clone, Copy)]
pub struct CompositeLoss {
    pub objective: TrainingObjective,
    pub lambda: f64,
    pub weight_decay: f64,
}

impl CompositeLoss {
    pub fn requires_attribution(&self) -> bool {
        self.objective.uses_attribution() && self.lambda != 0.0
    }

    pub fn assemble(&self, terms: &LossTerms) -> Result<Tensor, TrainingError> {
        let base = match self.objective {
            TrainingObjective::Ar => &terms.natural_xent,
            TrainingObjective::AdvAr | TrainingObjective::Adversarial => &terms.adversarial_xent,
        };
        let mut total = base.clone();

        // lambda enters here and nowhere else
        if self.requires_attribution() {
            let attribution = terms.attribution.as_ref().ok_or_else(|| {
                TrainingError::runtime("objective did not provide the attribution term")
            })?;
            total = (total + attribution.affine(self.lambda, 0.0)?)?;
        }

        if self.weight_decay != 0.0 {
            total = (total + terms.weight_decay.affine(self.weight_decay, 0.0)?)?;
        }
        Ok(total)
    }
}
