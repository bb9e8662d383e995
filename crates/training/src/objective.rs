use candle_core::{Tensor, Var};
use robust_model::{AttributionConfig, ImageClassifier};

use crate::{
    attack::AttackLoss,
    loss::{margin_loss, CompositeLoss, CrossEntropyLoss, LossTerms},
    TrainingError,
};

/// Which images the accuracy and cross-entropy of a report are measured on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    Natural,
    Adversarial,
}

/// Inputs for one objective evaluation.
#[derive(Debug, Clone, Copy)]
pub struct ObjectiveRequest<'a> {
    pub kind: BatchKind,
    pub images: &'a Tensor,
    pub adv_images: &'a Tensor,
    pub labels: &'a Tensor,
}

impl<'a> ObjectiveRequest<'a> {
    pub fn new(
        kind: BatchKind,
        images: &'a Tensor,
        adv_images: &'a Tensor,
        labels: &'a Tensor,
    ) -> Self {
        Self {
            kind,
            images,
            adv_images,
            labels,
        }
    }

    pub fn with_kind(self, kind: BatchKind) -> Self {
        Self { kind, ..self }
    }

    fn measured_images(&self) -> &'a Tensor {
        match self.kind {
            BatchKind::Natural => self.images,
            BatchKind::Adversarial => self.adv_images,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjectiveMetrics {
    pub accuracy: f32,
    /// Cross entropy summed over the batch.
    pub cross_entropy_loss: f32,
    pub mean_cross_entropy: f32,
    pub attribution_regularizer: f32,
    pub total_loss: f32,
}

/// Model-side collaborator of the training loop.
pub trait Objective {
    /// Scalar metrics for reporting; never touches the parameters.
    fn evaluate(&self, request: &ObjectiveRequest<'_>) -> Result<ObjectiveMetrics, TrainingError>;

    /// Gradient of the attack loss with respect to `images`.
    fn input_gradient(
        &self,
        images: &Tensor,
        labels: &Tensor,
        loss: AttackLoss,
    ) -> Result<Tensor, TrainingError>;

    /// Differentiable terms of the training loss. The attribution term is
    /// only built when `with_attribution` is set.
    fn loss_terms(
        &self,
        request: &ObjectiveRequest<'_>,
        with_attribution: bool,
    ) -> Result<LossTerms, TrainingError>;

    fn parameters(&self) -> Vec<(String, Var)>;
}

/// [`Objective`] backed by the bundled [`ImageClassifier`].
pub struct ClassifierObjective {
    model: ImageClassifier,
    attribution: AttributionConfig,
    composite: CompositeLoss,
    cross_entropy: CrossEntropyLoss,
}

impl ClassifierObjective {
    pub fn new(
        model: ImageClassifier,
        attribution: AttributionConfig,
        composite: CompositeLoss,
    ) -> Self {
        Self {
            model,
            attribution,
            composite,
            cross_entropy: CrossEntropyLoss::new(),
        }
    }

    pub fn model(&self) -> &ImageClassifier {
        &self.model
    }

    /// Batch mean of the L1 distance between natural and adversarial
    /// integrated gradients.
    pub fn attribution_regularizer(
        &self,
        images: &Tensor,
        adv_images: &Tensor,
        labels: &Tensor,
    ) -> Result<Tensor, TrainingError> {
        let natural = self
            .model
            .integrated_gradients(images, labels, &self.attribution)?;
        let adversarial = self
            .model
            .integrated_gradients(adv_images, labels, &self.attribution)?;
        let distance = (adversarial - natural)?.abs()?.flatten_from(1)?.sum(1)?;
        Ok(distance.mean_all()?)
    }

    fn mean_cross_entropy(
        &self,
        images: &Tensor,
        labels: &Tensor,
    ) -> Result<Tensor, TrainingError> {
        let logits = self.model.forward(images)?;
        Ok(self.cross_entropy.compute(&logits, labels)?.loss)
    }
}

impl Objective for ClassifierObjective {
    fn evaluate(&self, request: &ObjectiveRequest<'_>) -> Result<ObjectiveMetrics, TrainingError> {
        let logits = self.model.forward(request.measured_images())?;
        let measured = self.cross_entropy.compute(&logits, request.labels)?;

        let terms = self.loss_terms(request, true)?;
        let attribution_regularizer = match &terms.attribution {
            Some(term) => term.to_vec0::<f32>()?,
            None => 0.0,
        };
        let total_loss = self.composite.assemble(&terms)?.to_vec0::<f32>()?;

        Ok(ObjectiveMetrics {
            accuracy: measured.metrics.accuracy(),
            cross_entropy_loss: measured.metrics.summed_loss(),
            mean_cross_entropy: measured.metrics.average_loss(),
            attribution_regularizer,
            total_loss,
        })
    }

    fn input_gradient(
        &self,
        images: &Tensor,
        labels: &Tensor,
        loss: AttackLoss,
    ) -> Result<Tensor, TrainingError> {
        let input = Var::from_tensor(images)?;
        let logits = self.model.forward(input.as_tensor())?;
        let objective = match loss {
            AttackLoss::CrossEntropy => self
                .cross_entropy
                .per_example(&logits, labels)?
                .sum_all()?,
            AttackLoss::Margin => margin_loss(&logits, labels)?,
        };
        let grads = objective.backward()?;
        grads
            .get(input.as_tensor())
            .cloned()
            .ok_or_else(|| TrainingError::runtime("attack loss has no gradient for the input"))
    }

    fn loss_terms(
        &self,
        request: &ObjectiveRequest<'_>,
        with_attribution: bool,
    ) -> Result<LossTerms, TrainingError> {
        let natural_xent = self.mean_cross_entropy(request.images, request.labels)?;
        let adversarial_xent = self.mean_cross_entropy(request.adv_images, request.labels)?;
        let attribution = if with_attribution {
            Some(self.attribution_regularizer(
                request.images,
                request.adv_images,
                request.labels,
            )?)
        } else {
            None
        };
        Ok(LossTerms {
            natural_xent,
            adversarial_xent,
            attribution,
            weight_decay: self.model.weight_decay_loss()?,
        })
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        self.model.parameters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        attack::{AttackConfig, LinfPgdAttack},
        loss::TrainingObjective,
    };
    use candle_core::{DType, Device};
    use robust_model::ClassifierConfig;

    fn objective(objective: TrainingObjective, lambda: f64) -> ClassifierObjective {
        let model = ImageClassifier::new(ClassifierConfig {
            input_shape: [2, 2, 1],
            hidden_dim: 8,
            num_classes: 3,
            dtype: DType::F32,
            device: Device::Cpu,
            seed: 5,
        })
        .unwrap();
        ClassifierObjective::new(
            model,
            AttributionConfig::default(),
            CompositeLoss {
                objective,
                lambda,
                weight_decay: 0.01,
            },
        )
    }

    fn batch() -> (Tensor, Tensor, Tensor) {
        let images = Tensor::new(
            &[[0.1f32, 0.9, 0.4, 0.3], [0.7, 0.2, 0.5, 0.8]],
            &Device::Cpu,
        )
        .unwrap()
        .reshape((2, 2, 2, 1))
        .unwrap();
        let adv = (&images + 0.05).unwrap().clamp(0f32, 1f32).unwrap();
        let labels = Tensor::new(&[0u32, 2], &Device::Cpu).unwrap();
        (images, adv, labels)
    }

    #[test]
    fn regularizer_vanishes_for_identical_inputs() {
        let objective = objective(TrainingObjective::AdvAr, 1.0);
        let (images, _, labels) = batch();
        let reg = objective
            .attribution_regularizer(&images, &images, &labels)
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        assert_eq!(reg, 0.0);
    }

    #[test]
    fn evaluate_reports_summed_and_mean_cross_entropy() {
        let objective = objective(TrainingObjective::AdvAr, 1.0);
        let (images, adv, labels) = batch();
        let request = ObjectiveRequest::new(BatchKind::Adversarial, &images, &adv, &labels);
        let metrics = objective.evaluate(&request).unwrap();
        assert!((metrics.cross_entropy_loss / 2.0 - metrics.mean_cross_entropy).abs() < 1e-6);
        assert!((0.0..=1.0).contains(&metrics.accuracy));
        assert!(metrics.attribution_regularizer >= 0.0);
    }

    #[test]
    fn zero_lambda_total_is_adversarial_xent_plus_decay() {
        let objective = objective(TrainingObjective::AdvAr, 0.0);
        let (images, adv, labels) = batch();
        let request = ObjectiveRequest::new(BatchKind::Adversarial, &images, &adv, &labels);

        let metrics = objective.evaluate(&request).unwrap();
        let decay = objective
            .model()
            .weight_decay_loss()
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        let expected = metrics.mean_cross_entropy + 0.01 * decay;
        assert!((metrics.total_loss - expected).abs() < 1e-5);
    }

    #[test]
    fn input_gradient_has_image_shape() {
        let objective = objective(TrainingObjective::Adversarial, 0.0);
        let (images, _, labels) = batch();
        for loss in [AttackLoss::CrossEntropy, AttackLoss::Margin] {
            let grad = objective.input_gradient(&images, &labels, loss).unwrap();
            assert_eq!(grad.dims(), images.dims());
        }
    }

    #[test]
    fn pgd_against_the_classifier_respects_the_8_255_budget() {
        let model = ImageClassifier::new(ClassifierConfig {
            input_shape: [4, 4, 3],
            hidden_dim: 16,
            num_classes: 10,
            dtype: DType::F32,
            device: Device::Cpu,
            seed: 3,
        })
        .unwrap();
        let objective = ClassifierObjective::new(
            model,
            AttributionConfig::default(),
            CompositeLoss {
                objective: TrainingObjective::AdvAr,
                lambda: 1.0,
                weight_decay: 0.0,
            },
        );

        let values: Vec<f32> = (0..4 * 4 * 4 * 3)
            .map(|i| ((i * 37) % 101) as f32 / 100.0)
            .collect();
        let images = Tensor::from_vec(values, (4, 4, 4, 3), &Device::Cpu).unwrap();
        let labels = Tensor::new(&[1u32, 4, 7, 9], &Device::Cpu).unwrap();

        let epsilon = 8.0 / 255.0;
        let mut pgd = LinfPgdAttack::new(AttackConfig {
            epsilon,
            num_steps: 10,
            step_size: 2.0 / 255.0,
            random_start: true,
            loss: AttackLoss::CrossEntropy,
            domain: (0.0, 1.0),
            seed: 21,
        })
        .unwrap();
        let adv = pgd.perturb(&objective, &images, &labels).unwrap();

        assert_eq!(adv.dims(), images.dims());
        let original = images.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let perturbed = adv.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_ne!(original, perturbed);
        for (x, a) in original.iter().zip(&perturbed) {
            assert!(((a - x).abs() as f64) <= epsilon + 1e-6, "{a} vs {x}");
            assert!((0.0..=1.0).contains(a));
        }
    }
}
