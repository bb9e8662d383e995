use candle_core::{Error, Result, Tensor, Var};
use candle_nn::{linear, Linear, Module, VarBuilder, VarMap};
use rand::{
    distributions::{Distribution, Uniform},
    rngs::StdRng,
    SeedableRng,
};

use crate::config::{AttributionConfig, ClassifierConfig};

/// One-hidden-layer ReLU classifier over flattened `[N, H, W, C]` images.
pub struct ImageClassifier {
    config: ClassifierConfig,
    varmap: VarMap,
    hidden: Linear,
    output: Linear,
}

impl ImageClassifier {
    /// Builds the classifier and initializes its parameters from `config.seed`.
    pub fn new(config: ClassifierConfig) -> Result<Self> {
        config.validate()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, config.dtype, &config.device);
        let hidden = linear(config.input_dim(), config.hidden_dim, vb.pp("hidden"))?;
        let output = linear(config.hidden_dim, config.num_classes, vb.pp("logits"))?;

        let model = Self {
            config,
            varmap,
            hidden,
            output,
        };
        model.reinitialize(model.config.seed)?;
        Ok(model)
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Trainable parameters sorted by name.
    pub fn parameters(&self) -> Vec<(String, Var)> {
        let data = match self.varmap.data().lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut named: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        named
    }

    /// Produces logits shaped `(batch, num_classes)`.
    pub fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let flat = self.flatten(images)?;
        let hidden = self.hidden.forward(&flat)?.relu()?;
        self.output.forward(&hidden)
    }

    /// Gradient of the true-class logit with respect to the input, evaluated
    /// at `alpha * images`.
    ///
    /// Computed in closed form so that the result stays differentiable with
    /// respect to the parameters; the ReLU gate is treated as a constant.
    pub fn logit_input_gradient(
        &self,
        images: &Tensor,
        labels: &Tensor,
        alpha: f64,
    ) -> Result<Tensor> {
        let flat = self.flatten(images)?;
        let projected = flat.matmul(&self.hidden.weight().t()?)?;
        let class_weights = self.output.weight().index_select(labels, 0)?;
        let grad = self.gated_gradient(&projected, &class_weights, alpha)?;
        grad.reshape(images.dims())
    }

    /// Integrated gradients of the true-class logit along the straight line
    /// from the all-zero baseline to `images`.
    pub fn integrated_gradients(
        &self,
        images: &Tensor,
        labels: &Tensor,
        attribution: &AttributionConfig,
    ) -> Result<Tensor> {
        let flat = self.flatten(images)?;
        let projected = flat.matmul(&self.hidden.weight().t()?)?;
        let class_weights = self.output.weight().index_select(labels, 0)?;

        let alphas = attribution.alphas();
        let mut total: Option<Tensor> = None;
        for &alpha in &alphas {
            let grad = self.gated_gradient(&projected, &class_weights, alpha)?;
            total = Some(match total {
                Some(acc) => (acc + grad)?,
                None => grad,
            });
        }
        let total =
            total.ok_or_else(|| Error::Msg("attribution requires at least one point".into()))?;
        let average = total.affine(1.0 / alphas.len() as f64, 0.0)?;
        (flat * average)?.reshape(images.dims())
    }

    /// `sum(W^2) / 2` over the weight matrices; biases are not decayed.
    pub fn weight_decay_loss(&self) -> Result<Tensor> {
        let hidden = self.hidden.weight().sqr()?.sum_all()?;
        let output = self.output.weight().sqr()?.sum_all()?;
        (hidden + output)?.affine(0.5, 0.0)
    }

    fn gated_gradient(
        &self,
        projected: &Tensor,
        class_weights: &Tensor,
        alpha: f64,
    ) -> Result<Tensor> {
        let bias = self
            .hidden
            .bias()
            .ok_or_else(|| Error::Msg("hidden layer is missing its bias".into()))?;
        let pre_activation = projected.affine(alpha, 0.0)?.broadcast_add(bias)?;
        let gate = pre_activation
            .gt(0f64)?
            .to_dtype(pre_activation.dtype())?;
        (gate * class_weights)?.matmul(self.hidden.weight())
    }

    fn flatten(&self, images: &Tensor) -> Result<Tensor> {
        let dims = images.dims();
        if dims.len() != 4 || dims[1..] != self.config.input_shape[..] {
            return Err(Error::Msg(format!(
                "classifier expected images shaped [batch, {}, {}, {}] got {:?}",
                self.config.input_shape[0],
                self.config.input_shape[1],
                self.config.input_shape[2],
                dims
            )));
        }
        images.flatten_from(1)
    }

    fn reinitialize(&self, seed: u64) -> Result<()> {
        let mut rng = StdRng::seed_from_u64(seed);
        for (name, var) in self.parameters() {
            let dims = var.as_tensor().dims().to_vec();
            let numel: usize = dims.iter().product();
            let values: Vec<f32> = if name.ends_with("weight") {
                let fan_in = dims.last().copied().unwrap_or(1).max(1);
                let bound = 1.0 / (fan_in as f32).sqrt();
                let dist = Uniform::new_inclusive(-bound, bound);
                (0..numel).map(|_| dist.sample(&mut rng)).collect()
            } else {
                vec![0.0; numel]
            };
            let tensor = Tensor::from_vec(values, dims.as_slice(), &self.config.device)?
                .to_dtype(self.config.dtype)?;
            var.set(&tensor)?;
        }
        Ok(())
    }
}
