use candle_core::{DType, Device, Error, Result};

/// Configuration for the image classifier trained by the adversarial loop.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Per-example input shape as `[height, width, channels]`.
    pub input_shape: [usize; 3],
    pub hidden_dim: usize,
    pub num_classes: usize,
    pub dtype: DType,
    pub device: Device,
    pub seed: u64,
}

impl ClassifierConfig {
    pub fn input_dim(&self) -> usize {
        self.input_shape.iter().product()
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_shape.iter().any(|&dim| dim == 0) {
            return Err(Error::Msg(format!(
                "input_shape {:?} must not contain zero dimensions",
                self.input_shape
            )));
        }
        if self.hidden_dim == 0 {
            return Err(Error::Msg("hidden_dim must be greater than zero".into()));
        }
        if self.num_classes < 2 {
            return Err(Error::Msg("num_classes must be at least 2".into()));
        }
        if !self.dtype.is_float() {
            return Err(Error::Msg(format!(
                "classifier parameters must be floating point (got {:?})",
                self.dtype
            )));
        }
        Ok(())
    }
}

/// Interpolation settings for integrated-gradients attributions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttributionConfig {
    /// Resolution of the Riemann sum along the baseline-to-input path.
    pub m: usize,
    /// Only every `approx_factor`-th interpolation point is evaluated.
    pub approx_factor: usize,
}

impl AttributionConfig {
    /// Interpolation coefficients in `(0, 1]`, never empty.
    pub fn alphas(&self) -> Vec<f64> {
        let m = self.m.max(1);
        let stride = self.approx_factor.max(1);
        let alphas: Vec<f64> = (1..=m)
            .filter(|k| k % stride == 0)
            .map(|k| k as f64 / m as f64)
            .collect();
        if alphas.is_empty() {
            vec![1.0]
        } else {
            alphas
        }
    }
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            m: 10,
            approx_factor: 1,
        }
    }
}
