use anyhow::Result;
use candle_core::{DType, Device, Tensor, Var};
use robust_model::{AttributionConfig, ClassifierConfig, ImageClassifier};

fn build_config(seed: u64) -> ClassifierConfig {
    ClassifierConfig {
        input_shape: [2, 2, 3],
        hidden_dim: 8,
        num_classes: 4,
        dtype: DType::F32,
        device: Device::Cpu,
        seed,
    }
}

fn images(batch: usize) -> Result<Tensor> {
    let values: Vec<f32> = (0..batch * 12).map(|i| (i % 7) as f32 / 7.0).collect();
    Ok(Tensor::from_vec(values, (batch, 2, 2, 3), &Device::Cpu)?)
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    let diff = a.sub(b)?.abs()?.flatten_all()?.to_vec1::<f32>()?;
    Ok(diff.into_iter().fold(0.0_f32, f32::max))
}

#[test]
fn forward_produces_logits() -> Result<()> {
    let model = ImageClassifier::new(build_config(1))?;
    let logits = model.forward(&images(3)?)?;

    assert_eq!(logits.dims(), &[3, 4]);
    assert_eq!(logits.dtype(), DType::F32);
    Ok(())
}

#[test]
fn forward_rejects_wrong_image_shape() -> Result<()> {
    let model = ImageClassifier::new(build_config(1))?;
    let wrong = Tensor::zeros((2, 3, 2, 2), DType::F32, &Device::Cpu)?;

    assert!(model.forward(&wrong).is_err());
    Ok(())
}

#[test]
fn same_seed_gives_identical_parameters() -> Result<()> {
    let a = ImageClassifier::new(build_config(7))?;
    let b = ImageClassifier::new(build_config(7))?;
    let c = ImageClassifier::new(build_config(8))?;

    let names: Vec<String> = a.parameters().into_iter().map(|(name, _)| name).collect();
    assert_eq!(
        names,
        vec!["hidden.bias", "hidden.weight", "logits.bias", "logits.weight"]
    );

    let weight = |m: &ImageClassifier| -> Result<Tensor> {
        let (_, var) = m
            .parameters()
            .into_iter()
            .find(|(name, _)| name == "hidden.weight")
            .expect("hidden weight");
        Ok(var.as_tensor().clone())
    };
    assert_eq!(max_abs_diff(&weight(&a)?, &weight(&b)?)?, 0.0);
    assert!(max_abs_diff(&weight(&a)?, &weight(&c)?)? > 0.0);
    Ok(())
}

#[test]
fn closed_form_gradient_matches_autodiff() -> Result<()> {
    let model = ImageClassifier::new(build_config(3))?;
    let x = images(2)?;
    let labels = Tensor::from_vec(vec![1u32, 3], 2, &Device::Cpu)?;

    let input = Var::from_tensor(&x)?;
    let logits = model.forward(input.as_tensor())?;
    let picked = logits.gather(&labels.unsqueeze(1)?, 1)?.sum_all()?;
    let grads = picked.backward()?;
    let autodiff = grads.get(input.as_tensor()).expect("input gradient").clone();

    let closed_form = model.logit_input_gradient(&x, &labels, 1.0)?;
    assert!(max_abs_diff(&autodiff, &closed_form)? < 1e-5);
    Ok(())
}

#[test]
fn attribution_of_zero_image_vanishes() -> Result<()> {
    let model = ImageClassifier::new(build_config(5))?;
    let zeros = Tensor::zeros((2, 2, 2, 3), DType::F32, &Device::Cpu)?;
    let labels = Tensor::from_vec(vec![0u32, 2], 2, &Device::Cpu)?;

    let ig = model.integrated_gradients(&zeros, &labels, &AttributionConfig::default())?;
    assert_eq!(ig.dims(), &[2, 2, 2, 3]);
    let total = ig.abs()?.sum_all()?.to_vec0::<f32>()?;
    assert_eq!(total, 0.0);
    Ok(())
}

#[test]
fn alphas_respect_approx_factor() {
    let full = AttributionConfig {
        m: 4,
        approx_factor: 1,
    };
    assert_eq!(full.alphas(), vec![0.25, 0.5, 0.75, 1.0]);

    let strided = AttributionConfig {
        m: 4,
        approx_factor: 2,
    };
    assert_eq!(strided.alphas(), vec![0.5, 1.0]);

    let coarse = AttributionConfig {
        m: 2,
        approx_factor: 5,
    };
    assert_eq!(coarse.alphas(), vec![1.0]);
}

#[test]
fn weight_decay_is_half_squared_norm_of_weights() -> Result<()> {
    let model = ImageClassifier::new(build_config(9))?;
    let mut expected = 0.0f32;
    for (name, var) in model.parameters() {
        if name.ends_with("weight") {
            expected += var.as_tensor().sqr()?.sum_all()?.to_vec0::<f32>()?;
        }
    }
    let actual = model.weight_decay_loss()?.to_vec0::<f32>()?;
    assert!((actual - expected / 2.0).abs() < 1e-4);
    Ok(())
}
