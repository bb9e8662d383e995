use std::{fs, path::PathBuf};

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    DType, Device, Tensor,
};
use robust_model::{AttributionConfig, ClassifierConfig, ImageClassifier};

use crate::{
    attack::{AttackConfig, LinfPgdAttack},
    checkpoint::{self, CheckpointDescriptor, RngSnapshot, SaveRequest, TrainingProgressSnapshot},
    data::{BatchSource, ImageDataset},
    logging::{Logger, ProgressReport, SummaryWriter},
    loss::{CompositeLoss, TrainingObjective},
    metrics::StepTimer,
    objective::{BatchKind, ClassifierObjective, Objective, ObjectiveMetrics, ObjectiveRequest},
    optimizer::{MomentumConfig, MomentumOptimizer},
    scheduler::{LRScheduler, PiecewiseConstant},
    TrainingConfig, TrainingError,
};

/// Lifecycle of a [`Trainer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerPhase {
    Restoring,
    Fresh,
    Running,
    Terminated,
}

/// Outcome of one optimizer update, handed to the step callback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepRecord {
    /// Loop index the update was made in.
    pub step: usize,
    /// Global step after the update.
    pub global_step: usize,
    pub learning_rate: f64,
    pub loss: f32,
}

pub struct Trainer {
    config: TrainingConfig,
    device: Device,
    data: Box<dyn BatchSource>,
    objective: Box<dyn Objective>,
    attack: LinfPgdAttack,
    schedule: Box<dyn LRScheduler>,
    optimizer: MomentumOptimizer,
    composite: CompositeLoss,
    global_step: usize,
    epoch: usize,
    timer: StepTimer,
    logger: Logger,
    summaries: SummaryWriter,
    phase: TrainerPhase,
}

impl Trainer {
    /// Builds the bundled dataset and classifier from `config`.
    pub fn new(config: TrainingConfig) -> Result<Self, TrainingError> {
        config.validate()?;
        let device = select_device();

        let data = ImageDataset::load(&config.data_path, config.np_random_seed)?;
        let model = ImageClassifier::new(ClassifierConfig {
            input_shape: config.input_shape,
            hidden_dim: config.hidden_size,
            num_classes: config.num_classes,
            dtype: DType::F32,
            device: device.clone(),
            seed: config.tf_random_seed,
        })
        .map_err(|err| TrainingError::initialization(format!("failed to build model: {err}")))?;
        let objective = ClassifierObjective::new(
            model,
            AttributionConfig {
                m: config.m,
                approx_factor: config.approx_factor,
            },
            composite_loss(&config),
        );

        Self::with_components(config, device, Box::new(data), Box::new(objective))
    }

    /// Wires the loop around caller-provided collaborators. Creates
    /// `model_dir`, records the configuration there and restores the latest
    /// checkpoint when `continue_train` is set.
    pub fn with_components(
        config: TrainingConfig,
        device: Device,
        data: Box<dyn BatchSource>,
        objective: Box<dyn Objective>,
    ) -> Result<Self, TrainingError> {
        config.validate()?;

        fs::create_dir_all(&config.model_dir)
            .map_err(|err| TrainingError::io(&config.model_dir, err))?;
        record_config(&config)?;

        let attack = LinfPgdAttack::new(AttackConfig::from_training(&config))?;
        let schedule = PiecewiseConstant::new(&config.step_size_schedule)?;
        let optimizer = MomentumOptimizer::new(
            objective.parameters(),
            MomentumConfig {
                learning_rate: schedule.learning_rate(0),
                momentum: config.momentum,
            },
        )?;
        let summaries = SummaryWriter::create(&config.model_dir, config.num_summary_steps)?;

        let mut trainer = Self {
            composite: composite_loss(&config),
            timer: StepTimer::new(config.separate_step_timers),
            config,
            device,
            data,
            objective,
            attack,
            schedule: Box::new(schedule),
            optimizer,
            global_step: 0,
            epoch: 0,
            logger: Logger::new(true),
            summaries,
            phase: TrainerPhase::Fresh,
        };

        if trainer.config.continue_train {
            trainer.resume_from_latest()?;
        }
        Ok(trainer)
    }

    /// Restores parameters, optimizer state and global step from the newest
    /// checkpoint under `model_dir`; having none is an error.
    pub fn resume_from_latest(&mut self) -> Result<CheckpointDescriptor, TrainingError> {
        self.phase = TrainerPhase::Restoring;
        let descriptor = checkpoint::latest_checkpoint(&self.config.model_dir)?.ok_or_else(|| {
            TrainingError::restore(format!(
                "no checkpoint found in {}",
                self.config.model_dir.display()
            ))
        })?;
        log::info!(
            "resuming from checkpoint {} (global step {})",
            descriptor.directory.display(),
            descriptor.manifest.progress.global_step
        );

        let outcome = checkpoint::load_checkpoint(&descriptor.directory)?;
        checkpoint::apply_model_weights(&self.objective.parameters(), &outcome.model_weights_path)?;
        self.optimizer.load_state(outcome.optimizer_state)?;

        let progress = outcome.manifest.progress;
        self.global_step = progress.global_step;
        self.epoch = progress.epoch;
        self.data.skip(
            progress.global_step,
            self.config.training_batch_size,
            true,
        )?;
        Ok(descriptor)
    }

    pub fn train(&mut self) -> Result<(), TrainingError> {
        self.train_with_callback(|_| {})
    }

    pub fn train_with_callback<F>(&mut self, mut on_step: F) -> Result<(), TrainingError>
    where
        F: FnMut(&StepRecord),
    {
        self.phase = TrainerPhase::Running;
        let batch_size = self.config.training_batch_size;
        let num_output_steps = self.config.num_output_steps;
        log::info!(
            "training on {:?} from step {} to {}",
            self.device,
            self.global_step,
            self.config.max_num_training_steps
        );

        for ii in self.global_step..self.config.max_num_training_steps {
            let batch = self.data.next_batch(batch_size, true)?;
            self.epoch = batch.epoch;
            let (images, labels) = self.prepare_batch(&batch.images, &batch.labels)?;
            let examples = labels.dims()[0];

            let started = self.timer.start();
            self.attack.reseed(self.global_step as u64);
            let adv_images = self
                .attack
                .perturb(self.objective.as_ref(), &images, &labels)?;
            self.timer.record_attack(started);

            let lr = self.schedule.learning_rate(self.global_step);
            self.optimizer.set_learning_rate(lr);

            let request = ObjectiveRequest::new(BatchKind::Natural, &images, &adv_images, &labels);
            let mut adversarial: Option<ObjectiveMetrics> = None;

            if ii % num_output_steps == 0 {
                let natural = self.objective.evaluate(&request)?;
                let adv = self
                    .objective
                    .evaluate(&request.with_kind(BatchKind::Adversarial))?;
                let examples_per_second = if ii != 0 {
                    self.timer
                        .examples_per_second(num_output_steps * batch_size)
                } else {
                    None
                };
                self.logger.report(&ProgressReport {
                    step: ii,
                    natural,
                    adversarial: adv,
                    examples_per_second,
                    regions: self.timer.regions(),
                });
                if ii != 0 {
                    self.timer.reset();
                }
                adversarial = Some(adv);
            }

            if ii % self.config.num_summary_steps == 0 {
                let metrics = match adversarial {
                    Some(metrics) => metrics,
                    None => self
                        .objective
                        .evaluate(&request.with_kind(BatchKind::Adversarial))?,
                };
                self.summaries
                    .write_adversarial_summary(self.global_step, &metrics, examples)?;
            }

            if ii % self.config.num_checkpoint_steps == 0 {
                self.save_checkpoint()?;
            }

            let started = self.timer.start();
            let terms = self
                .objective
                .loss_terms(&request, self.composite.requires_attribution())?;
            let loss = self.composite.assemble(&terms)?;
            let grads = loss.backward()?;
            self.optimizer.step(&grads)?;
            self.global_step += 1;
            self.timer.record_update(started);

            on_step(&StepRecord {
                step: ii,
                global_step: self.global_step,
                learning_rate: lr,
                loss: loss.to_dtype(DType::F32)?.to_vec0::<f32>()?,
            });
        }

        self.summaries.flush()?;
        self.phase = TrainerPhase::Terminated;
        Ok(())
    }

    pub fn save_checkpoint(&self) -> Result<CheckpointDescriptor, TrainingError> {
        let parameters = self.objective.parameters();
        let descriptor = checkpoint::save_checkpoint(SaveRequest {
            base_dir: &self.config.model_dir,
            config: &self.config,
            parameters: &parameters,
            optimizer: &self.optimizer,
            progress: TrainingProgressSnapshot {
                global_step: self.global_step,
                epoch: self.epoch,
            },
            rng: RngSnapshot {
                tf_random_seed: self.config.tf_random_seed,
                np_random_seed: self.config.np_random_seed,
            },
            max_keep: Some(self.config.max_to_keep),
        })?;
        log::info!(
            "checkpoint saved at global step {} -> {}",
            self.global_step,
            descriptor.directory.display()
        );
        Ok(descriptor)
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn phase(&self) -> TrainerPhase {
        self.phase
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Views the batch as `[-1, H, W, C]` on the training device.
    fn prepare_batch(
        &self,
        images: &Tensor,
        labels: &Tensor,
    ) -> Result<(Tensor, Tensor), TrainingError> {
        let [height, width, channels] = self.config.input_shape;
        let per_example = height * width * channels;
        let total = images.elem_count();
        if total % per_example != 0 {
            return Err(TrainingError::shape(format!(
                "batch of {} values cannot be viewed as [-1, {}, {}, {}]",
                total, height, width, channels
            )));
        }
        let count = total / per_example;
        if labels.elem_count() != count {
            return Err(TrainingError::shape(format!(
                "batch has {} images but {} labels",
                count,
                labels.elem_count()
            )));
        }
        let images = images
            .reshape((count, height, width, channels))?
            .to_device(&self.device)?;
        let labels = labels.flatten_all()?.to_device(&self.device)?;
        Ok((images, labels))
    }
}

fn composite_loss(config: &TrainingConfig) -> CompositeLoss {
    CompositeLoss {
        objective: TrainingObjective::from_name(&config.training_objective),
        lambda: config.lambda,
        weight_decay: config.weight_decay,
    }
}

/// Copies the configuration file into `model_dir`, or writes it as JSON when
/// it was not read from disk.
fn record_config(config: &TrainingConfig) -> Result<PathBuf, TrainingError> {
    match config.source_path.as_deref() {
        Some(source) => {
            let name = source
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config.json"));
            let target = config.model_dir.join(name);
            let same_file = match (fs::canonicalize(source), fs::canonicalize(&target)) {
                (Ok(a), Ok(b)) => a == b,
                _ => false,
            };
            if !same_file {
                fs::copy(source, &target).map_err(|err| TrainingError::io(&target, err))?;
            }
            Ok(target)
        }
        None => {
            let target = config.model_dir.join("config.json");
            let json = serde_json::to_vec_pretty(config).map_err(|err| {
                TrainingError::runtime(format!("failed to serialize config: {err}"))
            })?;
            fs::write(&target, json).map_err(|err| TrainingError::io(&target, err))?;
            Ok(target)
        }
    }
}

fn select_device() -> Device {
    let cuda_available = cuda_is_available();
    let metal_available = metal_is_available();
    log::debug!(
        "device detection: cuda_available={} metal_available={}",
        cuda_available,
        metal_available
    );

    if metal_available {
        match Device::new_metal(0) {
            Ok(device) => {
                log::info!("device: using Metal GPU #0");
                return device;
            }
            Err(err) => log::warn!("failed to initialize metal device, falling back to CPU: {err}"),
        }
    } else if cuda_available {
        match Device::cuda_if_available(0) {
            Ok(device) => {
                log::info!("device: using CUDA GPU #0");
                return device;
            }
            Err(err) => log::warn!("cuda reported available but initialization failed: {err}"),
        }
    }
    log::info!("device: using CPU");
    Device::Cpu
}
