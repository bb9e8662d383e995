pub mod attack;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod objective;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use attack::{AttackConfig, AttackLoss, LinfPgdAttack};
pub use config::{TrainingConfig, TrainingError};
pub use data::{BatchSource, DataBatch, ImageDataset};
pub use loss::{
    CompositeLoss, CrossEntropyLoss, LossMetrics, LossOutput, LossTerms, TrainingObjective,
};
pub use objective::{BatchKind, ClassifierObjective, Objective, ObjectiveMetrics, ObjectiveRequest};
pub use optimizer::{MomentumConfig, MomentumOptimizer, OptimizerState};
pub use scheduler::{LRScheduler, PiecewiseConstant};
pub use trainer::{StepRecord, Trainer, TrainerPhase};
