pub mod config;
pub mod model;

pub use config::{AttributionConfig, ClassifierConfig};
pub use model::ImageClassifier;
