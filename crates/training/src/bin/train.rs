use std::{path::PathBuf, str::FromStr};

use clap::Parser;
use robust_training::{Trainer, TrainingConfig, TrainingError};
use serde_json::{Map, Number, Value};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Attribution-regularized adversarial training",
    long_about = None
)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        default_value = "config.json",
        help = "Path to training config file"
    )]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override a configuration value, e.g. lambda=0.5 or input_shape[0]=32"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, help = "Resume from the latest checkpoint in model_dir")]
    resume: bool,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = TrainingConfig::from_path(&args.config)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }
    if args.resume {
        config.continue_train = true;
    }
    config.validate()?;

    let mut trainer = Trainer::new(config)?;
    trainer.train()?;
    log::info!(
        "training finished at global step {}",
        trainer.global_step()
    );
    Ok(())
}

fn apply_overrides(
    config: TrainingConfig,
    overrides: &[OverrideArg],
) -> Result<TrainingConfig, TrainingError> {
    let source_path = config.source_path.clone();
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::ConfigFormat(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        let segments = parse_path(&override_arg.path)?;
        assign_at_path(&mut value, &segments, new_value)?;
    }

    let mut config: TrainingConfig = serde_json::from_value(value).map_err(|err| {
        TrainingError::ConfigFormat(format!(
            "failed to deserialize config after overrides: {err}"
        ))
    })?;
    config.source_path = source_path;
    Ok(config)
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

#[derive(Debug, PartialEq)]
struct PathSegment {
    key: String,
    index: Option<usize>,
}

fn parse_path(path: &str) -> Result<Vec<PathSegment>, TrainingError> {
    path.split('.')
        .map(|segment| match segment.split_once('[') {
            Some((base, idx_part)) => {
                let index = idx_part.trim_end_matches(']').parse::<usize>().map_err(|err| {
                    TrainingError::ConfigFormat(format!(
                        "invalid index in override path '{}': {}",
                        segment, err
                    ))
                })?;
                Ok(PathSegment {
                    key: base.to_string(),
                    index: Some(index),
                })
            }
            None => Ok(PathSegment {
                key: segment.to_string(),
                index: None,
            }),
        })
        .collect()
}

fn assign_at_path(
    target: &mut Value,
    segments: &[PathSegment],
    new_value: Value,
) -> Result<(), TrainingError> {
    let Some((segment, rest)) = segments.split_first() else {
        *target = new_value;
        return Ok(());
    };

    if target.is_null() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(map) = target else {
        return Err(TrainingError::ConfigFormat(format!(
            "override path segment '{}' points into a non-object value",
            segment.key
        )));
    };
    let entry = map.entry(segment.key.clone()).or_insert(Value::Null);

    let Some(array_index) = segment.index else {
        return assign_at_path(entry, rest, new_value);
    };
    if entry.is_null() {
        *entry = Value::Array(Vec::new());
    }
    let Value::Array(array) = entry else {
        return Err(TrainingError::ConfigFormat(format!(
            "override path segment '{}' expects an array value",
            segment.key
        )));
    };
    while array.len() <= array_index {
        array.push(Value::Null);
    }
    assign_at_path(&mut array[array_index], rest, new_value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_values_are_typed() {
        assert_eq!(parse_override_value("true"), Value::Bool(true));
        assert_eq!(parse_override_value("7"), Value::from(7));
        assert_eq!(parse_override_value("0.5"), Value::from(0.5));
        assert_eq!(
            parse_override_value("[[0, 0.1], [10, 0.01]]"),
            serde_json::json!([[0, 0.1], [10, 0.01]])
        );
        assert_eq!(parse_override_value("cw"), Value::from("cw"));
    }

    #[test]
    fn assigns_keys_and_indices() {
        let mut value = serde_json::json!({ "lambda": 0.0, "input_shape": [128, 128, 3] });
        assign_at_path(&mut value, &parse_path("lambda").unwrap(), Value::from(1.5)).unwrap();
        assign_at_path(
            &mut value,
            &parse_path("input_shape[0]").unwrap(),
            Value::from(32),
        )
        .unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "lambda": 1.5, "input_shape": [32, 128, 3] })
        );
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(parse_path("input_shape[x]").is_err());
        let mut value = serde_json::json!({ "lambda": 0.0 });
        assert!(assign_at_path(
            &mut value,
            &parse_path("lambda.inner").unwrap(),
            Value::from(1)
        )
        .is_err());
    }
}
