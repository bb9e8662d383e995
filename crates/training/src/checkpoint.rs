use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{safetensors::load as load_safetensors, Device, Var};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    optimizer::{MomentumOptimizer, OptimizerState},
    TrainingConfig, TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const CHECKPOINT_PREFIX: &str = "checkpoint-";
const MODEL_FILENAME: &str = "model.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
const MANIFEST_FILENAME: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TrainingProgressSnapshot {
    pub global_step: usize,
    pub epoch: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RngSnapshot {
    pub tf_random_seed: u64,
    pub np_random_seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    pub model: FileRecord,
    pub optimizer: FileRecord,
    pub progress: TrainingProgressSnapshot,
    pub rng: RngSnapshot,
}

pub struct SaveRequest<'a> {
    pub base_dir: &'a Path,
    pub config: &'a TrainingConfig,
    pub parameters: &'a [(String, Var)],
    pub optimizer: &'a MomentumOptimizer,
    pub progress: TrainingProgressSnapshot,
    pub rng: RngSnapshot,
    pub max_keep: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

pub struct LoadOutcome {
    pub manifest: CheckpointManifest,
    pub optimizer_state: OptimizerState,
    pub model_weights_path: PathBuf,
}

/// Directory name for the checkpoint taken at `global_step`.
pub fn checkpoint_dir_name(global_step: usize) -> String {
    format!("{}{:012}", CHECKPOINT_PREFIX, global_step)
}

pub fn save_checkpoint(request: SaveRequest<'_>) -> Result<CheckpointDescriptor, TrainingError> {
    fs::create_dir_all(request.base_dir).map_err(|err| TrainingError::io(request.base_dir, err))?;

    let checkpoint_dir = request
        .base_dir
        .join(checkpoint_dir_name(request.progress.global_step));
    if checkpoint_dir.exists() {
        fs::remove_dir_all(&checkpoint_dir).map_err(|err| TrainingError::io(&checkpoint_dir, err))?;
    }
    fs::create_dir(&checkpoint_dir).map_err(|err| TrainingError::io(&checkpoint_dir, err))?;

    let model_path = checkpoint_dir.join(MODEL_FILENAME);
    save_model_weights(request.parameters, &model_path)?;
    let model_record = file_record(&model_path)?;

    let optimizer_state = request.optimizer.state()?;
    let optimizer_path = checkpoint_dir.join(OPTIMIZER_FILENAME);
    write_json(&optimizer_path, &optimizer_state)?;
    let optimizer_record = file_record(&optimizer_path)?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        config_sha256: fingerprint_config(request.config)?,
        model: model_record,
        optimizer: optimizer_record,
        progress: request.progress,
        rng: request.rng,
    };

    // written last: directories without a manifest are skipped on lookup
    let manifest_path = checkpoint_dir.join(MANIFEST_FILENAME);
    write_json(&manifest_path, &manifest)?;

    prune_checkpoints(request.base_dir, request.max_keep)?;

    Ok(CheckpointDescriptor {
        directory: checkpoint_dir,
        manifest,
    })
}

pub fn latest_checkpoint(base_dir: &Path) -> Result<Option<CheckpointDescriptor>, TrainingError> {
    let entries = checkpoint_directories(base_dir)?;
    let Some(path) = entries.into_iter().max() else {
        return Ok(None);
    };
    let manifest = load_manifest(&path)?;
    Ok(Some(CheckpointDescriptor {
        directory: path,
        manifest,
    }))
}

pub fn load_checkpoint(directory: &Path) -> Result<LoadOutcome, TrainingError> {
    let manifest = load_manifest(directory)?;
    ensure_version_supported(manifest.version)?;

    let model_path = directory.join(&manifest.model.filename);
    validate_file(&model_path, &manifest.model.sha256)?;

    let optimizer_path = directory.join(&manifest.optimizer.filename);
    validate_file(&optimizer_path, &manifest.optimizer.sha256)?;
    let optimizer_state: OptimizerState = read_json(&optimizer_path)?;

    Ok(LoadOutcome {
        manifest,
        optimizer_state,
        model_weights_path: model_path,
    })
}

/// Overwrites every named parameter with the tensor stored under its name.
pub fn apply_model_weights(
    parameters: &[(String, Var)],
    weights_path: &Path,
) -> Result<(), TrainingError> {
    let device = parameters
        .first()
        .map(|(_, var)| var.as_tensor().device().clone())
        .unwrap_or(Device::Cpu);
    let tensors = load_safetensors(weights_path, &device).map_err(|err| {
        TrainingError::restore(format!(
            "failed to read model weights {}: {err}",
            weights_path.display()
        ))
    })?;
    let mut params_by_name: HashMap<_, _> = tensors.into_iter().collect();

    for (name, var) in parameters {
        let tensor = params_by_name.remove(name).ok_or_else(|| {
            TrainingError::restore(format!("checkpoint missing parameter {name}"))
        })?;
        if tensor.dims() != var.as_tensor().dims() {
            return Err(TrainingError::restore(format!(
                "checkpoint parameter {name} has shape {:?}, model expects {:?}",
                tensor.dims(),
                var.as_tensor().dims()
            )));
        }
        let desired_dtype = var.as_tensor().dtype();
        let tensor = if tensor.dtype() == desired_dtype {
            tensor
        } else {
            tensor.to_dtype(desired_dtype)?
        };
        var.set(&tensor)?;
    }

    if !params_by_name.is_empty() {
        let mut extra = params_by_name.keys().cloned().collect::<Vec<_>>();
        extra.sort();
        return Err(TrainingError::restore(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }

    Ok(())
}

fn save_model_weights(parameters: &[(String, Var)], path: &Path) -> Result<(), TrainingError> {
    if parameters.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    let tensors: HashMap<_, _> = parameters
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect();
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
            path.display()
        ))
    })
}

fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| TrainingError::io(path, err))?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha,
        bytes,
    })
}

fn checkpoint_directories(base: &Path) -> Result<Vec<PathBuf>, TrainingError> {
    let mut dirs = Vec::new();
    if !base.exists() {
        return Ok(dirs);
    }
    for entry in fs::read_dir(base).map_err(|err| TrainingError::io(base, err))? {
        let entry = entry.map_err(|err| TrainingError::io(base, err))?;
        let file_type = entry
            .file_type()
            .map_err(|err| TrainingError::io(entry.path(), err))?;
        if !file_type.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(CHECKPOINT_PREFIX) {
            continue;
        }
        // a save interrupted before the manifest was written is not a checkpoint
        if entry.path().join(MANIFEST_FILENAME).is_file() {
            dirs.push(entry.path());
        } else {
            log::warn!(
                "ignoring incomplete checkpoint directory {}",
                entry.path().display()
            );
        }
    }
    Ok(dirs)
}

fn load_manifest(directory: &Path) -> Result<CheckpointManifest, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::restore(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    read_json(&manifest_path)
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::restore(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainingError::restore(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| TrainingError::io(path, err))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|err| TrainingError::io(path, err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| TrainingError::io(path, err))?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data)
        .and_then(|_| file.write_all(b"\n"))
        .map_err(|err| TrainingError::io(path, err))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| TrainingError::io(path, err))?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::restore(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

fn prune_checkpoints(base: &Path, max_keep: Option<usize>) -> Result<(), TrainingError> {
    let Some(limit) = max_keep else {
        return Ok(());
    };
    if limit == 0 {
        return Ok(());
    }
    let mut dirs = checkpoint_directories(base)?;
    dirs.sort();
    while dirs.len() > limit {
        let victim = dirs.remove(0);
        log::debug!("pruning checkpoint {}", victim.display());
        fs::remove_dir_all(&victim).map_err(|err| TrainingError::io(&victim, err))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::MomentumConfig;
    use candle_core::Tensor;
    use tempfile::tempdir;

    fn config(dir: &Path) -> TrainingConfig {
        serde_json::from_value(serde_json::json!({
            "max_num_training_steps": 10,
            "num_output_steps": 1,
            "num_summary_steps": 1,
            "num_checkpoint_steps": 1,
            "step_size_schedule": [[0, 0.1]],
            "training_batch_size": 1,
            "model_dir": dir,
            "data_path": dir,
            "epsilon": 0.1,
            "num_steps": 1,
            "step_size": 0.1
        }))
        .unwrap()
    }

    fn parameters() -> Vec<(String, Var)> {
        vec![
            ("a".to_string(), Var::new(&[1.0f32, 2.0], &Device::Cpu).unwrap()),
            ("b".to_string(), Var::new(&[[3.0f32]], &Device::Cpu).unwrap()),
        ]
    }

    fn save(
        dir: &Path,
        params: &[(String, Var)],
        step: usize,
        keep: usize,
    ) -> CheckpointDescriptor {
        let optimizer = MomentumOptimizer::new(
            params.to_vec(),
            MomentumConfig {
                learning_rate: 0.1,
                momentum: 0.9,
            },
        )
        .unwrap();
        save_checkpoint(SaveRequest {
            base_dir: dir,
            config: &config(dir),
            parameters: params,
            optimizer: &optimizer,
            progress: TrainingProgressSnapshot {
                global_step: step,
                epoch: 0,
            },
            rng: RngSnapshot {
                tf_random_seed: 1,
                np_random_seed: 2,
            },
            max_keep: Some(keep),
        })
        .unwrap()
    }

    #[test]
    fn save_then_restore_round_trips_step_and_weights() {
        let dir = tempdir().unwrap();
        let params = parameters();
        let saved = save(dir.path(), &params, 42, 5);
        assert!(saved.directory.ends_with("checkpoint-000000000042"));

        let latest = latest_checkpoint(dir.path()).unwrap().unwrap();
        assert_eq!(latest.manifest.progress.global_step, 42);

        let restored = parameters();
        restored[0].1.set(&Tensor::new(&[0.0f32, 0.0], &Device::Cpu).unwrap()).unwrap();
        let outcome = load_checkpoint(&latest.directory).unwrap();
        apply_model_weights(&restored, &outcome.model_weights_path).unwrap();
        assert_eq!(
            restored[0].1.as_tensor().to_vec1::<f32>().unwrap(),
            vec![1.0, 2.0]
        );
        assert_eq!(outcome.manifest.rng.np_random_seed, 2);
    }

    #[test]
    fn keeps_only_the_most_recent_checkpoints() {
        let dir = tempdir().unwrap();
        let params = parameters();
        for step in [0, 5, 10, 15] {
            save(dir.path(), &params, step, 2);
        }
        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec![checkpoint_dir_name(10), checkpoint_dir_name(15)]);
        let latest = latest_checkpoint(dir.path()).unwrap().unwrap();
        assert_eq!(latest.manifest.progress.global_step, 15);
    }

    #[test]
    fn empty_directory_has_no_latest_checkpoint() {
        let dir = tempdir().unwrap();
        assert!(latest_checkpoint(dir.path()).unwrap().is_none());
        assert!(latest_checkpoint(&dir.path().join("missing")).unwrap().is_none());
    }

    #[test]
    fn incomplete_newer_directory_is_ignored() {
        let dir = tempdir().unwrap();
        let params = parameters();
        save(dir.path(), &params, 5, 2);
        save(dir.path(), &params, 10, 2);

        let partial = dir.path().join(checkpoint_dir_name(15));
        fs::create_dir(&partial).unwrap();
        fs::write(partial.join(MODEL_FILENAME), b"trunc").unwrap();

        let latest = latest_checkpoint(dir.path()).unwrap().unwrap();
        assert_eq!(latest.manifest.progress.global_step, 10);
        assert!(load_checkpoint(&latest.directory).is_ok());

        // pruning counts complete checkpoints only
        save(dir.path(), &params, 12, 2);
        assert!(!dir.path().join(checkpoint_dir_name(5)).exists());
        assert!(dir.path().join(checkpoint_dir_name(10)).exists());
        assert!(dir.path().join(checkpoint_dir_name(12)).exists());
        assert!(partial.exists());
    }

    #[test]
    fn tampered_files_fail_validation() {
        let dir = tempdir().unwrap();
        let saved = save(dir.path(), &parameters(), 3, 5);
        fs::write(saved.directory.join(OPTIMIZER_FILENAME), b"{}").unwrap();
        assert!(matches!(
            load_checkpoint(&saved.directory),
            Err(TrainingError::Restore(_))
        ));
    }

    #[test]
    fn mismatched_parameter_names_are_rejected() {
        let dir = tempdir().unwrap();
        let saved = save(dir.path(), &parameters(), 1, 5);
        let other = vec![("c".to_string(), Var::new(&[0.0f32], &Device::Cpu).unwrap())];
        let outcome = load_checkpoint(&saved.directory).unwrap();
        assert!(apply_model_weights(&other, &outcome.model_weights_path).is_err());
    }
}
