use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use twinface_core::{TrainingConfig, VerificationConfig};
use twinface_data::DatasetConfig;

/// Top-level configuration: an optional TOML file, then `TWINFACE_*`
/// environment overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub training: TrainingConfig,
    pub dataset: DatasetConfig,
    pub verification: VerificationConfig,
}

impl Config {
    /// Load `path` (if given) and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Override fields from `lookup(key)`; unset or malformed values keep
    /// the current setting.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let t = &mut self.training;
        t.batch_size = env_usize(&lookup, "TWINFACE_BATCH_SIZE", t.batch_size);
        t.learning_rate = env_f32(&lookup, "TWINFACE_LEARNING_RATE", t.learning_rate);
        t.epochs = env_usize(&lookup, "TWINFACE_EPOCHS", t.epochs);
        t.seed = env_u64(&lookup, "TWINFACE_SEED", t.seed);
        if let Some(dir) = lookup("TWINFACE_CHECKPOINT_DIR") {
            t.checkpoint_dir = PathBuf::from(dir);
        }

        let v = &mut self.verification;
        v.detection_threshold =
            env_f32(&lookup, "TWINFACE_DETECTION_THRESHOLD", v.detection_threshold);
        v.verification_threshold =
            env_f32(&lookup, "TWINFACE_VERIFICATION_THRESHOLD", v.verification_threshold);

        if let Some(root) = lookup("TWINFACE_DATA_DIR") {
            let root = DatasetConfig::with_root(Path::new(&root));
            self.dataset.anchor_dir = root.anchor_dir;
            self.dataset.positive_dir = root.positive_dir;
            self.dataset.negative_dir = root.negative_dir;
        }
    }
}

fn env_f32(lookup: &impl Fn(&str) -> Option<String>, key: &str, current: f32) -> f32 {
    lookup(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(current)
}

fn env_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str, current: u64) -> u64 {
    lookup(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(current)
}

fn env_usize(lookup: &impl Fn(&str) -> Option<String>, key: &str, current: usize) -> usize {
    lookup(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.training.batch_size, 16);
        assert_eq!(config.training.checkpoint_every, 10);
        assert_eq!(config.verification.detection_threshold, 0.5);
        assert_eq!(config.dataset.samples_per_class, 300);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [training]
            epochs = 5
            checkpoint_dir = "/tmp/ckpt"

            [verification]
            verification_threshold = 0.8
            "#,
        )
        .unwrap();
        assert_eq!(config.training.epochs, 5);
        assert_eq!(config.training.batch_size, 16);
        assert_eq!(config.training.checkpoint_dir, PathBuf::from("/tmp/ckpt"));
        assert_eq!(config.verification.verification_threshold, 0.8);
        assert_eq!(config.verification.detection_threshold, 0.5);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(lookup(&[
            ("TWINFACE_BATCH_SIZE", "32"),
            ("TWINFACE_LEARNING_RATE", "0.001"),
            ("TWINFACE_DETECTION_THRESHOLD", "0.6"),
            ("TWINFACE_DATA_DIR", "/srv/faces"),
        ]));
        assert_eq!(config.training.batch_size, 32);
        assert!((config.training.learning_rate - 0.001).abs() < 1e-9);
        assert_eq!(config.verification.detection_threshold, 0.6);
        assert_eq!(config.dataset.anchor_dir, PathBuf::from("/srv/faces/anchor"));
        assert_eq!(config.dataset.negative_dir, PathBuf::from("/srv/faces/negative"));
    }

    #[test]
    fn test_malformed_env_keeps_current() {
        let mut config = Config::default();
        config.training.epochs = 7;
        config.apply_overrides(lookup(&[("TWINFACE_EPOCHS", "many"), ("TWINFACE_SEED", "-1")]));
        assert_eq!(config.training.epochs, 7);
        assert_eq!(config.training.seed, 42);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("twinface.toml");
        std::fs::write(&path, "[dataset]\nsamples_per_class = 50\n").unwrap();
        let config = Config::from_toml_file(&path).unwrap();
        assert_eq!(config.dataset.samples_per_class, 50);
        assert!(Config::from_toml_file(&dir.path().join("missing.toml")).is_err());
    }
}
