use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TailcontrolError};
use crate::store::ConflictBehavior;
use crate::supervisor::SupervisorConfig;

pub const DEFAULT_WATCH_PATH: &str = "/sdcard/Download/TailDrop/";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessTableKind {
    /// `ps`/`pgrep`/`kill` through the root shell.
    #[default]
    Shell,
    /// `/proc` and direct signals; the host must already be privileged.
    Native,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub shell: String,
    pub shell_flag: String,
    /// Name of the CLI binary, also used when counting duplicate instances.
    pub binary: String,
    pub state_file: PathBuf,
    pub process_table: ProcessTableKind,
    pub drop: DropConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            shell: "su".to_string(),
            shell_flag: "-c".to_string(),
            binary: "tailscale".to_string(),
            state_file: PathBuf::from("tailcontrol/state.json"),
            process_table: ProcessTableKind::default(),
            drop: DropConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DropConfig {
    pub watch_path: String,
    pub conflict: ConflictBehavior,
    pub interval_ms: u64,
    pub guard_interval_ms: u64,
    pub duplicate_threshold: usize,
    pub healthy_ceiling: usize,
    pub restart_delay_ms: u64,
}

impl Default for DropConfig {
    fn default() -> Self {
        let tunables = SupervisorConfig::default();
        DropConfig {
            watch_path: DEFAULT_WATCH_PATH.to_string(),
            conflict: ConflictBehavior::default(),
            interval_ms: tunables.interval.as_millis() as u64,
            guard_interval_ms: tunables.guard_interval.as_millis() as u64,
            duplicate_threshold: tunables.duplicate_threshold,
            healthy_ceiling: tunables.healthy_ceiling,
            restart_delay_ms: tunables.restart_delay.as_millis() as u64,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.shell.trim().is_empty() {
            return Err(TailcontrolError::Config("shell must not be empty".into()));
        }
        if self.binary.trim().is_empty() {
            return Err(TailcontrolError::Config("binary must not be empty".into()));
        }
        if self.drop.interval_ms == 0 || self.drop.guard_interval_ms == 0 {
            return Err(TailcontrolError::Config(
                "drop intervals must be positive".into(),
            ));
        }
        if self.drop.duplicate_threshold == 0 {
            return Err(TailcontrolError::Config(
                "duplicate_threshold must be at least 1".into(),
            ));
        }
        if self.drop.healthy_ceiling >= self.drop.duplicate_threshold {
            return Err(TailcontrolError::Config(
                "healthy_ceiling must be below duplicate_threshold".into(),
            ));
        }
        Ok(())
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            binary: self.binary.clone(),
            interval: Duration::from_millis(self.drop.interval_ms),
            guard_interval: Duration::from_millis(self.drop.guard_interval_ms),
            duplicate_threshold: self.drop.duplicate_threshold,
            healthy_ceiling: self.drop.healthy_ceiling,
            restart_delay: Duration::from_millis(self.drop.restart_delay_ms),
        }
    }
}

/// Reads `path`, falling back to defaults when the file is absent.
pub fn load_config(path: &Path) -> Result<Config> {
    let config = match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
        Err(e) => return Err(e.into()),
    };
    config.validate()?;
    Ok(config)
}

pub fn save_config(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_tunables() {
        let config = Config::default();
        config.validate().unwrap();
        let sup = config.supervisor();
        assert_eq!(sup.interval, Duration::from_secs(3));
        assert_eq!(sup.duplicate_threshold, 5);
        assert_eq!(sup.restart_delay, Duration::from_secs(1));
        assert_eq!(config.drop.watch_path, DEFAULT_WATCH_PATH);
        assert_eq!(config.drop.conflict, ConflictBehavior::Rename);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"shell":"/system/xbin/su","drop":{"conflict":"overwrite","duplicate_threshold":8}}"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.shell, "/system/xbin/su");
        assert_eq!(config.shell_flag, "-c");
        assert_eq!(config.drop.conflict, ConflictBehavior::Overwrite);
        assert_eq!(config.drop.duplicate_threshold, 8);
        assert_eq!(config.drop.interval_ms, 3000);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg").join("config.json");
        let mut config = Config::default();
        config.process_table = ProcessTableKind::Native;
        save_config(&path, &config).unwrap();
        assert_eq!(load_config(&path).unwrap(), config);
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut config = Config::default();
        config.drop.healthy_ceiling = 5;
        assert!(matches!(
            config.validate(),
            Err(TailcontrolError::Config(_))
        ));

        config.drop.healthy_ceiling = 2;
        config.drop.interval_ms = 0;
        assert!(config.validate().is_err());
    }
}
