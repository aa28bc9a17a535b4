use crate::error::CronRunnerError;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub paths: Paths,
    pub machines: BTreeMap<String, String>,
    pub runner: RunnerSettings,
    pub remote: Remote,
    pub stop: Stop,
    pub info: Info,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Paths {
    pub log_dir: String,
    pub error_sentinel: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerSettings {
    pub entry_point: String,
    pub config_artifact: String,
    pub worker_name: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Remote {
    pub ssh_program: String,
    pub ssh_options: Vec<String>,
    pub binary: String,
    pub command_timeout_sec: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Stop {
    pub timeout_sec: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Info {
    pub tail_lines: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            paths: Paths::default(),
            machines: default_machines(),
            runner: RunnerSettings::default(),
            remote: Remote::default(),
            stop: Stop::default(),
            info: Info::default(),
        }
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            log_dir: "~/cron-runner-logs".to_string(),
            error_sentinel: "".to_string(),
        }
    }
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            entry_point: "run.sh".to_string(),
            config_artifact: ".runner".to_string(),
            worker_name: "Runner.Listener".to_string(),
        }
    }
}

impl Default for Remote {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            ssh_options: vec![
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                "-o".to_string(),
                "ConnectTimeout=15".to_string(),
            ],
            binary: "".to_string(),
            command_timeout_sec: 60,
        }
    }
}

impl Default for Stop {
    fn default() -> Self {
        Self {
            timeout_sec: 300,
            poll_interval_ms: 1000,
        }
    }
}

impl Default for Info {
    fn default() -> Self {
        Self { tail_lines: 20 }
    }
}

fn default_machines() -> BTreeMap<String, String> {
    let mut machines = BTreeMap::new();
    machines.insert("derecho".to_string(), "derecho.hpc.ucar.edu".to_string());
    machines.insert("casper".to_string(), "casper.hpc.ucar.edu".to_string());
    machines
}

impl Config {
    pub fn log_dir(&self) -> PathBuf {
        PathBuf::from(expand_path(&self.paths.log_dir))
    }

    pub fn error_sentinel(&self) -> PathBuf {
        if self.paths.error_sentinel.trim().is_empty() {
            return self.log_dir().join("cron-runner.error");
        }
        PathBuf::from(expand_path(&self.paths.error_sentinel))
    }

    pub fn registry_path(&self) -> PathBuf {
        self.log_dir().join("registry")
    }

    pub fn supervisor_log_path(&self) -> PathBuf {
        self.log_dir().join("cron-runner.log")
    }

    // Destination address for a machine class; unknown classes are fatal input errors.
    pub fn machine_address(&self, machine: &str) -> Result<&str, CronRunnerError> {
        self.machines.get(machine).map(String::as_str).ok_or_else(|| {
            let known: Vec<&str> = self.machines.keys().map(String::as_str).collect();
            CronRunnerError::Config(format!(
                "unknown machine '{}'; expected one of: {}",
                machine,
                known.join(", ")
            ))
        })
    }

    pub fn remote_command_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.command_timeout_sec)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop.timeout_sec)
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop.poll_interval_ms)
    }

    pub fn remote_binary(&self) -> Result<PathBuf, CronRunnerError> {
        if !self.remote.binary.trim().is_empty() {
            return Ok(PathBuf::from(expand_path(&self.remote.binary)));
        }
        Ok(env::current_exe()?)
    }
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("CRON_RUNNER_CONFIG") {
        return PathBuf::from(path);
    }
    let mut base = default_config_dir();
    base.push("config.yaml");
    base
}

fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("CRON_RUNNER_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("cron-runner");
    base
}

pub fn expand_path(input: &str) -> String {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

pub fn read_config_from_str(content: &str) -> Result<Config, CronRunnerError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    if cfg.version != 1 {
        return Err(CronRunnerError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn read_config(path: &Path) -> Result<Config, CronRunnerError> {
    let content = fs::read_to_string(path)?;
    read_config_from_str(&content)
}

// Reads the config when present; a missing file means built-in defaults.
pub fn load_config(path: &Path) -> Result<Config, CronRunnerError> {
    if !path.exists() {
        return Ok(Config::default());
    }
    read_config(path).map_err(|err| match err {
        CronRunnerError::Config(message) => CronRunnerError::Config(message),
        other => CronRunnerError::Config(format!(
            "config is invalid. Please edit {} and try again. ({})",
            path.display(),
            other
        )),
    })
}

fn validate_config(cfg: &Config) -> Result<(), CronRunnerError> {
    if cfg.paths.log_dir.trim().is_empty() {
        return Err(CronRunnerError::Config(
            "paths.log_dir must not be empty".to_string(),
        ));
    }
    for (machine, address) in &cfg.machines {
        if address.trim().is_empty() {
            return Err(CronRunnerError::Config(format!(
                "machines.{machine} has an empty address"
            )));
        }
    }
    if cfg.runner.entry_point.trim().is_empty() {
        return Err(CronRunnerError::Config(
            "runner.entry_point must not be empty".to_string(),
        ));
    }
    if cfg.runner.config_artifact.trim().is_empty() {
        return Err(CronRunnerError::Config(
            "runner.config_artifact must not be empty".to_string(),
        ));
    }
    if cfg.runner.worker_name.trim().is_empty() {
        return Err(CronRunnerError::Config(
            "runner.worker_name must not be empty".to_string(),
        ));
    }
    if cfg.remote.ssh_program.trim().is_empty() {
        return Err(CronRunnerError::Config(
            "remote.ssh_program must not be empty".to_string(),
        ));
    }
    if cfg.remote.command_timeout_sec == 0 {
        return Err(CronRunnerError::Config(
            "remote.command_timeout_sec must be greater than zero".to_string(),
        ));
    }
    if cfg.stop.timeout_sec == 0 || cfg.stop.poll_interval_ms == 0 {
        return Err(CronRunnerError::Config(
            "stop.timeout_sec and stop.poll_interval_ms must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn config_unknown_field_errors() {
        let yaml = r#"
version: 1
unknown: true
"#;
        let result: Result<Config, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn config_defaults_apply() {
        let cfg = read_config_from_str("version: 1").expect("config");
        assert_eq!(cfg.paths.log_dir, "~/cron-runner-logs");
        assert_eq!(cfg.runner.worker_name, "Runner.Listener");
        assert_eq!(
            cfg.machine_address("derecho").unwrap(),
            "derecho.hpc.ucar.edu"
        );
    }

    #[test]
    fn default_template_parses() {
        let cfg = read_config_from_str(DEFAULT_CONFIG_YAML).expect("template");
        assert_eq!(cfg.remote.ssh_program, "ssh");
        assert_eq!(cfg.stop.timeout_sec, 300);
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let err = read_config_from_str("version: 7").unwrap_err();
        assert!(err.to_string().contains("unsupported config version 7"));
    }

    #[test]
    fn unknown_machine_lists_known_classes() {
        let cfg = Config::default();
        let err = cfg.machine_address("cheyenne").unwrap_err();
        assert!(matches!(err, CronRunnerError::Config(_)));
        assert!(err.to_string().contains("casper, derecho"));
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let err = read_config_from_str("version: 1\nstop:\n  timeout_sec: 0\n").unwrap_err();
        assert!(err.to_string().contains("stop.timeout_sec"));
    }

    #[test]
    fn sentinel_defaults_under_log_dir() {
        let dir = tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.paths.log_dir = dir.path().to_string_lossy().to_string();
        assert_eq!(cfg.error_sentinel(), dir.path().join("cron-runner.error"));
        cfg.paths.error_sentinel = dir.path().join("ERR").to_string_lossy().to_string();
        assert_eq!(cfg.error_sentinel(), dir.path().join("ERR"));
    }

    #[test]
    fn missing_config_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let cfg = load_config(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(cfg.version, 1);
    }

    #[test]
    fn invalid_config_file_is_actionable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "version: 1\nbogus: 3\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("Please edit"));
    }
}
