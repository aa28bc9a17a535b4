use crate::error::CronRunnerError;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const PID_FILE: &str = "cron-runner.pid";
pub const HOST_FILE: &str = "cron-runner.host";
pub const STATUS_FILE: &str = "cron-runner.status";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Configured,
    Started,
    Resuming,
    Stopped,
}

impl RunnerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configured => "configured",
            Self::Started => "started",
            Self::Resuming => "resuming",
            Self::Stopped => "stopped",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "configured" => Some(Self::Configured),
            "started" => Some(Self::Started),
            "resuming" => Some(Self::Resuming),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchRecord {
    pub host: String,
    pub pid: u32,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn pid_path(&self) -> PathBuf {
        self.root.join(PID_FILE)
    }

    fn host_path(&self) -> PathBuf {
        self.root.join(HOST_FILE)
    }

    fn status_path(&self) -> PathBuf {
        self.root.join(STATUS_FILE)
    }

    // An absent status file means the runner has never been started.
    pub fn status(&self) -> Result<RunnerStatus, CronRunnerError> {
        let path = self.status_path();
        let Some(raw) = read_trimmed(&path)? else {
            return Ok(RunnerStatus::Configured);
        };
        RunnerStatus::parse(&raw).ok_or_else(|| {
            CronRunnerError::State(format!(
                "unrecognized status '{}' in {}",
                raw,
                path.display()
            ))
        })
    }

    pub fn set_status(&self, status: RunnerStatus) -> Result<(), CronRunnerError> {
        if status == RunnerStatus::Configured {
            return remove_if_exists(&self.status_path());
        }
        write_atomic_text_file(&self.status_path(), &format!("{}\n", status.as_str()))
    }

    pub fn pid(&self) -> Result<Option<u32>, CronRunnerError> {
        let path = self.pid_path();
        let Some(raw) = read_trimmed(&path)? else {
            return Ok(None);
        };
        raw.parse::<u32>().map(Some).map_err(|_| {
            CronRunnerError::State(format!("invalid pid '{}' in {}", raw, path.display()))
        })
    }

    pub fn host(&self) -> Result<Option<String>, CronRunnerError> {
        read_trimmed(&self.host_path())
    }

    // Only a complete pid/host pair counts as a launch record.
    pub fn launch_record(&self) -> Result<Option<LaunchRecord>, CronRunnerError> {
        match (self.pid()?, self.host()?) {
            (Some(pid), Some(host)) => Ok(Some(LaunchRecord { host, pid })),
            _ => Ok(None),
        }
    }

    pub fn record_launch(&self, pid: u32, host: &str) -> Result<(), CronRunnerError> {
        write_atomic_text_file(&self.pid_path(), &format!("{pid}\n"))?;
        write_atomic_text_file(&self.host_path(), &format!("{}\n", host.trim()))
    }

    pub fn clear_launch(&self) -> Result<(), CronRunnerError> {
        remove_if_exists(&self.pid_path())?;
        remove_if_exists(&self.host_path())
    }
}

fn read_trimmed(path: &Path) -> Result<Option<String>, CronRunnerError> {
    match fs::read_to_string(path) {
        Ok(content) => {
            let trimmed = content.trim();
            if trimmed.is_empty() {
                Ok(None)
            } else {
                Ok(Some(trimmed.to_string()))
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(CronRunnerError::Io(err)),
    }
}

fn remove_if_exists(path: &Path) -> Result<(), CronRunnerError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(CronRunnerError::Io(err)),
    }
}

pub fn ensure_parent(path: &Path) -> Result<(), CronRunnerError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

pub fn write_atomic_text_file(path: &Path, content: &str) -> Result<(), CronRunnerError> {
    ensure_parent(path)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "cron-runner".to_string()),
        pid,
        ts
    ));
    fs::write(&tmp_path, content)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn absent_status_file_means_configured() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert_eq!(store.status().unwrap(), RunnerStatus::Configured);
        assert!(store.launch_record().unwrap().is_none());
    }

    #[test]
    fn status_round_trips_and_configured_removes_file() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.set_status(RunnerStatus::Stopped).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join(STATUS_FILE)).unwrap(),
            "stopped\n"
        );
        assert_eq!(store.status().unwrap(), RunnerStatus::Stopped);

        store.set_status(RunnerStatus::Configured).unwrap();
        assert!(!dir.path().join(STATUS_FILE).exists());
        assert_eq!(store.status().unwrap(), RunnerStatus::Configured);
    }

    #[test]
    fn garbage_status_is_a_state_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(STATUS_FILE), "running\n").unwrap();
        let err = StateStore::new(dir.path()).status().unwrap_err();
        assert!(matches!(err, CronRunnerError::State(_)));
    }

    #[test]
    fn launch_record_requires_both_fields() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        fs::write(dir.path().join(PID_FILE), "4242\n").unwrap();
        assert!(store.launch_record().unwrap().is_none());

        store.record_launch(4242, "derecho5\n").unwrap();
        assert_eq!(
            store.launch_record().unwrap(),
            Some(LaunchRecord {
                host: "derecho5".to_string(),
                pid: 4242
            })
        );

        store.clear_launch().unwrap();
        assert!(!dir.path().join(PID_FILE).exists());
        assert!(!dir.path().join(HOST_FILE).exists());
        store.clear_launch().unwrap();
    }

    #[test]
    fn invalid_pid_is_a_state_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(PID_FILE), "abc").unwrap();
        let err = StateStore::new(dir.path()).pid().unwrap_err();
        assert!(err.to_string().contains("invalid pid"));
    }
}
