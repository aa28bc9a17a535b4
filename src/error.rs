use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CronRunnerError {
    #[error("config error: {0}")]
    Config(String),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("stop failed: {0}")]
    StopFailure(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("not running: {0}")]
    NotRunning(String),
    #[error("mode error: {0}")]
    DisallowedMode(String),
    #[error("state error: {0}")]
    State(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CronRunnerError {
    // Transient failures are left for the next periodic invocation to retry
    // and never trip the error sentinel.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Remote(_) | Self::Timeout(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "configuration",
            Self::Remote(_) => "transient_remote",
            Self::StopFailure(_) => "stop_failure",
            Self::Timeout(_) => "timeout",
            Self::NotRunning(_) => "not_running",
            Self::DisallowedMode(_) => "disallowed_mode",
            Self::State(_) => "state",
            Self::Io(_) => "io",
            Self::Yaml(_) => "yaml",
            Self::Json(_) => "json",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_remote_and_timeout_are_transient() {
        assert!(CronRunnerError::Remote("ssh exited 255".to_string()).is_transient());
        assert!(CronRunnerError::Timeout("probe".to_string()).is_transient());
        assert!(!CronRunnerError::Config("bad".to_string()).is_transient());
        assert!(!CronRunnerError::StopFailure("kill".to_string()).is_transient());
        assert!(!CronRunnerError::NotRunning("x".to_string()).is_transient());
    }
}
