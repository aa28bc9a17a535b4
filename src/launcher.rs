use crate::error::CronRunnerError;
use crate::state::{ensure_parent, RunnerStatus, StateStore};
use chrono::Utc;
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{info, warn};

// Status goes first so a launcher that dies right after this point is still
// seen as `started` with a dead pid and gets restarted.
pub fn record_identity(store: &StateStore, pid: u32, host: &str) -> Result<(), CronRunnerError> {
    store.set_status(RunnerStatus::Started)?;
    store.record_launch(pid, host)
}

pub fn run_launcher(
    runner_path: &Path,
    entry_point: &str,
    log: Option<&Path>,
) -> Result<i32, CronRunnerError> {
    let store = StateStore::new(runner_path);
    let host = current_hostname()?;
    let pid = std::process::id();
    record_identity(&store, pid, &host)?;
    info!(path = %runner_path.display(), %host, pid, "launcher recorded identity");

    let program = runner_path.join(entry_point);
    let mut cmd = Command::new(&program);
    cmd.current_dir(runner_path);
    cmd.stdin(Stdio::null());
    if let Some(log) = log {
        let mut file = open_log(log)?;
        writeln!(
            file,
            "==> {} cron-runner launching {} on {} (launcher pid {})",
            Utc::now().to_rfc3339(),
            program.display(),
            host,
            pid
        )?;
        cmd.stdout(file.try_clone()?);
        cmd.stderr(file);
    }
    #[cfg(unix)]
    {
        cmd.process_group(0);
        // Background shells start us with SIGINT ignored, and that disposition
        // would be inherited by the worker, which needs it for graceful shutdown.
        unsafe {
            cmd.pre_exec(|| {
                libc::signal(libc::SIGINT, libc::SIG_DFL);
                libc::signal(libc::SIGQUIT, libc::SIG_DFL);
                Ok(())
            });
        }
    }

    let mut child = cmd.spawn().map_err(|err| {
        CronRunnerError::Config(format!(
            "failed to start runner entry point {}: {err}",
            program.display()
        ))
    })?;
    let status = child.wait()?;
    let code = status.code().unwrap_or(if status.success() { 0 } else { 1 });
    if code == 0 {
        info!(path = %runner_path.display(), "runner exited");
    } else {
        warn!(path = %runner_path.display(), code, "runner exited with failure");
    }
    Ok(code)
}

fn open_log(path: &Path) -> Result<File, CronRunnerError> {
    ensure_parent(path)?;
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

pub fn current_hostname() -> Result<String, CronRunnerError> {
    if let Ok(output) = Command::new("hostname").output() {
        if output.status.success() {
            let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !text.is_empty() {
                return Ok(text);
            }
        }
    }
    if let Ok(text) = fs::read_to_string("/proc/sys/kernel/hostname") {
        if !text.trim().is_empty() {
            return Ok(text.trim().to_string());
        }
    }
    match env::var("HOSTNAME") {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(CronRunnerError::Config(
            "cannot determine the hostname of this machine".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{HOST_FILE, PID_FILE, STATUS_FILE};
    use tempfile::tempdir;

    #[test]
    fn identity_records_status_pid_and_host() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.set_status(RunnerStatus::Resuming).unwrap();
        record_identity(&store, 31337, "casper21").unwrap();
        assert_eq!(store.status().unwrap(), RunnerStatus::Started);
        assert_eq!(
            fs::read_to_string(dir.path().join(PID_FILE)).unwrap(),
            "31337\n"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join(HOST_FILE)).unwrap(),
            "casper21\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn launcher_runs_entry_point_into_log() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let runner = dir.path().join("runner");
        fs::create_dir_all(&runner).unwrap();
        let script = runner.join("run.sh");
        fs::write(&script, "#!/bin/sh\necho worker says hi\nexit 3\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        let log = dir.path().join("logs").join("runner.log");

        let code = run_launcher(&runner, "run.sh", Some(&log)).unwrap();
        assert_eq!(code, 3);

        let content = fs::read_to_string(&log).unwrap();
        assert!(content.contains("cron-runner launching"));
        assert!(content.contains("worker says hi"));
        assert_eq!(
            fs::read_to_string(runner.join(STATUS_FILE)).unwrap(),
            "started\n"
        );
        assert_eq!(
            StateStore::new(&runner).pid().unwrap(),
            Some(std::process::id())
        );
    }

    #[test]
    fn missing_entry_point_still_leaves_started_record() {
        let dir = tempdir().unwrap();
        let err = run_launcher(dir.path(), "run.sh", None).unwrap_err();
        assert!(err.to_string().contains("failed to start runner entry point"));
        let store = StateStore::new(dir.path());
        assert_eq!(store.status().unwrap(), RunnerStatus::Started);
        assert!(store.launch_record().unwrap().is_some());
    }
}
