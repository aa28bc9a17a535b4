use crate::config::Config;
use crate::error::CronRunnerError;
use crate::registry::{validate_name, Registry};
use crate::remote::{
    launch_command, launcher_process_name, probe_liveness, remote_io_error, stop_command,
    ProbeResult, RemoteRunner, SSH_TRANSPORT_FAILURE,
};
use crate::state::{ensure_parent, RunnerStatus, StateStore};
use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
#[cfg(unix)]
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H%M%S";
const TAIL_CHUNK_BYTES: u64 = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Interactive,
    Unattended,
}

impl Mode {
    pub fn is_interactive(&self) -> bool {
        matches!(self, Self::Interactive)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    EnsureRunning,
    Info,
    Stop,
    Resume,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub path: Option<PathBuf>,
    pub name: Option<String>,
    pub machine: Option<String>,
    pub action: Action,
}

#[derive(Debug, Clone)]
pub struct RunnerContext {
    pub name: String,
    pub path: PathBuf,
    pub store: StateStore,
    pub status: RunnerStatus,
    pub mode: Mode,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunnerInfo {
    pub name: String,
    pub path: PathBuf,
    pub status: RunnerStatus,
    pub host: Option<String>,
    pub pid: Option<u32>,
    pub registered: bool,
    pub config_artifact_present: bool,
    pub error_sentinel: Option<PathBuf>,
    pub latest_log: Option<PathBuf>,
    pub log_tail: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Launched {
        name: String,
        path: PathBuf,
        machine: String,
        address: String,
        log: Option<PathBuf>,
        recovered: bool,
    },
    AlreadyActive {
        name: String,
        host: String,
        pid: u32,
    },
    Held {
        name: String,
    },
    HoldReleased {
        name: String,
    },
    NoHold {
        name: String,
        status: RunnerStatus,
    },
    Stopped {
        name: String,
        host: String,
        pid: u32,
    },
    Info(RunnerInfo),
}

impl Outcome {
    pub fn message(&self) -> String {
        match self {
            Self::Launched {
                name,
                machine,
                address,
                log,
                recovered,
                ..
            } => {
                let prefix = if *recovered {
                    "runner was broken; restarted"
                } else {
                    "started runner"
                };
                match log {
                    Some(log) => format!(
                        "{prefix} {name} on {address} ({machine}); log: {}",
                        log.display()
                    ),
                    None => format!("{prefix} {name} on {address} ({machine})"),
                }
            }
            Self::AlreadyActive { name, host, pid } => {
                format!("runner {name} is already active on {host} (pid {pid})")
            }
            Self::Held { name } => {
                format!("runner {name} is stopped; run with --resume to release the hold")
            }
            Self::HoldReleased { name } => {
                format!("hold released for {name}; the next scheduled run will start it")
            }
            Self::NoHold { name, status } => {
                format!("runner {name} is not held (status: {status})")
            }
            Self::Stopped { name, host, pid } => {
                format!("stopped runner {name} on {host} (pid {pid})")
            }
            Self::Info(info) => render_info(info),
        }
    }
}

fn render_info(info: &RunnerInfo) -> String {
    let mut lines = vec![
        format!("name:    {}", info.name),
        format!("path:    {}", info.path.display()),
        format!("status:  {}", info.status),
    ];
    if let (Some(host), Some(pid)) = (&info.host, info.pid) {
        lines.push(format!("host:    {host}"));
        lines.push(format!("pid:     {pid}"));
    }
    if !info.registered {
        lines.push("registry: not registered".to_string());
    }
    if !info.config_artifact_present {
        lines.push("config:  missing (configure the runner first)".to_string());
    }
    if let Some(sentinel) = &info.error_sentinel {
        lines.push(format!(
            "error:   sentinel present at {} (cron runs are paused)",
            sentinel.display()
        ));
    }
    if let Some(log) = &info.latest_log {
        lines.push(format!("log:     {}", log.display()));
    }
    if !info.log_tail.is_empty() {
        lines.push(String::new());
        lines.extend(info.log_tail.iter().cloned());
    }
    lines.join("\n")
}

#[derive(Debug, Clone, Serialize)]
pub struct RunnerSummary {
    pub name: String,
    pub path: PathBuf,
    pub status: String,
    pub host: Option<String>,
    pub pid: Option<u32>,
}

pub struct Supervisor<'a, R: RemoteRunner> {
    cfg: &'a Config,
    remote: &'a R,
    user: String,
    remote_binary: PathBuf,
    mode: Mode,
    debug: bool,
}

impl<'a, R: RemoteRunner> Supervisor<'a, R> {
    pub fn new(
        cfg: &'a Config,
        remote: &'a R,
        user: String,
        remote_binary: PathBuf,
        mode: Mode,
        debug: bool,
    ) -> Self {
        Self {
            cfg,
            remote,
            user,
            remote_binary,
            mode,
            debug,
        }
    }

    fn registry(&self) -> Registry {
        Registry::new(self.cfg.registry_path())
    }

    pub fn run(&self, request: &Request) -> Result<Outcome, CronRunnerError> {
        let runner = self.resolve(request)?;
        self.validate_installation(&runner)?;
        let machine = match request.action {
            Action::EnsureRunning => {
                let machine = request.machine.as_deref().ok_or_else(|| {
                    CronRunnerError::Config(
                        "--machine is required to start a runner".to_string(),
                    )
                })?;
                let address = self.cfg.machine_address(machine)?.to_string();
                Some((machine.to_string(), address))
            }
            _ => None,
        };

        if runner.status == RunnerStatus::Stopped {
            return match request.action {
                Action::Resume => {
                    runner.store.set_status(RunnerStatus::Resuming)?;
                    info!(name = %runner.name, "hold released");
                    Ok(Outcome::HoldReleased { name: runner.name })
                }
                Action::Info => Ok(Outcome::Info(self.info(&runner)?)),
                _ => {
                    info!(name = %runner.name, "runner is held; nothing to do");
                    Ok(Outcome::Held { name: runner.name })
                }
            };
        }
        match request.action {
            Action::Resume => {
                return Ok(Outcome::NoHold {
                    name: runner.name,
                    status: runner.status,
                })
            }
            Action::Info => return Ok(Outcome::Info(self.info(&runner)?)),
            _ => {}
        }

        let artifact = runner.path.join(&self.cfg.runner.config_artifact);
        if !artifact.exists() {
            return Err(CronRunnerError::Config(format!(
                "runner at {} is not configured: {} is missing; run the runner's config step first",
                runner.path.display(),
                artifact.display()
            )));
        }

        let mut recovered = false;
        if let Some(record) = runner.store.launch_record()? {
            let probe = probe_liveness(
                self.remote,
                &record.host,
                record.pid,
                &self.user,
                &launcher_process_name(&self.remote_binary),
                self.cfg.remote_command_timeout(),
            );
            match probe {
                ProbeResult::Alive => {
                    if request.action == Action::Stop {
                        return self.stop(&runner, &record.host, record.pid);
                    }
                    info!(name = %runner.name, host = %record.host, pid = record.pid, "runner already active");
                    return Ok(Outcome::AlreadyActive {
                        name: runner.name,
                        host: record.host,
                        pid: record.pid,
                    });
                }
                ProbeResult::Dead => {
                    runner.store.clear_launch()?;
                    warn!(
                        name = %runner.name,
                        host = %record.host,
                        pid = record.pid,
                        "runner is broken, restarting"
                    );
                    recovered = true;
                }
                ProbeResult::Unreachable { reason, timed_out } => {
                    let message = format!(
                        "liveness probe of pid {} on {} failed: {}",
                        record.pid, record.host, reason
                    );
                    return Err(if timed_out {
                        CronRunnerError::Timeout(message)
                    } else {
                        CronRunnerError::Remote(message)
                    });
                }
            }
        }

        if request.action == Action::Stop {
            return Err(CronRunnerError::NotRunning(format!(
                "runner {} has no active process to stop",
                runner.name
            )));
        }
        let Some((machine, address)) = machine else {
            return Err(CronRunnerError::Config(
                "--machine is required to start a runner".to_string(),
            ));
        };
        self.start(&runner, machine, address, recovered)
    }

    fn resolve(&self, request: &Request) -> Result<RunnerContext, CronRunnerError> {
        let registry = self.registry();
        let (name, path) = match (&request.path, &request.name) {
            (Some(path), explicit) => {
                let path = fs::canonicalize(path).map_err(|err| {
                    CronRunnerError::Config(format!(
                        "runner path {} is not accessible: {err}",
                        path.display()
                    ))
                })?;
                let name = match explicit {
                    Some(name) => name.clone(),
                    None => match registry.lookup_path(&path)? {
                        Some(name) => name,
                        None => self.derive_name(&path)?,
                    },
                };
                (name, path)
            }
            (None, Some(name)) => {
                let path = registry.lookup_name(name)?.ok_or_else(|| {
                    CronRunnerError::Config(format!(
                        "runner '{}' is not registered in {}; pass its path instead",
                        name,
                        self.cfg.registry_path().display()
                    ))
                })?;
                (name.clone(), path)
            }
            (None, None) => {
                return Err(CronRunnerError::Config(
                    "no runner given: pass a runner PATH or --name".to_string(),
                ))
            }
        };
        validate_name(&name)?;
        let store = StateStore::new(&path);
        let status = store.status()?;
        Ok(RunnerContext {
            name,
            path,
            store,
            status,
            mode: self.mode,
        })
    }

    // Agent name from the runner's own config, else the directory name.
    fn derive_name(&self, path: &Path) -> Result<String, CronRunnerError> {
        let artifact = path.join(&self.cfg.runner.config_artifact);
        if let Ok(content) = fs::read_to_string(&artifact) {
            let content = content.trim_start_matches('\u{feff}');
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(content) {
                if let Some(name) = value.get("agentName").and_then(|v| v.as_str()) {
                    if !name.trim().is_empty() {
                        return Ok(name.trim().to_string());
                    }
                }
            }
        }
        path.file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| {
                CronRunnerError::Config(format!(
                    "cannot derive a runner name from {}; pass --name",
                    path.display()
                ))
            })
    }

    fn validate_installation(&self, runner: &RunnerContext) -> Result<(), CronRunnerError> {
        if !runner.path.is_dir() {
            return Err(CronRunnerError::Config(format!(
                "runner path {} does not exist or is not a directory",
                runner.path.display()
            )));
        }
        let entry_point = runner.path.join(&self.cfg.runner.entry_point);
        if !entry_point.is_file() {
            return Err(CronRunnerError::Config(format!(
                "{} does not look like a runner installation: {} is missing",
                runner.path.display(),
                entry_point.display()
            )));
        }
        Ok(())
    }

    fn stop(
        &self,
        runner: &RunnerContext,
        host: &str,
        pid: u32,
    ) -> Result<Outcome, CronRunnerError> {
        let command = stop_command(
            &self.remote_binary,
            pid,
            &self.cfg.runner.worker_name,
            self.cfg.stop_timeout(),
            self.cfg.stop_poll_interval(),
        );
        let timeout = self.cfg.stop_timeout() + self.cfg.remote_command_timeout();
        info!(name = %runner.name, host, pid, "stopping runner");
        let output = self
            .remote
            .run(host, &command, true, Some(timeout))
            .map_err(|err| remote_io_error(err, "stop", host))?;
        if output.status_code == SSH_TRANSPORT_FAILURE {
            return Err(CronRunnerError::Remote(format!(
                "stop on {host} could not connect: {}",
                output.stderr_text()
            )));
        }
        if !output.success() {
            let stderr = output.stderr_text();
            return Err(CronRunnerError::StopFailure(if stderr.is_empty() {
                format!(
                    "stopper for pid {pid} on {host} exited with status {}",
                    output.status_code
                )
            } else {
                format!("pid {pid} on {host}: {stderr}")
            }));
        }
        runner.store.clear_launch()?;
        runner.store.set_status(RunnerStatus::Stopped)?;
        info!(name = %runner.name, host, pid, "runner stopped and held");
        Ok(Outcome::Stopped {
            name: runner.name.clone(),
            host: host.to_string(),
            pid,
        })
    }

    fn start(
        &self,
        runner: &RunnerContext,
        machine: String,
        address: String,
        recovered: bool,
    ) -> Result<Outcome, CronRunnerError> {
        self.registry().register(&runner.name, &runner.path)?;
        let alias = self.cfg.log_dir().join("runners").join(&runner.name);
        refresh_alias(&runner.path, &alias)?;

        // Debug runs stay attached so the worker's output reaches the terminal.
        let foreground = runner.mode.is_interactive() && self.debug;
        let log = if foreground {
            None
        } else {
            Some(self.cfg.log_dir().join(format!(
                "{}.{}.log",
                runner.name,
                Local::now().format(LOG_TIMESTAMP_FORMAT)
            )))
        };
        let command = launch_command(
            &self.remote_binary,
            &runner.path,
            &self.cfg.runner.entry_point,
            log.as_deref(),
        );
        let timeout = if foreground {
            None
        } else {
            Some(self.cfg.remote_command_timeout())
        };
        info!(name = %runner.name, %address, %machine, "launching runner");
        let output = self
            .remote
            .run(&address, &command, !foreground, timeout)
            .map_err(|err| remote_io_error(err, "launch", &address))?;
        match output.status_code {
            0 => {}
            126 | 127 => {
                return Err(CronRunnerError::Config(format!(
                    "{} is not executable on {}: {}",
                    self.remote_binary.display(),
                    address,
                    output.stderr_text()
                )))
            }
            code => {
                return Err(CronRunnerError::Remote(format!(
                    "launch on {} exited with status {}: {}",
                    address,
                    code,
                    output.stderr_text()
                )))
            }
        }
        Ok(Outcome::Launched {
            name: runner.name.clone(),
            path: runner.path.clone(),
            machine,
            address,
            log,
            recovered,
        })
    }

    fn info(&self, runner: &RunnerContext) -> Result<RunnerInfo, CronRunnerError> {
        let record = runner.store.launch_record()?;
        let registered = self.registry().lookup_name(&runner.name)?.as_deref()
            == Some(runner.path.as_path());
        let sentinel = self.cfg.error_sentinel();
        let latest_log = latest_log_for(&self.cfg.log_dir(), &runner.name)?;
        let log_tail = match (&latest_log, runner.status) {
            (Some(log), RunnerStatus::Started) => tail_lines(log, self.cfg.info.tail_lines)?,
            _ => Vec::new(),
        };
        Ok(RunnerInfo {
            name: runner.name.clone(),
            path: runner.path.clone(),
            status: runner.status,
            host: record.as_ref().map(|r| r.host.clone()),
            pid: record.as_ref().map(|r| r.pid),
            registered,
            config_artifact_present: runner.path.join(&self.cfg.runner.config_artifact).exists(),
            error_sentinel: sentinel.exists().then_some(sentinel),
            latest_log,
            log_tail,
        })
    }
}

// Best-effort local view of every registered runner; no remote probing.
pub fn list_runners(cfg: &Config) -> Result<Vec<RunnerSummary>, CronRunnerError> {
    let entries = Registry::new(cfg.registry_path()).entries()?;
    Ok(entries
        .into_iter()
        .map(|(name, path)| {
            let store = StateStore::new(&path);
            let status = match store.status() {
                Ok(status) => status.as_str().to_string(),
                Err(_) => "unknown".to_string(),
            };
            let record = store.launch_record().ok().flatten();
            RunnerSummary {
                name,
                path,
                status,
                host: record.as_ref().map(|r| r.host.clone()),
                pid: record.as_ref().map(|r| r.pid),
            }
        })
        .collect())
}

fn refresh_alias(target: &Path, alias: &Path) -> Result<(), CronRunnerError> {
    ensure_parent(alias)?;
    match fs::symlink_metadata(alias) {
        Ok(meta) => {
            if meta.file_type().is_symlink() {
                if fs::read_link(alias).ok().as_deref() == Some(target) {
                    return Ok(());
                }
                fs::remove_file(alias)?;
            } else {
                return Err(CronRunnerError::Config(format!(
                    "refusing to replace {} with a runner alias",
                    alias.display()
                )));
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(CronRunnerError::Io(err)),
    }
    #[cfg(unix)]
    symlink(target, alias)?;
    Ok(())
}

fn latest_log_for(log_dir: &Path, name: &str) -> Result<Option<PathBuf>, CronRunnerError> {
    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(CronRunnerError::Io(err)),
    };
    let prefix = format!("{name}.");
    let mut latest: Option<(NaiveDateTime, PathBuf)> = None;
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().to_string();
        let Some(stamp) = file_name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(".log"))
        else {
            continue;
        };
        let Ok(ts) = NaiveDateTime::parse_from_str(stamp, LOG_TIMESTAMP_FORMAT) else {
            continue;
        };
        if latest.as_ref().map_or(true, |(best, _)| ts > *best) {
            latest = Some((ts, entry.path()));
        }
    }
    Ok(latest.map(|(_, path)| path))
}

// Reads backwards from the end until enough lines are buffered. Worker output
// is not guaranteed to be UTF-8.
fn tail_lines(path: &Path, lines: usize) -> Result<Vec<String>, CronRunnerError> {
    if lines == 0 {
        return Ok(Vec::new());
    }
    let mut file = File::open(path)?;
    let mut start = file.metadata()?.len();
    let mut buf: Vec<u8> = Vec::new();
    while start > 0 {
        let step = TAIL_CHUNK_BYTES.min(start);
        start -= step;
        file.seek(SeekFrom::Start(start))?;
        let mut chunk = vec![0u8; step as usize];
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&buf);
        buf = chunk;
        if buf.iter().filter(|byte| **byte == b'\n').count() > lines {
            break;
        }
    }
    let text = String::from_utf8_lossy(&buf);
    let mut all: Vec<&str> = text.lines().collect();
    if start > 0 && !all.is_empty() {
        // First line is cut where the read began.
        all.remove(0);
    }
    let from = all.len().saturating_sub(lines);
    Ok(all[from..].iter().map(|line| line.to_string()).collect())
}
