use crate::error::CronRunnerError;
use std::env;
use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

// ssh reserves this exit status for its own failures.
pub const SSH_TRANSPORT_FAILURE: i32 = 255;
// Kernel limit on the visible command name (TASK_COMM_LEN - 1).
const COMM_LEN: usize = 15;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

pub trait RemoteRunner {
    // Runs `command` through a remote shell on `host`. Expiry of `timeout`
    // surfaces as `io::ErrorKind::TimedOut`.
    fn run(
        &self,
        host: &str,
        command: &str,
        capture_output: bool,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, io::Error>;
}

pub struct SshRunner {
    program: String,
    options: Vec<String>,
}

impl SshRunner {
    pub fn new(program: impl Into<String>, options: Vec<String>) -> Self {
        Self {
            program: program.into(),
            options,
        }
    }

    fn args(&self, host: &str, command: &str) -> Vec<String> {
        let mut args = self.options.clone();
        args.push(host.to_string());
        args.push(command.to_string());
        args
    }
}

impl RemoteRunner for SshRunner {
    fn run(
        &self,
        host: &str,
        command: &str,
        capture_output: bool,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, io::Error> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args(host, command));
        cmd.stdin(Stdio::null());
        if capture_output {
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        }
        let mut child = cmd.spawn()?;
        let stdout_reader = child.stdout.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                buf
            })
        });
        let stderr_reader = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                buf
            })
        });

        let status_code = wait_with_timeout(&mut child, timeout, host)?;
        let stdout = stdout_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        Ok(CommandOutput {
            status_code,
            stdout,
            stderr,
        })
    }
}

fn wait_with_timeout(
    child: &mut Child,
    timeout: Option<Duration>,
    host: &str,
) -> Result<i32, io::Error> {
    let Some(timeout) = timeout else {
        let status = child.wait()?;
        return Ok(status.code().unwrap_or(if status.success() { 0 } else { 1 }));
    };
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status.code().unwrap_or(if status.success() { 0 } else { 1 }));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!(
                    "remote command on {} did not finish within {}s",
                    host,
                    timeout.as_secs()
                ),
            ));
        }
        thread::sleep(Duration::from_millis(50));
    }
}

pub fn remote_io_error(err: io::Error, what: &str, host: &str) -> CronRunnerError {
    if err.kind() == io::ErrorKind::TimedOut {
        return CronRunnerError::Timeout(format!("{what} on {host}: {err}"));
    }
    CronRunnerError::Remote(format!("{what} on {host} failed to run: {err}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    Alive,
    Dead,
    Unreachable { reason: String, timed_out: bool },
}

pub fn probe_liveness<R: RemoteRunner>(
    runner: &R,
    host: &str,
    pid: u32,
    user: &str,
    expected_name: &str,
    timeout: Duration,
) -> ProbeResult {
    let command = format!("ps -u {} -o pid=,stat=,comm=", shell_single_quote(user));
    let output = match runner.run(host, &command, true, Some(timeout)) {
        Ok(output) => output,
        Err(err) => {
            return ProbeResult::Unreachable {
                timed_out: err.kind() == io::ErrorKind::TimedOut,
                reason: err.to_string(),
            }
        }
    };
    // ps exits 1 when the user owns no processes; anything else means we
    // could not actually look.
    if output.status_code != 0 && output.status_code != 1 {
        let stderr = output.stderr_text();
        return ProbeResult::Unreachable {
            reason: if stderr.is_empty() {
                format!("probe exited with status {}", output.status_code)
            } else {
                format!("probe exited with status {}: {}", output.status_code, stderr)
            },
            timed_out: false,
        };
    }
    let text = String::from_utf8_lossy(&output.stdout);
    if ps_listing_has_live_process(&text, pid, expected_name) {
        ProbeResult::Alive
    } else {
        ProbeResult::Dead
    }
}

fn ps_listing_has_live_process(text: &str, pid: u32, expected_name: &str) -> bool {
    let expected = truncate_comm(expected_name);
    text.lines().any(|line| {
        let mut parts = line.split_whitespace();
        let (Some(raw_pid), Some(stat)) = (parts.next(), parts.next()) else {
            return false;
        };
        let comm = parts.collect::<Vec<_>>().join(" ");
        raw_pid.parse::<u32>().ok() == Some(pid) && !stat.starts_with('Z') && comm == expected
    })
}

pub fn truncate_comm(name: &str) -> &str {
    match name.char_indices().nth(COMM_LEN) {
        Some((idx, _)) => &name[..idx],
        None => name,
    }
}

pub fn launcher_process_name(binary: &Path) -> String {
    binary
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "cron-runner".to_string())
}

pub fn launch_command(
    binary: &Path,
    runner_path: &Path,
    entry_point: &str,
    log: Option<&Path>,
) -> String {
    let base = format!(
        "{} launch {} --entry-point {}",
        shell_single_quote(&binary.to_string_lossy()),
        shell_single_quote(&runner_path.to_string_lossy()),
        shell_single_quote(entry_point)
    );
    match log {
        Some(log) => format!(
            "nohup {} --log {} </dev/null >/dev/null 2>&1 &",
            base,
            shell_single_quote(&log.to_string_lossy())
        ),
        None => base,
    }
}

pub fn stop_command(
    binary: &Path,
    pid: u32,
    worker_name: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> String {
    format!(
        "{} stop-worker {} --worker-name {} --timeout-sec {} --poll-interval-ms {}",
        shell_single_quote(&binary.to_string_lossy()),
        pid,
        shell_single_quote(worker_name),
        timeout.as_secs(),
        poll_interval.as_millis()
    )
}

pub fn shell_single_quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

pub fn current_user() -> Result<String, CronRunnerError> {
    for key in ["USER", "LOGNAME"] {
        if let Ok(value) = env::var(key) {
            if !value.trim().is_empty() {
                return Ok(value.trim().to_string());
            }
        }
    }
    let output = Command::new("id").arg("-un").output();
    if let Ok(output) = output {
        if output.status.success() {
            let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !text.is_empty() {
                return Ok(text);
            }
        }
    }
    Err(CronRunnerError::Config(
        "cannot determine the current user; set USER".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::path::PathBuf;

    struct CannedRunner {
        result: RefCell<Option<Result<CommandOutput, io::Error>>>,
        commands: RefCell<Vec<String>>,
    }

    impl CannedRunner {
        fn new(result: Result<CommandOutput, io::Error>) -> Self {
            Self {
                result: RefCell::new(Some(result)),
                commands: RefCell::new(Vec::new()),
            }
        }
    }

    impl RemoteRunner for CannedRunner {
        fn run(
            &self,
            _host: &str,
            command: &str,
            _capture_output: bool,
            _timeout: Option<Duration>,
        ) -> Result<CommandOutput, io::Error> {
            self.commands.borrow_mut().push(command.to_string());
            self.result
                .borrow_mut()
                .take()
                .expect("single canned result")
        }
    }

    fn listing(status_code: i32, stdout: &str) -> Result<CommandOutput, io::Error> {
        Ok(CommandOutput {
            status_code,
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
        })
    }

    fn probe(result: Result<CommandOutput, io::Error>) -> ProbeResult {
        let runner = CannedRunner::new(result);
        let outcome = probe_liveness(
            &runner,
            "derecho5",
            4242,
            "csgteam",
            "cron-runner",
            Duration::from_secs(5),
        );
        assert_eq!(
            runner.commands.borrow()[0],
            "ps -u 'csgteam' -o pid=,stat=,comm="
        );
        outcome
    }

    #[test]
    fn probe_finds_matching_pid_and_name() {
        let stdout = "  100 Ss   bash\n 4242 S    cron-runner\n 4300 Sl   Runner.Listener\n";
        assert_eq!(probe(listing(0, stdout)), ProbeResult::Alive);
    }

    #[test]
    fn probe_rejects_reused_pid_with_other_name() {
        assert_eq!(probe(listing(0, " 4242 S    python3\n")), ProbeResult::Dead);
    }

    #[test]
    fn probe_treats_zombie_as_dead() {
        assert_eq!(probe(listing(0, " 4242 Z    cron-runner\n")), ProbeResult::Dead);
    }

    #[test]
    fn probe_with_no_user_processes_is_dead() {
        assert_eq!(probe(listing(1, "")), ProbeResult::Dead);
    }

    #[test]
    fn ssh_failure_is_unreachable() {
        let result = Ok(CommandOutput {
            status_code: SSH_TRANSPORT_FAILURE,
            stdout: Vec::new(),
            stderr: b"ssh: connect to host derecho5 port 22: No route to host\n".to_vec(),
        });
        match probe(result) {
            ProbeResult::Unreachable { reason, timed_out } => {
                assert!(reason.contains("No route to host"));
                assert!(!timed_out);
            }
            other => panic!("unexpected probe result {other:?}"),
        }
    }

    #[test]
    fn probe_timeout_is_flagged() {
        let result = Err(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert!(matches!(
            probe(result),
            ProbeResult::Unreachable {
                timed_out: true,
                ..
            }
        ));
    }

    #[test]
    fn long_names_are_truncated_like_comm() {
        assert_eq!(truncate_comm("Runner.Listener"), "Runner.Listener");
        assert_eq!(truncate_comm("cron-runner-with-suffix"), "cron-runner-wit");
        assert!(ps_listing_has_live_process(
            "7 S cron-runner-wit\n",
            7,
            "cron-runner-with-suffix"
        ));
    }

    #[test]
    fn single_quote_escapes_embedded_quotes() {
        assert_eq!(shell_single_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_single_quote(""), "''");
    }

    #[test]
    fn launch_command_detaches_only_with_log() {
        let binary = PathBuf::from("/glade/bin/cron-runner");
        let runner = PathBuf::from("/glade/runners/gpu one");
        let log = PathBuf::from("/glade/logs/gpu.log");
        assert_eq!(
            launch_command(&binary, &runner, "run.sh", Some(&log)),
            "nohup '/glade/bin/cron-runner' launch '/glade/runners/gpu one' --entry-point 'run.sh' --log '/glade/logs/gpu.log' </dev/null >/dev/null 2>&1 &"
        );
        assert_eq!(
            launch_command(&binary, &runner, "run.sh", None),
            "'/glade/bin/cron-runner' launch '/glade/runners/gpu one' --entry-point 'run.sh'"
        );
    }

    #[test]
    fn stop_command_carries_bounds() {
        let command = stop_command(
            Path::new("/opt/cron-runner"),
            99,
            "Runner.Listener",
            Duration::from_secs(300),
            Duration::from_millis(500),
        );
        assert_eq!(
            command,
            "'/opt/cron-runner' stop-worker 99 --worker-name 'Runner.Listener' --timeout-sec 300 --poll-interval-ms 500"
        );
    }

    #[test]
    fn ssh_args_place_host_before_command() {
        let runner = SshRunner::new("ssh", vec!["-o".to_string(), "BatchMode=yes".to_string()]);
        assert_eq!(
            runner.args("casper", "true"),
            vec!["-o", "BatchMode=yes", "casper", "true"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn ssh_runner_times_out_slow_commands() {
        let runner = SshRunner::new("sh", vec!["-c".to_string(), "sleep 2".to_string()]);
        let err = runner
            .run("ignored", "ignored", true, Some(Duration::from_millis(200)))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
