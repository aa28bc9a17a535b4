use crate::error::CronRunnerError;
use crate::remote::truncate_comm;
use std::collections::{BTreeMap, VecDeque};
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub ppid: u32,
    pub name: String,
    pub zombie: bool,
}

pub trait ProcessTable {
    fn snapshot(&self) -> Result<Vec<ProcessEntry>, CronRunnerError>;
    fn interrupt(&self, pid: u32) -> Result<(), CronRunnerError>;
    // Zombies count as gone. An error means the table could not be read.
    fn is_alive(&self, pid: u32) -> Result<bool, CronRunnerError>;
}

pub struct PsProcessTable {
    user: String,
}

impl PsProcessTable {
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }
}

impl ProcessTable for PsProcessTable {
    fn snapshot(&self) -> Result<Vec<ProcessEntry>, CronRunnerError> {
        let output = Command::new("ps")
            .args(["-u", &self.user, "-o", "pid=,ppid=,stat=,comm="])
            .output()
            .map_err(|err| CronRunnerError::StopFailure(format!("failed to run ps: {err}")))?;
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text.lines().filter_map(parse_ps_line).collect())
    }

    fn interrupt(&self, pid: u32) -> Result<(), CronRunnerError> {
        let status = Command::new("kill")
            .arg("-INT")
            .arg(pid.to_string())
            .status()
            .map_err(|err| CronRunnerError::StopFailure(format!("failed to run kill: {err}")))?;
        if !status.success() {
            return Err(CronRunnerError::StopFailure(format!(
                "kill -INT {pid} exited with {status}"
            )));
        }
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> Result<bool, CronRunnerError> {
        if pid == 0 {
            return Ok(false);
        }
        let output = Command::new("ps")
            .args(["-o", "stat=", "-p", &pid.to_string()])
            .output()
            .map_err(|err| CronRunnerError::StopFailure(format!("failed to run ps: {err}")))?;
        // ps exits 1 when no process matched the pid.
        match output.status.code() {
            Some(0) | Some(1) => {}
            code => {
                return Err(CronRunnerError::StopFailure(format!(
                    "ps -p {pid} exited with {}: {}",
                    code.map_or_else(|| "a signal".to_string(), |c| format!("status {c}")),
                    String::from_utf8_lossy(&output.stderr).trim()
                )))
            }
        }
        Ok(parse_stat_alive(&String::from_utf8_lossy(&output.stdout)))
    }
}

fn parse_stat_alive(text: &str) -> bool {
    let stat = text.trim();
    !stat.is_empty() && !stat.starts_with('Z')
}

fn parse_ps_line(line: &str) -> Option<ProcessEntry> {
    let mut parts = line.split_whitespace();
    let pid = parts.next()?.parse::<u32>().ok()?;
    let ppid = parts.next()?.parse::<u32>().ok()?;
    let stat = parts.next()?;
    let name = parts.collect::<Vec<_>>().join(" ");
    if name.is_empty() {
        return None;
    }
    Some(ProcessEntry {
        pid,
        ppid,
        name,
        zombie: stat.starts_with('Z'),
    })
}

// Breadth-first search below `root`, so the shallowest match wins.
pub fn find_descendant_by_name(entries: &[ProcessEntry], root: u32, name: &str) -> Option<u32> {
    let wanted = truncate_comm(name);
    let mut children: BTreeMap<u32, Vec<&ProcessEntry>> = BTreeMap::new();
    for entry in entries {
        if entry.pid != entry.ppid {
            children.entry(entry.ppid).or_default().push(entry);
        }
    }
    let mut queue = VecDeque::from([root]);
    let mut visited = 0usize;
    while let Some(pid) = queue.pop_front() {
        visited += 1;
        if visited > entries.len() + 1 {
            break;
        }
        for child in children.get(&pid).into_iter().flatten() {
            if child.name == wanted && !child.zombie {
                return Some(child.pid);
            }
            queue.push_back(child.pid);
        }
    }
    None
}

#[derive(Debug, Clone, Copy)]
pub struct StopBounds {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

pub fn stop_worker<T: ProcessTable>(
    table: &T,
    root: u32,
    worker_name: &str,
    bounds: StopBounds,
) -> Result<u32, CronRunnerError> {
    let entries = table.snapshot()?;
    let Some(target) = find_descendant_by_name(&entries, root, worker_name) else {
        return Err(CronRunnerError::StopFailure(format!(
            "no process named {worker_name} found beneath pid {root}"
        )));
    };
    info!(root, target, worker = worker_name, "interrupting worker");
    table.interrupt(target)?;

    let deadline = Instant::now() + bounds.timeout;
    loop {
        if !table.is_alive(root)? {
            info!(root, "launcher exited");
            return Ok(target);
        }
        if Instant::now() >= deadline {
            return Err(CronRunnerError::Timeout(format!(
                "pid {} still running {}s after interrupting {}",
                root,
                bounds.timeout.as_secs(),
                target
            )));
        }
        thread::sleep(bounds.poll_interval);
    }
}
