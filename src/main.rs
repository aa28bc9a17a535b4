mod config;
mod error;
mod launcher;
mod logging;
mod registry;
mod remote;
mod state;
mod stopper;
mod supervisor;

use crate::config::{
    load_config, read_config, resolve_config_path, Config, DEFAULT_CONFIG_YAML,
};
use crate::error::CronRunnerError;
use crate::remote::{current_user, SshRunner};
use crate::state::ensure_parent;
use crate::stopper::{stop_worker, PsProcessTable, StopBounds};
use crate::supervisor::{list_runners, Action, Mode, Outcome, Request, RunnerSummary, Supervisor};
use chrono::Utc;
use clap::{ArgGroup, Parser, Subcommand};
use dialoguer::console::style;
use dialoguer::theme::ColorfulTheme;
use dialoguer::Confirm;
use serde::Serialize;
use serde_json::json;
use std::env;
use std::fs::{self, OpenOptions};
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

const MODE_ENV: &str = "CRON_RUNNER_MODE";
const DEBUG_ENV: &str = "CRON_RUNNER_DEBUG";

#[derive(Parser, Debug)]
#[command(
    name = "cron-runner",
    version,
    about = "Keep a CI runner alive on a remote host from cron",
    group(
        ArgGroup::new("action")
            .multiple(false)
            .args(["info", "list", "resume", "stop", "clear_error"])
    )
)]
struct Cli {
    #[arg(help = "Runner installation directory")]
    path: Option<PathBuf>,
    #[arg(short, long, help = "Registered runner name, instead of or in addition to PATH")]
    name: Option<String>,
    #[arg(short, long, help = "Destination machine class used when (re)starting")]
    machine: Option<String>,
    #[arg(short, long, help = "Print the recorded state without touching anything")]
    info: bool,
    #[arg(short, long, help = "List every registered runner")]
    list: bool,
    #[arg(short, long, help = "Release a hold placed by --stop")]
    resume: bool,
    #[arg(short, long, help = "Stop the runner if it is active and hold it")]
    stop: bool,
    #[arg(long, help = "Remove the error sentinel left by a failed cron run")]
    clear_error: bool,
    #[arg(long, help = "Allow the cron-only start mode from a terminal")]
    debug: bool,
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    #[command(hide = true)]
    Launch {
        path: PathBuf,
        #[arg(long)]
        entry_point: Option<String>,
        #[arg(long)]
        log: Option<PathBuf>,
    },
    #[command(hide = true)]
    StopWorker {
        pid: u32,
        #[arg(long)]
        worker_name: Option<String>,
        #[arg(long)]
        timeout_sec: Option<u64>,
        #[arg(long)]
        poll_interval_ms: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
    Show,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<String>,
}

#[derive(Debug, Clone)]
struct Context {
    config_path: PathBuf,
    json: bool,
    mode: Mode,
    debug: bool,
}

fn main() -> Result<(), CronRunnerError> {
    let cli = Cli::parse();
    let ctx = build_context(&cli);
    // Cron mails anything on stderr; the remote helpers and operator actions
    // must still report.
    let quiet =
        cli.command.is_none() && is_cron_pass(&cli) && !ctx.mode.is_interactive() && !ctx.json;

    let result = match cli.command {
        Some(Commands::Config { ref command }) => handle_config(&ctx, command),
        Some(Commands::Launch {
            ref path,
            ref entry_point,
            ref log,
        }) => handle_launch(&ctx, path, entry_point.as_deref(), log.as_deref()),
        Some(Commands::StopWorker {
            pid,
            ref worker_name,
            timeout_sec,
            poll_interval_ms,
        }) => handle_stop_worker(&ctx, pid, worker_name.as_deref(), timeout_sec, poll_interval_ms),
        None => handle_supervise(&ctx, &cli),
    };

    if let Err(err) = result {
        if !quiet {
            report_error(&ctx, &err)?;
        }
        std::process::exit(1);
    }
    Ok(())
}

// The default action: what cron runs on every tick.
fn is_cron_pass(cli: &Cli) -> bool {
    !(cli.info || cli.list || cli.resume || cli.stop || cli.clear_error)
}

fn build_context(cli: &Cli) -> Context {
    Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        json: cli.json,
        mode: detect_mode(),
        debug: cli.debug || env_flag(DEBUG_ENV),
    }
}

fn detect_mode() -> Mode {
    match env::var(MODE_ENV).ok().as_deref().map(str::trim) {
        Some("interactive") => Mode::Interactive,
        Some("unattended") => Mode::Unattended,
        _ if io::stdin().is_terminal() => Mode::Interactive,
        _ => Mode::Unattended,
    }
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn handle_supervise(ctx: &Context, cli: &Cli) -> Result<(), CronRunnerError> {
    let cfg = match load_config(&ctx.config_path) {
        Ok(cfg) => cfg,
        Err(err) => {
            // Without a readable config the default sentinel location is the
            // only one we can honour.
            let fallback = Config::default();
            logging::init(ctx.mode, &fallback.supervisor_log_path());
            return guard_fatal(ctx, is_cron_pass(cli), &fallback.error_sentinel(), Err(err));
        }
    };
    logging::init(ctx.mode, &cfg.supervisor_log_path());

    let sentinel = cfg.error_sentinel();
    if is_cron_pass(cli) && !ctx.mode.is_interactive() && sentinel.exists() {
        info!(sentinel = %sentinel.display(), "error sentinel present; skipping run");
        return Ok(());
    }

    let result = supervise(ctx, cli, &cfg);
    guard_fatal(ctx, is_cron_pass(cli), &sentinel, result)
}

// Trips the sentinel for fatal failures of an unattended cron pass; transient
// ones are left for the next scheduled run.
fn guard_fatal(
    ctx: &Context,
    cron_pass: bool,
    sentinel: &Path,
    result: Result<(), CronRunnerError>,
) -> Result<(), CronRunnerError> {
    let Err(err) = result else {
        return Ok(());
    };
    if err.is_transient() {
        warn!(kind = err.kind(), "{err}");
        return Err(err);
    }
    error!(kind = err.kind(), "{err}");
    if cron_pass && !ctx.mode.is_interactive() {
        if let Err(write_err) = write_sentinel(sentinel, &err) {
            error!(sentinel = %sentinel.display(), "failed to write error sentinel: {write_err}");
        }
    }
    Err(err)
}

fn write_sentinel(path: &Path, err: &CronRunnerError) -> Result<(), CronRunnerError> {
    ensure_parent(path)?;
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(io_err) if io_err.kind() == io::ErrorKind::AlreadyExists => return Ok(()),
        Err(io_err) => return Err(CronRunnerError::Io(io_err)),
    };
    writeln!(
        file,
        "{} {}: {}\nRemove this file once the problem is fixed to resume cron runs.",
        Utc::now().to_rfc3339(),
        err.kind(),
        err
    )?;
    Ok(())
}

fn supervise(ctx: &Context, cli: &Cli, cfg: &Config) -> Result<(), CronRunnerError> {
    if cli.list {
        return emit_list(ctx, &list_runners(cfg)?);
    }
    if cli.clear_error {
        return clear_error(ctx, cfg);
    }
    let action = if cli.info {
        Action::Info
    } else if cli.stop {
        Action::Stop
    } else if cli.resume {
        Action::Resume
    } else {
        Action::EnsureRunning
    };
    if action == Action::EnsureRunning && ctx.mode.is_interactive() && !ctx.debug {
        return Err(CronRunnerError::DisallowedMode(
            "starting a runner is meant for cron; use --info, --stop or --resume, or pass --debug to run it from a terminal"
                .to_string(),
        ));
    }

    let user = current_user()?;
    let remote_binary = cfg.remote_binary()?;
    if action == Action::EnsureRunning || action == Action::Stop {
        which::which(&cfg.remote.ssh_program).map_err(|err| {
            CronRunnerError::Config(format!(
                "remote shell program '{}' not found: {err}",
                cfg.remote.ssh_program
            ))
        })?;
    }
    let remote = SshRunner::new(cfg.remote.ssh_program.clone(), cfg.remote.ssh_options.clone());
    let supervisor = Supervisor::new(cfg, &remote, user, remote_binary, ctx.mode, ctx.debug);
    let request = Request {
        path: cli.path.clone(),
        name: cli.name.clone(),
        machine: cli.machine.clone(),
        action,
    };
    let outcome = supervisor.run(&request)?;
    info!("{}", outcome.message().lines().next().unwrap_or_default());
    emit_outcome(ctx, action, &outcome)
}

fn clear_error(ctx: &Context, cfg: &Config) -> Result<(), CronRunnerError> {
    let sentinel = cfg.error_sentinel();
    if sentinel.exists() && !ctx.json && io::stdin().is_terminal() {
        if let Ok(reason) = fs::read_to_string(&sentinel) {
            eprintln!("{}", style(reason.trim_end()).red());
        }
        let confirmed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("Remove the error sentinel and let cron runs resume?")
            .default(true)
            .interact()
            .map_err(|err| CronRunnerError::Io(io::Error::new(io::ErrorKind::Other, err.to_string())))?;
        if !confirmed {
            println!("left {} in place", sentinel.display());
            return Ok(());
        }
    }
    let removed = match fs::remove_file(&sentinel) {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => false,
        Err(err) => return Err(CronRunnerError::Io(err)),
    };
    if removed {
        info!(sentinel = %sentinel.display(), "error sentinel cleared");
    }
    if ctx.json {
        return output(ctx, json!({"sentinel": sentinel, "removed": removed}));
    }
    if removed {
        println!("cleared {}", sentinel.display());
    } else {
        println!("no error sentinel at {}", sentinel.display());
    }
    Ok(())
}

fn emit_outcome(ctx: &Context, action: Action, outcome: &Outcome) -> Result<(), CronRunnerError> {
    if ctx.json {
        return output(ctx, serde_json::to_value(outcome)?);
    }
    // Only the cron pass stays silent; its outcome is in the supervisor log.
    if ctx.mode.is_interactive() || action != Action::EnsureRunning {
        let message = outcome.message();
        match outcome {
            Outcome::Launched { .. } | Outcome::Stopped { .. } | Outcome::HoldReleased { .. } => {
                println!("{}", style(message).green())
            }
            Outcome::Held { .. } => println!("{}", style(message).yellow()),
            _ => println!("{message}"),
        }
    }
    Ok(())
}

fn emit_list(ctx: &Context, runners: &[RunnerSummary]) -> Result<(), CronRunnerError> {
    if ctx.json {
        return output(ctx, json!({ "runners": runners }));
    }
    if runners.is_empty() {
        println!("No runners registered.");
        return Ok(());
    }
    let width = runners.iter().map(|r| r.name.len()).max().unwrap_or(4).max(4);
    println!(
        "{}",
        style(format!(
            "{:<width$}  {:<10}  {:<20}  {:<8}  PATH",
            "NAME", "STATUS", "HOST", "PID"
        ))
        .bold()
    );
    for runner in runners {
        let status = format!("{:<10}", runner.status);
        let status = match runner.status.as_str() {
            "started" => style(status).green(),
            "stopped" => style(status).yellow(),
            "unknown" => style(status).red(),
            _ => style(status),
        };
        println!(
            "{:<width$}  {}  {:<20}  {:<8}  {}",
            runner.name,
            status,
            runner.host.as_deref().unwrap_or("-"),
            runner
                .pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".to_string()),
            runner.path.display()
        );
    }
    Ok(())
}

fn handle_config(ctx: &Context, command: &ConfigCommand) -> Result<(), CronRunnerError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({"path": ctx.config_path, "created": false}));
            }
            ensure_parent(&ctx.config_path)?;
            fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            output(ctx, json!({"path": ctx.config_path, "created": true}))
        }
        ConfigCommand::Validate => {
            let _cfg = read_config(&ctx.config_path)?;
            output(ctx, json!({"path": ctx.config_path, "valid": true}))
        }
        ConfigCommand::Show => {
            let cfg = load_config(&ctx.config_path)?;
            output(ctx, serde_json::to_value(&cfg)?)
        }
    }
}

fn handle_launch(
    ctx: &Context,
    path: &Path,
    entry_point: Option<&str>,
    log: Option<&Path>,
) -> Result<(), CronRunnerError> {
    let cfg = load_config(&ctx.config_path)?;
    logging::init(ctx.mode, &cfg.supervisor_log_path());
    let entry_point = entry_point.unwrap_or(&cfg.runner.entry_point);
    let code = launcher::run_launcher(path, entry_point, log)?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn handle_stop_worker(
    ctx: &Context,
    pid: u32,
    worker_name: Option<&str>,
    timeout_sec: Option<u64>,
    poll_interval_ms: Option<u64>,
) -> Result<(), CronRunnerError> {
    let cfg = load_config(&ctx.config_path)?;
    logging::init(ctx.mode, &cfg.supervisor_log_path());
    let bounds = StopBounds {
        timeout: timeout_sec
            .map(Duration::from_secs)
            .unwrap_or_else(|| cfg.stop_timeout()),
        poll_interval: poll_interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| cfg.stop_poll_interval()),
    };
    let worker_name = worker_name.unwrap_or(&cfg.runner.worker_name);
    let table = PsProcessTable::new(current_user()?);
    let target = stop_worker(&table, pid, worker_name, bounds)?;
    output(ctx, json!({"pid": pid, "interrupted": target, "stopped": true}))
}

fn report_error(ctx: &Context, err: &CronRunnerError) -> Result<(), CronRunnerError> {
    if ctx.json {
        let payload = JsonResult::<serde_json::Value> {
            ok: false,
            result: None,
            error: Some(err.to_string()),
            error_kind: Some(err.kind().to_string()),
        };
        return print_json(&payload);
    }
    eprintln!("{err}");
    Ok(())
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), CronRunnerError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_kind: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), CronRunnerError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::tempdir;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn actions_are_mutually_exclusive() {
        let result = Cli::try_parse_from(["cron-runner", "/glade/runner", "--stop", "--resume"]);
        assert!(result.is_err());
    }

    #[test]
    fn short_flags_parse() {
        let cli = Cli::try_parse_from(["cron-runner", "-n", "gpu", "-m", "casper"]).unwrap();
        assert_eq!(cli.name.as_deref(), Some("gpu"));
        assert_eq!(cli.machine.as_deref(), Some("casper"));
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["cron-runner", "/glade/runner", "-s"]).unwrap();
        assert!(cli.stop);
        assert_eq!(cli.path, Some(PathBuf::from("/glade/runner")));
    }

    #[test]
    fn hidden_subcommands_parse() {
        let cli = Cli::try_parse_from([
            "cron-runner",
            "stop-worker",
            "42",
            "--worker-name",
            "Runner.Listener",
            "--timeout-sec",
            "5",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::StopWorker {
                pid, timeout_sec, ..
            }) => {
                assert_eq!(pid, 42);
                assert_eq!(timeout_sec, Some(5));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn sentinel_is_written_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("cron-runner.error");
        write_sentinel(&path, &CronRunnerError::Config("first".to_string())).unwrap();
        write_sentinel(&path, &CronRunnerError::Config("second".to_string())).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("configuration: config error: first"));
        assert!(!content.contains("second"));
    }

    #[test]
    fn transient_errors_do_not_trip_sentinel() {
        let dir = tempdir().unwrap();
        let sentinel = dir.path().join("cron-runner.error");
        let ctx = Context {
            config_path: dir.path().join("config.yaml"),
            json: false,
            mode: Mode::Unattended,
            debug: false,
        };
        let result = guard_fatal(
            &ctx,
            true,
            &sentinel,
            Err(CronRunnerError::Remote("ssh exited 255".to_string())),
        );
        assert!(result.is_err());
        assert!(!sentinel.exists());

        let result = guard_fatal(
            &ctx,
            true,
            &sentinel,
            Err(CronRunnerError::Config("unknown machine".to_string())),
        );
        assert!(result.is_err());
        assert!(sentinel.exists());
    }

    #[test]
    fn unattended_operator_actions_leave_sentinel_alone() {
        let dir = tempdir().unwrap();
        let sentinel = dir.path().join("cron-runner.error");
        let ctx = Context {
            config_path: dir.path().join("config.yaml"),
            json: false,
            mode: Mode::Unattended,
            debug: false,
        };
        let result = guard_fatal(
            &ctx,
            false,
            &sentinel,
            Err(CronRunnerError::Config("runner path missing".to_string())),
        );
        assert!(result.is_err());
        assert!(!sentinel.exists());
    }

    #[test]
    fn only_the_default_action_is_a_cron_pass() {
        let cli = Cli::try_parse_from(["cron-runner", "/glade/runner", "-m", "casper"]).unwrap();
        assert!(is_cron_pass(&cli));
        for flag in ["--info", "--stop", "--resume", "--list", "--clear-error"] {
            let cli = Cli::try_parse_from(["cron-runner", "/glade/runner", flag]).unwrap();
            assert!(!is_cron_pass(&cli), "{flag}");
        }
    }

    #[test]
    fn interactive_errors_leave_sentinel_alone() {
        let dir = tempdir().unwrap();
        let sentinel = dir.path().join("cron-runner.error");
        let ctx = Context {
            config_path: dir.path().join("config.yaml"),
            json: false,
            mode: Mode::Interactive,
            debug: false,
        };
        let result = guard_fatal(
            &ctx,
            true,
            &sentinel,
            Err(CronRunnerError::StopFailure("kill failed".to_string())),
        );
        assert!(result.is_err());
        assert!(!sentinel.exists());
    }
}
