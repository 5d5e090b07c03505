//! Process Supervisor: launches a tool subprocess, classifies its output,
//! and enforces timeout/cancellation/exit-code contracts.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use async_process::{Command, Stdio};
use futures::AsyncBufReadExt as _;
use futures::io::BufReader as AsyncBufReader;
use regex::Regex;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader as TokioBufReader};
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::console::Console;
use crate::error::{Result, XedaError};
use crate::util::broadcast_lines;

/// Keeps a tool's spinner alive for the duration of `run_supervised`,
/// retitling it on each `StepBegin` and clearing it on every exit path.
struct SpinnerGuard(indicatif::ProgressBar);

impl SpinnerGuard {
    fn new(tool_name: String) -> Self {
        SpinnerGuard(Console::spinner(tool_name))
    }

    fn set_message(&self, msg: String) {
        self.0.set_message(msg);
    }
}

impl Drop for SpinnerGuard {
    fn drop(&mut self) {
        self.0.finish_and_clear();
    }
}

fn warning_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\s*(critical\s+)?warning:?\s+").unwrap())
}

fn error_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\s*error:?\s+").unwrap())
}

fn step_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^={2,}.*\(\s*([A-Za-z0-9_]+)\s*\).*={2,}$").unwrap())
}

fn echo_on_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^={2,}.*\(\s*\*ENABLE ECHO\*\s*\).*={2,}$").unwrap())
}

fn echo_off_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^={2,}.*\(\s*\*DISABLE ECHO\*\s*\).*={2,}$").unwrap())
}

/// What a single line of tool output was classified as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    Plain(String),
    Warning(String),
    Error(String),
    StepBegin(String),
    EchoOn,
    EchoOff,
}

/// Classifies one line per the warning/error/step-marker/echo-toggle rules.
pub fn classify(line: &str) -> Classified {
    if echo_on_re().is_match(line) {
        Classified::EchoOn
    } else if echo_off_re().is_match(line) {
        Classified::EchoOff
    } else if let Some(caps) = step_re().captures(line) {
        Classified::StepBegin(caps[1].to_string())
    } else if warning_re().is_match(line) {
        Classified::Warning(line.to_string())
    } else if error_re().is_match(line) {
        Classified::Error(line.to_string())
    } else {
        Classified::Plain(line.to_string())
    }
}

/// A docker image to run the tool inside of instead of the host PATH.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub image: String,
    /// `(host_path, container_path)` bind mounts, always including the cwd.
    pub mounts: Vec<(PathBuf, PathBuf)>,
}

/// One subprocess invocation to run under supervision.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub tool_name: String,
    pub executable: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
    pub timeout: Duration,
    pub dockerized: Option<DockerConfig>,
    /// File the combined stdout is tee'd to, relative to `cwd`.
    pub stdout_log: PathBuf,
    pub print_commands: bool,
}

/// Resolved outcome of a supervised run: exit code plus however many
/// trailing stderr lines were kept for error reporting.
pub struct ProcessOutcome {
    pub exit_code: i32,
    pub stderr_tail: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

const STDERR_TAIL_LEN: usize = 20;

/// Resolves `exec` to an invocable command line: a PATH lookup normally,
/// or a `docker run` wrapper when `docker` is configured.
fn resolve_command(spec: &ProcessSpec) -> Result<(String, Vec<String>)> {
    match &spec.dockerized {
        None => {
            let found = which_on_path(&spec.executable).ok_or_else(|| XedaError::ExecutableMissing {
                exec: spec.executable.clone(),
                tool: spec.tool_name.clone(),
                searched: std::env::var("PATH").unwrap_or_default(),
            })?;
            Ok((found, spec.args.clone()))
        }
        Some(docker) => {
            let mut args = vec![
                "run".to_string(),
                "--rm".to_string(),
                "-v".to_string(),
                format!("{}:{}", spec.cwd.display(), "/work"),
                "-w".to_string(),
                "/work".to_string(),
            ];
            for (host, container) in &docker.mounts {
                args.push("-v".to_string());
                args.push(format!("{}:{}", host.display(), container.display()));
            }
            args.push(docker.image.clone());
            args.push(spec.executable.clone());
            args.extend(spec.args.clone());
            Ok(("docker".to_string(), args))
        }
    }
}

fn which_on_path(exec: &str) -> Option<String> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(exec);
        if candidate.is_file() {
            return Some(candidate.to_string_lossy().to_string());
        }
    }
    None
}

/// Runs `spec` to completion, tee-ing and classifying its stdout, enforcing
/// `spec.timeout`, and observing `cancel` for an external cancellation
/// request (e.g. the top-level Ctrl+C handler).
pub async fn run_supervised(spec: ProcessSpec, mut cancel: watch::Receiver<bool>) -> Result<ProcessOutcome> {
    let (program, args) = resolve_command(&spec)?;

    if spec.print_commands {
        Console::println(format!("$ {program} {}", args.join(" ")));
    }

    let mut command = Command::new(&program);
    command
        .args(&args)
        .current_dir(&spec.cwd)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(XedaError::Io)?;
    let pid = child.id();

    let log_path = spec.cwd.join(&spec.stdout_log);
    let mut log_file = tokio::fs::File::create(&log_path).await.map_err(XedaError::Io)?;

    let stdout = AsyncBufReader::new(child.stdout.take().expect("piped stdout")).lines();
    let stderr_reader = TokioBufReader::new(TokioCompat(child.stderr.take().expect("piped stderr")));

    let tool_name = spec.tool_name.clone();
    let broadcast = broadcast_lines(stdout, move |line| debug!(tool = %tool_name, "{line}"));
    let mut plain_rx = broadcast.receive(None);

    let spinner = SpinnerGuard::new(spec.tool_name.clone());

    let (classified_tx, mut classified_rx) = tokio::sync::mpsc::unbounded_channel::<Classified>();
    let stdout_classifier = tokio::spawn(async move {
        while let Some(line) = plain_rx.recv().await {
            let _ = classified_tx.send(classify(&line));
        }
    });

    let stderr_tail_handle: tokio::task::JoinHandle<Vec<String>> = tokio::spawn(async move {
        let mut lines = stderr_reader.lines();
        let mut tail = std::collections::VecDeque::with_capacity(STDERR_TAIL_LEN);
        while let Ok(Some(line)) = lines.next_line().await {
            if tail.len() == STDERR_TAIL_LEN {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail.into_iter().collect()
    });

    let mut warnings = Vec::new();
    let mut errors = Vec::new();
    let mut echo = true;
    let mut log_buf = String::new();

    let classify_loop = async {
        while let Some(event) = classified_rx.recv().await {
            match &event {
                Classified::Plain(line) => {
                    log_buf.push_str(line);
                    log_buf.push('\n');
                    if echo {
                        Console::println(line.clone());
                    }
                }
                Classified::Warning(line) => {
                    warn!("{line}");
                    warnings.push(line.clone());
                    log_buf.push_str(line);
                    log_buf.push('\n');
                }
                Classified::Error(line) => {
                    error!("{line}");
                    errors.push(line.clone());
                    log_buf.push_str(line);
                    log_buf.push('\n');
                }
                Classified::StepBegin(name) => {
                    Console::println(format!("=== {name} ==="));
                    spinner.set_message(name.clone());
                }
                Classified::EchoOn => echo = true,
                Classified::EchoOff => echo = false,
            }
        }
    };

    let deadline = tokio::time::sleep(spec.timeout);
    tokio::pin!(deadline);

    let wait_result = tokio::select! {
        _ = classify_loop => {
            child.status().await.map_err(XedaError::Io)
        }
        _ = &mut deadline => {
            let _ = kill_process_group(pid);
            let _ = child.status().await;
            let _ = log_file.write_all(log_buf.as_bytes()).await;
            return Err(XedaError::TimeoutExceeded {
                command: std::iter::once(program).chain(args).collect(),
                timeout_seconds: spec.timeout.as_secs(),
            });
        }
        _ = wait_for_cancel(&mut cancel) => {
            let _ = kill_process_group(pid);
            let _ = child.status().await;
            let _ = log_file.write_all(log_buf.as_bytes()).await;
            return Err(XedaError::Cancelled);
        }
    };

    let _ = stdout_classifier.await;
    let stderr_tail = stderr_tail_handle.await.unwrap_or_default();
    let _ = log_file.write_all(log_buf.as_bytes()).await;

    let status = wait_result?;
    let exit_code = exit_code_of(status);

    if exit_code != 0 {
        return Err(XedaError::ToolNonZeroExit {
            command: std::iter::once(spec.executable.clone()).chain(spec.args.clone()).collect(),
            code: exit_code,
            stderr_tail: stderr_tail.clone(),
        });
    }

    Ok(ProcessOutcome { exit_code, stderr_tail, warnings, errors })
}

async fn wait_for_cancel(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) -> std::io::Result<()> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;
    let pid = Pid::from_raw(pid as i32);
    if signal::kill(pid, Signal::SIGTERM).is_ok() {
        std::thread::sleep(Duration::from_millis(500));
        let _ = signal::kill(pid, Signal::SIGKILL);
    }
    Ok(())
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal().map(|s| 128 + s)).unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Bridges an `async_process` (futures-io) pipe to a `tokio::io::AsyncRead`
/// without pulling in `tokio-util`'s compat layer for a single call site.
struct TokioCompat<T>(T);

impl<T: futures::AsyncRead + Unpin> tokio::io::AsyncRead for TokioCompat<T> {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let unfilled = buf.initialize_unfilled();
        match std::pin::Pin::new(&mut self.0).poll_read(cx, unfilled) {
            std::task::Poll::Ready(Ok(n)) => {
                buf.advance(n);
                std::task::Poll::Ready(Ok(()))
            }
            std::task::Poll::Ready(Err(e)) => std::task::Poll::Ready(Err(e)),
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_warning_error_and_step_lines() {
        assert_eq!(
            classify("WARNING: clock uncertainty not set"),
            Classified::Warning("WARNING: clock uncertainty not set".to_string())
        );
        assert_eq!(
            classify("Error: unresolved reference 'foo'"),
            Classified::Error("Error: unresolved reference 'foo'".to_string())
        );
        assert_eq!(
            classify("==== ( SYNTH ) ===="),
            Classified::StepBegin("SYNTH".to_string())
        );
        assert_eq!(classify("==== ( *ENABLE ECHO* ) ===="), Classified::EchoOn);
        assert_eq!(classify("==== ( *DISABLE ECHO* ) ===="), Classified::EchoOff);
        assert_eq!(
            classify("just a normal line"),
            Classified::Plain("just a normal line".to_string())
        );
    }

    #[test]
    fn resolve_command_fails_when_executable_missing() {
        let spec = ProcessSpec {
            tool_name: "nonexistent_tool".to_string(),
            executable: "definitely_not_a_real_executable_xyz".to_string(),
            args: vec![],
            env: BTreeMap::new(),
            cwd: PathBuf::from("."),
            timeout: Duration::from_secs(1),
            dockerized: None,
            stdout_log: PathBuf::from("out.log"),
            print_commands: false,
        };
        let err = resolve_command(&spec).unwrap_err();
        assert!(matches!(err, XedaError::ExecutableMissing { .. }));
    }

    #[test]
    fn dockerized_resolution_wraps_in_docker_run() {
        let spec = ProcessSpec {
            tool_name: "yosys".to_string(),
            executable: "yosys".to_string(),
            args: vec!["-p".to_string(), "synth".to_string()],
            env: BTreeMap::new(),
            cwd: PathBuf::from("/work"),
            timeout: Duration::from_secs(1),
            dockerized: Some(DockerConfig {
                image: "xeda/yosys:latest".to_string(),
                mounts: vec![],
            }),
            stdout_log: PathBuf::from("out.log"),
            print_commands: false,
        };
        let (program, args) = resolve_command(&spec).unwrap();
        assert_eq!(program, "docker");
        assert!(args.contains(&"xeda/yosys:latest".to_string()));
        assert!(args.contains(&"yosys".to_string()));
    }
}
