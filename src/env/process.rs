//! Process handles for commands launched inside an environment.

use crate::{AtelierError, Result};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

/// Everything needed to launch one process inside an environment.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub command: Vec<String>,
    /// Injected as environment variables; never logged.
    pub secrets: HashMap<String, String>,
    pub cwd: Option<String>,
    pub run_as_root: bool,
    /// When set, the process is killed once the signal fires.
    pub shutdown: Option<watch::Receiver<bool>>,
    pub timeout: Option<Duration>,
    /// When true, a nonzero exit code raises `Process` from `wait`.
    pub is_checked: bool,
}

impl ProcessSpec {
    pub fn new(command: impl IntoIterator<Item = impl Into<String>>) -> Self {
        ProcessSpec {
            command: command.into_iter().map(Into::into).collect(),
            secrets: HashMap::new(),
            cwd: None,
            run_as_root: false,
            shutdown: None,
            timeout: None,
            is_checked: true,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_secrets(mut self, secrets: HashMap<String, String>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn unchecked(mut self) -> Self {
        self.is_checked = false;
        self
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }
}

/// A handle to a process running inside an environment.
///
/// Output is captured continuously; `read_stdout`/`read_stderr` return what
/// has accumulated so far, while `stream_stdout`/`stream_stderr` subscribe
/// to lines as they arrive.
#[derive(Debug)]
pub struct RunningProcess {
    command: Vec<String>,
    pub is_checked: bool,
    child: Arc<tokio::sync::Mutex<Child>>,
    pid: Option<u32>,
    stdout_buffer: Arc<Mutex<String>>,
    stderr_buffer: Arc<Mutex<String>>,
    stdout_lines: broadcast::Sender<String>,
    stderr_lines: broadcast::Sender<String>,
    returncode: Arc<Mutex<Option<i32>>>,
}

impl RunningProcess {
    /// Spawn the process on the host. Providers that run commands on a bare
    /// filesystem call this directly; container providers wrap their exec
    /// plumbing into the same handle shape.
    pub fn spawn_local(spec: ProcessSpec) -> Result<Self> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| AtelierError::Validation("empty command".to_string()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &spec.secrets {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| AtelierError::EnvironmentCrashed {
            message: format!("failed to spawn {program}: {e}"),
        })?;
        let pid = child.id();

        let stdout_buffer = Arc::new(Mutex::new(String::new()));
        let stderr_buffer = Arc::new(Mutex::new(String::new()));
        let (stdout_lines, _) = broadcast::channel(1024);
        let (stderr_lines, _) = broadcast::channel(1024);

        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, stdout_buffer.clone(), stdout_lines.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, stderr_buffer.clone(), stderr_lines.clone());
        }

        let child = Arc::new(tokio::sync::Mutex::new(child));
        let returncode = Arc::new(Mutex::new(None));

        if spec.timeout.is_some() || spec.shutdown.is_some() {
            spawn_watchdog(child.clone(), spec.timeout, spec.shutdown.clone(), pid);
        }

        Ok(RunningProcess {
            command: spec.command,
            is_checked: spec.is_checked,
            child,
            pid,
            stdout_buffer,
            stderr_buffer,
            stdout_lines,
            stderr_lines,
            returncode,
        })
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Check for exit without blocking.
    pub async fn poll(&self) -> Option<i32> {
        if let Some(code) = self.returncode() {
            return Some(code);
        }
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(Some(status)) => {
                let code = status.code().unwrap_or(-1);
                *self.returncode.lock().unwrap() = Some(code);
                Some(code)
            }
            _ => None,
        }
    }

    /// Wait for exit. `Process` is raised when checked and exit is nonzero.
    pub async fn wait(&self) -> Result<i32> {
        let code = {
            let mut child = self.child.lock().await;
            match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    return Err(AtelierError::EnvironmentCrashed {
                        message: format!("wait failed for {:?}: {e}", self.command),
                    })
                }
            }
        };
        *self.returncode.lock().unwrap() = Some(code);
        if self.is_checked && code != 0 {
            return Err(self.to_process_error(code));
        }
        Ok(code)
    }

    /// Wait at most `timeout`; Ok(None) when still running at expiry.
    pub async fn wait_with_timeout(&self, timeout: Duration) -> Result<Option<i32>> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Terminate the process. With a positive grace period, a SIGTERM is
    /// sent first and the hard kill follows only if the process is still
    /// alive at expiry; grace zero hard-kills immediately.
    pub async fn terminate(&self, grace_seconds: f64) -> Result<()> {
        if self.returncode().is_some() {
            return Ok(());
        }
        if grace_seconds > 0.0 {
            if let Some(pid) = self.pid {
                send_sigterm(pid);
            }
            if self
                .wait_with_timeout(Duration::from_secs_f64(grace_seconds))
                .await
                .unwrap_or(None)
                .is_some()
            {
                return Ok(());
            }
            debug!("process {:?} survived SIGTERM, killing", self.command);
        }
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            warn!("failed to kill {:?}: {}", self.command, e);
        }
        if let Ok(status) = child.wait().await {
            *self.returncode.lock().unwrap() = Some(status.code().unwrap_or(-1));
        }
        Ok(())
    }

    pub fn read_stdout(&self) -> String {
        self.stdout_buffer.lock().unwrap().clone()
    }

    pub fn read_stderr(&self) -> String {
        self.stderr_buffer.lock().unwrap().clone()
    }

    /// Subscribe to stdout lines as they arrive. Lines read before the
    /// subscription are only available through `read_stdout`.
    pub fn stream_stdout(&self) -> broadcast::Receiver<String> {
        self.stdout_lines.subscribe()
    }

    pub fn stream_stderr(&self) -> broadcast::Receiver<String> {
        self.stderr_lines.subscribe()
    }

    pub fn returncode(&self) -> Option<i32> {
        *self.returncode.lock().unwrap()
    }

    pub fn is_finished(&self) -> bool {
        self.returncode().is_some()
    }

    pub fn to_process_error(&self, code: i32) -> AtelierError {
        AtelierError::Process {
            command: self.command.join(" "),
            returncode: Some(code),
            stdout: self.read_stdout(),
            stderr: self.read_stderr(),
        }
    }
}

fn spawn_reader<R>(
    reader: R,
    buffer: Arc<Mutex<String>>,
    lines_tx: broadcast::Sender<String>,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            {
                let mut buf = buffer.lock().unwrap();
                buf.push_str(&line);
                buf.push('\n');
            }
            // Nobody listening is fine; the buffer still accumulates.
            let _ = lines_tx.send(line);
        }
    });
}

fn spawn_watchdog(
    child: Arc<tokio::sync::Mutex<Child>>,
    timeout: Option<Duration>,
    shutdown: Option<watch::Receiver<bool>>,
    pid: Option<u32>,
) {
    tokio::spawn(async move {
        let expired = async {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending().await,
            }
        };
        let signaled = async {
            match shutdown {
                Some(mut rx) => {
                    while !*rx.borrow() {
                        if rx.changed().await.is_err() {
                            std::future::pending::<()>().await;
                        }
                    }
                }
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = expired => {
                debug!("process timeout expired, terminating pid {:?}", pid);
            }
            _ = signaled => {
                debug!("shutdown signaled, terminating pid {:?}", pid);
            }
        }
        if let Some(pid) = pid {
            send_sigterm(pid);
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        let mut child = child.lock().await;
        let _ = child.kill().await;
    });
}

fn send_sigterm(pid: u32) {
    // SAFETY: plain signal dispatch to a pid we spawned.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}
