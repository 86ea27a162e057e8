//! External command execution for the audio control planes.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use btsink_core::AudioError;
use tokio::process::Command;
use tracing::{debug, trace};

/// How long a control-plane command may run before it is killed.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Captured result of an external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs control-plane commands (enables mocking in tests).
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait CommandRunner: Send + Sync {
    /// Check whether `program` can be found on `PATH`.
    fn is_available(&self, program: &str) -> bool;

    /// Run `program` with `args` and capture its output.
    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;
}

/// Runs commands on the host.
///
/// When started from a system service there is usually no user session
/// environment, so the audio server sockets cannot be found. The runner fills
/// in `XDG_RUNTIME_DIR`, `PULSE_RUNTIME_PATH` and `PIPEWIRE_RUNTIME_DIR` when
/// they are missing.
///
/// Commands that run longer than the timeout are killed and reported as
/// [`io::ErrorKind::TimedOut`].
#[derive(Debug, Clone)]
pub struct SystemRunner {
    env: Vec<(String, String)>,
    timeout: Duration,
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemRunner {
    pub fn new() -> Self {
        let uid = unsafe { libc::getuid() };
        let env = session_env(
            std::env::var_os("XDG_RUNTIME_DIR").map(PathBuf::from),
            std::env::var_os("PULSE_RUNTIME_PATH").is_some(),
            std::env::var_os("PIPEWIRE_RUNTIME_DIR").is_some(),
            uid,
            |p| p.exists(),
        );
        if !env.is_empty() {
            debug!("Audio command environment overrides: {:?}", env);
        }
        Self {
            env,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Compute environment overrides needed to reach the session audio server.
fn session_env(
    runtime_dir: Option<PathBuf>,
    has_pulse_path: bool,
    has_pipewire_dir: bool,
    uid: u32,
    exists: impl Fn(&Path) -> bool,
) -> Vec<(String, String)> {
    let mut env = Vec::new();

    let runtime_dir = match runtime_dir {
        Some(dir) => Some(dir),
        None => {
            let found = [
                PathBuf::from(format!("/run/user/{}", uid)),
                PathBuf::from(format!("/tmp/pulse-{}", uid)),
            ]
            .into_iter()
            .find(|p| exists(p));
            if let Some(dir) = &found {
                env.push(("XDG_RUNTIME_DIR".to_string(), dir.display().to_string()));
            }
            found
        }
    };

    let Some(runtime_dir) = runtime_dir else {
        return env;
    };

    if !has_pulse_path {
        let pulse = runtime_dir.join("pulse");
        if exists(&pulse) {
            env.push(("PULSE_RUNTIME_PATH".to_string(), pulse.display().to_string()));
        }
    }

    if !has_pipewire_dir {
        env.push((
            "PIPEWIRE_RUNTIME_DIR".to_string(),
            runtime_dir.display().to_string(),
        ));
    }

    env
}

#[async_trait]
impl CommandRunner for SystemRunner {
    fn is_available(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }

    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        trace!("Running {} {:?}", program, args);

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Dropping the pending output future kills the child.
        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("{} did not finish within {:?}", program, self.timeout),
                ))
            }
        };

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run a command and return its stdout, mapping failures to [`AudioError`].
///
/// A program missing from the system means the control plane went away and is
/// reported as [`AudioError::Unavailable`]. A command that hung is a backend
/// error.
pub(crate) async fn run_checked(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[&str],
) -> Result<String, AudioError> {
    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    let command = format!("{} {}", program, args.join(" "));

    let output = runner.run(program, &args).await.map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => AudioError::Unavailable,
        io::ErrorKind::TimedOut => AudioError::backend(&command, "timed out"),
        _ => AudioError::backend(&command, e.to_string()),
    })?;

    if !output.success() {
        let message = match output.stderr.trim() {
            "" => match output.code {
                Some(code) => format!("exit status {}", code),
                None => "terminated by signal".to_string(),
            },
            stderr => stderr.to_string(),
        };
        return Err(AudioError::backend(command, message));
    }

    Ok(output.stdout)
}
