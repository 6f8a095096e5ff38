//! Lifecycle wrapper for supervised OS processes
//!
//! A service owns a fixed directory layout under a base directory
//! (`<base>/{lib,run,log}/<name>`) and a PID file at
//! `<base>/run/<name>/<port>.pid` written by the process it launches.

use crate::config::StopSignal;
use crate::error::{ServiceError, ServiceResult};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Identity of a supervised process. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    name: String,
    port: u16,
    base_dir: PathBuf,
    pid_file: PathBuf,
    data_directory: PathBuf,
    executable: Option<PathBuf>,
}

impl ServiceDescriptor {
    /// Build a descriptor, resolving `executable` once via [`locate_executable`]
    pub fn new(name: &str, port: u16, base_dir: impl Into<PathBuf>, executable: &str) -> Self {
        let base_dir = base_dir.into();
        let pid_file = base_dir
            .join("run")
            .join(name)
            .join(format!("{}.pid", port));
        let data_directory = base_dir.join("lib").join(name);
        Self {
            name: name.to_string(),
            port,
            base_dir,
            pid_file,
            data_directory,
            executable: locate_executable(executable),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    pub fn data_directory(&self) -> &Path {
        &self.data_directory
    }

    /// Resolved executable, `None` when it was not found at construction
    pub fn executable(&self) -> Option<&Path> {
        self.executable.as_deref()
    }

    /// The lib, run and log directories for this service
    pub fn directories(&self) -> [PathBuf; 3] {
        ["lib", "run", "log"].map(|kind| self.base_dir.join(kind).join(&self.name))
    }
}

/// Result of a stop attempt that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No PID file, nothing to stop
    NotRunning,
    /// The process recorded in the PID file was signalled
    Signalled(i32),
}

/// Generic start/stop/detach semantics shared by every supervised process
#[derive(Debug)]
pub struct ServiceProcess {
    descriptor: ServiceDescriptor,
    stop_signal: StopSignal,
    log_sink: Option<String>,
}

impl ServiceProcess {
    pub fn new(descriptor: ServiceDescriptor, stop_signal: StopSignal) -> Self {
        Self {
            descriptor,
            stop_signal,
            log_sink: None,
        }
    }

    /// Pipe stdout/stderr of launched processes into `command -t <name>`
    pub fn with_log_sink(mut self, command: Option<&str>) -> Self {
        self.log_sink = command.map(str::to_string);
        self
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Create the lib/run/log directories if they are missing
    pub fn ensure_directories(&self) -> ServiceResult<()> {
        for path in self.descriptor.directories() {
            std::fs::create_dir_all(&path)
                .map_err(|source| ServiceError::Filesystem { path, source })?;
        }
        Ok(())
    }

    /// Log intent and prepare directories. Launching is left to the caller.
    pub fn start(&self) -> ServiceResult<()> {
        self.ensure_directories()?;
        info!(
            service = self.descriptor.name(),
            port = self.descriptor.port(),
            "Starting service"
        );
        Ok(())
    }

    /// Best-effort stop: failures are logged and never propagated
    pub fn stop(&self) {
        let service = self.descriptor.name();
        let port = self.descriptor.port();
        info!(service, port, "Stopping service");

        match self.try_stop() {
            Ok(StopOutcome::NotRunning) => {
                info!(service, port, "Service was not running");
            }
            Ok(StopOutcome::Signalled(pid)) => {
                info!(service, port, pid, signal = self.stop_signal.name(), "Service signalled");
            }
            Err(e) => {
                warn!(service, port, error = %e, "Couldn't stop service");
            }
        }
    }

    /// Signal the process named by the PID file
    pub fn try_stop(&self) -> ServiceResult<StopOutcome> {
        let pid = match self.read_pid() {
            Ok(pid) => pid,
            Err(ServiceError::PidFile { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                return Ok(StopOutcome::NotRunning);
            }
            Err(e) => return Err(e),
        };

        match signal_process(pid, self.stop_signal) {
            Ok(()) => {
                self.remove_pid_file();
                Ok(StopOutcome::Signalled(pid))
            }
            Err(ServiceError::Signal { pid, source }) if is_no_such_process(&source) => {
                // Stale PID file, the process is already gone
                self.remove_pid_file();
                Err(ServiceError::Signal { pid, source })
            }
            Err(e) => Err(e),
        }
    }

    /// Read and parse the PID file
    pub fn read_pid(&self) -> ServiceResult<i32> {
        let path = self.descriptor.pid_file();
        let contents = std::fs::read_to_string(path).map_err(|source| ServiceError::PidFile {
            path: path.to_path_buf(),
            source,
        })?;
        parse_pid(&contents).ok_or_else(|| ServiceError::InvalidPid {
            path: path.to_path_buf(),
            contents: contents.trim().to_string(),
        })
    }

    fn remove_pid_file(&self) {
        let path = self.descriptor.pid_file();
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to remove PID file");
            }
        }
    }

    /// Spawn `command` in its own process group and let it go.
    ///
    /// Returns once the spawn has been initiated. The handle is dropped right
    /// away: the runtime reaps the child and its exit is never reported to
    /// the caller. Must be called from within a tokio runtime.
    pub fn launch_detached(&self, command: &[String]) -> ServiceResult<u32> {
        let rendered = shell_words::join(command);
        let Some((program, args)) = command.split_first() else {
            return Err(ServiceError::Spawn {
                command: rendered,
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
            });
        };

        debug!(command = %rendered, "Running");

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        detach_from_group(&mut cmd);

        match self.open_log_sink() {
            Some((stdout, stderr)) => {
                cmd.stdout(stdout);
                cmd.stderr(stderr);
            }
            None => {
                cmd.stdout(Stdio::null());
                cmd.stderr(Stdio::null());
            }
        }

        let child = cmd.spawn().map_err(|source| ServiceError::Spawn {
            command: rendered,
            source,
        })?;
        // Only absent once the child has been awaited, which never happens here
        Ok(child.id().unwrap_or_default())
    }

    /// Start the log sink process and hand back two handles to its stdin
    fn open_log_sink(&self) -> Option<(Stdio, Stdio)> {
        let sink = self.log_sink.as_deref()?;
        let Some(path) = locate_executable(sink) else {
            warn!(command = sink, "Log sink not found, discarding service output");
            return None;
        };

        let mut cmd = Command::new(path);
        cmd.arg("-t").arg(self.descriptor.name());
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        detach_from_group(&mut cmd);

        let mut logger = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(command = sink, error = %e, "Failed to start log sink");
                return None;
            }
        };
        let stdin = logger.stdin.take()?;
        split_stdio(stdin)
    }
}

#[cfg(unix)]
fn split_stdio(stdin: tokio::process::ChildStdin) -> Option<(Stdio, Stdio)> {
    // Handed back in blocking mode, as the children expect
    let stdout = match stdin.into_owned_fd() {
        Ok(fd) => fd,
        Err(e) => {
            warn!(error = %e, "Failed to take log sink handle");
            return None;
        }
    };
    match stdout.try_clone() {
        Ok(stderr) => Some((Stdio::from(stdout), Stdio::from(stderr))),
        Err(e) => {
            warn!(error = %e, "Failed to duplicate log sink handle");
            None
        }
    }
}

#[cfg(not(unix))]
fn split_stdio(stdin: tokio::process::ChildStdin) -> Option<(Stdio, Stdio)> {
    let stdout: Stdio = stdin.try_into().ok()?;
    Some((stdout, Stdio::null()))
}

/// Put the child in a new process group so signals aimed at the
/// supervisor's group (e.g. Ctrl+C) do not reach it
fn detach_from_group(cmd: &mut Command) {
    #[cfg(unix)]
    cmd.process_group(0);
    #[cfg(not(unix))]
    let _ = cmd;
}

fn parse_pid(contents: &str) -> Option<i32> {
    // kill(0) and kill(-n) address process groups, never accept them
    contents.trim().parse::<i32>().ok().filter(|pid| *pid > 0)
}

fn is_no_such_process(err: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::ESRCH)
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}

/// Deliver `signal` to `pid`
pub fn signal_process(pid: i32, signal: StopSignal) -> ServiceResult<()> {
    #[cfg(unix)]
    {
        let rc = unsafe { libc::kill(pid, signal.as_raw()) };
        if rc != 0 {
            return Err(ServiceError::Signal {
                pid,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let _ = signal;
        Err(ServiceError::Signal {
            pid,
            source: std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "signals are not supported on this platform",
            ),
        })
    }
}

/// Resolve an executable name to a path using `PATH`.
///
/// Names containing a path separator are checked as-is. Returns `None`
/// instead of failing when nothing executable is found.
pub fn locate_executable(name: &str) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }

    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let search_path = std::env::var_os("PATH")?;
    std::env::split_paths(&search_path)
        .map(|dir| dir.join(name))
        .find(|path| is_executable(path))
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}
