//! Load balancer process supervision
//!
//! The supervisor renders the config from the current backend set and
//! launches the load balancer detached. Membership changes are applied with
//! a soft reload: a new instance is started with `-sf <old pid>` so it takes
//! over the listening sockets and lets the old instance drain and exit.
//!
//! ```text
//! Stopped -> Starting -> Running -> (Reloading -> Running)* -> Stopping -> Stopped
//! ```

use crate::backend::{BackendRecord, BackendSet};
use crate::config::BalancerConfig;
use crate::error::{ServiceError, SupervisorError, SupervisorResult};
use crate::service::{ServiceDescriptor, ServiceProcess};
use crate::template::ConfigCompiler;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Lifecycle state of the supervised load balancer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalancerState {
    Stopped,
    Starting,
    Running,
    Reloading,
    Stopping,
}

impl fmt::Display for BalancerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BalancerState::Stopped => "stopped",
            BalancerState::Starting => "starting",
            BalancerState::Running => "running",
            BalancerState::Reloading => "reloading",
            BalancerState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Supervises the load balancer process.
///
/// Designed to be shared behind an `Arc`: the health loop, the signal
/// handler and shutdown all hold it. Lifecycle operations are serialized so
/// a reload never interleaves with a start or a stop.
pub struct LoadBalancerSupervisor {
    service: ServiceProcess,
    compiler: ConfigCompiler,
    extra_args: Vec<String>,
    /// Backends rendered by the next compile
    backends: RwLock<BackendSet>,
    state: Mutex<BalancerState>,
    /// Held for the whole duration of start/reload/stop
    op_lock: tokio::sync::Mutex<()>,
}

impl LoadBalancerSupervisor {
    pub fn new(service: ServiceProcess, compiler: ConfigCompiler, extra_args: Vec<String>) -> Self {
        Self {
            service,
            compiler,
            extra_args,
            backends: RwLock::new(BackendSet::new()),
            state: Mutex::new(BalancerState::Stopped),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn from_config(config: &BalancerConfig) -> Self {
        let descriptor = ServiceDescriptor::new(
            &config.name,
            config.port,
            &config.base_dir,
            config.executable_name(),
        );
        if descriptor.executable().is_none() {
            warn!(
                executable = config.executable_name(),
                "Load balancer executable not found on PATH"
            );
        }
        let service = ServiceProcess::new(descriptor, config.stop_signal)
            .with_log_sink(config.log_sink());
        let compiler =
            ConfigCompiler::new(&config.template_path, &config.config_path, config.port);
        Self::new(service, compiler, config.extra_args.clone())
    }

    pub fn state(&self) -> BalancerState {
        *self.state.lock()
    }

    pub fn service(&self) -> &ServiceProcess {
        &self.service
    }

    pub fn config_path(&self) -> &Path {
        self.compiler.target_path()
    }

    /// Snapshot of the backend set used by the next compile
    pub fn backends(&self) -> BackendSet {
        self.backends.read().clone()
    }

    /// Queue a backend for the next compile. Does not reload.
    pub fn add_backend(&self, record: BackendRecord) -> bool {
        let mut backends = self.backends.write();
        let id = record.id.clone();
        if !backends.push(record) {
            warn!(backend_id = %id, "Backend already registered, ignoring");
            return false;
        }
        info!(
            backend_id = %id,
            total_backends = backends.len(),
            "Added backend to load balancer"
        );
        true
    }

    /// Compile the config and launch the load balancer.
    ///
    /// Fire-and-forget: `Running` is reached as soon as the launch returns.
    pub async fn start(&self) -> SupervisorResult<()> {
        let _guard = self.op_lock.lock().await;
        self.transition(BalancerState::Stopped, BalancerState::Starting, "start")?;

        match self.launch(None) {
            Ok(pid) => {
                self.set_state(BalancerState::Running);
                info!(
                    service = self.service.descriptor().name(),
                    pid,
                    "Load balancer launched"
                );
                Ok(())
            }
            Err(e) => {
                self.set_state(BalancerState::Stopped);
                error!(error = %e, "Failed to start load balancer");
                Err(e)
            }
        }
    }

    /// Soft reload onto the current backend set.
    ///
    /// Only valid while running. If the old PID cannot be read the reload is
    /// aborted before anything is touched and the old instance keeps serving.
    pub async fn reload(&self) -> SupervisorResult<()> {
        let _guard = self.op_lock.lock().await;
        self.transition(BalancerState::Running, BalancerState::Reloading, "reload")?;

        let result = self
            .service
            .read_pid()
            .map_err(SupervisorError::from)
            .and_then(|old_pid| self.launch(Some(old_pid)).map(|pid| (old_pid, pid)));
        self.set_state(BalancerState::Running);

        match result {
            Ok((old_pid, pid)) => {
                info!(old_pid, pid, "Load balancer soft reload launched");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Soft reload aborted, previous instance keeps running");
                Err(e)
            }
        }
    }

    /// Best-effort stop. Always ends in `Stopped`.
    pub async fn stop(&self) {
        let _guard = self.op_lock.lock().await;
        self.set_state(BalancerState::Stopping);
        self.service.stop();
        self.set_state(BalancerState::Stopped);
    }

    fn transition(
        &self,
        from: BalancerState,
        to: BalancerState,
        operation: &'static str,
    ) -> SupervisorResult<()> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(SupervisorError::IllegalTransition {
                from: *state,
                operation,
            });
        }
        *state = to;
        Ok(())
    }

    fn set_state(&self, state: BalancerState) {
        *self.state.lock() = state;
    }

    fn launch(&self, takeover_from: Option<i32>) -> SupervisorResult<u32> {
        if takeover_from.is_none() {
            self.service.start()?;
        }

        let descriptor = self.service.descriptor();
        let executable = descriptor
            .executable()
            .ok_or_else(|| ServiceError::ExecutableNotFound(descriptor.name().to_string()))?
            .to_path_buf();

        let backends = self.backends();
        let artifact = self.compiler.compile(backends.as_slice())?;

        let command = self.command(&executable, &artifact.path, takeover_from);
        Ok(self.service.launch_detached(&command)?)
    }

    /// `<exe> -f <config> -p <pidfile> [extra..] [-sf <old pid>]`
    fn command(&self, executable: &Path, config: &Path, takeover_from: Option<i32>) -> Vec<String> {
        let display = |p: &Path| p.to_string_lossy().into_owned();
        let mut command = vec![
            display(executable),
            "-f".to_string(),
            display(config),
            "-p".to_string(),
            display(self.service.descriptor().pid_file()),
        ];
        command.extend(self.extra_args.iter().cloned());
        if let Some(pid) = takeover_from {
            command.push("-sf".to_string());
            command.push(pid.to_string());
        }
        command
    }

    pub fn pid_file(&self) -> PathBuf {
        self.service.descriptor().pid_file().to_path_buf()
    }
}
