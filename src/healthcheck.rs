//! Fleet health loop
//!
//! Registers the backends, starts the load balancer, then probes every
//! backend on a fixed interval and restarts the ones that fail.

use crate::backend::Backend;
use crate::config::MonitorConfig;
use crate::error::SupervisorResult;
use crate::loadbalancer::LoadBalancerSupervisor;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Tracks consecutive probe results for a backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendHealthState {
    pub consecutive_failures: u32,
    pub restarts: u64,
    pub is_healthy: bool,
}

/// Outcome of one monitoring cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub checked: usize,
    pub healthy: usize,
    /// Ids of the backends restarted this cycle, in completion order
    pub restarted: Vec<String>,
    /// Check tasks that panicked or were cancelled
    pub failed_tasks: usize,
}

/// Drives registration, load balancer start-up and periodic monitoring
pub struct FleetHealthLoop<B: Backend> {
    supervisor: Arc<LoadBalancerSupervisor>,
    backends: Vec<Arc<B>>,
    warmup: Duration,
    interval: Duration,
    limiter: Arc<Semaphore>,
    health_states: Arc<DashMap<String, BackendHealthState>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<B: Backend> FleetHealthLoop<B> {
    pub fn new(
        supervisor: Arc<LoadBalancerSupervisor>,
        config: &MonitorConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            supervisor,
            backends: Vec::new(),
            warmup: config.warmup(),
            interval: config.interval(),
            limiter: Arc::new(Semaphore::new(config.max_concurrent_probes.max(1))),
            health_states: Arc::new(DashMap::new()),
            shutdown_rx,
        }
    }

    pub fn supervisor(&self) -> &Arc<LoadBalancerSupervisor> {
        &self.supervisor
    }

    pub fn backends(&self) -> &[Arc<B>] {
        &self.backends
    }

    pub fn health_state(&self, backend_id: &str) -> Option<BackendHealthState> {
        self.health_states.get(backend_id).map(|s| s.clone())
    }

    /// Add a backend to the load balancer's set and start it.
    ///
    /// Returns false, without starting anything, when the id is already known.
    pub async fn register(&mut self, backend: B) -> bool {
        let record = backend.record().clone();
        if !self.supervisor.add_backend(record.clone()) {
            return false;
        }

        backend.start().await;
        self.health_states.insert(
            record.id.clone(),
            BackendHealthState {
                is_healthy: true,
                ..Default::default()
            },
        );
        self.backends.push(Arc::new(backend));
        true
    }

    /// Registration phase followed by the first load balancer start.
    ///
    /// The whole set is registered before the config is compiled.
    pub async fn bootstrap<I>(&mut self, backends: I) -> SupervisorResult<()>
    where
        I: IntoIterator<Item = B>,
    {
        for backend in backends {
            self.register(backend).await;
        }
        info!(backends = self.backends.len(), "Backends registered");
        self.supervisor.start().await
    }

    /// Monitor until shutdown is signalled
    pub async fn run(mut self) {
        info!(
            warmup_secs = self.warmup.as_secs(),
            interval_secs = self.interval.as_secs(),
            backends = self.backends.len(),
            "Health loop started"
        );

        if !self.sleep_or_shutdown(self.warmup).await {
            info!("Health loop shutting down");
            return;
        }

        loop {
            let report = self.check_all().await;
            info!(
                checked = report.checked,
                healthy = report.healthy,
                restarted = report.restarted.len(),
                "Health check cycle complete"
            );

            if !self.sleep_or_shutdown(self.interval).await {
                info!("Health loop shutting down");
                break;
            }
        }
    }

    /// Returns false once shutdown has been requested
    async fn sleep_or_shutdown(&mut self, duration: Duration) -> bool {
        if *self.shutdown_rx.borrow() {
            return false;
        }

        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                changed = self.shutdown_rx.changed() => {
                    // A dropped sender means nobody can keep us running
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        return false;
                    }
                }
            }
        }
    }

    /// Probe every backend once and restart the unhealthy ones.
    ///
    /// Each backend is handled in its own task; a failure in one never
    /// affects the others.
    pub async fn check_all(&self) -> CycleReport {
        let mut tasks = JoinSet::new();

        for backend in &self.backends {
            let backend = Arc::clone(backend);
            let limiter = Arc::clone(&self.limiter);
            let health_states = Arc::clone(&self.health_states);

            tasks.spawn(async move {
                // The semaphore is never closed
                let _permit = limiter.acquire_owned().await.ok();
                let id = backend.record().id.clone();

                let healthy = backend.is_healthy().await;
                if healthy {
                    if let Some(mut state) = health_states.get_mut(&id) {
                        if !state.is_healthy {
                            info!(backend_id = %id, "Backend is healthy again");
                        }
                        state.consecutive_failures = 0;
                        state.is_healthy = true;
                    }
                    debug!(backend_id = %id, "Backend healthy");
                    return (id, true);
                }

                let failures = {
                    let mut state = health_states.entry(id.clone()).or_default();
                    state.consecutive_failures += 1;
                    state.is_healthy = false;
                    state.consecutive_failures
                };
                warn!(backend_id = %id, consecutive_failures = failures, "Restarting backend");

                backend.restart().await;

                if let Some(mut state) = health_states.get_mut(&id) {
                    state.restarts += 1;
                }
                (id, false)
            });
        }

        let mut report = CycleReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, healthy)) => {
                    report.checked += 1;
                    if healthy {
                        report.healthy += 1;
                    } else {
                        report.restarted.push(id);
                    }
                }
                Err(e) => {
                    report.failed_tasks += 1;
                    error!(error = %e, "Backend check task failed");
                }
            }
        }
        report
    }
}
