//! Upstream proxy backends
//!
//! A [`BackendRecord`] is the identity of one upstream proxy. A
//! [`BackendProbe`] wraps a record with the behavior the health loop needs:
//! a bounded reachability check through the proxy, and restart hooks.

use crate::error::{InventoryError, ProbeError};
use crate::inventory::encode_credential;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default pause between stop and start on restart
pub const DEFAULT_RESTART_GRACE: Duration = Duration::from_secs(5);

/// One upstream proxy
#[derive(Clone, PartialEq, Eq)]
pub struct BackendRecord {
    /// Unique within the fleet, stable for the backend's lifetime
    pub id: String,
    pub address: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Base64 of `username:password`, empty when there are no credentials
    pub encoded_credential: String,
}

impl BackendRecord {
    /// A backend without proxy credentials
    pub fn new(id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port,
            username: String::new(),
            password: String::new(),
            encoded_credential: String::new(),
        }
    }

    /// Attach credentials and derive the encoded form used in the config
    pub fn with_credentials(
        mut self,
        username: &str,
        password: &str,
    ) -> Result<Self, InventoryError> {
        self.encoded_credential = encode_credential(username, password)?;
        self.username = username.to_string();
        self.password = password.to_string();
        Ok(self)
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }

    /// `host:port`, with IPv6 literals bracketed
    pub fn endpoint(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

// Credentials are redacted so records can be logged freely
impl fmt::Debug for BackendRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = |s: &str| if s.is_empty() { "" } else { "<redacted>" };
        f.debug_struct("BackendRecord")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &redacted(&self.password))
            .field("encoded_credential", &redacted(&self.encoded_credential))
            .finish()
    }
}

/// Backends in insertion order, unique by id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendSet {
    records: Vec<BackendRecord>,
}

impl BackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. Returns false (and keeps the existing one) on a duplicate id.
    pub fn push(&mut self, record: BackendRecord) -> bool {
        if self.records.iter().any(|r| r.id == record.id) {
            return false;
        }
        self.records.push(record);
        true
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BackendRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn as_slice(&self) -> &[BackendRecord] {
        &self.records
    }
}

impl FromIterator<BackendRecord> for BackendSet {
    fn from_iter<I: IntoIterator<Item = BackendRecord>>(iter: I) -> Self {
        let mut set = BackendSet::new();
        for record in iter {
            set.push(record);
        }
        set
    }
}

impl<'a> IntoIterator for &'a BackendSet {
    type Item = &'a BackendRecord;
    type IntoIter = std::slice::Iter<'a, BackendRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// A monitored backend as seen by the health loop
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    fn record(&self) -> &BackendRecord;

    /// Pause between stop and start on restart
    fn restart_grace(&self) -> Duration {
        DEFAULT_RESTART_GRACE
    }

    async fn start(&self);

    async fn stop(&self);

    /// Reachability check. Never fails, every problem maps to `false`.
    async fn is_healthy(&self) -> bool;

    /// Stop, wait out the grace period, start. No backoff and no retry cap.
    async fn restart(&self) {
        self.stop().await;
        tokio::time::sleep(self.restart_grace()).await;
        self.start().await;
    }
}

/// Lifecycle counters for a probe
#[derive(Debug, Default)]
pub struct ProbeStats {
    pub starts: AtomicU64,
    pub stops: AtomicU64,
    pub checks: AtomicU64,
    pub failures: AtomicU64,
}

impl ProbeStats {
    pub fn get_starts(&self) -> u64 {
        self.starts.load(Ordering::Relaxed)
    }

    pub fn get_stops(&self) -> u64 {
        self.stops.load(Ordering::Relaxed)
    }

    pub fn get_checks(&self) -> u64 {
        self.checks.load(Ordering::Relaxed)
    }

    pub fn get_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Checks a backend by fetching a fixed URL through it as an HTTP proxy.
///
/// `start`/`stop` only log: provisioning the proxy itself is owned by the
/// infrastructure that runs it. They are the hook points for that work.
pub struct BackendProbe {
    record: BackendRecord,
    client: reqwest::Client,
    test_url: String,
    restart_grace: Duration,
    stats: ProbeStats,
}

impl BackendProbe {
    pub fn new(
        record: BackendRecord,
        test_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProbeError> {
        let endpoint = format!("http://{}", record.endpoint());
        let client_error = |source| ProbeError::Client {
            endpoint: endpoint.clone(),
            source,
        };

        let mut proxy = reqwest::Proxy::all(&endpoint).map_err(client_error)?;
        if record.has_credentials() {
            proxy = proxy.basic_auth(&record.username, &record.password);
        }

        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(timeout)
            // A 3xx from the target counts as a failure
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(client_error)?;

        Ok(Self {
            record,
            client,
            test_url: test_url.into(),
            restart_grace: DEFAULT_RESTART_GRACE,
            stats: ProbeStats::default(),
        })
    }

    pub fn with_restart_grace(mut self, grace: Duration) -> Self {
        self.restart_grace = grace;
        self
    }

    pub fn stats(&self) -> &ProbeStats {
        &self.stats
    }

    pub fn test_url(&self) -> &str {
        &self.test_url
    }
}

#[async_trait]
impl Backend for BackendProbe {
    fn record(&self) -> &BackendRecord {
        &self.record
    }

    fn restart_grace(&self) -> Duration {
        self.restart_grace
    }

    async fn start(&self) {
        self.stats.starts.fetch_add(1, Ordering::Relaxed);
        info!(
            backend_id = %self.record.id,
            address = %self.record.address,
            port = self.record.port,
            "Starting proxy"
        );
    }

    async fn stop(&self) {
        self.stats.stops.fetch_add(1, Ordering::Relaxed);
        info!(
            backend_id = %self.record.id,
            address = %self.record.address,
            port = self.record.port,
            "Stopping proxy"
        );
    }

    async fn is_healthy(&self) -> bool {
        self.stats.checks.fetch_add(1, Ordering::Relaxed);
        let backend_id = &self.record.id;

        let healthy = match self.client.get(&self.test_url).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(%backend_id, status = response.status().as_u16(), "Probe passed");
                true
            }
            Ok(response) => {
                debug!(%backend_id, status = response.status().as_u16(), "Probe failed (status)");
                false
            }
            Err(e) if e.is_timeout() => {
                debug!(%backend_id, "Probe failed (timeout)");
                false
            }
            Err(e) => {
                debug!(%backend_id, error = %e, "Probe failed (request error)");
                false
            }
        };

        if !healthy {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                %backend_id,
                address = %self.record.address,
                port = self.record.port,
                "Proxy is not working"
            );
        }
        healthy
    }
}
