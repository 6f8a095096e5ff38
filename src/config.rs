use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the fleet supervisor
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Load balancer process settings
    #[serde(default)]
    pub balancer: BalancerConfig,

    /// Backend reachability probe settings
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Monitoring loop timing
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Where the backend list comes from
    #[serde(default)]
    pub inventory: InventoryConfig,

    /// Enable debug logging (also enabled by the DEBUG environment variable)
    #[serde(default)]
    pub debug: bool,
}

/// Signal sent to a supervised process when stopping it
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum StopSignal {
    #[default]
    #[serde(rename = "SIGINT", alias = "INT")]
    Interrupt,
    #[serde(rename = "SIGTERM", alias = "TERM")]
    Terminate,
    #[serde(rename = "SIGQUIT", alias = "QUIT")]
    Quit,
    #[serde(rename = "SIGKILL", alias = "KILL")]
    Kill,
}

impl StopSignal {
    /// Raw signal number for `kill(2)`
    #[cfg(unix)]
    pub fn as_raw(self) -> i32 {
        match self {
            StopSignal::Interrupt => libc::SIGINT,
            StopSignal::Terminate => libc::SIGTERM,
            StopSignal::Quit => libc::SIGQUIT,
            StopSignal::Kill => libc::SIGKILL,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StopSignal::Interrupt => "SIGINT",
            StopSignal::Terminate => "SIGTERM",
            StopSignal::Quit => "SIGQUIT",
            StopSignal::Kill => "SIGKILL",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BalancerConfig {
    /// Service name, used for directory and PID file layout (default: haproxy)
    #[serde(default = "default_balancer_name")]
    pub name: String,

    /// Executable name or path (default: same as `name`, resolved via PATH)
    pub executable: Option<String>,

    /// Port the load balancer listens on; also names the PID file
    #[serde(default = "default_balancer_port")]
    pub port: u16,

    /// Template the config file is rendered from
    #[serde(default = "default_template_path")]
    pub template_path: PathBuf,

    /// Rendered config file read by the load balancer
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,

    /// Root for lib/run/log directories (default: /var)
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Command that receives the load balancer's output (empty disables)
    #[serde(default = "default_log_command")]
    pub log_command: String,

    /// Signal used to stop the load balancer
    #[serde(default)]
    pub stop_signal: StopSignal,

    /// Extra arguments appended to every launch
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Stop the load balancer when the supervisor shuts down
    #[serde(default = "default_true")]
    pub stop_on_exit: bool,
}

impl BalancerConfig {
    pub fn executable_name(&self) -> &str {
        self.executable.as_deref().unwrap_or(&self.name)
    }

    pub fn log_sink(&self) -> Option<&str> {
        let command = self.log_command.trim();
        (!command.is_empty()).then_some(command)
    }
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            name: default_balancer_name(),
            executable: None,
            port: default_balancer_port(),
            template_path: default_template_path(),
            config_path: default_config_path(),
            base_dir: default_base_dir(),
            log_command: default_log_command(),
            stop_signal: StopSignal::default(),
            extra_args: Vec::new(),
            stop_on_exit: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProbeConfig {
    /// URL fetched through each backend to prove it can reach the internet
    #[serde(default = "default_test_url")]
    pub test_url: String,

    /// Upper bound for a single probe
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            test_url: default_test_url(),
            timeout_secs: default_probe_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    /// Delay between starting the load balancer and the first health cycle
    #[serde(default = "default_warmup")]
    pub warmup_secs: u64,

    /// Period of the health cycle
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Pause between stopping and starting a backend on restart
    #[serde(default = "default_restart_grace")]
    pub restart_grace_secs: u64,

    /// Maximum number of backends probed at the same time
    #[serde(default = "default_max_concurrent_probes")]
    pub max_concurrent_probes: usize,
}

impl MonitorConfig {
    pub fn warmup(&self) -> Duration {
        Duration::from_secs(self.warmup_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn restart_grace(&self) -> Duration {
        Duration::from_secs(self.restart_grace_secs)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            warmup_secs: default_warmup(),
            interval_secs: default_interval(),
            restart_grace_secs: default_restart_grace(),
            max_concurrent_probes: default_max_concurrent_probes(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct InventoryConfig {
    /// URL returning `{"results": [...]}` with the backend list
    pub proxies_url: Option<String>,

    /// Credentials used for backends that do not carry their own
    pub username: Option<String>,
    pub password: Option<String>,

    /// Timeout for the inventory request
    #[serde(default = "default_inventory_timeout")]
    pub request_timeout_secs: u64,
}

impl InventoryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            proxies_url: None,
            username: None,
            password: None,
            request_timeout_secs: default_inventory_timeout(),
        }
    }
}

// Default value functions
fn default_balancer_name() -> String {
    "haproxy".to_string()
}

fn default_balancer_port() -> u16 {
    5566
}

fn default_template_path() -> PathBuf {
    PathBuf::from("/usr/local/etc/haproxy.cfg.tmpl")
}

fn default_config_path() -> PathBuf {
    PathBuf::from("/usr/local/etc/haproxy.cfg")
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("/var")
}

fn default_log_command() -> String {
    "logger".to_string()
}

fn default_true() -> bool {
    true
}

fn default_test_url() -> String {
    "http://icanhazip.com".to_string()
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_warmup() -> u64 {
    60
}

fn default_interval() -> u64 {
    60
}

fn default_restart_grace() -> u64 {
    5 // lets the OS release the endpoint before starting again
}

fn default_max_concurrent_probes() -> usize {
    16
}

fn default_inventory_timeout() -> u64 {
    30
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Defaults overlaid with the process environment
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Overlay environment-style settings on top of this configuration
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("proxies_url") {
            self.inventory.proxies_url = Some(url);
        }
        if let Some(username) = lookup("username") {
            self.inventory.username = Some(username);
        }
        if let Some(password) = lookup("password") {
            self.inventory.password = Some(password);
        }
        if let Some(url) = lookup("test_url") {
            self.probe.test_url = url;
        }
        if let Some(value) = lookup("DEBUG") {
            self.debug = !matches!(value.trim(), "0" | "false" | "no" | "off");
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        match self.inventory.proxies_url.as_deref() {
            None | Some("") => errors.push("'proxies_url' is required".to_string()),
            Some(url) if !is_http_url(url) => {
                errors.push(format!("'proxies_url' must be an http(s) URL, got '{}'", url))
            }
            Some(_) => {}
        }

        if !is_http_url(&self.probe.test_url) {
            errors.push(format!(
                "'test_url' must be an http(s) URL, got '{}'",
                self.probe.test_url
            ));
        }
        if self.probe.timeout_secs == 0 {
            errors.push("'probe.timeout_secs' must be greater than 0".to_string());
        }
        if self.balancer.port == 0 {
            errors.push("'balancer.port' must be greater than 0".to_string());
        }
        if self.balancer.template_path == self.balancer.config_path {
            errors.push("'balancer.template_path' and 'balancer.config_path' must differ".to_string());
        }
        if self.monitor.interval_secs == 0 {
            errors.push("'monitor.interval_secs' must be greater than 0".to_string());
        }
        if self.monitor.max_concurrent_probes == 0 {
            errors.push("'monitor.max_concurrent_probes' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
