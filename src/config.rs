//! Deployment and runner configuration.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Per-unit join bound used when the deployment does not override it.
pub const DEFAULT_JOIN_BOUND: Duration = Duration::from_secs(60);

/// Signalling transport a test is executed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    /// SIPp `-t` flag value (single socket mode).
    pub fn sipp_flag(&self) -> &'static str {
        match self {
            Transport::Tcp => "t1",
            Transport::Udp => "u1",
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp => write!(f, "TCP"),
            Transport::Udp => write!(f, "UDP"),
        }
    }
}

impl FromStr for Transport {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Transport::Tcp),
            "udp" => Ok(Transport::Udp),
            _ => Err(ConfigError::UnsupportedTransport(s.trim().to_string())),
        }
    }
}

/// The system under test and the collaborators used to drive it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Deployment {
    /// Home domain identities are provisioned in.
    pub domain: String,
    /// Signalling proxy / registrar (`host:port`). Defaults to `<domain>:5060`.
    pub proxy: Option<String>,
    /// Base URL of the provisioning API.
    pub provisioning_url: Option<String>,
    /// API key sent with provisioning requests.
    pub provisioning_key: Option<String>,
    /// Base URL of the statistics endpoint.
    pub stats_url: Option<String>,
    /// Whether PSTN-gated tests may run.
    pub pstn: bool,
    /// Mock application server address for AS-interaction tests.
    pub app_server: Option<String>,
    pub sipp_binary: String,
    pub artifact_dir: PathBuf,
    pub join_bound_secs: u64,
    pub latency_ceiling_ms: f64,
}

impl Default for Deployment {
    fn default() -> Self {
        Self {
            domain: String::new(),
            proxy: None,
            provisioning_url: None,
            provisioning_key: None,
            stats_url: None,
            pstn: false,
            app_server: None,
            sipp_binary: "sipp".to_string(),
            artifact_dir: PathBuf::from("logs"),
            join_bound_secs: DEFAULT_JOIN_BOUND.as_secs(),
            latency_ceiling_ms: 500.0,
        }
    }
}

impl Deployment {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Default::default()
        }
    }

    /// Load a deployment description from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn proxy_addr(&self) -> String {
        self.proxy
            .clone()
            .unwrap_or_else(|| format!("{}:5060", self.domain))
    }

    pub fn join_bound(&self) -> Duration {
        Duration::from_secs(self.join_bound_secs)
    }

    /// Checks that need both the deployment and the runner settings.
    pub fn validate(&self, runner: &RunnerConfig) -> Result<(), ConfigError> {
        if runner.stats_check && self.stats_url.is_none() {
            return Err(ConfigError::NoStatsSource);
        }
        Ok(())
    }
}

/// Environment-style runner settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    pub repeat: u32,
    pub transports: Vec<Transport>,
    pub exclusions: Vec<String>,
    pub stats_check: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            repeat: 1,
            transports: vec![Transport::Tcp],
            exclusions: Vec::new(),
            stats_check: false,
        }
    }
}

impl RunnerConfig {
    /// Validate raw values. Every requested transport must be recognised.
    pub fn from_raw(
        repeat: u32,
        transports: &[String],
        exclusions: &[String],
        stats_check: bool,
    ) -> Result<Self, ConfigError> {
        if repeat == 0 {
            return Err(ConfigError::ZeroRepeat);
        }
        let mut parsed = Vec::new();
        for raw in transports.iter().filter(|t| !t.trim().is_empty()) {
            let transport: Transport = raw.parse()?;
            if !parsed.contains(&transport) {
                parsed.push(transport);
            }
        }
        if parsed.is_empty() {
            return Err(ConfigError::NoTransports);
        }
        Ok(Self {
            repeat,
            transports: parsed,
            exclusions: exclusions
                .iter()
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .collect(),
            stats_check,
        })
    }
}
