//! Error taxonomy for the orchestration engine.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Raised when the runner configuration cannot be honoured. Always reported
/// before any test executes.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported transport '{0}' (supported: tcp, udp)")]
    UnsupportedTransport(String),

    #[error("no transports requested")]
    NoTransports,

    #[error("repeat count must be at least 1")]
    ZeroRepeat,

    #[error("statistics check requested but the deployment has no stats_url")]
    NoStatsSource,

    #[error("failed to read deployment file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid deployment file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("provisioning request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provisioning server returned {status} for {action}")]
    Status { action: String, status: u16 },

    #[error("provisioning unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("endpoint {0} used after termination")]
    Terminated(String),

    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection closed while waiting for {0}")]
    Closed(String),

    #[error("expected {expected}, received {received}")]
    Unexpected { expected: String, received: String },

    #[error("no {0} received in time")]
    NoMessage(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{count} call-generator process(es) still running after {timeout:?}; killed")]
    TimedOut { count: usize, timeout: Duration },

    #[error("call generator for role '{role}' exited with {code:?}")]
    Exit { role: String, code: Option<i32> },

    #[error("script generation failed: {0}")]
    Script(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a setup block or scenario unit can raise.
///
/// `Skip` is not a failure: it converts into a skipped outcome at the test
/// boundary, even when peer units failed.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("skipped: {reason}")]
    Skip {
        reason: String,
        remediation: Option<String>,
    },

    #[error("assertion failed: {0}")]
    Assertion(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ScenarioError {
    /// Build the skip signal.
    pub fn skip(reason: impl Into<String>) -> Self {
        ScenarioError::Skip {
            reason: reason.into(),
            remediation: None,
        }
    }

    /// Attach a remediation hint. No effect on non-skip errors.
    pub fn with_remediation(self, hint: impl Into<String>) -> Self {
        match self {
            ScenarioError::Skip { reason, .. } => ScenarioError::Skip {
                reason,
                remediation: Some(hint.into()),
            },
            other => other,
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, ScenarioError::Skip { .. })
    }
}

/// Fail the current scenario with an assertion error unless `cond` holds.
#[macro_export]
macro_rules! check {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::ScenarioError::Assertion(format!($($arg)+)));
        }
    };
}
