//! Test definitions and their execution lifecycle.
//!
//! A definition provisions endpoints in `setup`, registers scenario units,
//! and leaves the rest to the engine: units run concurrently, are joined with
//! a bound, and cleanup always runs (`Idle -> Provisioning -> Running ->
//! Cleaning -> Done`).

pub mod context;
pub mod engine;
mod panic;

pub use self::context::{Phase, RunContext, Scenario, ScenarioContext, TrailEntry};
pub use self::engine::run;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::{Deployment, Transport};
use crate::endpoint::SignallingClient;
use crate::error::ScenarioError;
use crate::provision::Provisioner;
use crate::stats::StatsSource;

/// Per-test wall-clock timeout when a definition does not override it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// The deployment plus the collaborators tests drive it with.
pub struct Environment {
    pub deployment: Deployment,
    pub provisioner: Arc<dyn Provisioner>,
    pub signalling: Option<Arc<dyn SignallingClient>>,
    pub stats: Option<Arc<dyn StatsSource>>,
    pub stats_check: bool,
}

impl Environment {
    pub fn new(deployment: Deployment, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            deployment,
            provisioner,
            signalling: None,
            stats: None,
            stats_check: false,
        }
    }

    pub fn with_signalling(mut self, client: Arc<dyn SignallingClient>) -> Self {
        self.signalling = Some(client);
        self
    }

    pub fn with_stats(mut self, stats: Arc<dyn StatsSource>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Turn on post-run statistics checks. Set without a source, every
    /// passing run fails its statistics check.
    pub fn with_stats_check(mut self, enabled: bool) -> Self {
        self.stats_check = enabled;
        self
    }
}

/// Kind of definition; decides which deployment prerequisites gate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Variant {
    Plain,
    /// Driven by external call-generator processes.
    SippDriven,
    /// Needs a mock application server.
    AppServer,
    /// Needs PSTN interconnect.
    Pstn,
}

impl Variant {
    /// The skip signal for a deployment lacking this variant's prerequisite.
    pub fn gate(&self, deployment: &Deployment) -> Option<ScenarioError> {
        match self {
            Variant::Plain => None,
            Variant::Pstn if !deployment.pstn => Some(
                ScenarioError::skip("No PSTN support")
                    .with_remediation("set pstn = true in the deployment file"),
            ),
            Variant::AppServer if deployment.app_server.is_none() => Some(
                ScenarioError::skip("No application server configured")
                    .with_remediation("set app_server = \"host:port\" in the deployment file"),
            ),
            Variant::SippDriven if find_program(&deployment.sipp_binary).is_none() => Some(
                ScenarioError::skip(format!("{} not found", deployment.sipp_binary))
                    .with_remediation("install SIPp or set sipp_binary"),
            ),
            _ => None,
        }
    }
}

/// Resolve `program` the way a shell would: paths as-is, bare names via `PATH`.
pub fn find_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|p| p.is_file())
}

/// `<dir>/<test> - <TRANSPORT> - <suffix>`.
pub fn artifact_path(dir: &Path, test: &str, transport: Transport, suffix: &str) -> PathBuf {
    dir.join(format!("{test} - {transport} - {suffix}"))
}

/// A registered test.
#[async_trait::async_trait]
pub trait TestCase: Send + Sync {
    fn name(&self) -> &str;

    fn variant(&self) -> Variant {
        Variant::Plain
    }

    fn timeout(&self) -> Duration {
        DEFAULT_TIMEOUT
    }

    /// Provision endpoints and register scenario units.
    async fn setup(&self, run: &mut RunContext) -> Result<(), ScenarioError>;

    /// Runs after the units start and before they are joined.
    async fn extra_validation(&self, _run: &mut RunContext) -> Result<(), ScenarioError> {
        Ok(())
    }

    async fn cleanup(&self, _run: &mut RunContext) -> Result<(), ScenarioError> {
        Ok(())
    }

    /// Called during cleanup of a failed run, before endpoints are released.
    async fn on_failure(&self, run: &mut RunContext) {
        dump_message_logs(run);
    }
}

/// Write each endpoint's message log next to the other artifacts.
pub fn dump_message_logs(run: &mut RunContext) {
    let logs: Vec<(PathBuf, Vec<String>)> = run
        .endpoints()
        .iter()
        .map(|ep| (run.artifact_path(&format!("{}.log", ep.username())), ep.message_log()))
        .filter(|(_, log)| !log.is_empty())
        .collect();
    for (path, lines) in logs {
        let written = path
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|_| std::fs::write(&path, lines.join("\n") + "\n"));
        match written {
            Ok(()) => {
                info!(path = %path.display(), "wrote endpoint message log");
                run.add_artifact(path);
            }
            Err(e) => warn!(path = %path.display(), "failed to write message log: {}", e),
        }
    }
}

/// Result of one (test, transport) execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Failed {
        reasons: Vec<String>,
        artifacts: Vec<PathBuf>,
    },
    Skipped {
        reason: String,
        remediation: Option<String>,
    },
}

impl Outcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Outcome::Failed {
            reasons: vec![reason.into()],
            artifacts: Vec::new(),
        }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, Outcome::Passed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Outcome::Skipped { .. })
    }

    /// Fold in another failure reason. Skips are left untouched.
    pub fn add_failure(&mut self, reason: impl Into<String>) {
        match self {
            Outcome::Passed => *self = Outcome::failed(reason),
            Outcome::Failed { reasons, .. } => reasons.push(reason.into()),
            Outcome::Skipped { .. } => {}
        }
    }

    pub(crate) fn from_error(context: &str, err: ScenarioError) -> Self {
        match err {
            ScenarioError::Skip {
                reason,
                remediation,
            } => Outcome::Skipped {
                reason,
                remediation,
            },
            other => Outcome::failed(format!("{context}: {other}")),
        }
    }
}

/// Reported per (test, transport).
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub test: String,
    pub transport: Transport,
    pub run_id: uuid::Uuid,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub duration_ms: u64,
    pub outcome: Outcome,
}
