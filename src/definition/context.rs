//! Per-run state handed to test code.
//!
//! A fresh [`RunContext`] is built for every (test, transport) execution, so
//! nothing leaks between runs of the same definition. Scenario units get a
//! cheap [`ScenarioContext`] clone instead of touching the run directly.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{artifact_path, Environment};
use crate::auxiliary::Auxiliary;
use crate::barrier::Barrier;
use crate::config::Transport;
use crate::endpoint::{Endpoint, Expect, Identity, Message, Origin, SendOptions};
use crate::error::ScenarioError;

/// One concurrent unit of a test: a script of sends, receives and barrier
/// waits for one simulated participant.
pub trait Scenario: Send + 'static {
    fn execute(
        self: Box<Self>,
        ctx: ScenarioContext,
    ) -> BoxFuture<'static, Result<(), ScenarioError>>;
}

impl<F, Fut> Scenario for F
where
    F: FnOnce(ScenarioContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), ScenarioError>> + Send + 'static,
{
    fn execute(
        self: Box<Self>,
        ctx: ScenarioContext,
    ) -> BoxFuture<'static, Result<(), ScenarioError>> {
        Box::pin((*self)(ctx))
    }
}

/// Lifecycle phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Phase {
    Idle,
    Provisioning,
    Running,
    Cleaning,
    Done,
}

#[derive(Debug, Clone)]
pub struct TrailEntry {
    pub at: DateTime<Utc>,
    pub step: String,
}

impl std::fmt::Display for TrailEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.at.format("%H:%M:%S%.3f"), self.step)
    }
}

/// Handle given to each scenario unit.
#[derive(Clone)]
pub struct ScenarioContext {
    test: Arc<str>,
    role: Arc<str>,
    transport: Transport,
    labels: Arc<AtomicU64>,
    trail: Arc<Mutex<Vec<TrailEntry>>>,
    token: CancellationToken,
}

impl ScenarioContext {
    pub fn test_name(&self) -> &str {
        &self.test
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Unique label id within the current run.
    pub fn next_label(&self) -> u64 {
        self.labels.fetch_add(1, Ordering::Relaxed)
    }

    /// Record a step in this unit's execution trail.
    pub fn note(&self, step: impl Into<String>) {
        let entry = TrailEntry {
            at: Utc::now(),
            step: step.into(),
        };
        debug!(role = %self.role, step = %entry.step, "scenario step");
        if let Ok(mut trail) = self.trail.lock() {
            trail.push(entry);
        }
    }

    pub fn trail(&self) -> Vec<TrailEntry> {
        self.trail.lock().map(|t| t.clone()).unwrap_or_default()
    }

    /// True once a peer unit raised the skip signal.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub async fn wait(&self, barrier: &Barrier) {
        self.note(format!(
            "waiting at '{}' ({} of {} arrived)",
            barrier.name(),
            barrier.arrived(),
            barrier.parties()
        ));
        barrier.wait().await;
        self.note(format!("released from '{}'", barrier.name()));
    }

    pub async fn send(
        &self,
        endpoint: &Endpoint,
        message_type: &str,
        opts: SendOptions,
    ) -> Result<(), ScenarioError> {
        self.note(format!("{} sends {}", endpoint.username(), message_type));
        Ok(endpoint.send(message_type, opts).await?)
    }

    pub async fn receive(
        &self,
        endpoint: &Endpoint,
        expected: Expect,
    ) -> Result<Message, ScenarioError> {
        self.note(format!("{} waits for {}", endpoint.username(), expected));
        let msg = endpoint.receive(&expected).await?;
        self.note(format!("{} received '{}'", endpoint.username(), msg.start_line));
        Ok(msg)
    }
}

pub(crate) struct PendingUnit {
    pub role: String,
    pub scenario: Box<dyn Scenario>,
}

/// Mutable state of one run, owned by the engine.
pub struct RunContext {
    pub(crate) env: Arc<Environment>,
    test: String,
    transport: Transport,
    timeout: Duration,
    phase: Phase,
    endpoints: Vec<Arc<Endpoint>>,
    auxiliaries: Vec<Arc<dyn Auxiliary>>,
    pub(crate) units: Vec<PendingUnit>,
    labels: Arc<AtomicU64>,
    token: CancellationToken,
    artifacts: Vec<PathBuf>,
}

impl RunContext {
    pub(crate) fn new(
        env: Arc<Environment>,
        test: &str,
        transport: Transport,
        timeout: Duration,
    ) -> Self {
        Self {
            env,
            test: test.to_string(),
            transport,
            timeout,
            phase: Phase::Idle,
            endpoints: Vec::new(),
            auxiliaries: Vec::new(),
            units: Vec::new(),
            labels: Arc::new(AtomicU64::new(1)),
            token: CancellationToken::new(),
            artifacts: Vec::new(),
        }
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    pub fn test_name(&self) -> &str {
        &self.test
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// The test's own time limit, as reported by [`TestCase::timeout`].
    ///
    /// [`TestCase::timeout`]: super::TestCase::timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        debug!(test = %self.test, ?phase, "phase change");
        self.phase = phase;
    }

    pub fn next_label(&self) -> u64 {
        self.labels.fetch_add(1, Ordering::Relaxed)
    }

    /// Endpoints in creation order.
    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn artifacts(&self) -> &[PathBuf] {
        &self.artifacts
    }

    pub fn add_artifact(&mut self, path: PathBuf) {
        if !self.artifacts.contains(&path) {
            self.artifacts.push(path);
        }
    }

    /// `<artifact dir>/<test> - <TRANSPORT> - <suffix>`.
    pub fn artifact_path(&self, suffix: &str) -> PathBuf {
        artifact_path(&self.env.deployment.artifact_dir, &self.test, self.transport, suffix)
    }

    /// Register a closure as a scenario unit. Units start together once
    /// setup returns.
    pub fn add_scenario<F, Fut>(&mut self, role: impl Into<String>, scenario: F)
    where
        F: FnOnce(ScenarioContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ScenarioError>> + Send + 'static,
    {
        self.add_unit(role, scenario);
    }

    /// Register any [`Scenario`] implementation as a unit.
    pub fn add_unit(&mut self, role: impl Into<String>, scenario: impl Scenario) {
        self.units.push(PendingUnit {
            role: role.into(),
            scenario: Box::new(scenario),
        });
    }

    /// Register an auxiliary resource, started before the scenario units.
    pub fn add_auxiliary(&mut self, aux: Arc<dyn Auxiliary>) {
        self.auxiliaries.push(aux);
    }

    pub(crate) fn auxiliaries(&self) -> &[Arc<dyn Auxiliary>] {
        &self.auxiliaries
    }

    pub(crate) fn scenario_context(&self, role: &str) -> ScenarioContext {
        ScenarioContext {
            test: Arc::from(self.test.as_str()),
            role: Arc::from(role),
            transport: self.transport,
            labels: self.labels.clone(),
            trail: Arc::new(Mutex::new(Vec::new())),
            token: self.token.clone(),
        }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Provision a fresh identity and connect an endpoint for it.
    pub async fn add_endpoint(&mut self, pstn: bool) -> Result<Arc<Endpoint>, ScenarioError> {
        self.require_signalling()?;
        let identity = self.env.provisioner.create_identity(pstn, None).await?;
        self.connect(identity, Origin::Primary).await
    }

    /// Provision another public identity sharing `parent`'s private id.
    pub async fn add_associated_endpoint(
        &mut self,
        parent: &Endpoint,
    ) -> Result<Arc<Endpoint>, ScenarioError> {
        self.require_signalling()?;
        let identity = self
            .env
            .provisioner
            .create_identity(parent.identity().pstn, Some(parent.identity()))
            .await?;
        let origin = Origin::Associated {
            parent: parent.identity().clone(),
        };
        self.connect(identity, origin).await
    }

    /// A further binding (device) for `parent`'s identity. Nothing is provisioned.
    pub async fn add_binding(&mut self, parent: &Endpoint) -> Result<Arc<Endpoint>, ScenarioError> {
        self.require_signalling()?;
        let identity = parent.identity().as_ref().clone();
        let origin = Origin::Binding {
            parent: parent.identity().clone(),
        };
        self.connect(identity, origin).await
    }

    fn require_signalling(&self) -> Result<(), ScenarioError> {
        if self.env.signalling.is_none() {
            return Err(ScenarioError::skip("No signalling client configured")
                .with_remediation("run with a deployment proxy so the wire client can connect"));
        }
        Ok(())
    }

    async fn connect(
        &mut self,
        identity: Identity,
        origin: Origin,
    ) -> Result<Arc<Endpoint>, ScenarioError> {
        let owns = !matches!(origin, Origin::Binding { .. });
        let Some(client) = self.env.signalling.clone() else {
            return Err(ScenarioError::skip("No signalling client configured"));
        };
        let registrar = self.env.deployment.proxy_addr();
        match client.connect(&identity, self.transport, &registrar).await {
            Ok(conn) => {
                let endpoint = Arc::new(Endpoint::new(
                    Arc::new(identity),
                    origin,
                    self.transport,
                    conn,
                ));
                self.endpoints.push(endpoint.clone());
                Ok(endpoint)
            }
            Err(e) => {
                // Not tracked yet, so release the identity here.
                if owns {
                    if let Err(del) = self.env.provisioner.delete_identity(&identity).await {
                        warn!(
                            uri = %identity.sip_uri,
                            "failed to release identity after connect error: {}", del
                        );
                    }
                }
                Err(e.into())
            }
        }
    }

    /// Terminate endpoints last-created-first, deleting owned identities.
    /// Every endpoint is attempted; failures are logged.
    pub(crate) async fn release_endpoints(&mut self) {
        while let Some(endpoint) = self.endpoints.pop() {
            if let Err(e) = endpoint.terminate().await {
                warn!(uri = %endpoint.uri(), "failed to terminate endpoint: {}", e);
            }
            if endpoint.owns_identity() {
                if let Err(e) = self.env.provisioner.delete_identity(endpoint.identity()).await {
                    warn!(uri = %endpoint.uri(), "failed to delete identity: {}", e);
                }
            }
        }
    }

    /// Terminate auxiliaries in reverse registration order.
    pub(crate) async fn release_auxiliaries(&mut self) {
        while let Some(aux) = self.auxiliaries.pop() {
            if let Err(e) = aux.terminate().await {
                warn!(resource = %aux.name(), "failed to terminate auxiliary: {}", e);
            }
        }
    }

    /// Drop everything scoped to this run.
    pub(crate) fn clear(&mut self) {
        self.units.clear();
        self.endpoints.clear();
        self.auxiliaries.clear();
        self.labels.store(1, Ordering::Relaxed);
    }
}
