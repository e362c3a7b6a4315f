//! Lifecycle behaviour of the run engine against in-memory collaborators.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sipcheck::barrier::Barrier;
use sipcheck::config::{Deployment, RunnerConfig, Transport};
use sipcheck::definition::{self, Environment, Outcome, RunContext, TestCase};
use sipcheck::endpoint::{
    Expect, Identity, Message, SendOptions, SignallingClient, SignallingConnection,
};
use sipcheck::error::{EndpointError, ScenarioError};
use sipcheck::provision::memory::MemoryProvisioner;
use sipcheck::provision::Provisioner;
use sipcheck::registry::Registry;
use sipcheck::sipp::{SippStep, SippTest};
use sipcheck::stats::{LatencyStats, StatsSource};

/// Accepts everything and never has anything to deliver.
struct QuietClient;

struct QuietConnection;

#[async_trait::async_trait]
impl SignallingConnection for QuietConnection {
    async fn send(&self, _message_type: &str, _opts: SendOptions) -> Result<(), EndpointError> {
        Ok(())
    }

    async fn receive(
        &self,
        expected: &Expect,
        _timeout: Duration,
    ) -> Result<Message, EndpointError> {
        Err(EndpointError::NoMessage(expected.to_string()))
    }

    async fn terminate(&self) -> Result<(), EndpointError> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl SignallingClient for QuietClient {
    async fn connect(
        &self,
        _identity: &Identity,
        _transport: Transport,
        _registrar: &str,
    ) -> Result<Box<dyn SignallingConnection>, EndpointError> {
        Ok(Box::new(QuietConnection))
    }
}

struct Harness {
    env: Arc<Environment>,
    provisioner: Arc<MemoryProvisioner>,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    harness_with(|_| {}, |env| env)
}

fn harness_with(
    deploy: impl FnOnce(&mut Deployment),
    extend: impl FnOnce(Environment) -> Environment,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut deployment = Deployment::new("example.net");
    deployment.artifact_dir = dir.path().to_path_buf();
    deployment.join_bound_secs = 1;
    deploy(&mut deployment);
    let provisioner = Arc::new(MemoryProvisioner::new("example.net"));
    let env = Environment::new(deployment, provisioner.clone())
        .with_signalling(Arc::new(QuietClient));
    let env = extend(env);
    Harness {
        env: Arc::new(env),
        provisioner,
        _dir: dir,
    }
}

#[derive(Clone, Copy)]
enum Behaviour {
    Pass,
    Fail,
    Panic,
    Hang,
}

/// One endpoint, one unit, and a counter bumped only by cleanup.
struct Counted {
    name: &'static str,
    behaviour: Behaviour,
    cleanups: Arc<AtomicUsize>,
}

impl Counted {
    fn new(name: &'static str, behaviour: Behaviour) -> Self {
        Self {
            name,
            behaviour,
            cleanups: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait::async_trait]
impl TestCase for Counted {
    fn name(&self) -> &str {
        self.name
    }

    async fn setup(&self, run: &mut RunContext) -> Result<(), ScenarioError> {
        let ep = run.add_endpoint(false).await?;
        let behaviour = self.behaviour;
        run.add_scenario("only", move |ctx| async move {
            ctx.note(format!("using {}", ep.uri()));
            match behaviour {
                Behaviour::Pass => Ok(()),
                Behaviour::Fail => Err(ScenarioError::Assertion("wrong answer".into())),
                Behaviour::Panic => panic!("scenario blew up"),
                Behaviour::Hang => {
                    ctx.note("about to wait forever");
                    std::future::pending::<()>().await;
                    Ok(())
                }
            }
        });
        Ok(())
    }

    async fn cleanup(&self, _run: &mut RunContext) -> Result<(), ScenarioError> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn cleanup_runs_exactly_once_for_every_ending() {
    let h = harness();
    for behaviour in [Behaviour::Pass, Behaviour::Fail, Behaviour::Panic] {
        let test = Counted::new("Counted", behaviour);
        let record = definition::run(&test, &h.env, Transport::Tcp).await;
        assert_eq!(test.cleanups.load(Ordering::SeqCst), 1);
        match behaviour {
            Behaviour::Pass => assert!(record.outcome.is_passed(), "{:?}", record.outcome),
            _ => assert!(record.outcome.is_failed(), "{:?}", record.outcome),
        }
    }
    assert_eq!(h.provisioner.live_count(), 0);
}

#[tokio::test]
async fn hanging_unit_is_aborted_and_leaves_a_trace() {
    let h = harness();
    let test = Counted::new("Hangs", Behaviour::Hang);
    let record = tokio::time::timeout(
        Duration::from_secs(10),
        definition::run(&test, &h.env, Transport::Udp),
    )
    .await
    .expect("run should finish at the join bound");

    let Outcome::Failed { reasons, artifacts } = &record.outcome else {
        panic!("expected failure, got {:?}", record.outcome);
    };
    assert!(reasons[0].contains("timed out"), "{reasons:?}");
    assert!(reasons[0].contains("about to wait forever"), "{reasons:?}");
    let trace = artifacts
        .iter()
        .find(|p| p.to_string_lossy().ends_with("Hangs - UDP - only.trace"))
        .expect("trace artifact");
    let text = std::fs::read_to_string(trace).unwrap();
    assert!(text.contains("about to wait forever"));

    assert_eq!(test.cleanups.load(Ordering::SeqCst), 1);
    assert_eq!(h.provisioner.live_count(), 0);
}

/// Endpoints A, B, then C associated with A.
struct ThreeEndpoints;

#[async_trait::async_trait]
impl TestCase for ThreeEndpoints {
    fn name(&self) -> &str {
        "Three Endpoints"
    }

    async fn setup(&self, run: &mut RunContext) -> Result<(), ScenarioError> {
        let a = run.add_endpoint(false).await?;
        run.add_endpoint(false).await?;
        run.add_associated_endpoint(&a).await?;
        Ok(())
    }
}

#[tokio::test]
async fn teardown_releases_in_reverse_creation_order() {
    let h = harness();
    let record = definition::run(&ThreeEndpoints, &h.env, Transport::Tcp).await;
    assert!(record.outcome.is_passed(), "{:?}", record.outcome);

    let journal = h.provisioner.journal();
    let created: Vec<_> = journal
        .iter()
        .filter_map(|e| e.strip_prefix("create "))
        .collect();
    let deleted: Vec<_> = journal
        .iter()
        .filter_map(|e| e.strip_prefix("delete "))
        .collect();
    let (a, b, c) = (created[0], created[1], created[2]);
    assert_eq!(deleted, vec![c, b, a]);
}

/// One unit fails, the other raises skip.
struct SkipAndFail;

#[async_trait::async_trait]
impl TestCase for SkipAndFail {
    fn name(&self) -> &str {
        "Skip And Fail"
    }

    async fn setup(&self, run: &mut RunContext) -> Result<(), ScenarioError> {
        run.add_scenario("failing", |_ctx| async {
            Err(ScenarioError::Assertion("would have failed".into()))
        });
        run.add_scenario("skipping", |_ctx| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err(ScenarioError::skip("No widget").with_remediation("install a widget"))
        });
        Ok(())
    }
}

#[tokio::test]
async fn skip_wins_over_peer_failure() {
    let h = harness();
    let mut registry = Registry::new();
    registry.register(SkipAndFail).unwrap();

    let summary = registry
        .run_all(&h.env, &RunnerConfig::default(), "*", |_| {})
        .await;
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.skipped, 1);
    assert_eq!(
        summary.records[0].outcome,
        Outcome::Skipped {
            reason: "No widget".into(),
            remediation: Some("install a widget".into()),
        }
    );
}

#[tokio::test]
async fn exclusions_match_run_label_prefixes() {
    let h = harness();
    let mut registry = Registry::new();
    registry
        .register(Counted::new("Basic Call - Mainline", Behaviour::Pass))
        .unwrap();
    registry.register(Counted::new("Other", Behaviour::Pass)).unwrap();

    let config = RunnerConfig::from_raw(
        1,
        &["tcp".to_string()],
        &["Basic Call".to_string()],
        false,
    )
    .unwrap();
    let summary = registry.run_all(&h.env, &config, "*", |_| {}).await;

    assert_eq!(summary.run, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.records[0].test, "Basic Call - Mainline");
    assert!(summary.records[0].outcome.is_skipped());
    assert!(summary.records[1].outcome.is_passed());
}

#[tokio::test]
async fn sweep_removes_identities_leaked_outside_tests() {
    let h = harness();
    let primary = h.provisioner.create_identity(false, None).await.unwrap();
    h.provisioner
        .create_identity(false, Some(&primary))
        .await
        .unwrap();
    assert_eq!(h.provisioner.live_count(), 2);

    let mut registry = Registry::new();
    registry.register(ThreeEndpoints).unwrap();
    let transports = ["tcp".to_string(), "udp".to_string()];
    let config = RunnerConfig::from_raw(2, &transports, &[], false).unwrap();
    let summary = registry.run_all(&h.env, &config, "*", |_| {}).await;

    assert_eq!(summary.run, 4);
    assert!(summary.success());
    assert_eq!(h.provisioner.live_count(), 0);
}

/// Reports a fixed latency summary.
struct FixedStats(LatencyStats);

#[async_trait::async_trait]
impl StatsSource for FixedStats {
    async fn latency(&self, _stat: &str) -> anyhow::Result<LatencyStats> {
        Ok(self.0)
    }
}

#[tokio::test]
async fn inconsistent_statistics_fail_a_passing_run() {
    let stats = FixedStats(LatencyStats {
        low: 5.0,
        average: 1.0,
        high: 9.0,
        count: 1,
    });
    let h = harness_with(|_| {}, |env| {
        env.with_stats(Arc::new(stats)).with_stats_check(true)
    });
    let test = Counted::new("Counted", Behaviour::Pass);
    let record = definition::run(&test, &h.env, Transport::Tcp).await;

    let Outcome::Failed { reasons, .. } = &record.outcome else {
        panic!("expected failure, got {:?}", record.outcome);
    };
    assert_eq!(reasons, &vec!["statistics: low watermark 5 above average 1".to_string()]);
}

#[tokio::test]
async fn statistics_check_without_a_source_fails() {
    let h = harness_with(|_| {}, |env| env.with_stats_check(true));
    let test = Counted::new("Counted", Behaviour::Pass);
    let record = definition::run(&test, &h.env, Transport::Tcp).await;

    let Outcome::Failed { reasons, .. } = &record.outcome else {
        panic!("expected failure, got {:?}", record.outcome);
    };
    assert!(reasons[0].contains("no statistics source"), "{reasons:?}");
}

/// One unit waits at a barrier its peer never reaches; the peer skips.
struct SkipAtBarrier;

#[async_trait::async_trait]
impl TestCase for SkipAtBarrier {
    fn name(&self) -> &str {
        "Skip At Barrier"
    }

    async fn setup(&self, run: &mut RunContext) -> Result<(), ScenarioError> {
        let barrier = Arc::new(Barrier::named("both ready", 2));
        run.add_scenario("waiter", move |ctx| async move {
            ctx.wait(&barrier).await;
            Err(ScenarioError::Assertion("released without a peer".into()))
        });
        run.add_scenario("skipper", |_ctx| async {
            Err(ScenarioError::skip("nope"))
        });
        Ok(())
    }
}

#[tokio::test]
async fn skip_releases_a_unit_stuck_at_a_barrier() {
    let h = harness();
    let started = std::time::Instant::now();
    let record = definition::run(&SkipAtBarrier, &h.env, Transport::Tcp).await;

    assert_eq!(
        record.outcome,
        Outcome::Skipped {
            reason: "nope".into(),
            remediation: None,
        }
    );
    // Well inside the one-second join bound: the waiter was cancelled.
    assert!(started.elapsed() < Duration::from_millis(900));
    assert_eq!(h.provisioner.live_count(), 0);
}

#[cfg(unix)]
mod sipp_runs {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// A stand-in call generator. `$2` is the script path, which names the role.
    fn fake_sipp(dir: &Path, body: &str, mode: u32) -> PathBuf {
        let path = dir.join("fake-sipp.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(mode);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn flow() -> SippTest {
        SippTest::new(
            "Sipp Flow",
            vec![
                SippStep::send("caller", "callee", "MESSAGE sip:x SIP/2.0\nContent-Length: 0"),
                SippStep::send("callee", "caller", "SIP/2.0 200 OK\nContent-Length: 0"),
            ],
        )
    }

    fn sipp_harness(bin: &Path) -> Harness {
        let bin = bin.to_string_lossy().to_string();
        harness_with(
            move |d| {
                d.sipp_binary = bin;
                d.proxy = Some("127.0.0.1:5060".into());
            },
            |env| env,
        )
    }

    fn files_in(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect()
    }

    #[tokio::test]
    async fn failing_role_keeps_scripts_and_stderr() {
        let bin_dir = tempfile::tempdir().unwrap();
        let bin = fake_sipp(
            bin_dir.path(),
            "case \"$2\" in *callee*) echo 'no MESSAGE received' >&2; exit 3;; esac\nexit 0",
            0o755,
        );
        let h = sipp_harness(&bin);
        let record = definition::run(&flow(), &h.env, Transport::Tcp).await;

        let Outcome::Failed { reasons, artifacts } = &record.outcome else {
            panic!("expected failure, got {:?}", record.outcome);
        };
        assert!(reasons[0].contains("'callee' exited with Some(3)"), "{reasons:?}");
        assert_eq!(artifacts.len(), 4, "{artifacts:?}");
        for suffix in ["caller.xml", "caller.err", "callee.xml", "callee.err"] {
            let name = format!("Sipp Flow - TCP - {suffix}");
            let path = artifacts
                .iter()
                .find(|p| p.ends_with(&name))
                .unwrap_or_else(|| panic!("{name} not reported"));
            assert!(path.exists(), "{name} removed");
        }
        let stderr = artifacts.iter().find(|p| p.ends_with("Sipp Flow - TCP - callee.err"));
        let text = std::fs::read_to_string(stderr.unwrap()).unwrap();
        assert!(text.contains("no MESSAGE received"));
    }

    #[tokio::test]
    async fn passing_flow_leaves_no_files() {
        let bin_dir = tempfile::tempdir().unwrap();
        let bin = fake_sipp(bin_dir.path(), "exit 0", 0o755);
        let h = sipp_harness(&bin);
        let record = definition::run(&flow(), &h.env, Transport::Udp).await;

        assert!(record.outcome.is_passed(), "{:?}", record.outcome);
        assert_eq!(files_in(&h.env.deployment.artifact_dir), Vec::<PathBuf>::new());
    }

    #[tokio::test]
    async fn test_timeout_kills_the_generators() {
        let bin_dir = tempfile::tempdir().unwrap();
        let bin = fake_sipp(bin_dir.path(), "exec sleep 30", 0o755);
        let h = sipp_harness(&bin);
        let test = flow().with_timeout(Duration::from_millis(500));
        let started = std::time::Instant::now();
        let record = definition::run(&test, &h.env, Transport::Tcp).await;

        assert!(started.elapsed() < Duration::from_secs(10));
        let Outcome::Failed { reasons, artifacts } = &record.outcome else {
            panic!("expected failure, got {:?}", record.outcome);
        };
        assert!(reasons[0].contains("timed out"), "{reasons:?}");
        assert!(reasons[0].contains("2 call-generator process(es)"), "{reasons:?}");
        assert_eq!(artifacts.len(), 4, "{artifacts:?}");
    }

    #[tokio::test]
    async fn spawn_failure_reports_the_files_already_written() {
        let bin_dir = tempfile::tempdir().unwrap();
        // Present, so the run is not skipped, but not executable.
        let bin = fake_sipp(bin_dir.path(), "exit 0", 0o644);
        let h = sipp_harness(&bin);
        let record = definition::run(&flow(), &h.env, Transport::Tcp).await;

        let Outcome::Failed { reasons, artifacts } = &record.outcome else {
            panic!("expected failure, got {:?}", record.outcome);
        };
        assert!(reasons[0].contains("validation"), "{reasons:?}");
        assert!(
            artifacts
                .iter()
                .any(|p| p.ends_with("Sipp Flow - TCP - caller.xml")),
            "{artifacts:?}"
        );
        let mut on_disk = files_in(&h.env.deployment.artifact_dir);
        let mut reported = artifacts.clone();
        on_disk.sort();
        reported.sort();
        assert_eq!(on_disk, reported);
    }
}
