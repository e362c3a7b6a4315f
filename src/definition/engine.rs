//! The run lifecycle: provision, run units, bounded join, guaranteed cleanup.

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use super::context::{Phase, RunContext, ScenarioContext};
use super::panic::{catch, Caught};
use super::{Environment, Outcome, RunRecord, TestCase};
use crate::config::Transport;
use crate::error::ScenarioError;
use crate::stats::LATENCY_STAT;

/// How a scenario unit ended.
enum UnitEnd {
    Finished,
    /// Stopped because a peer raised the skip signal.
    Cancelled,
    Raised(ScenarioError),
    Panicked(Caught),
}

struct Unit {
    role: String,
    ctx: ScenarioContext,
    handle: JoinHandle<UnitEnd>,
}

async fn drive(scenario: Box<dyn super::Scenario>, ctx: ScenarioContext) -> UnitEnd {
    let token = ctx.token().clone();
    let work = catch(scenario.execute(ctx.clone()));
    let ended = tokio::select! {
        _ = token.cancelled() => return UnitEnd::Cancelled,
        ended = work => ended,
    };
    match ended {
        Ok(Ok(())) => UnitEnd::Finished,
        Ok(Err(e)) => {
            if e.is_skip() {
                // Short-circuit the peers; the whole test becomes a skip.
                token.cancel();
            }
            ctx.note(format!("raised: {e}"));
            UnitEnd::Raised(e)
        }
        Err(caught) => {
            ctx.note(format!("panicked: {}", caught.message));
            UnitEnd::Panicked(caught)
        }
    }
}

/// Execute one test over one transport. Never panics and never returns an
/// error: every problem becomes part of the outcome.
pub async fn run(test: &dyn TestCase, env: &Arc<Environment>, transport: Transport) -> RunRecord {
    let run_id = uuid::Uuid::new_v4();
    let started_at = chrono::Utc::now();
    let clock = Instant::now();
    let span = info_span!("test", test = %test.name(), %transport, %run_id);

    let outcome = async {
        if let Some(skip) = test.variant().gate(&env.deployment) {
            return Outcome::from_error("gate", skip);
        }
        let mut run = RunContext::new(env.clone(), test.name(), transport, test.timeout());
        let captured = running(test, &mut run).await;
        let outcome = cleaning(test, &mut run, captured).await;
        post_validation(env, outcome).await
    }
    .instrument(span)
    .await;

    RunRecord {
        test: test.name().to_string(),
        transport,
        run_id,
        started_at,
        duration_ms: clock.elapsed().as_millis() as u64,
        outcome,
    }
}

/// Provisioning and Running. Errors are captured into the outcome, never
/// rethrown, so cleanup always gets its turn.
async fn running(test: &dyn TestCase, run: &mut RunContext) -> Outcome {
    run.set_phase(Phase::Provisioning);
    match catch(test.setup(run)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Outcome::from_error("setup", e),
        Err(caught) => return Outcome::failed(format!("setup panicked: {}", caught.message)),
    }

    run.set_phase(Phase::Running);
    for aux in run.auxiliaries().to_vec() {
        if let Err(e) = aux.start().await {
            return Outcome::failed(format!("failed to start {}: {:#}", aux.name(), e));
        }
    }

    let units: Vec<Unit> = std::mem::take(&mut run.units)
        .into_iter()
        .map(|pending| {
            let ctx = run.scenario_context(&pending.role);
            let handle = tokio::spawn(drive(pending.scenario, ctx.clone()));
            Unit {
                role: pending.role,
                ctx,
                handle,
            }
        })
        .collect();
    info!(units = units.len(), "scenario units started");

    let mut outcome = Outcome::Passed;
    let mut skip = None;

    match catch(test.extra_validation(run)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_skip() => {
            run.token().cancel();
            skip = Some(e);
        }
        Ok(Err(e)) => outcome.add_failure(format!("validation: {e}")),
        Err(caught) => outcome.add_failure(format!("validation panicked: {}", caught.message)),
    }

    let bound = run.environment().deployment.join_bound();
    for mut unit in units {
        let role = unit.role.clone();
        match tokio::time::timeout(bound, &mut unit.handle).await {
            Ok(Ok(UnitEnd::Finished)) | Ok(Ok(UnitEnd::Cancelled)) => {}
            Ok(Ok(UnitEnd::Raised(e))) if e.is_skip() => {
                skip.get_or_insert(e);
            }
            Ok(Ok(UnitEnd::Raised(e))) => {
                error!(%role, "scenario failed: {}", e);
                outcome.add_failure(format!("[{role}] {e}"));
                write_trace(run, &unit, None);
            }
            Ok(Ok(UnitEnd::Panicked(caught))) => {
                error!(%role, "scenario panicked: {}", caught.message);
                outcome.add_failure(format!("[{role}] panicked: {}", caught.message));
                write_trace(run, &unit, caught.backtrace.as_deref());
            }
            Ok(Err(join_err)) => {
                outcome.add_failure(format!("[{role}] unit lost: {join_err}"));
            }
            Err(_) => {
                let trail = unit.ctx.trail();
                let last = trail
                    .last()
                    .map(|t| t.step.clone())
                    .unwrap_or_else(|| "no steps recorded".to_string());
                error!(
                    %role,
                    bound = ?bound,
                    last_step = %last,
                    "scenario still running at join bound; aborting"
                );
                unit.handle.abort();
                outcome.add_failure(format!(
                    "[{role}] timed out after {bound:?}; last step: {last}"
                ));
                write_trace(run, &unit, None);
            }
        }
    }

    match skip {
        Some(e) => Outcome::from_error("scenario", e),
        None => attach_artifacts(outcome, run),
    }
}

/// Cleaning. Runs for every outcome; only the cleanup block and the
/// post-check can turn a pass into a failure here.
async fn cleaning(test: &dyn TestCase, run: &mut RunContext, mut outcome: Outcome) -> Outcome {
    run.set_phase(Phase::Cleaning);
    match catch(test.cleanup(run)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!("cleanup block failed: {}", e);
            outcome.add_failure(format!("cleanup: {e}"));
        }
        Err(caught) => outcome.add_failure(format!("cleanup panicked: {}", caught.message)),
    }

    if outcome.is_failed() {
        if let Err(caught) = catch(test.on_failure(run)).await {
            warn!("failure hook panicked: {}", caught.message);
        }
        outcome = attach_artifacts(outcome, run);
    }

    run.release_endpoints().await;
    run.release_auxiliaries().await;
    run.clear();
    run.set_phase(Phase::Done);
    outcome
}

async fn post_validation(env: &Environment, mut outcome: Outcome) -> Outcome {
    if !env.stats_check || !outcome.is_passed() {
        return outcome;
    }
    let Some(stats) = &env.stats else {
        outcome.add_failure("statistics: no statistics source configured");
        return outcome;
    };
    let ceiling = std::time::Duration::try_from_secs_f64(env.deployment.latency_ceiling_ms / 1000.0)
        .unwrap_or_default();
    match stats.latency(LATENCY_STAT).await {
        Ok(s) => {
            for v in s.violations(ceiling) {
                outcome.add_failure(format!("statistics: {v}"));
            }
        }
        Err(e) => outcome.add_failure(format!("statistics: {e:#}")),
    }
    outcome
}

fn attach_artifacts(outcome: Outcome, run: &RunContext) -> Outcome {
    match outcome {
        Outcome::Failed {
            reasons,
            mut artifacts,
        } => {
            for path in run.artifacts() {
                if !artifacts.contains(path) {
                    artifacts.push(path.clone());
                }
            }
            Outcome::Failed { reasons, artifacts }
        }
        other => other,
    }
}

fn write_trace(run: &mut RunContext, unit: &Unit, backtrace: Option<&str>) {
    let path = run.artifact_path(&format!("{}.trace", unit.role));
    let mut text: Vec<String> = unit.ctx.trail().iter().map(|t| t.to_string()).collect();
    if text.is_empty() {
        text.push("no steps recorded".to_string());
    }
    if let Some(bt) = backtrace {
        text.push(String::new());
        text.push(bt.to_string());
    }
    let written = path
        .parent()
        .map_or(Ok(()), std::fs::create_dir_all)
        .and_then(|_| std::fs::write(&path, text.join("\n") + "\n"));
    match written {
        Ok(()) => run.add_artifact(path),
        Err(e) => warn!(path = %path.display(), "failed to write trace: {}", e),
    }
}
