//! Process-wide catalog of test definitions and the sequential runner.

use std::sync::Arc;

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{RunnerConfig, Transport};
use crate::definition::{self, Environment, Outcome, RunRecord, TestCase};

/// Case-sensitive wildcard match; `*` matches any run of characters and `?`
/// exactly one.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0, 0);
    // Position of the last `*` and the name index it was tried against.
    let mut star: Option<(usize, usize)> = None;
    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((sp, sn)) = star {
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

/// Reporting label of a (test, transport) pair, also what exclusions match.
pub fn run_label(name: &str, transport: Transport) -> String {
    format!("{name} ({transport})")
}

pub fn is_excluded(label: &str, exclusions: &[String]) -> bool {
    exclusions.iter().any(|prefix| label.starts_with(prefix.as_str()))
}

#[derive(Default)]
pub struct Registry {
    tests: Vec<Arc<dyn TestCase>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition. Names must be unique.
    pub fn register(&mut self, test: impl TestCase + 'static) -> Result<()> {
        if self.tests.iter().any(|t| t.name() == test.name()) {
            bail!("duplicate test name '{}'", test.name());
        }
        self.tests.push(Arc::new(test));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Definitions whose name matches `pattern`, in registration order.
    pub fn select(&self, pattern: &str) -> Vec<Arc<dyn TestCase>> {
        self.tests
            .iter()
            .filter(|t| glob_match(pattern, t.name()))
            .cloned()
            .collect()
    }

    /// Run every selected (test, transport) pair `repeat` times, one at a
    /// time, then sweep leaked identities once.
    pub async fn run_all(
        &self,
        env: &Arc<Environment>,
        config: &RunnerConfig,
        pattern: &str,
        mut on_record: impl FnMut(&RunRecord),
    ) -> Summary {
        let selected = self.select(pattern);
        info!(
            %pattern,
            selected = selected.len(),
            transports = ?config.transports,
            repeat = config.repeat,
            "starting test run"
        );

        let mut summary = Summary::default();
        for iteration in 1..=config.repeat {
            if config.repeat > 1 {
                info!(iteration, of = config.repeat, "iteration");
            }
            for test in &selected {
                for &transport in &config.transports {
                    let label = run_label(test.name(), transport);
                    let record = if is_excluded(&label, &config.exclusions) {
                        excluded_record(test.name(), transport)
                    } else {
                        definition::run(test.as_ref(), env, transport).await
                    };
                    summary.count(&record);
                    on_record(&record);
                    summary.records.push(record);
                }
            }
        }

        match env.provisioner.sweep_leaked(&env.deployment.domain).await {
            Ok(0) => {}
            Ok(n) => warn!(count = n, "removed leaked identities"),
            Err(e) => warn!("leaked identity sweep failed: {}", e),
        }
        summary
    }
}

fn excluded_record(name: &str, transport: Transport) -> RunRecord {
    RunRecord {
        test: name.to_string(),
        transport,
        run_id: uuid::Uuid::new_v4(),
        started_at: chrono::Utc::now(),
        duration_ms: 0,
        outcome: Outcome::Skipped {
            reason: "excluded".to_string(),
            remediation: None,
        },
    }
}

/// Aggregate counts, mutated only by the sequential runner loop.
#[derive(Debug, Default, Serialize)]
pub struct Summary {
    pub run: u32,
    pub failed: u32,
    pub skipped: u32,
    pub records: Vec<RunRecord>,
}

impl Summary {
    fn count(&mut self, record: &RunRecord) {
        self.run += 1;
        match record.outcome {
            Outcome::Failed { .. } => self.failed += 1,
            Outcome::Skipped { .. } => self.skipped += 1,
            Outcome::Passed => {}
        }
    }

    pub fn success(&self) -> bool {
        self.failed == 0
    }
}
