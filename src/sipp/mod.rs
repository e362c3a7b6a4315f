//! Tests driven by external SIPp call generators.
//!
//! The message flow is written once as a list of [`SippStep`]s; each role
//! gets its own generated script in which it sends its own messages and
//! receives the ones addressed to it. One process runs per role.

pub mod process;

use std::path::PathBuf;
use std::time::Duration;

use crate::config::Transport;
use crate::definition::{artifact_path, RunContext, TestCase, Variant, DEFAULT_TIMEOUT};
use crate::error::{ProcessError, ScenarioError};

/// Placeholder replaced by a unique label id in every generated message.
pub const LABEL_PLACEHOLDER: &str = "[label]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SippStep {
    /// `from` sends `message`; `to` expects it.
    Send {
        from: String,
        to: String,
        message: String,
        /// The receiver tolerates its absence (e.g. a 180 Ringing).
        optional: bool,
    },
    Pause {
        role: String,
        millis: u64,
    },
}

impl SippStep {
    pub fn send(from: &str, to: &str, message: &str) -> Self {
        SippStep::Send {
            from: from.to_string(),
            to: to.to_string(),
            message: message.trim().to_string(),
            optional: false,
        }
    }

    pub fn optional(from: &str, to: &str, message: &str) -> Self {
        SippStep::Send {
            from: from.to_string(),
            to: to.to_string(),
            message: message.trim().to_string(),
            optional: true,
        }
    }

    pub fn pause(role: &str, millis: u64) -> Self {
        SippStep::Pause {
            role: role.to_string(),
            millis,
        }
    }
}

/// One generated script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleScript {
    pub role: String,
    pub xml: String,
}

fn escape_attr(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// `recv` attributes matching the first line of `message`.
fn recv_attrs(message: &str) -> Result<String, ProcessError> {
    let first = message.lines().next().unwrap_or_default().trim();
    if let Some(rest) = first.strip_prefix("SIP/2.0 ") {
        let code = rest.split_whitespace().next().unwrap_or_default();
        if code.parse::<u16>().is_err() {
            return Err(ProcessError::Script(format!("bad status line '{first}'")));
        }
        return Ok(format!("response=\"{code}\""));
    }
    match first.split_whitespace().next() {
        Some(method) if method.chars().all(|c| c.is_ascii_uppercase()) => {
            Ok(format!("request=\"{method}\""))
        }
        _ => Err(ProcessError::Script(format!("cannot tell what '{first}' is"))),
    }
}

/// Roles in order of first appearance.
pub fn roles(steps: &[SippStep]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |r: &String| {
        if !out.contains(r) {
            out.push(r.clone());
        }
    };
    for step in steps {
        match step {
            SippStep::Send { from, to, .. } => {
                push(from);
                push(to);
            }
            SippStep::Pause { role, .. } => push(role),
        }
    }
    out
}

/// Generate one script per role. `next_label` supplies unique ids for
/// [`LABEL_PLACEHOLDER`]; a message gets the same id in both scripts.
pub fn generate_scripts(
    test: &str,
    steps: &[SippStep],
    mut next_label: impl FnMut() -> u64,
) -> Result<Vec<RoleScript>, ProcessError> {
    let roles = roles(steps);
    let mut bodies: Vec<String> = vec![String::new(); roles.len()];
    let index = |r: &str| roles.iter().position(|x| x == r).unwrap_or_default();

    for step in steps {
        match step {
            SippStep::Send {
                from,
                to,
                message,
                optional,
            } => {
                if message.contains("]]>") {
                    return Err(ProcessError::Script("message contains ']]>'".into()));
                }
                let attrs = recv_attrs(message)?;
                let text = if message.contains(LABEL_PLACEHOLDER) {
                    message.replace(LABEL_PLACEHOLDER, &next_label().to_string())
                } else {
                    message.clone()
                };
                bodies[index(from)].push_str(&format!(
                    "  <send>\n    <![CDATA[\n{text}\n    ]]>\n  </send>\n"
                ));
                let opt = if *optional { " optional=\"true\"" } else { "" };
                bodies[index(to)].push_str(&format!("  <recv {attrs}{opt}/>\n"));
            }
            SippStep::Pause { role, millis } => {
                bodies[index(role)].push_str(&format!("  <pause milliseconds=\"{millis}\"/>\n"));
            }
        }
    }

    Ok(roles
        .into_iter()
        .zip(bodies)
        .map(|(role, body)| {
            let xml = format!(
                "<?xml version=\"1.0\" encoding=\"ISO-8859-1\" ?>\n<scenario name=\"{}\">\n{}</scenario>\n",
                escape_attr(&format!("{test} - {role}")),
                body
            );
            RoleScript { role, xml }
        })
        .collect())
}

/// Script file for `role`.
pub fn script_path(dir: &std::path::Path, test: &str, transport: Transport, role: &str) -> PathBuf {
    artifact_path(dir, test, transport, &format!("{role}.xml"))
}

/// A test whose whole flow runs in SIPp processes.
pub struct SippTest {
    name: String,
    timeout: Duration,
    steps: Vec<SippStep>,
}

impl SippTest {
    pub fn new(name: &str, steps: Vec<SippStep>) -> Self {
        Self {
            name: name.to_string(),
            timeout: DEFAULT_TIMEOUT,
            steps,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait::async_trait]
impl TestCase for SippTest {
    fn name(&self) -> &str {
        &self.name
    }

    fn variant(&self) -> Variant {
        Variant::SippDriven
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn setup(&self, _run: &mut RunContext) -> Result<(), ScenarioError> {
        Ok(())
    }

    async fn extra_validation(&self, run: &mut RunContext) -> Result<(), ScenarioError> {
        process::run_scripts(run, &self.steps).await
    }
}
