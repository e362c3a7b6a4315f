//! Console and JSON reporting of run results.

use std::io::IsTerminal;
use std::path::Path;

use anyhow::{Context, Result};

use crate::definition::{Outcome, RunRecord};
use crate::registry::{run_label, Summary};

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const RESET: &str = "\x1b[0m";

fn paint(text: &str, color: &str, colored: bool) -> String {
    if colored {
        format!("{color}{text}{RESET}")
    } else {
        text.to_string()
    }
}

/// One summary line, plus indented detail for failures and skip reasons.
pub fn format_record(record: &RunRecord, colored: bool) -> Vec<String> {
    let label = run_label(&record.test, record.transport);
    match &record.outcome {
        Outcome::Passed => vec![format!(
            "{label} {} ({} ms)",
            paint("Passed", GREEN, colored),
            record.duration_ms
        )],
        Outcome::Skipped {
            reason,
            remediation,
        } => {
            let mut lines = vec![format!(
                "{label} {} ({reason})",
                paint("Skipped", YELLOW, colored)
            )];
            if let Some(hint) = remediation {
                lines.push(format!("    -> {hint}"));
            }
            lines
        }
        Outcome::Failed { reasons, artifacts } => {
            let mut lines = vec![format!(
                "{label} {} ({} ms)",
                paint("Failed", RED, colored),
                record.duration_ms
            )];
            for reason in reasons {
                for line in reason.lines() {
                    lines.push(format!("    {line}"));
                }
            }
            for path in artifacts {
                lines.push(format!("    see {}", path.display()));
            }
            lines
        }
    }
}

pub fn print_record(record: &RunRecord) {
    for line in format_record(record, std::io::stdout().is_terminal()) {
        println!("{line}");
    }
}

/// The two closing lines.
pub fn format_totals(summary: &Summary) -> [String; 2] {
    [
        format!("{} failures out of {} tests run", summary.failed, summary.run),
        format!("{} tests skipped", summary.skipped),
    ]
}

pub fn print_totals(summary: &Summary) {
    println!();
    for line in format_totals(summary) {
        println!("{line}");
    }
}

pub fn write_json(summary: &Summary, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(summary)?;
    std::fs::write(path, json).with_context(|| format!("failed to write report {}", path.display()))
}
