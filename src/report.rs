//! Outcome markers printed by validation scripts.
//!
//! Scripts report by printing lines such as `[TASK_SUCCESS] binary runs` or
//! `[TASK_FAILED] jq --version printed nothing`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

const SUCCESS_TOKEN: &str = "TASK_SUCCESS";

fn marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[(TASK_SUCCESS|TASK_FAILED)\]\s*(.*)").expect("marker pattern is valid")
    })
}

/// True if the output mentions the success token anywhere.
pub fn script_succeeded(output: &str) -> bool {
    output.contains(SUCCESS_TOKEN)
}

/// Success and failure reasons collected from a validation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Reasons from `[TASK_SUCCESS]` lines.
    pub successes: Vec<String>,
    /// Reasons from `[TASK_FAILED]` lines.
    pub failures: Vec<String>,
}

impl ValidationReport {
    /// Collects marker lines; markers with an empty reason are ignored.
    pub fn parse(output: &str) -> Self {
        let mut report = Self::default();
        for line in output.lines() {
            let Some(caps) = marker_regex().captures(line.trim()) else {
                continue;
            };
            let reason = caps[2].trim();
            if reason.is_empty() {
                continue;
            }
            if &caps[1] == SUCCESS_TOKEN {
                report.successes.push(reason.to_string());
            } else {
                report.failures.push(reason.to_string());
            }
        }
        report
    }

    /// Like [`ValidationReport::parse`], but a script that reports nothing
    /// counts as failed.
    pub fn evaluate(output: &str, script_name: &str) -> Self {
        let mut report = Self::parse(output);
        if report.successes.is_empty() && report.failures.is_empty() {
            report
                .failures
                .push(format!("No success reported by script: {script_name}"));
        }
        report
    }

    /// True when at least one success and no failure was reported.
    pub fn passed(&self) -> bool {
        !self.successes.is_empty() && self.failures.is_empty()
    }
}
