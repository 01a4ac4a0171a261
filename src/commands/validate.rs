//! Run a validation script and report its outcome.

use anyhow::{bail, Context, Result};
use colored::Colorize;
use std::fmt::Write;
use std::path::Path;

use benchbox::{Config, ValidationReport};

use super::SandboxArgs;

/// Runs the script on the validation channel and fails unless it passed.
pub async fn run(args: &SandboxArgs, file: &Path, config: &Config) -> Result<()> {
    let script = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read script: {}", file.display()))?;
    args.environment(config)?;
    let script_name = file
        .file_name()
        .map_or_else(|| file.display().to_string(), |n| n.to_string_lossy().into_owned());

    let sandbox = args.open(config).await?;
    let outcome = sandbox.run_validation_bash_script(&script).await;
    sandbox.dispose().await?;

    let report = ValidationReport::evaluate(&outcome?, &script_name);
    print!("{}", format_report(&report));
    if !report.passed() {
        bail!("Validation failed: {script_name}");
    }
    Ok(())
}

fn format_report(report: &ValidationReport) -> String {
    let mut out = String::new();
    for reason in &report.successes {
        let _ = writeln!(out, "{} {reason}", "✓".green());
    }
    for reason in &report.failures {
        let _ = writeln!(out, "{} {reason}", "✗".red());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_report() {
        colored::control::set_override(false);
        let report = ValidationReport {
            successes: vec!["binary exists".to_string()],
            failures: vec!["version mismatch".to_string()],
        };
        assert_eq!(
            format_report(&report),
            "✓ binary exists\n✗ version mismatch\n"
        );
    }
}
