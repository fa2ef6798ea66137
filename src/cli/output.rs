//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying progress, run
//! reports and recorded state in text or JSON.

use colored::{Color, Colorize};
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{DeployConfig, ValidationResult};
use crate::deploy::DeployDecision;
use crate::scheduler::{ProgressEvent, RunReport, StackStatus};
use crate::state::{DeploymentState, LockInfo};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug, Clone, Copy)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// What `diff` found for one stack.
#[derive(Debug, Clone, Serialize)]
pub struct DiffEntry {
    /// Full stack name.
    pub stack: String,
    /// Whether a deployment would happen, and why.
    pub decision: DeployDecision,
    /// The template differs from the one recorded by the last run.
    pub changed_since_last_run: bool,
}

/// Live view of one stack for `status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    /// Full stack name.
    pub stack: String,
    /// Remote status, `None` when the stack does not exist.
    pub remote_status: Option<String>,
    /// Result recorded by the last run.
    pub last_run: Option<StackStatus>,
    /// Outputs of the stack.
    pub outputs: Vec<(String, String)>,
}

#[derive(Tabled)]
struct ReportRow {
    #[tabled(rename = "Stack")]
    stack: String,
    #[tabled(rename = "Result")]
    result: String,
    #[tabled(rename = "Duration")]
    duration: String,
    #[tabled(rename = "Error")]
    error: String,
}

#[derive(Tabled)]
struct DiffRow {
    #[tabled(rename = "Stack")]
    stack: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "Stack")]
    stack: String,
    #[tabled(rename = "Remote")]
    remote: String,
    #[tabled(rename = "Last run")]
    last_run: String,
    #[tabled(rename = "Outputs")]
    outputs: usize,
}

/// Color of a remote status: failures red, rollbacks yellow, completions
/// green.
#[must_use]
pub fn status_color(status: &str) -> Option<Color> {
    if status.contains("FAILED") {
        Some(Color::Red)
    } else if status.contains("ROLLBACK") {
        Some(Color::Yellow)
    } else if status.ends_with("COMPLETE") {
        Some(Color::Green)
    } else {
        None
    }
}

fn colorize(text: &str, color: Option<Color>) -> String {
    color.map_or_else(|| text.to_string(), |c| text.color(c).to_string())
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Whether output is machine-readable.
    #[must_use]
    pub const fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Formats one progress event as a line, or `None` for events that are
    /// not shown.
    #[must_use]
    pub fn format_event(&self, event: &ProgressEvent) -> Option<String> {
        match self.format {
            OutputFormat::Json => serde_json::to_string(event).ok(),
            OutputFormat::Text => Self::format_event_text(event),
        }
    }

    fn format_event_text(event: &ProgressEvent) -> Option<String> {
        match event {
            ProgressEvent::StackStarted { stack, operation } => {
                Some(format!("{} {stack}: starting {operation}", "»".cyan()))
            }
            ProgressEvent::ResourceEvent { stack, event, first_error } => {
                let status = colorize(&event.resource_status, status_color(&event.resource_status));
                let mut line = format!(
                    "{stack} | {status} | {} | {}",
                    event.resource_type, event.logical_resource_id
                );
                if let Some(reason) = &event.resource_status_reason {
                    let reason = if *first_error {
                        reason.red().bold().to_string()
                    } else {
                        reason.clone()
                    };
                    let _ = write!(line, " {reason}");
                }
                Some(line)
            }
            ProgressEvent::StackFinished { stack, operation, status, error } => {
                let label = status.label(*operation);
                let mark = match status {
                    StackStatus::Failed => "✗".red(),
                    StackStatus::Unchanged => "=".dimmed(),
                    _ => "✓".green(),
                };
                Some(error.as_ref().map_or_else(
                    || format!("{mark} {stack}: {label}"),
                    |e| format!("{mark} {stack}: {label}: {e}"),
                ))
            }
            ProgressEvent::StackSkipped { stack, operation, reason } => Some(format!(
                "{} {stack}: {} ({reason})",
                "-".yellow(),
                StackStatus::Skipped.label(*operation)
            )),
            ProgressEvent::Bootstrapping => {
                Some(format!("{} Bootstrapping toolkit resources...", "»".cyan()))
            }
            ProgressEvent::Waiting { new_events, .. } => {
                (*new_events == 0).then(|| "Checking status...".dimmed().to_string())
            }
        }
    }

    /// Formats a run report.
    #[must_use]
    pub fn format_report(&self, report: &RunReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => Self::format_report_text(report),
        }
    }

    fn format_report_text(report: &RunReport) -> String {
        let mut output = String::new();

        if report.stacks.is_empty() {
            output.push_str("No stacks selected.\n");
            return output;
        }

        let rows: Vec<ReportRow> = report
            .stacks
            .iter()
            .map(|s| ReportRow {
                stack: s.name.clone(),
                result: Self::format_status(s.status(), report),
                duration: s
                    .duration()
                    .map(|d| format!("{}s", d.num_seconds()))
                    .unwrap_or_default(),
                error: s
                    .error_message
                    .as_deref()
                    .map(|e| Self::truncate(e, 60))
                    .unwrap_or_default(),
            })
            .collect();

        output.push('\n');
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        let succeeded = report.count(StackStatus::Succeeded);
        let _ = write!(
            output,
            "\n{}: {} {}, {} unchanged, {} failed, {} skipped ({} pass(es))\n",
            report.operation,
            succeeded.to_string().green(),
            StackStatus::Succeeded.label(report.operation),
            report.count(StackStatus::Unchanged),
            report.count(StackStatus::Failed).to_string().red(),
            report.count(StackStatus::Skipped).to_string().yellow(),
            report.passes
        );

        if !report.is_completed {
            let _ = writeln!(
                output,
                "{} Run stopped with stacks still in progress.",
                "⚠".yellow()
            );
        }

        output
    }

    fn format_status(status: StackStatus, report: &RunReport) -> String {
        let label = status.label(report.operation);
        match status {
            StackStatus::Succeeded => label.green().to_string(),
            StackStatus::Failed => label.red().to_string(),
            StackStatus::Skipped => label.yellow().to_string(),
            _ => label.dimmed().to_string(),
        }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(
        &self,
        config: &DeployConfig,
        result: &ValidationResult,
        show_warnings: bool,
    ) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
                "valid": result.is_valid(),
                "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "warnings": result.warnings,
                "stacks": config.stacks.iter().map(|s| config.stack_name(&s.name)).collect::<Vec<_>>(),
            }))
            .unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();
                if result.is_valid() {
                    let _ = writeln!(output, "{} Configuration is valid!", "✓".green());
                } else {
                    let _ = writeln!(output, "{} Configuration is invalid:", "✗".red());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                }

                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }

                let _ = write!(
                    output,
                    "\nConfiguration summary:\n   Project: {}\n   Stage: {}\n   Stacks: {}\n",
                    config.project.name,
                    config.project.stage,
                    config.stacks.len()
                );
                output
            }
        }
    }

    /// Formats the result of `diff`.
    #[must_use]
    pub fn format_diff(&self, entries: &[DiffEntry]) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(entries).unwrap_or_default(),
            OutputFormat::Text => {
                if entries.iter().all(|e| e.decision.is_skip()) {
                    return format!("{} No changes - every stack is up to date.\n", "✓".green());
                }

                let rows: Vec<DiffRow> = entries
                    .iter()
                    .map(|e| {
                        let (action, reason) = match &e.decision {
                            DeployDecision::Skip => ("skip".dimmed().to_string(), String::new()),
                            DeployDecision::Deploy(reason) => {
                                ("~deploy".yellow().to_string(), reason.to_string())
                            }
                        };
                        let reason = if e.changed_since_last_run {
                            format!("{reason} (changed since last run)")
                        } else {
                            reason
                        };
                        DiffRow {
                            stack: e.stack.clone(),
                            action,
                            reason,
                        }
                    })
                    .collect();

                let pending = entries.iter().filter(|e| !e.decision.is_skip()).count();
                format!(
                    "\n{}\n\nDiff: {} of {} stack(s) to deploy\n",
                    Table::new(rows),
                    pending.to_string().yellow(),
                    entries.len()
                )
            }
        }
    }

    /// Formats the live status of the project's stacks.
    #[must_use]
    pub fn format_stack_status(&self, config: &DeployConfig, entries: &[StatusEntry]) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(entries).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = write!(
                    output,
                    "\nProject: {}/{}\n\n",
                    config.project.name, config.project.stage
                );

                let rows: Vec<StatusRow> = entries
                    .iter()
                    .map(|e| StatusRow {
                        stack: e.stack.clone(),
                        remote: e.remote_status.as_deref().map_or_else(
                            || "not deployed".dimmed().to_string(),
                            |s| colorize(s, status_color(s)),
                        ),
                        last_run: e
                            .last_run
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| String::from("-")),
                        outputs: e.outputs.len(),
                    })
                    .collect();
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');

                let with_outputs: Vec<_> = entries.iter().filter(|e| !e.outputs.is_empty()).collect();
                if !with_outputs.is_empty() {
                    output.push_str("\nOutputs:\n");
                    for entry in with_outputs {
                        for (key, value) in &entry.outputs {
                            let _ = writeln!(output, "   {}.{key} = {value}", entry.stack);
                        }
                    }
                }
                output
            }
        }
    }

    /// Formats the run record.
    #[must_use]
    pub fn format_state(&self, state: &DeploymentState, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&serde_json::json!({
                "state": state,
                "lock": lock,
            }))
            .unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(output, "\nState: {}/{}\n\n", state.project, state.stage);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(
                    output,
                    "   Config hash: {}",
                    &state.config_hash[..8.min(state.config_hash.len())]
                );
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Stacks: {}", state.stacks.len());
                for record in state.stacks.values() {
                    let _ = writeln!(
                        output,
                        "     {} {} ({} outputs)",
                        record.name,
                        record.status,
                        record.outputs.len()
                    );
                }

                if let Some(lock) = lock {
                    let _ = writeln!(
                        output,
                        "   Locked by {} since {} ({}s left)",
                        lock.holder,
                        lock.acquired_at.format("%Y-%m-%d %H:%M"),
                        lock.remaining().num_seconds()
                    );
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({} stack(s))",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.stacks.len()
                        );
                    }
                }

                output
            }
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{head}...")
        }
    }
}
