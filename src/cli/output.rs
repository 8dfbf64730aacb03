//! CLI output formatting

use crate::core::{RunEvent, RunStatus, TaskState};
use crate::persistence::{RecordedEvent, RunSnapshot};
use crate::registry::ExecutableUnitDescriptor;
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static STOP: Emoji<'_, '_> = Emoji("🛑 ", "x ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");

/// Create a progress bar
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    progress.set_style(style);
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Horizontal rule as wide as the terminal
pub fn separator() -> String {
    let width = term_size::dimensions_stdout().map(|(w, _)| w).unwrap_or(80);
    style("─".repeat(width.min(120))).dim().to_string()
}

/// Short form of a run ID
pub fn short_id(id: &uuid::Uuid) -> String {
    id.to_string()[..8].to_string()
}

/// Format a task state for display
pub fn format_task_state(state: &TaskState) -> String {
    let label = state.label();
    match state {
        TaskState::Pending | TaskState::Skipped { .. } => style(label).dim().to_string(),
        TaskState::Ready { .. } => style(label).blue().to_string(),
        TaskState::Running { .. } | TaskState::Cancelled { .. } => {
            style(label).yellow().to_string()
        }
        TaskState::Succeeded { .. } => style(label).green().to_string(),
        TaskState::Failed { .. } => style(label).red().to_string(),
    }
}

/// Format a run status for display
pub fn format_status(status: RunStatus) -> String {
    let label = status.as_str().to_uppercase();
    match status {
        RunStatus::Pending => style(label).dim().to_string(),
        RunStatus::Running | RunStatus::Cancelled => style(label).yellow().to_string(),
        RunStatus::Succeeded => style(label).green().to_string(),
        RunStatus::Failed => style(label).red().to_string(),
    }
}

fn status_icon(status: RunStatus) -> Emoji<'static, 'static> {
    match status {
        RunStatus::Succeeded => CHECK,
        RunStatus::Failed => CROSS,
        RunStatus::Cancelled => STOP,
        RunStatus::Running => SPINNER,
        RunStatus::Pending => INFO,
    }
}

/// One-line summary of a recorded run
pub fn format_snapshot_summary(snapshot: &RunSnapshot) -> String {
    let finished = snapshot
        .tasks
        .iter()
        .filter(|t| t.state.is_terminal())
        .count();
    let started = snapshot
        .started_at
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());

    format!(
        "{}{} - {} - {} ({}/{}) - {}",
        status_icon(snapshot.status),
        style(short_id(&snapshot.run_id)).dim(),
        style(&snapshot.pipeline_name).bold(),
        format_status(snapshot.status),
        finished,
        snapshot.tasks.len(),
        style(started).dim()
    )
}

/// Task table of a recorded run
pub fn format_snapshot_tasks(snapshot: &RunSnapshot) -> String {
    let width = snapshot
        .tasks
        .iter()
        .map(|t| t.name.len())
        .max()
        .unwrap_or(0);

    snapshot
        .tasks
        .iter()
        .map(|task| {
            let mut line = format!(
                "  {:width$}  {:<10} {}",
                task.name,
                task.kind,
                format_task_state(&task.state),
                width = width
            );
            match &task.state {
                TaskState::Failed { error, .. } => {
                    line.push_str(&format!("  {}", style(error).red()));
                }
                TaskState::Skipped { reason } => {
                    line.push_str(&format!("  {}", style(reason).dim()));
                }
                _ => {}
            }
            for (name, value) in &task.results {
                line.push_str(&format!("\n  {:width$}    {} = {}", "", style(name).cyan(), value, width = width));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Format a run event for display
pub fn format_run_event(event: &RunEvent) -> Option<String> {
    match event {
        RunEvent::RunStarted { pipeline_name, params } => {
            let mut line = format!("{}Starting pipeline {}", ROCKET, style(pipeline_name).bold());
            for (name, value) in params {
                line.push_str(&format!("\n   {} = {}", style(name).dim(), value));
            }
            Some(line)
        }
        RunEvent::TaskStateChanged { task, state } => match state {
            TaskState::Running { .. } => Some(format!("{}{}", SPINNER, style(task).cyan())),
            TaskState::Succeeded { .. } => Some(format!("{}{}", CHECK, style(task).green())),
            TaskState::Failed { error, .. } => Some(format!(
                "{}{} - {}",
                CROSS,
                style(task).red(),
                style(error).red()
            )),
            TaskState::Cancelled { .. } => {
                Some(format!("{}{} cancelled", STOP, style(task).yellow()))
            }
            TaskState::Skipped { reason } => Some(format!(
                "{}{} {}",
                SKIP,
                style(task).dim(),
                style(format!("({})", reason)).dim()
            )),
            TaskState::Pending | TaskState::Ready { .. } => None,
        },
        RunEvent::TaskOutput { .. } => None,
        RunEvent::RunCompleted { status } => Some(format!(
            "{}Pipeline {}",
            status_icon(*status),
            format_status(*status)
        )),
    }
}

/// One line of a recorded event log
pub fn format_recorded_event(recorded: &RecordedEvent) -> String {
    let detail = match &recorded.event {
        RunEvent::RunStarted { pipeline_name, .. } => format!("run started ({})", pipeline_name),
        RunEvent::TaskStateChanged { task, state } => {
            format!("{} -> {}", task, format_task_state(state))
        }
        RunEvent::TaskOutput { task, output } => {
            format!("{} output ({} lines)", task, output.lines().count())
        }
        RunEvent::RunCompleted { status } => format!("run completed: {}", format_status(*status)),
    };

    format!(
        "{:>4}  {}  {}",
        recorded.sequence,
        style(recorded.recorded_at.format("%H:%M:%S%.3f")).dim(),
        detail
    )
}

/// One line per task kind
pub fn format_descriptor(descriptor: &ExecutableUnitDescriptor) -> String {
    let params = descriptor
        .params
        .iter()
        .map(|p| {
            if p.default.is_some() {
                format!("[{}]", p.name)
            } else {
                p.name.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ");

    let mut line = format!("{:<18} {}", style(descriptor.kind.name()).bold(), params);
    if let Some(description) = &descriptor.description {
        line.push_str(&format!("\n{:<18} {}", "", style(description).dim()));
    }
    line
}

/// Format captured output, keeping the last `max_lines` lines
pub fn format_output(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();
    if lines.len() <= max_lines {
        return output.trim_end().to_string();
    }

    let skipped = lines.len() - max_lines;
    format!(
        "{}\n{}",
        style(format!("... ({} lines omitted)", skipped)).dim(),
        lines[skipped..].join("\n")
    )
}
