//! Terminal progress output.

use async_trait::async_trait;
use console::style;
use foundry_core::Result;
use foundry_core::events::Event;
use foundry_core::ports::EventSink;
use foundry_core::run::{LogStream, NodeStatus, Run, RunStatus};

/// Prints run progress as events arrive.
pub struct ConsoleReporter {
    follow: bool,
}

impl ConsoleReporter {
    pub fn new(follow: bool) -> Self {
        Self { follow }
    }
}

pub fn status_mark(status: NodeStatus) -> console::StyledObject<&'static str> {
    match status {
        NodeStatus::Succeeded => style("✓").green(),
        NodeStatus::Failed | NodeStatus::TimedOut => style("✗").red(),
        NodeStatus::Canceled => style("■").yellow(),
        NodeStatus::Skipped => style("○").dim(),
        NodeStatus::Running => style("▶").cyan(),
        NodeStatus::Pending => style("·").dim(),
    }
}

pub fn run_status(status: RunStatus) -> console::StyledObject<String> {
    let text = status.to_string();
    match status {
        RunStatus::Succeeded => style(text).green(),
        RunStatus::Failed => style(text).red(),
        RunStatus::Canceled => style(text).yellow(),
        _ => style(text).cyan(),
    }
}

pub fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1000)
    }
}

#[async_trait]
impl EventSink for ConsoleReporter {
    async fn publish(&self, event: Event) -> Result<()> {
        match event {
            Event::RunStarted(p) => println!(
                "{} Run {} of {} on {} ({})",
                style("▶").cyan(),
                style(p.run_id).bold(),
                style(&p.pipeline_name).bold(),
                style(&p.branch).dim(),
                p.reason
            ),
            Event::StageStarted(p) => println!("\n{} Stage {}", style("▶").cyan(), style(&p.stage).bold()),
            Event::StageCompleted(p) => {
                println!("{} Stage {} {}", status_mark(p.status), p.stage, p.status)
            }
            Event::JobStarted(p) => println!(
                "  {} {} on {}",
                style("▶").cyan(),
                p.job,
                style(&p.environment).dim()
            ),
            Event::JobCompleted(p) => {
                println!(
                    "  {} {} {} ({})",
                    status_mark(p.status),
                    p.job,
                    p.status,
                    format_duration(p.duration_ms)
                );
                if let Some(error) = p.error {
                    println!("      {}", style(error).red());
                }
            }
            Event::StepCompleted(p) if p.status != NodeStatus::Succeeded => println!(
                "    {} {} {}",
                status_mark(p.status),
                p.step,
                p.exit_code.map(|c| format!("(exit {})", c)).unwrap_or_default()
            ),
            Event::StepOutput(p) if self.follow => {
                let prefix = format!("    {} |", p.job.job);
                match p.stream {
                    LogStream::Stdout => println!("{} {}", style(prefix).dim(), p.content),
                    LogStream::Stderr => eprintln!("{} {}", style(prefix).dim(), p.content),
                }
            }
            Event::NodeSkipped(p) => println!(
                "  {} {} skipped ({})",
                status_mark(NodeStatus::Skipped),
                style(&p.node).dim(),
                p.reason
            ),
            Event::RunCanceled(_) => println!(
                "\n{} Cancellation requested, stopping running jobs",
                style("!").yellow()
            ),
            Event::RunCompleted(p) => println!(
                "\n{} Run {} in {}",
                style("■").bold(),
                run_status(p.status),
                format_duration(p.duration_ms)
            ),
            _ => {}
        }
        Ok(())
    }
}

/// Print a tree of stage, job and step states.
pub fn print_run(run: &Run) {
    println!(
        "Run {} of {} ({} on {})",
        style(run.id).bold(),
        style(&run.pipeline_name).bold(),
        run.trigger.reason,
        run.trigger.branch_name()
    );
    println!("  Status: {}", run_status(run.status));
    if let Some(ms) = run.duration_ms {
        println!("  Duration: {}", format_duration(ms));
    }
    for stage in &run.stages {
        let reason = stage
            .skip_reason
            .map(|r| format!(" ({})", r))
            .unwrap_or_default();
        println!(
            "  {} {}{}",
            status_mark(stage.status),
            style(&stage.name).bold(),
            style(reason).dim()
        );
        for job in &stage.jobs {
            let reason = job.skip_reason.map(|r| format!(" ({})", r)).unwrap_or_default();
            println!(
                "    {} {} [{}]{}",
                status_mark(job.status),
                job.name,
                style(&job.pool).dim(),
                style(reason).dim()
            );
            if let Some(error) = &job.error {
                println!("        {}", style(error).red());
            }
            for step in &job.steps {
                println!("      {} {}", status_mark(step.status), step.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(250), "250ms");
        assert_eq!(format_duration(1500), "1.5s");
        assert_eq!(format_duration(125_000), "2m05s");
    }
}
