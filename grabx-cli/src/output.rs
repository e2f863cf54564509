//! Terminal output
//!
//! Prints state changes and throttled progress while downloads run, and a
//! per-job summary at the end.

use colored::*;
use grabx_core::{Job, JobId, JobState, ProgressPhase, ProgressUpdate, StateChange};
use grabx_engine::{EventStream, JobRegistry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Minimum time between two progress lines of the same job
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Colorize a job state for display
pub fn colorize_state(state: JobState) -> ColoredString {
    let label = state.to_string();
    match state {
        JobState::Pending => label.yellow(),
        JobState::Running => label.cyan(),
        JobState::Succeeded => label.green(),
        JobState::Failed => label.red(),
        JobState::Cancelled => label.dimmed(),
    }
}

/// Prints live events until `stop` fires, then flushes what is left
pub async fn watch(
    registry: Arc<JobRegistry>,
    mut events: EventStream<StateChange>,
    mut progress: EventStream<ProgressUpdate>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut printer = Printer::new(registry);

    loop {
        tokio::select! {
            Some(change) = events.recv() => printer.state_change(&change),
            Some(update) = progress.recv() => printer.progress(&update),
            _ = &mut stop => break,
            else => break,
        }
    }

    for change in events.drain() {
        printer.state_change(&change);
    }
}

struct Printer {
    registry: Arc<JobRegistry>,
    last_progress: HashMap<JobId, (Instant, ProgressPhase)>,
}

impl Printer {
    fn new(registry: Arc<JobRegistry>) -> Self {
        Self {
            registry,
            last_progress: HashMap::new(),
        }
    }

    fn state_change(&mut self, change: &StateChange) {
        let job = self.registry.snapshot(change.id).ok();
        let locator = job
            .as_ref()
            .map(|job| job.target.locator.as_str())
            .unwrap_or_default();

        let mut line = format!(
            "{} {} {} {}",
            "▸".cyan(),
            change.id.to_string().dimmed(),
            colorize_state(change.to),
            locator
        );

        match change.to {
            JobState::Running if change.attempt > 1 => {
                line.push_str(&format!(" (attempt {})", change.attempt).dimmed().to_string());
            }
            JobState::Pending | JobState::Failed => {
                if let Some(error) = job.as_ref().and_then(|job| job.last_error.as_ref()) {
                    line.push_str(&format!("\n    {}", error.message.red()));
                }
            }
            _ => {}
        }

        if change.to != JobState::Running {
            self.last_progress.remove(&change.id);
        }
        println!("{}", line);
    }

    fn progress(&mut self, update: &ProgressUpdate) {
        let now = Instant::now();
        let phase = update.progress.phase;

        // Always show a phase change; otherwise at most once per interval
        if let Some((at, last_phase)) = self.last_progress.get(&update.id) {
            if *last_phase == phase && now.duration_since(*at) < PROGRESS_INTERVAL {
                return;
            }
        }
        self.last_progress.insert(update.id, (now, phase));

        let p = &update.progress;
        let detail = match phase {
            ProgressPhase::Preparing => "preparing".to_string(),
            ProgressPhase::PostProcessing => "post-processing".to_string(),
            ProgressPhase::Downloading => {
                let mut parts = vec![match p.percent() {
                    Some(pct) => format!("{:5.1}%", pct),
                    None => "  ...".to_string(),
                }];
                if let Some(total) = p.total_bytes {
                    parts.push(format!("of {}", format_bytes(total)));
                }
                if let Some(speed) = &p.speed {
                    parts.push(format!("at {}", speed));
                }
                if let Some(eta) = &p.eta {
                    parts.push(format!("ETA {}", eta));
                }
                parts.join(" ")
            }
        };

        println!("    {} {}", update.id.to_string().dimmed(), detail.dimmed());
    }
}

/// Human readable binary size, e.g. `10.5 MiB`
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Print a summary line per job plus totals
pub fn print_summary(jobs: &[Job]) {
    println!();
    println!("{}", "─".repeat(80).dimmed());
    println!("{}", format!("Summary of {} job(s):", jobs.len()).bold());
    println!();

    for job in jobs {
        print_job_summary(job);
    }

    let count = |state: JobState| jobs.iter().filter(|j| j.state == state).count();
    println!("{}", "─".repeat(80).dimmed());
    println!(
        "  {} succeeded, {} failed, {} cancelled",
        count(JobState::Succeeded).to_string().green(),
        count(JobState::Failed).to_string().red(),
        count(JobState::Cancelled).to_string().dimmed()
    );
}

fn print_job_summary(job: &Job) {
    println!(
        "  {} Job {} {}",
        "▸".cyan(),
        job.id.to_string().dimmed(),
        job.target.locator
    );
    println!("    Status:   {}", colorize_state(job.state));
    println!("    Attempts: {}", job.attempt);

    if let (Some(started), Some(completed)) = (job.started_at, job.completed_at) {
        let elapsed = completed - started;
        println!(
            "    Finished: {} ({}s)",
            completed.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            elapsed.num_seconds()
        );
    }

    let files = job
        .result
        .as_ref()
        .and_then(|r| r.get("files"))
        .and_then(|f| f.as_array());
    if let Some(files) = files {
        for file in files.iter().filter_map(|f| f.as_str()) {
            println!("    File:     {}", file.green());
        }
    }

    if let Some(error) = &job.last_error {
        println!("    Error:    {}", error.message.red());
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(10 * 1024 * 1024 + 512 * 1024), "10.5 MiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }
}
