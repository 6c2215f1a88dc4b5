use fry_builder::batch::ProfileOutcome;
use fry_builder::stages::{
    compress::published_image, RunState, RunStatus, RunSummary, StageOutcome, StageState,
    StageStatus,
};
use fry_builder::workspace::Workspace;
use fry_builder::BuildPlan;

pub(crate) fn print_profiles(profiles: &[String]) {
    if profiles.is_empty() {
        println!("no profiles found");
        return;
    }
    for profile in profiles {
        println!("{}", profile);
    }
}

pub(crate) fn print_tools(tools: &[(&str, &str)]) {
    for (tool, package) in tools {
        let mark = if fry_builder::preflight::command_exists(tool) {
            "ok"
        } else {
            "MISSING"
        };
        println!("  {:<22} {:<16} {}", tool, package, mark);
    }
}

pub(crate) fn print_status(plan: &BuildPlan, statuses: &[StageStatus], run: &RunState) {
    println!(
        "{} ({}, {}) - {}",
        plan.profile(),
        plan.architecture(),
        plan.image_size(),
        run_label(run.status)
    );
    for status in statuses {
        println!(
            "  {:<16} {:<10} {}",
            status.stage.slug(),
            state_label(status.state),
            status.completed_at_utc.as_deref().unwrap_or("-")
        );
    }
    if let (Some(stage), Some(error)) = (&run.failed_stage, &run.error) {
        println!();
        println!("last failure in {}: {}", stage, error);
        println!("run `fry-builder build` to resume from {}", stage);
    }
}

pub(crate) fn print_summary(plan: &BuildPlan, workspace: &Workspace, summary: &RunSummary) {
    for (stage, outcome) in &summary.stages {
        let label = match outcome {
            StageOutcome::Ran => "ran",
            StageOutcome::Skipped => "up to date",
        };
        println!("  {:<16} {}", stage.slug(), label);
    }
    let published = published_image(plan, workspace);
    if published.is_file() {
        println!("image: {}", published.display());
    }
}

pub(crate) fn print_batch(outcomes: &[ProfileOutcome]) {
    for outcome in outcomes {
        match &outcome.result {
            Ok(summary) => println!(
                "  {:<20} ok      {:>6.1}s ({} ran, {} reused)",
                outcome.profile,
                outcome.elapsed_secs,
                summary.ran().len(),
                summary.skipped().len()
            ),
            Err(err) => println!(
                "  {:<20} FAILED  {:>6.1}s {:#}",
                outcome.profile, outcome.elapsed_secs, err
            ),
        }
    }
}

fn state_label(state: StageState) -> &'static str {
    match state {
        StageState::Pending => "pending",
        StageState::Running => "running",
        StageState::Succeeded => "done",
        StageState::Stale => "stale",
        StageState::Failed => "failed",
    }
}

fn run_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::NotStarted => "not started",
        RunStatus::InProgress => "in progress",
        RunStatus::Completed => "completed",
        RunStatus::Aborted => "aborted",
    }
}
