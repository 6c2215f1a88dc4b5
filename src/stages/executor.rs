//! Sequential stage runner with fingerprint skipping and resume.

use std::collections::BTreeMap;
use std::fs;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use super::markers::{
    self, clear_marker, clear_running, is_running, mark_running, read_marker, read_run_state,
    write_marker, write_run_state, RunState, RunStatus, StageMarker,
};
use super::{compress, fingerprint, StageContext, StageId};
use crate::artifact::disk;
use crate::artifact::filesystem::remove_path;
use crate::error::BuildError;
use crate::workspace::now_utc_compact;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageOutcome {
    Ran,
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub stages: Vec<(StageId, StageOutcome)>,
}

impl RunSummary {
    pub fn ran(&self) -> Vec<StageId> {
        self.with_outcome(StageOutcome::Ran)
    }

    pub fn skipped(&self) -> Vec<StageId> {
        self.with_outcome(StageOutcome::Skipped)
    }

    fn with_outcome(&self, outcome: StageOutcome) -> Vec<StageId> {
        self.stages
            .iter()
            .filter(|(_, o)| *o == outcome)
            .map(|(stage, _)| *stage)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageState {
    Pending,
    Running,
    Succeeded,
    /// Completed once, but its inputs changed or its outputs are gone.
    Stale,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageStatus {
    pub stage: StageId,
    pub state: StageState,
    pub completed_at_utc: Option<String>,
}

pub struct StageExecutor<'a> {
    ctx: StageContext<'a>,
}

impl<'a> StageExecutor<'a> {
    pub fn new(ctx: StageContext<'a>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &StageContext<'a> {
        &self.ctx
    }

    /// Every stage through validation. Also the resume entry point.
    pub fn run_all(&self) -> Result<RunSummary> {
        self.run_through(StageId::Validate)
    }

    /// `last` and everything it depends on.
    pub fn run_through(&self, last: StageId) -> Result<RunSummary> {
        self.run(&last.closure())
    }

    /// Only `stage`; its dependencies must already be complete and current.
    pub fn run_only(&self, stage: StageId) -> Result<RunSummary> {
        self.run(&[stage])
    }

    fn run(&self, selection: &[StageId]) -> Result<RunSummary> {
        let ws = self.ctx.workspace;
        if selection.contains(&StageId::ImageAssemble) {
            disk::check_bootloader(self.ctx.plan, &self.ctx.packages)?;
        }

        let _lock = ws.lock()?;
        ws.ensure()?;
        self.recover_interrupted()?;
        let fingerprints = self.fingerprints()?;

        let mut state = read_run_state(ws)?;
        state.status = RunStatus::InProgress;
        state.failed_stage = None;
        state.error = None;
        state.updated_at_utc = now_utc_compact();
        write_run_state(ws, &state)?;

        let mut summary = RunSummary::default();
        for &stage in selection {
            let fp = &fingerprints[&stage];
            if stage != StageId::Validate && self.is_current(stage, fp)? {
                info!(stage = %stage, "up to date, skipping");
                summary.stages.push((stage, StageOutcome::Skipped));
                continue;
            }

            let result = self
                .check_preconditions(stage, &fingerprints)
                .and_then(|()| self.run_stage(stage, fp));
            if let Err(err) = result {
                state.status = RunStatus::Aborted;
                state.failed_stage = Some(stage.slug().to_string());
                state.error = Some(format!("{:#}", err));
                state.updated_at_utc = now_utc_compact();
                write_run_state(ws, &state)?;
                return Err(err);
            }

            summary.stages.push((stage, StageOutcome::Ran));
            state.last_completed_stage = Some(stage.slug().to_string());
            state.updated_at_utc = now_utc_compact();
            write_run_state(ws, &state)?;
        }

        if selection.last() == Some(&StageId::Validate) {
            state.status = RunStatus::Completed;
            state.updated_at_utc = now_utc_compact();
            write_run_state(ws, &state)?;
        }
        Ok(summary)
    }

    fn run_stage(&self, stage: StageId, fp: &str) -> Result<()> {
        let ws = self.ctx.workspace;
        info!(stage = %stage, "running");
        clear_marker(ws, stage)?;
        for dependent in stage.dependents() {
            clear_marker(ws, dependent)?;
        }
        mark_running(ws, stage)?;

        if let Err(err) = self.ctx.execute(stage) {
            warn!(stage = %stage, "failed; discarding partial outputs");
            if let Err(discard_err) = self.ctx.discard(stage) {
                warn!(stage = %stage, "could not discard partial outputs: {:#}", discard_err);
            }
            clear_running(ws, stage)?;
            return Err(err.context(format!("stage `{}` failed", stage)));
        }

        let marker = StageMarker {
            stage: stage.slug().to_string(),
            fingerprint: fp.to_string(),
            completed_at_utc: now_utc_compact(),
            outputs: self.ctx.outputs(stage),
        };
        write_marker(ws, &marker, stage)?;
        clear_running(ws, stage)?;
        info!(stage = %stage, "finished");
        Ok(())
    }

    /// A `.running` marker left behind means the process died mid-stage.
    fn recover_interrupted(&self) -> Result<()> {
        let ws = self.ctx.workspace;
        for stage in StageId::ALL {
            if is_running(ws, stage) {
                warn!(stage = %stage, "previous run was interrupted; discarding partial outputs");
                self.ctx.discard(stage)?;
                clear_marker(ws, stage)?;
                clear_running(ws, stage)?;
            }
        }
        Ok(())
    }

    fn fingerprints(&self) -> Result<BTreeMap<StageId, String>> {
        let mut fingerprints: BTreeMap<StageId, String> = BTreeMap::new();
        for stage in StageId::ALL {
            let projection = self.ctx.projection(stage)?;
            let deps: Vec<&str> = stage
                .dependencies()
                .iter()
                .filter_map(|dep| fingerprints.get(dep).map(String::as_str))
                .collect();
            let fp = fingerprint(stage, &projection, &deps);
            fingerprints.insert(stage, fp);
        }
        Ok(fingerprints)
    }

    fn is_current(&self, stage: StageId, fp: &str) -> Result<bool> {
        let Some(marker) = read_marker(self.ctx.workspace, stage)? else {
            return Ok(false);
        };
        Ok(marker.fingerprint == fp && self.ctx.outputs(stage).iter().all(|path| path.exists()))
    }

    fn check_preconditions(
        &self,
        stage: StageId,
        fingerprints: &BTreeMap<StageId, String>,
    ) -> Result<()> {
        for dep in stage.dependencies() {
            if let Some(missing) = self
                .ctx
                .outputs(*dep)
                .into_iter()
                .find(|path| !path.exists())
            {
                return Err(BuildError::StagePrecondition {
                    stage: stage.slug().to_string(),
                    missing: format!("`{}` output '{}'", dep, missing.display()),
                }
                .into());
            }
            if !self.is_current(*dep, &fingerprints[dep])? {
                return Err(BuildError::StagePrecondition {
                    stage: stage.slug().to_string(),
                    missing: format!("a current `{}` result (its inputs changed)", dep),
                }
                .into());
            }
        }
        Ok(())
    }

    pub fn status(&self) -> Result<Vec<StageStatus>> {
        let ws = self.ctx.workspace;
        let fingerprints = self.fingerprints()?;
        let run_state = read_run_state(ws)?;
        let mut statuses = Vec::with_capacity(StageId::ALL.len());
        for stage in StageId::ALL {
            let marker = read_marker(ws, stage)?;
            let state = if is_running(ws, stage) {
                StageState::Running
            } else if run_state.failed_stage.as_deref() == Some(stage.slug()) {
                StageState::Failed
            } else if marker.is_none() {
                StageState::Pending
            } else if self.is_current(stage, &fingerprints[&stage])? {
                StageState::Succeeded
            } else {
                StageState::Stale
            };
            statuses.push(StageStatus {
                stage,
                state,
                completed_at_utc: marker.map(|m| m.completed_at_utc),
            });
        }
        Ok(statuses)
    }

    pub fn run_state(&self) -> Result<RunState> {
        markers::read_run_state(self.ctx.workspace)
    }

    /// Drop markers, the work tree and every file the stages published.
    /// Other files in the output directory stay, and so does the cache.
    pub fn reset(&self) -> Result<()> {
        let ws = self.ctx.workspace;
        let _lock = ws.lock()?;
        self.clear_work_tree()?;
        for stage in StageId::ALL {
            for path in self.ctx.outputs(stage) {
                remove_path(&path)?;
            }
        }
        remove_path(&compress::rootfs_archive_path(self.ctx.plan, ws))?;
        // Only succeeds when nothing else lives there.
        let _ = fs::remove_dir(ws.output_dir());
        info!(profile = ws.profile(), "workspace reset");
        Ok(())
    }

    /// Drop the work tree (and with it every marker). Cache and output stay.
    pub fn clean(&self) -> Result<()> {
        let ws = self.ctx.workspace;
        let _lock = ws.lock()?;
        self.clear_work_tree()?;
        info!(profile = ws.profile(), "work tree removed");
        Ok(())
    }

    fn clear_work_tree(&self) -> Result<()> {
        let work_dir = self.ctx.workspace.work_dir();
        if !work_dir.is_dir() {
            return Ok(());
        }
        for entry in fs::read_dir(&work_dir)
            .with_context(|| format!("reading work directory '{}'", work_dir.display()))?
        {
            let entry = entry?;
            // The lock file stays; it is held right now.
            if entry.file_name() == ".lock" {
                continue;
            }
            remove_path(&entry.path())?;
        }
        Ok(())
    }
}
