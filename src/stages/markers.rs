//! Completion markers and the per-profile run state.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::StageId;
use crate::artifact::filesystem::{remove_path, write_json_atomic};
use crate::workspace::{now_utc_compact, Workspace};

const RUN_STATE_FILENAME: &str = "run-state.json";

/// Written once a stage has finished successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMarker {
    pub stage: String,
    pub fingerprint: String,
    pub completed_at_utc: String,
    pub outputs: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    InProgress,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub status: RunStatus,
    pub updated_at_utc: String,
    pub last_completed_stage: Option<String>,
    pub failed_stage: Option<String>,
    pub error: Option<String>,
}

impl RunState {
    pub fn not_started() -> Self {
        Self {
            status: RunStatus::NotStarted,
            updated_at_utc: now_utc_compact(),
            last_completed_stage: None,
            failed_stage: None,
            error: None,
        }
    }
}

pub(crate) fn done_path(ws: &Workspace, stage: StageId) -> PathBuf {
    ws.state_dir().join(format!("{}.done.json", stage.slug()))
}

pub(crate) fn running_path(ws: &Workspace, stage: StageId) -> PathBuf {
    ws.state_dir().join(format!("{}.running", stage.slug()))
}

fn run_state_path(ws: &Workspace) -> PathBuf {
    ws.state_dir().join(RUN_STATE_FILENAME)
}

pub(crate) fn read_marker(ws: &Workspace, stage: StageId) -> Result<Option<StageMarker>> {
    read_json(&done_path(ws, stage))
}

pub(crate) fn write_marker(ws: &Workspace, marker: &StageMarker, stage: StageId) -> Result<()> {
    let path = done_path(ws, stage);
    write_json_atomic(&path, marker)
        .with_context(|| format!("writing stage marker '{}'", path.display()))
}

pub(crate) fn clear_marker(ws: &Workspace, stage: StageId) -> Result<()> {
    remove_path(&done_path(ws, stage))
}

pub(crate) fn mark_running(ws: &Workspace, stage: StageId) -> Result<()> {
    let path = running_path(ws, stage);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating state directory '{}'", parent.display()))?;
    }
    fs::write(&path, now_utc_compact())
        .with_context(|| format!("writing running marker '{}'", path.display()))
}

pub(crate) fn clear_running(ws: &Workspace, stage: StageId) -> Result<()> {
    remove_path(&running_path(ws, stage))
}

pub(crate) fn is_running(ws: &Workspace, stage: StageId) -> bool {
    running_path(ws, stage).exists()
}

pub(crate) fn read_run_state(ws: &Workspace) -> Result<RunState> {
    Ok(read_json(&run_state_path(ws))?.unwrap_or_else(RunState::not_started))
}

pub(crate) fn write_run_state(ws: &Workspace, state: &RunState) -> Result<()> {
    let path = run_state_path(ws);
    write_json_atomic(&path, state)
        .with_context(|| format!("writing run state '{}'", path.display()))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    if !path.is_file() {
        return Ok(None);
    }
    let bytes = fs::read(path).with_context(|| format!("reading '{}'", path.display()))?;
    let parsed = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing '{}'", path.display()))?;
    Ok(Some(parsed))
}
