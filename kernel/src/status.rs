//! Polling envelope for viewers: project snapshot, recently changed steps,
//! and a digest that only moves when displayed state does.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::trace;

use crate::core::digest::{digest, forced_hash};
use crate::core::types::RunStatus;
use crate::io::clock;
use crate::io::results::{self, ResultsLayout};
use crate::notebook::{ProjectSnapshot, StepData};
use crate::session::Session;

/// Slack applied to `since` so updates within the same second are not lost.
const SINCE_SLACK_SECS: f64 = 1.0;

static FORCED_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepChange {
    pub name: String,
    pub action: &'static str,
    pub step: StepData,
    /// The artifact on disk matches this report.
    pub written: bool,
}

#[derive(Serialize)]
struct Hashed<'a> {
    project: &'a Option<ProjectSnapshot>,
    step_changes: &'a [StepChange],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEnvelope {
    pub success: bool,
    pub project: Option<ProjectSnapshot>,
    pub step_changes: Vec<StepChange>,
    pub hash: String,
    pub run_status: Option<RunStatus>,
    pub run_uid: Option<String>,
    pub timestamp: f64,
}

/// Build the status envelope. `since` (epoch seconds) limits `step_changes`
/// to steps updated after it; running steps are always included with their
/// live output. `force` yields a hash no other call returns.
pub fn get_status(
    session: Option<&Session>,
    run_uid: Option<String>,
    since: Option<f64>,
    force: bool,
) -> Result<StatusEnvelope> {
    let (project, step_changes) = match session {
        Some(session) => {
            let (snapshot, changes) = collect(session, since);
            (Some(snapshot), changes)
        }
        None => (None, Vec::new()),
    };

    let hash = if force {
        forced_hash(clock::now_nanos(), FORCED_COUNTER.fetch_add(1, Ordering::SeqCst))
    } else {
        let value = serde_json::to_value(Hashed {
            project: &project,
            step_changes: &step_changes,
        })
        .context("serialize status for hashing")?;
        digest(&value)
    };
    trace!(%hash, changes = step_changes.len(), "status built");

    Ok(StatusEnvelope {
        success: true,
        run_status: project.as_ref().map(|p| p.run_status),
        project,
        step_changes,
        hash,
        run_uid,
        timestamp: clock::now(),
    })
}

fn collect(session: &Session, since: Option<f64>) -> (ProjectSnapshot, Vec<StepChange>) {
    let live = session.capture().snapshot();
    let project = session.project();
    let layout = ResultsLayout::for_project(&project);
    let threshold = since.map(|since| since - SINCE_SLACK_SECS);

    let changes = project
        .steps()
        .iter()
        .filter(|step| {
            step.is_running
                || match threshold {
                    None => true,
                    Some(threshold) => step.last_update().is_some_and(|t| t >= threshold),
                }
        })
        .map(|step| {
            let mut data = step.step_data(step.last_modified);
            let written = if step.is_running {
                if let Some((name, output)) = &live
                    && name == step.name()
                {
                    data.stdout = output.clone();
                }
                false
            } else {
                results::written_hash(&layout, step.name()).as_deref()
                    == Some(data.content_hash.as_str())
            };
            StepChange {
                name: step.name().to_string(),
                action: "updated",
                step: data,
                written,
            }
        })
        .collect();
    (project.kernel_serialize(), changes)
}
