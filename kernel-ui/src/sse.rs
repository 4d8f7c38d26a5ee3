//! Server-Sent Events stream and results-directory watcher.

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::path::Path;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use notify::{Event as NotifyEvent, EventKind, PollWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::state::{AppState, ChangeEvent};

#[derive(Serialize)]
struct SsePayload<'a> {
    #[serde(rename = "type")]
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

impl<'a> From<&'a ChangeEvent> for SsePayload<'a> {
    fn from(event: &'a ChangeEvent) -> Self {
        match event {
            ChangeEvent::StepWritten { name } => SsePayload {
                event_type: "step_written",
                name: Some(name),
            },
            ChangeEvent::ManifestChanged => SsePayload {
                event_type: "manifest_changed",
                name: None,
            },
        }
    }
}

/// SSE endpoint handler.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.event_tx.subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            match rx.recv().await {
                Ok(change_event) => {
                    if let Ok(json) = serde_json::to_string(&SsePayload::from(&change_event)) {
                        yield Ok(Event::default().event("change").data(json));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

/// Start the file watcher in a background task.
pub fn start_file_watcher(state: AppState) {
    tokio::spawn(async move {
        if let Err(e) = run_file_watcher(state).await {
            warn!(error = %e, "file watcher failed");
        }
    });
}

async fn run_file_watcher(state: AppState) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel::<NotifyEvent>(100);

    let mut watcher = PollWatcher::new(
        move |res: Result<NotifyEvent, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.try_send(event);
            }
        },
        notify::Config::default().with_poll_interval(Duration::from_millis(100)),
    )?;

    let results_dir = state.results_dir();
    std::fs::create_dir_all(&results_dir)?;
    watcher.watch(&results_dir, RecursiveMode::Recursive)?;
    info!(path = %results_dir.display(), "watching results directory");

    // Batch at a fixed interval so a burst of step writes yields one event
    // per step.
    let mut pending_events: Vec<NotifyEvent> = Vec::new();
    let mut flush_tick = tokio::time::interval(Duration::from_millis(100));
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                pending_events.push(event);
            }
            _ = flush_tick.tick() => {
                if pending_events.is_empty() {
                    continue;
                }
                process_events(&state, &pending_events);
                pending_events.clear();
            }
        }
    }
}

fn process_events(state: &AppState, events: &[NotifyEvent]) {
    let manifest_path = state.layout.manifest_path();
    let steps_dir = state.layout.steps_dir();

    let mut manifest_changed = false;
    let mut written: BTreeSet<String> = BTreeSet::new();

    for event in events {
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            continue;
        }
        for path in &event.paths {
            if path == &manifest_path {
                manifest_changed = true;
            } else if let Some(name) = step_name(&steps_dir, path) {
                written.insert(name);
            }
        }
    }

    for name in written {
        debug!(step = %name, "broadcasting step written");
        let _ = state.event_tx.send(ChangeEvent::StepWritten { name });
    }
    if manifest_changed {
        debug!("broadcasting manifest change");
        let _ = state.event_tx.send(ChangeEvent::ManifestChanged);
    }
}

/// `steps/<name>.json` → `<name>`. Temp files from atomic writes end in
/// `.tmp` and are ignored.
fn step_name(steps_dir: &Path, path: &Path) -> Option<String> {
    if path.parent()? != steps_dir || path.extension()? != "json" {
        return None;
    }
    path.file_stem()?.to_str().map(str::to_string)
}
