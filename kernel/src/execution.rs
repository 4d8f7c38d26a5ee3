//! Background execution of run requests.
//!
//! A run executes on its own thread so the caller can block briefly, poll by
//! run id, or abort. At most one run is active per queue; a second request
//! waits `busy_wait` for the active one and is otherwise rejected.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use tracing::{debug, info, warn};

use crate::abort::AbortSignal;
use crate::error::KernelError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `YYYYMMDD_HHMMSS-xxxxxx`.
pub fn new_run_uid() -> String {
    let mut rng = rand::thread_rng();
    let suffix = std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase();
    format!("{}-{suffix}", Utc::now().format("%Y%m%d_%H%M%S"))
}

/// Console lines of a run, readable while it executes.
#[derive(Debug, Clone, Default)]
pub struct RunLog {
    lines: Arc<Mutex<Vec<String>>>,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, line: impl Into<String>) {
        lock(&self.lines).push(line.into());
    }

    pub fn lines(&self) -> Vec<String> {
        lock(&self.lines).clone()
    }
}

enum Slot<T> {
    Pending,
    /// `None` when the worker ended without producing a result.
    Done(Option<T>),
}

struct Completion<T> {
    slot: Mutex<Slot<T>>,
    cond: Condvar,
}

impl<T> Completion<T> {
    fn finish(&self, value: Option<T>) {
        let mut slot = lock(&self.slot);
        if matches!(*slot, Slot::Pending) {
            *slot = Slot::Done(value);
        }
        self.cond.notify_all();
    }
}

/// Marks the run finished even if the worker unwinds.
struct FinishOnDrop<T>(Arc<Completion<T>>);

impl<T> Drop for FinishOnDrop<T> {
    fn drop(&mut self) {
        self.0.finish(None);
    }
}

pub struct ExecutionThread<T> {
    uid: String,
    abort: AbortSignal,
    log: RunLog,
    completion: Arc<Completion<T>>,
}

impl<T: Send + 'static> ExecutionThread<T> {
    pub fn spawn<F>(work: F) -> Result<Arc<Self>>
    where
        F: FnOnce(&AbortSignal, &RunLog) -> T + Send + 'static,
    {
        let uid = new_run_uid();
        let abort = AbortSignal::new();
        let log = RunLog::new();
        let completion = Arc::new(Completion {
            slot: Mutex::new(Slot::Pending),
            cond: Condvar::new(),
        });

        let worker_abort = abort.clone();
        let worker_log = log.clone();
        let worker_completion = completion.clone();
        thread::Builder::new()
            .name(format!("run-{uid}"))
            .spawn(move || {
                let guard = FinishOnDrop(worker_completion);
                let result = work(&worker_abort, &worker_log);
                guard.0.finish(Some(result));
            })
            .context("spawn run thread")?;
        debug!(run_uid = %uid, "run thread started");

        Ok(Arc::new(Self {
            uid,
            abort,
            log,
            completion,
        }))
    }
}

impl<T> ExecutionThread<T> {
    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    pub fn is_alive(&self) -> bool {
        matches!(*lock(&self.completion.slot), Slot::Pending)
    }

    /// Wait up to `timeout` for the run to finish. Returns `true` if it has.
    pub fn join(&self, timeout: Duration) -> bool {
        let slot = lock(&self.completion.slot);
        let (slot, _) = self
            .completion
            .cond
            .wait_timeout_while(slot, timeout, |s| matches!(s, Slot::Pending))
            .unwrap_or_else(PoisonError::into_inner);
        !matches!(*slot, Slot::Pending)
    }

    /// Take the result of a finished run; later calls return `None`.
    pub fn take_result(&self) -> Option<T> {
        let mut slot = lock(&self.completion.slot);
        match &mut *slot {
            Slot::Pending => None,
            Slot::Done(value) => value.take(),
        }
    }
}

/// Outcome of handing work to the queue.
#[derive(Debug)]
pub enum Dispatch<T> {
    /// Finished within the dispatch wait.
    Complete {
        run_uid: String,
        result: Option<T>,
        log: Vec<String>,
    },
    /// Still executing; poll with the run id.
    Running { run_uid: String, log: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortOutcome {
    NoActiveRun,
    Stopped { run_uid: String },
    /// The run ignored the flag for the whole grace period.
    StillRunning { run_uid: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunState {
    pub run_uid: String,
    pub alive: bool,
    pub log: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueTimings {
    pub busy_wait: Duration,
    pub dispatch_wait: Duration,
    pub abort_grace: Duration,
}

pub struct CommandQueue<T> {
    active: Mutex<Option<Arc<ExecutionThread<T>>>>,
    timings: QueueTimings,
}

impl<T: Send + 'static> CommandQueue<T> {
    pub fn new(timings: QueueTimings) -> Self {
        Self {
            active: Mutex::new(None),
            timings,
        }
    }

    fn current(&self) -> Option<Arc<ExecutionThread<T>>> {
        lock(&self.active).clone()
    }

    /// Start `work` in the background unless a run is already active.
    pub fn dispatch<F>(&self, work: F) -> Result<Dispatch<T>>
    where
        F: FnOnce(&AbortSignal, &RunLog) -> T + Send + 'static,
    {
        let thread = {
            let mut active = lock(&self.active);
            if let Some(previous) = active.as_ref()
                && !previous.join(self.timings.busy_wait)
            {
                warn!(run_uid = %previous.uid(), "run request blocked by active run");
                return Err(KernelError::ActionBlocked(format!(
                    "run {} is still in progress",
                    previous.uid()
                ))
                .into());
            }
            let thread = ExecutionThread::spawn(work)?;
            *active = Some(thread.clone());
            thread
        };

        if thread.join(self.timings.dispatch_wait) {
            Ok(Dispatch::Complete {
                run_uid: thread.uid().to_string(),
                result: thread.take_result(),
                log: thread.log().lines(),
            })
        } else {
            Ok(Dispatch::Running {
                run_uid: thread.uid().to_string(),
                log: thread.log().lines(),
            })
        }
    }

    pub fn is_busy(&self) -> bool {
        self.current().is_some_and(|t| t.is_alive())
    }

    /// State of the most recent run, if `run_uid` matches it (or is `None`).
    pub fn poll(&self, run_uid: Option<&str>) -> Option<RunState> {
        let thread = self.current()?;
        if run_uid.is_some_and(|uid| uid != thread.uid()) {
            return None;
        }
        Some(RunState {
            run_uid: thread.uid().to_string(),
            alive: thread.is_alive(),
            log: thread.log().lines(),
        })
    }

    /// Block until the active run finishes (or `timeout`) and take its result.
    pub fn wait(&self, timeout: Duration) -> Option<T> {
        let thread = self.current()?;
        if thread.join(timeout) {
            thread.take_result()
        } else {
            None
        }
    }

    /// Raise the abort flag and wait out the grace period.
    pub fn abort(&self) -> AbortOutcome {
        let Some(thread) = self.current() else {
            return AbortOutcome::NoActiveRun;
        };
        if !thread.is_alive() {
            return AbortOutcome::NoActiveRun;
        }
        let run_uid = thread.uid().to_string();
        thread.abort_signal().abort();
        thread.log().push("abort requested");
        if thread.join(self.timings.abort_grace) {
            info!(run_uid = %run_uid, "run stopped after abort");
            AbortOutcome::Stopped { run_uid }
        } else {
            warn!(run_uid = %run_uid, grace_ms = self.timings.abort_grace.as_millis() as u64, "run still active after abort grace period");
            AbortOutcome::StillRunning { run_uid }
        }
    }
}
