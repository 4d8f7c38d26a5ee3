//! Live output redirection for the running step.
//!
//! While a step runs, its stdout is mirrored here so pollers can show
//! partial output. Detaching always clears the buffer, so no captured state
//! leaks into the next run.

use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct CaptureState {
    step: Option<String>,
    buffer: String,
}

#[derive(Debug, Clone, Default)]
pub struct OutputCapture {
    inner: Arc<Mutex<CaptureState>>,
}

impl OutputCapture {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CaptureState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start redirecting output for `step`. Detaches when the guard drops.
    pub fn attach(&self, step: &str) -> CaptureGuard {
        let mut state = self.state();
        state.step = Some(step.to_string());
        state.buffer.clear();
        CaptureGuard {
            capture: self.clone(),
        }
    }

    pub fn detach(&self) {
        let mut state = self.state();
        state.step = None;
        state.buffer.clear();
    }

    /// Append text if a step is attached; otherwise the text is dropped.
    pub fn write(&self, text: &str) {
        let mut state = self.state();
        if state.step.is_some() {
            state.buffer.push_str(text);
        }
    }

    pub fn is_active(&self) -> bool {
        self.state().step.is_some()
    }

    /// `(step, output so far)` for the attached step.
    pub fn snapshot(&self) -> Option<(String, String)> {
        let state = self.state();
        state
            .step
            .as_ref()
            .map(|step| (step.clone(), state.buffer.clone()))
    }
}

#[must_use = "output is detached as soon as the guard drops"]
pub struct CaptureGuard {
    capture: OutputCapture,
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.capture.detach();
    }
}
