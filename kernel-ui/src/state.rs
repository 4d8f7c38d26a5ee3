//! Shared application state for the UI server.

use std::path::PathBuf;
use std::sync::Arc;

use kernel::commands::Kernel;
use kernel::io::results::ResultsLayout;
use tokio::sync::broadcast;

/// Events broadcast to SSE clients when result files change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// `steps/<name>.json` was rewritten.
    StepWritten { name: String },
    ManifestChanged,
}

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub kernel: Arc<Kernel>,
    /// Results directory of the open project, fixed at startup.
    pub layout: ResultsLayout,
    pub event_tx: Arc<broadcast::Sender<ChangeEvent>>,
}

impl AppState {
    pub fn new(kernel: Arc<Kernel>, layout: ResultsLayout) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            kernel,
            layout,
            event_tx: Arc::new(event_tx),
        }
    }

    pub fn results_dir(&self) -> PathBuf {
        self.layout.output_dir.clone()
    }
}
