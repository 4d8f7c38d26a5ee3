//! Cooperative abort flag shared between a run and its controller.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::KernelError;

#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    flag: Arc<AtomicBool>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Step-boundary check.
    pub fn checkpoint(&self) -> Result<(), KernelError> {
        if self.is_aborted() {
            Err(KernelError::Aborted)
        } else {
            Ok(())
        }
    }
}
