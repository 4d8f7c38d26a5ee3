//! Atomic file replacement and bounded write retries.

use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

use crate::error::KernelError;

/// Retry policy for report and project persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRetry {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for WriteRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Write via temp file + rename so readers never see a partial file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// `write_atomic` with fixed-backoff retries; exhausting them yields
/// [`KernelError::Write`].
pub fn write_with_retry(path: &Path, contents: &[u8], retry: WriteRetry) -> Result<()> {
    let attempts = retry.attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match write_atomic(path, contents) {
            Ok(()) => return Ok(()),
            Err(err) => {
                warn!(path = %path.display(), attempt, err = %format!("{err:#}"), "write failed");
                last_error = Some(err);
                if attempt < attempts {
                    thread::sleep(retry.backoff);
                }
            }
        }
    }
    let message = last_error.map_or_else(String::new, |err| format!("{err:#}"));
    Err(KernelError::Write {
        path: path.to_path_buf(),
        attempts,
        message,
    }
    .into())
}

/// True if `path` already holds exactly `contents`.
pub fn unchanged(path: &Path, contents: &[u8]) -> bool {
    fs::read(path).is_ok_and(|existing| existing == contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::error_code;

    #[test]
    fn write_atomic_creates_parents() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("a/b/c.json");
        write_atomic(&path, b"{}").expect("write");
        assert_eq!(fs::read(&path).expect("read"), b"{}");
        assert!(unchanged(&path, b"{}"));
        assert!(!unchanged(&path, b"[]"));
    }

    /// A parent that is a regular file can never be created, so every retry fails.
    #[test]
    fn exhausted_retries_surface_write_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let blocker = temp.path().join("blocker");
        fs::write(&blocker, "file").expect("write blocker");
        let path = blocker.join("out.json");

        let retry = WriteRetry {
            attempts: 2,
            backoff: Duration::from_millis(1),
        };
        let err = write_with_retry(&path, b"{}", retry).unwrap_err();
        assert_eq!(error_code(&err), "WRITE_FAILED");
        match err.downcast_ref::<KernelError>() {
            Some(KernelError::Write { attempts, .. }) => assert_eq!(*attempts, 2),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
