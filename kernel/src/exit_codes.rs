//! Stable exit codes for kernel CLI commands.

/// Command succeeded (a run completed or was accepted and is still running).
pub const OK: i32 = 0;
/// Command failed: a step errored, the request was invalid, or I/O failed.
pub const FAILED: i32 = 1;
/// Another run held the kernel past the busy wait.
pub const BLOCKED: i32 = 2;
/// The run was aborted.
pub const ABORTED: i32 = 3;

/// Exit code for a response error code.
pub fn for_code(code: Option<&str>) -> i32 {
    match code {
        None => OK,
        Some("ACTION_BLOCKED") => BLOCKED,
        Some("ABORTED") => ABORTED,
        Some(_) => FAILED,
    }
}
