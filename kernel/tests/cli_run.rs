//! CLI tests for `kernel run`.
//!
//! Spawns the kernel binary and verifies exit codes and the JSON envelope.

use std::process::Command;

use kernel::exit_codes;
use kernel::test_support::TestProject;

fn kernel(fixture: &TestProject, args: &[&str]) -> (Option<i32>, serde_json::Value) {
    let output = Command::new(env!("CARGO_BIN_EXE_kernel"))
        .arg("--project")
        .arg(fixture.dir())
        .args(args)
        .output()
        .expect("kernel run");
    let envelope = serde_json::from_slice(&output.stdout).expect("json envelope");
    (output.status.code(), envelope)
}

#[test]
fn run_complete_exits_ok() {
    let fixture = TestProject::new(&["a.sh"]);
    fixture.write_source("a.sh", "echo hello");

    let (code, envelope) = kernel(&fixture, &["run"]);
    assert_eq!(code, Some(exit_codes::OK));
    assert_eq!(envelope["success"], true);
    assert_eq!(envelope["data"]["run_status"], "complete");
    assert!(
        fixture
            .dir()
            .join(".results")
            .read_dir()
            .expect("results dir")
            .next()
            .is_some()
    );
}

#[test]
fn failing_step_exits_failed() {
    let fixture = TestProject::new(&["a.sh"]);
    fixture.write_source("a.sh", "exit 1");

    let (code, envelope) = kernel(&fixture, &["run"]);
    assert_eq!(code, Some(exit_codes::FAILED));
    assert_eq!(envelope["code"], "USER_SOURCE_ERROR");
}

#[test]
fn unknown_step_exits_failed_with_code() {
    let fixture = TestProject::new(&["a.sh"]);
    let (code, envelope) = kernel(&fixture, &["run", "missing.sh"]);
    assert_eq!(code, Some(exit_codes::FAILED));
    assert_eq!(envelope["code"], "STEP_NOT_FOUND");
}
