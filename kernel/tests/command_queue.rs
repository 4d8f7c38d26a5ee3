//! Kernel command scenarios with real shell steps: background runs, live
//! status, abort, and rejection of concurrent requests.

use std::time::Duration;

use kernel::commands::Kernel;
use kernel::core::types::RunStatus;
use kernel::response::Response;
use kernel::test_support::{TestProject, wait_until};

fn open(fixture: &TestProject) -> Kernel {
    let kernel = Kernel::new(fixture.config());
    let opened = kernel.execute(&format!("open {}", fixture.dir().display()));
    assert!(opened.success, "{opened:?}");
    kernel
}

/// Block until a dispatched run finishes and return its final response.
fn finish(kernel: &Kernel, response: Response) -> Response {
    if response.data.get("running").and_then(|v| v.as_bool()) == Some(true) {
        return kernel.wait(Duration::from_secs(10)).expect("run result");
    }
    response
}

fn is_running(response: &Response) -> bool {
    response.data.get("running").and_then(|v| v.as_bool()) == Some(true)
}

#[test]
fn shell_steps_share_values_through_the_cache() {
    let fixture = TestProject::new(&["a.sh", "b.sh"]);
    fixture.write_source("a.sh", r#"printf '{"greeting": "hi"}' > "$KERNEL_SHARED_OUT""#);
    fixture.write_source(
        "b.sh",
        r#"grep -q '"greeting":"hi"' "$KERNEL_SHARED_IN" && echo "got it""#,
    );
    let kernel = open(&fixture);

    let response = finish(&kernel, kernel.execute("run"));
    assert!(response.success, "{response:?}");
    assert_eq!(response.data["executed"], serde_json::json!(["a.sh", "b.sh"]));

    let session = kernel.session().expect("session");
    let project = session.project();
    assert_eq!(project.steps()[1].report.stdout, "got it\n");
    assert_eq!(project.run_status, RunStatus::Complete);
}

#[test]
fn failing_step_reports_user_source_error() {
    let fixture = TestProject::new(&["a.sh", "b.sh"]);
    fixture.write_source("a.sh", "echo nope >&2; exit 4");
    let kernel = open(&fixture);

    let response = finish(&kernel, kernel.execute("run"));
    assert!(!response.success);
    assert_eq!(response.code, "USER_SOURCE_ERROR");
    assert!(response.message.contains("nope"), "{}", response.message);
    let session = kernel.session().expect("session");
    let flags: Vec<bool> = session.project().steps().iter().map(|s| s.dirty).collect();
    assert_eq!(flags, vec![true, true]);
}

/// While a run is active a second run waits `busy_wait` and is rejected, and
/// project mutations are rejected outright.
#[test]
fn concurrent_requests_are_blocked() {
    let fixture = TestProject::new(&["slow.sh"]);
    fixture.write_source("slow.sh", "exec sleep 10");
    let kernel = open(&fixture);

    let first = kernel.execute("run");
    assert!(is_running(&first), "{first:?}");

    let second = kernel.execute("run --force");
    assert!(!second.success);
    assert_eq!(second.code, "ACTION_BLOCKED");
    assert_eq!(kernel.execute("add-step other.sh").code, "ACTION_BLOCKED");
    assert_eq!(kernel.execute("close").code, "ACTION_BLOCKED");

    let aborted = kernel.execute("abort");
    assert_eq!(aborted.data["still_running"], serde_json::json!(false));
}

/// Abort mid-step: the step is left dirty and not running, later steps never
/// start, and the run ends `aborted`.
#[test]
fn abort_stops_the_running_step() {
    let fixture = TestProject::new(&["a.sh", "b.sh"]);
    fixture.write_source("a.sh", "echo started; exec sleep 10");
    fixture.write_source("b.sh", "echo never");
    let kernel = open(&fixture);

    let started = kernel.execute("run");
    assert!(is_running(&started), "{started:?}");

    let saw_output = wait_until(Duration::from_secs(5), || {
        let status = kernel.status(None, false).expect("status");
        status.step_changes.iter().any(|change| {
            change.name == "a.sh" && !change.written && change.step.stdout.contains("started")
        })
    });
    assert!(saw_output, "live output never reported");

    let aborted = kernel.execute("abort");
    assert!(aborted.success);
    assert_eq!(aborted.data["still_running"], serde_json::json!(false));

    let result = kernel.wait(Duration::from_secs(1)).expect("run result");
    assert_eq!(result.code, "ABORTED");

    let session = kernel.session().expect("session");
    let project = session.project();
    assert_eq!(project.run_status, RunStatus::Aborted);
    assert!(project.stop_condition.aborted);
    assert!(project.current_step.is_none());
    let a = &project.steps()[0];
    assert!(a.dirty);
    assert!(!a.is_running);
    assert!(project.steps()[1].report.stdout.is_empty());
}

#[test]
fn abort_without_a_run_is_a_no_op() {
    let fixture = TestProject::new(&["a.sh"]);
    let kernel = open(&fixture);
    let response = kernel.execute("abort");
    assert!(response.success);
    assert_eq!(response.message, "no active run");
}
