//! Session-level scenarios: selection over mixed dirty state, cascades,
//! library reloads, and the write/status round trip.

use std::fs;
use std::time::Duration;

use kernel::core::types::{RunScope, RunStatus, StepRef};
use kernel::error::KernelError;
use kernel::io::results;
use kernel::runner::{RunControl, RunRequest, run};
use kernel::session::Session;
use kernel::status::get_status;
use kernel::test_support::{ScriptedExecutor, TestProject, push_mtime_forward};

/// Steps start dirty; clear the flags that should be clean.
fn set_dirty(session: &Session, flags: &[bool]) {
    let mut project = session.project();
    for (position, dirty) in flags.iter().enumerate() {
        if !dirty {
            project.mark_dirty(position, false, true);
        }
    }
}

fn dirty_flags(session: &Session) -> Vec<bool> {
    session.project().steps().iter().map(|s| s.dirty).collect()
}

/// `from(A)` over [A clean, B dirty, C clean] executes B and C only, since
/// running B dirties C.
#[test]
fn from_scope_runs_dirty_step_and_cascaded_followers() {
    let fixture = TestProject::new(&["a.py", "b.py", "c.py"]);
    let executor = ScriptedExecutor::new();
    let session = fixture.scripted_session(&executor);
    set_dirty(&session, &[false, true, false]);
    assert_eq!(dirty_flags(&session), vec![false, true, false]);

    let request = RunRequest::new(RunScope::From(StepRef::Name("a.py".to_string())));
    let control = RunControl::default();
    let outcome = run(&session, &request, &control).expect("run");

    assert_eq!(outcome.run_status, RunStatus::Complete);
    assert_eq!(outcome.skipped, vec!["a.py"]);
    assert_eq!(outcome.executed, vec!["b.py", "c.py"]);
    assert_eq!(executor.calls(), vec!["b.py", "c.py"]);
    assert_eq!(dirty_flags(&session), vec![false, false, false]);
    assert_eq!(
        control.log.lines(),
        vec![
            "[a.py]: nothing to update",
            "[b.py]: updated",
            "[c.py]: updated"
        ]
    );
}

#[test]
fn editing_a_source_dirties_it_and_its_followers() {
    let fixture = TestProject::new(&["a.py", "b.py", "c.py"]);
    let executor = ScriptedExecutor::new();
    let session = fixture.scripted_session(&executor);
    run(&session, &RunRequest::new(RunScope::All), &RunControl::default()).expect("first");
    assert_eq!(dirty_flags(&session), vec![false, false, false]);

    std::thread::sleep(Duration::from_millis(20));
    fixture.write_source("b.py", "changed");
    let outcome =
        run(&session, &RunRequest::new(RunScope::All), &RunControl::default()).expect("second");
    assert_eq!(outcome.skipped, vec!["a.py"]);
    assert_eq!(outcome.executed, vec!["b.py", "c.py"]);
}

#[test]
fn removing_a_step_reindexes_and_dirties_followers() {
    let fixture = TestProject::new(&["a.py", "b.py", "c.py"]);
    let session = fixture.scripted_session(&ScriptedExecutor::new());
    run(&session, &RunRequest::new(RunScope::All), &RunControl::default()).expect("run");

    session.remove_step("a.py", false).expect("remove");
    let project = session.project();
    let positions: Vec<usize> = project.steps().iter().map(|s| s.position).collect();
    assert_eq!(positions, vec![0, 1]);
    assert_eq!(project.step_names(), vec!["b.py", "c.py"]);
    assert!(project.steps().iter().all(|s| s.dirty));
    assert!(!fixture.dir().join("a.py").exists());
    drop(project);
    assert!(!session.layout().step_path("a.py").exists());
}

/// Protected keys fail the writing step and leave the cache untouched.
#[test]
fn reserved_cache_key_fails_the_step() {
    let fixture = TestProject::new(&["a.py"]);
    let executor = ScriptedExecutor::new();
    executor.export("a.py", "__secret", serde_json::json!(1));
    let session = fixture.scripted_session(&executor);

    let outcome =
        run(&session, &RunRequest::new(RunScope::All), &RunControl::default()).expect("run");
    assert_eq!(outcome.run_status, RunStatus::Failed);
    assert!(matches!(outcome.error, Some(KernelError::UserSource { .. })));
    assert!(session.cache().is_empty());
}

/// A changed library file is reloaded once, before any step runs.
#[test]
fn changed_libraries_reload_before_the_next_run() {
    let fixture = TestProject::new(&["a.py"]);
    fixture.write_source("libs/helpers.py", "VALUE = 1\n");
    let session = fixture.scripted_session(&ScriptedExecutor::new());

    let first =
        run(&session, &RunRequest::new(RunScope::All), &RunControl::default()).expect("first");
    assert!(first.reloaded.is_empty());

    fixture.write_source("libs/helpers.py", "VALUE = 2\n");
    push_mtime_forward(&fixture.dir().join("libs/helpers.py"));
    let control = RunControl::default();
    let mut request = RunRequest::new(RunScope::All);
    request.force = true;
    let second = run(&session, &request, &control).expect("second");
    assert_eq!(second.reloaded, vec!["helpers"]);
    assert_eq!(control.log.lines()[0], "reloaded 1 library modules");
    let modules = session.modules();
    assert_eq!(
        modules.sources(),
        vec![("helpers.py".to_string(), "VALUE = 2\n".to_string())]
    );
}

fn rendered_body(session: &Session, position: usize) -> String {
    session.project().steps()[position].report.body.join("")
}

/// A library edited after open but before any successful run is reloaded.
#[test]
fn library_edit_before_the_first_run_is_picked_up() {
    let fixture = TestProject::new(&["a.html"]);
    fixture.write_source("libs/footer.html", "OLD");
    fixture.write_source("a.html", r#"{% include "footer.html" %}"#);
    let session = fixture.session();

    fixture.write_source("libs/footer.html", "NEW");
    push_mtime_forward(&fixture.dir().join("libs/footer.html"));
    let outcome =
        run(&session, &RunRequest::new(RunScope::All), &RunControl::default()).expect("run");
    assert_eq!(outcome.run_status, RunStatus::Complete, "{:?}", outcome.error);
    assert_eq!(outcome.reloaded, vec!["footer"]);
    let body = rendered_body(&session, 0);
    assert!(body.contains("NEW") && !body.contains("OLD"), "{body}");
}

/// Deleting one library file while editing another still reloads cleanly.
#[test]
fn deleted_library_does_not_block_later_runs() {
    let fixture = TestProject::new(&["a.html"]);
    fixture.write_source("libs/keep.html", "v1");
    fixture.write_source("libs/gone.html", "g");
    fixture.write_source("a.html", r#"{% include "keep.html" %}"#);
    let session = fixture.session();
    let first =
        run(&session, &RunRequest::new(RunScope::All), &RunControl::default()).expect("first");
    assert_eq!(first.run_status, RunStatus::Complete, "{:?}", first.error);

    fs::remove_file(fixture.dir().join("libs/gone.html")).expect("remove");
    fixture.write_source("libs/keep.html", "v2");
    push_mtime_forward(&fixture.dir().join("libs/keep.html"));
    let mut request = RunRequest::new(RunScope::All);
    request.force = true;
    for _ in 0..2 {
        let outcome = run(&session, &request, &RunControl::default()).expect("rerun");
        assert_eq!(outcome.run_status, RunStatus::Complete, "{:?}", outcome.error);
    }
    assert!(rendered_body(&session, 0).contains("v2"));
}

/// After a run, every reported step is `written`, and a stale artifact on
/// disk is reported as not written.
#[test]
fn status_reports_written_artifacts() {
    let fixture = TestProject::new(&["a.py", "b.py"]);
    let session = fixture.scripted_session(&ScriptedExecutor::new());
    run(&session, &RunRequest::new(RunScope::All), &RunControl::default()).expect("run");

    let status = get_status(Some(&session), None, None, false).expect("status");
    assert!(status.step_changes.iter().all(|c| c.written));

    let layout = session.layout();
    let mut stale = results::read_step(&layout, "a.py")
        .expect("read")
        .expect("artifact");
    stale.content_hash = "stale".to_string();
    fs::write(
        layout.step_path("a.py"),
        serde_json::to_vec_pretty(&stale).expect("serialize"),
    )
    .expect("overwrite");

    let status = get_status(Some(&session), None, None, false).expect("status");
    let written: Vec<(String, bool)> = status
        .step_changes
        .iter()
        .map(|c| (c.name.clone(), c.written))
        .collect();
    assert_eq!(
        written,
        vec![("a.py".to_string(), false), ("b.py".to_string(), true)]
    );
}
