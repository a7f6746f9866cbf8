//! End-to-end runs against scripted stand-ins for the external program.
//!
//! Each test writes a small `sh` script, points `RunConfig::program` at it,
//! and drives `run_interactive` / `run_direct` through a real child process.
#![cfg(unix)]

use std::fs;
use std::time::{Duration, Instant};

use copilot_auto::core::limits::LimitExceeded;
use copilot_auto::core::monitor::StopReason;
use copilot_auto::core::types::{OutputStream, RunConfig, SessionMode};
use copilot_auto::io::child::SpawnError;
use copilot_auto::io::git::repository_root;
use copilot_auto::io::session_store::SessionStore;
use copilot_auto::io::supervisor::{CancelToken, RunEvent};
use copilot_auto::run::{ChildExitError, run_direct, run_interactive};
use copilot_auto::test_support::{TEST_GRACE_PERIOD, Workspace, test_config};

fn stdout_text(events: &[RunEvent]) -> String {
    let mut out = Vec::new();
    for event in events {
        if let RunEvent::Output {
            stream: OutputStream::Stdout,
            bytes,
        } = event
        {
            out.extend_from_slice(bytes);
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn started_argv(events: &[RunEvent]) -> Vec<String> {
    events
        .iter()
        .find_map(|event| match event {
            RunEvent::Started { argv } => Some(argv.clone()),
            _ => None,
        })
        .expect("started event")
}

#[test]
fn iteration_ceiling_stops_after_exactly_n_chunks() {
    let ws = Workspace::new().expect("workspace");
    let script = ws
        .write_script(
            "chatty.sh",
            "i=0\nwhile [ $i -lt 40 ]; do echo \"line $i\"; i=$((i+1)); sleep 0.1; done",
        )
        .expect("script");
    let config = RunConfig {
        max_iterations: 5,
        ..test_config(&script)
    };

    let mut events = Vec::new();
    let report = run_interactive(
        &config,
        None,
        &ws.context(),
        &CancelToken::new(),
        |event| events.push(event.clone()),
    )
    .expect("run");

    assert_eq!(report.iterations, 5);
    assert_eq!(
        report.stop_reason,
        Some(StopReason::Limit(LimitExceeded::Iterations { count: 5, max: 5 }))
    );
    let limit_events = events
        .iter()
        .filter(|e| matches!(e, RunEvent::LimitExceeded(_)))
        .count();
    assert_eq!(limit_events, 1);
    assert!(matches!(events.last(), Some(RunEvent::Exited(_))));
    // Not a session run: nothing is persisted.
    assert!(!SessionStore::state_path(&ws.repo_root).exists());
}

#[test]
fn silent_child_is_stopped_by_duration_ceiling() {
    let ws = Workspace::new().expect("workspace");
    let script = ws.write_script("silent.sh", "exec sleep 30").expect("script");
    let config = RunConfig {
        max_duration_ms: 300,
        ..test_config(&script)
    };

    let started = Instant::now();
    let report = run_interactive(&config, None, &ws.context(), &CancelToken::new(), |_| {})
        .expect("run");

    assert!(started.elapsed() < Duration::from_millis(300) + TEST_GRACE_PERIOD + Duration::from_secs(2));
    assert!(matches!(
        report.stop_reason,
        Some(StopReason::Limit(LimitExceeded::Duration { .. }))
    ));
    assert_eq!(report.iterations, 0);
    assert_eq!(report.exit_code, None);
}

#[test]
fn child_ignoring_sigterm_is_killed() {
    let ws = Workspace::new().expect("workspace");
    let script = ws
        .write_script("stubborn.sh", "trap '' TERM\necho ready\nwhile true; do sleep 1; done")
        .expect("script");
    let config = RunConfig {
        max_duration_ms: 500,
        ..test_config(&script)
    };

    let mut events = Vec::new();
    let report = run_interactive(
        &config,
        None,
        &ws.context(),
        &CancelToken::new(),
        |event| events.push(event.clone()),
    )
    .expect("run");

    assert!(events.iter().any(|e| matches!(e, RunEvent::ForceKilled)));
    assert_eq!(report.exit_code, None);
}

#[test]
fn confirmation_prompt_is_answered() {
    let ws = Workspace::new().expect("workspace");
    let script = ws
        .write_script(
            "asks.sh",
            "printf 'Do you want to run this command? '\nread answer\necho \"answer=$answer\"",
        )
        .expect("script");

    let mut events = Vec::new();
    let report = run_interactive(
        &test_config(&script),
        None,
        &ws.context(),
        &CancelToken::new(),
        |event| events.push(event.clone()),
    )
    .expect("run");

    assert!(report.success());
    assert!(events.iter().any(|e| matches!(e, RunEvent::AutoApproved)));
    assert!(stdout_text(&events).contains("answer=yes"));
}

#[test]
fn cancellation_stops_the_run() {
    let ws = Workspace::new().expect("workspace");
    let script = ws.write_script("waits.sh", "exec sleep 30").expect("script");
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        trigger.cancel();
    });

    let mut events = Vec::new();
    let report = run_interactive(
        &test_config(&script),
        None,
        &ws.context(),
        &cancel,
        |event| events.push(event.clone()),
    )
    .expect("run");

    assert_eq!(report.stop_reason, Some(StopReason::Interrupted));
    assert!(events.iter().any(|e| matches!(e, RunEvent::Interrupted)));
}

#[test]
fn continue_runs_carry_the_session_forward() {
    let ws = Workspace::new().expect("workspace");
    let root = repository_root(&ws.repo_root);
    let store = ws.store();

    let first = ws
        .write_script(
            "first.sh",
            "echo \"args: $*\"\necho \"Plan saved to /home/dev/.copilot/session-state/abc-123/plan.md\"",
        )
        .expect("script");
    let config = RunConfig {
        session_mode: SessionMode::Continue,
        ..test_config(&first)
    };
    let mut events = Vec::new();
    let report = run_interactive(
        &config,
        Some("start"),
        &ws.context(),
        &CancelToken::new(),
        |event| events.push(event.clone()),
    )
    .expect("first run");
    assert_eq!(report.session_id.as_deref(), Some("abc-123"));
    assert!(started_argv(&events).contains(&"--continue".to_string()));
    assert_eq!(
        store.load_state(&root).last_session_id.as_deref(),
        Some("abc-123")
    );

    let second = ws
        .write_script("second.sh", "echo \"args: $*\"")
        .expect("script");
    let config = RunConfig {
        session_mode: SessionMode::Continue,
        ..test_config(&second)
    };
    let mut events = Vec::new();
    run_interactive(
        &config,
        Some("keep going"),
        &ws.context(),
        &CancelToken::new(),
        |event| events.push(event.clone()),
    )
    .expect("second run");

    let argv = started_argv(&events);
    let resume = argv.iter().position(|a| a == "--resume").expect("--resume");
    assert_eq!(argv[resume + 1], "abc-123");
    assert!(stdout_text(&events).contains("--resume abc-123 -p keep going"));
    assert_eq!(
        store.load_state(&root).last_session_id.as_deref(),
        Some("abc-123")
    );
}

#[test]
fn direct_failure_still_persists_the_session() {
    let ws = Workspace::new().expect("workspace");
    let root = repository_root(&ws.repo_root);
    ws.add_session("scanned-session", None, 10).expect("session");
    let script = ws.write_script("fails.sh", "echo working\nexit 3").expect("script");
    let config = RunConfig {
        session_mode: SessionMode::Continue,
        ..test_config(&script)
    };

    let err = run_direct(&config, "do it", &ws.context(), &CancelToken::new(), |_| {})
        .unwrap_err();

    let exit = err.downcast_ref::<ChildExitError>().expect("child exit error");
    assert_eq!(exit.code, Some(3));
    let record = ws.store().load_state(&root);
    assert_eq!(record.last_session_id.as_deref(), Some("scanned-session"));
    assert!(record.last_used_at.is_some());
}

#[test]
fn direct_requires_a_prompt() {
    let ws = Workspace::new().expect("workspace");
    let script = ws.write_script("noop.sh", "exit 0").expect("script");
    let err = run_direct(&test_config(&script), "  ", &ws.context(), &CancelToken::new(), |_| {})
        .unwrap_err();
    assert!(err.to_string().contains("requires a prompt"));
}

#[test]
fn missing_program_is_a_spawn_error() {
    let ws = Workspace::new().expect("workspace");
    let config = RunConfig {
        session_mode: SessionMode::Continue,
        ..test_config(&ws.repo_root.join("no-such-program"))
    };

    let mut events = Vec::new();
    let err = run_interactive(
        &config,
        None,
        &ws.context(),
        &CancelToken::new(),
        |event| events.push(event.clone()),
    )
    .unwrap_err();

    assert!(err.downcast_ref::<SpawnError>().is_some());
    assert!(events.is_empty());
    assert!(!fs::exists(SessionStore::state_path(&ws.repo_root)).expect("exists"));
}

#[test]
fn session_printed_during_shutdown_is_persisted() {
    let ws = Workspace::new().expect("workspace");
    let root = repository_root(&ws.repo_root);
    ws.add_session("unrelated-newest", Some("# Plan\nsomething else\n"), 5)
        .expect("session");
    let script = ws
        .write_script(
            "saves_on_term.sh",
            "trap 'echo \"Session saved: ~/.copilot/session-state/real-id-42/\"; exit 0' TERM\n\
             echo working\n\
             while true; do sleep 0.05; done",
        )
        .expect("script");
    let config = RunConfig {
        max_iterations: 1,
        session_mode: SessionMode::Continue,
        ..test_config(&script)
    };

    let mut events = Vec::new();
    let report = run_interactive(
        &config,
        None,
        &ws.context(),
        &CancelToken::new(),
        |event| events.push(event.clone()),
    )
    .expect("run");

    assert!(stdout_text(&events).contains("real-id-42"));
    assert_eq!(report.iterations, 1);
    assert_eq!(report.session_id.as_deref(), Some("real-id-42"));
    assert_eq!(
        ws.store().load_state(&root).last_session_id.as_deref(),
        Some("real-id-42")
    );
}
