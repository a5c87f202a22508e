#![cfg(unix)]

use std::ffi::{OsStr, OsString};
use std::time::{Duration, Instant};

use anyhow::Result;

use shunt_core::archiver::{run_child, run_child_with_retry, ChildStatus, ProcessRegistry};
use shunt_core::errors::EngineError;
use shunt_core::logger::EngineLogger;
use shunt_core::CancelFlag;

fn sh_args(script: &str) -> Vec<OsString> {
    vec![OsString::from("-c"), OsString::from(script)]
}

#[test]
fn captures_output_of_a_clean_exit() -> Result<()> {
    let registry = ProcessRegistry::new();
    let status = run_child(
        &registry,
        &CancelFlag::new(),
        OsStr::new("/bin/sh"),
        &sh_args("echo packed"),
        None,
        Duration::from_secs(5),
    )?;
    match status {
        ChildStatus::Finished(output) => assert!(output.stdout.contains("packed")),
        ChildStatus::Cancelled => panic!("unexpected cancellation"),
    }
    assert_eq!(registry.active_count(), 0);
    Ok(())
}

#[test]
fn nonzero_exit_carries_code_and_stderr() {
    let registry = ProcessRegistry::new();
    let err = run_child(
        &registry,
        &CancelFlag::new(),
        OsStr::new("/bin/sh"),
        &sh_args("echo broken >&2; exit 3"),
        None,
        Duration::from_secs(5),
    )
    .unwrap_err();

    let engine_err = err.downcast_ref::<EngineError>().expect("engine error");
    match engine_err {
        EngineError::NonZeroExit { code, stderr, .. } => {
            assert_eq!(*code, Some(3));
            assert!(stderr.contains("broken"));
        }
        other => panic!("expected NonZeroExit, got {other}"),
    }
    assert_eq!(registry.active_count(), 0);
}

#[test]
fn timeout_kills_the_child() {
    let registry = ProcessRegistry::new();
    let started = Instant::now();
    let err = run_child(
        &registry,
        &CancelFlag::new(),
        OsStr::new("/bin/sh"),
        &sh_args("sleep 30"),
        None,
        Duration::from_millis(300),
    )
    .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(5));
    let engine_err = err.downcast_ref::<EngineError>().expect("engine error");
    assert!(engine_err.is_timeout());
    assert_eq!(registry.active_count(), 0);
}

#[test]
fn timeouts_are_retried_and_reraised() {
    let registry = ProcessRegistry::new();
    let started = Instant::now();
    let err = run_child_with_retry(
        &registry,
        &CancelFlag::new(),
        &EngineLogger::noop(),
        OsStr::new("/bin/sh"),
        &sh_args("sleep 30"),
        None,
        Duration::from_millis(200),
        3,
    )
    .unwrap_err();

    // Three attempts, each bounded by the per-call timeout.
    assert!(started.elapsed() >= Duration::from_millis(600));
    assert!(err
        .downcast_ref::<EngineError>()
        .is_some_and(EngineError::is_timeout));
}

#[test]
fn nonzero_exits_are_not_retried() {
    let registry = ProcessRegistry::new();
    let started = Instant::now();
    let err = run_child_with_retry(
        &registry,
        &CancelFlag::new(),
        &EngineLogger::noop(),
        OsStr::new("/bin/sh"),
        &sh_args("sleep 1; exit 7"),
        None,
        Duration::from_secs(10),
        3,
    )
    .unwrap_err();

    // One attempt only: well under two sleeps.
    assert!(started.elapsed() < Duration::from_millis(1900));
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::NonZeroExit { code: Some(7), .. })
    ));
}

#[test]
fn stop_kills_registered_children_and_reports_cancelled() -> Result<()> {
    let registry = ProcessRegistry::new();
    let cancel = CancelFlag::new();

    let stopper = {
        let registry = std::sync::Arc::clone(&registry);
        let cancel = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            // Same order as StopHandle::stop.
            cancel.set();
            registry.kill_all();
        })
    };

    let started = Instant::now();
    let status = run_child(
        &registry,
        &cancel,
        OsStr::new("/bin/sh"),
        &sh_args("sleep 30"),
        None,
        Duration::from_secs(60),
    )?;

    assert!(status.is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(registry.active_count(), 0);
    stopper.join().unwrap();
    Ok(())
}

#[test]
fn cancelled_flag_short_circuits_before_spawn() -> Result<()> {
    let registry = ProcessRegistry::new();
    let cancel = CancelFlag::new();
    cancel.set();
    let status = run_child(
        &registry,
        &cancel,
        OsStr::new("/bin/sh"),
        &sh_args("echo never"),
        None,
        Duration::from_secs(5),
    )?;
    assert!(status.is_cancelled());
    Ok(())
}
