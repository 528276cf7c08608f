// crashwatch-tests/tests/tests.rs

extern crate crashwatch_tests;
extern crate tempfile;

use crashwatch::{CrashKind, CrashRecord};
use crashwatch_tests::*;
use tempfile::TempDir;

fn garbage() -> String {
    let mut s = String::new();
    for _ in 0..GARBAGE_LINES {
        s.push_str(GARBAGE_LINE);
        s.push('\n');
    }
    s
}

/// Checks that stderr is exactly `before` followed by the dump the crash
/// record was parsed from.
fn assert_crash(report: &Report, kind: CrashKind, message: &str, before: &str) -> CrashRecord {
    assert_eq!(report.exit_code, Some(CRASH_EXIT_CODE), "stderr: {}", report.stderr);
    let crash = report
        .crash
        .clone()
        .unwrap_or_else(|| panic!("no crash reported, stderr: {}", report.stderr));
    assert_eq!(crash.kind, kind);
    assert_eq!(crash.message, message);
    assert_eq!(
        report.stderr,
        format!("{}{}: {}\n\n{}", before, kind, message, crash.stack)
    );
    assert_eq!(report.stderr_before_crash(), Some(before));
    crash
}

#[test]
fn no_panic() {
    let report = Tester::new(NO_PANIC).run().unwrap();
    assert_eq!(report.exit_code, Some(0), "stderr: {}", report.stderr);
    assert_eq!(report.stdout, "some stdout output\n");
    assert_eq!(report.stderr, "some stderr output\n");
    assert!(report.crash.is_none());
}

#[test]
fn no_panic_error() {
    let report = Tester::new(NO_PANIC_ERROR).run().unwrap();
    assert_eq!(report.exit_code, Some(1));
    assert_eq!(report.stdout, "");
    assert_eq!(report.stderr, "blah blah something happened\n");
    assert!(report.crash.is_none());
}

#[test]
fn panic() {
    let report = Tester::new(PANIC).run().unwrap();
    assert_eq!(report.stdout, "some output...\neverything looks good...\n");
    let crash = assert_crash(&report, CrashKind::Panic, "wtf, unexpected panic!", "");
    assert!(
        crash.stack.starts_with("thread 'main' panicked at "),
        "unexpected stack: {}",
        crash.stack
    );
    assert_eq!(crash.clone().into_error().to_string(), "wtf, unexpected panic!");
}

#[test]
fn panic_and_error() {
    let report = Tester::new(PANIC_AND_ERROR).run().unwrap();
    assert_eq!(report.stdout, "some output...\neverything looks good...\n");
    assert_crash(
        &report,
        CrashKind::Panic,
        "... and panic!",
        "well something goes bad ...\n",
    );
}

#[test]
fn panic_sync_split() {
    let report = Tester::new(PANIC_SYNC_SPLIT).run().unwrap();
    let crash = assert_crash(&report, CrashKind::Panic, "i'm split in three lol", "");
    assert_eq!(crash.stack, SPLIT_STACK);
}

#[test]
fn panic_with_garbage() {
    let report = Tester::new(PANIC_WITH_GARBAGE).run().unwrap();
    assert_eq!(report.stdout, garbage());
    assert_crash(
        &report,
        CrashKind::Panic,
        "and BAM!",
        &format!("panic: blah blah\n\n{}", garbage()),
    );
}

#[test]
fn panic_with_garbage_in_small_window() {
    // the whole stream is far larger than the window, the dump is not
    let report = Tester::new(PANIC_WITH_GARBAGE)
        .retained_size(16 * 1024)
        .run()
        .unwrap();
    assert_crash(
        &report,
        CrashKind::Panic,
        "and BAM!",
        &format!("panic: blah blah\n\n{}", garbage()),
    );
}

#[test]
fn only_last_panic_string_is_detected() {
    let report = Tester::new(ONLY_LAST_PANIC).run().unwrap();
    assert_crash(
        &report,
        CrashKind::Panic,
        "and this is not",
        "panic: this is fake\n\n",
    );
}

#[test]
fn fatal() {
    let report = Tester::new(FATAL).run().unwrap();
    let crash = assert_crash(&report, CrashKind::FatalError, FATAL_MESSAGE, "");
    assert!(crash.stack.starts_with("thread 'main' crashed\n"));
}

#[test]
fn crash_longer_than_window_is_silently_missed() {
    let report = Tester::new(PANIC_WITH_LONG_STACK)
        .retained_size(256)
        .run()
        .unwrap();
    assert_eq!(report.exit_code, Some(CRASH_EXIT_CODE));
    assert!(report.crash.is_none());

    let mut expected = String::from("panic: too deep\n\n");
    for frame in 0..LONG_STACK_FRAMES {
        expected.push_str(&format!("frame {}: recurse()\n", frame));
    }
    assert_eq!(report.stderr, expected);
}

#[test]
fn wait_for_watcher() {
    let tmpdir = TempDir::new().unwrap();
    let log = tmpdir.path().join("log");

    let report = Tester::new(WAIT_FOR_WATCHER).log_file(&log).run().unwrap();
    assert_crash(
        &report,
        CrashKind::Panic,
        "panic right after starting crashwatch",
        "",
    );
    assert_eq!(
        std::fs::read_to_string(&log).unwrap(),
        "[MAIN] starting\n[WATCHER] starting\n[MAIN] started\n"
    );
}

#[cfg(unix)]
#[test]
fn slow_watcher_times_out() {
    let report = Tester::new(SLOW_WATCHER).run().unwrap();
    assert_eq!(report.exit_code, Some(SETUP_EXIT_CODE));
    assert!(report.crash.is_none());
    // the monitor kept running and still relayed the error
    assert!(
        report
            .stderr
            .starts_with("unexpected error: crashwatch error: timed out waiting for monitor to start"),
        "stderr: {}",
        report.stderr
    );
}

#[cfg(unix)]
#[test]
fn monitor_killed_is_reported() {
    let report = Tester::new(MONITOR_KILLED).run().unwrap();
    assert_eq!(report.exit_code, Some(0), "stderr: {}", report.stderr);
    assert!(
        report
            .stdout
            .starts_with("monitor exit reported: crashwatch error: monitor process died: "),
        "stdout: {}",
        report.stdout
    );
    assert_eq!(report.stderr, "stderr restored\n");
    assert!(report.crash.is_none());
}

#[cfg(unix)]
#[test]
fn monitor_killed_without_callback_terminates_primary() {
    let report = Tester::new(MONITOR_KILLED_NO_CALLBACK).run().unwrap();
    assert_eq!(report.exit_code, Some(1));
    assert_eq!(report.stdout, "");
    assert!(
        report.stderr.starts_with("crashwatch: monitor process died: "),
        "stderr: {}",
        report.stderr
    );
}

#[cfg(unix)]
#[test]
fn relay_failure_reaches_error_callback_and_exit_status() {
    let tmpdir = TempDir::new().unwrap();
    let log = tmpdir.path().join("log");

    let report = Tester::new(RELAY_BROKEN)
        .log_file(&log)
        .close_stderr()
        .run()
        .unwrap();
    assert_eq!(report.exit_code, Some(0));
    assert!(report.crash.is_none());
    assert_eq!(
        report.stdout,
        "monitor exit reported: crashwatch error: monitor process died: exit status: 1\n"
    );

    let log = std::fs::read_to_string(&log).unwrap();
    assert!(
        log.contains("[WATCHER] monitor error: crashwatch error: unable to forward stderr: "),
        "log: {}",
        log
    );
}
