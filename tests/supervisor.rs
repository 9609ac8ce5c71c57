//! End-to-end supervision scenarios against the real demo worker binary

use outpost::{PollStatus, Supervisor, WorkerExit, WorkerOptions};
use std::time::{Duration, Instant};

fn demo_worker() -> &'static str {
    env!("CARGO_BIN_EXE_demo_worker")
}

#[test]
fn run_to_completion() {
    let mut supervisor =
        Supervisor::start(&WorkerOptions::new(demo_worker(), "trace.bin")).unwrap();

    let exit = supervisor.wait().unwrap();
    assert_eq!(exit, WorkerExit::Exited(0));
    assert!(exit.success());
    assert!(supervisor.is_process_complete());
    assert_eq!(supervisor.pid(), None);

    match supervisor.poll_progress().unwrap() {
        PollStatus::Complete(progress) => {
            assert_eq!(progress.graphics.total, 4);
            assert_eq!(progress.graphics.parsed, 4);
            assert_eq!(progress.graphics.skipped, 1);
            assert_eq!(progress.graphics.completed, 3);
            assert_eq!(progress.compute.total, 2);
            assert_eq!(progress.compute.completed, 2);
            assert_eq!(progress.total_modules, 3);
            assert_eq!(progress.completed_modules, 2);
            assert_eq!(progress.banned_modules, 1);
            assert_eq!(progress.module_validation_failures, 1);
        }
        other => panic!("expected completion, got {other:?}"),
    }

    // Messages drained during wait() land in the parsed-hash sets.
    assert!(supervisor.faulty_modules().contains(&0x1234abcd));
    assert!(supervisor.graphics_failed_validation().contains(&0xfeed));
    assert!(supervisor.compute_failed_validation().contains(&0xbeef));
}

#[test]
fn quiet_worker_runs_to_completion() {
    let mut options = WorkerOptions::new(demo_worker(), "trace.bin");
    options.quiet = true;

    let mut supervisor = Supervisor::start(&options).unwrap();
    assert!(supervisor.wait().unwrap().success());
}

#[test]
fn missing_worker_surfaces_exit_status() {
    // Fork succeeds, exec fails; the child exits with the OS error code.
    // This must be an observable abnormal exit, never a hang.
    let mut supervisor =
        Supervisor::start(&WorkerOptions::new("/no/such/worker", "trace.bin")).unwrap();

    match supervisor.wait().unwrap() {
        WorkerExit::Exited(code) => assert_ne!(code, 0),
        other => panic!("expected an exit code, got {other:?}"),
    }
    assert!(supervisor.is_process_complete());
}

#[test]
fn killed_worker_is_reaped_with_final_drain() {
    let mut supervisor = Supervisor::start(&WorkerOptions::new(demo_worker(), "hang")).unwrap();

    // Spin until the worker flags progress_started.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match supervisor.poll_progress().unwrap() {
            PollStatus::NotReady => {
                assert!(Instant::now() < deadline, "worker never started");
                std::thread::sleep(Duration::from_millis(10));
            }
            PollStatus::Running(_) => break,
            PollStatus::Complete(_) => panic!("hanging worker must not complete"),
        }
    }

    assert!(!supervisor.is_process_complete());
    supervisor.kill().unwrap();

    let exit = supervisor.wait().unwrap();
    assert_eq!(exit, WorkerExit::Signaled(9)); // SIGKILL
    assert!(supervisor.is_process_complete());

    // The message pushed before the hang survives the forced death.
    assert!(supervisor.faulty_modules().contains(&0xdead));
}
