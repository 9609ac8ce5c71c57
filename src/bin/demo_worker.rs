//! Reference worker implementing the supervisor's invocation contract
//!
//! Invoked as `demo_worker <workload> --master-process --quiet-slave
//! --shmem-fd <n>`. The argv is a fixed positional wire contract produced
//! by the supervisor, so it is parsed by hand rather than through a CLI
//! framework.
//!
//! The workload descriptor selects the behavior: `hang` starts and then
//! sleeps forever (for kill/reap testing), anything else replays a small
//! fake workload and exits cleanly.

use outpost::WorkerLink;
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::atomic::Ordering;
use std::time::Duration;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let workload = args.get(1).cloned().unwrap_or_default();
    let Some(fd) = args
        .iter()
        .position(|arg| arg == "--shmem-fd")
        .and_then(|i| args.get(i + 1))
        .and_then(|value| value.parse::<i32>().ok())
    else {
        eprintln!("missing --shmem-fd <n>");
        std::process::exit(1);
    };

    let link = match unsafe { WorkerLink::attach(OwnedFd::from_raw_fd(fd)) } {
        Ok(link) => link,
        Err(err) => {
            eprintln!("failed to attach control block: {err}");
            std::process::exit(1);
        }
    };

    link.mark_started();
    let block = link.block();

    if workload == "hang" {
        block.total_modules.store(1, Ordering::Relaxed);
        link.push_message("MODULE dead");
        loop {
            std::thread::sleep(Duration::from_secs(3600));
        }
    }

    // Fake replay: four graphics pipelines (one skipped, three good), two
    // compute pipelines, three modules (one banned, one failing validation).
    block.total_graphics.store(4, Ordering::Relaxed);
    block.total_compute.store(2, Ordering::Relaxed);
    block.total_modules.store(3, Ordering::Relaxed);

    for index in 0..4u32 {
        block.parsed_graphics.fetch_add(1, Ordering::Relaxed);
        if index == 3 {
            block.skipped_graphics.fetch_add(1, Ordering::Relaxed);
        } else {
            block.successful_graphics.fetch_add(1, Ordering::Relaxed);
        }
    }
    for _ in 0..2u32 {
        block.parsed_compute.fetch_add(1, Ordering::Relaxed);
        block.successful_compute.fetch_add(1, Ordering::Relaxed);
    }
    block.successful_modules.store(2, Ordering::Relaxed);
    block.banned_modules.store(1, Ordering::Relaxed);
    block.module_validation_failures.store(1, Ordering::Relaxed);

    link.push_message("MODULE 1234abcd");
    link.push_message("GRAPHICS_VERR feed");
    link.push_message("COMPUTE_VERR beef");

    println!("replayed workload '{workload}'");
    link.mark_complete();
}
