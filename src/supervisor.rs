//! Supervisor side: owns the segment, spawns the worker, polls and reaps it
//!
//! The only channel to the worker is the shared segment: atomic counters
//! for coarse progress plus a best-effort byte ring for short messages.
//! The supervisor tolerates the worker crashing, hanging or being killed;
//! "exited cleanly" versus "died mid-item" is decided by the caller from
//! the exit status together with the counters.

use crate::control_block::{
    ControlBlock, Progress, CONTROL_REGION_SIZE, DEFAULT_RING_SIZE, MESSAGE_SIZE,
};
use crate::error::{OutpostError, Result};
use crate::shm::SharedSegment;
use rustix::process::{kill_process, test_kill_process, waitpid, Pid, Signal, WaitOptions};
use std::collections::HashSet;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Argv flag telling the worker it runs under a supervisor
pub const ARG_MASTER_PROCESS: &str = "--master-process";
/// Argv flag telling the worker to silence its own child diagnostics
pub const ARG_QUIET_SLAVE: &str = "--quiet-slave";
/// Argv flag carrying the inherited shared-memory descriptor
pub const ARG_SHMEM_FD: &str = "--shmem-fd";

/// How to launch a worker
pub struct WorkerOptions {
    /// Worker executable path
    pub worker_path: PathBuf,
    /// Workload descriptor handed through argv, opaque to the supervisor
    pub workload: String,
    /// Redirect the worker's stdout/stderr to /dev/null
    pub quiet: bool,
    /// Ring capacity in bytes; must be a power of two
    pub ring_buffer_size: u32,
}

impl WorkerOptions {
    pub fn new(worker_path: impl Into<PathBuf>, workload: impl Into<String>) -> Self {
        Self {
            worker_path: worker_path.into(),
            workload: workload.into(),
            quiet: false,
            ring_buffer_size: DEFAULT_RING_SIZE,
        }
    }
}

/// Outcome of a non-blocking progress poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Worker has not yet flagged `progress_started`
    NotReady,
    /// Work in flight; latest counter snapshot attached
    Running(Progress),
    /// Worker flagged `progress_complete`
    Complete(Progress),
}

/// Collected exit status of a reaped worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Normal termination with the given exit code
    Exited(u32),
    /// Terminated by the given signal
    Signaled(u32),
}

impl WorkerExit {
    pub fn success(self) -> bool {
        matches!(self, WorkerExit::Exited(0))
    }
}

/// Owns one worker's entire out-of-process lifetime
pub struct Supervisor {
    pid: Option<Pid>,
    shm: SharedSegment,
    faulty_modules: HashSet<u64>,
    graphics_failed_validation: HashSet<u64>,
    compute_failed_validation: HashSet<u64>,
}

impl Supervisor {
    /// Create the segment, initialize the control block and spawn the worker
    ///
    /// Every failure path leaves no child running and nothing linked in the
    /// shm namespace; the partially built state is just dropped.
    pub fn start(options: &WorkerOptions) -> Result<Self> {
        let ring_size = options.ring_buffer_size;
        if ring_size == 0 || !ring_size.is_power_of_two() {
            return Err(OutpostError::RingSizeNotPowerOfTwo(ring_size));
        }

        let shm = SharedSegment::create(CONTROL_REGION_SIZE + ring_size as usize)?;

        // The segment is zero-filled; only cookie, lock and geometry need
        // explicit stores.
        unsafe {
            ControlBlock::init(shm.as_ptr().cast(), ring_size, CONTROL_REGION_SIZE as u32);
        }

        shm.keep_across_exec()?;

        let pid = spawn_worker(&shm, options)?;
        info!(
            pid = pid.as_raw_nonzero().get(),
            worker = %options.worker_path.display(),
            workload = %options.workload,
            "spawned worker"
        );

        Ok(Self {
            pid: Some(pid),
            shm,
            faulty_modules: HashSet::new(),
            graphics_failed_validation: HashSet::new(),
            compute_failed_validation: HashSet::new(),
        })
    }

    /// Drain pending messages and report the latest counter snapshot
    ///
    /// Never blocks waiting for the worker; the lock is only held for the
    /// drain itself. Errors if there is no process left and completion was
    /// never signalled.
    pub fn poll_progress(&mut self) -> Result<PollStatus> {
        let complete = self.block().is_complete();
        if self.pid.is_none() && !complete {
            return Err(OutpostError::NoWorker);
        }
        if !self.block().has_started() {
            return Ok(PollStatus::NotReady);
        }

        let progress = self.block().snapshot();
        self.drain_messages();

        Ok(if complete {
            PollStatus::Complete(progress)
        } else {
            PollStatus::Running(progress)
        })
    }

    /// Zero-cost liveness probe via a no-op signal
    ///
    /// Does not reap; callers still need [`wait`](Supervisor::wait) to
    /// avoid accumulating zombies.
    pub fn is_process_complete(&self) -> bool {
        match self.pid {
            None => true,
            // ESRCH means already gone (and reaped); EPERM can't happen for
            // our own child.
            Some(pid) => test_kill_process(pid).is_err(),
        }
    }

    /// Out-of-band forced termination; [`wait`](Supervisor::wait) must
    /// still be called to reap the worker afterwards.
    pub fn kill(&self) -> Result<()> {
        let pid = self.pid.ok_or(OutpostError::NoWorker)?;
        kill_process(pid, Signal::Kill).map_err(|e| OutpostError::Kill(e.into()))
    }

    /// Block until the worker terminates, reap it and collect its status
    ///
    /// The ring is drained right before blocking (messages pending at exit)
    /// and right after (messages written concurrently with the wait).
    /// The status is logged but not interpreted further here.
    ///
    /// A worker killed inside the ring lock's copy window leaves the lock
    /// held and the drains here would spin on it forever; the window is a
    /// single bounded memcpy, but callers that force-kill workers should
    /// know it exists.
    pub fn wait(&mut self) -> Result<WorkerExit> {
        let pid = self.pid.ok_or(OutpostError::NoWorker)?;

        self.drain_messages();

        let status = waitpid(Some(pid), WaitOptions::empty())
            .map_err(|e| OutpostError::Wait(e.into()))?
            .ok_or(OutpostError::NoWorker)?;

        self.drain_messages();
        self.pid = None;

        let exit = match (status.exit_status(), status.terminating_signal()) {
            (Some(code), _) => WorkerExit::Exited(code),
            (None, Some(sig)) => WorkerExit::Signaled(sig),
            // Stop/continue reports need wait options we never pass.
            (None, None) => WorkerExit::Exited(status.as_raw()),
        };
        info!(?exit, "worker reaped");
        Ok(exit)
    }

    /// Module hashes the worker reported as crash-inducing
    pub fn faulty_modules(&self) -> &HashSet<u64> {
        &self.faulty_modules
    }

    /// Graphics pipeline hashes that failed validation
    pub fn graphics_failed_validation(&self) -> &HashSet<u64> {
        &self.graphics_failed_validation
    }

    /// Compute pipeline hashes that failed validation
    pub fn compute_failed_validation(&self) -> &HashSet<u64> {
        &self.compute_failed_validation
    }

    /// Pid of the worker, until it has been reaped
    pub fn pid(&self) -> Option<i32> {
        self.pid.map(|pid| pid.as_raw_nonzero().get())
    }

    fn block(&self) -> &ControlBlock {
        unsafe { &*self.shm.as_ptr().cast::<ControlBlock>() }
    }

    fn drain_messages(&mut self) {
        let mut guard = unsafe { ControlBlock::lock_ring(self.shm.as_ptr().cast()) };
        let avail = guard.read_avail() as usize;

        let mut buf = [0u8; MESSAGE_SIZE];
        let mut consumed = MESSAGE_SIZE;
        // Whole messages only; a partial trailing chunk stays for later.
        while consumed <= avail {
            if !guard.read(&mut buf) {
                break;
            }
            self.record_message(&buf);
            consumed += MESSAGE_SIZE;
        }
    }

    fn record_message(&mut self, raw: &[u8; MESSAGE_SIZE]) {
        let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let Ok(msg) = std::str::from_utf8(&raw[..len]) else {
            warn!("dropping non-UTF-8 worker message");
            return;
        };
        debug!(message = msg, "worker message");

        match parse_message(msg) {
            Some(WorkerMessage::FaultyModule(hash)) => {
                self.faulty_modules.insert(hash);
            }
            Some(WorkerMessage::GraphicsValidationFailed(hash)) => {
                self.graphics_failed_validation.insert(hash);
            }
            Some(WorkerMessage::ComputeValidationFailed(hash)) => {
                self.compute_failed_validation.insert(hash);
            }
            // Anything else is informational only.
            None => {}
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // Dropping unmaps but never reaps; an un-waited child becomes a
        // zombie until the caller collects it elsewhere.
        if let Some(pid) = self.pid {
            warn!(
                pid = pid.as_raw_nonzero().get(),
                "supervisor dropped without reaping the worker"
            );
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum WorkerMessage {
    FaultyModule(u64),
    GraphicsValidationFailed(u64),
    ComputeValidationFailed(u64),
}

fn parse_message(msg: &str) -> Option<WorkerMessage> {
    if let Some(rest) = msg.strip_prefix("MODULE") {
        let hash = u64::from_str_radix(rest.trim(), 16).ok()?;
        Some(WorkerMessage::FaultyModule(hash))
    } else if let Some(rest) = msg.strip_prefix("GRAPHICS_VERR") {
        let hash = u64::from_str_radix(rest.trim(), 16).ok()?;
        Some(WorkerMessage::GraphicsValidationFailed(hash))
    } else if let Some(rest) = msg.strip_prefix("COMPUTE_VERR") {
        let hash = u64::from_str_radix(rest.trim(), 16).ok()?;
        Some(WorkerMessage::ComputeValidationFailed(hash))
    } else {
        None
    }
}

/// Fork and exec the worker, handing it the inherited descriptor
///
/// Everything the child touches is prepared before the fork: between fork
/// and exec only async-signal-safe calls are allowed, and the child never
/// returns into the parent's code path. Exec failure surfaces as the
/// child exiting with the OS error code.
fn spawn_worker(shm: &SharedSegment, options: &WorkerOptions) -> Result<Pid> {
    let path = CString::new(options.worker_path.as_os_str().as_bytes())
        .map_err(|_| OutpostError::NulInArgument)?;
    let workload =
        CString::new(options.workload.as_str()).map_err(|_| OutpostError::NulInArgument)?;
    let flag_master = CString::new(ARG_MASTER_PROCESS).unwrap();
    let flag_quiet = CString::new(ARG_QUIET_SLAVE).unwrap();
    let flag_fd = CString::new(ARG_SHMEM_FD).unwrap();
    let fd_value = CString::new(shm.raw_fd().to_string()).unwrap();

    let argv: [*const libc::c_char; 7] = [
        path.as_ptr(),
        workload.as_ptr(),
        flag_master.as_ptr(),
        flag_quiet.as_ptr(),
        flag_fd.as_ptr(),
        fd_value.as_ptr(),
        std::ptr::null(),
    ];

    match unsafe { libc::fork() } {
        -1 => Err(OutpostError::Fork(std::io::Error::last_os_error())),
        0 => {
            // Child.
            unsafe {
                if options.quiet {
                    let null_fd = libc::open(b"/dev/null\0".as_ptr().cast(), libc::O_WRONLY);
                    if null_fd >= 0 {
                        libc::dup2(null_fd, libc::STDOUT_FILENO);
                        libc::dup2(null_fd, libc::STDERR_FILENO);
                        libc::close(null_fd);
                    }
                }
                libc::execv(path.as_ptr(), argv.as_ptr());
                // Exec only returns on failure; report the errno as the
                // exit status so the parent can observe it via wait().
                libc::_exit(std::io::Error::last_os_error().raw_os_error().unwrap_or(1));
            }
        }
        child => Ok(Pid::from_raw(child).expect("fork returned a positive pid")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_defaults() {
        let options = WorkerOptions::new("/usr/bin/replayer", "trace.foz");
        assert_eq!(options.ring_buffer_size, DEFAULT_RING_SIZE);
        assert!(!options.quiet);
    }

    #[test]
    fn test_start_rejects_non_power_of_two_ring() {
        let mut options = WorkerOptions::new("/does/not/matter", "workload");
        options.ring_buffer_size = 1000;
        match Supervisor::start(&options) {
            Err(OutpostError::RingSizeNotPowerOfTwo(size)) => assert_eq!(size, 1000),
            other => panic!("unexpected result: {:?}", other.err()),
        }
    }

    #[test]
    fn test_parse_known_messages() {
        assert_eq!(
            parse_message("MODULE 1234abcd"),
            Some(WorkerMessage::FaultyModule(0x1234abcd))
        );
        assert_eq!(
            parse_message("GRAPHICS_VERR feed"),
            Some(WorkerMessage::GraphicsValidationFailed(0xfeed))
        );
        assert_eq!(
            parse_message("COMPUTE_VERR beef"),
            Some(WorkerMessage::ComputeValidationFailed(0xbeef))
        );
    }

    #[test]
    fn test_parse_rejects_noise() {
        assert_eq!(parse_message("replaying item 4"), None);
        assert_eq!(parse_message("MODULE not-hex"), None);
        assert_eq!(parse_message(""), None);
    }
}
