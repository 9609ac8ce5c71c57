//! Outpost - supervise an out-of-process worker over shared memory
//!
//! A supervisor creates an anonymous shared-memory segment holding a fixed
//! control block (atomic progress counters plus a lock-guarded byte ring),
//! spawns the worker with the inherited descriptor, then polls, probes and
//! finally reaps it. The ring is informational and best-effort: no
//! delivery guarantee, no retransmission, messages are dropped when the
//! ring is full.
//!
//! # Architecture
//!
//! - **Supervisor**: creates and owns the segment, spawns the worker as a
//!   child process, drains the ring, collects the exit status
//! - **Worker**: attaches via the descriptor named on its command line,
//!   bumps progress counters and pushes short messages as it replays items
//!
//! The supervisor survives the worker crashing, hanging or being killed;
//! only `wait()` blocks.

pub mod control_block;
pub mod error;
pub mod ring;
pub mod shm;
pub mod supervisor;
pub mod worker;

pub use control_block::{ControlBlock, Progress, StageProgress, DEFAULT_RING_SIZE, MESSAGE_SIZE};
pub use error::{OutpostError, Result};
pub use ring::RingGuard;
pub use supervisor::{PollStatus, Supervisor, WorkerExit, WorkerOptions};
pub use worker::WorkerLink;
