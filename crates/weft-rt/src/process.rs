//! Per-process bookkeeping: identifiers, slot records, and states.
//!
//! A process is a lightweight cooperatively-scheduled unit of execution,
//! not an OS process or thread. Its saved control state lives in a
//! [`ProcessBody`] owned by exactly one pool slot; the slot storage is
//! recycled across process lifetimes but the identifier never is.

use std::fmt;

use crate::coro::ProcessBody;

// ---------------------------------------------------------------------------
// ProcessId
// ---------------------------------------------------------------------------

/// Unique identifier for a scheduled process.
///
/// Ids are assigned sequentially by their scheduler instance and are never
/// reused, even though the slot that backed a dead process is. A stale id
/// therefore always reads as "no such process" rather than aliasing a
/// newer one.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(u64);

impl ProcessId {
    pub(crate) fn new(raw: u64) -> Self {
        ProcessId(raw)
    }

    /// Return the raw numeric value.
    ///
    /// This is the value `kill_matching` masks against.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pid({})", self.0)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ProcessState
// ---------------------------------------------------------------------------

/// Observable scheduling state of a live process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Counting down; will not be resumed before its countdown elapses.
    Armed,
    /// Countdown elapsed; will be resumed when the current pass reaches it.
    Due,
    /// Its body is executing right now.
    Resuming,
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default pool capacity.
///
/// The original engine ran its entire script load inside a fixed table of
/// this size; the bound is what keeps per-tick cost predictable.
pub const DEFAULT_CAPACITY: usize = 100;

/// Default coroutine stack size: 64 KiB.
///
/// Virtual memory lazy-commits pages, so even a full pool of processes
/// with 64 KiB virtual stacks stays cheap on modern systems.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Smallest per-process stack the scheduler will allocate: 32 KiB.
///
/// Containing a panicking body requires enough headroom for the panic
/// hook's formatting to run on the coroutine stack; below this floor it
/// overruns into the guard page and takes the whole host down instead.
/// Requests for smaller stacks are rounded up.
pub const MIN_STACK_SIZE: usize = 32 * 1024;

// ---------------------------------------------------------------------------
// Slot
// ---------------------------------------------------------------------------

/// One fixed-size pool record: a process identity plus its resumable body
/// and countdown.
///
/// `body` is `None` only while the body is checked out for resumption;
/// the current process cannot be destroyed through the external kill
/// paths, so the body always has a slot to return to.
pub(crate) struct Slot {
    pub id: ProcessId,
    pub body: Option<ProcessBody>,
    /// Ticks remaining before the next resume. Decremented once per pass;
    /// the process is due when it reaches zero or below.
    pub countdown: i32,
    /// Stamp of the last tick pass that visited this slot. Fresh slots
    /// carry stamp 0, which never matches a live pass serial.
    pub pass: u64,
}

impl Slot {
    pub fn new(id: ProcessId, body: ProcessBody, countdown: i32) -> Self {
        Slot {
            id,
            body: Some(body),
            countdown,
            pass: 0,
        }
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("countdown", &self.countdown)
            .field("pass", &self.pass)
            .field("body_checked_out", &self.body.is_none())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
