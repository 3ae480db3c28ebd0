//! Weft runtime scheduler.
//!
//! A fixed-capacity pool of lightweight, resumable processes driven one
//! step at a time by a host loop: the concurrency substrate under a
//! scripted game runtime. No threads, no preemption: a process runs until
//! it suspends itself, and the host advances the whole pool once per
//! frame with [`Scheduler::tick`].
//!
//! ## Architecture
//!
//! - **Process bookkeeping** (`process.rs`): [`ProcessId`] (monotonic,
//!   never reused), the pool slot record, and [`ProcessState`].
//! - **Pool** (`pool.rs`): fixed slot arena partitioned into an ordered
//!   ACTIVE set and a FREE index stack; no growth, bounded per-tick cost.
//! - **Bodies** (`coro.rs`): corosensei stackful coroutines; a body
//!   yields the number of ticks it wants to sleep, and its
//!   [`ProcessContext`] carries the wait primitive and re-entrant
//!   scheduler access.
//! - **Scheduler** (`scheduler.rs`): create, tick, kill (single and
//!   pattern-matched), reorder (reschedule, give-way), and the reclaimer
//!   hook that lets the engine release per-process resources.
//!
//! ## Example
//!
//! ```
//! use weft_rt::Scheduler;
//!
//! let sched = Scheduler::new(16);
//! sched
//!     .spawn(
//!         |ctx, name: &str| {
//!             ctx.sleep(2);
//!             println!("{name} woke up as process {}", ctx.id());
//!         },
//!         "blinker",
//!     )
//!     .unwrap();
//!
//! for _frame in 0..3 {
//!     sched.tick().unwrap();
//! }
//! assert_eq!(sched.active_count(), 0);
//! ```
//!
//! Processes may freely spawn, kill, reorder, and wait on each other from
//! inside their own bodies; the scheduler's lock is released across every
//! resume precisely to allow that. Scheduler state is transient: it is
//! rebuilt from game state on load, never serialized.

mod coro;
mod error;
mod pool;
mod process;
mod scheduler;

pub use coro::ProcessContext;
pub use error::SchedError;
pub use process::{
    ProcessId, ProcessState, DEFAULT_CAPACITY, DEFAULT_STACK_SIZE, MIN_STACK_SIZE,
};
pub use scheduler::Scheduler;
