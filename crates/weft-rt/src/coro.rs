//! Corosensei-backed resumable process bodies and the context they run in.
//!
//! Each process body is a stackful coroutine on its own fixed-size stack.
//! A suspended body yields the number of ticks it wants to stay parked;
//! the scheduler re-arms its countdown from that value and resumes it when
//! the countdown elapses.
//!
//! The entry closure receives a [`ProcessContext`]: the process's own id,
//! the suspension primitives (`sleep`, `wait_for`), and re-entrant access
//! to the owning [`Scheduler`]. There is no global scheduler state; the
//! context is the only doorway back in, which also means the wait
//! primitive simply cannot be called without a current process.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Weak;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use parking_lot::Mutex;

use crate::process::ProcessId;
use crate::scheduler::{Inner, Scheduler};

// ---------------------------------------------------------------------------
// ProcessBody
// ---------------------------------------------------------------------------

/// Outcome of driving a body one step forward.
pub(crate) enum Resumed {
    /// The body suspended, requesting resumption after this many ticks.
    Yielded(u32),
    /// The body returned from its entry closure.
    Completed,
    /// The body panicked; its saved state is unusable.
    Panicked(String),
}

/// An owned, opaque suspended-execution value: the process's saved control
/// state and locals across suspension points.
///
/// Exclusively owned by its pool slot and dropped exactly once, when the
/// process finishes or is killed. `ProcessBody` is `!Send`; bodies never
/// leave the thread that drives the scheduler.
pub(crate) struct ProcessBody {
    coro: Coroutine<(), u32, ()>,
}

impl ProcessBody {
    /// Build the coroutine for a new process.
    ///
    /// `params` is moved into the body, so the caller's value is consumed
    /// at creation time and the body's copy lives and dies with the slot.
    pub fn new<P, F>(
        id: ProcessId,
        shared: Weak<Mutex<Inner>>,
        stack_size: usize,
        entry: F,
        params: P,
    ) -> Self
    where
        P: 'static,
        F: FnOnce(&ProcessContext<'_>, P) + 'static,
    {
        let stack = DefaultStack::new(stack_size).expect("failed to allocate coroutine stack");

        let coro = Coroutine::with_stack(stack, move |yielder: &Yielder<(), u32>, _input: ()| {
            let ctx = ProcessContext {
                id,
                shared,
                yielder,
            };
            entry(&ctx, params);
        });

        ProcessBody { coro }
    }

    /// Resume the body one step.
    ///
    /// A panic inside the body is contained here rather than propagated
    /// into the host's tick loop; the caller destroys the process.
    pub fn resume(&mut self) -> Resumed {
        match catch_unwind(AssertUnwindSafe(|| self.coro.resume(()))) {
            Ok(CoroutineResult::Yield(delay)) => Resumed::Yielded(delay),
            Ok(CoroutineResult::Return(())) => Resumed::Completed,
            Err(payload) => Resumed::Panicked(panic_message(payload)),
        }
    }
}

impl fmt::Debug for ProcessBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessBody")
            .field("done", &self.coro.done())
            .finish()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// ProcessContext
// ---------------------------------------------------------------------------

/// The view a running body has of itself and its scheduler.
///
/// Valid only for the duration of the entry closure; the borrow handed to
/// the closure cannot escape it.
pub struct ProcessContext<'a> {
    id: ProcessId,
    shared: Weak<Mutex<Inner>>,
    yielder: &'a Yielder<(), u32>,
}

impl ProcessContext<'_> {
    /// This process's own id.
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Suspend this process for `ticks` ticks.
    ///
    /// A request of 0 is treated as 1: the minimum positive countdown, so
    /// the process stays eligible "as soon as possible" rather than
    /// spinning inside one pass.
    pub fn sleep(&self, ticks: u32) {
        self.yielder.suspend(ticks);
    }

    /// A handle to the owning scheduler, for nested operations (spawn,
    /// kill, reorder) issued from inside a resume.
    ///
    /// Panics if the scheduler itself has already been released, which can
    /// only happen in destructors running while the pool is torn down.
    pub fn scheduler(&self) -> Scheduler {
        Scheduler {
            shared: self
                .shared
                .upgrade()
                .expect("scheduler released while a process is running"),
        }
    }

    /// Suspend tick by tick until the `target` process no longer exists or
    /// `timeout` ticks of waiting have elapsed, whichever comes first.
    ///
    /// Returns `true` when the timeout expired with the target still
    /// alive, `false` when the target disappeared. `None` waits forever.
    /// There is no other way out: a wait ends when the target finishes or
    /// is killed, when the timeout fires, or when the waiter itself is
    /// killed.
    pub fn wait_for(&self, target: ProcessId, timeout: Option<u32>) -> bool {
        let mut waited = 0u32;
        loop {
            if !self.scheduler().is_alive(target) {
                return false;
            }
            if let Some(max) = timeout {
                if waited >= max {
                    return true;
                }
            }
            self.sleep(1);
            // Saturate: an untimed wait can outlive the counter's range.
            waited = waited.saturating_add(1);
        }
    }

    /// Move this process to the very end of the ACTIVE order, letting
    /// every other pending process run first. Countdown is untouched.
    pub fn give_way(&self) -> bool {
        self.scheduler().give_way(self.id)
    }

    /// Self-targeted [`Scheduler::reschedule`]. The current process has
    /// already been visited this pass, so mid-tick this reports `false`
    /// and changes nothing; it mirrors the original API where a process
    /// could name itself as the reschedule target.
    pub fn reschedule(&self) -> bool {
        self.scheduler().reschedule(self.id)
    }
}

impl fmt::Debug for ProcessContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessContext").field("id", &self.id).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::DEFAULT_STACK_SIZE;
    use std::cell::Cell;
    use std::rc::Rc;

    // Containing a panic needs the panic hook's frames to fit on the
    // coroutine stack, so test bodies get the full default stack.
    fn body_with<F>(entry: F) -> ProcessBody
    where
        F: FnOnce(&ProcessContext<'_>, ()) + 'static,
    {
        ProcessBody::new(ProcessId::new(0), Weak::new(), DEFAULT_STACK_SIZE, entry, ())
    }

    #[test]
    fn body_runs_to_completion() {
        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);
        let mut body = body_with(move |_ctx, _| flag.set(true));

        assert!(matches!(body.resume(), Resumed::Completed));
        assert!(ran.get());
    }

    #[test]
    fn body_yields_requested_delay() {
        let mut body = body_with(|ctx, _| {
            ctx.sleep(3);
            ctx.sleep(1);
        });

        assert!(matches!(body.resume(), Resumed::Yielded(3)));
        assert!(matches!(body.resume(), Resumed::Yielded(1)));
        assert!(matches!(body.resume(), Resumed::Completed));
    }

    #[test]
    fn body_panic_is_contained() {
        let mut body = body_with(|_ctx, _| panic!("boom"));

        match body.resume() {
            Resumed::Panicked(msg) => assert_eq!(msg, "boom"),
            _ => panic!("expected a contained panic"),
        }
    }

    #[test]
    fn context_reports_own_id() {
        let seen = Rc::new(Cell::new(0u64));
        let out = Rc::clone(&seen);
        let mut body = ProcessBody::new(
            ProcessId::new(9),
            Weak::new(),
            DEFAULT_STACK_SIZE,
            move |ctx, _: ()| out.set(ctx.id().as_u64()),
            (),
        );

        assert!(matches!(body.resume(), Resumed::Completed));
        assert_eq!(seen.get(), 9);
    }
}
