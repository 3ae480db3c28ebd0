//! The cooperative scheduler: creation, one-tick advancement, killing,
//! and queue reordering over a fixed-capacity process pool.
//!
//! ## Driving model
//!
//! The host calls [`Scheduler::tick`] once per frame. A tick is one pass
//! over the ACTIVE order: each member's countdown is decremented once,
//! and members that reach zero are resumed. A resumed body either
//! finishes (reclaimer hook, slot back to FREE) or suspends with a new
//! delay (countdown re-armed in place).
//!
//! ## Re-entrancy
//!
//! The interesting part is that bodies call back into this API while they
//! are being resumed: spawning, killing each other, reordering the queue,
//! waiting. The shared state sits behind a `parking_lot` mutex that is
//! released across every resume, so nested calls simply take the lock
//! again. The one thing a body cannot do is destroy *itself* through the
//! kill paths: `kill` refuses the current process and `kill_matching`
//! silently skips it, which is also what makes it sound for the tick loop
//! to check the body out of its slot while it runs.
//!
//! ## Traversal under mutation
//!
//! The original engine captured a next-pointer before each resume so that
//! destroying the current process could not corrupt the walk. Here every
//! pass carries a serial number and stamps each slot it visits; each step
//! scans the ACTIVE order from the front for the first unstamped slot.
//! Members killed mid-resume just vanish from the order, and members
//! created mid-resume carry a fresh stamp, so they become visitable later
//! in the same pass, giving the "as soon as possible, within about one
//! tick" behavior scripts rely on.

use std::fmt;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::coro::{ProcessBody, ProcessContext, Resumed};
use crate::error::SchedError;
use crate::pool::Pool;
use crate::process::{
    ProcessId, ProcessState, Slot, DEFAULT_CAPACITY, DEFAULT_STACK_SIZE, MIN_STACK_SIZE,
};

// ---------------------------------------------------------------------------
// Inner
// ---------------------------------------------------------------------------

/// Reclaimer hook: invoked exactly once per destroyed process, before the
/// slot returns to FREE.
type Reclaimer = Box<dyn FnMut(ProcessId)>;

/// Shared scheduler state. Everything behind the lock.
pub(crate) struct Inner {
    pool: Pool,
    /// Next id to assign. Monotonic for the scheduler's lifetime.
    next_id: u64,
    /// Serial of the pass currently (or most recently) walked by `tick`.
    /// Starts at 0 and is bumped before each pass, so slot stamp 0 never
    /// matches a live pass.
    pass: u64,
    /// Guards against `tick` re-entry from inside a body.
    ticking: bool,
    /// The process whose body is executing right now, if any.
    current: Option<ProcessId>,
    reclaimer: Option<Reclaimer>,
    stack_size: usize,
}

impl Inner {
    /// Destroy the process in `idx`: reclaimer first (identity and slot
    /// metadata still valid), then the slot returns to FREE.
    fn destroy(&mut self, idx: usize) {
        let id = self.pool.slot(idx).id;
        if let Some(reclaim) = self.reclaimer.as_mut() {
            reclaim(id);
        }
        self.pool.release(idx);
        debug!("destroyed process {id}");
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Handle to a cooperative process scheduler.
///
/// Cheap to clone; all clones drive the same pool. The scheduler is
/// strictly single-threaded: suspension happens only at explicit yield
/// points, and between yield points a body runs without interruption.
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) shared: Arc<Mutex<Inner>>,
}

impl Scheduler {
    /// Create a scheduler with a fixed pool of `capacity` slots and the
    /// default per-process stack size.
    pub fn new(capacity: usize) -> Self {
        Self::with_stack_size(capacity, DEFAULT_STACK_SIZE)
    }

    /// Create a scheduler with an explicit per-process stack size.
    ///
    /// Requests below [`MIN_STACK_SIZE`] are rounded up: a stack that
    /// small cannot absorb the panic hook's own frames, so a panicking
    /// body would crash the host instead of being contained.
    pub fn with_stack_size(capacity: usize, stack_size: usize) -> Self {
        Scheduler {
            shared: Arc::new(Mutex::new(Inner {
                pool: Pool::new(capacity),
                next_id: 0,
                pass: 0,
                ticking: false,
                current: None,
                reclaimer: None,
                stack_size: stack_size.max(MIN_STACK_SIZE),
            })),
        }
    }

    /// Spawn a new process, eligible to run as soon as possible (initial
    /// countdown of one tick).
    ///
    /// `params` is moved into the body; the caller keeps nothing. The new
    /// member is inserted immediately after the currently-resuming
    /// process, or at the head of the ACTIVE order when no process is
    /// resuming, so it typically runs later in the same pass or on the
    /// next one.
    pub fn spawn<P, F>(&self, entry: F, params: P) -> Result<ProcessId, SchedError>
    where
        P: 'static,
        F: FnOnce(&ProcessContext<'_>, P) + 'static,
    {
        self.spawn_delayed(entry, params, 1)
    }

    /// Spawn a process whose first resume happens after `delay` ticks
    /// instead of the next one.
    pub fn spawn_delayed<P, F>(
        &self,
        entry: F,
        params: P,
        delay: u32,
    ) -> Result<ProcessId, SchedError>
    where
        P: 'static,
        F: FnOnce(&ProcessContext<'_>, P) + 'static,
    {
        let mut inner = self.shared.lock();
        let Some(idx) = inner.pool.acquire() else {
            warn!("process pool exhausted (capacity {})", inner.pool.capacity());
            return Err(SchedError::Exhausted);
        };

        let id = ProcessId::new(inner.next_id);
        inner.next_id += 1;

        let body = ProcessBody::new(
            id,
            Arc::downgrade(&self.shared),
            inner.stack_size,
            entry,
            params,
        );

        let pos = match inner.current {
            Some(current) => inner
                .pool
                .position_of_id(current)
                .map(|p| p + 1)
                .unwrap_or(0),
            None => 0,
        };
        let countdown = clamp_delay(delay);
        inner.pool.install(idx, Slot::new(id, body, countdown), pos);
        debug!("spawned process {id} in slot {idx}, countdown {countdown}");
        Ok(id)
    }

    /// Advance the whole ACTIVE set by one tick.
    ///
    /// Not re-entrant: calling this from inside a resuming body reports
    /// [`SchedError::ReentrantTick`].
    pub fn tick(&self) -> Result<(), SchedError> {
        {
            let mut inner = self.shared.lock();
            if inner.ticking {
                return Err(SchedError::ReentrantTick);
            }
            inner.ticking = true;
            inner.pass = inner.pass.wrapping_add(1);
        }

        loop {
            // Select the next unvisited member, stamp it, and check the
            // body out if it is due. The lock drops before the resume so
            // the body can call back in.
            let due = {
                let mut inner = self.shared.lock();
                let pass = inner.pass;
                let Some(idx) = inner.pool.first_unstamped(pass) else {
                    inner.ticking = false;
                    break;
                };
                let slot = inner.pool.slot_mut(idx);
                slot.pass = pass;
                slot.countdown -= 1;
                if slot.countdown > 0 {
                    None
                } else {
                    let id = slot.id;
                    let body = slot.body.take().expect("due slot has no body");
                    inner.current = Some(id);
                    Some((idx, id, body))
                }
            };

            let Some((idx, id, mut body)) = due else {
                continue;
            };

            let outcome = body.resume();

            let mut inner = self.shared.lock();
            inner.current = None;
            match outcome {
                Resumed::Yielded(delay) => {
                    // The slot cannot have been freed mid-resume: the
                    // kill paths refuse or skip the current process.
                    let slot = inner.pool.slot_mut(idx);
                    debug_assert_eq!(slot.id, id);
                    slot.body = Some(body);
                    slot.countdown = clamp_delay(delay);
                }
                Resumed::Completed => {
                    inner.destroy(idx);
                }
                Resumed::Panicked(msg) => {
                    warn!("process {id} panicked and was destroyed: {msg}");
                    inner.destroy(idx);
                }
            }
        }

        Ok(())
    }

    /// Destroy a non-current process by id.
    ///
    /// Returns `Ok(true)` when a process was destroyed, `Ok(false)` for an
    /// id that no longer exists (callers routinely race with natural
    /// completion), and [`SchedError::KillCurrent`] when `id` names the
    /// currently-resuming process; ending oneself goes through normal
    /// completion, never this path.
    pub fn kill(&self, id: ProcessId) -> Result<bool, SchedError> {
        let mut inner = self.shared.lock();
        if inner.current == Some(id) {
            return Err(SchedError::KillCurrent(id));
        }
        match inner.pool.index_of(id) {
            None => Ok(false),
            Some(idx) => {
                inner.destroy(idx);
                Ok(true)
            }
        }
    }

    /// Destroy every ACTIVE process whose masked id equals `pattern`,
    /// except the currently-resuming process, which is silently skipped so
    /// a pattern kill issued mid-resume cannot destroy its caller.
    ///
    /// Returns the number of processes actually destroyed.
    pub fn kill_matching(&self, pattern: u64, mask: u64) -> usize {
        let mut inner = self.shared.lock();
        let current = inner.current;
        let victims: Vec<usize> = inner
            .pool
            .active_indices()
            .filter(|&idx| {
                let slot = inner.pool.slot(idx);
                slot.id.as_u64() & mask == pattern && current != Some(slot.id)
            })
            .collect();
        for &idx in &victims {
            inner.destroy(idx);
        }
        victims.len()
    }

    /// Move a not-yet-visited process to the front of the remaining
    /// portion of the current pass, so it is resumed before `tick`
    /// returns. Its countdown is untouched: this changes *when* it is
    /// visited, never *whether* it may run.
    ///
    /// No-op (`false`) when the process was already visited this pass, is
    /// already first or last of the remaining portion, or no longer
    /// exists. Outside a tick the whole order counts as remaining, so the
    /// entry moves to the head.
    pub fn reschedule(&self, id: ProcessId) -> bool {
        let mut inner = self.shared.lock();
        let Some(idx) = inner.pool.index_of(id) else {
            return false;
        };
        let pos = inner
            .pool
            .position_of(idx)
            .expect("live slot missing from ACTIVE order");

        if !inner.ticking {
            if pos == 0 {
                return false;
            }
            inner.pool.move_entry(pos, 0);
            return true;
        }

        let pass = inner.pass;
        if inner.pool.slot(idx).pass == pass {
            // Already visited this pass.
            return false;
        }
        let front = inner
            .pool
            .first_unstamped_position(pass)
            .expect("unstamped slot must be reachable");
        if pos == front || !inner.pool.any_unstamped_after(pos, pass) {
            return false;
        }
        inner.pool.move_entry(pos, front);
        true
    }

    /// Move a process to the very end of the ACTIVE order so every other
    /// pending process runs before it. Pure reordering; countdown is
    /// untouched. Returns `false` for a stale id.
    pub fn give_way(&self, id: ProcessId) -> bool {
        let mut inner = self.shared.lock();
        let Some(idx) = inner.pool.index_of(id) else {
            return false;
        };
        let pos = inner
            .pool
            .position_of(idx)
            .expect("live slot missing from ACTIVE order");
        inner.pool.move_to_back(pos);
        true
    }

    /// Install the reclaimer hook, invoked exactly once per destroyed
    /// process, synchronously, before the slot returns to FREE, so the
    /// identity is still valid during the call. Replaces any previous
    /// hook.
    ///
    /// The hook runs with the scheduler lock held: it must not call back
    /// into the scheduler (in particular not `kill`/`kill_matching`,
    /// which would re-enter destruction already in progress).
    pub fn set_reclaimer<F>(&self, hook: F)
    where
        F: FnMut(ProcessId) + 'static,
    {
        self.shared.lock().reclaimer = Some(Box::new(hook));
    }

    /// Whether a process with this id still exists.
    pub fn is_alive(&self, id: ProcessId) -> bool {
        self.shared.lock().pool.index_of(id).is_some()
    }

    /// Observable state of a live process, `None` for a stale id.
    pub fn state(&self, id: ProcessId) -> Option<ProcessState> {
        let inner = self.shared.lock();
        let idx = inner.pool.index_of(id)?;
        if inner.current == Some(id) {
            return Some(ProcessState::Resuming);
        }
        Some(if inner.pool.slot(idx).countdown > 0 {
            ProcessState::Armed
        } else {
            ProcessState::Due
        })
    }

    /// Number of ACTIVE processes.
    pub fn active_count(&self) -> usize {
        self.shared.lock().pool.active_len()
    }

    /// Fixed pool capacity.
    pub fn capacity(&self) -> usize {
        self.shared.lock().pool.capacity()
    }

    /// Id of the currently-resuming process, if a resume is in progress.
    pub fn current(&self) -> Option<ProcessId> {
        self.shared.lock().current
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("Scheduler")
            .field("capacity", &inner.pool.capacity())
            .field("active", &inner.pool.active_len())
            .field("current", &inner.current)
            .finish()
    }
}

/// Countdowns are at least one tick; a zero request would spin inside a
/// single pass.
fn clamp_delay(delay: u32) -> i32 {
    delay.clamp(1, i32::MAX as u32) as i32
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[test]
    fn tick_on_empty_scheduler_is_ok() {
        let sched = Scheduler::new(4);
        assert!(sched.tick().is_ok());
        assert_eq!(sched.active_count(), 0);
    }

    #[test]
    fn spawn_assigns_increasing_ids() {
        let sched = Scheduler::new(4);
        let a = sched.spawn(|ctx, _: ()| ctx.sleep(1), ()).unwrap();
        let b = sched.spawn(|ctx, _: ()| ctx.sleep(1), ()).unwrap();
        assert!(a < b);
        assert_eq!(sched.active_count(), 2);
    }

    #[test]
    fn immediate_body_runs_on_first_tick() {
        let sched = Scheduler::new(4);
        let ran = Rc::new(Cell::new(0u32));
        let counter = Rc::clone(&ran);
        sched.spawn(move |_ctx, _: ()| counter.set(counter.get() + 1), ()).unwrap();

        sched.tick().unwrap();
        assert_eq!(ran.get(), 1);
        assert_eq!(sched.active_count(), 0);
    }

    #[test]
    fn sleeping_body_resumes_every_tick() {
        let sched = Scheduler::new(4);
        let resumes = Rc::new(Cell::new(0u32));
        let counter = Rc::clone(&resumes);
        sched
            .spawn(
                move |ctx, _: ()| {
                    for _ in 0..3 {
                        counter.set(counter.get() + 1);
                        ctx.sleep(1);
                    }
                },
                (),
            )
            .unwrap();

        for expected in 1..=3 {
            sched.tick().unwrap();
            assert_eq!(resumes.get(), expected);
        }
        // Fourth tick: the loop is exhausted and the body completes.
        sched.tick().unwrap();
        assert_eq!(sched.active_count(), 0);
    }

    #[test]
    fn spawn_outside_tick_inserts_at_head() {
        let sched = Scheduler::new(4);
        let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
        for name in ["first", "second"] {
            let log = Rc::clone(&log);
            sched.spawn(move |_ctx, _: ()| log.borrow_mut().push(name), ()).unwrap();
        }

        sched.tick().unwrap();
        // Head insertion reverses spawn order.
        assert_eq!(*log.borrow(), vec!["second", "first"]);
    }

    #[test]
    fn current_is_none_outside_tick() {
        let sched = Scheduler::new(4);
        assert_eq!(sched.current(), None);

        let seen = Rc::new(Cell::new(false));
        let flag = Rc::clone(&seen);
        let handle = sched.clone();
        sched
            .spawn(move |ctx, _: ()| flag.set(handle.current() == Some(ctx.id())), ())
            .unwrap();

        sched.tick().unwrap();
        assert!(seen.get());
        assert_eq!(sched.current(), None);
    }

    #[test]
    fn state_reflects_countdown() {
        let sched = Scheduler::new(4);
        let id = sched.spawn_delayed(|ctx, _: ()| ctx.sleep(1), (), 3).unwrap();
        assert_eq!(sched.state(id), Some(ProcessState::Armed));

        sched.tick().unwrap();
        sched.tick().unwrap();
        sched.tick().unwrap();
        // Resumed on tick 3 and re-armed for one tick.
        assert_eq!(sched.state(id), Some(ProcessState::Armed));
    }

    #[test]
    fn tiny_stack_request_is_rounded_up_and_contains_panics() {
        // 4 KiB would not fit the panic hook's frames; the floor keeps
        // a panicking body from overrunning into the guard page.
        let sched = Scheduler::with_stack_size(2, 4 * 1024);

        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);
        sched.spawn(move |_ctx, _: ()| flag.set(true), ()).unwrap();
        let doomed = sched.spawn(|_ctx, _: ()| panic!("boom"), ()).unwrap();

        assert!(sched.tick().is_ok());
        assert!(ran.get());
        assert!(!sched.is_alive(doomed));
        assert_eq!(sched.active_count(), 0);
    }

    #[test]
    fn default_uses_default_capacity() {
        let sched = Scheduler::default();
        assert_eq!(sched.capacity(), DEFAULT_CAPACITY);
    }

    #[test]
    fn debug_output_names_the_fields() {
        let sched = Scheduler::new(2);
        let formatted = format!("{sched:?}");
        assert!(formatted.contains("capacity"));
        assert!(formatted.contains("active"));
    }

    #[test]
    fn reschedule_outside_tick_moves_to_head() {
        let sched = Scheduler::new(4);
        let log: Rc<RefCell<Vec<u64>>> = Rc::new(RefCell::new(Vec::new()));
        let mut ids = Vec::new();
        for _ in 0..3 {
            let log = Rc::clone(&log);
            ids.push(
                sched
                    .spawn(move |ctx, _: ()| log.borrow_mut().push(ctx.id().as_u64()), ())
                    .unwrap(),
            );
        }
        // Head insertion: order is ids[2], ids[1], ids[0].
        assert!(sched.reschedule(ids[0]));
        // Already at head now.
        assert!(!sched.reschedule(ids[0]));

        sched.tick().unwrap();
        assert_eq!(
            *log.borrow(),
            vec![ids[0].as_u64(), ids[2].as_u64(), ids[1].as_u64()]
        );
    }
}
