//! Fibers: cooperatively scheduled stackful coroutines, one thread at a time.
//!
//! A [`Fiber`] owns a saved CPU context and either a private stack or a
//! reference to a shared [`StackMem`] slot. `resume` transfers control
//! into a fiber, `yield_now` transfers it back out. Shared-stack fibers
//! additionally copy the suspended occupant's live stack bytes to a heap
//! buffer when another fiber takes the slot, and copy them back on resume.
//!
//! All switching is cooperative and thread-local. A fiber may only be
//! resumed on the thread that constructed it.
//!
//! # Ownership
//!
//! Fibers are handed out as `Rc<Fiber>`. The thread-local registers and
//! the shared-stack bookkeeping hold raw pointers, never ownership, so an
//! external owner must keep its handle alive until the fiber reaches
//! [`FiberState::Term`]. Dropping the last handle to a suspended fiber
//! that will never run again (state READY) is fine.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::ptr;
use std::rc::{Rc, Weak};
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::arch::{Context, context_switch, stack_pointer};
use crate::stack::{DEFAULT_STACK_SIZE, ShareStack, StackBuffer, StackMem};

/// Fiber execution state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FiberState {
    /// Constructed or suspended, waiting for a resume
    Ready,
    /// Currently executing, or suspended inside a fiber it resumed
    Running,
    /// Entry has returned; only reset (private stacks) or drop from here
    Term,
}

/// Process-wide monotonic id source; ids are never reused.
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(0);
/// Process-wide count of live fiber objects.
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// The fiber currently executing on this thread.
    static CURRENT: Cell<*const Fiber> = const { Cell::new(ptr::null()) };
    /// The implicit fiber wrapping the OS thread's native stack.
    static THREAD_ROOT: RefCell<Option<Rc<Fiber>>> = const { RefCell::new(None) };
    /// Where scheduler-managed fibers yield to. Defaults to the thread root.
    static SCHEDULER: Cell<*const Fiber> = const { Cell::new(ptr::null()) };
    /// Shared-stack switch in progress: the fiber taking the stack,
    /// and the fiber that previously held it. Null outside a switch.
    static SWITCH_PENDING: Cell<*const Fiber> = const { Cell::new(ptr::null()) };
    static SWITCH_OCCUPANT: Cell<*const Fiber> = const { Cell::new(ptr::null()) };
}

/// A stackful fiber.
pub struct Fiber {
    id: u64,
    stack_size: usize,
    state: Cell<FiberState>,
    ctx: UnsafeCell<Context>,
    entry: RefCell<Option<Box<dyn FnOnce()>>>,
    /// Whether yield transfers to the scheduler fiber instead of the
    /// thread root (private-stack fibers only; shared-stack fibers
    /// always yield to their resumer).
    run_in_scheduler: bool,
    /// Private-stack mode: exclusively owned stack region.
    own_stack: Option<StackBuffer>,
    /// Shared-stack mode: the slot this fiber runs on.
    stack_mem: Option<Rc<StackMem>>,
    /// Stack-top address at the instant of the last suspension; only
    /// meaningful for shared-stack switching.
    stack_sp: Cell<*mut u8>,
    /// Live stack bytes saved while another fiber holds the slot.
    /// Empty whenever this fiber holds the stack.
    save_buffer: RefCell<Vec<u8>>,
    /// The fiber that was current when the matching resume began;
    /// the yield partner for shared-stack fibers.
    resumed_from: Cell<*const Fiber>,
    /// Self-reference so the trampoline can turn the thread-local
    /// current pointer back into a strong handle.
    self_weak: Weak<Fiber>,
}

impl Fiber {
    /// Create a fiber with its own private stack.
    ///
    /// `entry` runs once, on the first resume. A `stack_size` of 0
    /// selects [`DEFAULT_STACK_SIZE`]. When `run_in_scheduler` is true
    /// the fiber yields to this thread's scheduler fiber, otherwise to
    /// the thread root; either way it must be resumed from that same
    /// fiber.
    pub fn new(
        entry: impl FnOnce() + 'static,
        stack_size: usize,
        run_in_scheduler: bool,
    ) -> Rc<Fiber> {
        let size = if stack_size == 0 {
            DEFAULT_STACK_SIZE
        } else {
            stack_size
        };
        Self::alloc(
            Box::new(entry),
            run_in_scheduler,
            Some(StackBuffer::new(size)),
            None,
        )
    }

    /// Create a fiber on the next slot of a shared-stack pool.
    pub fn with_shared_stack(
        entry: impl FnOnce() + 'static,
        pool: &ShareStack,
        run_in_scheduler: bool,
    ) -> Rc<Fiber> {
        Self::on_stack_mem(entry, pool.take_slot(), run_in_scheduler)
    }

    /// Create a fiber on a specific shared stack slot.
    ///
    /// Fibers placed on the same slot evict each other: whenever one is
    /// resumed while another's frames are live on the slot, the other's
    /// live range is copied out to its heap buffer first.
    pub fn on_stack_mem(
        entry: impl FnOnce() + 'static,
        mem: Rc<StackMem>,
        run_in_scheduler: bool,
    ) -> Rc<Fiber> {
        Self::alloc(Box::new(entry), run_in_scheduler, None, Some(mem))
    }

    fn alloc(
        entry: Box<dyn FnOnce()>,
        run_in_scheduler: bool,
        own_stack: Option<StackBuffer>,
        stack_mem: Option<Rc<StackMem>>,
    ) -> Rc<Fiber> {
        let (stack_top, stack_size) = match (&own_stack, &stack_mem) {
            (Some(buf), None) => (buf.top(), buf.size()),
            (None, Some(mem)) => (mem.bp(), mem.stack_size()),
            _ => unreachable!(),
        };

        let fiber = Rc::new_cyclic(|weak| Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            stack_size,
            state: Cell::new(FiberState::Ready),
            ctx: UnsafeCell::new(Context::new(stack_top as usize, fiber_entry as usize)),
            entry: RefCell::new(Some(entry)),
            run_in_scheduler,
            own_stack,
            stack_mem,
            stack_sp: Cell::new(ptr::null_mut()),
            save_buffer: RefCell::new(Vec::new()),
            resumed_from: Cell::new(ptr::null()),
            self_weak: weak.clone(),
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "fiber {} created ({} stack, {} bytes)",
            fiber.id,
            if fiber.stack_mem.is_some() {
                "shared"
            } else {
                "private"
            },
            stack_size,
        );
        fiber
    }

    /// The implicit fiber for the hosting OS thread. Captures the thread's
    /// running context; no allocated stack, no entry.
    fn new_root() -> Rc<Fiber> {
        let fiber = Rc::new_cyclic(|weak| Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            stack_size: 0,
            state: Cell::new(FiberState::Running),
            ctx: UnsafeCell::new(Context::default()),
            entry: RefCell::new(None),
            run_in_scheduler: false,
            own_stack: None,
            stack_mem: None,
            stack_sp: Cell::new(ptr::null_mut()),
            save_buffer: RefCell::new(Vec::new()),
            resumed_from: Cell::new(ptr::null()),
            self_weak: weak.clone(),
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        log::trace!("fiber {} created (thread root)", fiber.id);
        fiber
    }

    /// The fiber currently executing on this thread.
    ///
    /// The first call on a thread creates the thread-root fiber, which
    /// also becomes the default scheduler target.
    pub fn current() -> Rc<Fiber> {
        let curr = CURRENT.get();
        if !curr.is_null() {
            return unsafe {
                (*curr)
                    .self_weak
                    .upgrade()
                    .expect("current fiber dropped while running")
            };
        }

        let root = Self::new_root();
        CURRENT.set(Rc::as_ptr(&root));
        if SCHEDULER.get().is_null() {
            // default scheduler target, unless one was designated first
            SCHEDULER.set(Rc::as_ptr(&root));
        }
        THREAD_ROOT.with_borrow_mut(|slot| *slot = Some(root.clone()));
        root
    }

    /// Id of the current fiber, or `u64::MAX` if this thread has none.
    pub fn current_id() -> u64 {
        let curr = CURRENT.get();
        if curr.is_null() {
            u64::MAX
        } else {
            unsafe { (*curr).id }
        }
    }

    /// Designate the fiber that scheduler-managed fibers yield to.
    ///
    /// The caller keeps `fiber` alive while it is designated. The
    /// scheduler fiber must be a private-stack (or root) fiber: resume
    /// and yield of scheduler-managed fibers save directly into its
    /// context with no shared-stack bookkeeping.
    pub fn set_scheduler(fiber: &Rc<Fiber>) {
        SCHEDULER.set(Rc::as_ptr(fiber));
    }

    /// Number of live fiber objects in the process.
    pub fn alive() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> FiberState {
        self.state.get()
    }

    pub fn is_shared_stack(&self) -> bool {
        self.stack_mem.is_some()
    }

    /// Usable bytes of this fiber's stack (0 for the thread root, which
    /// runs on the OS thread's native stack).
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// The shared slot this fiber runs on, if any.
    pub fn stack_mem(&self) -> Option<Rc<StackMem>> {
        self.stack_mem.clone()
    }

    /// Transfer control into this fiber. Must be called from outside it,
    /// with the fiber in READY state.
    ///
    /// For private-stack fibers the suspended context is saved into the
    /// scheduler fiber (`run_in_scheduler`) or the thread root, so the
    /// resume must come from that fiber. Shared-stack fibers swap
    /// symmetrically with whoever is current.
    pub fn resume(&self) {
        assert_eq!(
            self.state.get(),
            FiberState::Ready,
            "resume() on a fiber that is not READY"
        );
        if CURRENT.get().is_null() {
            // Materialize the thread-root fiber so there is a context
            // to save into and to eventually yield back to.
            Fiber::current();
        }
        let prev = CURRENT.get();
        let me = self as *const Fiber;
        assert!(!ptr::eq(prev, me), "resume() from inside the fiber itself");

        self.state.set(FiberState::Running);
        self.resumed_from.set(prev);
        CURRENT.set(me);

        unsafe {
            if self.stack_mem.is_some() {
                swap_to(prev, me);
            } else if self.run_in_scheduler {
                let sched = SCHEDULER.get();
                debug_assert!(
                    ptr::eq(prev, sched),
                    "scheduler-managed fiber resumed from a fiber that is not the scheduler"
                );
                context_switch((*sched).ctx.get(), self.ctx.get());
            } else {
                let root = thread_root_ptr();
                debug_assert!(
                    ptr::eq(prev, root),
                    "thread-managed fiber resumed from a fiber that is not the thread root"
                );
                context_switch((*root).ctx.get(), self.ctx.get());
            }
        }
    }

    /// Give up control. Must be called from inside this fiber.
    ///
    /// A RUNNING fiber becomes READY and can be resumed again; a TERM
    /// fiber (the trampoline's final yield) stays TERM. Control goes to
    /// the resumer (shared stack), the scheduler fiber
    /// (`run_in_scheduler`), or the thread root.
    pub fn yield_now(&self) {
        let me = self as *const Fiber;
        assert!(
            ptr::eq(CURRENT.get(), me),
            "yield_now() from a fiber that is not current"
        );
        let state = self.state.get();
        assert!(
            state == FiberState::Running || state == FiberState::Term,
            "yield_now() on a fiber that is not RUNNING"
        );
        if state != FiberState::Term {
            self.state.set(FiberState::Ready);
        }

        unsafe {
            if self.stack_mem.is_some() {
                let partner = self.resumed_from.get();
                CURRENT.set(partner);
                swap_to(me, partner);
            } else if self.run_in_scheduler {
                let sched = SCHEDULER.get();
                CURRENT.set(sched);
                context_switch(self.ctx.get(), (*sched).ctx.get());
            } else {
                let root = thread_root_ptr();
                CURRENT.set(root);
                context_switch(self.ctx.get(), (*root).ctx.get());
            }
        }
    }

    /// Rearm a finished private-stack fiber with a new entry, reusing
    /// its stack and id. Only valid in TERM state.
    pub fn reset(&self, entry: impl FnOnce() + 'static) {
        assert!(
            self.own_stack.is_some() && self.state.get() == FiberState::Term,
            "reset() requires a private-stack fiber in TERM state"
        );
        self.state.set(FiberState::Ready);
        *self.entry.borrow_mut() = Some(Box::new(entry));
        let top = self.own_stack.as_ref().unwrap().top();
        unsafe {
            *self.ctx.get() = Context::new(top as usize, fiber_entry as usize);
        }
        log::trace!("fiber {} reset", self.id);
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        // A dangling occupant would poison the next copy-out on the slot.
        if let Some(mem) = &self.stack_mem {
            if ptr::eq(mem.occupant(), self) {
                mem.set_occupant(ptr::null());
            }
        }
        log::trace!("fiber {} dropped", self.id);
    }
}

fn thread_root_ptr() -> *const Fiber {
    THREAD_ROOT.with_borrow(|slot| {
        slot.as_ref()
            .map(Rc::as_ptr)
            .expect("no thread-root fiber on this thread")
    })
}

/// First-resume entry point installed in every worker fiber's context.
///
/// Holds a strong handle across the user entry so the fiber object
/// outlives it, then releases that handle before the final yield —
/// the external owner's handle is what keeps the object alive from
/// here on.
extern "C" fn fiber_entry() {
    let curr = Fiber::current();
    let entry = curr
        .entry
        .borrow_mut()
        .take()
        .expect("fiber started without an entry");

    entry();

    curr.state.set(FiberState::Term);
    log::trace!("fiber {} terminated", curr.id);

    let raw = Rc::as_ptr(&curr);
    drop(curr);
    unsafe {
        (*raw).yield_now();
    }
    unreachable!("terminated fiber was resumed");
}

/// Switch from `curr` to `pending`, with shared-stack bookkeeping.
///
/// Phase A (before the switch): record where `curr`'s live stack ends,
/// then, if `pending` runs on a shared slot, make it the occupant and
/// copy the previous occupant's live range out to its heap buffer.
///
/// Phase C (after the switch returns, i.e. when some later switch
/// targets `curr` again): if `curr` took over a shared slot, copy its
/// saved image back onto the slot. Until that copy-in completes the
/// physical stack may still hold another fiber's frames, so this code
/// must not read anything spilled before the switch; everything it
/// needs is re-read from the thread-locals.
#[inline(never)]
unsafe fn swap_to(curr: *const Fiber, pending: *const Fiber) {
    unsafe {
        (*curr).stack_sp.set(stack_pointer());

        match &(*pending).stack_mem {
            None => {
                SWITCH_PENDING.set(ptr::null());
                SWITCH_OCCUPANT.set(ptr::null());
            }
            Some(mem) => {
                let prev_occupant = mem.occupant();
                mem.set_occupant(pending);
                SWITCH_PENDING.set(pending);
                SWITCH_OCCUPANT.set(prev_occupant);
                if !prev_occupant.is_null() && !ptr::eq(prev_occupant, pending) {
                    save_stack(prev_occupant);
                }
            }
        }

        context_switch((*curr).ctx.get(), (*pending).ctx.get());

        let pending_now = SWITCH_PENDING.get();
        let occupant_now = SWITCH_OCCUPANT.get();
        if !pending_now.is_null()
            && !occupant_now.is_null()
            && !ptr::eq(pending_now, occupant_now)
        {
            restore_stack(pending_now);
        }
    }
}

/// Copy-out: preserve `occupant`'s live stack range `[stack_sp, bp)`
/// into its heap buffer, replacing any previous image.
#[inline(never)]
unsafe fn save_stack(occupant: *const Fiber) {
    unsafe {
        let fiber = &*occupant;
        let mem = fiber
            .stack_mem
            .as_ref()
            .expect("copy-out of a private-stack fiber");
        let sp = fiber.stack_sp.get();
        let bp = mem.bp();
        debug_assert!(
            (bp as usize) - (mem.stack_size()) <= sp as usize && sp as usize <= bp as usize,
            "suspended stack pointer outside its shared slot"
        );
        let len = bp as usize - sp as usize;

        let mut buf = fiber.save_buffer.borrow_mut();
        buf.clear();
        buf.extend_from_slice(slice::from_raw_parts(sp, len));
        log::debug!("fiber {}: saved {} stack bytes", fiber.id, len);
    }
}

/// Copy-in: restore a saved stack image to the exact address range it
/// came from, then discard it.
///
/// Runs in its own non-inlined frame, which lies below `stack_sp` and
/// therefore outside the restored byte range.
#[inline(never)]
unsafe fn restore_stack(pending: *const Fiber) {
    unsafe {
        let fiber = &*pending;
        let mut buf = fiber.save_buffer.borrow_mut();
        if !buf.is_empty() {
            ptr::copy_nonoverlapping(buf.as_ptr(), fiber.stack_sp.get(), buf.len());
            buf.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_monotonic() {
        let a = Fiber::new(|| {}, 16 * 1024, false);
        let b = Fiber::new(|| {}, 16 * 1024, false);
        assert!(b.id() > a.id());
    }

    #[test]
    fn current_creates_thread_root() {
        let me = Fiber::current();
        assert_eq!(me.state(), FiberState::Running);
        assert!(!me.is_shared_stack());
        assert_eq!(me.stack_size(), 0);
        assert_eq!(Fiber::current_id(), me.id());
        assert!(Rc::ptr_eq(&me, &Fiber::current()));
    }

    #[test]
    fn current_id_sentinel_without_fibers() {
        std::thread::spawn(|| {
            assert_eq!(Fiber::current_id(), u64::MAX);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn default_stack_size_applies() {
        let fiber = Fiber::new(|| {}, 0, false);
        assert_eq!(fiber.stack_size(), DEFAULT_STACK_SIZE);
    }

    #[test]
    fn run_to_completion() {
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let fiber = Fiber::new(move || flag.set(true), 0, false);
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert!(ran.get());
        assert_eq!(fiber.state(), FiberState::Term);
    }
}
