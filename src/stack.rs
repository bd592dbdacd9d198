//! Stack memory for fibers.
//!
//! Every fiber stack is an anonymous `mmap` region with a `PROT_NONE`
//! guard page at the low end, so overflowing a fiber stack faults
//! instead of silently corrupting neighboring memory.
//!
//! Two ownership modes are built on the same region type:
//! - a private stack, owned by one fiber for its whole lifetime
//! - a [`StackMem`] slot, shared by several fibers; the switch protocol
//!   copies the suspended occupant's live bytes out to a heap buffer
//!   and back in on resume

use std::cell::Cell;
use std::ptr;
use std::rc::Rc;

use crate::fiber::Fiber;

/// Stack size used when a caller passes 0 (128 000 bytes)
pub const DEFAULT_STACK_SIZE: usize = 128_000;

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// An mmap'd stack region: one guard page + `size` usable bytes.
///
/// Stacks grow downward on supported targets; the usable range is
/// `[bottom, top)` and execution starts near `top`.
pub(crate) struct StackBuffer {
    base: *mut u8,
    alloc_size: usize,
    guard_size: usize,
}

impl StackBuffer {
    /// Allocate a stack of `size` usable bytes.
    ///
    /// Allocation failure is fatal: a fiber cannot exist without its
    /// stack and the core has no recoverable errors.
    pub fn new(size: usize) -> Self {
        let guard_size = page_size();
        let alloc_size = guard_size + size;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                alloc_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            panic!("fiber stack mmap of {alloc_size} bytes failed");
        }

        let ret = unsafe { libc::mprotect(base, guard_size, libc::PROT_NONE) };
        if ret != 0 {
            unsafe { libc::munmap(base, alloc_size) };
            panic!("fiber stack guard mprotect failed");
        }

        StackBuffer {
            base: base.cast::<u8>(),
            alloc_size,
            guard_size,
        }
    }

    /// Lowest usable byte (just above the guard page).
    pub fn bottom(&self) -> *mut u8 {
        unsafe { self.base.add(self.guard_size) }
    }

    /// One past the highest usable byte; the logical stack base.
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.alloc_size) }
    }

    /// Usable bytes between guard page and top.
    pub fn size(&self) -> usize {
        self.alloc_size - self.guard_size
    }
}

impl Drop for StackBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.cast::<libc::c_void>(), self.alloc_size);
        }
    }
}

/// One shared stack slot.
///
/// At most one fiber occupies a slot at a time; the switch protocol
/// updates `occupant` and copies the previous occupant's live stack
/// out before handing the slot over.
pub struct StackMem {
    buffer: StackBuffer,
    occupant: Cell<*const Fiber>,
}

impl StackMem {
    /// Allocate one shared stack slot. A `stack_size` of 0 selects
    /// [`DEFAULT_STACK_SIZE`].
    pub fn alloc(stack_size: usize) -> Rc<StackMem> {
        let size = if stack_size == 0 {
            DEFAULT_STACK_SIZE
        } else {
            stack_size
        };
        Rc::new(StackMem {
            buffer: StackBuffer::new(size),
            occupant: Cell::new(ptr::null()),
        })
    }

    /// Usable bytes in this slot.
    pub fn stack_size(&self) -> usize {
        self.buffer.size()
    }

    /// Logical stack base: `bottom + stack_size`.
    pub(crate) fn bp(&self) -> *mut u8 {
        self.buffer.top()
    }

    pub(crate) fn occupant(&self) -> *const Fiber {
        self.occupant.get()
    }

    pub(crate) fn set_occupant(&self, fiber: *const Fiber) {
        self.occupant.set(fiber);
    }
}

/// A pool of equally-sized shared stack slots.
///
/// Slot assignment is round-robin. Two fibers that keep landing on the
/// same slot will pay a stack copy on every switch between them, so a
/// pool under pressure should grow its slot count, not its slot size.
pub struct ShareStack {
    slots: Vec<Rc<StackMem>>,
    alloc_idx: Cell<usize>,
    stack_size: usize,
}

impl ShareStack {
    /// Allocate a pool of `count` slots of `stack_size` usable bytes
    /// each. A `stack_size` of 0 selects [`DEFAULT_STACK_SIZE`].
    pub fn new(count: usize, stack_size: usize) -> ShareStack {
        assert!(count > 0, "share stack pool needs at least one slot");
        let size = if stack_size == 0 {
            DEFAULT_STACK_SIZE
        } else {
            stack_size
        };
        ShareStack {
            slots: (0..count).map(|_| StackMem::alloc(size)).collect(),
            alloc_idx: Cell::new(0),
            stack_size: size,
        }
    }

    /// Hand out the next slot, round-robin.
    pub fn take_slot(&self) -> Rc<StackMem> {
        let idx = self.alloc_idx.get();
        self.alloc_idx.set((idx + 1) % self.slots.len());
        self.slots[idx].clone()
    }

    /// Slot `idx` without advancing the round-robin cursor.
    pub fn slot(&self, idx: usize) -> Rc<StackMem> {
        self.slots[idx].clone()
    }

    pub fn count(&self) -> usize {
        self.slots.len()
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_geometry() {
        let buf = StackBuffer::new(64 * 1024);
        assert_eq!(buf.size(), 64 * 1024);
        assert_eq!(buf.top() as usize, buf.bottom() as usize + buf.size());
        // The whole usable range is writable
        unsafe {
            buf.bottom().write(0xA5);
            buf.top().sub(1).write(0x5A);
            assert_eq!(buf.bottom().read(), 0xA5);
            assert_eq!(buf.top().sub(1).read(), 0x5A);
        }
    }

    #[test]
    fn stackmem_default_size() {
        let mem = StackMem::alloc(0);
        assert_eq!(mem.stack_size(), DEFAULT_STACK_SIZE);
        assert!(mem.occupant().is_null());
    }

    #[test]
    fn sharestack_round_robin() {
        let pool = ShareStack::new(2, 16 * 1024);
        assert_eq!(pool.count(), 2);
        let a = pool.take_slot();
        let b = pool.take_slot();
        let c = pool.take_slot();
        assert!(!Rc::ptr_eq(&a, &b));
        assert!(Rc::ptr_eq(&a, &c));
        assert!(Rc::ptr_eq(&a, &pool.slot(0)));
        assert!(Rc::ptr_eq(&b, &pool.slot(1)));
    }
}
