//! Cooperative stackful fibers for a single OS thread.
//!
//! A fiber is a unit of cooperative execution with its own stack and its
//! own saved CPU context. Control moves only at explicit points:
//! [`Fiber::resume`] transfers into a fiber, [`Fiber::yield_now`]
//! transfers back out. There is no preemption and no cross-thread
//! migration; each hosting thread keeps its own current/root/scheduler
//! fiber registers.
//!
//! Stacks come in two ownership modes:
//! - **private**: the fiber owns an mmap'd stack region for its whole
//!   lifetime
//! - **shared**: several fibers run on one [`StackMem`] slot; when a
//!   suspended fiber's slot is taken over, its live stack bytes are
//!   copied out to a heap buffer and copied back on resume
//!
//! # Example
//!
//! ```no_run
//! use myfiber::Fiber;
//!
//! let fiber = Fiber::new(
//!     || {
//!         println!("fiber: first run");
//!         Fiber::current().yield_now();
//!         println!("fiber: resumed");
//!     },
//!     0,     // default stack size
//!     false, // yield to the thread root, not a scheduler fiber
//! );
//!
//! fiber.resume();
//! println!("main: fiber yielded");
//! fiber.resume();
//! println!("main: fiber finished");
//! ```

mod arch;
pub mod fiber;
pub mod stack;

pub use fiber::{Fiber, FiberState};
pub use stack::{DEFAULT_STACK_SIZE, ShareStack, StackMem};
