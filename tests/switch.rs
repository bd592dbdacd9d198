//! End-to-end switch protocol tests: private and shared stacks,
//! scheduler routing, reset, and id/liveness accounting.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Mutex;

use myfiber::{Fiber, FiberState, ShareStack, StackMem};

// The id and live-fiber counters are process-wide, and a thread's root
// fiber is only released by its TLS destructor. Run every test body on
// its own joined thread while holding one lock: bodies never interleave
// and each thread's fibers are fully torn down before the lock drops.
static SERIAL: Mutex<()> = Mutex::new(());

fn run_serial(body: impl FnOnce() + Send + 'static) {
    let _guard = SERIAL
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    std::thread::spawn(body).join().unwrap();
}

#[test]
fn private_ping_pong() {
    run_serial(|| {
        let seen = Rc::new(Cell::new(0));

        let inner = seen.clone();
        let fiber = Fiber::new(
            move || {
                Fiber::current().yield_now();
                inner.set(42);
                Fiber::current().yield_now();
            },
            0,
            false,
        );

        fiber.resume();
        assert_eq!(seen.get(), 0);
        assert_eq!(fiber.state(), FiberState::Ready);

        fiber.resume();
        assert_eq!(seen.get(), 42);
        assert_eq!(fiber.state(), FiberState::Ready);

        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
    });
}

#[test]
fn trampoline_terminates_without_freeing() {
    run_serial(|| {
        let _root = Fiber::current();
        let counter = Rc::new(Cell::new(0u32));

        let inner = counter.clone();
        let before = Fiber::alive();
        let fiber = Fiber::new(move || inner.set(inner.get() + 1), 0, false);
        assert_eq!(Fiber::alive(), before + 1);

        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(counter.get(), 1);
        // the handle is still held, so the object is not freed yet
        assert_eq!(Fiber::alive(), before + 1);

        drop(fiber);
        assert_eq!(Fiber::alive(), before);
    });
}

#[test]
fn reset_runs_new_entry() {
    run_serial(|| {
        let counter = Rc::new(Cell::new(0u32));

        let inner = counter.clone();
        let fiber = Fiber::new(move || inner.set(inner.get() + 1), 0, false);
        let id = fiber.id();
        fiber.resume();
        assert_eq!(counter.get(), 1);
        assert_eq!(fiber.state(), FiberState::Term);

        let inner = counter.clone();
        fiber.reset(move || inner.set(inner.get() + 10));
        assert_eq!(fiber.state(), FiberState::Ready);
        assert_eq!(fiber.id(), id);

        fiber.resume();
        assert_eq!(counter.get(), 11);
        assert_eq!(fiber.state(), FiberState::Term);
    });
}

#[test]
fn shared_stack_eviction_preserves_locals() {
    run_serial(|| {
        let mem = StackMem::alloc(64 * 1024);

        let ok_a = Rc::new(Cell::new(false));
        let ok_b = Rc::new(Cell::new(false));

        let flag = ok_a.clone();
        let a = Fiber::on_stack_mem(
            move || {
                let mut live = [0u8; 2048];
                live.fill(0xAA);
                std::hint::black_box(&mut live);
                Fiber::current().yield_now();
                flag.set(live.iter().all(|&byte| byte == 0xAA));
                Fiber::current().yield_now();
            },
            mem.clone(),
            false,
        );

        let flag = ok_b.clone();
        let b = Fiber::on_stack_mem(
            move || {
                let mut live = [0u8; 2048];
                live.fill(0xBB);
                std::hint::black_box(&mut live);
                Fiber::current().yield_now();
                flag.set(live.iter().all(|&byte| byte == 0xBB));
                Fiber::current().yield_now();
            },
            mem.clone(),
            false,
        );

        a.resume();
        b.resume(); // evicts A's live frames from the slot
        a.resume(); // evicts B, restores A's image
        b.resume(); // evicts A, restores B's image

        assert!(ok_a.get(), "A's stack image was not restored intact");
        assert!(ok_b.get(), "B's stack image was not restored intact");
        assert_eq!(a.state(), FiberState::Ready);
        assert_eq!(b.state(), FiberState::Ready);
    });
}

#[test]
fn scheduler_routing() {
    run_serial(|| {
        let trace: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

        let sched_trace = trace.clone();
        let sched = Fiber::new(
            move || {
                let worker_trace = sched_trace.clone();
                let worker = Fiber::new(
                    move || {
                        worker_trace.borrow_mut().push("worker: start");
                        Fiber::current().yield_now();
                        worker_trace.borrow_mut().push("worker: end");
                    },
                    0,
                    true, // yields to the scheduler fiber, not the thread root
                );
                worker.resume();
                sched_trace.borrow_mut().push("sched: worker yielded");
                worker.resume();
                sched_trace.borrow_mut().push("sched: worker finished");
            },
            0,
            false,
        );

        Fiber::set_scheduler(&sched);
        sched.resume();
        assert_eq!(sched.state(), FiberState::Term);

        assert_eq!(
            *trace.borrow(),
            vec![
                "worker: start",
                "sched: worker yielded",
                "worker: end",
                "sched: worker finished",
            ]
        );
    });
}

#[test]
fn ids_survive_destruction_monotonically() {
    run_serial(|| {
        let mut max_id = 0;
        for _ in 0..1000 {
            let fiber = Fiber::new(|| {}, 16 * 1024, false);
            max_id = max_id.max(fiber.id());
        }
        let next = Fiber::new(|| {}, 16 * 1024, false);
        assert!(next.id() > max_id);
    });
}

#[test]
fn construction_accounting() {
    run_serial(|| {
        let _root = Fiber::current();

        let alive_before = Fiber::alive();
        let probe = Fiber::new(|| {}, 16 * 1024, false);
        let first_id = probe.id();
        assert_eq!(Fiber::alive(), alive_before + 1);

        drop(probe);
        assert_eq!(Fiber::alive(), alive_before);

        // destruction returns the live count but never an id
        let probe = Fiber::new(|| {}, 16 * 1024, false);
        assert_eq!(probe.id(), first_id + 1);
    });
}

#[test]
fn current_identity_inside_fiber() {
    run_serial(|| {
        let root = Fiber::current();
        assert_eq!(root.state(), FiberState::Running);

        let observed_id = Rc::new(Cell::new(u64::MAX));
        let observed_running = Rc::new(Cell::new(false));

        let id_slot = observed_id.clone();
        let running_slot = observed_running.clone();
        let fiber = Fiber::new(
            move || {
                let me = Fiber::current();
                id_slot.set(me.id());
                running_slot.set(me.state() == FiberState::Running);
            },
            0,
            false,
        );

        let expected = fiber.id();
        fiber.resume();
        assert_eq!(observed_id.get(), expected);
        assert!(observed_running.get());
        // the fiber terminated, so the root is current again
        assert_eq!(Fiber::current_id(), root.id());
    });
}

#[test]
fn current_id_sentinel_without_fibers() {
    run_serial(|| {
        assert_eq!(Fiber::current_id(), u64::MAX);
        let _root = Fiber::current();
        assert_ne!(Fiber::current_id(), u64::MAX);
    });
}

#[test]
fn pool_hands_out_slots_round_robin() {
    run_serial(|| {
        let pool = ShareStack::new(2, 32 * 1024);
        let hits = Rc::new(Cell::new(0u32));

        let fibers: Vec<_> = (0..3)
            .map(|_| {
                let inner = hits.clone();
                Fiber::with_shared_stack(move || inner.set(inner.get() + 1), &pool, false)
            })
            .collect();

        assert!(Rc::ptr_eq(&fibers[0].stack_mem().unwrap(), &pool.slot(0)));
        assert!(Rc::ptr_eq(&fibers[1].stack_mem().unwrap(), &pool.slot(1)));
        assert!(Rc::ptr_eq(&fibers[2].stack_mem().unwrap(), &pool.slot(0)));

        for fiber in &fibers {
            fiber.resume();
            assert_eq!(fiber.state(), FiberState::Term);
        }
        assert_eq!(hits.get(), 3);
    });
}

#[test]
fn nested_shared_resume_pairs_with_resumer() {
    run_serial(|| {
        let pool = ShareStack::new(2, 32 * 1024);
        let trace: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

        let inner_trace = trace.clone();
        let inner = Fiber::on_stack_mem(
            move || {
                inner_trace.borrow_mut().push("inner: run");
                Fiber::current().yield_now();
                inner_trace.borrow_mut().push("inner: end");
            },
            pool.slot(1),
            false,
        );

        let outer_trace = trace.clone();
        let inner_handle = inner.clone();
        let outer = Fiber::on_stack_mem(
            move || {
                outer_trace.borrow_mut().push("outer: start");
                inner_handle.resume();
                outer_trace.borrow_mut().push("outer: inner yielded");
                inner_handle.resume();
                outer_trace.borrow_mut().push("outer: done");
            },
            pool.slot(0),
            false,
        );

        outer.resume();

        assert_eq!(
            *trace.borrow(),
            vec![
                "outer: start",
                "inner: run",
                "outer: inner yielded",
                "inner: end",
                "outer: done",
            ]
        );
        assert_eq!(outer.state(), FiberState::Term);
        assert_eq!(inner.state(), FiberState::Term);
    });
}

#[test]
fn shared_fibers_run_deep_frames() {
    run_serial(|| {
        let mem = StackMem::alloc(64 * 1024);
        let sum = Rc::new(Cell::new(0u64));

        fn descend(depth: u32, acc: u64) -> u64 {
            if depth == 0 {
                Fiber::current().yield_now();
                acc
            } else {
                // keep a frame-local alive across the recursive call
                let local = std::hint::black_box(depth as u64);
                descend(depth - 1, acc + local) + 1
            }
        }

        let inner = sum.clone();
        let a = Fiber::on_stack_mem(move || inner.set(descend(24, 0)), mem.clone(), false);
        let poker = Fiber::on_stack_mem(
            || {
                // take over the slot so A's deep frames get copied out
                let mut scratch = [0u8; 512];
                scratch.fill(0x5A);
                std::hint::black_box(&mut scratch);
            },
            mem.clone(),
            false,
        );

        a.resume(); // descends 24 frames, suspends at the bottom
        poker.resume(); // evicts A's recursion from the slot
        a.resume(); // restores the image, unwinds the recursion

        // 24 + 23 + ... + 1 summed on the way down, +1 per level coming back
        assert_eq!(sum.get(), (1u64..=24).sum::<u64>() + 24);
        assert_eq!(a.state(), FiberState::Term);
    });
}
