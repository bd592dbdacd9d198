use myfiber::Fiber;

fn main() {
    // A minimal scheduler fiber: drives two workers round-robin until
    // both finish. Workers are created with run_in_scheduler = true, so
    // their yields come back here instead of the thread root.
    let sched = Fiber::new(
        || {
            let workers: Vec<_> = (0..2)
                .map(|n| {
                    Fiber::new(
                        move || {
                            for step in 0..3 {
                                println!("worker {n}: step {step}");
                                Fiber::current().yield_now();
                            }
                        },
                        0,
                        true,
                    )
                })
                .collect();

            loop {
                let mut progressed = false;
                for worker in &workers {
                    if worker.state() == myfiber::FiberState::Ready {
                        worker.resume();
                        progressed = true;
                    }
                }
                if !progressed {
                    break;
                }
            }
            println!("scheduler: all workers done");
        },
        0,
        false,
    );

    Fiber::set_scheduler(&sched);
    sched.resume();
    println!("main: scheduler finished");
}
