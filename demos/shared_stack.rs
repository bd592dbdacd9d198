use myfiber::{Fiber, StackMem};

fn main() {
    // One 64 KiB slot for both fibers: each resume of one evicts the
    // other's live stack bytes to its heap buffer.
    let mem = StackMem::alloc(64 * 1024);

    let ping = Fiber::on_stack_mem(
        || {
            let marker = [b'p'; 64];
            for round in 0..3 {
                println!("ping: round {round}, marker[0] = {}", marker[0] as char);
                Fiber::current().yield_now();
            }
        },
        mem.clone(),
        false,
    );

    let pong = Fiber::on_stack_mem(
        || {
            let marker = [b'q'; 64];
            for round in 0..3 {
                println!("pong: round {round}, marker[0] = {}", marker[0] as char);
                Fiber::current().yield_now();
            }
        },
        mem.clone(),
        false,
    );

    for _ in 0..3 {
        ping.resume();
        pong.resume();
    }
    println!("main: both fibers kept their locals across evictions");
}
