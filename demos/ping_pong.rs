use myfiber::{Fiber, FiberState};

fn main() {
    let fiber = Fiber::new(
        || {
            println!("fiber: started");
            Fiber::current().yield_now();
            println!("fiber: resumed once");
            Fiber::current().yield_now();
            println!("fiber: resumed twice, finishing");
        },
        0,
        false,
    );

    println!("main: fiber {} created", fiber.id());
    fiber.resume();
    println!("main: fiber yielded");
    fiber.resume();
    println!("main: fiber yielded again");
    fiber.resume();
    assert_eq!(fiber.state(), FiberState::Term);
    println!("main: fiber finished");

    fiber.reset(|| println!("fiber: reborn with a new entry"));
    fiber.resume();
    println!("main: reset fiber finished");
}
