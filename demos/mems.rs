//! Walk the allocator through its paces on real pages: allocate a handful of
//! integer arrays, write through translated addresses, free one array and
//! allocate it again, printing the free list along the way.
//!
//! Allocation and free confirmations are logged at `info`; set `RUST_LOG` to
//! see more or less of them.

use std::process;

use mems::MemAlloc;

const COUNT: usize = 10;
const INTS: usize = 250;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.contains(&"--help".to_owned()) {
        println!("USAGE: {} [COUNT] [INTS]", args[0]);
        return;
    }
    let count: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(COUNT);
    let ints: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(INTS);
    // Element 1 is written below, and the 4th array is freed.
    let count = count.max(4);
    let ints = ints.max(2);

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run(count, ints) {
        eprintln!("mems: {}", err);
        process::exit(1);
    }
}

fn run(count: usize, ints: usize) -> Result<(), mems::MappingFailure> {
    let mut mems = MemAlloc::new()?;
    let size = core::mem::size_of::<i32>() * ints;

    println!("\n------- Allocated virtual addresses [allocate] -------");
    let mut arrays = Vec::with_capacity(count);
    for _ in 0..count {
        let ptr = mems.allocate(size)?.as_ptr().cast::<i32>();
        println!("Virtual address: {}", ptr as usize);
        arrays.push(ptr);
    }

    println!("\n------ Assigning value to Virtual address [translate] -----");
    unsafe {
        let second = mems.translate(arrays[0].add(1));
        second.write(200);
        let first = mems.translate(arrays[0]);
        println!(
            "Virtual address: {}\tPhysical Address: {}",
            arrays[0] as usize, first as usize
        );
        println!("Value written: {}", *first.add(1));
    }

    println!("\n--------- Printing Stats [print_stats] --------");
    mems.print_stats();

    println!("\n--------- Freeing up the memory [release] --------");
    unsafe { mems.release(arrays[3].cast::<u8>()) };
    mems.print_stats();
    arrays[3] = mems.allocate(size)?.as_ptr().cast::<i32>();
    mems.print_stats();

    println!("\n--------- Unmapping all memory [teardown] --------\n");
    mems.teardown()?;
    Ok(())
}
