use core::ptr::null_mut;

use mems::{MemAlloc, ToyPages, HEADER_SIZE};

use rand::distributions::Distribution;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use test_env_log::test;

const PAGE: usize = 64;

#[test]
fn test_stress() {
    let toy_pages = ToyPages::new(PAGE, 16 * 1024 * 1024);
    let mut allocator = MemAlloc::initialize(toy_pages).unwrap();

    // Each slot is (pointer, requested size, fill byte); null means not allocated.
    let mut pointers: [(*mut u8, usize, u8); 64] = [(null_mut(), 0, 0); 64];
    let mut allocated_size: usize = 0;
    let mut freed_size: usize = 0;

    // The overlap check is quadratic in the list length, so it only runs
    // every so often.
    fn validate(allocator: &MemAlloc<ToyPages>, allocated_size: usize, freed_size: usize, full: bool) {
        let stats = allocator.stats();
        log::info!(
            "Allocated: {}, Freed: {}; mapped: {}; Unused: {}",
            allocated_size,
            freed_size,
            allocator.source().size,
            stats.unused,
        );
        assert!(stats.chain_count() <= 1);
        if full {
            let validity = allocator.validity();
            log::info!("Blocks: {}; Validity: {:?}", allocator.free_list(), validity);
            assert!(validity.is_valid());
        }

        // Everything mapped is either out with a caller or in the free list.
        let mapped = allocator.source().size;
        assert_eq!(allocated_size - freed_size, mapped - stats.unused);
    }

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let range = rand::distributions::Uniform::new_inclusive(1usize, 32);

    // The arena starts out in the free list.
    allocated_size += PAGE;
    freed_size += PAGE;

    for step in 0..2048usize {
        let chosen = pointers.choose_mut(&mut rng).unwrap();
        let &mut (ptr, requested, fill) = chosen;
        if ptr.is_null() {
            let new_size = range.sample(&mut rng) * range.sample(&mut rng);
            let fill = (step % 251) as u8 + 1;
            let new_ptr = allocator.allocate(new_size).unwrap().as_ptr();
            log::info!("  Allocated {:?} for {}", new_ptr, new_size);

            // Leave the header bytes alone so release can find the size.
            if new_size > HEADER_SIZE {
                unsafe { new_ptr.add(HEADER_SIZE).write_bytes(fill, new_size - HEADER_SIZE) };
            }
            *chosen = (new_ptr, new_size, fill);
            allocated_size += allocator.block_size(new_size).unwrap();
        } else {
            // Nobody else wrote into this region while it was out.
            if requested > HEADER_SIZE {
                let body = unsafe {
                    core::slice::from_raw_parts(ptr.add(HEADER_SIZE), requested - HEADER_SIZE)
                };
                assert!(body.iter().all(|&b| b == fill));
            }
            log::info!("Releasing {:?} {}", ptr, requested);
            unsafe { allocator.release(ptr) };
            *chosen = (null_mut(), 0, 0);
            freed_size += allocator.block_size(requested).unwrap();
        }

        validate(&allocator, allocated_size, freed_size, step % 64 == 0);
    }
}
