//! Concurrent reservation and access pressure on the simulated address space.

use std::sync::Arc;
use std::thread;

use partalloc_pages::geometry::{SUPER_PAGE_SIZE, SYSTEM_PAGE_SIZE};
use partalloc_pages::{AddressSpace, PageAllocator, PageState};

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }
}

#[test]
fn concurrent_reservations_never_overlap() {
    const THREADS: u64 = 8;
    const PER_THREAD: usize = 32;

    let space = Arc::new(AddressSpace::with_seed(0xFEED));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let space = Arc::clone(&space);
            thread::spawn(move || {
                let mut rng = XorShift64::new(t + 1);
                (0..PER_THREAD)
                    .map(|_| {
                        let pages = 1 + (rng.next_u64() % 3) as usize;
                        let size = pages * SUPER_PAGE_SIZE;
                        let base = space.reserve(size, SUPER_PAGE_SIZE, None).unwrap();
                        (base, size)
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut ranges: Vec<(usize, usize)> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        let (a_base, a_size) = pair[0];
        let (b_base, _) = pair[1];
        assert!(a_base + a_size <= b_base, "reservations overlap: {pair:?}");
    }
    assert_eq!(space.reservation_count(), ranges.len());
}

#[test]
fn concurrent_writers_on_disjoint_pages_keep_their_bytes() {
    const THREADS: usize = 8;

    let space = Arc::new(AddressSpace::with_seed(0xBEEF));
    let base = space.reserve(SUPER_PAGE_SIZE, SUPER_PAGE_SIZE, None).unwrap();
    space.commit(base, THREADS * SYSTEM_PAGE_SIZE).unwrap();

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let space = Arc::clone(&space);
            thread::spawn(move || {
                let page = base + t * SYSTEM_PAGE_SIZE;
                for round in 0..200u32 {
                    space.fill(page, SYSTEM_PAGE_SIZE, t as u8 + 1).unwrap();
                    space
                        .update_u32(page, &mut |v| Some(v.wrapping_add(round)))
                        .unwrap()
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for t in 0..THREADS {
        let page = base + t * SYSTEM_PAGE_SIZE;
        let tail = space.read_vec(page + 4, SYSTEM_PAGE_SIZE - 4).unwrap();
        assert!(tail.iter().all(|&b| b == t as u8 + 1));
        assert_eq!(space.page_state(page), Some(PageState::Resident));
    }
}

#[test]
fn shared_reference_counter_updates_are_atomic() {
    const THREADS: usize = 8;
    const ROUNDS: u32 = 500;

    let space = Arc::new(AddressSpace::with_seed(0xC0FFEE));
    let base = space.reserve(SUPER_PAGE_SIZE, SUPER_PAGE_SIZE, None).unwrap();
    space.commit(base, SYSTEM_PAGE_SIZE).unwrap();

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let space = Arc::clone(&space);
            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    space
                        .update_u32(base, &mut |v| Some(v + 1))
                        .unwrap()
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(space.read_u32(base).unwrap(), THREADS as u32 * ROUNDS);
}
