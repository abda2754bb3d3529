//! Exercises the region allocator directly (no network calls): allocates a growing series of
//! buffers, frees half at random, reallocates the survivors to double size, and frees everything
//! in reverse, checking allocator invariants after every operation.

const NUM_ALLOCS: usize = 100;

fn main() {
    remotethread::init();

    let mut ptr: Vec<Option<*mut u8>> = vec![None; NUM_ALLOCS];

    for i in 0..NUM_ALLOCS {
        let len = 256 + 64 * i;
        let p = remotethread::alloc(len).expect("allocation failed");
        unsafe { std::slice::from_raw_parts_mut(p, len).fill(i as u8) };
        ptr[i] = Some(p);
        remotethread::region::check();
    }

    for _ in 0..NUM_ALLOCS / 2 {
        let i = rand::random::<usize>() % NUM_ALLOCS;
        let len = 256 + 64 * i;
        if let Some(p) = ptr[i] {
            let bytes = unsafe { std::slice::from_raw_parts(p, len) };
            assert!(bytes.iter().all(|&b| b == i as u8));
            remotethread::free(Some(p));
        }
        ptr[i] = None;
        remotethread::region::check();
    }

    for i in 0..NUM_ALLOCS {
        let len = 256 + 64 * i;
        match ptr[i] {
            None => {
                let p = remotethread::alloc(len * 2).expect("allocation failed");
                unsafe { std::slice::from_raw_parts_mut(p, len * 2).fill(i as u8) };
                ptr[i] = Some(p);
            }
            Some(p) => {
                let p2 = remotethread::realloc(Some(p), len * 2).expect("realloc failed");
                unsafe { std::slice::from_raw_parts_mut(p2.add(len), len).fill(i as u8) };
                ptr[i] = Some(p2);
            }
        }
        remotethread::region::check();
    }

    for i in (0..NUM_ALLOCS).rev() {
        let len = 256 + 64 * i;
        if let Some(p) = ptr[i] {
            let bytes = unsafe { std::slice::from_raw_parts(p, len * 2) };
            assert!(bytes.iter().all(|&b| b == i as u8));
            remotethread::free(Some(p));
        }
        remotethread::region::check();
    }

    println!("alloc-stress-demo: {NUM_ALLOCS} allocations survived the full cycle");
}
