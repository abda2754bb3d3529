//! Allocator stress scenario: grow a set of differently-sized allocations, free half at random,
//! double the survivors, verify contents throughout, then free everything in reverse order,
//! checking allocator invariants after every single operation.

use remotethread::region;

const NUM: usize = 100;

#[test]
fn stress_alloc_free_realloc_cycle() {
    let mut ptr: Vec<Option<*mut u8>> = vec![None; NUM];

    for i in 0..NUM {
        let len = 256 + 64 * i;
        let p = region::alloc(len).expect("alloc should not fail while growing freely");
        unsafe { std::slice::from_raw_parts_mut(p, len).fill(i as u8) };
        ptr[i] = Some(p);
        region::check();
    }

    // Deterministic "random" half: every other index, rather than a real RNG, so the test is
    // reproducible without pulling in a seeded generator just for this.
    for i in (0..NUM).step_by(2) {
        let len = 256 + 64 * i;
        let p = ptr[i].take().unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(p, len) };
        assert!(bytes.iter().all(|&b| b == i as u8));
        region::free(Some(p));
        region::check();
    }

    for i in 0..NUM {
        let len = 256 + 64 * i;
        match ptr[i] {
            None => {
                let p = region::alloc(len * 2).expect("alloc should not fail");
                unsafe { std::slice::from_raw_parts_mut(p, len * 2).fill(i as u8) };
                ptr[i] = Some(p);
            }
            Some(p) => {
                let p2 = region::realloc(Some(p), len * 2).expect("realloc should not fail");
                unsafe { std::slice::from_raw_parts_mut(p2.add(len), len).fill(i as u8) };
                ptr[i] = Some(p2);
            }
        }
        region::check();
    }

    for i in (0..NUM).rev() {
        let len = 256 + 64 * i;
        let p = ptr[i].take().unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(p, len * 2) };
        assert!(bytes.iter().all(|&b| b == i as u8));
        region::free(Some(p));
        region::check();
    }

    assert_eq!(
        region::free_chunk_count(),
        1,
        "freeing everything should coalesce back down to a single free chunk spanning the region"
    );
}
