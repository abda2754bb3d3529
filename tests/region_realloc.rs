//! Scenario 6: reallocating a chunk in place must absorb a freed neighbor without moving the
//! caller's pointer or disturbing its existing contents.

use std::sync::Mutex;

use remotethread::region;

// The region is a single process-global singleton (see `region.rs`'s own `with_region` test
// helper); both tests below mutate it and must not interleave with each other.
static TEST_LOCK: Mutex<()> = Mutex::new(());

#[test]
fn realloc_in_place_grow_does_not_move_the_pointer() {
    let _guard = TEST_LOCK.lock().unwrap();
    let a = region::alloc(256).expect("alloc A");
    let b = region::alloc(256).expect("alloc B");
    unsafe { std::slice::from_raw_parts_mut(a, 256).fill(0xaa) };

    region::free(Some(b));
    region::check();

    let a2 = region::realloc(Some(a), 384).expect("realloc A to 384 bytes");
    assert_eq!(a2, a, "absorbing a free neighbor must not relocate the user pointer");

    let prefix = unsafe { std::slice::from_raw_parts(a2, 256) };
    assert!(prefix.iter().all(|&b| b == 0xaa), "original contents must survive the grow");

    region::check();
    region::free(Some(a2));
    region::check();
}

#[test]
fn realloc_shrink_preserves_prefix_and_frees_the_tail() {
    let _guard = TEST_LOCK.lock().unwrap();
    let p = region::alloc(1024).expect("alloc");
    unsafe { std::slice::from_raw_parts_mut(p, 1024).fill(0x5a) };

    let p2 = region::realloc(Some(p), 64).expect("shrink to 64 bytes");
    assert_eq!(p2, p);
    let bytes = unsafe { std::slice::from_raw_parts(p2, 64) };
    assert!(bytes.iter().all(|&b| b == 0x5a));

    region::check();
    region::free(Some(p2));
    region::check();
}
