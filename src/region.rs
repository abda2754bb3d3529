//! The fixed-base region allocator: a linear heap with a coalescing free list, rooted at a
//! hard-coded virtual address so that a byte-for-byte snapshot of it remains valid when replayed
//! at the same address in another process.
//!
//! All state here is process-global, mirroring the single static allocator of the reference
//! implementation: there is exactly one region per process, and it is not reentrant. A caller
//! issuing concurrent [`crate::client::call`]s from multiple threads must serialize the
//! prepare-snapshot-send phase itself.

use std::slice;
use std::sync::Mutex;

use crate::error::Error;

/// Fixed base address of the region on every participating process.
pub const BASE: usize = 0x4000_0000;
const PAGE_SIZE: usize = 4096;
const GROW_PAGES: usize = 16;
const ALIGN: usize = 64;
const HEADER_SIZE: usize = std::mem::size_of::<Chunk>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Status {
    Free,
    Allocated,
    /// An absorbed header, unreachable from any walk starting at the first chunk. Exists only
    /// transiently between a merge and the invariant check that follows it.
    Tombstone,
}

/// The header prefixing every chunk's user bytes. `prev` and `size` are addresses/offsets within
/// the region, never raw process pointers, so a header is valid verbatim after a snapshot replay
/// at the same base.
#[repr(C)]
struct Chunk {
    prev: usize,
    size: usize,
    status: Status,
}

struct RegionState {
    /// Offset of `current_end` from `BASE`; the region currently spans `[BASE, BASE + len)`.
    len: usize,
    /// Offset of the last chunk from `BASE`, or `None` before the first `grow`.
    last_chunk: Option<usize>,
    /// Offset of the allocator cursor from `BASE`, or `None` before the first `grow`.
    cursor: Option<usize>,
}

lazy_static! {
    static ref REGION: Mutex<RegionState> = Mutex::new(RegionState {
        len: 0,
        last_chunk: None,
        cursor: None,
    });
}

fn round_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

unsafe fn chunk_at(offset: usize) -> *mut Chunk {
    (BASE + offset) as *mut Chunk
}

unsafe fn user_ptr(offset: usize) -> *mut u8 {
    (BASE + offset + HEADER_SIZE) as *mut u8
}

fn offset_of(ptr: *mut u8) -> Option<usize> {
    let addr = ptr as usize;
    if addr < BASE + HEADER_SIZE {
        return None;
    }
    Some(addr - BASE - HEADER_SIZE)
}

/// Allocate `size` bytes in the region. Returns `None` if the region cannot be grown to satisfy
/// the request; growth failure is a hard, whole-allocator failure surfaced to the caller rather
/// than a panic.
pub fn alloc(size: usize) -> Option<*mut u8> {
    let mut state = REGION.lock().unwrap();
    let need = round_up(size + HEADER_SIZE, ALIGN);
    let offset = find_free_chunk(&mut state, need)?;
    unsafe {
        let chunk = chunk_at(offset);
        (*chunk).status = Status::Allocated;
        if (*chunk).size >= need + ALIGN {
            split(&mut state, offset, need);
        }
        Some(user_ptr(offset))
    }
}

/// Next-fit circular scan starting at the cursor. Grows the region on a full wrap with no hit.
fn find_free_chunk(state: &mut RegionState, need: usize) -> Option<usize> {
    if state.len == 0 {
        return grow(state, need).ok();
    }

    let start = state.cursor.unwrap_or(0);
    let mut offset = start;
    loop {
        let size = unsafe { (*chunk_at(offset)).size };
        let status = unsafe { (*chunk_at(offset)).status };
        if status == Status::Free && size >= need {
            state.cursor = Some(offset);
            return Some(offset);
        }
        offset += size;
        if offset >= state.len {
            offset = 0;
        }
        if offset == start {
            break;
        }
    }
    grow(state, need).ok()
}

/// Splits the chunk at `offset` (known to have `size >= need + ALIGN`) into an allocated head of
/// exactly `need` bytes and a free tail, repairing back-pointers and `last_chunk` as needed.
fn split(state: &mut RegionState, offset: usize, need: usize) {
    unsafe {
        let chunk = chunk_at(offset);
        let old_size = (*chunk).size;
        let tail_offset = offset + need;
        let tail = chunk_at(tail_offset);
        (*tail).size = old_size - need;
        (*tail).status = Status::Free;
        (*tail).prev = offset;
        (*chunk).size = need;

        if state.last_chunk == Some(offset) {
            state.last_chunk = Some(tail_offset);
        } else {
            let next_offset = tail_offset + (*tail).size;
            (*chunk_at(next_offset)).prev = tail_offset;
        }
    }
}

/// Grows the region by mapping fresh pages at the current end, forming a new free chunk, and
/// coalescing it backward into the former tail chunk if that was free.
fn grow(state: &mut RegionState, need: usize) -> Result<usize, Error> {
    let size = round_up(need.max(1), PAGE_SIZE * GROW_PAGES);
    let map_addr = BASE + state.len;

    let mapped = unsafe {
        libc::mmap(
            map_addr as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        )
    };
    if mapped == libc::MAP_FAILED {
        error!("remotethread: unable to grow the region at {map_addr:#x}");
        return Err(Error::Resource("unable to grow the region"));
    }
    // MAP_FIXED never fails on overlap, it silently clobbers; this only catches a kernel that
    // rejected the address outright (e.g. an invalid argument), not a prior occupant being
    // unmapped out from under us. See the fixed-base deployment precondition in the crate docs.
    assert_eq!(
        mapped as usize, map_addr,
        "kernel placed the growth mapping at an unexpected address"
    );

    let new_offset = state.len;
    let former_tail = state.last_chunk;
    unsafe {
        let chunk = chunk_at(new_offset);
        (*chunk).size = size;
        (*chunk).status = Status::Free;
        (*chunk).prev = former_tail.unwrap_or(new_offset);
    }
    state.len += size;
    state.last_chunk = Some(new_offset);

    // Coalesce backward into the former tail if it was free: same forward-merge shape as
    // `coalesce`, just with the roles fixed (the former tail absorbs the new chunk).
    if let Some(prev_offset) = former_tail {
        let prev_free = unsafe { (*chunk_at(prev_offset)).status } == Status::Free;
        if prev_free {
            unsafe {
                (*chunk_at(prev_offset)).size += size;
                (*chunk_at(new_offset)).status = Status::Tombstone;
            }
            state.last_chunk = Some(prev_offset);
            state.cursor = Some(prev_offset);
            return Ok(prev_offset);
        }
    }
    state.cursor = Some(new_offset);
    Ok(new_offset)
}

/// Releases the chunk backing `ptr`. `ptr == None` is a no-op. Releasing a chunk that is not
/// currently `Allocated` is a programmer fault and panics, matching the reference
/// implementation's `assert`.
pub fn free(ptr: Option<*mut u8>) {
    let Some(ptr) = ptr else { return };
    let mut state = REGION.lock().unwrap();
    let offset = offset_of(ptr).expect("freed pointer does not belong to the region");
    unsafe {
        let chunk = chunk_at(offset);
        assert_eq!(
            (*chunk).status,
            Status::Allocated,
            "double free or free of a non-allocated chunk"
        );
        (*chunk).status = Status::Free;
    }
    coalesce(&mut state, offset);
}

/// Coalesces the (already-freed) chunk at `offset` with a free predecessor and/or successor, and
/// sets the cursor to the resulting merged chunk.
fn coalesce(state: &mut RegionState, offset: usize) {
    let mut merged = offset;

    unsafe {
        let prev_offset = (*chunk_at(merged)).prev;
        if prev_offset != merged && (*chunk_at(prev_offset)).status == Status::Free {
            let size = (*chunk_at(merged)).size;
            (*chunk_at(prev_offset)).size += size;
            (*chunk_at(merged)).status = Status::Tombstone;
            if state.last_chunk == Some(merged) {
                state.last_chunk = Some(prev_offset);
            } else {
                let next_offset = merged + size;
                (*chunk_at(next_offset)).prev = prev_offset;
            }
            merged = prev_offset;
        }
    }

    unsafe {
        let next_offset = merged + (*chunk_at(merged)).size;
        if next_offset < state.len && (*chunk_at(next_offset)).status == Status::Free {
            let next_size = (*chunk_at(next_offset)).size;
            (*chunk_at(merged)).size += next_size;
            (*chunk_at(next_offset)).status = Status::Tombstone;
            if state.last_chunk == Some(next_offset) {
                state.last_chunk = Some(merged);
            } else {
                let next_next_offset = next_offset + next_size;
                (*chunk_at(next_next_offset)).prev = merged;
            }
        }
    }

    state.cursor = Some(merged);
}

/// Resizes the chunk backing `ptr` to `new_size` bytes, preserving `[0, min(old, new))` of its
/// contents. `ptr == None` behaves as `alloc(new_size)`.
pub fn realloc(ptr: Option<*mut u8>, new_size: usize) -> Option<*mut u8> {
    let Some(ptr) = ptr else {
        return alloc(new_size);
    };

    let mut state = REGION.lock().unwrap();
    let offset = offset_of(ptr).expect("realloc'd pointer does not belong to the region");
    let need = round_up(new_size + HEADER_SIZE, ALIGN);
    let old_size = unsafe { (*chunk_at(offset)).size };

    if need <= old_size {
        if old_size >= need + ALIGN {
            split(&mut state, offset, need);
            let tail_offset = offset + need;
            unsafe { (*chunk_at(tail_offset)).status = Status::Free };
            coalesce(&mut state, tail_offset);
        }
        return Some(ptr);
    }

    // In-place grow: absorb a free successor if it suffices.
    let next_offset = offset + old_size;
    let can_grow_in_place = next_offset < state.len && unsafe {
        (*chunk_at(next_offset)).status == Status::Free
            && old_size + (*chunk_at(next_offset)).size >= need
    };
    if can_grow_in_place {
        unsafe {
            let next_size = (*chunk_at(next_offset)).size;
            let combined = old_size + next_size;
            (*chunk_at(next_offset)).status = Status::Tombstone;
            if state.last_chunk == Some(next_offset) {
                state.last_chunk = Some(offset);
            } else {
                let next_next_offset = next_offset + next_size;
                (*chunk_at(next_next_offset)).prev = offset;
            }
            if state.cursor == Some(next_offset) {
                state.cursor = Some(0);
            }
            (*chunk_at(offset)).size = combined;
            if combined >= need + ALIGN {
                split(&mut state, offset, need);
            }
        }
        return Some(ptr);
    }

    // Copy grow: allocate fresh, copy, free the old chunk. Drop the lock first so `alloc`/`free`
    // (which take it themselves) don't deadlock.
    drop(state);
    let new_ptr = alloc(new_size)?;
    unsafe {
        let old_user_len = old_size - HEADER_SIZE;
        let copy_len = old_user_len.min(new_size);
        std::ptr::copy_nonoverlapping(ptr, new_ptr, copy_len);
    }
    free(Some(ptr));
    Some(new_ptr)
}

/// Walks every free chunk and zeroes its user bytes. Called immediately before a snapshot is
/// taken so stale data neither inflates the compressed payload nor leaks to the worker.
pub fn zero_free_chunks() {
    let state = REGION.lock().unwrap();
    let mut offset = 0;
    while offset < state.len {
        unsafe {
            let chunk = chunk_at(offset);
            let size = (*chunk).size;
            if (*chunk).status == Status::Free {
                let user_len = size - HEADER_SIZE;
                slice::from_raw_parts_mut(user_ptr(offset), user_len).fill(0);
            }
            offset += size;
        }
    }
}

/// Borrows the region's current byte image, `[BASE, BASE + len)`, for compression.
pub fn snapshot() -> &'static [u8] {
    let state = REGION.lock().unwrap();
    unsafe { slice::from_raw_parts(BASE as *const u8, state.len) }
}

/// Length in bytes of the region at its current extent.
pub fn len() -> usize {
    REGION.lock().unwrap().len
}

/// Number of chunks currently in `Free` status, for tests and diagnostics.
pub fn free_chunk_count() -> usize {
    let state = REGION.lock().unwrap();
    let mut count = 0;
    let mut offset = 0;
    while offset < state.len {
        unsafe {
            let chunk = chunk_at(offset);
            if (*chunk).status == Status::Free {
                count += 1;
            }
            offset += (*chunk).size;
        }
    }
    count
}

/// Reserves region memory of length `target_len` at the fixed base by growing from empty,
/// without regard to any particular allocation's size; used by the slave to recreate a region
/// of the exact length the caller snapshotted, before the decompressed bytes are written in.
pub fn reserve(target_len: usize) -> Result<(), Error> {
    let mut state = REGION.lock().unwrap();
    assert_eq!(state.len, 0, "reserve called on a non-empty region");
    while state.len < target_len {
        grow(&mut state, target_len - state.len)?;
    }
    Ok(())
}

/// Mutable access to the region's raw bytes, used by the slave to write a decompressed snapshot
/// directly into place.
///
/// # Safety
/// The caller must not alias this slice with any other live reference into the region.
pub unsafe fn raw_bytes_mut() -> &'static mut [u8] {
    let state = REGION.lock().unwrap();
    slice::from_raw_parts_mut(BASE as *mut u8, state.len)
}

/// Re-derives `last_chunk` (and resets the cursor) by a single linear walk, the only bookkeeping
/// a replica must reconstruct after a raw snapshot byte-copy, since every header stores only
/// intra-region offsets.
pub fn rebuild_last_chunk() {
    let mut state = REGION.lock().unwrap();
    let mut offset = 0;
    let mut prev = offset;
    while offset < state.len {
        unsafe { (*chunk_at(offset)).prev = if offset == 0 { 0 } else { prev } };
        prev = offset;
        offset += unsafe { (*chunk_at(offset)).size };
    }
    state.last_chunk = Some(prev);
    state.cursor = Some(0);
}

/// Address of the user bytes backing `ptr`'s chunk, as an offset from [`BASE`]. Used to translate
/// a region pointer into the wire-level `param` address and back.
pub fn to_offset(ptr: *mut u8) -> usize {
    ptr as usize - BASE
}

/// Inverse of [`to_offset`].
pub fn from_offset(offset: usize) -> *mut u8 {
    (BASE + offset) as *mut u8
}

/// Debug walk asserting invariants 1 (back-pointers), 2 (sizes tile to len) and 5 (`last_chunk`
/// is the final tile). Panics on any violation; intended for tests and diagnostic builds.
pub fn check() {
    let state = REGION.lock().unwrap();
    let mut offset = 0;
    let mut prev = offset;
    let mut total = 0;
    let mut first = true;
    while offset < state.len {
        unsafe {
            let chunk = chunk_at(offset);
            let expected_prev = if first { offset } else { prev };
            assert_eq!((*chunk).prev, expected_prev, "invariant 1 violated at {offset:#x}");
            assert!((*chunk).size % ALIGN == 0, "invariant 2 violated: unaligned size at {offset:#x}");
            total += (*chunk).size;
            prev = offset;
            offset += (*chunk).size;
            first = false;
        }
    }
    assert_eq!(total, state.len, "invariant 2 violated: sizes do not tile the region");
    assert_eq!(
        state.last_chunk,
        if state.len == 0 { None } else { Some(prev) },
        "invariant 5 violated: last_chunk is not the final tile"
    );
}

/// Human-readable dump of every chunk, for interactive debugging.
pub fn dump() {
    let state = REGION.lock().unwrap();
    debug!("---- region dump, len={:#x} ----", state.len);
    let mut offset = 0;
    while offset < state.len {
        unsafe {
            let chunk = chunk_at(offset);
            debug!(
                "{:#010x} size={:#x} status={:?}",
                offset,
                (*chunk).size,
                (*chunk).status
            );
            offset += (*chunk).size;
        }
    }
}
