//! Splits a 1 MiB buffer into 8 chunks and has remote workers XOR each chunk's two halves.
//!
//! Start one or more `remotethread-server` processes, then run this program with the IP
//! addresses of those servers: `remotethread-xor-demo --remotethread 10.0.0.2`.

use remotethread::{alloc_reply, CallHandle};

const BUFFER_LEN: usize = 1024 * 1024;
const CHUNKS: usize = 8;
const CHUNK_LEN: usize = BUFFER_LEN / CHUNKS;

extern "C" fn xor_func(param: *const u8, param_len: usize, out_reply_len: *mut usize) -> *mut u8 {
    if param_len % 2 != 0 {
        return std::ptr::null_mut();
    }
    let half = param_len / 2;
    let input = unsafe { std::slice::from_raw_parts(param, param_len) };

    let reply_ptr = alloc_reply(half);
    let reply = unsafe { std::slice::from_raw_parts_mut(reply_ptr, half) };
    for i in 0..half {
        reply[i] = input[i] ^ input[i + half];
    }
    unsafe { *out_reply_len = half };
    reply_ptr
}

fn main() {
    remotethread::init();

    let mut buf = vec![0u8; BUFFER_LEN];
    for b in buf.iter_mut() {
        *b = rand::random();
    }

    let mut handles: Vec<CallHandle> = Vec::with_capacity(CHUNKS);
    for chunk in buf.chunks(CHUNK_LEN) {
        match remotethread::call(xor_func, chunk) {
            Some(handle) => handles.push(handle),
            None => {
                eprintln!("remotethread-xor-demo: call failed, stopping submission");
                break;
            }
        }
    }

    for (i, mut handle) in handles.into_iter().enumerate() {
        match remotethread::wait(&mut handle) {
            Some(reply) => {
                let half = CHUNK_LEN / 2;
                let expected: Vec<u8> = (0..half)
                    .map(|j| buf[i * CHUNK_LEN + j] ^ buf[i * CHUNK_LEN + half + j])
                    .collect();
                if reply == expected {
                    println!("chunk {i}: reply matches local computation ({half} bytes)");
                } else {
                    eprintln!("chunk {i}: reply MISMATCHES local computation");
                }
            }
            None => eprintln!("chunk {i}: call failed"),
        }
        remotethread::destroy(handle);
    }
}
