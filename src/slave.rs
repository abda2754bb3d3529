//! The callee-facing half of the protocol, run by a freshly exec'd replica of the caller's
//! executable with the `--remotethread-slave <fd>` sentinel.
//!
//! [`run`] never returns to its caller: it either completes the call and exits 0, or fails and
//! exits nonzero, matching the external-interface contract that slave mode never hands control
//! back to a host `main`.

use std::alloc::Layout;
use std::net::TcpStream;
use std::os::fd::FromRawFd;
use std::process;

use crate::error::Error;
use crate::proto::{Call, Reply};
use crate::{init, ioutil, proto, region};

/// The signature every function offered to [`crate::client::call`] must have. `param`/`param_len`
/// describe the caller's parameter buffer, reconstructed in-region on the slave; `out_reply_len`
/// must be written with the length of the returned buffer. A null return means failure.
///
/// The returned buffer is allocated with [`alloc_reply`] (the ordinary process allocator, not the
/// region) and is freed by the slave runtime after it has been sent, exactly once.
pub type RemoteThreadFn =
    extern "C" fn(param: *const u8, param_len: usize, out_reply_len: *mut usize) -> *mut u8;

/// Allocates an off-region buffer of `len` bytes for a [`RemoteThreadFn`] to return as its reply.
/// Pairs with the slave's internal `free_reply`, which assumes exactly this layout.
pub fn alloc_reply(len: usize) -> *mut u8 {
    if len == 0 {
        return std::ptr::NonNull::dangling().as_ptr();
    }
    unsafe { std::alloc::alloc(reply_layout(len)) }
}

fn reply_layout(len: usize) -> Layout {
    Layout::array::<u8>(len).expect("reply length overflows a Layout")
}

unsafe fn free_reply(ptr: *mut u8, len: usize) {
    if len == 0 {
        return;
    }
    std::alloc::dealloc(ptr, reply_layout(len));
}

/// Entry point dispatched from [`crate::init::init`] when argv requests slave mode. `fd` is a
/// socket inherited from the server, already connected to the caller.
pub fn run(fd: i32) -> ! {
    // SAFETY: `fd` was handed to us by the server as a valid, open, connected socket.
    let stream = unsafe { TcpStream::from_raw_fd(fd) };
    match run_call(stream) {
        Ok(()) => process::exit(0),
        Err(err) => {
            error!("{err}");
            process::exit(1);
        }
    }
}

fn run_call(mut stream: TcpStream) -> Result<(), Error> {
    if let Some(path) = init::own_binary() {
        // The server wrote this executable to a temp path solely for us to run once.
        let _ = std::fs::remove_file(&path);
    }

    let result = run_call_inner(&mut stream);
    if result.is_err() {
        // Best-effort: tell the caller we failed even if we can't say why.
        let _ = Reply::error().write(&mut stream);
    }
    result
}

fn run_call_inner(stream: &mut TcpStream) -> Result<(), Error> {
    let call = Call::read(stream)?;

    region::reserve(call.alloc_len as usize)?;

    let mut compressed = vec![0u8; call.alloc_compr_len as usize];
    ioutil::read_all(stream, &mut compressed)?;
    {
        // SAFETY: `reserve` just grew the region to exactly `alloc_len` bytes and nothing else
        // holds a reference into it yet.
        let region_bytes = unsafe { region::raw_bytes_mut() };
        proto::decompress_region(&compressed, region_bytes)?;
    }
    drop(compressed);
    region::rebuild_last_chunk();

    let param_ptr = region::from_offset(call.param as usize - region::BASE) as *const u8;
    let func: RemoteThreadFn = unsafe { std::mem::transmute(call.eip as usize) };

    let mut reply_len: usize = 0;
    let reply_ptr = func(param_ptr, call.param_len as usize, &mut reply_len);
    if reply_ptr.is_null() {
        return Err(Error::Remote);
    }

    let reply_bytes = unsafe { std::slice::from_raw_parts(reply_ptr, reply_len) };
    let send_result = (|| -> Result<(), Error> {
        Reply::ok(reply_len as u32).write(stream)?;
        ioutil::write_all(stream, reply_bytes)?;
        Ok(())
    })();
    unsafe { free_reply(reply_ptr, reply_len) };
    send_result
}
