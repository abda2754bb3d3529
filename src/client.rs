//! The caller-facing half of the protocol: `call`, `wait`, `poll`, `destroy`.

use std::fs;
use std::io::Write;
use std::net::{Ipv4Addr, SocketAddrV4, TcpStream};

use rand::Rng;

use crate::error::{warn_none, Error};
use crate::init;
use crate::ioutil;
use crate::proto::{self, Call, Hello, Reply, REPLY_HEADER_LEN};
use crate::region;
use crate::slave::RemoteThreadFn;

/// Result of a non-blocking [`poll`].
pub enum PollResult {
    /// The reply has not fully arrived yet; try again later.
    Again,
    /// The full reply payload.
    Ready(Vec<u8>),
}

enum HandleState {
    AwaitingHeader,
    AwaitingBody { status_ok: bool, pos: usize, buf: Vec<u8> },
    Completed,
}

/// A single outstanding call's socket and partial-reply bookkeeping.
///
/// State machine: `Created -> AwaitingHeader -> AwaitingBody(pos) -> Completed`. Errors and
/// [`destroy`] are terminal from any state.
pub struct CallHandle {
    stream: TcpStream,
    state: HandleState,
}

/// Ships `func`/`param`/`param_len` to a randomly chosen configured server.
///
/// See the module-level docs for the full protocol this performs: picks a server, sends the
/// caller's own executable, copies the parameter buffer into the region, zeroes free chunks,
/// deflates the region, and sends the `Call` frame. Returns `None` on any failure, having
/// released whatever partial resources it acquired; a warning is logged at the failing step.
pub fn call(func: RemoteThreadFn, param: &[u8]) -> Option<CallHandle> {
    match try_call(func, param) {
        Ok(handle) => Some(handle),
        Err(err) => warn_none(err),
    }
}

fn try_call(func: RemoteThreadFn, param: &[u8]) -> Result<CallHandle, Error> {
    let servers = init::servers();
    if servers.is_empty() {
        init::warn_no_servers_once();
        return Err(Error::Config("no servers defined"));
    }
    let server = pick_server(&servers);

    let mut stream = TcpStream::connect(SocketAddrV4::new(server, proto::DEFAULT_PORT))?;

    let own_binary = init::own_binary().ok_or(Error::Config("init() was never called"))?;
    let binary = fs::read(&own_binary).map_err(|_| Error::Resource("unable to read own binary"))?;

    Hello {
        binary_len: binary.len() as u32,
    }
    .write(&mut stream)?;
    ioutil::write_all(&mut stream, &binary)?;

    let param_ptr = region::alloc(param.len()).ok_or(Error::Resource("out of region memory"))?;
    // SAFETY: `param_ptr` was just allocated with exactly `param.len()` user bytes.
    unsafe { std::ptr::copy_nonoverlapping(param.as_ptr(), param_ptr, param.len()) };

    let result = send_call(&mut stream, func, param_ptr, param.len());
    region::free(Some(param_ptr));
    result?;

    Ok(CallHandle {
        stream,
        state: HandleState::AwaitingHeader,
    })
}

fn pick_server(servers: &[Ipv4Addr]) -> Ipv4Addr {
    let idx = rand::rng().random_range(0..servers.len());
    servers[idx]
}

fn send_call(
    stream: &mut TcpStream,
    func: RemoteThreadFn,
    param_ptr: *mut u8,
    param_len: usize,
) -> Result<(), Error> {
    region::zero_free_chunks();
    let compressed =
        proto::compress_region(region::snapshot()).map_err(|_| Error::Resource("failed to compress the region"))?;

    Call {
        alloc_len: region::len() as u32,
        alloc_compr_len: compressed.len() as u32,
        param_len: param_len as u32,
        param: region::to_offset(param_ptr) as u64 + region::BASE as u64,
        eip: func as usize as u64,
    }
    .write(stream)?;
    ioutil::write_all(stream, &compressed)?;
    stream.flush()?;
    Ok(())
}

/// Blocks until the full reply arrives. Returns `None` on transport failure, a protocol
/// violation, or `Reply.status == Error`.
pub fn wait(handle: &mut CallHandle) -> Option<Vec<u8>> {
    match try_wait(handle) {
        Ok(buf) => Some(buf),
        Err(err) => warn_none(err),
    }
}

fn try_wait(handle: &mut CallHandle) -> Result<Vec<u8>, Error> {
    let mut state = std::mem::replace(&mut handle.state, HandleState::Completed);

    if matches!(state, HandleState::AwaitingHeader) {
        let reply = Reply::read(&mut handle.stream)?;
        state = HandleState::AwaitingBody {
            status_ok: reply.ok,
            pos: 0,
            buf: vec![0u8; reply.reply_len as usize],
        };
    }

    let (status_ok, mut buf) = match state {
        HandleState::AwaitingBody { status_ok, buf, .. } => (status_ok, buf),
        HandleState::Completed => return Err(Error::Protocol("handle already completed")),
        HandleState::AwaitingHeader => unreachable!("handled above"),
    };

    if !status_ok {
        return Err(Error::Remote);
    }
    ioutil::read_all(&mut handle.stream, &mut buf)?;
    Ok(buf)
}

/// Non-blocking reply retrieval: drains whatever is currently available and returns
/// [`PollResult::Again`] if the reply is not yet fully buffered.
pub fn poll(handle: &mut CallHandle) -> Option<PollResult> {
    match try_poll(handle) {
        Ok(result) => Some(result),
        Err(err) => warn_none(err),
    }
}

fn try_poll(handle: &mut CallHandle) -> Result<PollResult, Error> {
    let mut state = std::mem::replace(&mut handle.state, HandleState::Completed);

    if matches!(state, HandleState::AwaitingHeader) {
        let available = ioutil::bytes_available(&handle.stream)?;
        if available < REPLY_HEADER_LEN {
            handle.state = HandleState::AwaitingHeader;
            return Ok(PollResult::Again);
        }
        let reply = Reply::read(&mut handle.stream)?;
        state = HandleState::AwaitingBody {
            status_ok: reply.ok,
            pos: 0,
            buf: vec![0u8; reply.reply_len as usize],
        };
    }

    let (status_ok, mut pos, mut buf) = match state {
        HandleState::AwaitingBody { status_ok, pos, buf } => (status_ok, pos, buf),
        HandleState::Completed => return Err(Error::Protocol("handle already completed")),
        HandleState::AwaitingHeader => unreachable!("handled above"),
    };

    if !status_ok {
        return Err(Error::Remote);
    }

    if pos < buf.len() {
        let remaining = buf.len() - pos;
        let avail = ioutil::bytes_available(&handle.stream)?;
        if avail > remaining {
            warn!(
                "remotethread WARNING: {} extra byte(s) beyond reply_len, ignoring",
                avail - remaining
            );
        }
        match ioutil::read_available(&mut handle.stream, &mut buf[pos..])? {
            None => {
                handle.state = HandleState::AwaitingBody { status_ok, pos, buf };
                return Ok(PollResult::Again);
            }
            Some(n) => pos += n,
        }
    }

    if pos < buf.len() {
        handle.state = HandleState::AwaitingBody { status_ok, pos, buf };
        return Ok(PollResult::Again);
    }

    Ok(PollResult::Ready(buf))
}

/// Closes the socket and discards any partial-reply buffer. Further use of `handle` after this
/// is a programmer fault; `handle` is consumed so the type system forbids it.
pub fn destroy(handle: CallHandle) {
    drop(handle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || TcpStream::connect(addr).unwrap());
        let (server, _) = listener.accept().unwrap();
        (server, client.join().unwrap())
    }

    #[test]
    fn wait_reads_header_then_body() {
        let (mut server, client) = connected_pair();
        let mut handle = CallHandle {
            stream: client,
            state: HandleState::AwaitingHeader,
        };
        let payload = b"hello worker";
        thread::spawn(move || {
            Reply::ok(payload.len() as u32).write(&mut server).unwrap();
            server.write_all(payload).unwrap();
        });
        let reply = wait(&mut handle).unwrap();
        assert_eq!(reply, payload);
    }

    #[test]
    fn wait_surfaces_remote_error() {
        let (mut server, client) = connected_pair();
        let mut handle = CallHandle {
            stream: client,
            state: HandleState::AwaitingHeader,
        };
        thread::spawn(move || {
            Reply::error().write(&mut server).unwrap();
        });
        assert!(wait(&mut handle).is_none());
    }

    #[test]
    fn poll_returns_again_until_reply_is_complete() {
        let (mut server, client) = connected_pair();
        let mut handle = CallHandle {
            stream: client,
            state: HandleState::AwaitingHeader,
        };
        handle
            .stream
            .set_nonblocking(true)
            .expect("set_nonblocking");

        assert!(matches!(poll(&mut handle), Some(PollResult::Again)));

        let payload = vec![7u8; 4096];
        let payload_clone = payload.clone();
        thread::spawn(move || {
            Reply::ok(payload_clone.len() as u32).write(&mut server).unwrap();
            server.write_all(&payload_clone).unwrap();
        });

        let mut result = None;
        for _ in 0..10_000 {
            match poll(&mut handle) {
                Some(PollResult::Again) => continue,
                Some(PollResult::Ready(buf)) => {
                    result = Some(buf);
                    break;
                }
                None => panic!("poll reported an error"),
            }
        }
        assert_eq!(result, Some(payload));
    }
}
