//! End-to-end exercise of the wire protocol and the `call`/`wait`/`poll` client surface against a
//! stand-in peer that plays the roles of both the server and the slave: it accepts the
//! connection, validates `Hello`, decompresses the `Call` payload, and replies, without spawning
//! a second OS process. The snapshot/compression pipeline is exercised for real; only the final
//! "exec a fresh binary" hop of a real deployment is stood in for, since that requires a second
//! process with its own region at the same fixed base.

use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use remotethread::proto::{self, Call, Hello, Reply};
use remotethread::{CallHandle, PollResult};

// All tests in this file bind the same well-known port and share the process-global region and
// server list; run them one at a time.
static TEST_LOCK: Mutex<()> = Mutex::new(());

// Never actually invoked by the stand-in peer below; `call` only needs a valid function pointer
// of the right shape to embed its address on the wire.
extern "C" fn unused_func(_param: *const u8, _param_len: usize, _out_reply_len: *mut usize) -> *mut u8 {
    std::ptr::null_mut()
}

fn configure_single_server() {
    remotethread::init_from(vec![
        std::env::current_exe().unwrap().to_string_lossy().into_owned(),
        "--remotethread".to_string(),
        "127.0.0.1".to_string(),
    ]);
}

/// Binds the well-known test port, retrying once after a short sleep in case a prior test's
/// listener is still being torn down asynchronously. Returns `None` if both attempts fail.
fn bind_test_port() -> Option<TcpListener> {
    TcpListener::bind("127.0.0.1:12950").ok().or_else(|| {
        thread::sleep(Duration::from_millis(50));
        TcpListener::bind("127.0.0.1:12950").ok()
    })
}

/// Runs the handshake and one call/reply cycle over an already-accepted connection, replying with
/// `transform` applied to the decompressed parameter bytes.
fn handle_connection_with<F: Fn(&[u8]) -> Vec<u8>>(mut stream: TcpStream, transform: F) {
    let hello = Hello::read(&mut stream).unwrap();
    let mut binary = vec![0u8; hello.binary_len as usize];
    remotethread::ioutil::read_all(&mut stream, &mut binary).unwrap();

    let call = Call::read(&mut stream).unwrap();
    let mut compressed = vec![0u8; call.alloc_compr_len as usize];
    remotethread::ioutil::read_all(&mut stream, &mut compressed).unwrap();

    let mut region_image = vec![0u8; call.alloc_len as usize];
    proto::decompress_region(&compressed, &mut region_image).unwrap();

    let param_offset = call.param as usize - remotethread::region::BASE;
    let param = &region_image[param_offset..param_offset + call.param_len as usize];
    let reply = transform(param);

    Reply::ok(reply.len() as u32).write(&mut stream).unwrap();
    stream.write_all(&reply).unwrap();
}

/// Accepts one connection and replies with the parameter bytes reversed — an arbitrary,
/// easy-to-check transform distinct from an identity echo.
fn serve_one(listener: TcpListener) {
    let (stream, _) = listener.accept().unwrap();
    handle_connection_with(stream, |param| param.iter().rev().copied().collect());
}

/// Accepts `count` connections in sequence, replying to each with `out[i] = in[i] ^ in[i + half]`
/// for `i` in `[0, half)`, matching `demos/xor/main.rs`'s `xor_func`.
fn serve_xor(listener: TcpListener, count: usize) {
    for _ in 0..count {
        let (stream, _) = listener.accept().unwrap();
        handle_connection_with(stream, |param| {
            let half = param.len() / 2;
            (0..half).map(|i| param[i] ^ param[i + half]).collect()
        });
    }
}

/// Accepts one connection, fully drains the handshake and call payload, then replies with an
/// error status instead of a reply body.
fn serve_one_error(listener: TcpListener) {
    let (mut stream, _) = listener.accept().unwrap();
    let hello = Hello::read(&mut stream).unwrap();
    let mut binary = vec![0u8; hello.binary_len as usize];
    remotethread::ioutil::read_all(&mut stream, &mut binary).unwrap();
    let call = Call::read(&mut stream).unwrap();
    let mut compressed = vec![0u8; call.alloc_compr_len as usize];
    remotethread::ioutil::read_all(&mut stream, &mut compressed).unwrap();
    Reply::error().write(&mut stream).unwrap();
}

#[test]
fn call_and_wait_round_trip_through_a_stand_in_peer() {
    let _guard = TEST_LOCK.lock().unwrap();
    configure_single_server();

    let Some(listener) = bind_test_port() else {
        eprintln!("skipping: could not bind 127.0.0.1:12950");
        return;
    };
    let server_thread = thread::spawn(move || serve_one(listener));

    let param = b"the quick brown fox".to_vec();
    let mut handle: CallHandle = remotethread::call(unused_func, &param).expect("call should succeed");
    let reply = remotethread::wait(&mut handle).expect("wait should succeed");
    remotethread::destroy(handle);

    let expected: Vec<u8> = param.iter().rev().copied().collect();
    assert_eq!(reply, expected);

    server_thread.join().unwrap();
}

#[test]
fn poll_eventually_completes_for_a_real_call() {
    let _guard = TEST_LOCK.lock().unwrap();
    configure_single_server();

    let Some(listener) = bind_test_port() else {
        eprintln!("skipping: could not bind 127.0.0.1:12950");
        return;
    };
    let server_thread = thread::spawn(move || serve_one(listener));

    let param = b"poll me".to_vec();
    let mut handle: CallHandle = remotethread::call(unused_func, &param).expect("call should succeed");

    let mut transitions_to_ready = 0;
    let mut reply = None;
    for _ in 0..100_000 {
        match remotethread::poll(&mut handle) {
            Some(PollResult::Again) => continue,
            Some(PollResult::Ready(buf)) => {
                transitions_to_ready += 1;
                reply = Some(buf);
                break;
            }
            None => panic!("poll reported an error"),
        }
    }
    remotethread::destroy(handle);

    assert_eq!(transitions_to_ready, 1);
    let expected: Vec<u8> = param.iter().rev().copied().collect();
    assert_eq!(reply, Some(expected));

    server_thread.join().unwrap();
}

/// Scenario 1: a 1 MiB buffer filled from a seeded PRNG, split into 8 chunks of 128 KiB, each
/// shipped through a real `call`/`wait` round trip; the worker XORs the two 64 KiB halves of each
/// chunk and every reply must match the same computation done locally.
#[test]
fn xor_halves_over_loopback_matches_local_computation() {
    let _guard = TEST_LOCK.lock().unwrap();
    configure_single_server();

    const BUFFER_LEN: usize = 1024 * 1024;
    const CHUNKS: usize = 8;
    const CHUNK_LEN: usize = BUFFER_LEN / CHUNKS;
    const HALF: usize = CHUNK_LEN / 2;

    let mut rng = StdRng::seed_from_u64(0);
    let mut buf = vec![0u8; BUFFER_LEN];
    rng.fill(&mut buf[..]);

    let Some(listener) = bind_test_port() else {
        eprintln!("skipping: could not bind 127.0.0.1:12950");
        return;
    };
    let server_thread = thread::spawn(move || serve_xor(listener, CHUNKS));

    let mut replies = Vec::with_capacity(CHUNKS);
    for chunk in buf.chunks(CHUNK_LEN) {
        let mut handle = remotethread::call(unused_func, chunk).expect("call should succeed");
        let reply = remotethread::wait(&mut handle).expect("wait should succeed");
        remotethread::destroy(handle);
        replies.push(reply);
    }

    server_thread.join().unwrap();

    for (i, reply) in replies.iter().enumerate() {
        assert_eq!(reply.len(), HALF, "chunk {i}: reply should be exactly {HALF} bytes");
        let chunk = &buf[i * CHUNK_LEN..(i + 1) * CHUNK_LEN];
        let expected: Vec<u8> = (0..HALF).map(|j| chunk[j] ^ chunk[j + HALF]).collect();
        assert_eq!(*reply, expected, "chunk {i}: reply does not match local XOR");
    }
}

/// Scenario 5: the worker reports failure (`Reply.status == Error`); `wait` must surface that as
/// `None` rather than the reply bytes.
#[test]
fn server_error_over_loopback_surfaces_as_none() {
    let _guard = TEST_LOCK.lock().unwrap();
    configure_single_server();

    let Some(listener) = bind_test_port() else {
        eprintln!("skipping: could not bind 127.0.0.1:12950");
        return;
    };
    let server_thread = thread::spawn(move || serve_one_error(listener));

    let param = b"anything".to_vec();
    let mut handle: CallHandle = remotethread::call(unused_func, &param).expect("call should succeed");
    assert!(remotethread::wait(&mut handle).is_none());
    remotethread::destroy(handle);

    server_thread.join().unwrap();
}
