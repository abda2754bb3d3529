//! remotethread offloads a function call, together with a snapshot of a dedicated region of the
//! caller's heap, to a worker process running the same binary on a remote machine.
//!
//! Logically this crate has these parts:
//! * [`region`]: a fixed-base linear allocator with a coalescing free list. All memory reachable
//!   by a shipped call lives here, so a call can be transported as a flat byte-range copy.
//! * [`proto`]: the three wire messages (`Hello`, `Call`, `Reply`) and the deflate wrapper used to
//!   compress a region snapshot for transport.
//! * [`client`]: `call`/`wait`/`poll`/`destroy`, the caller-facing half of the protocol.
//! * [`slave`]: the callee-facing half, run by a freshly exec'd replica of the caller's binary.
//! * [`init`]: argv scanning, the `--remotethread`/`--remotethread-slave` CLI convention, and the
//!   process-global [`Options`](init::Options) singleton.
//!
//! A program that wants to hand work to remote workers links this crate, calls [`init::init`]
//! before doing anything else, and then uses [`client::call`] wherever it would otherwise have
//! spawned a local thread.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

pub mod client;
pub mod error;
pub mod init;
pub mod ioutil;
pub mod log_init;
pub mod proto;
pub mod region;
pub mod slave;

pub use crate::client::{call, destroy, poll, wait, CallHandle, PollResult};
pub use crate::error::{Error, Result};
pub use crate::init::{init, init_from, options, Options};
pub use crate::region::{alloc, free, realloc};
pub use crate::slave::{alloc_reply, RemoteThreadFn};
