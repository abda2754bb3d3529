//! Byte I/O helpers shared by the client and slave halves of the protocol: retrying reads/writes
//! over a raw socket, and a "how many bytes can I read right now without blocking" query used by
//! [`crate::client::poll`].

use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::AsRawFd;

/// Number of bytes currently readable from `stream` without blocking, via `ioctl(FIONREAD)`.
pub fn bytes_available<S: AsRawFd>(stream: &S) -> io::Result<usize> {
    let mut avail: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(stream.as_raw_fd(), libc::FIONREAD, &mut avail) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(avail as usize)
}

/// Read exactly `buf.len()` bytes, retrying on `Interrupted`. Fails on EOF before `buf` is full.
pub fn read_all<R: Read>(stream: &mut R, buf: &mut [u8]) -> io::Result<()> {
    let mut pos = 0;
    while pos < buf.len() {
        match stream.read(&mut buf[pos..]) {
            Ok(0) => {
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "unexpected EOF"));
            }
            Ok(n) => pos += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Write all of `buf`, retrying on `Interrupted`.
pub fn write_all<W: Write>(stream: &mut W, buf: &[u8]) -> io::Result<()> {
    let mut pos = 0;
    while pos < buf.len() {
        match stream.write(&buf[pos..]) {
            Ok(0) => {
                return Err(io::Error::new(ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => pos += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Read up to `buf.len()` bytes that are already known to be available (the caller checks
/// [`bytes_available`] first), retrying on `Interrupted`. Returns `Ok(None)` if the very first
/// read attempt would block rather than the `-1`-cast-to-`usize` the original C helper returned
/// on error; this crate never has to disambiguate "zero bytes" from "an error" by sign.
pub fn read_available<R: Read>(stream: &mut R, buf: &mut [u8]) -> io::Result<Option<usize>> {
    let mut pos = 0;
    loop {
        match stream.read(&mut buf[pos..]) {
            Ok(0) if pos == 0 => {
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "unexpected EOF"));
            }
            Ok(0) => return Ok(Some(pos)),
            Ok(n) => {
                pos += n;
                if pos == buf.len() {
                    return Ok(Some(pos));
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock && pos == 0 => return Ok(None),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Some(pos)),
            Err(e) => return Err(e),
        }
    }
}
