//! The three framed wire messages exchanged over a single TCP stream per call, and the deflate
//! wrapper used to compress/decompress a region snapshot for transport.
//!
//! All multi-byte integers are big-endian ("network byte order"), except `Call::param` and
//! `Call::eip`: those are raw addresses, meaningful only because the caller and worker share a
//! binary and a region base, and are sent in the host's native byte order exactly as the
//! reference implementation wrote them (it never byte-swapped `eip`). Heterogeneous-endian
//! caller/worker pairs are out of scope (see Non-goals).

use byteorder::{BigEndian, NativeEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::error::{Error, Result};

/// Magic value identifying the start of a `Hello` frame.
pub const MAGIC: u32 = 0x4A33DE22;
/// The argv[1] sentinel that switches a freshly exec'd process into slave mode.
pub const SLAVE_ARG: &str = "--remotethread-slave";
/// Default TCP port the server listens on and the client connects to.
pub const DEFAULT_PORT: u16 = 12950;

const STATUS_OK: u8 = 1;
const STATUS_ERROR: u8 = 2;

/// client -> server, first frame on the connection.
pub struct Hello {
    pub binary_len: u32,
}

impl Hello {
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<BigEndian>(MAGIC)?;
        w.write_u32::<BigEndian>(self.binary_len)
    }

    /// Reads and validates the magic. Returns `Protocol` if it does not match.
    pub fn read<R: Read>(r: &mut R) -> Result<Hello> {
        let magic = r.read_u32::<BigEndian>()?;
        if magic != MAGIC {
            return Err(Error::Protocol("invalid magic"));
        }
        let binary_len = r.read_u32::<BigEndian>()?;
        Ok(Hello { binary_len })
    }
}

/// client -> slave, sent right after the slave has been exec'd and its socket inherited.
pub struct Call {
    /// Length in bytes of the region at snapshot time (`L`).
    pub alloc_len: u32,
    /// Length in bytes of the deflate-compressed region image that follows this header.
    pub alloc_compr_len: u32,
    /// Length in bytes of the parameter buffer, which lies inside the region.
    pub param_len: u32,
    /// Virtual address of the parameter buffer, within `[B, B + alloc_len)`. Sent host-order.
    pub param: u64,
    /// Virtual address of the function to invoke. Sent host-order; never translated.
    pub eip: u64,
}

impl Call {
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<BigEndian>(self.alloc_len)?;
        w.write_u32::<BigEndian>(self.alloc_compr_len)?;
        w.write_u32::<BigEndian>(self.param_len)?;
        w.write_u64::<NativeEndian>(self.param)?;
        w.write_u64::<NativeEndian>(self.eip)
    }

    pub fn read<R: Read>(r: &mut R) -> io::Result<Call> {
        let alloc_len = r.read_u32::<BigEndian>()?;
        let alloc_compr_len = r.read_u32::<BigEndian>()?;
        let param_len = r.read_u32::<BigEndian>()?;
        let param = r.read_u64::<NativeEndian>()?;
        let eip = r.read_u64::<NativeEndian>()?;
        Ok(Call {
            alloc_len,
            alloc_compr_len,
            param_len,
            param,
            eip,
        })
    }
}

/// slave -> client, the final frame on the connection.
pub struct Reply {
    pub ok: bool,
    pub reply_len: u32,
}

impl Reply {
    pub fn ok(reply_len: u32) -> Reply {
        Reply {
            ok: true,
            reply_len,
        }
    }

    pub fn error() -> Reply {
        Reply {
            ok: false,
            reply_len: 0,
        }
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u8(if self.ok { STATUS_OK } else { STATUS_ERROR })?;
        w.write_u32::<BigEndian>(self.reply_len)
    }

    pub fn read<R: Read>(r: &mut R) -> Result<Reply> {
        let status = r.read_u8()?;
        let reply_len = r.read_u32::<BigEndian>()?;
        match status {
            STATUS_OK => Ok(Reply {
                ok: true,
                reply_len,
            }),
            STATUS_ERROR => Err(Error::Remote),
            _ => Err(Error::Protocol("unknown reply status")),
        }
    }
}

/// Byte length of a `Reply` header on the wire (status + reply_len), used by
/// [`crate::client::poll`] to know when a header is fully buffered.
pub const REPLY_HEADER_LEN: usize = 1 + 4;

/// Deflate `region` (default compression level) into a freshly allocated, off-region buffer.
/// The `Vec` used here is ordinary process heap memory, never the region's own allocator, so
/// compressing never perturbs the snapshot it is compressing.
pub fn compress_region(region: &[u8]) -> io::Result<Vec<u8>> {
    use flate2::write::DeflateEncoder;
    use flate2::Compression;

    let mut encoder = DeflateEncoder::new(Vec::with_capacity(region.len() / 2), Compression::default());
    encoder.write_all(region)?;
    encoder.finish()
}

/// Inflate exactly `compressed` into `dst`, which must already be sized to the expected
/// decompressed length. Fails unless the inflate consumes all of `compressed` and fills all of
/// `dst` exactly (§ "If the inflate does not terminate exactly with both input and output
/// exhausted, fail").
pub fn decompress_region(compressed: &[u8], dst: &mut [u8]) -> Result<()> {
    use flate2::{Decompress, FlushDecompress, Status};

    let mut decomp = Decompress::new(false);
    let status = decomp
        .decompress(compressed, dst, FlushDecompress::Finish)
        .map_err(|_| Error::Protocol("inflate failed"))?;

    if status != Status::StreamEnd
        || decomp.total_in() as usize != compressed.len()
        || decomp.total_out() as usize != dst.len()
    {
        return Err(Error::Protocol(
            "inflate did not exhaust both input and output",
        ));
    }
    Ok(())
}
