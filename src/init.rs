//! Process-wide initialization: captures the path to the running binary, scans argv for the
//! `--remotethread <ipv4>` server list and the `--remotethread-slave <fd>` dispatch sentinel, and
//! bootstraps the built-in logger.
//!
//! `init` must be the first thing a host program calls. If it detects the slave sentinel it never
//! returns: it runs the slave entry point and exits the process.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::log_init;
use crate::proto::SLAVE_ARG;

const MAX_SERVERS: usize = 16;

lazy_static! {
    static ref SERVERS: Mutex<Vec<Ipv4Addr>> = Mutex::new(Vec::with_capacity(MAX_SERVERS));
    static ref OWN_BINARY: Mutex<Option<PathBuf>> = Mutex::new(None);
}

static WARNED_NO_SERVERS: AtomicBool = AtomicBool::new(false);

/// Scans `std::env::args()`, consuming and removing every `--remotethread`/`--remotethread-slave`
/// argument, and returns what remains for the host program's own CLI parsing.
///
/// If argv requests slave mode, this dispatches to [`crate::slave::run`] and the process exits
/// from within that call; `init` never returns in that case.
pub fn init() -> Vec<String> {
    init_from(std::env::args())
}

/// Same as [`init`], but scans an explicit argument list instead of the process's real argv.
/// Exists mainly so tests and embedders that already have an argument list in hand (rather than
/// wanting to re-read `std::env::args()`) can drive initialization directly, the same way
/// `clap`'s `Parser::parse_from` complements `Parser::parse`.
pub fn init_from(argv: impl IntoIterator<Item = String>) -> Vec<String> {
    log_init::try_init();

    let mut iter = argv.into_iter();
    let own_binary = iter.next().unwrap_or_default();
    let own_binary_path = PathBuf::from(&own_binary);
    warn_if_position_independent(&own_binary_path);
    *OWN_BINARY.lock().unwrap() = Some(own_binary_path);

    let mut remaining = vec![own_binary];
    let mut args = iter.peekable();

    if let Some(first) = args.peek() {
        if first == SLAVE_ARG {
            args.next();
            let fd_arg = args
                .next()
                .unwrap_or_else(|| panic!("{SLAVE_ARG} requires a file descriptor argument"));
            let fd: i32 = fd_arg
                .parse()
                .unwrap_or_else(|_| panic!("{SLAVE_ARG}: {fd_arg:?} is not a valid fd"));
            crate::slave::run(fd);
            unreachable!("slave::run exits the process");
        }
    }

    while let Some(arg) = args.next() {
        if arg == "--remotethread" {
            match args.next() {
                Some(ip) => add_server(&ip),
                None => warn!("remotethread WARNING: --remotethread requires an address argument"),
            }
            continue;
        }
        remaining.push(arg);
    }
    remaining
}

/// Best-effort check that `path`'s ELF header isn't `ET_DYN` (a position-independent
/// executable). The fixed-base region assumption requires every participating binary to load at
/// the same address on every run, which PIE/ASLR builds don't guarantee. Any failure to open or
/// parse the file (missing path, non-ELF target, a test harness's synthetic argv[0]) is silently
/// ignored; this is a diagnostic, not a gate.
fn warn_if_position_independent(path: &PathBuf) {
    use std::io::Read;

    const ET_DYN: u16 = 3;

    let Ok(mut file) = std::fs::File::open(path) else {
        return;
    };
    let mut ident = [0u8; 18];
    if file.read_exact(&mut ident).is_err() {
        return;
    }
    if &ident[0..4] != b"\x7fELF" {
        return;
    }
    let e_type = u16::from_le_bytes([ident[16], ident[17]]);
    if e_type == ET_DYN {
        warn!(
            "remotethread WARNING: {} is a position-independent executable (ELF type ET_DYN); \
             the fixed-base region assumption requires a non-PIE build or disabled ASLR",
            path.display()
        );
    }
}

fn add_server(ip: &str) {
    let Ok(addr) = ip.parse::<Ipv4Addr>() else {
        warn!("remotethread WARNING: {ip:?} is not a valid IPv4 address, ignoring");
        return;
    };
    let mut servers = SERVERS.lock().unwrap();
    if servers.len() >= MAX_SERVERS {
        warn!("remotethread WARNING: already have {MAX_SERVERS} servers, ignoring {addr}");
        return;
    }
    servers.push(addr);
}

/// The configured server list, in the order `--remotethread` flags appeared.
pub(crate) fn servers() -> Vec<Ipv4Addr> {
    SERVERS.lock().unwrap().clone()
}

/// Path to the running binary, as captured from argv[0] at `init` time.
pub(crate) fn own_binary() -> Option<PathBuf> {
    OWN_BINARY.lock().unwrap().clone()
}

/// A snapshot of the ambient configuration [`init`]/[`init_from`] builds from argv: the
/// configured server list and the path to the running binary. `client::call` reads the live
/// `SERVERS`/`OWN_BINARY` globals directly rather than this snapshot, since those can change
/// between calls; `Options` exists for callers (and tests) that just want to inspect the current
/// configuration without poking at crate-private statics.
#[derive(Debug, Clone)]
pub struct Options {
    pub servers: Vec<Ipv4Addr>,
    pub own_binary: Option<PathBuf>,
}

/// Snapshot of the process-global [`Options`] as they stand right now.
pub fn options() -> Options {
    Options {
        servers: servers(),
        own_binary: own_binary(),
    }
}

/// Logs the "no servers defined" warning exactly once across the life of the process, regardless
/// of how many times a caller retries `call` against an empty server list.
pub(crate) fn warn_no_servers_once() {
    if WARNED_NO_SERVERS
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        warn!("remotethread WARNING: no servers defined! use --remotethread <ip>");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_remotethread_flags_and_keeps_the_rest() {
        let argv = vec![
            "myprog".to_string(),
            "--remotethread".to_string(),
            "10.0.0.1".to_string(),
            "--verbose".to_string(),
            "--remotethread".to_string(),
            "10.0.0.2".to_string(),
        ];
        let remaining = init_from(argv);
        assert_eq!(remaining, vec!["myprog".to_string(), "--verbose".to_string()]);
    }

    #[test]
    fn rejects_malformed_address() {
        let argv = vec![
            "myprog".to_string(),
            "--remotethread".to_string(),
            "not-an-ip".to_string(),
        ];
        let before = servers().len();
        init_from(argv);
        assert_eq!(servers().len(), before);
    }
}
