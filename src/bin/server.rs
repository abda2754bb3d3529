//! Standalone accept-loop server: the external collaborator described by the core crate's server
//! boundary. Reads `Hello`, writes the shipped executable to a temp path, and execs it in slave
//! mode with the accepted socket inherited as an open file descriptor.

use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::process::Command;
use std::thread;

use clap::Parser;
use remotethread::proto::{self, Hello, Reply};

#[derive(Parser)]
#[command(name = "remotethread-server", about = "Accepts remotethread calls and execs workers")]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value_t = default_listen())]
    listen: SocketAddr,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], proto::DEFAULT_PORT))
}

fn main() {
    // `init` strips `--remotethread`/`--remotethread-slave` before clap ever sees argv.
    let remaining = remotethread::init();
    let cli = Cli::parse_from(remaining);

    let listener = match TcpListener::bind(cli.listen) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("remotethread-server: unable to bind {}: {e}", cli.listen);
            std::process::exit(1);
        }
    };
    log::info!("remotethread-server listening on {}", cli.listen);

    for conn in listener.incoming() {
        match conn {
            Ok(stream) => {
                thread::spawn(move || handle_connection(stream));
            }
            Err(e) => log::warn!("accept failed: {e}"),
        }
    }
}

fn handle_connection(mut stream: TcpStream) {
    if let Err(e) = process(&mut stream) {
        log::warn!("connection failed: {e}");
        let _ = Reply::error().write(&mut stream);
    }
}

fn process(stream: &mut TcpStream) -> std::io::Result<()> {
    let hello = Hello::read(stream).map_err(std::io::Error::other)?;

    let mut binary = vec![0u8; hello.binary_len as usize];
    remotethread::ioutil::read_all(stream, &mut binary)?;

    let path = format!("/tmp/remotethread-{}", std::process::id());
    {
        let mut f = std::fs::File::create(&path)?;
        f.write_all(&binary)?;
    }
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;

    let fd = stream.as_raw_fd();
    clear_cloexec(fd);

    let status = Command::new(&path)
        .arg(proto::SLAVE_ARG)
        .arg(fd.to_string())
        .status();

    let _ = std::fs::remove_file(&path);

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(std::io::Error::other(format!("slave exited with {status}"))),
        Err(e) => Err(e),
    }
}

/// The accepted socket may carry `FD_CLOEXEC` (Rust sets it by default on sockets it creates);
/// clear it so the spawned slave inherits an open, connected fd across `exec`.
fn clear_cloexec(fd: i32) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
        }
    }
}
