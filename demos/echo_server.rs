//! A TCP echo server driven entirely by hooked, cooperative I/O.
//!
//! Grounded in `examples/original_source/examples/echo_server.cpp`: bind,
//! spawn an accept-loop fiber, and hand each accepted connection to its own
//! fiber that echoes back whatever it reads until the peer closes. The
//! original wraps a `Socket`/`TcpServer` abstraction around the same
//! accept/recv/send cycle; this binary talks to `corovisor-hook`'s overrides
//! directly, since those wrapper layers are out of scope for this crate.
//!
//! Run with `cargo run --example echo_server -- 127.0.0.1:8020`, then
//! `nc 127.0.0.1 8020` in another terminal.

use std::env;
use std::mem;
use std::net::TcpListener;
use std::os::unix::io::IntoRawFd;

use corovisor::io::IOManager;

fn main() {
    env_logger::init();

    let addr = env::args().nth(1).unwrap_or_else(|| "127.0.0.1:8020".to_string());
    let listener = TcpListener::bind(&addr).expect("failed to bind echo server address");
    log::info!("echo server listening on {addr}");
    let listener_fd = listener.into_raw_fd();

    let io = IOManager::new(4, true, "echo-server").expect("failed to start the IO reactor");
    corovisor_hook::install(&io);

    let io_for_accept = io.clone();
    io.scheduler().schedule_callback(move || {
        loop {
            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let fd = unsafe {
                corovisor_hook::accept(
                    listener_fd,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                )
            };
            if fd < 0 {
                log::warn!("accept failed: {}", std::io::Error::last_os_error());
                continue;
            }
            log::info!("accepted connection on fd {fd}");
            io_for_accept.scheduler().schedule_callback(move || echo_session(fd));
        }
    });

    io.run();
}

/// Reads up to 1024 bytes at a time and writes them straight back, the same
/// read-then-echo loop the original's `EchoServer::handleClient` runs per
/// accepted socket, until the peer closes or errors out.
fn echo_session(fd: i32) {
    let mut buf = [0u8; 1024];
    loop {
        let n = unsafe { corovisor_hook::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            if n < 0 {
                log::info!("fd {fd} read error: {}", std::io::Error::last_os_error());
            } else {
                log::info!("fd {fd} closed by peer");
            }
            break;
        }
        let mut written = 0usize;
        while written < n as usize {
            let w = unsafe {
                corovisor_hook::write(
                    fd,
                    buf[written..n as usize].as_ptr() as *const libc::c_void,
                    n as usize - written,
                )
            };
            if w <= 0 {
                log::info!("fd {fd} write error: {}", std::io::Error::last_os_error());
                unsafe { corovisor_hook::close(fd) };
                return;
            }
            written += w as usize;
        }
    }
    unsafe { corovisor_hook::close(fd) };
}
