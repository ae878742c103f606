//! TCP socket tuning.
//!
//! Generic socket-level knobs applied to accepted streams and to the
//! listening socket, independent of what runs above the byte stream.
//!
//! # Safety
//!
//! This module uses unsafe code to access raw file descriptors/sockets for
//! socket configuration. The unsafe operations are encapsulated and safe
//! to use from the public API.

#![allow(unsafe_code)]

use std::io;
use std::net::Shutdown;

use compio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::config::TcpConfig;

#[cfg(unix)]
fn with_borrowed_socket<T, R>(
    io: &T,
    f: impl FnOnce(&socket2::Socket) -> io::Result<R>,
) -> io::Result<R>
where
    T: std::os::unix::io::AsRawFd,
{
    use std::os::unix::io::FromRawFd;
    let sock = unsafe { socket2::Socket::from_raw_fd(io.as_raw_fd()) };
    let out = f(&sock);
    std::mem::forget(sock); // Don't close the fd
    out
}

#[cfg(windows)]
fn with_borrowed_socket<T, R>(
    io: &T,
    f: impl FnOnce(&socket2::Socket) -> io::Result<R>,
) -> io::Result<R>
where
    T: std::os::windows::io::AsRawSocket,
{
    use std::os::windows::io::FromRawSocket;
    let sock = unsafe { socket2::Socket::from_raw_socket(io.as_raw_socket()) };
    let out = f(&sock);
    std::mem::forget(sock); // Don't close the socket
    out
}

/// Apply per-connection options to a freshly accepted stream.
///
/// Disables Nagle for latency and arms TCP keepalive when configured.
///
/// # Errors
///
/// Returns an error if a socket option cannot be set.
pub fn tune_stream(stream: &TcpStream, config: &TcpConfig) -> io::Result<()> {
    #[cfg(any(unix, windows))]
    {
        with_borrowed_socket(stream, |sock| {
            sock.set_nodelay(true)?;
            if config.tcp_keepalive {
                let keepalive = socket2::TcpKeepalive::new()
                    .with_time(config.tcp_keepalive_time)
                    .with_interval(config.keepalive_interval);
                sock.set_tcp_keepalive(&keepalive)?;
            }
            Ok(())
        })
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = (stream, config);
        Ok(())
    }
}

/// Apply listener-level options after bind.
///
/// Re-issues `listen(2)` with the configured backlog (a no-op where the OS
/// ignores it) and runs the caller's `on_socket_created` hook for
/// OS-specific tuning.
///
/// # Errors
///
/// Returns an error if the backlog cannot be applied or the hook fails.
pub fn tune_listener(listener: &TcpListener, config: &TcpConfig) -> io::Result<()> {
    #[cfg(any(unix, windows))]
    {
        with_borrowed_socket(listener, |sock| {
            sock.listen(i32::try_from(config.backlog).unwrap_or(i32::MAX))?;
            if let Some(hook) = &config.on_socket_created {
                hook(sock);
            }
            if config.debug_tcp_log {
                debug!("[Tcp] Listener tuned, backlog {}", config.backlog);
            }
            Ok(())
        })
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = (listener, config);
        Ok(())
    }
}

/// Shut down one or both directions of a connected stream.
///
/// Used by the close path to wake a worker blocked in a socket receive;
/// the kernel socket itself is released when the last handle drops.
///
/// # Errors
///
/// Returns an error if the shutdown syscall fails (already-closed sockets
/// report `NotConnected`, which callers generally ignore).
pub fn shutdown_stream(stream: &TcpStream, how: Shutdown) -> io::Result<()> {
    #[cfg(any(unix, windows))]
    {
        with_borrowed_socket(stream, |sock| sock.shutdown(how))
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = (stream, how);
        Ok(())
    }
}
