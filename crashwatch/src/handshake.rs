//! Bounded wait for the monitor's readiness byte.

use std::io::{self, Read};
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use os_pipe::PipeReader;

use crate::error::ErrorKind;

/// Blocks until one byte arrives on `ready`, the writer side closes, or
/// `timeout` elapses.
pub(crate) fn wait_ready(mut ready: PipeReader, timeout: Duration) -> Result<(), ErrorKind> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ErrorKind::HandshakeTimeout(timeout));
        }

        let mut pfd = libc::pollfd {
            fd: ready.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // round up so a sub-millisecond remainder still waits
        let millis = remaining.as_nanos().div_ceil(1_000_000).min(libc::c_int::MAX as u128);
        let ret = unsafe { libc::poll(&mut pfd, 1, millis as libc::c_int) };
        if ret == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(ErrorKind::Handshake(err));
        }
        if ret == 0 {
            continue;
        }

        let mut byte = [0u8; 1];
        return match ready.read(&mut byte) {
            Ok(0) => Err(ErrorKind::MonitorClosedHandshake),
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => Err(ErrorKind::Handshake(e)),
        };
    }
}
