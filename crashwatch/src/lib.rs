// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//!
//! crashwatch makes sure an unhandled crash dump written to standard error
//! is never lost. Call [`CrashWatch::start`] early in `main`: the process
//! re-executes itself as a *monitor*, points its own stderr into a pipe and
//! keeps running. The monitor copies every byte to the original stderr and
//! keeps the most recent ones. When the application exits, the monitor looks
//! for the last `panic: ` or `fatal error: ` dump in what it kept and hands
//! it to the `on_crash` callback.
//!
//! Nothing is intercepted in-process, and whatever was reading stderr before
//! sees the same bytes in the same order.
//!
//! ```no_run
//! use crashwatch::CrashWatch;
//!
//! fn main() {
//!     let watcher = CrashWatch::new()
//!         .on_crash(|crash| {
//!             // runs in the monitor process, after the application died
//!             let _ = std::fs::write("/tmp/last-crash", crash.header_text());
//!         })
//!         .start();
//!
//!     if let Err(err) = watcher {
//!         eprintln!("crash watching disabled: {}", err);
//!     }
//!
//!     // the application proper
//! }
//! ```
//!
//! # Two processes, one `main`
//!
//! The monitor runs the same binary with the same arguments, plus the
//! [`ROLE_MARKER_NAME`] environment variable. Everything before `start` runs
//! in both processes, so the configuration must be built the same way in
//! both: the `on_crash` and `on_monitor_error` callbacks run in the monitor,
//! using the configuration the monitor built for itself. In the monitor,
//! `start` never returns.
//!
//! The marker is inherited by anything the application spawns. Remove it
//! from the environment of children that re-execute this binary and should
//! not become monitors.
//!
//! # Platform support
//!
//! Unix is fully supported. On Windows the handshake timeout is unavailable
//! and is rejected by validation.
//!

mod crash;
mod error;
#[cfg(unix)]
mod handshake;
mod monitor;
mod ring;
mod role;
mod scan;
mod stderr;
mod supervisor;

extern crate cfg_if;

use cfg_if::cfg_if;
use std::env;
use std::fmt;
use std::process::{Command, Stdio};
use std::time::Duration;

use log::debug;

cfg_if! {
    if #[cfg(unix)] {
        extern crate libc;
        use std::io;
        use std::os::unix::io::{AsRawFd, RawFd};
        use std::os::unix::process::CommandExt;
    }
}

pub use self::crash::{CrashError, CrashKind, CrashRecord, StackParser};
pub use self::error::{Error, ErrorKind};
pub use self::role::{Role, ROLE_MARKER_NAME, ROLE_MARKER_VALUE};

use self::stderr::StderrRedirect;

pub const DEFAULT_READ_CHUNK_SIZE: usize = 100_000;
pub const DEFAULT_RETAINED_SIZE: usize = 100_000;

pub(crate) type CrashCallback = Box<dyn FnOnce(CrashRecord) + Send + 'static>;
pub(crate) type ErrorCallback = Box<dyn FnOnce(Error) + Send + 'static>;
pub(crate) type ExitCallback = Box<dyn FnOnce(Result<(), Error>) + Send + 'static>;

/// Handle to the spawned monitor process.
///
/// The monitor is reaped by crashwatch itself, so the handle only carries
/// its process id. Signal or kill the monitor through that id; its death is
/// then reported like any other monitor exit.
#[derive(Debug)]
#[non_exhaustive]
pub struct Watcher {
    pid: u32,
}

impl Watcher {
    /// Process id of the monitor.
    pub fn id(&self) -> u32 {
        self.pid
    }
}

/// What the monitor process needs, rebuilt from its own `main`.
pub(crate) struct MonitorConfig {
    pub(crate) read_chunk_size: usize,
    pub(crate) retained_size: usize,
    pub(crate) handshake: bool,
    pub(crate) on_crash: CrashCallback,
    pub(crate) on_monitor_error: Option<ErrorCallback>,
}

struct Validated {
    monitor: MonitorConfig,
    handshake_timeout: Option<Duration>,
    on_monitor_exit: Option<ExitCallback>,
}

#[derive(Default)]
pub struct CrashWatch {
    read_chunk_size: Option<usize>,
    retained_size: Option<usize>,
    handshake_timeout: Option<Duration>,
    on_crash: Option<CrashCallback>,
    on_monitor_error: Option<ErrorCallback>,
    on_monitor_exit: Option<ExitCallback>,
}

impl fmt::Debug for CrashWatch {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("CrashWatch")
            .field("read_chunk_size", &self.read_chunk_size)
            .field("retained_size", &self.retained_size)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("on_crash", &self.on_crash.is_some())
            .field("on_monitor_error", &self.on_monitor_error.is_some())
            .field("on_monitor_exit", &self.on_monitor_exit.is_some())
            .finish()
    }
}

impl CrashWatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes read per call in the monitor's loop.
    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = Some(size);
        self
    }

    /// Size of the window scanned for a crash dump. A dump longer than this
    /// loses its header and is not reported.
    pub fn retained_size(mut self, size: usize) -> Self {
        self.retained_size = Some(size);
        self
    }

    /// Makes `start` wait up to `timeout` for the monitor to be running.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Called in the monitor process with the last crash dump, if any.
    pub fn on_crash<F: FnOnce(CrashRecord) + Send + 'static>(mut self, f: F) -> Self {
        self.on_crash = Some(Box::new(f));
        self
    }

    /// Called in the monitor process when relaying stderr fails.
    pub fn on_monitor_error<F: FnOnce(Error) + Send + 'static>(mut self, f: F) -> Self {
        self.on_monitor_error = Some(Box::new(f));
        self
    }

    /// Called in this process when the monitor exits, after stderr has been
    /// restored. Without it, the process exits with status 1 instead.
    pub fn on_monitor_exit<F: FnOnce(Result<(), Error>) + Send + 'static>(mut self, f: F) -> Self {
        self.on_monitor_exit = Some(Box::new(f));
        self
    }

    fn validate(self) -> Result<Validated, ErrorKind> {
        let on_crash = self.on_crash.ok_or(ErrorKind::MissingCrashCallback)?;

        let read_chunk_size = match self.read_chunk_size {
            Some(0) => return Err(ErrorKind::ZeroReadChunkSize),
            Some(size) => size,
            None => DEFAULT_READ_CHUNK_SIZE,
        };
        let retained_size = match self.retained_size {
            Some(0) => return Err(ErrorKind::ZeroRetainedSize),
            Some(size) => size,
            None => DEFAULT_RETAINED_SIZE,
        };

        if self.handshake_timeout.is_some() && !cfg!(unix) {
            return Err(ErrorKind::HandshakeUnsupported);
        }

        Ok(Validated {
            monitor: MonitorConfig {
                read_chunk_size,
                retained_size,
                handshake: self.handshake_timeout.is_some(),
                on_crash,
                on_monitor_error: self.on_monitor_error,
            },
            handshake_timeout: self.handshake_timeout,
            on_monitor_exit: self.on_monitor_exit,
        })
    }

    /// Validates the configuration and starts watching.
    ///
    /// In the primary process this spawns the monitor and returns its handle.
    /// In the monitor process it never returns.
    ///
    /// A handshake timeout is reported as an error for which
    /// [`Error::is_timeout`] is true. The monitor keeps running in that case
    /// and stderr stays relayed through it.
    pub fn start(self) -> Result<Watcher, Error> {
        let config = self.validate()?;
        match Role::current() {
            Role::Monitor => monitor::run(config.monitor),
            Role::Primary => start_primary(config),
        }
    }
}

fn start_primary(config: Validated) -> Result<Watcher, Error> {
    let Validated {
        monitor,
        handshake_timeout,
        on_monitor_exit,
    } = config;
    // crash and error callbacks only ever run in the monitor
    drop(monitor);

    let exe = env::current_exe().map_err(ErrorKind::ResolveExecutable)?;
    let (relay_reader, relay_writer) = os_pipe::pipe().map_err(ErrorKind::CreatePipe)?;

    #[cfg(unix)]
    let ready = match handshake_timeout {
        Some(_) => Some(os_pipe::pipe().map_err(ErrorKind::CreatePipe)?),
        None => None,
    };
    #[cfg(not(unix))]
    let _ = handshake_timeout;

    let redirect = StderrRedirect::redirect(relay_writer)?;

    let mut command = Command::new(&exe);
    command
        .args(env::args_os().skip(1))
        .env(ROLE_MARKER_NAME, ROLE_MARKER_VALUE)
        .stdin(Stdio::from(relay_reader))
        .stdout(Stdio::from(redirect.original()?))
        .stderr(Stdio::null());

    #[cfg(unix)]
    prepare_monitor_unix(&mut command, ready.as_ref().map(|(_, writer)| writer.as_raw_fd()));

    let spawned = command.spawn();
    // the command holds our copies of the relay's read end and the original stderr
    drop(command);
    let mut child = spawned.map_err(ErrorKind::SpawnMonitor)?;
    let pid = child.id();
    debug!("spawned monitor process {} from {:?}", pid, exe);

    #[cfg(unix)]
    if let (Some(timeout), Some((reader, writer))) = (handshake_timeout, ready) {
        drop(writer);
        match handshake::wait_ready(reader, timeout) {
            Ok(()) => debug!("monitor process {} is ready", pid),
            Err(kind @ ErrorKind::HandshakeTimeout(_)) => {
                supervisor::spawn(child, redirect, on_monitor_exit)?;
                return Err(kind.into());
            }
            Err(kind) => {
                drop(redirect);
                let _ = child.kill();
                let _ = child.wait();
                return Err(kind.into());
            }
        }
    }

    supervisor::spawn(child, redirect, on_monitor_exit)?;
    Ok(Watcher { pid })
}

/// Between fork and exec: expose the readiness pipe as fd 3 and ignore
/// termination signals, which stays in effect across exec.
#[cfg(unix)]
fn prepare_monitor_unix(command: &mut Command, ready_fd: Option<RawFd>) {
    let closure = move || -> io::Result<()> {
        unsafe {
            if let Some(fd) = ready_fd {
                let ret = if fd == monitor::READY_FD {
                    libc::fcntl(fd, libc::F_SETFD, 0)
                } else {
                    libc::dup2(fd, monitor::READY_FD)
                };
                if ret == -1 {
                    return Err(io::Error::last_os_error());
                }
            }
        }
        monitor::ignore_signals_unix();
        Ok(())
    };
    unsafe {
        command.pre_exec(closure);
    }
}
