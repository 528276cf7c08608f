//! Swapping the process-wide standard error destination.
//!
//! There is one stderr per process. Only the bootstrap redirects it, once,
//! and the guard puts the original back exactly once: explicitly when the
//! monitor dies, or on drop when the bootstrap bails out early.

use cfg_if::cfg_if;
use std::fs::File;

use os_pipe::PipeWriter;

use crate::error::ErrorKind;

cfg_if! {
    if #[cfg(unix)] {
        use std::os::unix::io::{AsRawFd, FromRawFd};
        use crate::error::check_err;
    } else if #[cfg(windows)] {
        use std::os::windows::io::{AsHandle, AsRawHandle, IntoRawHandle};
        use windows_sys::Win32::System::Console::{SetStdHandle, STD_ERROR_HANDLE};
        use crate::error::get_last_os_error;
    }
}

#[derive(Debug)]
pub(crate) struct StderrRedirect {
    // `None` once restored.
    saved: Option<File>,
    #[cfg(windows)]
    relay: Option<PipeWriter>,
}

impl StderrRedirect {
    /// Points stderr at `relay`, keeping a duplicate of the old destination.
    pub(crate) fn redirect(relay: PipeWriter) -> Result<Self, ErrorKind> {
        cfg_if! {
            if #[cfg(unix)] {
                unsafe {
                    let saved_fd = check_err(
                        libc::fcntl(libc::STDERR_FILENO, libc::F_DUPFD_CLOEXEC, 3),
                        ErrorKind::DuplicateStderr,
                    )?;
                    let saved = File::from_raw_fd(saved_fd);
                    check_err(
                        libc::dup2(relay.as_raw_fd(), libc::STDERR_FILENO),
                        ErrorKind::RedirectStderr,
                    )?;
                    // fd 2 now holds the relay's write end
                    drop(relay);
                    Ok(StderrRedirect { saved: Some(saved) })
                }
            } else if #[cfg(windows)] {
                let saved = std::io::stderr()
                    .as_handle()
                    .try_clone_to_owned()
                    .map_err(|e| ErrorKind::DuplicateStderr(e.raw_os_error().unwrap_or(0)))?;
                if unsafe { SetStdHandle(STD_ERROR_HANDLE, relay.as_raw_handle() as _) } == 0 {
                    return Err(ErrorKind::RedirectStderr(get_last_os_error()));
                }
                Ok(StderrRedirect {
                    saved: Some(File::from(saved)),
                    relay: Some(relay),
                })
            } else {
                let _ = relay;
                Err(ErrorKind::UnsupportedPlatform)
            }
        }
    }

    /// Another handle to the original destination, for the monitor's output.
    pub(crate) fn original(&self) -> Result<File, ErrorKind> {
        let saved = self
            .saved
            .as_ref()
            .ok_or(ErrorKind::DuplicateStderr(0))?;
        saved
            .try_clone()
            .map_err(|e| ErrorKind::DuplicateStderr(e.raw_os_error().unwrap_or(0)))
    }

    pub(crate) fn restore(&mut self) -> Result<(), ErrorKind> {
        let saved = match self.saved.take() {
            Some(saved) => saved,
            None => return Ok(()),
        };

        cfg_if! {
            if #[cfg(unix)] {
                unsafe {
                    check_err(
                        libc::dup2(saved.as_raw_fd(), libc::STDERR_FILENO),
                        ErrorKind::RestoreStderr,
                    )?;
                }
                Ok(())
            } else if #[cfg(windows)] {
                let handle = saved.into_raw_handle();
                if unsafe { SetStdHandle(STD_ERROR_HANDLE, handle as _) } == 0 {
                    return Err(ErrorKind::RestoreStderr(get_last_os_error()));
                }
                self.relay = None;
                Ok(())
            } else {
                drop(saved);
                Ok(())
            }
        }
    }
}

impl Drop for StderrRedirect {
    fn drop(&mut self) {
        let _ = self.restore();
    }
}
