use std::fmt;
use std::io;
use std::process::ExitStatus;
use std::time::Duration;

pub type OsError = i32;

#[derive(Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    MissingCrashCallback,
    ZeroReadChunkSize,
    ZeroRetainedSize,
    HandshakeUnsupported,

    ResolveExecutable(io::Error),
    CreatePipe(io::Error),
    DuplicateStderr(OsError),
    RedirectStderr(OsError),
    RestoreStderr(OsError),
    SpawnMonitor(io::Error),
    SpawnSupervisor(io::Error),

    HandshakeTimeout(Duration),
    Handshake(io::Error),
    MonitorClosedHandshake,

    WaitMonitor(io::Error),
    MonitorExited(ExitStatus),
    ReadInput(io::Error),
    ForwardOutput(io::Error),

    UnsupportedPlatform,
}

impl ErrorKind {
    pub fn description(&self) -> String {
        match self {
            ErrorKind::MissingCrashCallback => "on_crash callback must be set".to_string(),
            ErrorKind::ZeroReadChunkSize => "read chunk size must be greater than zero".to_string(),
            ErrorKind::ZeroRetainedSize => "retained buffer size must be greater than zero".to_string(),
            ErrorKind::HandshakeUnsupported => {
                "handshake timeout is not supported on this platform".to_string()
            }
            ErrorKind::ResolveExecutable(e) => format!("unable to resolve current executable: {}", e),
            ErrorKind::CreatePipe(e) => format!("unable to create pipe: {}", e),
            ErrorKind::DuplicateStderr(_) => "unable to duplicate stderr".to_string(),
            ErrorKind::RedirectStderr(_) => "unable to redirect stderr".to_string(),
            ErrorKind::RestoreStderr(_) => "unable to restore stderr".to_string(),
            ErrorKind::SpawnMonitor(e) => format!("unable to spawn monitor process: {}", e),
            ErrorKind::SpawnSupervisor(e) => format!("unable to start supervisor thread: {}", e),
            ErrorKind::HandshakeTimeout(timeout) => {
                format!("timed out waiting for monitor to start after {:?}", timeout)
            }
            ErrorKind::Handshake(e) => format!("unable to read monitor readiness: {}", e),
            ErrorKind::MonitorClosedHandshake => {
                "monitor exited before signalling readiness".to_string()
            }
            ErrorKind::WaitMonitor(e) => format!("wait for monitor process failed: {}", e),
            ErrorKind::MonitorExited(status) => format!("monitor process died: {}", status),
            ErrorKind::ReadInput(e) => format!("unable to read relayed stderr: {}", e),
            ErrorKind::ForwardOutput(e) => format!("unable to forward stderr: {}", e),
            ErrorKind::UnsupportedPlatform => "unsupported platform".to_string(),
        }
    }

    pub fn get_os_error_code(&self) -> Option<OsError> {
        match self {
            ErrorKind::DuplicateStderr(e)
            | ErrorKind::RedirectStderr(e)
            | ErrorKind::RestoreStderr(e) => Some(*e),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())?;
        if let Some(code) = self.get_os_error_code() {
            write!(f, " (OS Error Code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorKind {}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error { kind }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// The handshake timed out. The monitor was left running.
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::HandshakeTimeout(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "crashwatch error: {}", self.kind)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ErrorKind::ResolveExecutable(e)
            | ErrorKind::CreatePipe(e)
            | ErrorKind::SpawnMonitor(e)
            | ErrorKind::SpawnSupervisor(e)
            | ErrorKind::Handshake(e)
            | ErrorKind::WaitMonitor(e)
            | ErrorKind::ReadInput(e)
            | ErrorKind::ForwardOutput(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

#[cfg(unix)]
pub trait Num {
    fn is_err(&self) -> bool;
}

#[cfg(unix)]
macro_rules! impl_num_for_signed_integer {
    ($($t:ty)*) => ($(
        impl Num for $t {
            fn is_err(&self) -> bool {
                *self == -1
            }
        }
    )*)
}

#[cfg(unix)]
impl_num_for_signed_integer!(i32 isize);

#[cfg(unix)]
pub fn get_last_os_error() -> OsError {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(unix)]
pub fn check_err<N: Num, F: FnOnce(OsError) -> ErrorKind>(ret: N, f: F) -> Result<N, ErrorKind> {
    if ret.is_err() {
        Err(f(get_last_os_error()))
    } else {
        Ok(ret)
    }
}

#[cfg(windows)]
pub fn get_last_os_error() -> OsError {
    unsafe { windows_sys::Win32::Foundation::GetLastError() as OsError }
}
