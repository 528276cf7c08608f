use std::ffi::OsStr;

/// Environment variable that marks a process as the monitor.
pub const ROLE_MARKER_NAME: &str = "CRASHWATCH_ROLE_M4qZt7hVxK2c";

/// The only value of [`ROLE_MARKER_NAME`] that selects the monitor role.
pub const ROLE_MARKER_VALUE: &str = "monitor-Wn8rJd3LpY6s";

/// Which side of the relay the current process is on.
///
/// The role travels to the monitor through the environment. Any process that
/// inherits the marker, including programs the monitor's host later re-executes,
/// is a monitor unless the variable is removed before spawning it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Monitor,
}

impl Role {
    pub fn current() -> Role {
        Role::from_marker(std::env::var_os(ROLE_MARKER_NAME).as_deref())
    }

    fn from_marker(value: Option<&OsStr>) -> Role {
        match value {
            Some(value) if value == OsStr::new(ROLE_MARKER_VALUE) => Role::Monitor,
            _ => Role::Primary,
        }
    }

    pub fn is_monitor(self) -> bool {
        self == Role::Monitor
    }
}
