use std::io::Write;
use std::process::{exit, Child};
use std::thread;

use log::{debug, error};

use crate::error::{Error, ErrorKind};
use crate::stderr::StderrRedirect;
use crate::ExitCallback;

/// Waits for the monitor on a background thread. When it exits, stderr is
/// restored and the exit callback runs; without a callback the primary
/// process exits.
///
/// If the thread cannot be started, the closure is dropped and the redirect
/// is restored with it.
pub(crate) fn spawn(
    mut child: Child,
    mut redirect: StderrRedirect,
    on_monitor_exit: Option<ExitCallback>,
) -> Result<(), Error> {
    thread::Builder::new()
        .name("crashwatch-supervisor".to_string())
        .spawn(move || {
            let outcome = wait(&mut child);
            if let Err(e) = redirect.restore() {
                error!("{}", Error::new(e));
            }
            report(outcome, on_monitor_exit);
        })
        .map(drop)
        .map_err(|e| Error::new(ErrorKind::SpawnSupervisor(e)))
}

fn wait(child: &mut Child) -> Result<(), Error> {
    let status = child
        .wait()
        .map_err(|e| Error::new(ErrorKind::WaitMonitor(e)))?;
    debug!("monitor process {} exited: {}", child.id(), status);
    if status.success() {
        Ok(())
    } else {
        Err(Error::new(ErrorKind::MonitorExited(status)))
    }
}

fn report(outcome: Result<(), Error>, on_monitor_exit: Option<ExitCallback>) {
    match on_monitor_exit {
        Some(on_monitor_exit) => on_monitor_exit(outcome),
        None => {
            let reason = match outcome {
                Ok(()) => "monitor process exited".to_string(),
                Err(e) => e.kind().to_string(),
            };
            error!("{}", reason);
            let _ = writeln!(std::io::stderr(), "crashwatch: {}", reason);
            exit(1);
        }
    }
}
