// crashwatch-tests/src/lib.rs

extern crate crashwatch;
extern crate tempfile;

use std::backtrace::Backtrace;
use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{exit, Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use crashwatch::{CrashRecord, CrashWatch, Role, Watcher};

// Scenarios understood by examples/tester.rs
pub const NO_PANIC: &str = "no-panic";
pub const NO_PANIC_ERROR: &str = "no-panic-error";
pub const PANIC: &str = "panic";
pub const PANIC_AND_ERROR: &str = "panic-and-error";
pub const PANIC_SYNC_SPLIT: &str = "panic-sync-split";
pub const PANIC_WITH_GARBAGE: &str = "panic-with-garbage";
pub const ONLY_LAST_PANIC: &str = "only-last-panic-string-is-detected";
pub const PANIC_WITH_LONG_STACK: &str = "panic-with-long-stack";
pub const FATAL: &str = "fatal";
pub const WAIT_FOR_WATCHER: &str = "wait-for-watcher";
pub const SLOW_WATCHER: &str = "slow-watcher";
pub const MONITOR_KILLED: &str = "monitor-killed";
pub const MONITOR_KILLED_NO_CALLBACK: &str = "monitor-killed-no-callback";
pub const RELAY_BROKEN: &str = "relay-broken";

// Environment read by the tester in both of its processes
pub const ENV_LOG_FILE: &str = "_CRASHWATCH_TEST_LOG_FILE";
pub const ENV_RETAINED_SIZE: &str = "_CRASHWATCH_TEST_RETAINED_SIZE";

pub const GARBAGE_LINE: &str = "some garbage here...";
pub const GARBAGE_LINES: usize = 1500;
pub const LONG_STACK_FRAMES: usize = 200;
pub const SPLIT_STACK: &str =
    "thread 'main' panicked at src/split.rs:1:1\nframe 0: execute_command\nframe 1: main\n";
pub const FATAL_MESSAGE: &str = "memory allocation of 1024 bytes failed";

/// Exit status of a crashed tester, mirroring a runtime abort.
pub const CRASH_EXIT_CODE: i32 = 2;
/// Exit status when the tester itself is misused or crashwatch fails to start.
pub const SETUP_EXIT_CODE: i32 = 3;

const TESTER_PATH: &str = if cfg!(windows) {
    concat!(env!("CARGO_MANIFEST_DIR"), "/../target/debug/examples/tester.exe")
} else {
    concat!(env!("CARGO_MANIFEST_DIR"), "/../target/debug/examples/tester")
};

const MAX_WAIT_DURATION: Duration = Duration::from_secs(15);

/// What a finished tester run left behind.
#[derive(Debug)]
pub struct Report {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub crash: Option<CrashRecord>,
}

impl Report {
    /// Everything written to stderr before the crash dump.
    pub fn stderr_before_crash(&self) -> Option<&str> {
        let crash = self.crash.as_ref()?;
        let dump = format!("{}: {}\n", crash.kind, crash.message);
        let start = self.stderr.rfind(&dump)?;
        Some(&self.stderr[..start])
    }
}

// Tester struct used to configure and run one scenario
pub struct Tester {
    command: Command,
    close_stderr: bool,
}

impl Tester {
    pub fn new(scenario: &str) -> Self {
        let mut command = Command::new(TESTER_PATH);
        command.arg(scenario);
        command.env_remove(crashwatch::ROLE_MARKER_NAME);
        Self {
            command,
            close_stderr: false,
        }
    }

    pub fn log_file<F: AsRef<Path>>(&mut self, path: F) -> &mut Self {
        self.command.env(ENV_LOG_FILE, path.as_ref());
        self
    }

    pub fn retained_size(&mut self, size: usize) -> &mut Self {
        self.command.env(ENV_RETAINED_SIZE, size.to_string());
        self
    }

    /// Closes the read end of the tester's stderr right after spawning, so
    /// writes to the original stderr fail.
    pub fn close_stderr(&mut self) -> &mut Self {
        self.close_stderr = true;
        self
    }

    pub fn run(&mut self) -> Result<Report, Box<dyn std::error::Error>> {
        let result_file = tempfile::NamedTempFile::new()
            .map_err(|e| format!("Failed to create temporary file for result: {}", e))?;
        self.command.arg(result_file.path());

        let mut child = self
            .command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("unable to spawn tester at {}: {}", TESTER_PATH, e))?;

        let stdout = drain(child.stdout.take().ok_or("tester stdout missing")?);
        let stderr_pipe = child.stderr.take().ok_or("tester stderr missing")?;
        let stderr = if self.close_stderr {
            drop(stderr_pipe);
            None
        } else {
            Some(drain(stderr_pipe))
        };

        let st = Instant::now();
        let exit_status = loop {
            if st.elapsed() > MAX_WAIT_DURATION {
                child.kill().ok();
                return Err("timeout waiting for tester to exit".into());
            }
            match child.try_wait()? {
                Some(status) => break status,
                None => std::thread::sleep(Duration::from_millis(1)),
            }
        };

        // stderr reaches end of stream only once the monitor has exited too,
        // so the result file is complete after this
        let remaining = MAX_WAIT_DURATION.saturating_sub(st.elapsed());
        let stdout = stdout
            .recv_timeout(remaining)
            .map_err(|_| "timeout reading tester stdout")??;
        let stderr = match stderr {
            Some(stderr) => {
                let remaining = MAX_WAIT_DURATION.saturating_sub(st.elapsed());
                stderr
                    .recv_timeout(remaining)
                    .map_err(|_| "timeout reading tester stderr, monitor still running?")??
            }
            None => Vec::new(),
        };

        let mut data = Vec::new();
        std::fs::File::open(result_file.path())?.read_to_end(&mut data)?;
        let crash = if data.is_empty() {
            None
        } else {
            Some(bincode::deserialize(&data)?)
        };

        Ok(Report {
            exit_code: exit_status.code(),
            stdout: String::from_utf8(stdout)?,
            stderr: String::from_utf8(stderr)?,
            crash,
        })
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> mpsc::Receiver<io::Result<Vec<u8>>> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut data = Vec::new();
        let result = pipe.read_to_end(&mut data).map(|_| data);
        let _ = tx.send(result);
    });
    rx
}

fn write_result(path: &Path, crash: &CrashRecord) {
    let data = match bincode::serialize(crash) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("failed to serialize crash record: {}", e);
            exit(SETUP_EXIT_CODE);
        }
    };
    if let Err(e) = std::fs::write(path, data) {
        eprintln!("failed to write result: {}", e);
        exit(SETUP_EXIT_CODE);
    }
}

fn log_to_file(message: &str) {
    let path = match std::env::var_os(ENV_LOG_FILE) {
        Some(path) => PathBuf::from(path),
        None => return,
    };
    let process_name = if Role::current().is_monitor() {
        "WATCHER"
    } else {
        "MAIN"
    };
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .unwrap_or_else(|e| panic!("unable to open log file {:?}: {}", path, e));
    writeln!(file, "[{}] {}", process_name, message)
        .unwrap_or_else(|e| panic!("unable to write log file {:?}: {}", path, e));
}

/// Writes a dump shaped like a runtime crash and exits.
fn crash_dump(header: &str, message: &str) -> ! {
    let thread = std::thread::current();
    let dump = format!(
        "{}: {}\n\nthread '{}' crashed\n{}",
        header,
        message,
        thread.name().unwrap_or("<unnamed>"),
        Backtrace::force_capture()
    );
    let mut stderr = io::stderr();
    let _ = stderr.write_all(dump.as_bytes());
    let _ = stderr.flush();
    exit(CRASH_EXIT_CODE);
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let payload = info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Box<dyn Any>".to_string()
        };
        let location = info
            .location()
            .map(|l| l.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        let thread = std::thread::current();
        let dump = format!(
            "panic: {}\n\nthread '{}' panicked at {}\n{}",
            message,
            thread.name().unwrap_or("<unnamed>"),
            location,
            Backtrace::force_capture()
        );
        let mut stderr = io::stderr();
        let _ = stderr.write_all(dump.as_bytes());
        let _ = stderr.flush();
        exit(CRASH_EXIT_CODE);
    }));
}

#[cfg(unix)]
fn kill_monitor(watcher: &Watcher) {
    unsafe {
        libc::kill(watcher.id() as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_monitor(watcher: &Watcher) {
    let _ = Command::new("taskkill")
        .args(["/F", "/PID", &watcher.id().to_string()])
        .stdout(Stdio::null())
        .status();
}

fn execute_command(
    scenario: &str,
    watcher: &Watcher,
    monitor_exit: mpsc::Receiver<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    match scenario {
        NO_PANIC => {
            println!("some stdout output");
            eprintln!("some stderr output");
        }
        NO_PANIC_ERROR => {
            eprintln!("blah blah something happened");
            exit(1);
        }
        PANIC => {
            println!("some output...\neverything looks good...");
            panic!("wtf, unexpected panic!");
        }
        PANIC_AND_ERROR => {
            println!("some output...\neverything looks good...");
            eprintln!("well something goes bad ...");
            panic!("... and panic!");
        }
        PANIC_SYNC_SPLIT => {
            let mut stderr = io::stderr();
            stderr.write_all(b"pani")?;
            stderr.flush()?;
            std::thread::sleep(Duration::from_millis(300));
            stderr.write_all(b"c: i'm split in three lol\n")?;
            stderr.write_all(b"\n")?;
            let (first, rest) = SPLIT_STACK.split_at(20);
            stderr.write_all(first.as_bytes())?;
            stderr.flush()?;
            std::thread::sleep(Duration::from_millis(300));
            stderr.write_all(rest.as_bytes())?;
            exit(CRASH_EXIT_CODE);
        }
        PANIC_WITH_GARBAGE => {
            eprintln!("panic: blah blah\n");
            for _ in 0..GARBAGE_LINES {
                println!("{}", GARBAGE_LINE);
                eprintln!("{}", GARBAGE_LINE);
            }
            panic!("and BAM!");
        }
        ONLY_LAST_PANIC => {
            eprintln!("panic: this is fake\n");
            panic!("and this is not");
        }
        PANIC_WITH_LONG_STACK => {
            let mut dump = String::from("panic: too deep\n\n");
            for frame in 0..LONG_STACK_FRAMES {
                dump.push_str(&format!("frame {}: recurse()\n", frame));
            }
            io::stderr().write_all(dump.as_bytes())?;
            exit(CRASH_EXIT_CODE);
        }
        FATAL => crash_dump("fatal error", FATAL_MESSAGE),
        WAIT_FOR_WATCHER => {
            panic!("panic right after starting crashwatch");
        }
        MONITOR_KILLED => {
            kill_monitor(watcher);
            let reported = monitor_exit
                .recv_timeout(Duration::from_secs(10))
                .map_err(|_| "monitor exit was never reported")?;
            println!("monitor exit reported: {}", reported);
            eprintln!("stderr restored");
        }
        MONITOR_KILLED_NO_CALLBACK => {
            kill_monitor(watcher);
            std::thread::sleep(Duration::from_secs(10));
            println!("still alive");
        }
        RELAY_BROKEN => {
            // keep writing until the monitor trips over the closed destination
            let reported = loop {
                let _ = io::stderr().write_all(b"nobody reads this\n");
                match monitor_exit.recv_timeout(Duration::from_millis(50)) {
                    Ok(reported) => break reported,
                    Err(mpsc::RecvTimeoutError::Timeout) => continue,
                    Err(mpsc::RecvTimeoutError::Disconnected) => {
                        return Err("monitor exit callback dropped".into())
                    }
                }
            };
            println!("monitor exit reported: {}", reported);
        }
        other => {
            eprintln!("unknown command: {}", other);
            exit(SETUP_EXIT_CODE);
        }
    }
    Ok(())
}

pub fn execute_tester_inner() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() != 2 {
        eprintln!("missing command or results file");
        exit(SETUP_EXIT_CODE);
    }
    let scenario = args[0].as_str();
    let result_path = PathBuf::from(&args[1]);

    let mut watch = CrashWatch::new().on_crash(move |crash| write_result(&result_path, &crash));

    if let Some(size) = std::env::var_os(ENV_RETAINED_SIZE) {
        let size = size
            .to_str()
            .and_then(|s| s.parse().ok())
            .ok_or("invalid retained size")?;
        watch = watch.retained_size(size);
    }

    match scenario {
        WAIT_FOR_WATCHER => watch = watch.handshake_timeout(Duration::from_secs(5)),
        SLOW_WATCHER => {
            watch = watch.handshake_timeout(Duration::from_millis(200));
            if Role::current().is_monitor() {
                std::thread::sleep(Duration::from_secs(1));
            }
        }
        _ => {}
    }

    let (exit_tx, exit_rx) = mpsc::channel();
    if scenario == RELAY_BROKEN {
        watch = watch.on_monitor_error(|e| log_to_file(&format!("monitor error: {}", e)));
    }
    if scenario == MONITOR_KILLED || scenario == RELAY_BROKEN {
        watch = watch.on_monitor_exit(move |outcome| {
            let reported = match outcome {
                Ok(()) => "clean".to_string(),
                Err(e) => e.to_string(),
            };
            let _ = exit_tx.send(reported);
        });
    }

    log_to_file("starting");
    let watcher = watch.start();
    log_to_file("started");

    let watcher = match watcher {
        Ok(watcher) => watcher,
        Err(e) => {
            eprintln!("unexpected error: {}", e);
            exit(SETUP_EXIT_CODE);
        }
    };

    install_panic_hook();
    execute_command(scenario, &watcher, exit_rx)
}
