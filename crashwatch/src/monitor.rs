//! The monitor side: tee the relayed stderr to the original destination,
//! keep its tail, and report the last crash dump at end of stream.

use cfg_if::cfg_if;
use std::io::{self, Read, Write};
use std::process::exit;

use log::{debug, warn};

use crate::crash::CrashRecord;
use crate::error::{Error, ErrorKind};
use crate::ring::RingBuffer;
use crate::scan;
use crate::{ErrorCallback, MonitorConfig};

cfg_if! {
    if #[cfg(unix)] {
        use std::fs::File;
        use std::mem::ManuallyDrop;
        use std::os::unix::io::FromRawFd;
    }
}

/// Inherited descriptor the monitor writes its readiness byte to.
#[cfg(unix)]
pub(crate) const READY_FD: libc::c_int = 3;

#[cfg(unix)]
const IGNORED_SIGNALS: [libc::c_int; 11] = [
    libc::SIGHUP,
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGTERM,
    libc::SIGPIPE,
    libc::SIGUSR1,
    libc::SIGUSR2,
    libc::SIGALRM,
    libc::SIGTSTP,
    libc::SIGTTIN,
    libc::SIGTTOU,
];

/// Sets catchable termination and job-control signals to ignored.
///
/// Only async-signal-safe calls, so this also runs between fork and exec.
#[cfg(unix)]
pub(crate) fn ignore_signals_unix() {
    for signal in IGNORED_SIGNALS {
        unsafe {
            libc::signal(signal, libc::SIG_IGN);
        }
    }
}

fn ignore_signals() {
    cfg_if! {
        if #[cfg(unix)] {
            ignore_signals_unix();
        } else if #[cfg(windows)] {
            use windows_sys::Win32::System::Console::SetConsoleCtrlHandler;
            unsafe {
                SetConsoleCtrlHandler(None, 1);
            }
        }
    }
}

fn notify_ready() -> io::Result<()> {
    cfg_if! {
        if #[cfg(unix)] {
            let mut ready = unsafe { File::from_raw_fd(READY_FD) };
            ready.write_all(b"1")
        } else {
            Err(io::Error::new(io::ErrorKind::Unsupported, "handshake not supported"))
        }
    }
}

/// Copies `input` to `output` until end of stream, retaining the most recent
/// bytes in `ring`. Each chunk is forwarded before it is retained.
pub(crate) fn tee<R: Read, W: Write>(
    mut input: R,
    mut output: W,
    ring: &mut RingBuffer,
    chunk_size: usize,
) -> Result<(), Error> {
    let mut chunk = vec![0u8; chunk_size];
    loop {
        let n = match input.read(&mut chunk) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::new(ErrorKind::ReadInput(e))),
        };
        output
            .write_all(&chunk[..n])
            .and_then(|()| output.flush())
            .map_err(|e| Error::new(ErrorKind::ForwardOutput(e)))?;
        ring.write_evicting(&chunk[..n]);
    }
}

/// Runs the tee, then scans the retained tail. A found record is handed to
/// `on_crash`. Returns the tee error, if any.
pub(crate) fn watch<R, W, F>(
    input: R,
    output: W,
    read_chunk_size: usize,
    retained_size: usize,
    on_crash: F,
) -> Result<(), Error>
where
    R: Read,
    W: Write,
    F: FnOnce(CrashRecord),
{
    let mut ring = RingBuffer::new(retained_size);
    tee(input, output, &mut ring, read_chunk_size)?;

    debug!("relay closed with {} bytes retained, scanning", ring.len());
    if let Some(record) = scan::scan(ring.make_contiguous()) {
        on_crash(record);
    }
    Ok(())
}

/// Entry point of the monitor process. Terminates the process.
pub(crate) fn run(config: MonitorConfig) -> ! {
    ignore_signals();

    if config.handshake {
        if let Err(e) = notify_ready() {
            warn!("unable to notify primary process that monitor has started: {}", e);
        }
    }

    // unbuffered on unix, so each read asks for exactly read_chunk_size bytes
    #[cfg(unix)]
    let stdin = ManuallyDrop::new(unsafe { File::from_raw_fd(libc::STDIN_FILENO) });
    #[cfg(unix)]
    let input = &*stdin;
    #[cfg(not(unix))]
    let input = io::stdin().lock();

    let stdout = io::stdout();
    let result = watch(
        input,
        stdout.lock(),
        config.read_chunk_size,
        config.retained_size,
        config.on_crash,
    );

    exit(exit_code(result, config.on_monitor_error))
}

/// Exit status of the monitor for the outcome of `watch`. A failure is
/// handed to `on_monitor_error` first.
fn exit_code(result: Result<(), Error>, on_monitor_error: Option<ErrorCallback>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => {
            debug!("monitor failed: {}", err);
            if let Some(on_monitor_error) = on_monitor_error {
                on_monitor_error(err);
            }
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crash::CrashKind;

    /// Hands out its data in fixed-size pieces, then optionally fails.
    struct Chunked {
        data: Vec<u8>,
        pos: usize,
        piece: usize,
        fail_with: Option<io::ErrorKind>,
        interrupt_once: bool,
    }

    impl Chunked {
        fn new(data: &[u8], piece: usize) -> Self {
            Chunked {
                data: data.to_vec(),
                pos: 0,
                piece,
                fail_with: None,
                interrupt_once: false,
            }
        }
    }

    impl Read for Chunked {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.interrupt_once {
                self.interrupt_once = false;
                return Err(io::ErrorKind::Interrupted.into());
            }
            if self.pos == self.data.len() {
                return match self.fail_with {
                    Some(kind) => Err(kind.into()),
                    None => Ok(0),
                };
            }
            let n = self.piece.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    /// Records the buffer size of every read it serves.
    struct Recording<'a> {
        inner: Chunked,
        requests: &'a mut Vec<usize>,
    }

    impl Read for Recording<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.requests.push(buf.len());
            self.inner.read(buf)
        }
    }

    struct BrokenWriter;

    impl Write for BrokenWriter {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn stream(garbage_lines: usize, tail: &str) -> Vec<u8> {
        let mut data = Vec::new();
        for i in 0..garbage_lines {
            data.extend_from_slice(format!("garbage line {}\n", i).as_bytes());
        }
        data.extend_from_slice(tail.as_bytes());
        data
    }

    #[test]
    fn forwards_every_byte_in_order() {
        let data: Vec<u8> = (0..250_000u32).map(|i| (i % 251) as u8).collect();
        let mut out = Vec::new();
        let mut ring = RingBuffer::new(1024);
        tee(Chunked::new(&data, 7_777), &mut out, &mut ring, 4096).unwrap();
        assert_eq!(out, data);
        assert_eq!(ring.make_contiguous(), &data[data.len() - 1024..]);
    }

    #[test]
    fn interrupted_read_is_retried() {
        let mut input = Chunked::new(b"hello", 2);
        input.interrupt_once = true;
        let mut out = Vec::new();
        let mut ring = RingBuffer::new(16);
        tee(input, &mut out, &mut ring, 8).unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn read_failure_is_reported_after_forwarding() {
        let mut input = Chunked::new(b"partial", 3);
        input.fail_with = Some(io::ErrorKind::Other);
        let mut out = Vec::new();
        let mut ring = RingBuffer::new(16);
        let err = tee(input, &mut out, &mut ring, 8).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ReadInput(_)));
        assert_eq!(out, b"partial");
    }

    #[test]
    fn forward_failure_is_terminal() {
        let mut ring = RingBuffer::new(16);
        let err = tee(Chunked::new(b"data", 4), BrokenWriter, &mut ring, 8).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ForwardOutput(_)));
    }

    #[test]
    fn reports_crash_at_end_of_stream() {
        let data = stream(10, "fatal error: boom\n\nframe 0\nframe 1\n");
        let mut out = Vec::new();
        let mut found = Vec::new();
        watch(Chunked::new(&data, 13), &mut out, 64, 1_000, |r| found.push(r)).unwrap();
        assert_eq!(out, data);
        assert_eq!(
            found,
            vec![CrashRecord {
                kind: CrashKind::FatalError,
                message: "boom".to_string(),
                stack: "frame 0\nframe 1\n".to_string(),
            }]
        );
    }

    #[test]
    fn window_smaller_than_stream_still_finds_tail_crash() {
        let data = stream(1500, "panic: and BAM!\n\nstack\n");
        let mut found = None;
        watch(Chunked::new(&data, 4096), io::sink(), 4096, 512, |r| found = Some(r)).unwrap();
        let found = found.expect("crash in window");
        assert_eq!(found.message, "and BAM!");
        assert_eq!(found.stack, "stack\n");
    }

    #[test]
    fn crash_evicted_past_its_header_is_not_reported() {
        let data = stream(0, &format!("panic: lost\n\n{}", "x".repeat(600)));
        let mut called = false;
        watch(Chunked::new(&data, 100), io::sink(), 100, 512, |_| called = true).unwrap();
        assert!(!called);
    }

    #[test]
    fn clean_stream_reports_nothing() {
        let data = stream(100, "bye\n");
        let mut called = false;
        watch(Chunked::new(&data, 50), io::sink(), 50, 1_000, |_| called = true).unwrap();
        assert!(!called);
    }

    #[test]
    fn reads_are_sized_by_read_chunk_size() {
        let data = stream(50, "bye\n");
        let mut requests = Vec::new();
        let input = Recording {
            inner: Chunked::new(&data, usize::MAX),
            requests: &mut requests,
        };
        let mut ring = RingBuffer::new(64);
        tee(input, io::sink(), &mut ring, 100).unwrap();
        assert!(requests.len() > 1);
        assert!(requests.iter().all(|&n| n == 100));
    }

    #[test]
    fn clean_end_of_stream_exits_zero_without_error_callback() {
        let (tx, rx) = std::sync::mpsc::channel::<Error>();
        let on_error: ErrorCallback = Box::new(move |err| {
            let _ = tx.send(err);
        });
        assert_eq!(exit_code(Ok(()), Some(on_error)), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn relay_failure_reaches_error_callback_and_exits_one() {
        let (tx, rx) = std::sync::mpsc::channel();
        let on_error: ErrorCallback = Box::new(move |err| {
            let _ = tx.send(err);
        });
        let mut ring = RingBuffer::new(16);
        let result = tee(Chunked::new(b"data", 4), BrokenWriter, &mut ring, 8);

        assert_eq!(exit_code(result, Some(on_error)), 1);
        let reported = rx.try_recv().unwrap();
        assert!(matches!(reported.kind(), ErrorKind::ForwardOutput(_)));
    }

    #[test]
    fn relay_failure_without_error_callback_still_exits_one() {
        let err = Error::new(ErrorKind::ReadInput(io::ErrorKind::Other.into()));
        assert_eq!(exit_code(Err(err), None), 1);
    }
}
