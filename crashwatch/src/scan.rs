//! Locating and parsing the last crash dump in the retained bytes.
//!
//! A dump starts with a line `panic: <message>` or `fatal error: <message>`,
//! followed by line breaks, followed by the stack text up to end of stream.
//! Only the right-most header sitting at the start of a line counts; earlier
//! look-alikes are ignored.

use crate::crash::{CrashKind, CrashRecord};

const HEADER_SUFFIX: &[u8] = b": ";

fn header_at(line: &[u8]) -> Option<CrashKind> {
    CrashKind::ALL.into_iter().find(|kind| {
        let word = kind.as_str().as_bytes();
        line.starts_with(word) && line[word.len()..].starts_with(HEADER_SUFFIX)
    })
}

/// Offset of the right-most line that begins with a crash header.
pub(crate) fn find_last_crash_start(mut buf: &[u8]) -> Option<usize> {
    loop {
        let newline = buf.iter().rposition(|&b| b == b'\n');
        let line_start = newline.map_or(0, |i| i + 1);
        if header_at(&buf[line_start..]).is_some() {
            return Some(line_start);
        }
        buf = &buf[..newline?];
    }
}

/// Parses bytes starting at a crash header. Returns `None` when the bytes
/// do not form a complete header line followed by a line break.
pub(crate) fn parse_crash(raw: &[u8]) -> Option<CrashRecord> {
    let kind = header_at(raw)?;
    let rest = &raw[kind.as_str().len() + HEADER_SUFFIX.len()..];

    let line_end = rest.iter().position(|&b| b == b'\n')?;
    let message = &rest[..line_end];
    let stack_start = rest[line_end..]
        .iter()
        .position(|&b| b != b'\n')
        .map_or(rest.len(), |i| line_end + i);

    Some(CrashRecord {
        kind,
        message: String::from_utf8_lossy(message).into_owned(),
        stack: String::from_utf8_lossy(&rest[stack_start..]).into_owned(),
    })
}

/// Finds and parses the last crash dump in `buf`.
pub(crate) fn scan(buf: &[u8]) -> Option<CrashRecord> {
    find_last_crash_start(buf).and_then(|start| parse_crash(&buf[start..]))
}
