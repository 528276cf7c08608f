use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The kind of crash dump, named after the header that starts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CrashKind {
    #[cfg_attr(feature = "serde", serde(rename = "panic"))]
    Panic,
    #[cfg_attr(feature = "serde", serde(rename = "fatal error"))]
    FatalError,
}

impl CrashKind {
    pub(crate) const ALL: [CrashKind; 2] = [CrashKind::Panic, CrashKind::FatalError];

    pub fn as_str(self) -> &'static str {
        match self {
            CrashKind::Panic => "panic",
            CrashKind::FatalError => "fatal error",
        }
    }
}

impl fmt::Display for CrashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A crash dump recovered from the tail of standard error.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CrashRecord {
    pub kind: CrashKind,
    pub message: String,
    pub stack: String,
}

impl CrashRecord {
    /// Renders the record as `<header>: <message>\n<stack>`, the form stack
    /// parsers expect.
    pub fn header_text(&self) -> String {
        format!("{}: {}\n{}", self.kind, self.message, self.stack)
    }

    pub fn parse_stack<P: StackParser>(&self, parser: &P) -> Result<P::Trace, P::Error> {
        parser.parse(&self.header_text())
    }

    pub fn into_error(self) -> CrashError {
        CrashError { record: self }
    }
}

/// Turns raw crash text into a structured, frame-by-frame stack trace.
pub trait StackParser {
    type Trace;
    type Error;

    fn parse(&self, text: &str) -> Result<Self::Trace, Self::Error>;
}

/// A crash record viewed as an error. Displays the crash message only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashError {
    record: CrashRecord,
}

impl CrashError {
    pub fn record(&self) -> &CrashRecord {
        &self.record
    }
}

impl fmt::Display for CrashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.record.message)
    }
}

impl std::error::Error for CrashError {}
