//! Classification of client tool failures from their diagnostic output.

use std::fmt;
use std::process::ExitStatus;

use derive_more::{Display, Error};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

use super::DatabaseType;

/// Lines of diagnostics kept in a [ProcessFailure].
const DIAGNOSTIC_TAIL_LINES: usize = 20;

/// Category of a failed dump or restore.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    #[display("authentication failure")]
    Authentication,
    #[display("connection refused")]
    ConnectionRefused,
    #[display("unknown database")]
    UnknownDatabase,
    #[display("TLS negotiation failure")]
    Tls,
    #[display("timeout")]
    Timeout,
    #[display("unclassified failure")]
    Unclassified,
}

impl ErrorKind {
    fn advice(self) -> &'static str {
        match self {
            Self::Authentication => "check the username and password configured for this database",
            Self::ConnectionRefused => {
                "the server is unreachable, check host, port and that the server accepts remote connections"
            }
            Self::UnknownDatabase => "the database does not exist on the server, check the database name",
            Self::Tls => "check whether the server requires or supports TLS and adjust the TLS setting",
            Self::Timeout => "the server did not respond in time, check network latency and server load",
            Self::Unclassified => "see the tool output for details",
        }
    }
}

/// How an external process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    /// Terminating signal on unix.
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// A classified non-zero exit of a client tool.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
#[display("{message}")]
pub struct ProcessFailure {
    pub engine: DatabaseType,
    pub kind: ErrorKind,
    pub exit: ExitInfo,
    /// Actionable, human readable summary.
    pub message: String,
    /// Tail of the raw tool output.
    pub diagnostics: String,
}

// Checked in order, the first match wins.
static PATTERNS: Lazy<Vec<(ErrorKind, Regex)>> = Lazy::new(|| {
    [
        (
            ErrorKind::Authentication,
            r#"password authentication failed|access denied for user|authentication failed|no pg_hba\.conf entry|role ".*" does not exist|sasl|auth error|unauthorized"#,
        ),
        (
            ErrorKind::Tls,
            r"\bssl\b|\btls\b|certificate|x509|handshake",
        ),
        (
            ErrorKind::UnknownDatabase,
            r#"database ".*" does not exist|unknown database|database .* not found"#,
        ),
        (
            ErrorKind::Timeout,
            r"timed? ?out|timeout|deadline exceeded",
        ),
        (
            ErrorKind::ConnectionRefused,
            r"connection refused|could not connect|can't connect|could not translate host name|unknown (mysql |mariadb )?server host|name or service not known|no such host|no route to host|network is unreachable|server selection error|no reachable servers|connection reset",
        ),
    ]
    .into_iter()
    .map(|(kind, pattern)| {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .expect("failure patterns should be valid regular expressions");
        (kind, regex)
    })
    .collect()
});

/// Matches `diagnostics` against the known failure patterns.
pub fn classify(engine: DatabaseType, exit: &ExitInfo, diagnostics: &str) -> ProcessFailure {
    let kind = PATTERNS
        .iter()
        .find(|(_, regex)| regex.is_match(diagnostics))
        .map(|(kind, _)| *kind)
        .unwrap_or(ErrorKind::Unclassified);

    let tail = diagnostic_tail(diagnostics);
    let message = match kind {
        ErrorKind::Unclassified => match tail.lines().last() {
            Some(last) => format!("{engine} tool failed with {exit}: {last}"),
            None => format!("{engine} tool failed with {exit} without any output"),
        },
        kind => format!("{engine} {kind}: {}", kind.advice()),
    };
    log::debug!(target: "engine::classify", "Classified {engine} failure ({exit}) as {kind}");

    ProcessFailure {
        engine,
        kind,
        exit: *exit,
        message,
        diagnostics: tail,
    }
}

fn diagnostic_tail(diagnostics: &str) -> String {
    let lines: Vec<&str> = diagnostics
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect();
    let start = lines.len().saturating_sub(DIAGNOSTIC_TAIL_LINES);
    lines[start..].join("\n")
}
