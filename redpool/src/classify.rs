//! # Server Error Classification
//!
//! Purpose: Map the text of a `-ERR`-style reply onto a typed error and
//! decide whether the connection must be dropped.
//!
//! ## Design Principles
//! 1. **Ordered Rule Table**: The first matching rule wins; the table is data,
//!    not scattered string checks.
//! 2. **Conservative Default**: Unmatched errors keep the connection open.

use crate::error::Error;

/// Error category assigned by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorKind {
    /// Dataset still loading.
    BusyLoading,
    /// Read-only replica.
    ReadOnly,
    /// `maxmemory` reached.
    OutOfMemory,
    /// Credentials rejected or unexpected.
    Authentication,
    /// ACL denied.
    NoPermission,
    /// Transaction discarded.
    ExecAbort,
    /// Unknown script.
    NoScript,
    /// Server refused the connection itself.
    Connection,
    /// Anything else.
    Response,
}

/// One row of the classification table.
#[derive(Debug, Clone, Copy)]
pub struct ErrorRule {
    /// Required first word of the message.
    pub code: Option<&'static str>,
    /// Required substring of the message.
    pub needle: Option<&'static str>,
    /// Resulting category.
    pub kind: ServerErrorKind,
    /// Whether the connection is closed before the error is returned.
    pub disconnect: bool,
}

impl ErrorRule {
    const fn code(code: &'static str, kind: ServerErrorKind, disconnect: bool) -> Self {
        ErrorRule {
            code: Some(code),
            needle: None,
            kind,
            disconnect,
        }
    }

    const fn text(needle: &'static str, kind: ServerErrorKind) -> Self {
        ErrorRule {
            code: None,
            needle: Some(needle),
            kind,
            disconnect: false,
        }
    }

    fn matches(&self, message: &str) -> bool {
        let first_word = message.split(' ').next().unwrap_or("");
        self.code.map_or(true, |code| first_word == code)
            && self.needle.map_or(true, |needle| message.contains(needle))
    }
}

/// Classification rules in evaluation order.
pub const ERROR_RULES: &[ErrorRule] = &[
    ErrorRule::code("LOADING", ServerErrorKind::BusyLoading, true),
    ErrorRule::code("READONLY", ServerErrorKind::ReadOnly, false),
    ErrorRule::code("OOM", ServerErrorKind::OutOfMemory, false),
    ErrorRule::code("WRONGPASS", ServerErrorKind::Authentication, false),
    ErrorRule::code("NOAUTH", ServerErrorKind::Authentication, false),
    ErrorRule::code("NOPERM", ServerErrorKind::NoPermission, false),
    ErrorRule::code("EXECABORT", ServerErrorKind::ExecAbort, false),
    ErrorRule::code("NOSCRIPT", ServerErrorKind::NoScript, false),
    ErrorRule {
        code: Some("ERR"),
        needle: Some("max number of clients reached"),
        kind: ServerErrorKind::Connection,
        disconnect: true,
    },
    ErrorRule::text("no password is set", ServerErrorKind::Authentication),
    ErrorRule::text("without any password configured", ServerErrorKind::Authentication),
    ErrorRule::text("invalid password", ServerErrorKind::Authentication),
    ErrorRule::text("invalid username-password pair", ServerErrorKind::Authentication),
];

const DEFAULT_RULE: ErrorRule = ErrorRule {
    code: None,
    needle: None,
    kind: ServerErrorKind::Response,
    disconnect: false,
};

/// Result of classifying one server error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// Category.
    pub kind: ServerErrorKind,
    /// Whether the connection must be closed.
    pub disconnect: bool,
}

/// Finds the first rule matching `message`.
pub fn classify(message: &str) -> Classification {
    let rule = ERROR_RULES
        .iter()
        .find(|rule| rule.matches(message))
        .unwrap_or(&DEFAULT_RULE);
    Classification {
        kind: rule.kind,
        disconnect: rule.disconnect,
    }
}

/// Builds the typed error for `message`, keeping the server text verbatim.
pub fn server_error(message: &str, kind: ServerErrorKind) -> Error {
    let text = message.to_string();
    match kind {
        ServerErrorKind::BusyLoading => Error::BusyLoading(text),
        ServerErrorKind::ReadOnly => Error::ReadOnly(text),
        ServerErrorKind::OutOfMemory => Error::OutOfMemory(text),
        ServerErrorKind::Authentication => Error::Authentication(text),
        ServerErrorKind::NoPermission => Error::NoPermission(text),
        ServerErrorKind::ExecAbort => Error::ExecAbort(text),
        ServerErrorKind::NoScript => Error::NoScript(text),
        ServerErrorKind::Connection => Error::Connection(text),
        ServerErrorKind::Response => Error::Response(text),
    }
}
