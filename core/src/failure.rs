// Failure values carried back to requesters
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;

/// Numeric failure code. Wire values are stable across peers; codes outside
/// the known set are preserved as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureCode(pub i32);

impl FailureCode {
    pub const UNKNOWN: FailureCode = FailureCode(0);
    // Request
    pub const BAD_SYNTAX: FailureCode = FailureCode(400);
    pub const FORBIDDEN: FailureCode = FailureCode(403);
    pub const NOT_FOUND: FailureCode = FailureCode(404);
    pub const REQUEST_TIMEOUT: FailureCode = FailureCode(408);
    pub const PRECONDITION_FAILED: FailureCode = FailureCode(412);
    pub const CALM_DOWN: FailureCode = FailureCode(420);
    // Server
    pub const INTERNAL_ERROR: FailureCode = FailureCode(500);
    pub const NOT_IMPLEMENTED: FailureCode = FailureCode(501);
    pub const SERVICE_UNAVAILABLE: FailureCode = FailureCode(503);
    pub const GATEWAY_TIMEOUT: FailureCode = FailureCode(504);

    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// Symbolic name of the code, `"UNKNOWN"` for anything unlisted.
    pub fn name(self) -> &'static str {
        match self.0 {
            400 => "BAD_SYNTAX",
            403 => "FORBIDDEN",
            404 => "NOT_FOUND",
            408 => "REQUEST_TIMEOUT",
            412 => "PRECONDITION_FAILED",
            420 => "CALM_DOWN",
            500 => "INTERNAL_ERROR",
            501 => "NOT_IMPLEMENTED",
            503 => "SERVICE_UNAVAILABLE",
            504 => "GATEWAY_TIMEOUT",
            _ => "UNKNOWN",
        }
    }
}

impl From<i32> for FailureCode {
    fn from(code: i32) -> Self {
        FailureCode(code)
    }
}

impl From<FailureCode> for i32 {
    fn from(code: FailureCode) -> Self {
        code.0
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a request on the bus did not succeed.
///
/// A `Failure` is an immutable value: a code from the HTTP-like taxonomy in
/// [`FailureCode`], a human readable reason and an optional diagnostic trace
/// (empty string when there is none). It is what a [`ReplyHandler`] receives
/// through `fail`, whatever the cause: no handler, handler error, timeout, or
/// an explicit failure sent back by the remote handler.
///
/// # Examples
///
/// ```
/// use loom_eventbus::{Failure, FailureCode};
///
/// let f = Failure::new(FailureCode::NOT_FOUND, "no such user");
/// assert_eq!(f.code(), FailureCode::NOT_FOUND);
/// assert_eq!(f.trace(), "");
/// assert_eq!(f.to_string(), "ERROR[404]");
/// ```
///
/// [`ReplyHandler`]: crate::handler::ReplyHandler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    code: FailureCode,
    reason: String,
    trace: String,
}

impl Failure {
    pub fn new(code: impl Into<FailureCode>, reason: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            reason: reason.into(),
            trace: String::new(),
        }
    }

    pub fn with_trace(
        code: impl Into<FailureCode>,
        reason: impl Into<String>,
        trace: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            reason: reason.into(),
            trace: trace.into(),
        }
    }

    /// Builds a failure from an underlying error. The reason is the error's
    /// `Display` text; the trace is its `Debug` rendering followed by one
    /// `Caused by:` line per error in the `source()` chain.
    pub fn from_error(code: impl Into<FailureCode>, cause: &(dyn StdError + 'static)) -> Self {
        Self {
            code: code.into(),
            reason: cause.to_string(),
            trace: diagnostic(cause),
        }
    }

    pub fn code(&self) -> FailureCode {
        self.code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn trace(&self) -> &str {
        &self.trace
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ERROR[{}]", self.code)
    }
}

fn diagnostic(cause: &(dyn StdError + 'static)) -> String {
    let mut out = format!("{:?}", cause);
    let mut source = cause.source();
    while let Some(err) = source {
        out.push_str("\nCaused by: ");
        out.push_str(&err.to_string());
        source = err.source();
    }
    out
}
