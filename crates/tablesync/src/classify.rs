//! Error classifier for extraction failures.
//!
//! Runtime failures during extraction (primarily HTTP endpoints) are mapped
//! into a closed set of classes. Each class resolves, through the endpoint's
//! `ErrorHandling` configuration, to an exit action: fail immediately or
//! retry up to the engine's retry budget. Unmapped classes fail with a
//! generic non-zero exit code.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of extraction attempts before a `Retry` action gives up.
///
/// Retries apply only to the extraction phase, never to the merge
/// transaction.
pub const RETRY_BUDGET: u32 = 3;

/// Closed set of extraction failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Transport-level failure (DNS, connect, TLS, timeout).
    NetworkError,
    /// HTTP response status in [400, 499].
    Http4XXError,
    /// HTTP response status in [500, 599].
    Http5XXError,
    /// Response body failed to parse per the declared response type.
    InvalidBodyError,
}

impl ErrorClass {
    /// All classes, in declaration order.
    pub const ALL: [ErrorClass; 4] = [
        ErrorClass::NetworkError,
        ErrorClass::Http4XXError,
        ErrorClass::Http5XXError,
        ErrorClass::InvalidBodyError,
    ];

    /// Parse a class from its configuration name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "NetworkError" => Some(ErrorClass::NetworkError),
            "Http4XXError" => Some(ErrorClass::Http4XXError),
            "Http5XXError" => Some(ErrorClass::Http5XXError),
            "InvalidBodyError" => Some(ErrorClass::InvalidBodyError),
            _ => None,
        }
    }

    /// Classify an HTTP status code. Statuses outside [400, 599] do not
    /// classify as errors.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            400..=499 => Some(ErrorClass::Http4XXError),
            500..=599 => Some(ErrorClass::Http5XXError),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::NetworkError => "NetworkError",
            ErrorClass::Http4XXError => "Http4XXError",
            ErrorClass::Http5XXError => "Http5XXError",
            ErrorClass::InvalidBodyError => "InvalidBodyError",
        };
        f.write_str(name)
    }
}

/// Action taken when an error class is hit, carrying its process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitAction {
    /// Abort the table's run immediately.
    Fail,
    /// Retry the extraction up to [`RETRY_BUDGET`] attempts, then fail.
    Retry,
}

impl ExitAction {
    /// Numeric code exposed to the configuration DSL and used as the
    /// process exit code when the action ultimately fails.
    pub fn code(self) -> i32 {
        match self {
            ExitAction::Fail => 1,
            ExitAction::Retry => 2,
        }
    }

    /// Parse the numeric code used by the DSL.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(ExitAction::Fail),
            2 => Some(ExitAction::Retry),
            _ => None,
        }
    }
}

/// Per-endpoint error handling policy: class to action.
///
/// Classes absent from the map resolve to `Fail`.
#[derive(Debug, Clone, Default)]
pub struct ErrorPolicy {
    actions: HashMap<ErrorClass, ExitAction>,
}

impl ErrorPolicy {
    pub fn new(actions: HashMap<ErrorClass, ExitAction>) -> Self {
        Self { actions }
    }

    /// Resolve the action for a class. Unmapped classes fail.
    pub fn action_for(&self, class: ErrorClass) -> ExitAction {
        self.actions.get(&class).copied().unwrap_or(ExitAction::Fail)
    }

    pub fn insert(&mut self, class: ErrorClass, action: ExitAction) {
        self.actions.insert(class, action);
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Classify a transport-level reqwest failure.
///
/// Anything that produced no HTTP status is a network error; a status in
/// the error ranges classifies by range; decode failures are invalid-body.
pub fn classify_http_error(err: &reqwest::Error) -> ErrorClass {
    if let Some(status) = err.status() {
        if let Some(class) = ErrorClass::from_status(status.as_u16()) {
            return class;
        }
    }
    if err.is_decode() || err.is_body() {
        return ErrorClass::InvalidBodyError;
    }
    ErrorClass::NetworkError
}
