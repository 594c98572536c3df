use std::sync::OnceLock;

use regex::Regex;
use tracing::{error, warn};

use crate::error::AgentError;

/// Vendor error identifiers look like `CMMVC<digits>` followed by a
/// severity letter: `W` for warning, `E` for error.
const ERROR_CODE_PATTERN: &str = r"CMMVC[0-9]+[EW]";

/// The action failed as the object already exists.
pub const OBJECT_EXISTS: &str = "CMMVC6035E";

/// The specified object does not exist.
pub const OBJECT_NOT_EXISTS: &str = "CMMVC5753E";

fn error_code_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(ERROR_CODE_PATTERN).expect("static pattern"))
}

/// The first vendor error code embedded in a failure message, if any.
pub fn extract_error_code(text: &str) -> Option<&str> {
    error_code_regex().find(text).map(|m| m.as_str())
}

pub fn is_warning_message(code: &str) -> bool {
    code.ends_with('W')
}

pub fn is_object_exists(code: &str) -> bool {
    code == OBJECT_EXISTS
}

pub fn is_object_not_exists(code: &str) -> bool {
    code == OBJECT_NOT_EXISTS
}

/// Classifies a vendor CLI failure into retry/ignore/fail policy.
///
/// Warnings and "object already exists" are downgraded to success;
/// "object does not exist" is downgraded only when the caller opted in.
pub struct ErrorPreprocessor {
    skip_not_existing_object: bool,
}

impl ErrorPreprocessor {
    pub fn new(skip_not_existing_object: bool) -> Self {
        ErrorPreprocessor {
            skip_not_existing_object,
        }
    }

    /// Returns `(is_real_error, code)`; the original error stays with the
    /// caller for re-raising.
    pub fn process(&self, err: &AgentError) -> (bool, String) {
        let message = err.to_string();
        let Some(code) = extract_error_code(&message) else {
            return (false, String::new());
        };

        if is_warning_message(code) || is_object_exists(code) {
            warn!(code, "action succeeded with warning: {message}");
            return (false, code.to_string());
        }

        if self.skip_not_existing_object && is_object_not_exists(code) {
            warn!(code, "action succeeded with warning: {message}");
            return (false, code.to_string());
        }

        error!(code, "action failed with error: {message}");
        (true, code.to_string())
    }
}
