//! Success predicate: decides whether an output reports an error.

use regex::Regex;

use crate::error::{compile, Result};
use crate::CommandOutput;

/// Error markers recognised out of the box.
pub const DEFAULT_ERROR_MARKERS: &[&str] = &[
    r"(?i)^\s*%?\s*error\b",
    r"(?i)^\s*%\s*(invalid|incomplete|ambiguous|unknown) (input|command)",
    r"(?i)\binvalid (input|command)\b",
    r"(?i)\bcommand not found\b",
    r"(?i)^\s*syntax error\b",
];

/// Verdict of the success predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// No error detected
    Success,
    /// Error detected
    Failure(String),
}

/// Pattern-based success check: an output succeeds when no line carries an
/// error marker (and, unless disabled, the return code is zero).
#[derive(Debug, Clone)]
pub struct SuccessPredicate {
    markers: Vec<Regex>,
    check_return_code: bool,
}

impl SuccessPredicate {
    /// Build a predicate from marker patterns.
    pub fn new<S: AsRef<str>>(markers: &[S], check_return_code: bool) -> Result<Self> {
        let markers = markers
            .iter()
            .map(|m| compile(m.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { markers, check_return_code })
    }

    /// Judge one output.
    pub fn evaluate(&self, output: &CommandOutput) -> Verdict {
        if self.check_return_code && output.return_code != 0 {
            return Verdict::Failure(format!("return code {}", output.return_code));
        }
        for line in output.lines() {
            if let Some(marker) = self.markers.iter().find(|m| m.is_match(line)) {
                return Verdict::Failure(format!("error marker '{}' in: {}", marker.as_str(), line.trim()));
            }
        }
        Verdict::Success
    }
}

impl Default for SuccessPredicate {
    fn default() -> Self {
        Self {
            markers: DEFAULT_ERROR_MARKERS
                .iter()
                .filter_map(|m| Regex::new(m).ok())
                .collect(),
            check_return_code: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_output_passes() {
        let predicate = SuccessPredicate::default();
        let output = CommandOutput::from_text(0, "Version 1.2\nUptime 3 days", "");
        assert_eq!(predicate.evaluate(&output), Verdict::Success);
    }

    #[test]
    fn test_default_markers() {
        let predicate = SuccessPredicate::default();
        for text in [
            "% Invalid input detected at '^' marker.",
            "Error: interface not found",
            "sh: 1: frobnicate: command not found",
            "syntax error near token",
        ] {
            let output = CommandOutput::from_text(0, text, "");
            assert!(
                matches!(predicate.evaluate(&output), Verdict::Failure(_)),
                "expected failure for {text}"
            );
        }
    }

    #[test]
    fn test_marker_in_middle_of_word_ignored() {
        let predicate = SuccessPredicate::default();
        let output = CommandOutput::from_text(0, "errors: 0\ninput errors 0", "");
        assert_eq!(predicate.evaluate(&output), Verdict::Success);
    }

    #[test]
    fn test_return_code_check_toggle() {
        let output = CommandOutput::from_text(2, "fine", "");
        let strict = SuccessPredicate::new(&["FAIL"], true).unwrap();
        let lenient = SuccessPredicate::new(&["FAIL"], false).unwrap();
        assert!(matches!(strict.evaluate(&output), Verdict::Failure(_)));
        assert_eq!(lenient.evaluate(&output), Verdict::Success);
    }

    #[test]
    fn test_default_markers_compile() {
        assert!(SuccessPredicate::new(DEFAULT_ERROR_MARKERS, true).is_ok());
    }
}
