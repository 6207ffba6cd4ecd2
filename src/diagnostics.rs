//! Diagnostic severities and per-compilation counts.
//!
//! Fatal problems abort the current phase through an error value; severe
//! problems and warnings are only collected here and surfaced afterwards so
//! the user can decide whether to continue with the real run.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::program::Location;

/// Severity of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    /// Aborts the current phase
    Fatal,
    /// Serious but recoverable
    Severe,
    /// Informational
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Fatal => "fatal",
            Severity::Severe => "severe",
            Severity::Warning => "warning",
        })
    }
}

/// One reported problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// How bad it is
    pub severity: Severity,
    /// What happened
    pub message: String,
    /// Where it happened, when known
    pub location: Option<Location>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{location}: {}: {}", self.severity, self.message),
            None => write!(f, "{}: {}", self.severity, self.message),
        }
    }
}

/// Diagnostics accumulated during one compilation or run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a diagnostic and log it.
    pub fn report(
        &mut self,
        severity: Severity,
        message: impl Into<String>,
        location: Option<Location>,
    ) {
        let diagnostic = Diagnostic {
            severity,
            message: message.into(),
            location,
        };
        match severity {
            Severity::Fatal => tracing::error!("{diagnostic}"),
            Severity::Severe | Severity::Warning => tracing::warn!("{diagnostic}"),
        }
        self.entries.push(diagnostic);
    }

    /// Record a warning.
    pub fn warn(&mut self, message: impl Into<String>, location: &Location) {
        self.report(Severity::Warning, message, Some(location.clone()));
    }

    /// Record a severe diagnostic.
    pub fn severe(&mut self, message: impl Into<String>, location: &Location) {
        self.report(Severity::Severe, message, Some(location.clone()));
    }

    /// Number of diagnostics with the given severity.
    pub fn count(&self, severity: Severity) -> usize {
        self.entries
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    /// Whether anything at all was reported.
    pub fn is_clean(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether severe diagnostics or warnings call for a continue/abort decision.
    pub fn needs_confirmation(&self) -> bool {
        self.count(Severity::Severe) > 0 || self.count(Severity::Warning) > 0
    }

    /// All diagnostics in the order they were reported.
    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter()
    }

    /// Append all diagnostics from `other`.
    pub fn merge(&mut self, other: Diagnostics) {
        self.entries.extend(other.entries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_per_severity() {
        let loc = Location::new("d.edl", 3);
        let mut diagnostics = Diagnostics::new();
        assert!(diagnostics.is_clean());
        diagnostics.warn("truncated", &loc);
        diagnostics.warn("truncated again", &loc);
        diagnostics.severe("negative count", &loc);
        assert_eq!(diagnostics.count(Severity::Warning), 2);
        assert_eq!(diagnostics.count(Severity::Severe), 1);
        assert_eq!(diagnostics.count(Severity::Fatal), 0);
        assert!(diagnostics.needs_confirmation());
        assert_eq!(
            diagnostics.iter().next().unwrap().to_string(),
            "d.edl:3: warning: truncated"
        );
    }
}
