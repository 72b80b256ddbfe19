//! Configuration checks run before any queue is touched.
//!
//! [`schema`] covers shape (queue names, URLs), [`semantic`] covers values
//! that parse but cannot work together. [`report`] renders the result for
//! `config-validate` and for the loader's log.

pub mod report;
pub mod schema;
pub mod semantic;

use crate::config::model::AppConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationSeverity {
    /// The pipeline refuses to start.
    Error,
    Warning,
}

/// One problem with one config field.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub severity: ValidationSeverity,
    /// Dotted field path, e.g. `consumer.visibility_timeout_seconds`.
    pub path: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    pub fn error(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ValidationSeverity::Error, path.into(), message.into())
    }

    pub fn warning(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ValidationSeverity::Warning, path.into(), message.into())
    }

    fn new(severity: ValidationSeverity, path: String, message: String) -> Self {
        Self {
            severity,
            path,
            message,
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    fn is_error(&self) -> bool {
        self.severity == ValidationSeverity::Error
    }
}

/// Issues collected across all checks, in the order they were found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, issue: ValidationIssue) {
        self.issues.push(issue);
    }

    /// Warnings alone never block startup.
    pub fn is_valid(&self) -> bool {
        !self.issues.iter().any(ValidationIssue::is_error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.is_error())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| !i.is_error())
    }

    pub fn issue_count(&self) -> usize {
        self.issues.len()
    }

    pub fn error_count(&self) -> usize {
        self.errors().count()
    }
}

impl FromIterator<ValidationIssue> for ValidationResult {
    fn from_iter<I: IntoIterator<Item = ValidationIssue>>(iter: I) -> Self {
        Self {
            issues: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for ValidationResult {
    type Item = ValidationIssue;
    type IntoIter = std::vec::IntoIter<ValidationIssue>;

    fn into_iter(self) -> Self::IntoIter {
        self.issues.into_iter()
    }
}

/// Runs the schema checks, then the semantic ones.
pub fn validate_config(config: &AppConfig) -> ValidationResult {
    schema::validate(config)
        .into_iter()
        .chain(semantic::validate(config))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_do_not_invalidate() {
        let result: ValidationResult = [
            ValidationIssue::warning("monitor.alert_threshold", "disabled"),
            ValidationIssue::warning("consumer.poll_interval_ms", "spins"),
        ]
        .into_iter()
        .collect();

        assert!(result.is_valid());
        assert_eq!(result.issue_count(), 2);
        assert_eq!(result.error_count(), 0);
    }

    #[test]
    fn default_config_passes_every_check() {
        let result = validate_config(&AppConfig::default());
        assert!(result.is_valid());
        assert_eq!(result.issue_count(), 0);
    }
}
