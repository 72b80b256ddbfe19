//! Validation report formatting.

use std::fmt;

use super::{ValidationIssue, ValidationResult, ValidationSeverity};

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.severity {
            ValidationSeverity::Error => "ERROR",
            ValidationSeverity::Warning => "WARNING",
        };
        writeln!(f, "{} {}", label, self.path)?;
        writeln!(f, "  └─ {}", self.message)?;
        if let Some(suggestion) = &self.suggestion {
            writeln!(f, "     hint: {}", suggestion)?;
        }
        Ok(())
    }
}

/// Formats a validation result for the terminal, errors first.
pub fn format_report(result: &ValidationResult) -> String {
    if result.issue_count() == 0 {
        return "Configuration is valid.".to_string();
    }

    let error_count = result.error_count();
    let warning_count = result.issue_count() - error_count;

    let mut report = String::new();
    if error_count > 0 {
        report.push_str("\nConfig Validation Failed\n");
        report.push_str("========================\n\n");
    }

    for issue in result.errors().chain(result.warnings()) {
        report.push_str(&issue.to_string());
        report.push('\n');
    }

    report.push_str(&format!(
        "---\n{} error(s), {} warning(s)\n",
        error_count, warning_count
    ));
    if error_count > 0 {
        report.push_str("Config rejected.\n");
    }

    report
}
