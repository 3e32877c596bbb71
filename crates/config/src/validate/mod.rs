//! Environment validation
//!
//! Goes beyond [`Config::validate`](crate::Config::validate) by looking at the
//! machine the configuration runs on: storage permissions, probe address
//! reachability and best-practice lints. Used by `certwarden test`.

mod lint;
mod network;
mod storage;

use std::fmt;

use crate::Config;

pub use lint::lint_config;
pub use network::validate_probe_addresses;
pub use storage::validate_storage;

/// Category of a validation error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Storage,
    Network,
    Acme,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Storage => write!(f, "storage"),
            ErrorCategory::Network => write!(f, "network"),
            ErrorCategory::Acme => write!(f, "acme"),
        }
    }
}

/// A problem that prevents certwarden from working
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ValidationError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

/// A problem worth reporting that does not prevent operation
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Collected errors and warnings
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Run every environment check
pub async fn validate_environment(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    result.merge(validate_storage(config).await);
    result.merge(validate_probe_addresses(config).await);
    result.merge(lint_config(config));
    result
}
