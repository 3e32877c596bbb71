//! Configuration linting for best practices
//!
//! Checks configuration for missing best practices and potential issues.

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::{Config, LETSENCRYPT_STAGING};

/// Lint configuration for best practices
pub fn lint_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    match &config.acme {
        None => {
            result.add_warning(ValidationWarning::new(
                "No acme block configured: only self-signed and custom certificates can be issued",
            ));
        }
        Some(acme) => {
            for (label, directory) in [
                ("production-directory", &acme.production_directory),
                ("staging-directory", &acme.staging_directory),
            ] {
                match url::Url::parse(directory) {
                    Ok(url) if url.scheme() == "https" => {}
                    Ok(url) => {
                        result.add_warning(ValidationWarning::new(format!(
                            "acme {} uses '{}' instead of https",
                            label,
                            url.scheme()
                        )));
                    }
                    Err(e) => {
                        result.add_error(ValidationError::new(
                            ErrorCategory::Acme,
                            format!("acme {} is not a valid URL: {}", label, e),
                        ));
                    }
                }
            }

            if acme.production_directory == LETSENCRYPT_STAGING {
                result.add_warning(ValidationWarning::new(
                    "acme production-directory points at the Let's Encrypt staging \
                     environment; issued certificates will not be trusted",
                ));
            }
        }
    }

    // Without a reload hook new material sits on disk until the web server
    // restarts for some other reason
    if config.reload_hook.is_none() {
        result.add_warning(ValidationWarning::new(
            "No reload-hook configured: the web server will not pick up new certificates automatically",
        ));
    }

    if config.renewal.window_days < 7 {
        result.add_warning(ValidationWarning::new(format!(
            "renewal window of {} day(s) leaves little room to recover from failed renewals",
            config.renewal.window_days
        )));
    }

    if config.renewal.concurrency > 16 {
        result.add_warning(ValidationWarning::new(format!(
            "renewal concurrency {} may exceed certificate authority rate limits",
            config.renewal.concurrency
        )));
    }

    result
}
