//! Storage validation
//!
//! Checks that the storage directory can be created and written, since
//! every issuance ends with writing records and material there.

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;

const PROBE_FILE: &str = ".certwarden-write-test";

/// Validate the storage directory
pub async fn validate_storage(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let storage = &config.storage;

    if let Err(e) = tokio::fs::create_dir_all(storage).await {
        result.add_error(ValidationError::new(
            ErrorCategory::Storage,
            format!("Cannot create storage directory {:?}: {}", storage, e),
        ));
        return result;
    }

    let probe = storage.join(PROBE_FILE);
    match tokio::fs::write(&probe, b"ok").await {
        Ok(()) => {
            let _ = tokio::fs::remove_file(&probe).await;
        }
        Err(e) => {
            result.add_error(ValidationError::new(
                ErrorCategory::Storage,
                format!("Storage directory {:?} is not writable: {}", storage, e),
            ));
            return result;
        }
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = tokio::fs::metadata(storage).await {
            if meta.permissions().mode() & 0o077 != 0 {
                result.add_warning(ValidationWarning::new(format!(
                    "Storage directory {:?} is accessible by other users (private keys live here)",
                    storage
                )));
            }
        }
    }

    result
}
