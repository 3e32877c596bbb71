//! Network connectivity validation
//!
//! Validates that configured probe address overrides are reachable.

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Validate probe address connectivity
pub async fn validate_probe_addresses(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let probe_timeout = config.challenge.probe_timeout();

    for (domain, address) in &config.challenge.probe_addresses {
        match timeout(probe_timeout, TcpStream::connect(address)).await {
            Ok(Ok(_)) => {
                // Connection successful
            }
            Ok(Err(e)) => {
                result.add_error(ValidationError::new(
                    ErrorCategory::Network,
                    format!(
                        "Probe address '{}' for domain '{}' unreachable: {}",
                        address, domain, e
                    ),
                ));
            }
            Err(_) => {
                result.add_warning(ValidationWarning::new(format!(
                    "Probe address '{}' for domain '{}' connection timeout ({}s)",
                    address,
                    domain,
                    probe_timeout.as_secs()
                )));
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_probe_address_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = Config::default();
        config
            .challenge
            .probe_addresses
            .insert("ok.example".to_string(), listener.local_addr().unwrap());

        let result = validate_probe_addresses(&config).await;
        assert!(result.errors.is_empty());
        assert!(result.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_probe_address_unreachable() {
        let mut config = Config::default();
        config.challenge.probe_timeout_secs = 1;
        config.challenge.probe_addresses.insert(
            "test.example".to_string(),
            "192.0.2.1:9999".parse().unwrap(), // TEST-NET-1 (unreachable)
        );

        let result = validate_probe_addresses(&config).await;

        // Should have either an error or warning (depending on timeout)
        assert!(!result.errors.is_empty() || !result.warnings.is_empty());
    }
}
