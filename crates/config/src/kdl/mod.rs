//! KDL document parsing.

mod helpers;
mod sections;

use std::path::PathBuf;

use anyhow::Result;
use kdl::KdlDocument;
use tracing::trace;

use crate::Config;

use helpers::get_first_arg_string;

const TOP_LEVEL_NODES: &[&str] = &[
    "storage",
    "webroot",
    "acme",
    "challenge",
    "renewal",
    "self-signed",
    "reload-hook",
    "logging",
];

/// Build a [`Config`] from a parsed document, filling defaults for
/// everything that is absent
pub fn parse_document(doc: &KdlDocument) -> Result<Config> {
    let mut config = Config::default();

    for node in doc.nodes() {
        let name = node.name().value();
        trace!(node = %name, "Parsing top-level node");

        match name {
            "storage" => {
                let path = get_first_arg_string(node).ok_or_else(|| {
                    anyhow::anyhow!("storage requires a path, e.g., storage \"/var/lib/certwarden\"")
                })?;
                config.storage = PathBuf::from(path);
            }
            "webroot" => {
                config.webroot = get_first_arg_string(node).ok_or_else(|| {
                    anyhow::anyhow!(
                        "webroot requires a path template, e.g., webroot \"/srv/www/{{domain}}\""
                    )
                })?;
            }
            "acme" => config.acme = Some(sections::parse_acme(node)?),
            "challenge" => config.challenge = sections::parse_challenge(node)?,
            "renewal" => config.renewal = sections::parse_renewal(node)?,
            "self-signed" => config.self_signed = sections::parse_self_signed(node)?,
            "reload-hook" => config.reload_hook = Some(sections::parse_reload_hook(node)?),
            "logging" => config.logging = sections::parse_logging(node)?,
            other => {
                return Err(anyhow::anyhow!(
                    "Unknown top-level node '{}'. Valid nodes: {}",
                    other,
                    TOP_LEVEL_NODES.join(", ")
                ));
            }
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use crate::{Config, LogFormat};
    use std::path::PathBuf;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = Config::from_kdl("").unwrap();
        assert!(config.acme.is_none());
        assert_eq!(config.renewal.window_days, 30);
        assert_eq!(config.challenge.probe_timeout_secs, 10);
        assert_eq!(config.self_signed.validity_days, 365);
    }

    #[test]
    fn test_full_document() {
        let config = Config::from_kdl(
            r#"
            storage "/tmp/certwarden"
            webroot "/srv/www/{domain}/public"
            acme {
                email "admin@example.com"
                staging-directory "https://acme.test/dir"
                order-timeout-secs 60
            }
            challenge {
                probe-timeout-secs 5
                http-port 8080
                probe-address "Internal.Example" "10.0.0.5:80"
            }
            renewal {
                window-days 21
                interval-hours 6
                concurrency 8
                operation-timeout-secs 120
                lock-wait-secs 0
            }
            self-signed {
                validity-days 90
            }
            reload-hook {
                command "systemctl" "reload" "nginx"
                retries 2
            }
            logging {
                level "debug"
                format "json"
            }
            "#,
        )
        .unwrap();

        assert_eq!(config.storage, PathBuf::from("/tmp/certwarden"));
        let acme = config.acme.as_ref().unwrap();
        assert_eq!(acme.email, "admin@example.com");
        assert_eq!(acme.staging_directory, "https://acme.test/dir");
        assert_eq!(acme.production_directory, crate::LETSENCRYPT_PRODUCTION);
        assert_eq!(acme.order_timeout_secs, 60);

        assert_eq!(config.challenge.http_port, 8080);
        assert_eq!(
            config.challenge.probe_addresses.get("internal.example"),
            Some(&"10.0.0.5:80".parse().unwrap())
        );

        assert_eq!(config.renewal.window_days, 21);
        assert_eq!(config.renewal.concurrency, 8);
        assert_eq!(config.renewal.lock_wait_secs, 0);
        assert_eq!(config.self_signed.validity_days, 90);

        let hook = config.reload_hook.as_ref().unwrap();
        assert_eq!(hook.command, vec!["systemctl", "reload", "nginx"]);
        assert_eq!(hook.retries, 2);
        assert_eq!(hook.retry_delay_secs, 5);

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);

        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_top_level_node() {
        let err = Config::from_kdl("listeners { }").unwrap_err();
        assert!(err.to_string().contains("Unknown top-level node"));
    }

    #[test]
    fn test_acme_requires_email() {
        assert!(Config::from_kdl("acme { }").is_err());
    }

    #[test]
    fn test_bad_probe_address() {
        let err = Config::from_kdl(r#"challenge { probe-address "a.example" "nowhere" }"#)
            .unwrap_err();
        assert!(err.to_string().contains("Invalid probe-address"));
    }

    #[test]
    fn test_syntax_error_reported() {
        assert!(Config::from_kdl("storage \"unterminated").is_err());
    }

    #[test]
    fn test_reload_hook_requires_command() {
        assert!(Config::from_kdl("reload-hook { retries 1 }").is_err());
    }
}
