//! Section-level KDL parsing.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use anyhow::Result;
use certwarden_common::DomainName;
use kdl::KdlNode;
use tracing::trace;

use crate::{
    default_order_timeout, AcmeConfig, ChallengeConfig, LogFormat, LoggingConfig,
    ReloadHookConfig, RenewalConfig, SelfSignedConfig, LETSENCRYPT_PRODUCTION,
    LETSENCRYPT_STAGING,
};

use super::helpers::{
    ensure_known_children, find_child, get_string_args, get_string_entry, get_uint_entry,
};

/// Parse the `acme` block
pub fn parse_acme(node: &KdlNode) -> Result<AcmeConfig> {
    trace!("Parsing acme configuration block");
    ensure_known_children(
        node,
        &[
            "email",
            "production-directory",
            "staging-directory",
            "order-timeout-secs",
        ],
    )?;

    let email = get_string_entry(node, "email").ok_or_else(|| {
        anyhow::anyhow!(
            "acme block requires an 'email' field, e.g., email \"admin@example.com\""
        )
    })?;

    let config = AcmeConfig {
        email,
        production_directory: get_string_entry(node, "production-directory")
            .unwrap_or_else(|| LETSENCRYPT_PRODUCTION.to_string()),
        staging_directory: get_string_entry(node, "staging-directory")
            .unwrap_or_else(|| LETSENCRYPT_STAGING.to_string()),
        order_timeout_secs: get_uint_entry(node, "order-timeout-secs")?
            .unwrap_or_else(default_order_timeout),
    };

    trace!(
        production = %config.production_directory,
        staging = %config.staging_directory,
        "Parsed acme configuration"
    );

    Ok(config)
}

/// Parse the `challenge` block
pub fn parse_challenge(node: &KdlNode) -> Result<ChallengeConfig> {
    trace!("Parsing challenge configuration block");
    ensure_known_children(node, &["probe-timeout-secs", "http-port", "probe-address"])?;

    let defaults = ChallengeConfig::default();
    let mut probe_addresses: BTreeMap<String, SocketAddr> = BTreeMap::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() != "probe-address" {
                continue;
            }

            let args = get_string_args(child)?;
            let [domain, address] = args.as_slice() else {
                return Err(anyhow::anyhow!(
                    "probe-address takes a domain and a socket address, \
                     e.g., probe-address \"example.com\" \"10.0.0.5:80\""
                ));
            };

            let address: SocketAddr = address.parse().map_err(|e| {
                anyhow::anyhow!(
                    "Invalid probe-address '{}' for domain '{}': {}",
                    address,
                    domain,
                    e
                )
            })?;

            let domain = DomainName::parse(domain)
                .map_err(|e| anyhow::anyhow!("Invalid probe-address domain '{}': {}", domain, e))?;

            trace!(domain = %domain, address = %address, "Parsed probe address override");
            probe_addresses.insert(domain.into(), address);
        }
    }

    Ok(ChallengeConfig {
        probe_timeout_secs: get_uint_entry(node, "probe-timeout-secs")?
            .unwrap_or(defaults.probe_timeout_secs),
        http_port: get_uint_entry(node, "http-port")?.unwrap_or(defaults.http_port),
        probe_addresses,
    })
}

/// Parse the `renewal` block
pub fn parse_renewal(node: &KdlNode) -> Result<RenewalConfig> {
    trace!("Parsing renewal configuration block");
    ensure_known_children(
        node,
        &[
            "window-days",
            "interval-hours",
            "concurrency",
            "operation-timeout-secs",
            "lock-wait-secs",
        ],
    )?;

    let defaults = RenewalConfig::default();
    let config = RenewalConfig {
        window_days: get_uint_entry(node, "window-days")?.unwrap_or(defaults.window_days),
        interval_hours: get_uint_entry(node, "interval-hours")?
            .unwrap_or(defaults.interval_hours),
        concurrency: get_uint_entry(node, "concurrency")?.unwrap_or(defaults.concurrency),
        operation_timeout_secs: get_uint_entry(node, "operation-timeout-secs")?
            .unwrap_or(defaults.operation_timeout_secs),
        lock_wait_secs: get_uint_entry(node, "lock-wait-secs")?
            .unwrap_or(defaults.lock_wait_secs),
    };

    trace!(
        window_days = config.window_days,
        concurrency = config.concurrency,
        interval_hours = config.interval_hours,
        "Parsed renewal configuration"
    );

    Ok(config)
}

/// Parse the `self-signed` block
pub fn parse_self_signed(node: &KdlNode) -> Result<SelfSignedConfig> {
    ensure_known_children(node, &["validity-days"])?;

    Ok(SelfSignedConfig {
        validity_days: get_uint_entry(node, "validity-days")?
            .unwrap_or(SelfSignedConfig::default().validity_days),
    })
}

/// Parse the `reload-hook` block
pub fn parse_reload_hook(node: &KdlNode) -> Result<ReloadHookConfig> {
    trace!("Parsing reload-hook configuration block");
    ensure_known_children(node, &["command", "retries", "retry-delay-secs"])?;

    let command = match find_child(node, "command") {
        Some(child) => get_string_args(child)?,
        None => Vec::new(),
    };

    if command.is_empty() {
        return Err(anyhow::anyhow!(
            "reload-hook requires a 'command', e.g., command \"systemctl\" \"reload\" \"nginx\""
        ));
    }

    Ok(ReloadHookConfig {
        command,
        retries: get_uint_entry(node, "retries")?.unwrap_or(3),
        retry_delay_secs: get_uint_entry(node, "retry-delay-secs")?.unwrap_or(5),
    })
}

/// Parse the `logging` block
pub fn parse_logging(node: &KdlNode) -> Result<LoggingConfig> {
    ensure_known_children(node, &["level", "format"])?;

    let defaults = LoggingConfig::default();
    let format = match get_string_entry(node, "format").as_deref() {
        None => defaults.format,
        Some("pretty") => LogFormat::Pretty,
        Some("json") => LogFormat::Json,
        Some(other) => {
            return Err(anyhow::anyhow!(
                "Invalid log format '{}'. Valid formats: pretty, json",
                other
            ));
        }
    };

    Ok(LoggingConfig {
        level: get_string_entry(node, "level").unwrap_or(defaults.level),
        format,
    })
}
