//! Certificate introspection
//!
//! Turns PEM (or raw DER) certificate material into [`CertificateInfo`].
//! Everything here is pure: no I/O and no logging of material.
//!
//! A bundle is accepted anywhere a single certificate is; the first
//! certificate in the bundle is the leaf.

use chrono::{DateTime, Utc};
use rcgen::PublicKeyData;
use sha2::{Digest, Sha256};
use x509_parser::parse_x509_certificate;
use x509_parser::prelude::*;

use crate::error::LifecycleError;

const PEM_CERTIFICATE_TAG: &str = "CERTIFICATE";

/// Structured fields of a leaf certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// First subject common name, if any
    pub common_name: Option<String>,
    /// Full subject in RFC 4514 form
    pub subject: String,
    /// DNS and IP subject alternative names
    pub sans: Vec<String>,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub public_key_algorithm: String,
    pub signature_algorithm: String,
    /// Colon-separated hex serial
    pub serial: String,
    /// Lowercase hex SHA-256 of the DER encoding
    pub fingerprint_sha256: String,
    pub is_self_signed: bool,
    /// DER SubjectPublicKeyInfo, used to match private keys
    pub subject_public_key_info: Vec<u8>,
}

impl CertificateInfo {
    /// Whether the certificate is valid for `domain` by SAN or, failing
    /// that, by subject common name
    pub fn covers(&self, domain: &str) -> bool {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        self.sans
            .iter()
            .chain(self.common_name.iter())
            .any(|name| name_matches(name, &domain))
    }

    /// Length of the validity window in whole days
    pub fn validity_days(&self) -> i64 {
        (self.not_after - self.not_before).num_days()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.not_after < now
    }
}

/// Parse the leaf of a PEM bundle or a DER certificate
pub fn parse(material: &[u8]) -> Result<CertificateInfo, LifecycleError> {
    let der = leaf_der(material)?;
    parse_der(&der)
}

/// DER bytes of the leaf certificate
pub fn leaf_der(material: &[u8]) -> Result<Vec<u8>, LifecycleError> {
    if !looks_like_pem(material) {
        if material.is_empty() {
            return Err(LifecycleError::malformed("certificate material is empty"));
        }
        return Ok(material.to_vec());
    }

    let blocks = ::pem::parse_many(material)
        .map_err(|e| LifecycleError::malformed(format!("invalid PEM: {}", e)))?;

    blocks
        .into_iter()
        .find(|block| block.tag() == PEM_CERTIFICATE_TAG)
        .map(|block| block.contents().to_vec())
        .ok_or_else(|| LifecycleError::malformed("no CERTIFICATE block found"))
}

/// Split a PEM bundle into its leaf and the remaining chain
pub fn split_bundle(bundle: &str) -> Result<(String, Option<String>), LifecycleError> {
    let blocks = ::pem::parse_many(bundle)
        .map_err(|e| LifecycleError::malformed(format!("invalid PEM: {}", e)))?;

    let mut certificates = blocks
        .into_iter()
        .filter(|block| block.tag() == PEM_CERTIFICATE_TAG);

    let leaf = certificates
        .next()
        .ok_or_else(|| LifecycleError::malformed("no CERTIFICATE block found"))?;

    let chain: String = certificates.map(|block| ::pem::encode(&block)).collect();
    let chain = if chain.is_empty() { None } else { Some(chain) };

    Ok((::pem::encode(&leaf), chain))
}

/// Check every block of a chain is a parsable certificate
pub fn validate_chain(chain: &str) -> Result<usize, LifecycleError> {
    let blocks = ::pem::parse_many(chain)
        .map_err(|e| LifecycleError::malformed(format!("invalid chain PEM: {}", e)))?;

    let mut count = 0;
    for block in blocks.iter().filter(|b| b.tag() == PEM_CERTIFICATE_TAG) {
        parse_der(block.contents())?;
        count += 1;
    }

    if count == 0 {
        return Err(LifecycleError::malformed("chain holds no CERTIFICATE block"));
    }
    Ok(count)
}

/// Whether a PEM private key belongs to the certificate
pub fn key_matches(info: &CertificateInfo, private_key_pem: &str) -> Result<bool, LifecycleError> {
    let key_pair = rcgen::KeyPair::from_pem(private_key_pem)
        .map_err(|e| LifecycleError::malformed(format!("private key could not be parsed: {}", e)))?;

    Ok(key_pair.subject_public_key_info() == info.subject_public_key_info)
}

fn parse_der(der: &[u8]) -> Result<CertificateInfo, LifecycleError> {
    let (_, cert) = parse_x509_certificate(der)
        .map_err(|e| LifecycleError::malformed(format!("invalid X.509 certificate: {}", e)))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);

    let mut sans = Vec::new();
    let san_extension = cert
        .subject_alternative_name()
        .map_err(|e| LifecycleError::malformed(format!("invalid subjectAltName: {}", e)))?;
    if let Some(extension) = san_extension {
        for name in &extension.value.general_names {
            match name {
                GeneralName::DNSName(dns) => sans.push(dns.to_string()),
                GeneralName::IPAddress(bytes) => {
                    if let Some(ip) = ip_from_bytes(bytes) {
                        sans.push(ip);
                    }
                }
                _ => {}
            }
        }
    }

    let validity = cert.validity();
    let not_before = timestamp(validity.not_before.timestamp())?;
    let not_after = timestamp(validity.not_after.timestamp())?;

    Ok(CertificateInfo {
        common_name,
        subject: cert.subject().to_string(),
        sans,
        issuer: cert.issuer().to_string(),
        not_before,
        not_after,
        public_key_algorithm: algorithm_name(&cert.public_key().algorithm.algorithm.to_id_string()),
        signature_algorithm: algorithm_name(&cert.signature_algorithm.algorithm.to_id_string()),
        serial: cert.raw_serial_as_string(),
        fingerprint_sha256: hex::encode(Sha256::digest(der)),
        is_self_signed: cert.subject().as_raw() == cert.issuer().as_raw(),
        subject_public_key_info: cert.public_key().raw.to_vec(),
    })
}

fn looks_like_pem(material: &[u8]) -> bool {
    material
        .windows(b"-----BEGIN".len())
        .any(|window| window == b"-----BEGIN")
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, LifecycleError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| LifecycleError::malformed("validity timestamp out of range"))
}

fn ip_from_bytes(bytes: &[u8]) -> Option<String> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(std::net::Ipv4Addr::from(octets).to_string())
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(std::net::Ipv6Addr::from(octets).to_string())
        }
        _ => None,
    }
}

/// Common algorithm names by OID; unknown OIDs are shown dotted
fn algorithm_name(oid: &str) -> String {
    let name = match oid {
        "1.2.840.113549.1.1.1" => "RSA",
        "1.2.840.10045.2.1" => "EC",
        "1.3.101.112" => "Ed25519",
        "1.3.101.113" => "Ed448",
        "1.2.840.113549.1.1.5" => "sha1WithRSAEncryption",
        "1.2.840.113549.1.1.10" => "RSASSA-PSS",
        "1.2.840.113549.1.1.11" => "sha256WithRSAEncryption",
        "1.2.840.113549.1.1.12" => "sha384WithRSAEncryption",
        "1.2.840.113549.1.1.13" => "sha512WithRSAEncryption",
        "1.2.840.10045.4.3.2" => "ecdsa-with-SHA256",
        "1.2.840.10045.4.3.3" => "ecdsa-with-SHA384",
        "1.2.840.10045.4.3.4" => "ecdsa-with-SHA512",
        other => return other.to_string(),
    };
    name.to_string()
}

/// Exact match, or a single-label wildcard (`*.example.com` covers
/// `www.example.com` but neither `example.com` nor `a.b.example.com`)
fn name_matches(pattern: &str, domain: &str) -> bool {
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();

    if let Some(suffix) = pattern.strip_prefix("*.") {
        return match domain.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest == suffix,
            None => false,
        };
    }

    pattern == domain
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};

    fn self_signed(names: &[&str]) -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let params =
            CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
                .unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn test_parse_extracts_names() {
        let (cert, _) = self_signed(&["example.com", "www.example.com"]);
        let info = parse(cert.as_bytes()).unwrap();

        assert_eq!(info.sans, vec!["example.com", "www.example.com"]);
        assert!(info.is_self_signed);
        assert_eq!(info.public_key_algorithm, "EC");
        assert_eq!(info.signature_algorithm, "ecdsa-with-SHA256");
        assert_eq!(info.fingerprint_sha256.len(), 64);
        assert!(!info.serial.is_empty());
    }

    #[test]
    fn test_parse_accepts_der() {
        let (cert, _) = self_signed(&["example.com"]);
        let der = leaf_der(cert.as_bytes()).unwrap();

        let from_der = parse(&der).unwrap();
        let from_pem = parse(cert.as_bytes()).unwrap();
        assert_eq!(from_der, from_pem);
    }

    #[test]
    fn test_bundle_uses_first_certificate_as_leaf() {
        let (leaf, _) = self_signed(&["leaf.example"]);
        let (intermediate, _) = self_signed(&["intermediate.example"]);
        let bundle = format!("{}{}", leaf, intermediate);

        let info = parse(bundle.as_bytes()).unwrap();
        assert!(info.covers("leaf.example"));
        assert!(!info.covers("intermediate.example"));

        let (split_leaf, chain) = split_bundle(&bundle).unwrap();
        assert!(parse(split_leaf.as_bytes()).unwrap().covers("leaf.example"));
        assert_eq!(validate_chain(&chain.unwrap()).unwrap(), 1);
    }

    #[test]
    fn test_split_bundle_without_chain() {
        let (leaf, _) = self_signed(&["solo.example"]);
        let (_, chain) = split_bundle(&leaf).unwrap();
        assert!(chain.is_none());
    }

    #[test]
    fn test_malformed_input() {
        assert!(matches!(
            parse(b""),
            Err(LifecycleError::MalformedMaterial(_))
        ));
        assert!(matches!(
            parse(b"definitely not a certificate"),
            Err(LifecycleError::MalformedMaterial(_))
        ));
        assert!(matches!(
            parse(b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n"),
            Err(LifecycleError::MalformedMaterial(_))
        ));

        let key = KeyPair::generate().unwrap().serialize_pem();
        assert!(matches!(
            parse(key.as_bytes()),
            Err(LifecycleError::MalformedMaterial(_))
        ));
    }

    #[test]
    fn test_key_matching() {
        let (cert, key) = self_signed(&["example.com"]);
        let (_, other_key) = self_signed(&["example.com"]);
        let info = parse(cert.as_bytes()).unwrap();

        assert!(key_matches(&info, &key).unwrap());
        assert!(!key_matches(&info, &other_key).unwrap());
        assert!(key_matches(&info, "garbage").is_err());
    }

    #[test]
    fn test_wildcard_matching() {
        assert!(name_matches("*.example.com", "www.example.com"));
        assert!(!name_matches("*.example.com", "example.com"));
        assert!(!name_matches("*.example.com", "a.b.example.com"));
        assert!(name_matches("Example.COM.", "example.com"));
        assert!(!name_matches("example.org", "example.com"));
    }

    #[test]
    fn test_covers_is_case_insensitive() {
        let (cert, _) = self_signed(&["*.example.com"]);
        let info = parse(cert.as_bytes()).unwrap();

        assert!(info.covers("API.example.com"));
        assert!(!info.covers("example.com"));
    }
}
