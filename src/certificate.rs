//! A DER-encoded leaf certificate, parsed just far enough to answer the
//! questions the rest of the crate needs: is it expired, and what hostnames
//! does it cover.

use std::time::{Duration, SystemTime};

use crate::error::Error;

/// A client or server leaf certificate, with its expiry and DNS names
/// pulled out of the ASN.1 once at parse time.
#[derive(Debug, Clone)]
pub struct ParsedCertificate {
    der: rustls::Certificate,
    not_after: SystemTime,
    dns_names: Vec<String>,
}

impl ParsedCertificate {
    /// Parses `der`, extracting `notAfter` and any DNS subject-alternative
    /// names (falling back to the CN when there are none, matching the
    /// common self-signed-leaf convention).
    pub fn parse(der: rustls::Certificate) -> Result<Self, Error> {
        let (_, cert) = x509_parser::certificate::X509Certificate::from_der(der.as_ref())
            .map_err(|err| Error::InvalidResponse(format!("malformed certificate: {}", err)))?;

        let not_after = asn1_time_to_system_time(cert.validity().not_after.timestamp());

        let mut dns_names: Vec<String> = cert
            .subject_alternative_name()
            .ok()
            .flatten()
            .map(|ext| {
                ext.value
                    .general_names
                    .iter()
                    .filter_map(|name| match name {
                        x509_parser::extensions::GeneralName::DNSName(dns) => Some(dns.to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        if dns_names.is_empty() {
            if let Some(cn) = cert.subject().iter_common_name().next() {
                if let Ok(cn) = cn.as_str() {
                    dns_names.push(cn.to_string());
                }
            }
        }

        Ok(Self { der, not_after, dns_names })
    }

    /// The original DER bytes, as handed to rustls.
    pub fn der(&self) -> &rustls::Certificate {
        &self.der
    }

    /// `notAfter`, as a [`SystemTime`].
    pub fn not_after(&self) -> SystemTime {
        self.not_after
    }

    /// Whether this leaf has expired as of `now`.
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now > self.not_after
    }

    /// DNS names this certificate is valid for (SANs, or CN as a fallback).
    pub fn dns_names(&self) -> &[String] {
        &self.dns_names
    }

    /// Whether `hostname` is covered by one of [`Self::dns_names`], honoring
    /// a single leading `*` wildcard label the way TLS server-name matching
    /// conventionally does.
    pub fn matches_hostname(&self, hostname: &str) -> bool {
        let hostname = hostname.trim_end_matches('.').to_ascii_lowercase();

        self.dns_names.iter().any(|name| {
            let name = name.trim_end_matches('.').to_ascii_lowercase();

            if let Some(suffix) = name.strip_prefix("*.") {
                hostname
                    .strip_suffix(suffix)
                    .map(|rest| rest.ends_with('.') && rest[..rest.len() - 1].find('.').is_none())
                    .unwrap_or(false)
            } else {
                name == hostname
            }
        })
    }
}

fn asn1_time_to_system_time(unix_timestamp: i64) -> SystemTime {
    if unix_timestamp >= 0 {
        SystemTime::UNIX_EPOCH + Duration::from_secs(unix_timestamp as u64)
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs((-unix_timestamp) as u64)
    }
}
