//! Outbound URL confinement.
//!
//! Rejects anything that is not plain http(s) to a public address: cloud
//! metadata endpoints, loopback, RFC1918 and link-local ranges, container
//! orchestration hostnames, and the reserved proxy hostname. Callers must
//! re-check every redirect `Location` before following it.

use std::net::IpAddr;

use url::Url;

use crate::GuardError;

/// Cloud metadata and orchestration addresses that must never be fetched,
/// whatever they resolve to.
const BLOCKED_HOSTS: &[&str] = &[
    "169.254.169.254",
    "100.100.100.200",
    "metadata.google.internal",
    "metadata.azure.internal",
    "kubernetes.default.svc",
    "host.docker.internal",
    "gateway.docker.internal",
];

/// Hostname suffixes used by container and cluster-internal DNS.
const BLOCKED_SUFFIXES: &[&str] = &[
    ".internal",
    ".docker",
    ".local",
    ".svc",
    ".cluster.local",
];

/// Reserved hostname for the runtime's own proxy; tools may not loop
/// requests back through it.
const PROXY_HOST: &str = "hearth-proxy";

/// Vets outbound URLs before any request or redirect is followed.
#[derive(Debug, Clone, Default)]
pub struct UrlGuard;

impl UrlGuard {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Parse and vet a URL string. Scheme and hostname checks only — call
    /// [`UrlGuard::check_resolved`] before connecting to also vet DNS.
    pub fn check(&self, url_str: &str) -> Result<Url, GuardError> {
        let url = Url::parse(url_str).map_err(|e| GuardError::BlockedUrl {
            url: url_str.to_string(),
            reason: format!("unparseable: {e}"),
        })?;

        match url.scheme() {
            "http" | "https" => {},
            other => {
                return Err(GuardError::BlockedUrl {
                    url: url_str.to_string(),
                    reason: format!("scheme '{other}' is not allowed"),
                });
            },
        }

        let host = url.host_str().ok_or_else(|| GuardError::BlockedUrl {
            url: url_str.to_string(),
            reason: "no host".to_string(),
        })?;
        let host_lower = host.to_ascii_lowercase();

        if host_lower == PROXY_HOST {
            return Err(GuardError::BlockedUrl {
                url: url_str.to_string(),
                reason: "reserved proxy hostname".to_string(),
            });
        }

        if BLOCKED_HOSTS.contains(&host_lower.as_str()) {
            return Err(GuardError::BlockedUrl {
                url: url_str.to_string(),
                reason: format!("blocked host {host_lower}"),
            });
        }

        if BLOCKED_SUFFIXES.iter().any(|s| host_lower.ends_with(s)) {
            return Err(GuardError::BlockedUrl {
                url: url_str.to_string(),
                reason: format!("internal hostname {host_lower}"),
            });
        }

        // Bracketed IPv6 or dotted IPv4 literal: vet immediately.
        if let Ok(ip) = host_lower.trim_matches(['[', ']']).parse::<IpAddr>() {
            if is_private_ip(&ip) {
                return Err(GuardError::BlockedUrl {
                    url: url_str.to_string(),
                    reason: format!("private address {ip}"),
                });
            }
        }

        Ok(url)
    }

    /// Full check: [`UrlGuard::check`] plus DNS resolution of the host,
    /// rejecting if *any* resolved address is private. Must also run on
    /// every redirect target.
    pub async fn check_resolved(&self, url_str: &str) -> Result<Url, GuardError> {
        let url = self.check(url_str)?;

        let host = url.host_str().unwrap_or_default().to_string();
        // Literal IPs were already vetted in `check`.
        if host.trim_matches(['[', ']']).parse::<IpAddr>().is_ok() {
            return Ok(url);
        }

        let port = url.port_or_known_default().unwrap_or(443);
        let addrs: Vec<_> = tokio::net::lookup_host(format!("{host}:{port}"))
            .await
            .map_err(|e| GuardError::BlockedUrl {
                url: url_str.to_string(),
                reason: format!("DNS resolution failed: {e}"),
            })?
            .collect();

        if addrs.is_empty() {
            return Err(GuardError::BlockedUrl {
                url: url_str.to_string(),
                reason: format!("no addresses for {host}"),
            });
        }

        for addr in &addrs {
            if is_private_ip(&addr.ip()) {
                return Err(GuardError::BlockedUrl {
                    url: url_str.to_string(),
                    reason: format!("{host} resolves to private address {}", addr.ip()),
                });
            }
        }

        Ok(url)
    }
}

/// Loopback, RFC1918, link-local, CGNAT, broadcast, unspecified, and the
/// IPv6 unique-local / link-local ranges.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (CGNAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
                // 192.0.0.0/24
                || (v4.octets()[0] == 192 && v4.octets()[1] == 0 && v4.octets()[2] == 0)
        },
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 (unique local)
                || (v6.segments()[0] & 0xFE00) == 0xFC00
                // fe80::/10 (link-local)
                || (v6.segments()[0] & 0xFFC0) == 0xFE80
                // IPv4-mapped: recurse on the embedded address.
                || v6.to_ipv4_mapped().is_some_and(|v4| is_private_ip(&IpAddr::V4(v4)))
        },
    }
}
