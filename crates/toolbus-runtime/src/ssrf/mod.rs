//! SSRF guard: vets every outbound URL before a socket opens.
//!
//! The core check is a total function over the URL string - it never
//! panics, whatever the input. Scheme and hostname are checked first,
//! then literal IPs are canonicalized (hex/decimal/octal encodings
//! decoded) and range-checked, since a naive string blocklist misses
//! `0x7f000001` spellings of loopback. [`SsrfGuard::validate_resolved`]
//! additionally resolves hostnames and range-checks every address at
//! call time.
//!
//! Verdicts are never cached: the connection manager re-runs the guard
//! on every (re)connection attempt.

mod audit;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use tracing::debug;
use url::{Host, Url};

use toolbus_core::{McpError, SsrfCategory};

pub use audit::{AuditEvent, AuditSink, SharedAuditSink, TracingAuditSink};

/// Hostnames rejected outright, before any IP-level analysis.
/// Localhost variants, the unspecified address, cloud metadata names,
/// and Kubernetes internal service names.
const BLOCKED_HOSTNAMES: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "ip6-localhost",
    "ip6-loopback",
    "0.0.0.0",
    "::",
    "::1",
    "metadata.google.internal",
    "metadata.goog",
    "instance-data",
    "instance-data.ec2.internal",
    "kubernetes.default",
    "kubernetes.default.svc",
    "kubernetes.default.svc.cluster.local",
];

/// Verdict for one URL.
#[derive(Debug, Clone)]
pub struct UrlValidation {
    pub valid: bool,
    pub error: Option<String>,
    pub category: Option<SsrfCategory>,
    pub resolved_ip: Option<IpAddr>,
}

impl UrlValidation {
    fn pass(resolved_ip: Option<IpAddr>) -> Self {
        Self {
            valid: true,
            error: None,
            category: None,
            resolved_ip,
        }
    }

    fn block(category: SsrfCategory, error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
            category: Some(category),
            resolved_ip: None,
        }
    }

    fn block_ip(category: SsrfCategory, error: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            resolved_ip: Some(ip),
            ..Self::block(category, error)
        }
    }

    /// Convert to the error taxonomy for propagation.
    pub fn into_result(self) -> Result<(), McpError> {
        if self.valid {
            return Ok(());
        }
        Err(McpError::SsrfBlocked {
            category: self.category.unwrap_or(SsrfCategory::InvalidUrl),
            reason: self
                .error
                .unwrap_or_else(|| "url failed validation".to_string()),
        })
    }
}

/// Validate a URL against scheme, hostname, and literal-IP rules.
///
/// Total: returns a verdict for any input, never panics. Does not touch
/// the network; hostname resolution is [`SsrfGuard::validate_resolved`]'s
/// job.
pub fn validate_url(raw: &str) -> UrlValidation {
    let parsed = match Url::parse(raw) {
        Ok(url) => url,
        Err(e) => {
            return UrlValidation::block(SsrfCategory::InvalidUrl, format!("unparsable url: {}", e))
        }
    };

    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        return UrlValidation::block(
            SsrfCategory::InvalidProtocol,
            format!("scheme '{}' is not allowed (http/https only)", scheme),
        );
    }

    let host = match parsed.host() {
        Some(host) => host,
        None => return UrlValidation::block(SsrfCategory::InvalidUrl, "url has no host"),
    };

    // Hostname blocklist runs on the raw host text so `[::1]` and
    // `0.0.0.0` report BLOCKED_HOSTNAME rather than a range category.
    let host_text = parsed
        .host_str()
        .unwrap_or_default()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if BLOCKED_HOSTNAMES.contains(&host_text.as_str())
        || host_text.ends_with(".localhost")
        || host_text.ends_with(".cluster.local")
    {
        return UrlValidation::block(
            SsrfCategory::BlockedHostname,
            format!("hostname '{}' is blocked", host_text),
        );
    }

    match host {
        Host::Ipv4(ip) => check_ipv4(ip),
        Host::Ipv6(ip) => check_ipv6(ip),
        Host::Domain(_) => {
            // The url crate already canonicalizes numeric hosts for http,
            // but decode lenient IPv4 spellings here as well so the range
            // check cannot be bypassed by an encoding it missed.
            match parse_ipv4_lenient(&host_text) {
                Some(ip) => check_ipv4(ip),
                None => UrlValidation::pass(None),
            }
        }
    }
}

fn check_ipv4(ip: Ipv4Addr) -> UrlValidation {
    match ipv4_block_reason(ip) {
        Some(reason) => UrlValidation::block_ip(
            SsrfCategory::PrivateIp,
            format!("address {} is {}", ip, reason),
            IpAddr::V4(ip),
        ),
        None => UrlValidation::pass(Some(IpAddr::V4(ip))),
    }
}

fn check_ipv6(ip: Ipv6Addr) -> UrlValidation {
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return check_ipv4(mapped);
    }
    match ipv6_block_reason(ip) {
        Some(reason) => UrlValidation::block_ip(
            SsrfCategory::PrivateIp,
            format!("address {} is {}", ip, reason),
            IpAddr::V6(ip),
        ),
        None => UrlValidation::pass(Some(IpAddr::V6(ip))),
    }
}

/// Sub-reason for a blocked IPv4 address, `None` if routable.
fn ipv4_block_reason(ip: Ipv4Addr) -> Option<&'static str> {
    let octets = ip.octets();
    if ip.is_loopback() {
        return Some("loopback (127.0.0.0/8)");
    }
    if ip.is_broadcast() {
        return Some("broadcast (255.255.255.255)");
    }
    if octets[0] == 10 {
        return Some("private (10.0.0.0/8)");
    }
    if octets[0] == 172 && (16..=31).contains(&octets[1]) {
        return Some("private (172.16.0.0/12)");
    }
    if octets[0] == 192 && octets[1] == 168 {
        return Some("private (192.168.0.0/16)");
    }
    if ip.is_link_local() {
        return Some("link-local (169.254.0.0/16)");
    }
    if ip.is_multicast() {
        return Some("multicast (224.0.0.0/4)");
    }
    if octets[0] >= 240 {
        return Some("reserved (240.0.0.0/4)");
    }
    if octets[0] == 0 {
        return Some("unspecified (0.0.0.0/8)");
    }
    None
}

/// Sub-reason for a blocked IPv6 address, `None` if routable.
fn ipv6_block_reason(ip: Ipv6Addr) -> Option<&'static str> {
    if ip.is_loopback() {
        return Some("loopback (::1)");
    }
    if ip.is_unspecified() {
        return Some("unspecified (::)");
    }
    let first = ip.segments()[0];
    if first & 0xfe00 == 0xfc00 {
        return Some("unique-local (fc00::/7)");
    }
    if first & 0xffc0 == 0xfe80 {
        return Some("link-local (fe80::/10)");
    }
    None
}

/// Decode an IPv4 address the way `inet_aton` does: 1-4 dot-separated
/// parts, each in decimal, hex (`0x`), or octal (leading `0`), with the
/// last part filling the remaining bytes.
fn parse_ipv4_lenient(host: &str) -> Option<Ipv4Addr> {
    if host.is_empty() {
        return None;
    }
    let parts: Vec<&str> = host.split('.').collect();
    if parts.len() > 4 {
        return None;
    }
    let mut values = Vec::with_capacity(parts.len());
    for part in &parts {
        values.push(parse_ipv4_part(part)?);
    }

    let (prefix, last) = values.split_at(values.len() - 1);
    let last = last[0];
    // Prefix parts are single octets; the last covers the remaining bytes.
    let mut addr: u32 = 0;
    for value in prefix {
        if *value > 0xff {
            return None;
        }
        addr = (addr << 8) | value;
    }
    let remaining = 4 - prefix.len();
    let max = if remaining == 4 {
        u32::MAX
    } else {
        (1u32 << (8 * remaining)) - 1
    };
    if last > max {
        return None;
    }
    addr = (addr << (8 * remaining)) | last;
    Some(Ipv4Addr::from(addr))
}

fn parse_ipv4_part(part: &str) -> Option<u32> {
    if part.is_empty() {
        return None;
    }
    if let Some(hex) = part.strip_prefix("0x").or_else(|| part.strip_prefix("0X")) {
        if hex.is_empty() {
            return None;
        }
        return u32::from_str_radix(hex, 16).ok();
    }
    if part.len() > 1 && part.starts_with('0') {
        return u32::from_str_radix(&part[1..], 8).ok();
    }
    if !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

/// The guard consulted by the connection manager: validation plus audit
/// emission, and the DNS-resolving variant for hostname targets.
pub struct SsrfGuard {
    audit: SharedAuditSink,
}

impl Default for SsrfGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl SsrfGuard {
    pub fn new() -> Self {
        Self {
            audit: Arc::new(TracingAuditSink),
        }
    }

    pub fn with_audit_sink(audit: SharedAuditSink) -> Self {
        Self { audit }
    }

    /// Literal validation with an audit record.
    pub fn validate(&self, raw: &str) -> UrlValidation {
        let verdict = validate_url(raw);
        self.record(raw, &verdict);
        verdict
    }

    /// Literal validation plus hostname resolution: every address the
    /// name resolves to must pass the range checks at call time.
    ///
    /// Resolution failures are not SSRF blocks - the connect attempt will
    /// surface them on its own.
    pub async fn validate_resolved(&self, raw: &str) -> UrlValidation {
        let verdict = validate_url(raw);
        if !verdict.valid || verdict.resolved_ip.is_some() {
            self.record(raw, &verdict);
            return verdict;
        }

        // Literal checks passed and the host is a name; resolve it.
        // Re-parse cannot fail here.
        let parsed = match Url::parse(raw) {
            Ok(url) => url,
            Err(_) => {
                self.record(raw, &verdict);
                return verdict;
            }
        };
        let domain = parsed.host_str().unwrap_or_default().to_string();
        let port = parsed.port_or_known_default().unwrap_or(443);

        let addrs = match tokio::net::lookup_host((domain.as_str(), port)).await {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!(host = %domain, error = %e, "dns lookup failed during url validation");
                self.record(raw, &verdict);
                return verdict;
            }
        };

        let mut first_ip = None;
        for addr in addrs {
            let ip = addr.ip();
            first_ip.get_or_insert(ip);
            let reason = match ip {
                IpAddr::V4(v4) => ipv4_block_reason(v4),
                IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                    Some(mapped) => ipv4_block_reason(mapped),
                    None => ipv6_block_reason(v6),
                },
            };
            if let Some(reason) = reason {
                let blocked = UrlValidation::block_ip(
                    SsrfCategory::PrivateIp,
                    format!("hostname '{}' resolves to {} ({})", domain, ip, reason),
                    ip,
                );
                self.record(raw, &blocked);
                return blocked;
            }
        }

        let verdict = UrlValidation {
            resolved_ip: first_ip,
            ..verdict
        };
        self.record(raw, &verdict);
        verdict
    }

    fn record(&self, raw: &str, verdict: &UrlValidation) {
        let event = AuditEvent::new(
            raw,
            verdict.valid,
            verdict.category,
            verdict.error.clone(),
            verdict.resolved_ip,
        );
        self.audit.record(&event);
    }
}
