//! SSRF guard properties: totality, canonicalization, category tagging,
//! and the audit trail.

use pretty_assertions::assert_eq;

use tests::mocks::CapturingAuditSink;
use toolbus_core::SsrfCategory;
use toolbus_runtime::ssrf::SsrfGuard;
use toolbus_runtime::validate_url;

#[test]
fn category_table() {
    let cases: &[(&str, Option<SsrfCategory>)] = &[
        // pass
        ("https://example.com/mcp", None),
        ("http://mcp.example.org:8080/rpc", None),
        ("https://8.8.8.8/", None),
        // invalid input
        ("", Some(SsrfCategory::InvalidUrl)),
        ("nonsense", Some(SsrfCategory::InvalidUrl)),
        // schemes
        ("file:///etc/passwd", Some(SsrfCategory::InvalidProtocol)),
        ("gopher://example.com/", Some(SsrfCategory::InvalidProtocol)),
        ("ftp://example.com/", Some(SsrfCategory::InvalidProtocol)),
        ("data:text/plain,x", Some(SsrfCategory::InvalidProtocol)),
        // hostname blocklist
        ("http://localhost:3000/", Some(SsrfCategory::BlockedHostname)),
        ("http://metadata.google.internal/", Some(SsrfCategory::BlockedHostname)),
        ("http://kubernetes.default.svc/", Some(SsrfCategory::BlockedHostname)),
        ("http://0.0.0.0:8080/", Some(SsrfCategory::BlockedHostname)),
        ("http://[::1]:8080/", Some(SsrfCategory::BlockedHostname)),
        // private/special ranges
        ("http://127.0.0.1:9000", Some(SsrfCategory::PrivateIp)),
        ("http://10.1.2.3/", Some(SsrfCategory::PrivateIp)),
        ("http://172.20.0.1/", Some(SsrfCategory::PrivateIp)),
        ("http://192.168.0.100/", Some(SsrfCategory::PrivateIp)),
        ("http://169.254.169.254/", Some(SsrfCategory::PrivateIp)),
        ("http://239.1.1.1/", Some(SsrfCategory::PrivateIp)),
        ("http://255.255.255.255/", Some(SsrfCategory::PrivateIp)),
        // encoded spellings of private addresses
        ("http://0x7f000001/", Some(SsrfCategory::PrivateIp)),
        ("http://2130706433/", Some(SsrfCategory::PrivateIp)),
        ("http://017700000001/", Some(SsrfCategory::PrivateIp)),
        ("http://[::ffff:192.168.1.1]/", Some(SsrfCategory::PrivateIp)),
    ];

    for (raw, expected) in cases {
        let verdict = validate_url(raw);
        assert_eq!(
            verdict.category, *expected,
            "url {} -> {:?}",
            raw, verdict.error
        );
        assert_eq!(verdict.valid, expected.is_none(), "url {}", raw);
    }
}

#[test]
fn validation_is_total_over_arbitrary_bytes() {
    // Nothing here may panic; verdicts just have to exist.
    let inputs = [
        "http://[",
        "http://]][[",
        "http://%ff%fe",
        "https://../..",
        "http://0x",
        "http://0xZZ/",
        "http://1.2.3.4.5.6.7.8/",
        "http://-",
        "http://.",
        "\u{202e}http://example.com",
        "http://\u{0}host/",
    ];
    for raw in inputs {
        let _ = validate_url(raw);
    }
    // Long hostile input
    let long = format!("http://{}/", "a".repeat(100_000));
    let _ = validate_url(&long);
}

#[test]
fn blocked_verdict_carries_message_and_ip() {
    let verdict = validate_url("http://127.0.0.1:9000");
    assert!(!verdict.valid);
    assert_eq!(verdict.category, Some(SsrfCategory::PrivateIp));
    assert_eq!(
        verdict.resolved_ip,
        Some("127.0.0.1".parse().unwrap())
    );
    assert!(verdict.error.unwrap().contains("loopback"));
}

#[tokio::test]
async fn every_verdict_is_audited() {
    let sink = CapturingAuditSink::new();
    let guard = SsrfGuard::with_audit_sink(sink.clone());

    let pass = guard.validate("https://example.com/mcp");
    assert!(pass.valid);
    let block = guard.validate("http://192.168.0.1/");
    assert!(!block.valid);

    let events = sink.events();
    assert_eq!(events.len(), 2);

    assert!(events[0].allowed);
    assert_eq!(events[0].url, "https://example.com/mcp");
    assert_eq!(events[0].category, None);

    assert!(!events[1].allowed);
    assert_eq!(events[1].category, Some(SsrfCategory::PrivateIp));
    assert!(events[1].reason.is_some());
    assert!(events[1].resolved_ip.is_some());
}

#[tokio::test]
async fn resolved_variant_blocks_literal_ips_without_dns() {
    let sink = CapturingAuditSink::new();
    let guard = SsrfGuard::with_audit_sink(sink.clone());

    let verdict = guard.validate_resolved("http://10.0.0.7:9000/").await;
    assert!(!verdict.valid);
    assert_eq!(verdict.category, Some(SsrfCategory::PrivateIp));
    assert_eq!(sink.events().len(), 1);
}
