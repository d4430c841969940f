//! Composite locator parsing.
//!
//! A locator has the shape
//! `<scheme>:ojp[H1:P1(,H2:P2)*(>PROFILE)?]_<downstream-locator>`:
//! the bracketed list names the proxy endpoints, the optional `>PROFILE`
//! selects a named server-side pool configuration, and everything after
//! the trailing `_` is the downstream database URL the proxy should use.

use std::sync::OnceLock;

use regex::Regex;

use crate::endpoint::{Endpoint, EndpointSet};
use crate::error::{DriverError, Result};

/// Pattern extracting the bracket body of the proxy tag.
const PROXY_PATTERN: &str = r"ojp\[([^\]]+)\]";

/// Pattern splitting the bracket body into endpoint list and pool profile.
const PROFILE_PATTERN: &str = r"ojp\[([^>\]]+)(?:>([^\]]+))?\]";

/// Profile name returned when the locator names none.
pub const DEFAULT_POOL_PROFILE: &str = "default";

fn proxy_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(PROXY_PATTERN).expect("static pattern compiles"))
}

fn profile_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(PROFILE_PATTERN).expect("static pattern compiles"))
}

/// Parses the endpoint list out of a composite locator.
///
/// Entries are comma-separated `host:port` pairs; whitespace around entries
/// is trimmed and empty entries between commas are skipped. Ports must lie
/// in 1..=65535.
///
/// # Errors
///
/// Returns [`DriverError::InvalidLocator`] when the locator does not match
/// the proxy-tag pattern, an entry is malformed, a port does not parse or
/// is out of range, or the list ends up empty.
pub fn parse_endpoints(locator: &str) -> Result<EndpointSet> {
    let captures = proxy_regex().captures(locator).ok_or_else(|| DriverError::InvalidLocator {
        message: "expected <scheme>:ojp[host:port,...]_<downstream-url>".to_owned(),
    })?;

    // The bracket body may carry a trailing `>profile`; endpoints come first.
    let body = &captures[1];
    let list = body.split('>').next().unwrap_or_default();

    let mut endpoints = Vec::new();
    for entry in list.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        let mut parts = entry.split(':');
        let (host, port_text) = match (parts.next(), parts.next(), parts.next()) {
            (Some(host), Some(port), None) => (host.trim(), port.trim()),
            _ => {
                return Err(DriverError::InvalidLocator {
                    message: format!("invalid server address '{entry}', expected host:port"),
                });
            },
        };

        if host.is_empty() {
            return Err(DriverError::InvalidLocator {
                message: format!("invalid server address '{entry}', missing host"),
            });
        }

        let port: u32 = port_text.parse().map_err(|_| DriverError::InvalidLocator {
            message: format!("invalid port number in address '{entry}'"),
        })?;
        if port == 0 || port > 65_535 {
            return Err(DriverError::InvalidLocator {
                message: format!("port out of range in address '{entry}', expected 1..=65535"),
            });
        }

        endpoints.push(Endpoint::new(host, port as u16));
    }

    if endpoints.is_empty() {
        return Err(DriverError::InvalidLocator {
            message: format!("no server endpoints found in locator '{locator}'"),
        });
    }

    tracing::debug!(count = endpoints.len(), "parsed proxy endpoints from locator");

    Ok(EndpointSet::new(endpoints))
}

/// Extracts the downstream database URL by removing the proxy tag and its
/// trailing `_` separator, once.
#[must_use]
pub fn extract_downstream_url(locator: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let with_separator =
        RE.get_or_init(|| Regex::new(r"ojp\[[^\]]+\]_").expect("static pattern compiles"));
    with_separator.replacen(locator, 1, "").into_owned()
}

/// Extracts the pool profile name after `>` inside the brackets, or the
/// literal `"default"` when none is present.
#[must_use]
pub fn extract_pool_profile(locator: &str) -> String {
    if let Some(captures) = profile_regex().captures(locator)
        && let Some(profile) = captures.get(2)
    {
        let profile = profile.as_str().trim();
        if !profile.is_empty() {
            return profile.to_owned();
        }
    }
    DEFAULT_POOL_PROFILE.to_owned()
}

/// Rewrites `ojp[hosts>profile]` to `ojp[hosts]`, leaving locators without
/// a profile untouched.
#[must_use]
pub fn strip_pool_profile(locator: &str) -> String {
    if let Some(captures) = profile_regex().captures(locator) {
        let hosts = &captures[1];
        return profile_regex().replacen(locator, 1, format!("ojp[{hosts}]")).into_owned();
    }
    locator.to_owned()
}

/// Returns the raw `host:port` list before any `>`, or an empty string when
/// the locator does not match.
#[must_use]
pub fn extract_host_port(locator: &str) -> String {
    profile_regex()
        .captures(locator)
        .map(|captures| captures[1].to_owned())
        .unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn addresses(set: &EndpointSet) -> Vec<String> {
        set.iter().map(|e| e.address()).collect()
    }

    #[test]
    fn parses_single_endpoint() {
        let set = parse_endpoints("jdbc:ojp[localhost:1059]_h2:mem:test").unwrap();
        assert_eq!(addresses(&set), ["localhost:1059"]);
    }

    #[test]
    fn parses_multinode_with_profile_and_downstream() {
        let locator = "jdbc:ojp[server1:1059,server2:1059,server3:1060>fast]_postgresql://h:5432/db";
        let set = parse_endpoints(locator).unwrap();
        assert_eq!(addresses(&set), ["server1:1059", "server2:1059", "server3:1060"]);
        assert_eq!(extract_pool_profile(locator), "fast");
        assert_eq!(extract_downstream_url(locator), "jdbc:postgresql://h:5432/db");
    }

    #[test]
    fn trims_whitespace_and_skips_empty_entries() {
        let set = parse_endpoints("jdbc:ojp[ a:1 ,, b:2 , ]_x").unwrap();
        assert_eq!(addresses(&set), ["a:1", "b:2"]);
    }

    #[test]
    fn rejects_port_out_of_range() {
        let err = parse_endpoints("jdbc:ojp[localhost:70000]_h2:mem:t").unwrap_err();
        match err {
            DriverError::InvalidLocator { message } => {
                assert!(message.contains("out of range"), "{message}");
            },
            other => panic!("expected InvalidLocator, got {other:?}"),
        }
    }

    #[test]
    fn rejects_port_zero() {
        let err = parse_endpoints("jdbc:ojp[localhost:0]_h2:mem:t").unwrap_err();
        assert!(matches!(err, DriverError::InvalidLocator { .. }));
    }

    #[test]
    fn rejects_non_numeric_port() {
        let err = parse_endpoints("jdbc:ojp[localhost:abc]_h2:mem:t").unwrap_err();
        match err {
            DriverError::InvalidLocator { message } => {
                assert!(message.contains("invalid port number"), "{message}");
            },
            other => panic!("expected InvalidLocator, got {other:?}"),
        }
    }

    #[test]
    fn rejects_entry_without_colon() {
        let err = parse_endpoints("jdbc:ojp[localhost]_h2:mem:t").unwrap_err();
        match err {
            DriverError::InvalidLocator { message } => {
                assert!(message.contains("expected host:port"), "{message}");
            },
            other => panic!("expected InvalidLocator, got {other:?}"),
        }
    }

    #[test]
    fn rejects_entry_with_extra_colon() {
        let err = parse_endpoints("jdbc:ojp[host:1:2]_h2:mem:t").unwrap_err();
        assert!(matches!(err, DriverError::InvalidLocator { .. }));
    }

    #[test]
    fn rejects_missing_proxy_tag() {
        let err = parse_endpoints("jdbc:postgresql://h/db").unwrap_err();
        assert!(matches!(err, DriverError::InvalidLocator { .. }));
    }

    #[test]
    fn rejects_list_of_only_commas() {
        let err = parse_endpoints("jdbc:ojp[ , , ]_h2:mem:t").unwrap_err();
        match err {
            DriverError::InvalidLocator { message } => {
                assert!(message.contains("no server endpoints"), "{message}");
            },
            other => panic!("expected InvalidLocator, got {other:?}"),
        }
    }

    #[test]
    fn profile_defaults_without_marker() {
        assert_eq!(extract_pool_profile("jdbc:ojp[a:1]_h2:mem:t"), "default");
        assert_eq!(extract_pool_profile(""), "default");
        assert_eq!(extract_pool_profile("not a locator"), "default");
    }

    #[test]
    fn profile_is_trimmed() {
        assert_eq!(extract_pool_profile("jdbc:ojp[a:1> fast ]_x"), "fast");
    }

    #[test]
    fn downstream_extraction_removes_tag_once() {
        assert_eq!(extract_downstream_url("jdbc:ojp[a:1059]_h2:mem:test"), "jdbc:h2:mem:test");
        // Only the first occurrence is removed.
        assert_eq!(
            extract_downstream_url("jdbc:ojp[a:1]_x_ojp[b:2]_y"),
            "jdbc:x_ojp[b:2]_y"
        );
    }

    #[test]
    fn strip_profile_rewrites_brackets() {
        assert_eq!(
            strip_pool_profile("jdbc:ojp[localhost:1059>fast]_h2:mem:testdb"),
            "jdbc:ojp[localhost:1059]_h2:mem:testdb"
        );
        assert_eq!(
            strip_pool_profile("jdbc:ojp[localhost:1059]_h2:mem:testdb"),
            "jdbc:ojp[localhost:1059]_h2:mem:testdb"
        );
    }

    #[test]
    fn host_port_extraction() {
        assert_eq!(extract_host_port("jdbc:ojp[a:1,b:2>fast]_x"), "a:1,b:2");
        assert_eq!(extract_host_port("nope"), "");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod proptest_tests {
    use proptest::prelude::*;

    use super::*;

    fn host_strategy() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9-]{0,15}"
    }

    proptest! {
        /// Every listed endpoint survives parsing, in original order, and
        /// the downstream locator plus the proxy tag recovers the input.
        #[test]
        fn prop_roundtrip(
            hosts in proptest::collection::vec(host_strategy(), 1..6),
            ports in proptest::collection::vec(1u16..=65535, 6),
            downstream in "[a-z0-9:/._-]{1,30}"
        ) {
            let list: Vec<String> = hosts
                .iter()
                .zip(&ports)
                .map(|(h, p)| format!("{h}:{p}"))
                .collect();
            let body = list.join(",");
            let locator = format!("jdbc:ojp[{body}]_{downstream}");

            let set = parse_endpoints(&locator).unwrap();
            let parsed: Vec<String> = set.iter().map(|e| e.address()).collect();
            prop_assert_eq!(parsed, list);

            prop_assert_eq!(extract_downstream_url(&locator), format!("jdbc:{downstream}"));
            prop_assert_eq!(extract_pool_profile(&locator), DEFAULT_POOL_PROFILE);
        }

        /// A profile after `>` is extracted verbatim and stripping it
        /// yields a locator that still parses to the same endpoints.
        #[test]
        fn prop_profile_strip(
            host in host_strategy(),
            port in 1u16..=65535,
            profile in "[a-z][a-z0-9]{0,10}"
        ) {
            let locator = format!("jdbc:ojp[{host}:{port}>{profile}]_h2:mem:t");
            prop_assert_eq!(extract_pool_profile(&locator), profile);

            let stripped = strip_pool_profile(&locator);
            prop_assert_eq!(extract_pool_profile(&stripped), DEFAULT_POOL_PROFILE);

            let set = parse_endpoints(&stripped).unwrap();
            prop_assert_eq!(set.len(), 1);
            prop_assert_eq!(set.iter().next().unwrap().address(), format!("{host}:{port}"));
        }
    }
}
