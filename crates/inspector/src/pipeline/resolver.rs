//! Target resolution: share-link rewriting and the outbound target guard

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::debug;
use url::{Host, Url};

use crate::pipeline::core::{AnalyzeError, FetchTarget, Result};

const DRIVE_HOSTS: &[&str] = &["drive.google.com", "docs.google.com"];
const BLOCKED_HOST_SUFFIXES: &[&str] = &[".localhost", ".local", ".internal"];

/// Turn user input into a validated `FetchTarget`
///
/// Known share-link forms are rewritten to their direct-download equivalent
/// before the guard runs, so the guard always sees the URL that will be
/// requested. `allow_private_targets` skips only the host/address checks.
pub fn resolve(input: &str, allow_private_targets: bool) -> Result<FetchTarget> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(AnalyzeError::ValidationFailed {
            field: "url".to_string(),
            message: "A URL is required.".to_string(),
        });
    }

    let parsed = Url::parse(trimmed).map_err(|e| match AnalyzeError::from(e) {
        AnalyzeError::InvalidTarget { reason, .. } => AnalyzeError::InvalidTarget {
            url: trimmed.to_string(),
            reason,
        },
        other => other,
    })?;

    let (url, is_share_link) = match rewrite_share_link(&parsed) {
        Some(direct) => {
            debug!("Rewrote share link {} -> {}", parsed, direct);
            (direct, true)
        }
        None => (parsed, false),
    };

    guard_target(&url, allow_private_targets)?;

    Ok(FetchTarget { url, is_share_link })
}

/// Rewrite a cloud-drive share link to its direct-download form
pub fn rewrite_share_link(url: &Url) -> Option<Url> {
    let host = url.host_str()?.to_ascii_lowercase();
    if !DRIVE_HOSTS.contains(&host.as_str()) {
        return None;
    }

    let segments: Vec<&str> = url
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    let id = match segments.as_slice() {
        ["file", "d", id, ..] => Some(id.to_string()),
        ["open"] | ["uc"] => url
            .query_pairs()
            .find(|(key, _)| key == "id")
            .map(|(_, value)| value.into_owned()),
        _ => None,
    }
    .filter(|id| !id.is_empty())?;

    let mut direct = Url::parse("https://drive.google.com/uc").ok()?;
    direct
        .query_pairs_mut()
        .append_pair("export", "download")
        .append_pair("id", &id);
    Some(direct)
}

/// Reject targets that would turn the fetcher into an internal network scanner
pub fn guard_target(url: &Url, allow_private_targets: bool) -> Result<()> {
    let reject = |reason: &str| AnalyzeError::InvalidTarget {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(reject("Only http and https URLs are supported"));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(reject("URLs with embedded credentials are not allowed"));
    }

    match url.host() {
        None => Err(reject("URL must have a valid hostname")),
        Some(_) if allow_private_targets => Ok(()),
        Some(Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            let blocked = domain == "localhost"
                || BLOCKED_HOST_SUFFIXES.iter().any(|suffix| domain.ends_with(suffix));
            if blocked {
                Err(reject("Local and internal hostnames are not allowed"))
            } else {
                Ok(())
            }
        }
        Some(Host::Ipv4(ip)) if is_blocked_ip(IpAddr::V4(ip)) => {
            Err(reject("Private or reserved addresses are not allowed"))
        }
        Some(Host::Ipv6(ip)) if is_blocked_ip(IpAddr::V6(ip)) => {
            Err(reject("Private or reserved addresses are not allowed"))
        }
        Some(_) => Ok(()),
    }
}

/// True for loopback, private, link-local and other non-public addresses
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_v4(v4),
        IpAddr::V6(v6) => is_blocked_v6(v6),
    }
}

fn is_blocked_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_multicast()
        // 0.0.0.0/8
        || a == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (b & 0xc0) == 64)
}

fn is_blocked_v6(ip: Ipv6Addr) -> bool {
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return is_blocked_v4(mapped);
    }

    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
        // 2001:db8::/32 documentation
        || (first == 0x2001 && ip.segments()[1] == 0x0db8)
}
