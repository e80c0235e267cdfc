//! Webhook target validation.
//!
//! A target is checked twice: when the job is admitted and again right
//! before every delivery attempt, since the name may resolve differently by
//! then. [`resolve_target`] returns the addresses it vetted so the caller
//! can connect to exactly those.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use reqwest::Url;
use transforge_common::ValidationError;

/// Longest accepted webhook URL.
pub const MAX_URL_LEN: usize = 2048;

/// Which webhook targets are acceptable.
#[derive(Debug, Clone, Default)]
pub struct WebhookPolicy {
    /// Accept `http` in addition to `https`.
    pub allow_http: bool,
    /// Hosts exempt from the private-address check, compared case-insensitively.
    pub trusted_hosts: Vec<String>,
}

impl WebhookPolicy {
    fn is_trusted(&self, host: &str) -> bool {
        self.trusted_hosts
            .iter()
            .any(|h| h.trim_matches(|c| c == '[' || c == ']').eq_ignore_ascii_case(host))
    }
}

/// A webhook URL together with the addresses it resolved to at check time.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub url: Url,
    pub host: String,
    pub addrs: Vec<SocketAddr>,
}

/// Syntactic checks: length, scheme, no embedded credentials, a host.
pub fn parse_webhook_url(raw: &str, policy: &WebhookPolicy) -> Result<Url, ValidationError> {
    let invalid = |why: &str| ValidationError::InvalidWebhookUrl(why.to_string());

    if raw.len() > MAX_URL_LEN {
        return Err(invalid("url is too long"));
    }
    let url = Url::parse(raw.trim()).map_err(|_| invalid("url could not be parsed"))?;

    match url.scheme() {
        "https" => {}
        "http" if policy.allow_http => {}
        _ => return Err(invalid("scheme must be https")),
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(invalid("credentials are not allowed in the url"));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("url has no host"));
    }
    Ok(url)
}

/// Resolve the URL's host and reject it if any address is internal.
///
/// Every resolved address must pass: a name that resolves to one public and
/// one private address is rejected, because the client may pick either.
pub async fn resolve_target(
    url: &Url,
    policy: &WebhookPolicy,
) -> Result<ResolvedTarget, ValidationError> {
    let invalid = |why: &str| ValidationError::InvalidWebhookUrl(why.to_string());
    let port = url.port_or_known_default().ok_or_else(|| invalid("url has no port"))?;

    let raw_host = url.host_str().ok_or_else(|| invalid("url has no host"))?;
    let bare = raw_host.trim_start_matches('[').trim_end_matches(']');

    let (host, addrs) = match bare.parse::<IpAddr>() {
        Ok(ip) => (ip.to_string(), vec![SocketAddr::new(ip, port)]),
        Err(_) => {
            let addrs = tokio::net::lookup_host((bare, port))
                .await
                .map_err(|_| invalid("host did not resolve"))?
                .collect::<Vec<_>>();
            (bare.to_ascii_lowercase(), addrs)
        }
    };

    if addrs.is_empty() {
        return Err(invalid("host did not resolve"));
    }

    if !policy.is_trusted(&host) && addrs.iter().any(|a| is_forbidden_ip(a.ip())) {
        return Err(ValidationError::ForbiddenWebhookTarget(host));
    }

    Ok(ResolvedTarget {
        url: url.clone(),
        host,
        addrs,
    })
}

/// Parse and resolve in one step.
pub async fn validate_webhook_url(
    raw: &str,
    policy: &WebhookPolicy,
) -> Result<ResolvedTarget, ValidationError> {
    let url = parse_webhook_url(raw, policy)?;
    resolve_target(&url, policy).await
}

/// Whether an address is loopback, private, link-local or otherwise not a
/// public unicast destination.
pub fn is_forbidden_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_forbidden_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(v4) = embedded_ipv4(v6) {
                return is_forbidden_v4(v4) || is_forbidden_v6(v6);
            }
            is_forbidden_v6(v6)
        }
    }
}

/// The IPv4 address an IPv6 address forwards to, for the forms that carry
/// one in the clear: mapped `::ffff:0:0/96`, compatible `::/96`, NAT64
/// `64:ff9b::/96` and 6to4 `2002::/16`.
fn embedded_ipv4(ip: Ipv6Addr) -> Option<Ipv4Addr> {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return Some(v4);
    }
    let s = ip.segments();
    let v4 = |hi: u16, lo: u16| {
        Ipv4Addr::new((hi >> 8) as u8, hi as u8, (lo >> 8) as u8, lo as u8)
    };
    match s {
        [0, 0, 0, 0, 0, 0, hi, lo] => Some(v4(hi, lo)),
        [0x0064, 0xff9b, 0, 0, 0, 0, hi, lo] => Some(v4(hi, lo)),
        [0x2002, hi, lo, ..] => Some(v4(hi, lo)),
        _ => None,
    }
}

fn is_forbidden_v4(ip: Ipv4Addr) -> bool {
    let [a, b, c, _] = ip.octets();
    ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_multicast()
        || a == 0
        // shared address space (CGNAT), 100.64.0.0/10
        || (a == 100 && (64..=127).contains(&b))
        // IETF protocol assignments, 192.0.0.0/24
        || (a == 192 && b == 0 && c == 0)
        // benchmarking, 198.18.0.0/15
        || (a == 198 && (b == 18 || b == 19))
        // reserved, 240.0.0.0/4
        || a >= 240
}

fn is_forbidden_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_multicast()
        // unique local, fc00::/7
        || (first & 0xfe00) == 0xfc00
        // link-local, fe80::/10
        || (first & 0xffc0) == 0xfe80
        // documentation, 2001:db8::/32
        || (first == 0x2001 && ip.segments()[1] == 0x0db8)
        // Teredo, 2001::/32; the IPv4 inside is obfuscated
        || (first == 0x2001 && ip.segments()[1] == 0)
        // local-use NAT64, 64:ff9b:1::/48
        || (first == 0x0064 && ip.segments()[1] == 0xff9b && ip.segments()[2] == 1)
}
