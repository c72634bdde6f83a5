/// Trusted-proxy-aware client IP resolution
///
/// The peer address is only the client when no trusted proxy sits in front.
/// When the peer is trusted, `X-Forwarded-For` is walked right to left,
/// skipping entries that match the trusted-proxies list (exact IP or CIDR);
/// the first untrusted hop is the client. Spoofed XFF from an untrusted
/// peer is ignored entirely.
use std::net::IpAddr;

use axum::http::HeaderMap;

/// Exact IP (`1.2.3.4`) or CIDR (`10.0.0.0/8`, `fd00::/8`) match.
pub fn ip_matches(ip: IpAddr, entry: &str) -> bool {
    if let Some((network, prefix)) = parse_cidr(entry) {
        return cidr_contains(network, prefix, ip);
    }
    entry.parse::<IpAddr>().map(|e| e == ip).unwrap_or(false)
}

pub fn ip_matches_any(ip: IpAddr, entries: &[String]) -> bool {
    entries.iter().any(|entry| ip_matches(ip, entry))
}

/// Resolve the effective client IP for a request.
pub fn client_ip_from(headers: &HeaderMap, peer: IpAddr, trusted_proxies: &[String]) -> IpAddr {
    if trusted_proxies.is_empty() || !ip_matches_any(peer, trusted_proxies) {
        return peer;
    }

    let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    else {
        return peer;
    };

    let hops: Vec<IpAddr> = forwarded
        .split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect();

    // right to left: the rightmost hop not operated by us is the client
    for hop in hops.iter().rev() {
        if !ip_matches_any(*hop, trusted_proxies) {
            return *hop;
        }
    }
    // every hop was ours; fall back to the origin of the chain
    hops.first().copied().unwrap_or(peer)
}

fn parse_cidr(entry: &str) -> Option<(IpAddr, u8)> {
    let (addr, prefix) = entry.split_once('/')?;
    let network: IpAddr = addr.trim().parse().ok()?;
    let prefix: u8 = prefix.trim().parse().ok()?;
    let max = match network {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    (prefix <= max).then_some((network, prefix))
}

fn cidr_contains(network: IpAddr, prefix: u8, ip: IpAddr) -> bool {
    match (network, ip) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            if prefix == 0 {
                return true;
            }
            let mask = u32::MAX << (32 - prefix as u32);
            (u32::from(net) & mask) == (u32::from(ip) & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            if prefix == 0 {
                return true;
            }
            let mask = u128::MAX << (128 - prefix as u32);
            (u128::from(net) & mask) == (u128::from(ip) & mask)
        }
        _ => false,
    }
}
