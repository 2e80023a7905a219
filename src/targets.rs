//! Target resolution: IPv4 literals, CIDR blocks, dash ranges and DNS
//! names, expanded into one deduplicated host list. Hostnames keep every
//! IPv4 address they resolve to.

use crate::{Result, ScanError};
use log::{debug, info};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use tokio::net::lookup_host;

/// Largest block a single target item may expand to (a /8).
pub const MAX_EXPANSION: u64 = 1 << 24;

/// Expands a comma-separated target list into an ordered, deduplicated set
/// of IPv4 addresses.
///
/// Each item is tried as a literal IP, then a CIDR block, then an
/// `a.b.c.d-e.f.g.h` range, then a hostname. Any item that fits none of
/// these fails the whole resolution.
pub async fn resolve_targets(input: &str) -> Result<Vec<Ipv4Addr>> {
    let mut seen = HashSet::new();
    let mut resolved = Vec::new();

    for item in input.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        for ip in resolve_item(item).await? {
            if seen.insert(ip) {
                resolved.push(ip);
            }
        }
    }

    if resolved.is_empty() {
        return Err(ScanError::InvalidTarget("no valid targets found".to_string()));
    }

    info!("Resolved {} target addresses", resolved.len());
    Ok(resolved)
}

async fn resolve_item(item: &str) -> Result<Vec<Ipv4Addr>> {
    match item.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => return Ok(vec![ip]),
        Ok(IpAddr::V6(_)) => {
            return Err(ScanError::InvalidTarget(format!("IPv6 targets are not supported: {}", item)))
        }
        Err(_) => {}
    }

    if item.contains('/') {
        return expand_cidr(item);
    }

    if let Some(range) = expand_range(item) {
        return range;
    }

    resolve_hostname(item).await
}

/// Expand CIDR notation. Network and broadcast addresses are dropped when
/// the block holds more than two addresses.
pub fn expand_cidr(cidr: &str) -> Result<Vec<Ipv4Addr>> {
    let (base, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| ScanError::InvalidTarget(format!("Invalid CIDR format: {}", cidr)))?;

    let base_ip: Ipv4Addr = base
        .trim()
        .parse()
        .map_err(|_| ScanError::InvalidTarget(format!("Invalid IP in CIDR: {}", base)))?;

    let prefix_len: u32 = prefix
        .trim()
        .parse()
        .map_err(|_| ScanError::InvalidTarget(format!("Invalid prefix length: {}", prefix)))?;

    if prefix_len > 32 {
        return Err(ScanError::InvalidTarget("Prefix length cannot exceed 32".to_string()));
    }

    let size = 1u64 << (32 - prefix_len);
    if size > MAX_EXPANSION {
        return Err(ScanError::InvalidTarget(format!(
            "CIDR block {} is too large ({} addresses)",
            cidr, size
        )));
    }

    let network = u64::from(u32::from(base_ip)) & !(size - 1);
    let last = network + size - 1;
    let (first, last) = if size > 2 { (network + 1, last - 1) } else { (network, last) };

    let ips = (first..=last).map(|ip| Ipv4Addr::from(ip as u32)).collect::<Vec<_>>();
    debug!("Expanded {} into {} hosts", cidr, ips.len());
    Ok(ips)
}

/// Expand an inclusive `start-end` IPv4 range. Returns `None` when the item
/// is not shaped like a range so it can fall through to DNS.
pub fn expand_range(range: &str) -> Option<Result<Vec<Ipv4Addr>>> {
    let (start, end) = range.split_once('-')?;
    let start: Ipv4Addr = start.trim().parse().ok()?;
    let end: Ipv4Addr = end.trim().parse().ok()?;

    let (start, end) = (u32::from(start), u32::from(end));
    if start > end {
        return Some(Err(ScanError::InvalidTarget(format!(
            "Start IP cannot be greater than end IP: {}",
            range
        ))));
    }
    if u64::from(end - start) + 1 > MAX_EXPANSION {
        return Some(Err(ScanError::InvalidTarget(format!("Range {} is too large", range))));
    }

    Some(Ok((start..=end).map(Ipv4Addr::from).collect()))
}

async fn resolve_hostname(hostname: &str) -> Result<Vec<Ipv4Addr>> {
    let addrs = lookup_host(format!("{}:0", hostname))
        .await
        .map_err(|e| ScanError::InvalidTarget(format!("invalid target {}: {}", hostname, e)))?;

    let ips: Vec<Ipv4Addr> = addrs
        .filter_map(|addr| match addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .collect();

    if ips.is_empty() {
        return Err(ScanError::InvalidTarget(format!(
            "invalid target {}: no IPv4 address",
            hostname
        )));
    }

    debug!("Resolved {} to {:?}", hostname, ips);
    Ok(ips)
}
