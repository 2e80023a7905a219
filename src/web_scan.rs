//! HTTP plumbing shared by the directory scanner and the JS finder.

use crate::persistence::PersistenceQueue;
use crate::utils::text::truncate_with_ellipsis;
use crate::{Result, ScanError};
use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;
use reqwest::{Client, Response};
use std::net::IpAddr;
use std::time::Duration;
use tokio::net::lookup_host;
use url::Url;

lazy_static! {
    static ref TITLE_RE: Regex = Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap();
}

/// Longest title kept before truncation.
pub const MAX_TITLE_CHARS: usize = 100;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub timeout: Duration,
    pub follow_redirects: bool,
    pub max_redirects: usize,
    pub user_agent: String,
}

/// Scanner HTTP client. Certificates are never verified.
pub fn build_client(options: &ClientOptions) -> Result<Client> {
    Client::builder()
        .timeout(options.timeout)
        .danger_accept_invalid_certs(true)
        .redirect(if options.follow_redirects {
            reqwest::redirect::Policy::limited(options.max_redirects.max(1))
        } else {
            reqwest::redirect::Policy::none()
        })
        .user_agent(&options.user_agent)
        .build()
        .map_err(|e| ScanError::WebScan(format!("Failed to create HTTP client: {}", e)))
}

/// Read at most `cap` bytes of the body; the rest is discarded.
pub async fn read_capped(mut response: Response, cap: usize) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let room = cap.saturating_sub(body.len());
                if chunk.len() >= room {
                    body.extend_from_slice(&chunk[..room]);
                    break;
                }
                body.extend_from_slice(&chunk);
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Body read interrupted: {}", e);
                break;
            }
        }
    }
    body
}

/// Trimmed `<title>` text, truncated to [`MAX_TITLE_CHARS`].
pub fn extract_title(html: &str) -> Option<String> {
    let title = TITLE_RE.captures(html)?.get(1)?.as_str().trim();
    if title.is_empty() {
        return None;
    }
    Some(truncate_with_ellipsis(title, MAX_TITLE_CHARS))
}

/// Prefix `http://` when no scheme is given and drop trailing slashes.
pub fn normalize_target(target: &str) -> String {
    let target = target.trim();
    let target = if target.starts_with("http://") || target.starts_with("https://") {
        target.to_string()
    } else {
        format!("http://{}", target)
    };
    target.trim_end_matches('/').to_string()
}

/// Host IP a crawl is attributed to. Hostnames bind to the first address
/// the resolver returns; any further addresses are ignored.
pub async fn resolve_host_ip(url: &Url) -> Option<IpAddr> {
    let host = url.host_str()?.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(ip);
    }
    let port = url.port_or_known_default().unwrap_or(80);
    match lookup_host((host, port)).await {
        Ok(mut addrs) => addrs.next().map(|addr| addr.ip()),
        Err(e) => {
            debug!("Could not resolve {}: {}", host, e);
            None
        }
    }
}

/// Upsert the Asset/Port/WebService chain for `target` and return the
/// WebService id. `None` when the host cannot be resolved or the write fails;
/// the crawl then persists only its flat rows.
pub async fn resolve_web_service(persistence: &PersistenceQueue, target: &str) -> Option<i64> {
    let url = Url::parse(target).ok()?;
    let port = url.port_or_known_default()?;
    let ip = resolve_host_ip(&url).await?;

    match persistence.bind_web_service(ip, port, url.scheme(), target).await {
        Ok(id) => Some(id),
        Err(e) => {
            warn!("Failed to bind web service for {}: {}", target, e);
            None
        }
    }
}
