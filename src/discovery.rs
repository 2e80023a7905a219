//! Host discovery and port scanning.
//!
//! Liveness goes through the [`LivenessProbe`] seam (ICMP by default), then
//! TCP connects and optional UDP probes run over the live hosts. A UDP port
//! only counts as open when the reply parses as an answer to the payload
//! from [`udp_probe`].

use crate::brute_force::BruteForceTarget;
use crate::config::Config;
use crate::control::{ScanEvent, ScanSession, Stage};
use crate::persistence::PersistenceQueue;
use crate::targets::resolve_targets;
use crate::types::{OpenPort, Protocol};
use crate::{Result, ScanError};
use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;

/// Host liveness check used by the first scan stage.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn is_alive(&self, ip: Ipv4Addr, timeout: Duration) -> bool;
}

/// ICMP echo over an unprivileged datagram socket.
pub struct IcmpProbe;

#[async_trait]
impl LivenessProbe for IcmpProbe {
    async fn is_alive(&self, ip: Ipv4Addr, probe_timeout: Duration) -> bool {
        let result = tokio::task::spawn_blocking(move || {
            ping::dgramsock::ping(IpAddr::V4(ip), Some(probe_timeout), None, None, None, None)
        })
        .await;

        match result {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("ICMP probe to {} failed: {}", ip, e);
                false
            }
            Err(e) => {
                debug!("ICMP worker for {} panicked: {}", ip, e);
                false
            }
        }
    }
}

/// Parameters of one discovery run.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub target: String,
    pub ports: String,
    pub threads: usize,
    pub timeout: Duration,
    pub skip_alive_check: bool,
    pub enable_icmp: bool,
    pub enable_udp: bool,
}

impl ScanRequest {
    pub fn from_config(config: &Config, target: &str, ports: &str) -> Self {
        Self {
            target: target.to_string(),
            ports: ports.to_string(),
            threads: config.scan.threads,
            timeout: config.connect_timeout(),
            skip_alive_check: config.discovery.skip_alive_check,
            enable_icmp: config.discovery.enable_icmp,
            enable_udp: config.discovery.enable_udp,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    pub targets: Vec<Ipv4Addr>,
    pub alive: Vec<Ipv4Addr>,
    pub open_ports: Vec<OpenPort>,
    pub cancelled: bool,
}

impl ScanSummary {
    /// Base URLs of every HTTP(S) service found.
    pub fn web_targets(&self) -> Vec<String> {
        self.open_ports.iter().filter_map(OpenPort::base_url).collect()
    }

    /// Every open TCP port as a brute-force candidate.
    pub fn service_targets(&self) -> Vec<BruteForceTarget> {
        self.open_ports
            .iter()
            .filter(|open| open.protocol == Protocol::Tcp)
            .map(|open| BruteForceTarget::new(open.ip, open.port, &open.service))
            .collect()
    }
}

pub struct NetworkDiscovery {
    config: Config,
    persistence: PersistenceQueue,
    probe: Arc<dyn LivenessProbe>,
}

impl NetworkDiscovery {
    pub fn new(config: Config, persistence: PersistenceQueue) -> Self {
        Self::with_probe(config, persistence, Arc::new(IcmpProbe))
    }

    pub fn with_probe(config: Config, persistence: PersistenceQueue, probe: Arc<dyn LivenessProbe>) -> Self {
        Self {
            config,
            persistence,
            probe,
        }
    }

    /// Target resolution, liveness, TCP sweep and the optional UDP stage.
    /// A completion event is published however the run ends.
    pub async fn run_scan(&self, session: &ScanSession, request: &ScanRequest) -> Result<ScanSummary> {
        let result = self.run_stages(session, request).await;
        match &result {
            Ok(summary) if summary.cancelled => session.log("Scan cancelled"),
            Ok(summary) => session.log(format!(
                "Scan finished: {} alive hosts, {} open ports",
                summary.alive.len(),
                summary.open_ports.len()
            )),
            Err(e) => session.log(format!("Scan aborted: {}", e)),
        }
        session.complete();
        result
    }

    async fn run_stages(&self, session: &ScanSession, request: &ScanRequest) -> Result<ScanSummary> {
        let targets = resolve_targets(&request.target).await?;
        let ports = parse_port_spec(&request.ports, &self.config.discovery.common_ports)?;
        let mut summary = ScanSummary {
            targets: targets.clone(),
            ..Default::default()
        };

        session.log(format!("Resolved {} targets", targets.len()));

        summary.alive = if request.skip_alive_check {
            session.log("Skipping liveness check, treating every target as alive");
            targets
        } else if request.enable_icmp {
            session.log(format!("ICMP liveness check on {} hosts", targets.len()));
            self.probe_liveness(session, &targets, request.threads, self.config.ping_timeout())
                .await
        } else {
            targets
        };

        if session.is_cancelled() {
            summary.cancelled = true;
            return Ok(summary);
        }
        if summary.alive.is_empty() {
            session.log("No alive hosts, nothing to port scan");
            return Ok(summary);
        }

        if !ports.is_empty() {
            session.log(format!(
                "TCP scan of {} hosts x {} ports",
                summary.alive.len(),
                ports.len()
            ));
            summary.open_ports = self
                .scan_ports(session, &summary.alive, &ports, request.threads, request.timeout)
                .await;
        }

        if request.enable_udp && !session.is_cancelled() {
            let udp_ports = self.config.discovery.udp_ports.clone();
            session.log(format!("UDP scan of ports {:?}", udp_ports));
            let udp_open = self
                .scan_udp(session, &summary.alive, &udp_ports, request.threads, self.config.udp_timeout())
                .await;
            summary.open_ports.extend(udp_open);
        }

        summary.cancelled = session.is_cancelled();
        Ok(summary)
    }

    /// ICMP-probe every candidate; returns the alive subset in input order.
    pub async fn probe_liveness(
        &self,
        session: &ScanSession,
        ips: &[Ipv4Addr],
        threads: usize,
        probe_timeout: Duration,
    ) -> Vec<Ipv4Addr> {
        let total = ips.len();
        let interval = self.config.discovery.ping_progress_interval.max(1);
        let semaphore = Arc::new(Semaphore::new(threads.max(1)));
        let alive = Arc::new(Mutex::new(std::collections::HashSet::new()));
        let mut workers = JoinSet::new();

        for (index, &ip) in ips.iter().enumerate() {
            let Some(permit) = acquire_slot(session, &semaphore).await else {
                break;
            };

            let done = index + 1;
            if done % interval == 0 || done == total {
                session.progress(Stage::Liveness, percent(done, total));
            }

            let session = session.clone();
            let probe = self.probe.clone();
            let persistence = self.persistence.clone();
            let alive = alive.clone();
            workers.spawn(async move {
                let _permit = permit;
                if session.is_cancelled() {
                    return;
                }
                if probe.is_alive(ip, probe_timeout).await {
                    debug!("Host {} is alive (ICMP)", ip);
                    alive.lock().insert(ip);
                    session.publish(ScanEvent::HostAlive { ip: IpAddr::V4(ip) });
                    persistence.record_alive_host(IpAddr::V4(ip)).await;
                }
            });
        }

        while workers.join_next().await.is_some() {}

        let alive = alive.lock();
        let result: Vec<Ipv4Addr> = ips.iter().copied().filter(|ip| alive.contains(ip)).collect();
        info!("Discovered {} live hosts", result.len());
        result
    }

    /// TCP connect sweep over every (ip, port) pair.
    pub async fn scan_ports(
        &self,
        session: &ScanSession,
        ips: &[Ipv4Addr],
        ports: &[u16],
        threads: usize,
        connect_timeout: Duration,
    ) -> Vec<OpenPort> {
        let total = ips.len() * ports.len();
        let interval = self.config.discovery.port_progress_interval.max(1);
        let grab_banners = self.config.discovery.grab_banners;
        let semaphore = Arc::new(Semaphore::new(threads.max(1)));
        let open_ports = Arc::new(Mutex::new(Vec::new()));
        let mut workers = JoinSet::new();
        let mut dispatched = 0usize;

        'dispatch: for &ip in ips {
            for &port in ports {
                let Some(permit) = acquire_slot(session, &semaphore).await else {
                    break 'dispatch;
                };

                dispatched += 1;
                if dispatched % interval == 0 || dispatched == total {
                    session.progress(Stage::PortScan, percent(dispatched, total));
                }

                let session = session.clone();
                let persistence = self.persistence.clone();
                let open_ports = open_ports.clone();
                workers.spawn(async move {
                    let _permit = permit;
                    if session.is_cancelled() {
                        return;
                    }
                    let Some(banner) = scan_tcp_port(ip, port, connect_timeout, grab_banners).await else {
                        return;
                    };

                    let open = OpenPort {
                        ip: IpAddr::V4(ip),
                        port,
                        protocol: Protocol::Tcp,
                        service: guess_service(port).to_string(),
                        banner,
                    };
                    debug!("TCP Port {}:{} is open ({})", ip, port, open.service);
                    session.publish(ScanEvent::PortOpen(open.clone()));
                    persistence.record_open_port(&open).await;
                    open_ports.lock().push(open);
                });
            }
        }

        while workers.join_next().await.is_some() {}

        let mut result = std::mem::take(&mut *open_ports.lock());
        result.sort_by_key(|open| (open.ip, open.port));
        info!("Found {} open TCP ports", result.len());
        result
    }

    /// UDP stage. A port counts as open only when its reply matches the
    /// protocol of the probe that was sent; silence is not evidence either way.
    pub async fn scan_udp(
        &self,
        session: &ScanSession,
        ips: &[Ipv4Addr],
        ports: &[u16],
        threads: usize,
        reply_timeout: Duration,
    ) -> Vec<OpenPort> {
        let total = ips.len() * ports.len();
        let semaphore = Arc::new(Semaphore::new(threads.max(1)));
        let open_ports = Arc::new(Mutex::new(Vec::new()));
        let mut workers = JoinSet::new();
        let mut dispatched = 0usize;

        'dispatch: for &ip in ips {
            for &port in ports {
                let Some(permit) = acquire_slot(session, &semaphore).await else {
                    break 'dispatch;
                };
                dispatched += 1;
                session.progress(Stage::UdpScan, percent(dispatched, total));

                let session = session.clone();
                let persistence = self.persistence.clone();
                let open_ports = open_ports.clone();
                workers.spawn(async move {
                    let _permit = permit;
                    if session.is_cancelled() || !probe_udp_port(ip, port, reply_timeout).await {
                        return;
                    }
                    let open = OpenPort {
                        ip: IpAddr::V4(ip),
                        port,
                        protocol: Protocol::Udp,
                        service: guess_udp_service(port).to_string(),
                        banner: None,
                    };
                    debug!("UDP Port {}:{} is open", ip, port);
                    session.publish(ScanEvent::PortOpen(open.clone()));
                    persistence.record_open_port(&open).await;
                    open_ports.lock().push(open);
                });
            }
        }

        while workers.join_next().await.is_some() {}

        let mut result = std::mem::take(&mut *open_ports.lock());
        result.sort_by_key(|open| (open.ip, open.port));
        result
    }
}

/// Wait out a pause, then take a worker slot. `None` means the session was
/// cancelled and dispatch should stop.
pub(crate) async fn acquire_slot(session: &ScanSession, semaphore: &Arc<Semaphore>) -> Option<OwnedSemaphorePermit> {
    if session.wait_if_paused().await {
        return None;
    }
    tokio::select! {
        permit = semaphore.clone().acquire_owned() => permit.ok(),
        _ = session.cancelled() => None,
    }
}

pub(crate) fn percent(done: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        done as f64 * 100.0 / total as f64
    }
}

/// Parse a port specification: `all`, `common`, or a comma list of ports
/// and `start-end` ranges.
pub fn parse_port_spec(spec: &str, common_ports: &[u16]) -> Result<Vec<u16>> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Ok(Vec::new());
    }
    if spec.eq_ignore_ascii_case("all") {
        return Ok((1..=65535).collect());
    }
    if spec.eq_ignore_ascii_case("common") {
        return Ok(common_ports.to_vec());
    }

    let mut seen = std::collections::HashSet::new();
    let mut ports = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (start, end) = match part.split_once('-') {
            Some((start, end)) => (parse_port(start)?, parse_port(end)?),
            None => {
                let port = parse_port(part)?;
                (port, port)
            }
        };
        if start > end {
            return Err(ScanError::InvalidInput(format!(
                "Start port cannot be greater than end port: {}",
                part
            )));
        }
        for port in start..=end {
            if seen.insert(port) {
                ports.push(port);
            }
        }
    }
    Ok(ports)
}

fn parse_port(value: &str) -> Result<u16> {
    match value.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ScanError::InvalidInput(format!("Invalid port: {}", value))),
    }
}

/// Application guess for a TCP port.
pub fn guess_service(port: u16) -> &'static str {
    match port {
        21 => "ftp",
        22 => "ssh",
        23 => "telnet",
        25 => "smtp",
        53 => "dns",
        80 | 8000 | 8080 | 8081 | 8888 => "http",
        110 => "pop3",
        135 => "msrpc",
        139 => "netbios-ssn",
        143 => "imap",
        389 => "ldap",
        443 | 8443 => "https",
        445 => "smb",
        1433 => "mssql",
        1521 => "oracle",
        3306 => "mysql",
        3389 => "rdp",
        5432 => "postgresql",
        5900 | 5901 => "vnc",
        5985 => "winrm",
        6379 => "redis",
        27017 => "mongodb",
        _ => "unknown",
    }
}

fn guess_udp_service(port: u16) -> &'static str {
    match port {
        53 => "dns",
        123 => "ntp",
        161 => "snmp",
        _ => "unknown",
    }
}

/// Connect; `None` when closed or filtered, `Some(banner)` when open.
async fn scan_tcp_port(ip: Ipv4Addr, port: u16, connect_timeout: Duration, grab_banner: bool) -> Option<Option<String>> {
    let addr = SocketAddr::new(IpAddr::V4(ip), port);
    let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        _ => return None,
    };

    if !grab_banner {
        return Some(None);
    }
    Some(read_banner(stream, port, connect_timeout).await)
}

async fn read_banner(mut stream: TcpStream, port: u16, read_timeout: Duration) -> Option<String> {
    let probe: Option<&[u8]> = match port {
        80 | 8000 | 8080 | 8081 | 8888 => Some(b"HEAD / HTTP/1.0\r\n\r\n"),
        23 => Some(b"\r\n"),
        _ => None,
    };
    if let Some(probe) = probe {
        let _ = stream.write_all(probe).await;
    }

    let mut buffer = vec![0; 1024];
    match timeout(read_timeout, stream.read(&mut buffer)).await {
        Ok(Ok(n)) if n > 0 => {
            let banner = String::from_utf8_lossy(&buffer[..n]).trim().to_string();
            (!banner.is_empty()).then_some(banner)
        }
        _ => None,
    }
}

/// Request payload for the UDP services the scanner can validate.
pub fn udp_probe(port: u16) -> Option<Vec<u8>> {
    match port {
        // DNS query for version.bind TXT/CHAOS
        53 => Some(vec![
            0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07, b'v', b'e',
            b'r', b's', b'i', b'o', b'n', 0x04, b'b', b'i', b'n', b'd', 0x00, 0x00, 0x10, 0x00, 0x03,
        ]),
        // NTP v3 client request
        123 => {
            let mut packet = vec![0u8; 48];
            packet[0] = 0x1b;
            Some(packet)
        }
        // SNMPv1 GetRequest sysDescr.0, community "public"
        161 => Some(vec![
            0x30, 0x26, 0x02, 0x01, 0x00, 0x04, 0x06, b'p', b'u', b'b', b'l', b'i', b'c', 0xa0, 0x19,
            0x02, 0x01, 0x01, 0x02, 0x01, 0x00, 0x02, 0x01, 0x00, 0x30, 0x0e, 0x30, 0x0c, 0x06, 0x08,
            0x2b, 0x06, 0x01, 0x02, 0x01, 0x01, 0x01, 0x00, 0x05, 0x00,
        ]),
        _ => None,
    }
}

/// Does `reply` answer the probe sent by [`udp_probe`] for `port`?
pub fn is_valid_udp_reply(port: u16, reply: &[u8]) -> bool {
    match port {
        53 => reply.len() >= 12 && reply[0] == 0x12 && reply[1] == 0x34 && reply[2] & 0x80 != 0,
        123 => reply.len() >= 48 && matches!(reply[0] & 0x07, 4 | 5),
        161 => is_snmp_get_response(reply),
        _ => false,
    }
}

/// Request id of the GetRequest built by [`udp_probe`].
const SNMP_REQUEST_ID: u8 = 0x01;

/// Splits one BER element off the front of `data`: tag, contents, remainder.
fn ber_element(data: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let (&tag, rest) = data.split_first()?;
    let (&first, rest) = rest.split_first()?;
    let (len, rest) = match first {
        n if n < 0x80 => (n as usize, rest),
        0x81 => {
            let (&n, rest) = rest.split_first()?;
            (n as usize, rest)
        }
        0x82 => {
            if rest.len() < 2 {
                return None;
            }
            (u16::from_be_bytes([rest[0], rest[1]]) as usize, &rest[2..])
        }
        _ => return None,
    };
    (len <= rest.len()).then(|| (tag, &rest[..len], &rest[len..]))
}

/// SEQUENCE { version INTEGER, community OCTET STRING, GetResponse-PDU }
/// whose request id matches the GetRequest we sent.
fn is_snmp_get_response(reply: &[u8]) -> bool {
    let Some((0x30, message, _)) = ber_element(reply) else {
        return false;
    };
    let Some((0x02, _version, rest)) = ber_element(message) else {
        return false;
    };
    let Some((0x04, _community, rest)) = ber_element(rest) else {
        return false;
    };
    let Some((0xa2, pdu, _)) = ber_element(rest) else {
        return false;
    };
    matches!(ber_element(pdu), Some((0x02, request_id, _)) if request_id == [SNMP_REQUEST_ID])
}

async fn probe_udp_port(ip: Ipv4Addr, port: u16, reply_timeout: Duration) -> bool {
    let Some(probe) = udp_probe(port) else {
        debug!("No UDP probe for port {}, skipping", port);
        return false;
    };

    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(e) => {
            debug!("Failed to bind UDP socket: {}", e);
            return false;
        }
    };
    if socket.connect(SocketAddr::new(IpAddr::V4(ip), port)).await.is_err() {
        return false;
    }
    if socket.send(&probe).await.is_err() {
        return false;
    }

    let mut buffer = vec![0u8; 1500];
    match timeout(reply_timeout, socket.recv(&mut buffer)).await {
        Ok(Ok(n)) => is_valid_udp_reply(port, &buffer[..n]),
        _ => false,
    }
}
