use super::BruteForcer;
use crate::{Result, ScanError};
use async_trait::async_trait;
use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockEncrypt, KeyInit};
use des::Des;
use ldap3::{LdapConnAsync, LdapConnSettings};
use log::debug;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

async fn connect(target: IpAddr, port: u16, connect_timeout: Duration) -> Result<TcpStream> {
    let addr = SocketAddr::new(target, port);
    match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ScanError::Network(e)),
        Err(_) => Err(ScanError::Timeout {
            operation: format!("connect to {}", addr),
        }),
    }
}

async fn read_exact_timeout(stream: &mut TcpStream, buf: &mut [u8], read_timeout: Duration) -> Result<()> {
    match timeout(read_timeout, stream.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(ScanError::Network(e)),
        Err(_) => Err(ScanError::Timeout {
            operation: "read".to_string(),
        }),
    }
}

// SSH Brute Forcer
pub struct SshBruteForcer;

#[async_trait]
impl BruteForcer for SshBruteForcer {
    async fn attempt_login(
        &self,
        target: IpAddr,
        port: u16,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<bool> {
        let addr = SocketAddr::new(target, port);
        let username = username.to_string();
        let password = password.to_string();

        // libssh2 is blocking
        tokio::task::spawn_blocking(move || -> Result<bool> {
            let tcp = std::net::TcpStream::connect_timeout(&addr, timeout)?;
            let mut session = ssh2::Session::new()?;
            session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
            session.set_tcp_stream(tcp);
            session.handshake()?;

            match session.userauth_password(&username, &password) {
                Ok(()) => Ok(session.authenticated()),
                Err(_) => Ok(false),
            }
        })
        .await
        .map_err(|e| ScanError::BruteForce(format!("SSH worker failed: {}", e)))?
    }

    fn service_name(&self) -> &'static str {
        "ssh"
    }

    fn default_port(&self) -> u16 {
        22
    }
}

// FTP Brute Forcer
pub struct FtpBruteForcer;

/// Read one FTP reply, following `NNN-` continuation lines to the final `NNN `.
async fn read_ftp_reply<R>(reader: &mut BufReader<R>, read_timeout: Duration) -> Result<u16>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    let mut code: Option<u16> = None;
    loop {
        line.clear();
        let n = timeout(read_timeout, reader.read_line(&mut line))
            .await
            .map_err(|_| ScanError::Timeout {
                operation: "FTP reply".to_string(),
            })??;
        if n == 0 {
            return Err(ScanError::BruteForce("FTP connection closed".to_string()));
        }

        let this_code = line.get(..3).and_then(|c| c.parse::<u16>().ok());
        match (code, this_code) {
            (None, Some(c)) if line.as_bytes().get(3) == Some(&b'-') => code = Some(c),
            (None, Some(c)) => return Ok(c),
            (Some(c), Some(this)) if this == c && line.as_bytes().get(3) != Some(&b'-') => return Ok(c),
            (None, None) => {
                return Err(ScanError::BruteForce(format!("Malformed FTP reply: {}", line.trim())));
            }
            _ => {}
        }
    }
}

#[async_trait]
impl BruteForcer for FtpBruteForcer {
    async fn attempt_login(
        &self,
        target: IpAddr,
        port: u16,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<bool> {
        let stream = connect(target, port, timeout).await?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        if read_ftp_reply(&mut reader, timeout).await? != 220 {
            return Ok(false);
        }

        writer.write_all(format!("USER {}\r\n", username).as_bytes()).await?;
        let success = match read_ftp_reply(&mut reader, timeout).await? {
            230 => true,
            331 | 332 => {
                writer.write_all(format!("PASS {}\r\n", password).as_bytes()).await?;
                read_ftp_reply(&mut reader, timeout).await? == 230
            }
            _ => false,
        };

        let _ = writer.write_all(b"QUIT\r\n").await;
        Ok(success)
    }

    fn service_name(&self) -> &'static str {
        "ftp"
    }

    fn default_port(&self) -> u16 {
        21
    }
}

// Telnet Brute Forcer
pub struct TelnetBruteForcer;

const IAC: u8 = 0xff;
const WILL: u8 = 0xfb;
const WONT: u8 = 0xfc;
const DO: u8 = 0xfd;
const DONT: u8 = 0xfe;
const SB: u8 = 0xfa;
const SE: u8 = 0xf0;

/// Split option negotiation out of a telnet read. Returns the printable
/// data and the reply refusing every requested option.
pub fn telnet_negotiate(input: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut data = Vec::with_capacity(input.len());
    let mut reply = Vec::new();
    let mut i = 0;
    while i < input.len() {
        if input[i] != IAC {
            data.push(input[i]);
            i += 1;
            continue;
        }
        match input.get(i + 1) {
            Some(&IAC) => {
                data.push(IAC);
                i += 2;
            }
            Some(&cmd @ (DO | DONT | WILL | WONT)) => {
                if let Some(&option) = input.get(i + 2) {
                    match cmd {
                        DO => reply.extend_from_slice(&[IAC, WONT, option]),
                        WILL => reply.extend_from_slice(&[IAC, DONT, option]),
                        _ => {}
                    }
                }
                i += 3;
            }
            Some(&SB) => {
                i += 2;
                while i + 1 < input.len() && !(input[i] == IAC && input[i + 1] == SE) {
                    i += 1;
                }
                i += 2;
            }
            _ => i += 2,
        }
    }
    (data, reply)
}

/// Post-login output check. Failure wording wins over a prompt character.
pub fn telnet_login_succeeded(output: &str) -> bool {
    let lower = output.to_lowercase();
    if ["incorrect", "fail", "denied", "invalid"]
        .iter()
        .any(|marker| lower.contains(marker))
    {
        return false;
    }
    output.contains('$') || output.contains('#') || output.contains('>')
}

/// Collect output until the peer goes quiet for a moment or `budget` runs out.
async fn telnet_read(stream: &mut TcpStream, budget: Duration) -> Result<String> {
    let deadline = Instant::now() + budget;
    let mut output = Vec::new();
    let mut buf = [0u8; 4096];
    let quiet = Duration::from_millis(300);

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let wait = if output.is_empty() { deadline - now } else { quiet.min(deadline - now) };
        match timeout(wait, stream.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                let (data, reply) = telnet_negotiate(&buf[..n]);
                if !reply.is_empty() {
                    stream.write_all(&reply).await?;
                }
                output.extend_from_slice(&data);
            }
            Ok(Err(e)) => return Err(ScanError::Network(e)),
            Err(_) => break,
        }
    }

    if output.is_empty() {
        return Err(ScanError::Timeout {
            operation: "telnet read".to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output).into_owned())
}

#[async_trait]
impl BruteForcer for TelnetBruteForcer {
    async fn attempt_login(
        &self,
        target: IpAddr,
        port: u16,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<bool> {
        let mut stream = connect(target, port, timeout).await?;

        telnet_read(&mut stream, timeout).await?;
        stream.write_all(format!("{}\r\n", username).as_bytes()).await?;
        telnet_read(&mut stream, timeout).await?;
        stream.write_all(format!("{}\r\n", password).as_bytes()).await?;
        let output = telnet_read(&mut stream, timeout).await?;

        Ok(telnet_login_succeeded(&output))
    }

    fn service_name(&self) -> &'static str {
        "telnet"
    }

    fn default_port(&self) -> u16 {
        23
    }
}

// RDP Brute Forcer
pub struct RdpBruteForcer;

/// TPKT + X.224 Connection Request with an RDP_NEG_REQ asking for standard RDP security.
const RDP_CONNECTION_REQUEST: [u8; 19] = [
    0x03, 0x00, 0x00, 0x13, // TPKT Header
    0x0e, 0xe0, 0x00, 0x00, 0x00, 0x00, 0x00, // X.224 Connection Request
    0x01, 0x00, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, // RDP_NEG_REQ, PROTOCOL_RDP
];

/// Whether an X.224 Connection Confirm accepts a session without
/// network-level authentication.
pub fn rdp_accepts_connection(response: &[u8]) -> bool {
    if response.len() < 7 || response[0] != 0x03 || response[1] != 0x00 || response[5] & 0xf0 != 0xd0 {
        return false;
    }
    match response.get(11) {
        Some(0x02) => true,  // RDP_NEG_RSP
        Some(0x03) => false, // RDP_NEG_FAILURE, e.g. NLA required
        _ => true,           // legacy server without negotiation data
    }
}

#[async_trait]
impl BruteForcer for RdpBruteForcer {
    /// Connection-level check only: succeeds when the server hands out a
    /// session without NLA. The credentials are not verified.
    async fn attempt_login(
        &self,
        target: IpAddr,
        port: u16,
        _username: &str,
        _password: &str,
        timeout: Duration,
    ) -> Result<bool> {
        let mut stream = connect(target, port, timeout).await?;
        stream.write_all(&RDP_CONNECTION_REQUEST).await?;

        let mut buffer = vec![0; 1024];
        match tokio::time::timeout(timeout, stream.read(&mut buffer)).await {
            Ok(Ok(n)) if n > 0 => Ok(rdp_accepts_connection(&buffer[..n])),
            _ => Ok(false),
        }
    }

    fn service_name(&self) -> &'static str {
        "rdp"
    }

    fn default_port(&self) -> u16 {
        3389
    }
}

// WinRM Brute Forcer
pub struct WinRmBruteForcer;

const WSMAN_IDENTIFY: &str = concat!(
    r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" "#,
    r#"xmlns:wsmid="http://schemas.dmtf.org/wbem/wsman/identity/1/wsmanidentity.xsd">"#,
    r#"<s:Header/><s:Body><wsmid:Identify/></s:Body></s:Envelope>"#
);

#[async_trait]
impl BruteForcer for WinRmBruteForcer {
    async fn attempt_login(
        &self,
        target: IpAddr,
        port: u16,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<bool> {
        let scheme = if port == 5986 { "https" } else { "http" };
        let host = match target {
            IpAddr::V4(ip) => ip.to_string(),
            IpAddr::V6(ip) => format!("[{}]", ip),
        };
        let url = format!("{}://{}:{}/wsman", scheme, host, port);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()?;
        let response = client
            .post(&url)
            .basic_auth(username, Some(password))
            .header("Content-Type", "application/soap+xml;charset=UTF-8")
            .body(WSMAN_IDENTIFY)
            .send()
            .await?;

        debug!("WinRM {} answered {}", url, response.status());
        Ok(response.status().is_success())
    }

    fn service_name(&self) -> &'static str {
        "winrm"
    }

    fn default_port(&self) -> u16 {
        5985
    }
}

// LDAP Brute Forcer
pub struct LdapBruteForcer;

#[async_trait]
impl BruteForcer for LdapBruteForcer {
    async fn attempt_login(
        &self,
        target: IpAddr,
        port: u16,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<bool> {
        // An empty password turns a simple bind into an unauthenticated one.
        if password.is_empty() {
            return Ok(false);
        }

        let settings = LdapConnSettings::new().set_conn_timeout(timeout);
        let url = format!("ldap://{}", SocketAddr::new(target, port));
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &url).await?;
        ldap3::drive!(conn);

        let bind = tokio::time::timeout(timeout, ldap.simple_bind(username, password))
            .await
            .map_err(|_| ScanError::Timeout {
                operation: "LDAP bind".to_string(),
            })??;
        let success = bind.success().is_ok();
        let _ = ldap.unbind().await;
        Ok(success)
    }

    fn service_name(&self) -> &'static str {
        "ldap"
    }

    fn default_port(&self) -> u16 {
        389
    }
}

// VNC Brute Forcer
pub struct VncBruteForcer;

const VNC_AUTH: u8 = 2;

/// DES key for VNC authentication: the password's first eight bytes,
/// zero padded, each byte bit-reversed.
pub fn vnc_key(password: &str) -> [u8; 8] {
    let mut key = [0u8; 8];
    for (slot, byte) in key.iter_mut().zip(password.bytes()) {
        *slot = byte.reverse_bits();
    }
    key
}

/// Encrypt the 16-byte server challenge with the password key.
pub fn vnc_response(password: &str, challenge: &[u8; 16]) -> Result<[u8; 16]> {
    let cipher = Des::new_from_slice(&vnc_key(password))
        .map_err(|e| ScanError::BruteForce(format!("Invalid DES key: {}", e)))?;
    let mut response = [0u8; 16];
    for (out, chunk) in response.chunks_mut(8).zip(challenge.chunks(8)) {
        let mut block = GenericArray::clone_from_slice(chunk);
        cipher.encrypt_block(&mut block);
        out.copy_from_slice(&block);
    }
    Ok(response)
}

/// Parse `RFB xxx.yyy\n`.
fn parse_rfb_version(banner: &[u8; 12]) -> Option<(u32, u32)> {
    let text = std::str::from_utf8(banner).ok()?;
    let version = text.strip_prefix("RFB ")?.trim_end();
    let (major, minor) = version.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

#[async_trait]
impl BruteForcer for VncBruteForcer {
    async fn attempt_login(
        &self,
        target: IpAddr,
        port: u16,
        _username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<bool> {
        let mut stream = connect(target, port, timeout).await?;

        let mut banner = [0u8; 12];
        read_exact_timeout(&mut stream, &mut banner, timeout).await?;
        let (major, minor) = parse_rfb_version(&banner)
            .ok_or_else(|| ScanError::BruteForce("Not an RFB server".to_string()))?;

        let minor = match (major, minor) {
            (3, m) if m >= 8 => 8,
            (3, 7) => 7,
            (3, _) => 3,
            (m, _) if m > 3 => 8,
            _ => return Ok(false),
        };
        stream
            .write_all(format!("RFB 003.{:03}\n", minor).as_bytes())
            .await?;

        if minor == 3 {
            let mut security = [0u8; 4];
            read_exact_timeout(&mut stream, &mut security, timeout).await?;
            if u32::from_be_bytes(security) != u32::from(VNC_AUTH) {
                return Ok(false);
            }
        } else {
            let mut count = [0u8; 1];
            read_exact_timeout(&mut stream, &mut count, timeout).await?;
            if count[0] == 0 {
                return Ok(false);
            }
            let mut types = vec![0u8; count[0] as usize];
            read_exact_timeout(&mut stream, &mut types, timeout).await?;
            if !types.contains(&VNC_AUTH) {
                return Ok(false);
            }
            stream.write_all(&[VNC_AUTH]).await?;
        }

        let mut challenge = [0u8; 16];
        read_exact_timeout(&mut stream, &mut challenge, timeout).await?;
        stream.write_all(&vnc_response(password, &challenge)?).await?;

        let mut result = [0u8; 4];
        read_exact_timeout(&mut stream, &mut result, timeout).await?;
        Ok(u32::from_be_bytes(result) == 0)
    }

    fn service_name(&self) -> &'static str {
        "vnc"
    }

    fn default_port(&self) -> u16 {
        5900
    }
}
