//! SMB2 login check: NEGOTIATE, then a two-leg SESSION_SETUP carrying
//! SPNEGO-wrapped NTLMSSP with an NTLMv2 response.

use super::BruteForcer;
use crate::{Result, ScanError};
use async_trait::async_trait;
use log::debug;
use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

type HmacMd5 = Hmac<Md5>;

const SMB2_MAGIC: [u8; 4] = [0xfe, b'S', b'M', b'B'];
const SMB2_HEADER_LEN: usize = 64;
const SMB2_NEGOTIATE: u16 = 0x0000;
const SMB2_SESSION_SETUP: u16 = 0x0001;
const SMB2_LOGOFF: u16 = 0x0002;
const DIALECTS: [u16; 4] = [0x0202, 0x0210, 0x0300, 0x0302];

const STATUS_SUCCESS: u32 = 0x0000_0000;
const STATUS_PENDING: u32 = 0x0000_0103;
const STATUS_MORE_PROCESSING_REQUIRED: u32 = 0xc000_0016;

const SESSION_FLAG_IS_GUEST: u16 = 0x0001;
const SESSION_FLAG_IS_NULL: u16 = 0x0002;

const NTLMSSP_SIGNATURE: &[u8; 8] = b"NTLMSSP\0";
/// UNICODE | REQUEST_TARGET | NTLM | ALWAYS_SIGN | EXTENDED_SESSIONSECURITY
/// | TARGET_INFO | 128 | 56
pub const NTLM_NEGOTIATE_FLAGS: u32 = 0xa088_8205;
const MSV_AV_TIMESTAMP: u16 = 0x0007;

const SPNEGO_OID: [u8; 6] = [0x2b, 0x06, 0x01, 0x05, 0x05, 0x02];
const NTLMSSP_OID: [u8; 10] = [0x2b, 0x06, 0x01, 0x04, 0x01, 0x82, 0x37, 0x02, 0x02, 0x0a];

/// Seconds between 1601-01-01 and the Unix epoch.
const FILETIME_EPOCH_OFFSET: u64 = 11_644_473_600;

/// HMAC-MD5 (RFC 2104).
pub fn hmac_md5(key: &[u8], data: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    // HMAC accepts keys of any length
    if let Ok(mut mac) = <HmacMd5 as Mac>::new_from_slice(key) {
        Mac::update(&mut mac, data);
        out.copy_from_slice(&mac.finalize().into_bytes());
    }
    out
}

fn utf16le(value: &str) -> Vec<u8> {
    value.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// MD4 of the UTF-16LE password.
pub fn nt_hash(password: &str) -> [u8; 16] {
    let mut hasher = Md4::new();
    hasher.update(utf16le(password));
    let mut out = [0u8; 16];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// NTOWFv2: HMAC-MD5 keyed by the NT hash over upper-cased user + domain.
pub fn ntowf_v2(user: &str, password: &str, domain: &str) -> [u8; 16] {
    let identity = format!("{}{}", user.to_uppercase(), domain);
    hmac_md5(&nt_hash(password), &utf16le(&identity))
}

/// NTProofStr followed by the client blob.
pub fn ntlmv2_response(
    ntowf: &[u8; 16],
    server_challenge: &[u8; 8],
    client_challenge: &[u8; 8],
    timestamp: u64,
    target_info: &[u8],
) -> Vec<u8> {
    let mut blob = Vec::with_capacity(32 + target_info.len());
    blob.extend_from_slice(&[0x01, 0x01, 0, 0, 0, 0, 0, 0]);
    blob.extend_from_slice(&timestamp.to_le_bytes());
    blob.extend_from_slice(client_challenge);
    blob.extend_from_slice(&[0; 4]);
    blob.extend_from_slice(target_info);
    blob.extend_from_slice(&[0; 4]);

    let mut proof_input = server_challenge.to_vec();
    proof_input.extend_from_slice(&blob);
    let mut response = hmac_md5(ntowf, &proof_input).to_vec();
    response.extend_from_slice(&blob);
    response
}

pub fn lmv2_response(ntowf: &[u8; 16], server_challenge: &[u8; 8], client_challenge: &[u8; 8]) -> [u8; 24] {
    let mut input = server_challenge.to_vec();
    input.extend_from_slice(client_challenge);
    let mut response = [0u8; 24];
    response[..16].copy_from_slice(&hmac_md5(ntowf, &input));
    response[16..].copy_from_slice(client_challenge);
    response
}

pub fn negotiate_message() -> Vec<u8> {
    let mut msg = Vec::with_capacity(32);
    msg.extend_from_slice(NTLMSSP_SIGNATURE);
    msg.extend_from_slice(&1u32.to_le_bytes());
    msg.extend_from_slice(&NTLM_NEGOTIATE_FLAGS.to_le_bytes());
    msg.extend_from_slice(&[0; 16]); // empty domain and workstation fields
    msg
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtlmChallenge {
    pub flags: u32,
    pub server_challenge: [u8; 8],
    pub target_info: Vec<u8>,
}

impl NtlmChallenge {
    /// MsvAvTimestamp from the target info, when the server sent one.
    pub fn timestamp(&self) -> Option<u64> {
        let info = &self.target_info;
        let mut i = 0;
        while i + 4 <= info.len() {
            let id = u16::from_le_bytes([info[i], info[i + 1]]);
            let len = u16::from_le_bytes([info[i + 2], info[i + 3]]) as usize;
            let value = info.get(i + 4..i + 4 + len)?;
            match id {
                0 => return None,
                MSV_AV_TIMESTAMP if len == 8 => {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(value);
                    return Some(u64::from_le_bytes(raw));
                }
                _ => i += 4 + len,
            }
        }
        None
    }
}

fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes(buf.get(at..at + 2)?.try_into().ok()?))
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_le_bytes(buf.get(at..at + 4)?.try_into().ok()?))
}

fn read_u64(buf: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_le_bytes(buf.get(at..at + 8)?.try_into().ok()?))
}

/// Find the CHALLENGE message inside a security blob.
pub fn parse_challenge(blob: &[u8]) -> Option<NtlmChallenge> {
    let start = blob.windows(8).position(|w| w == NTLMSSP_SIGNATURE)?;
    let msg = &blob[start..];
    if read_u32(msg, 8)? != 2 {
        return None;
    }
    let flags = read_u32(msg, 20)?;
    let mut server_challenge = [0u8; 8];
    server_challenge.copy_from_slice(msg.get(24..32)?);

    let info_len = read_u16(msg, 40)? as usize;
    let info_offset = read_u32(msg, 44)? as usize;
    let target_info = if info_len == 0 {
        Vec::new()
    } else {
        msg.get(info_offset..info_offset + info_len)?.to_vec()
    };

    Some(NtlmChallenge {
        flags,
        server_challenge,
        target_info,
    })
}

pub fn authenticate_message(
    challenge: &NtlmChallenge,
    domain: &str,
    user: &str,
    password: &str,
    client_challenge: &[u8; 8],
    timestamp: u64,
) -> Vec<u8> {
    const HEADER_LEN: usize = 64;

    let ntowf = ntowf_v2(user, password, domain);
    let lm = lmv2_response(&ntowf, &challenge.server_challenge, client_challenge);
    let nt = ntlmv2_response(
        &ntowf,
        &challenge.server_challenge,
        client_challenge,
        timestamp,
        &challenge.target_info,
    );
    let domain = utf16le(domain);
    let user = utf16le(user);
    let workstation: Vec<u8> = Vec::new();

    // Payload order: domain, user, workstation, LM, NT, session key
    let fields: [&[u8]; 6] = [&domain, &user, &workstation, &lm, &nt, &[]];
    let mut offsets = [0u32; 6];
    let mut offset = HEADER_LEN;
    for (slot, field) in offsets.iter_mut().zip(fields.iter()) {
        *slot = offset as u32;
        offset += field.len();
    }

    let mut msg = Vec::with_capacity(offset);
    msg.extend_from_slice(NTLMSSP_SIGNATURE);
    msg.extend_from_slice(&3u32.to_le_bytes());
    // Header field order differs from payload order: LM, NT, domain, user, workstation, key
    for index in [3usize, 4, 0, 1, 2, 5] {
        let len = fields[index].len() as u16;
        msg.extend_from_slice(&len.to_le_bytes());
        msg.extend_from_slice(&len.to_le_bytes());
        msg.extend_from_slice(&offsets[index].to_le_bytes());
    }
    let flags = (challenge.flags & NTLM_NEGOTIATE_FLAGS) | 0x0000_0001;
    msg.extend_from_slice(&flags.to_le_bytes());
    for field in fields {
        msg.extend_from_slice(field);
    }
    msg
}

fn der_len(len: usize) -> Vec<u8> {
    match len {
        0..=0x7f => vec![len as u8],
        0x80..=0xff => vec![0x81, len as u8],
        _ => vec![0x82, (len >> 8) as u8, len as u8],
    }
}

fn der(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend(der_len(content.len()));
    out.extend_from_slice(content);
    out
}

/// GSS-API NegTokenInit offering NTLMSSP.
pub fn spnego_init(mech_token: &[u8]) -> Vec<u8> {
    let mech_types = der(0xa0, &der(0x30, &der(0x06, &NTLMSSP_OID)));
    let token = der(0xa2, &der(0x04, mech_token));
    let neg_token_init = der(0xa0, &der(0x30, &[mech_types, token].concat()));
    der(0x60, &[der(0x06, &SPNEGO_OID), neg_token_init].concat())
}

/// NegTokenResp carrying the AUTHENTICATE message.
pub fn spnego_response(response_token: &[u8]) -> Vec<u8> {
    der(0xa1, &der(0x30, &der(0xa2, &der(0x04, response_token))))
}

fn smb2_header(command: u16, message_id: u64, session_id: u64) -> Vec<u8> {
    let mut header = Vec::with_capacity(SMB2_HEADER_LEN);
    header.extend_from_slice(&SMB2_MAGIC);
    header.extend_from_slice(&64u16.to_le_bytes()); // StructureSize
    header.extend_from_slice(&0u16.to_le_bytes()); // CreditCharge
    header.extend_from_slice(&0u32.to_le_bytes()); // Status
    header.extend_from_slice(&command.to_le_bytes());
    header.extend_from_slice(&1u16.to_le_bytes()); // CreditRequest
    header.extend_from_slice(&0u32.to_le_bytes()); // Flags
    header.extend_from_slice(&0u32.to_le_bytes()); // NextCommand
    header.extend_from_slice(&message_id.to_le_bytes());
    header.extend_from_slice(&0u32.to_le_bytes()); // Reserved
    header.extend_from_slice(&0u32.to_le_bytes()); // TreeId
    header.extend_from_slice(&session_id.to_le_bytes());
    header.extend_from_slice(&[0; 16]); // Signature
    header
}

fn negotiate_request() -> Vec<u8> {
    let mut msg = smb2_header(SMB2_NEGOTIATE, 0, 0);
    msg.extend_from_slice(&36u16.to_le_bytes());
    msg.extend_from_slice(&(DIALECTS.len() as u16).to_le_bytes());
    msg.extend_from_slice(&1u16.to_le_bytes()); // SIGNING_ENABLED
    msg.extend_from_slice(&0u16.to_le_bytes());
    msg.extend_from_slice(&0u32.to_le_bytes()); // Capabilities
    msg.extend_from_slice(&rand::random::<[u8; 16]>()); // ClientGuid
    msg.extend_from_slice(&0u64.to_le_bytes()); // ClientStartTime
    for dialect in DIALECTS {
        msg.extend_from_slice(&dialect.to_le_bytes());
    }
    msg
}

fn session_setup_request(message_id: u64, session_id: u64, security_blob: &[u8]) -> Vec<u8> {
    let mut msg = smb2_header(SMB2_SESSION_SETUP, message_id, session_id);
    msg.extend_from_slice(&25u16.to_le_bytes());
    msg.push(0); // Flags
    msg.push(1); // SecurityMode
    msg.extend_from_slice(&0u32.to_le_bytes()); // Capabilities
    msg.extend_from_slice(&0u32.to_le_bytes()); // Channel
    msg.extend_from_slice(&((SMB2_HEADER_LEN + 24) as u16).to_le_bytes());
    msg.extend_from_slice(&(security_blob.len() as u16).to_le_bytes());
    msg.extend_from_slice(&0u64.to_le_bytes()); // PreviousSessionId
    msg.extend_from_slice(security_blob);
    msg
}

fn logoff_request(message_id: u64, session_id: u64) -> Vec<u8> {
    let mut msg = smb2_header(SMB2_LOGOFF, message_id, session_id);
    msg.extend_from_slice(&4u16.to_le_bytes());
    msg.extend_from_slice(&0u16.to_le_bytes());
    msg
}

#[derive(Debug)]
struct Smb2Response {
    status: u32,
    session_id: u64,
    packet: Vec<u8>,
}

impl Smb2Response {
    fn parse(packet: Vec<u8>) -> Result<Self> {
        if packet.len() < SMB2_HEADER_LEN || packet[..4] != SMB2_MAGIC {
            return Err(ScanError::BruteForce("Not an SMB2 response".to_string()));
        }
        let status = read_u32(&packet, 8).unwrap_or_default();
        let session_id = read_u64(&packet, 40).unwrap_or_default();
        Ok(Self {
            status,
            session_id,
            packet,
        })
    }

    fn body(&self) -> &[u8] {
        &self.packet[SMB2_HEADER_LEN..]
    }

    fn session_flags(&self) -> u16 {
        read_u16(self.body(), 2).unwrap_or_default()
    }

    /// Security buffer of a SESSION_SETUP response.
    fn security_blob(&self) -> Option<&[u8]> {
        let offset = read_u16(self.body(), 4)? as usize;
        let len = read_u16(self.body(), 6)? as usize;
        self.packet.get(offset..offset + len)
    }
}

struct SmbConnection {
    stream: TcpStream,
    timeout: Duration,
}

impl SmbConnection {
    async fn send(&mut self, message: &[u8]) -> Result<()> {
        let len = message.len() as u32;
        let mut frame = Vec::with_capacity(message.len() + 4);
        frame.extend_from_slice(&len.to_be_bytes());
        frame[0] = 0; // NetBIOS session message
        frame.extend_from_slice(message);
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    async fn recv_frame(&mut self) -> Result<Vec<u8>> {
        let mut header = [0u8; 4];
        self.read_exact(&mut header).await?;
        let len = u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize;
        let mut packet = vec![0u8; len];
        self.read_exact(&mut packet).await?;
        Ok(packet)
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match timeout(self.timeout, self.stream.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(ScanError::Network(e)),
            Err(_) => Err(ScanError::Timeout {
                operation: "SMB read".to_string(),
            }),
        }
    }

    /// Next response, skipping interim STATUS_PENDING replies.
    async fn recv(&mut self) -> Result<Smb2Response> {
        loop {
            let response = Smb2Response::parse(self.recv_frame().await?)?;
            if response.status != STATUS_PENDING {
                return Ok(response);
            }
        }
    }
}

fn filetime_now() -> u64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (since_epoch.as_secs() + FILETIME_EPOCH_OFFSET) * 10_000_000 + u64::from(since_epoch.subsec_nanos() / 100)
}

/// `DOMAIN\user` or a bare user name.
fn split_domain(username: &str) -> (&str, &str) {
    match username.split_once('\\') {
        Some((domain, user)) => (domain, user),
        None => ("", username),
    }
}

// SMB Brute Forcer
pub struct SmbBruteForcer;

#[async_trait]
impl BruteForcer for SmbBruteForcer {
    async fn attempt_login(
        &self,
        target: IpAddr,
        port: u16,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<bool> {
        let addr = SocketAddr::new(target, port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ScanError::Timeout {
                operation: format!("connect to {}", addr),
            })??;
        let mut conn = SmbConnection { stream, timeout };

        conn.send(&negotiate_request()).await?;
        let negotiate = conn.recv().await?;
        if negotiate.status != STATUS_SUCCESS {
            return Err(ScanError::BruteForce(format!(
                "SMB2 negotiate failed with status {:#010x}",
                negotiate.status
            )));
        }

        conn.send(&session_setup_request(1, 0, &spnego_init(&negotiate_message())))
            .await?;
        let challenge_response = conn.recv().await?;
        if challenge_response.status != STATUS_MORE_PROCESSING_REQUIRED {
            return Err(ScanError::BruteForce(format!(
                "SMB2 session setup failed with status {:#010x}",
                challenge_response.status
            )));
        }
        let session_id = challenge_response.session_id;
        let challenge = challenge_response
            .security_blob()
            .and_then(parse_challenge)
            .ok_or_else(|| ScanError::BruteForce("No NTLM challenge in session setup".to_string()))?;

        let (domain, user) = split_domain(username);
        let timestamp = challenge.timestamp().unwrap_or_else(filetime_now);
        let client_challenge: [u8; 8] = rand::random();
        let authenticate = authenticate_message(&challenge, domain, user, password, &client_challenge, timestamp);

        conn.send(&session_setup_request(2, session_id, &spnego_response(&authenticate)))
            .await?;
        let result = conn.recv().await?;

        if result.status != STATUS_SUCCESS {
            debug!("SMB login {} rejected with {:#010x}", username, result.status);
            return Ok(false);
        }
        let flags = result.session_flags();
        let _ = conn.send(&logoff_request(3, session_id)).await;

        // Guest or anonymous fallback is not a valid credential
        Ok(flags & (SESSION_FLAG_IS_GUEST | SESSION_FLAG_IS_NULL) == 0)
    }

    fn service_name(&self) -> &'static str {
        "smb"
    }

    fn default_port(&self) -> u16 {
        445
    }
}
