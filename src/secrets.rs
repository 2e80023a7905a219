//! Content analyzer for fetched pages and scripts.
//!
//! Extracts quoted paths (split into script files and API endpoints),
//! matches the secret rule table and a few PII heuristics.

use crate::types::SensitiveFinding;
use crate::utils::network::is_internal_ipv4;
use crate::utils::text::truncate_with_ellipsis;
use lazy_static::lazy_static;
use regex::Regex;
use std::net::Ipv4Addr;

/// Longest matched value kept before truncation.
pub const MAX_VALUE_CHARS: usize = 100;

const STATIC_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".svg", ".css", ".ico", ".woff", ".woff2", ".ttf",
];

const IMAGE_SUFFIXES: &[&str] = &[".png", ".jpg", ".jpeg", ".gif", ".svg", ".webp"];

pub struct SecretRule {
    pub name: &'static str,
    regex: Regex,
}

impl SecretRule {
    fn new(name: &'static str, pattern: &str) -> Self {
        Self {
            name,
            regex: Regex::new(pattern).unwrap(),
        }
    }

    /// Matched values, taken from the first capture group when the rule has one.
    pub fn find_all(&self, content: &str) -> Vec<String> {
        if self.regex.captures_len() > 1 {
            self.regex
                .captures_iter(content)
                .filter_map(|caps| caps.get(1))
                .map(|m| truncate_with_ellipsis(m.as_str(), MAX_VALUE_CHARS))
                .collect()
        } else {
            self.regex
                .find_iter(content)
                .map(|m| truncate_with_ellipsis(m.as_str(), MAX_VALUE_CHARS))
                .collect()
        }
    }
}

lazy_static! {
    static ref SECRET_RULES: Vec<SecretRule> = vec![
        // Cloud providers
        SecretRule::new("Aliyun AccessKey", r"\bLTAI[a-zA-Z0-9]{20}\b"),
        SecretRule::new("Aliyun Secret", r#"(?i)(?:aliyun|access_key|access_token).{0,20}['"]([0-9a-zA-Z]{30})['"]"#),
        SecretRule::new("AWS AccessKey", r"\b((?:AKIA|ABIA|ACCA|ASIA)[0-9A-Z]{16})\b"),
        SecretRule::new("AWS Secret", r#"(?i)aws.{0,20}['"]([0-9a-zA-Z/+]{40})['"]"#),
        SecretRule::new("Google API Key", r"\bAIza[0-9A-Za-z\-_]{35}\b"),
        SecretRule::new("Google OAuth", r"[0-9]+-[0-9A-Za-z_]{32}\.apps\.googleusercontent\.com"),
        SecretRule::new("Tencent SecretId", r"\bAKID[a-zA-Z0-9]{32}\b"),
        SecretRule::new("Tencent SecretKey", r#"\b(?i)SecretKey\s*[:=]\s*['"]([A-Za-z0-9]{32})['"]"#),
        SecretRule::new("Azure SharedKey", r"[a-z0-9]+\.blob\.core\.windows\.net"),
        SecretRule::new("Heroku API Key", r"(?i)heroku.{0,20}[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}"),
        // SaaS and tooling
        SecretRule::new("Slack Token", r"xox[baprs]-[a-zA-Z0-9]{10,48}"),
        SecretRule::new("Slack Webhook", r"https://hooks\.slack\.com/services/T[0-9A-Z]{9}/B[0-9A-Z]{9}/[a-zA-Z0-9]{24}"),
        SecretRule::new("GitHub Token", r"(gh[pousr]_[a-zA-Z0-9]{36,255})"),
        SecretRule::new("Stripe Key", r"(?:r|s)k_(?:live|test)_[0-9a-zA-Z]{24}"),
        SecretRule::new("PayPal Token", r"access_token\$production\$[0-9a-z]{16}\$[0-9a-f]{32}"),
        SecretRule::new("Twilio SID", r"\bAC[a-z0-9]{32}\b"),
        SecretRule::new("Mailgun API Key", r"key-[0-9a-zA-Z]{32}"),
        SecretRule::new("Telegram Bot Token", r"[0-9]+:AA[0-9A-Za-z\-_]{33}"),
        SecretRule::new("Facebook Access Token", r"EAACEdEose0cBA[0-9A-Za-z]+"),
        SecretRule::new("Square Access Token", r"sq0atp-[0-9A-Za-z\-_]{22}"),
        SecretRule::new("Square OAuth Secret", r"sq0csp-[0-9A-Za-z\-_]{43}"),
        // Key material
        SecretRule::new("Private Key", r"-----BEGIN (?:(?:EC|PGP|DSA|RSA|OPENSSH) )?PRIVATE KEY(?: BLOCK)?-----"),
        // Generic
        SecretRule::new("Generic API Key", r#"(?i)(?:api_?key|access_?token|secret|password|auth|auth_token)\s*[:=]\s*['"]([a-zA-Z0-9_\-]{16,64})['"]"#),
        SecretRule::new("Bearer Token", r"(?i)Bearer\s+[a-zA-Z0-9\-\._~\+/]+=*"),
        SecretRule::new("URI Credentials", r"(?i)[a-z]+://[^/\s]+:[^/\s]+@[^/\s]+"),
        SecretRule::new("JWT", r"eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]*"),
        SecretRule::new("Basic Auth", r"(?i)Basic\s+[a-zA-Z0-9+/]+={0,2}"),
    ];

    static ref PATH_RE: Regex =
        Regex::new(r#"["']((?:(?:/|\.\./)[a-zA-Z0-9_./-]+)|(?:https?://[a-zA-Z0-9_./-]+))["']"#).unwrap();
    static ref IPV4_RE: Regex = Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap();
    static ref PHONE_RE: Regex = Regex::new(r"\b1[3-9]\d{9}\b").unwrap();
    static ref EMAIL_RE: Regex = Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").unwrap();
}

pub fn secret_rules() -> &'static [SecretRule] {
    &SECRET_RULES
}

/// Everything extracted from one document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentAnalysis {
    pub endpoints: Vec<String>,
    pub js_files: Vec<String>,
    pub findings: Vec<SensitiveFinding>,
}

/// Analyze `content`, tagging every finding with `source`.
pub fn analyze_content(content: &str, source: &str) -> ContentAnalysis {
    let mut analysis = ContentAnalysis::default();

    for caps in PATH_RE.captures_iter(content) {
        let Some(raw) = caps.get(1).map(|m| m.as_str()) else {
            continue;
        };
        if !is_valid_endpoint(raw) {
            continue;
        }
        if raw.ends_with(".js") {
            analysis.js_files.push(raw.to_string());
        } else {
            analysis.endpoints.push(raw.to_string());
        }
    }

    let mut finding = |kind: &str, value: String| {
        analysis.findings.push(SensitiveFinding {
            source: source.to_string(),
            kind: kind.to_string(),
            value,
        });
    };

    for rule in secret_rules() {
        for value in rule.find_all(content) {
            finding(rule.name, value);
        }
    }

    for ip in IPV4_RE.find_iter(content) {
        if let Ok(addr) = ip.as_str().parse::<Ipv4Addr>() {
            if !is_internal_ipv4(&addr) {
                finding("IP", ip.as_str().to_string());
            }
        }
    }

    for phone in PHONE_RE.find_iter(content) {
        finding("Phone", phone.as_str().to_string());
    }

    for email in EMAIL_RE.find_iter(content) {
        let lower = email.as_str().to_ascii_lowercase();
        if !IMAGE_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix)) {
            finding("Email", email.as_str().to_string());
        }
    }

    analysis
}

/// Reject static assets, tokens that are too short or too long, and bare
/// words with no path separator.
pub fn is_valid_endpoint(candidate: &str) -> bool {
    let lower = candidate.to_ascii_lowercase();
    if STATIC_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
        return false;
    }
    if candidate.len() < 2 || candidate.len() > 200 {
        return false;
    }
    candidate.contains('/') || candidate.ends_with(".js")
}

/// Endpoints that look destructive or session-ending.
pub fn is_dangerous_endpoint(endpoint: &str) -> bool {
    let lower = endpoint.to_ascii_lowercase();
    ["del", "remove", "logout", "exit"]
        .iter()
        .any(|word| lower.contains(word))
}
