//! Rscout - concurrent internal network reconnaissance engine
//!
//! Resolves targets into host sets, probes liveness and open ports, crawls
//! web services for hidden paths and leaked secrets, and tests discovered
//! services against credential dictionaries. Every finding is funnelled
//! through a single-writer queue into an embedded SQLite store.
//!
//! # Warning
//! This tool is designed for ethical penetration testing and security assessment
//! purposes only. Users are responsible for ensuring they have proper authorization
//! before scanning any networks or systems.

pub mod brute_force;
pub mod cli;
pub mod config;
pub mod control;
pub mod dir_scan;
pub mod discovery;
pub mod display;
pub mod error;
pub mod js_finder;
pub mod persistence;
pub mod secrets;
pub mod targets;
pub mod utils;
pub mod web_scan;

pub use error::{Result, ScanError};

/// Common types shared by the engines and the store
pub mod types {
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use std::net::IpAddr;

    #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
    #[serde(rename_all = "lowercase")]
    pub enum Protocol {
        Tcp,
        Udp,
    }

    impl Protocol {
        pub fn as_str(&self) -> &'static str {
            match self {
                Protocol::Tcp => "tcp",
                Protocol::Udp => "udp",
            }
        }
    }

    impl fmt::Display for Protocol {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
    #[serde(rename_all = "lowercase")]
    pub enum PortState {
        Open,
        Closed,
    }

    impl PortState {
        pub fn as_str(&self) -> &'static str {
            match self {
                PortState::Open => "open",
                PortState::Closed => "closed",
            }
        }
    }

    /// An open port observed by the scanner.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    pub struct OpenPort {
        pub ip: IpAddr,
        pub port: u16,
        pub protocol: Protocol,
        pub service: String,
        pub banner: Option<String>,
    }

    impl OpenPort {
        pub fn is_web(&self) -> bool {
            matches!(self.service.as_str(), "http" | "https")
        }

        /// Base URL synthesized for HTTP(S) services.
        pub fn base_url(&self) -> Option<String> {
            if self.is_web() {
                Some(format!("{}://{}:{}", self.service, self.ip, self.port))
            } else {
                None
            }
        }
    }

    /// Mutable attributes of a Port row.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    pub struct PortRecord {
        pub port: u16,
        pub protocol: Protocol,
        pub service: String,
        pub product: String,
        pub version: String,
        pub banner: String,
        pub state: PortState,
    }

    impl PortRecord {
        pub fn open(port: u16, protocol: Protocol, service: &str) -> Self {
            Self {
                port,
                protocol,
                service: service.to_string(),
                product: String::new(),
                version: String::new(),
                banner: String::new(),
                state: PortState::Open,
            }
        }

        pub fn with_banner(mut self, banner: Option<&str>) -> Self {
            self.banner = banner.unwrap_or_default().to_string();
            self
        }
    }

    /// A secret, PII hit or verified endpoint found in web content.
    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
    pub struct SensitiveFinding {
        pub source: String,
        pub kind: String,
        pub value: String,
    }

    impl fmt::Display for SensitiveFinding {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "[{}] {}: {}", self.source, self.kind, self.value)
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
    pub struct Credential {
        pub target: IpAddr,
        pub port: u16,
        pub service: String,
        pub username: String,
        pub password: String,
    }
}
