use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub scan: ScanConfig,
    pub discovery: DiscoveryConfig,
    pub web_scan: WebScanConfig,
    pub js_finder: JsFinderConfig,
    pub brute_force: BruteForceConfig,
    pub storage: StorageConfig,
    pub wordlists: WordlistConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    pub threads: usize,
    pub timeout: u64, // milliseconds, per TCP connect
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub enable_icmp: bool,
    pub skip_alive_check: bool,
    pub ping_timeout: u64, // milliseconds
    pub ping_progress_interval: usize,
    pub port_progress_interval: usize,
    pub enable_udp: bool,
    pub udp_timeout: u64, // milliseconds
    pub udp_ports: Vec<u16>,
    pub common_ports: Vec<u16>,
    pub grab_banners: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebScanConfig {
    pub threads: usize,
    pub request_timeout: u64, // milliseconds
    pub follow_redirects: bool,
    pub max_redirects: usize,
    pub exclude_404: bool,
    pub recursion_depth: usize,
    pub extensions: Vec<String>,
    pub default_wordlist: String,
    pub max_body_size: usize, // bytes
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsFinderConfig {
    pub concurrency: usize,
    pub request_timeout: u64, // milliseconds
    pub deep_scan: bool,
    pub active_scan: bool,
    pub danger_filter: bool,
    pub max_body_size: usize, // bytes
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BruteForceConfig {
    pub threads: usize,
    pub connection_timeout: u64, // milliseconds
    pub protocols: Vec<String>,
    pub user_dict: String,
    pub pass_dict: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub busy_timeout: u64, // milliseconds
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordlistConfig {
    pub dict_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scan: ScanConfig {
                threads: 100,
                timeout: 2000,
                user_agent: DEFAULT_USER_AGENT.to_string(),
            },
            discovery: DiscoveryConfig {
                enable_icmp: true,
                skip_alive_check: false,
                ping_timeout: 1000,
                ping_progress_interval: 10,
                port_progress_interval: 50,
                enable_udp: false,
                udp_timeout: 2000,
                udp_ports: vec![53, 123, 161],
                common_ports: vec![
                    21, 22, 23, 25, 53, 80, 110, 111, 135, 139, 143, 443, 445, 993, 995, 1433, 1521,
                    3306, 3389, 5432, 5900, 6379, 8080, 8443, 27017,
                ],
                grab_banners: false,
            },
            web_scan: WebScanConfig {
                threads: 10,
                request_timeout: 5000,
                follow_redirects: false,
                max_redirects: 5,
                exclude_404: true,
                recursion_depth: 0,
                extensions: vec![
                    "php".to_string(),
                    "asp".to_string(),
                    "aspx".to_string(),
                    "jsp".to_string(),
                    "html".to_string(),
                    "js".to_string(),
                ],
                default_wordlist: "dicc.txt".to_string(),
                max_body_size: 1024 * 1024,
            },
            js_finder: JsFinderConfig {
                concurrency: 10,
                request_timeout: 10_000,
                deep_scan: false,
                active_scan: false,
                danger_filter: true,
                max_body_size: 5 * 1024 * 1024,
            },
            brute_force: BruteForceConfig {
                threads: 10,
                connection_timeout: 3000,
                protocols: Vec::new(),
                user_dict: "user.txt".to_string(),
                pass_dict: "pass.txt".to_string(),
            },
            storage: StorageConfig {
                database_path: PathBuf::from("data/rscout.db"),
                busy_timeout: 5000,
                queue_capacity: 5000,
            },
            wordlists: WordlistConfig {
                dict_dir: PathBuf::from("dict"),
            },
        }
    }
}

impl Config {
    pub fn load_from_file(path: &str) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn save_to_file(&self, path: &str) -> crate::Result<()> {
        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.scan.timeout)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery.ping_timeout)
    }

    pub fn udp_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery.udp_timeout)
    }

    pub fn web_request_timeout(&self) -> Duration {
        Duration::from_millis(self.web_scan.request_timeout)
    }

    pub fn js_request_timeout(&self) -> Duration {
        Duration::from_millis(self.js_finder.request_timeout)
    }

    pub fn brute_force_timeout(&self) -> Duration {
        Duration::from_millis(self.brute_force.connection_timeout)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.storage.busy_timeout)
    }
}
