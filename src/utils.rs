use crate::{Result, ScanError};
use log::info;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Network utilities
pub mod network {
    use std::net::Ipv4Addr;

    /// Check if an IPv4 address is private, loopback, link-local or otherwise
    /// not routable on the public internet
    pub fn is_internal_ipv4(ip: &Ipv4Addr) -> bool {
        ip.is_private()
            || ip.is_loopback()
            || ip.is_link_local()
            || ip.is_broadcast()
            || ip.is_unspecified()
            || ip.octets()[0] == 0
    }

    /// Number of host addresses a CIDR block expands to
    pub fn cidr_host_count(prefix_len: u8) -> u64 {
        let total = 1u64 << (32 - u32::from(prefix_len.min(32)));
        if total > 2 {
            total - 2
        } else {
            total
        }
    }
}

/// Dictionary files
pub mod wordlist {
    use super::*;

    /// Resolves dictionary names against a base directory and loads them as
    /// trimmed, comment-stripped entry lists.
    #[derive(Debug, Clone)]
    pub struct DictionaryProvider {
        dict_dir: PathBuf,
    }

    impl DictionaryProvider {
        pub fn new(dict_dir: impl Into<PathBuf>) -> Self {
            Self {
                dict_dir: dict_dir.into(),
            }
        }

        pub fn dict_dir(&self) -> &Path {
            &self.dict_dir
        }

        pub fn resolve(&self, name: &str) -> PathBuf {
            let path = Path::new(name);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                self.dict_dir.join(path)
            }
        }

        pub async fn load(&self, name: &str) -> Result<Vec<String>> {
            load_wordlist(&self.resolve(name)).await
        }
    }

    /// Load a wordlist from file
    pub async fn load_wordlist(path: &Path) -> Result<Vec<String>> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| ScanError::Dictionary {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        let words = parse_wordlist(&content);
        info!("Loaded {} words from {}", words.len(), path.display());
        Ok(words)
    }

    pub fn parse_wordlist(content: &str) -> Vec<String> {
        content
            .lines()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(String::from)
            .collect()
    }

    /// Generate common username list
    pub fn generate_common_usernames() -> Vec<String> {
        [
            "admin", "administrator", "root", "user", "guest", "test", "sa", "postgres", "mysql",
            "oracle", "ftp", "www", "web", "backup", "operator",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    /// Generate common password list
    pub fn generate_common_passwords() -> Vec<String> {
        [
            "123456", "password", "admin", "root", "12345678", "admin123", "123456789", "qwerty",
            "abc123", "password123", "root123", "test", "guest", "changeme", "P@ssw0rd", "Admin@123",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    /// Generate common web path list, `%EXT%` expands per extension
    pub fn generate_common_paths() -> Vec<String> {
        [
            "admin/", "login", "login.%EXT%", "index.%EXT%", "backup/", "config.%EXT%", "api/",
            "upload/", "uploads/", "robots.txt", ".git/HEAD", ".env", "phpinfo.php", "manager/html",
            "console/", "swagger-ui.html", "actuator/env", "wp-admin/", "server-status", "test.%EXT%",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    /// Create default dictionary files
    pub async fn create_default_wordlists(base_dir: &Path, user_dict: &str, pass_dict: &str, path_dict: &str) -> Result<()> {
        fs::create_dir_all(base_dir).await?;
        fs::write(base_dir.join(user_dict), generate_common_usernames().join("\n")).await?;
        fs::write(base_dir.join(pass_dict), generate_common_passwords().join("\n")).await?;
        fs::write(base_dir.join(path_dict), generate_common_paths().join("\n")).await?;

        info!("Created default wordlists in {}", base_dir.display());
        Ok(())
    }
}

/// Text helpers
pub mod text {
    /// Cut to `max_chars` characters, appending `...` when anything was cut
    pub fn truncate_with_ellipsis(value: &str, max_chars: usize) -> String {
        match value.char_indices().nth(max_chars) {
            Some((idx, _)) => format!("{}...", &value[..idx]),
            None => value.to_string(),
        }
    }

    /// Order-preserving dedup
    pub fn dedup_preserving_order<T: Clone + Eq + std::hash::Hash>(items: &[T]) -> Vec<T> {
        let mut seen = std::collections::HashSet::new();
        items
            .iter()
            .filter(|item| seen.insert((*item).clone()))
            .cloned()
            .collect()
    }
}

/// Time utilities
pub mod time {
    use std::time::Duration;

    /// Format duration as human readable string
    pub fn format_duration(duration: Duration) -> String {
        let secs = duration.as_secs();
        let hours = secs / 3600;
        let minutes = (secs % 3600) / 60;
        let seconds = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, seconds)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else {
            format!("{}.{:01}s", seconds, duration.subsec_millis() / 100)
        }
    }

    pub fn timestamp() -> String {
        chrono::Utc::now().to_rfc3339()
    }
}
