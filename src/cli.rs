use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rscout")]
#[command(about = "Concurrent internal network reconnaissance engine")]
#[command(long_about = r#"
Rscout resolves targets into host sets, probes liveness and open ports,
crawls web services for hidden paths and leaked secrets, and tests the
services it finds against credential dictionaries. Everything it finds is
written to a local SQLite database.

WARNING: This tool should only be used on networks and systems you own or
have explicit permission to test. Unauthorized scanning may be illegal.

Examples:
  rscout scan 192.168.1.0/24                      # ICMP + common ports
  rscout scan 10.0.0.1-10.0.0.20 -p 1-1024 --udp  # range, TCP and UDP
  rscout dir-scan http://10.0.0.5:8080 --depth 2
  rscout js-find https://intranet.local --deep --active
  rscout brute 10.0.0.5:22:ssh 10.0.0.6:3306
  rscout full 192.168.1.0/24
"#)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Verbose output (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (suppress output)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Stream events as JSON lines instead of colored text
    #[arg(long, global = true)]
    pub json: bool,

    /// Worker count for the selected engine
    #[arg(short, long, global = true)]
    pub threads: Option<usize>,

    /// Per-operation timeout in milliseconds
    #[arg(long, global = true, value_name = "MS")]
    pub timeout: Option<u64>,

    /// SQLite database path
    #[arg(long, global = true, value_name = "FILE", env = "RSCOUT_DB")]
    pub database: Option<PathBuf>,

    /// Dictionary directory
    #[arg(long, global = true, value_name = "DIR")]
    pub dict_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Host discovery and port scanning
    Scan(ScanArgs),

    /// Recursive directory brute force against a web root
    DirScan {
        /// Base URL (http:// is assumed when no scheme is given)
        target: String,

        /// Wordlist file, the configured default when omitted
        #[arg(short, long)]
        wordlist: Option<String>,

        /// Extensions substituted for %EXT%
        #[arg(short, long, value_delimiter = ',')]
        extensions: Option<Vec<String>>,

        /// Levels to recurse below the base URL
        #[arg(long)]
        depth: Option<usize>,

        /// Follow redirects instead of reporting them
        #[arg(long)]
        follow_redirects: bool,

        /// Report 404 responses too
        #[arg(long)]
        include_404: bool,
    },

    /// Extract endpoints, scripts and secrets from a page and its scripts
    JsFind {
        /// Page URL
        target: String,

        /// Also follow scripts referenced by scripts
        #[arg(long)]
        deep: bool,

        /// Probe discovered endpoints afterwards
        #[arg(long)]
        active: bool,

        /// Probe destructive-looking endpoints too
        #[arg(long)]
        no_danger_filter: bool,
    },

    /// Credential brute force against explicit services
    Brute {
        /// Targets as ip:port[:service]
        #[arg(required = true)]
        targets: Vec<String>,

        #[command(flatten)]
        dicts: DictArgs,

        /// Only attack these services
        #[arg(long, value_delimiter = ',')]
        protocols: Option<Vec<String>>,
    },

    /// Scan, then crawl every web service and brute-force every other service
    Full {
        #[command(flatten)]
        scan: ScanArgs,

        #[command(flatten)]
        dicts: DictArgs,

        /// Skip the credential stage
        #[arg(long)]
        no_brute: bool,
    },

    /// Write default user, password and path dictionaries
    InitDicts,

    /// Write the default configuration as TOML
    InitConfig {
        /// Output path
        #[arg(short, long, default_value = "rscout.toml")]
        output: PathBuf,
    },
}

#[derive(Args, Clone)]
pub struct ScanArgs {
    /// IP, CIDR, IPv4 range or host name; comma separated
    pub target: String,

    /// Ports: "common", "all", or a list such as 22,80,8000-8100
    #[arg(short, long, default_value = "common")]
    pub ports: String,

    /// Treat every target as alive
    #[arg(long)]
    pub no_ping: bool,

    /// Also probe UDP services
    #[arg(long)]
    pub udp: bool,

    /// Grab a banner from every open TCP port
    #[arg(long)]
    pub banners: bool,
}

#[derive(Args, Clone)]
pub struct DictArgs {
    /// Username dictionary
    #[arg(long)]
    pub users: Option<String>,

    /// Password dictionary
    #[arg(long)]
    pub passwords: Option<String>,
}
