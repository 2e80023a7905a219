use crate::brute_force::BruteForceReport;
use crate::control::{ScanEvent, Stage};
use crate::dir_scan::DirScanReport;
use crate::discovery::ScanSummary;
use crate::js_finder::JsFindResult;
use crate::types::OpenPort;
use crate::utils::text::truncate_with_ellipsis;
use colored::*;
use indicatif::{MultiProgress, ProgressBar};
use log::warn;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const MAX_LISTED_HOSTS: usize = 10;
const MAX_LISTED_PORTS: usize = 8;

/// Colored terminal output for results, logs and summaries
#[derive(Debug, Clone, Copy)]
pub struct DisplayManager {
    use_colors: bool,
    quiet_mode: bool,
    json_events: bool,
}

impl DisplayManager {
    pub fn new() -> Self {
        Self::with_quiet(false)
    }

    pub fn with_quiet(quiet: bool) -> Self {
        let use_colors =
            std::env::var("NO_COLOR").is_err() && std::env::var("TERM").map_or(true, |term| term != "dumb");
        if !use_colors {
            colored::control::set_override(false);
        }

        Self {
            use_colors,
            quiet_mode: quiet,
            json_events: false,
        }
    }

    pub fn with_json_events(mut self, json: bool) -> Self {
        self.json_events = json;
        self
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet_mode
    }

    pub fn json_events(&self) -> bool {
        self.json_events
    }

    /// One printable line per event. Progress is drawn by bars, not lines.
    pub fn format_event(&self, event: &ScanEvent) -> Option<String> {
        let line = match event {
            ScanEvent::Log { channel, message, time } => {
                format!("  {} {} {}", time.bright_black(), format!("[{}]", channel).blue(), message)
            }
            ScanEvent::HostAlive { ip } => {
                format!("  {} {} is alive", "→".bright_green(), ip.to_string().cyan())
            }
            ScanEvent::PortOpen(open) => format!(
                "  {} {}:{} {}{}",
                "•".bright_green().bold(),
                open.ip.to_string().cyan(),
                open.port.to_string().yellow(),
                format!("{}/{}", open.protocol, open.service).bright_black(),
                open.banner
                    .as_deref()
                    .map(|b| format!(" {}", truncate_with_ellipsis(b, 60)))
                    .unwrap_or_default()
            ),
            ScanEvent::DirScanResult(hit) => {
                let status = hit.status.to_string();
                let status = match hit.status {
                    200..=299 => status.bright_green(),
                    300..=399 => status.cyan(),
                    401 | 403 => status.yellow(),
                    _ => status.bright_black(),
                };
                let mut line = format!("  [{}] {} {}", status.bold(), hit.url, format!("{}B", hit.size).bright_black());
                if !hit.location.is_empty() {
                    line.push_str(&format!(" → {}", hit.location));
                }
                if !hit.title.is_empty() {
                    line.push_str(&format!(" {}", format!("\"{}\"", hit.title).white()));
                }
                line
            }
            ScanEvent::Finding(finding) => format!(
                "  {} {} {} {}",
                "!".bright_yellow().bold(),
                format!("[{}]", finding.source).bright_black(),
                format!("{}:", finding.kind).yellow().bold(),
                finding.value
            ),
            ScanEvent::CredentialFound(credential) => format!(
                "  {} {}:{} {} {}/{}",
                "✓".bright_green().bold(),
                credential.target.to_string().cyan(),
                credential.port,
                format!("({})", credential.service).bright_black(),
                credential.username.bright_white().bold(),
                credential.password.bright_white().bold()
            ),
            ScanEvent::Complete { channel } => format!("  {} {} finished", "✓".bright_green(), channel),
            ScanEvent::Progress { .. } => return None,
        };
        Some(line)
    }

    pub fn print_section_header(&self, title: &str) {
        if self.quiet_mode {
            return;
        }

        if self.use_colors {
            println!("{}", title.bright_cyan().bold());
            println!("{}", "─".repeat(title.chars().count()).bright_cyan());
        } else {
            println!("{}", title);
            println!("{}", "=".repeat(title.len()));
        }
    }

    pub fn print_success(&self, message: &str) {
        if self.quiet_mode {
            return;
        }
        println!("  {} {}", "✓".bright_green().bold(), message.green());
    }

    pub fn print_warning(&self, message: &str) {
        if self.quiet_mode {
            return;
        }
        println!("  {} {}", "!".bright_yellow().bold(), message.yellow());
    }

    pub fn print_error(&self, message: &str) {
        eprintln!("  {} {}", "✗".bright_red().bold(), message.red().bold());
    }

    pub fn print_info(&self, message: &str) {
        if self.quiet_mode {
            return;
        }
        println!("  {} {}", "i".bright_blue().bold(), message.blue());
    }

    pub fn print_banner(&self, title: &str, subtitle: Option<&str>) {
        if self.quiet_mode {
            return;
        }

        let width = title.chars().count();
        println!();
        println!("  {}", format!("┌─{}─┐", "─".repeat(width + 2)).bright_cyan());
        println!("  {} {} {}", "│".bright_cyan(), title.bright_white().bold(), "  │".bright_cyan());
        if let Some(sub) = subtitle {
            println!(
                "  {} {} {}",
                "│".bright_cyan(),
                format!("{:^width$}", sub, width = width).bright_black(),
                "  │".bright_cyan()
            );
        }
        println!("  {}", format!("└─{}─┘", "─".repeat(width + 2)).bright_cyan());
        println!();
    }

    pub fn print_scan_summary(&self, summary: &ScanSummary) {
        if self.quiet_mode {
            return;
        }

        self.print_section_header("SCAN SUMMARY");
        println!(
            "  {}: {}   {}: {}   {}: {}",
            "Targets".bright_white().bold(),
            summary.targets.len().to_string().cyan(),
            "Alive".bright_white().bold(),
            summary.alive.len().to_string().cyan(),
            "Open ports".bright_white().bold(),
            summary.open_ports.len().to_string().yellow().bold()
        );

        for (i, host) in summary.alive.iter().enumerate() {
            if i == MAX_LISTED_HOSTS {
                println!("    {} {} more hosts", "...".bright_black(), summary.alive.len() - MAX_LISTED_HOSTS);
                break;
            }
            println!("    {} {}", "→".bright_green(), host.to_string().cyan());
        }

        let mut by_host: BTreeMap<IpAddr, Vec<&OpenPort>> = BTreeMap::new();
        for open in &summary.open_ports {
            by_host.entry(open.ip).or_default().push(open);
        }
        for (ip, ports) in by_host {
            println!(
                "  {} {} → {} ports",
                "•".bright_green().bold(),
                ip.to_string().cyan().bold(),
                ports.len().to_string().yellow().bold()
            );
            for open in ports.iter().take(MAX_LISTED_PORTS) {
                println!(
                    "    {} {}/{} {}",
                    "→".bright_green(),
                    open.port.to_string().yellow(),
                    open.protocol,
                    format!("({})", open.service).bright_black()
                );
            }
            if ports.len() > MAX_LISTED_PORTS {
                println!("    {} {} more ports", "...".bright_black(), ports.len() - MAX_LISTED_PORTS);
            }
        }
        self.print_cancelled(summary.cancelled);
        println!();
    }

    pub fn print_dir_report(&self, report: &DirScanReport) {
        if self.quiet_mode {
            return;
        }

        self.print_section_header(&format!("DIRECTORY SCAN {}", report.target));
        println!(
            "  {} hits from {} requests over {} level(s)",
            report.results.len().to_string().yellow().bold(),
            report.requests,
            report.levels_scanned
        );
        let mut by_status: BTreeMap<u16, usize> = BTreeMap::new();
        for hit in &report.results {
            *by_status.entry(hit.status).or_default() += 1;
        }
        for (status, count) in by_status {
            println!("    {} {:>3} × {}", "→".bright_green(), status.to_string().cyan(), count);
        }
        self.print_cancelled(report.cancelled);
        println!();
    }

    pub fn print_js_result(&self, result: &JsFindResult) {
        if self.quiet_mode {
            return;
        }

        self.print_section_header(&format!("JS FINDER {}", result.url));
        if let Some(error) = &result.error {
            self.print_error(error);
            return;
        }
        println!(
            "  {}: {}   {}: {}   {}: {}",
            "Scripts".bright_white().bold(),
            result.js_files.len().to_string().cyan(),
            "Endpoints".bright_white().bold(),
            result.endpoints.len().to_string().cyan(),
            "Findings".bright_white().bold(),
            result.findings.len().to_string().yellow().bold()
        );
        let mut by_kind: BTreeMap<&str, usize> = BTreeMap::new();
        for finding in &result.findings {
            *by_kind.entry(finding.kind.as_str()).or_default() += 1;
        }
        for (kind, count) in by_kind {
            println!("    {} {} × {}", "→".bright_green(), kind.yellow(), count);
        }
        println!();
    }

    pub fn print_brute_report(&self, report: &BruteForceReport) {
        if self.quiet_mode {
            return;
        }

        self.print_section_header("BRUTE FORCE SUMMARY");
        println!(
            "  {}: {}   {}: {}",
            "Attempts".bright_white().bold(),
            report.attempts.to_string().cyan(),
            "Cracked".bright_white().bold(),
            report.credentials.len().to_string().bright_green().bold()
        );
        for credential in &report.credentials {
            println!(
                "    {} {}:{} ({}) {}/{}",
                "✓".bright_green(),
                credential.target,
                credential.port,
                credential.service,
                credential.username,
                credential.password
            );
        }
        for target in &report.skipped {
            println!("    {} {} {}", "-".bright_black(), target, "unsupported".bright_black());
        }
        self.print_cancelled(report.cancelled);
        println!();
    }

    fn print_cancelled(&self, cancelled: bool) {
        if cancelled {
            self.print_warning("Stopped before completion, results are partial");
        }
    }
}

impl Default for DisplayManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress bar helpers
pub mod progress {
    use super::*;
    use indicatif::ProgressStyle;
    use std::time::Duration;

    /// Percent bar for one stage
    pub fn create_stage_bar(stage: Stage) -> ProgressBar {
        let pb = ProgressBar::new(100);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("  {spinner:.cyan} [{bar:25.green/bright_black}] {pos:>3}% {msg}")
        {
            pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏ "));
        }
        pb.set_message(stage.to_string());
        pb.enable_steady_tick(Duration::from_millis(120));
        pb
    }
}

/// Drains an event subscription onto the terminal until every sender is
/// gone. Each stage gets its own bar; every other event becomes a line
/// printed above the bars.
pub fn spawn_event_printer(display: DisplayManager, mut events: mpsc::UnboundedReceiver<ScanEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let multi = MultiProgress::new();
        let mut bars: HashMap<Stage, ProgressBar> = HashMap::new();

        while let Some(event) = events.recv().await {
            if display.is_quiet() {
                continue;
            }
            if display.json_events() {
                match event.to_json() {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("Failed to encode event: {}", e),
                }
                continue;
            }
            match &event {
                ScanEvent::Progress { stage, percent, .. } => {
                    let bar = bars
                        .entry(*stage)
                        .or_insert_with(|| multi.add(progress::create_stage_bar(*stage)));
                    bar.set_position(percent.round() as u64);
                    if *percent >= 100.0 {
                        bar.finish();
                    }
                }
                ScanEvent::Complete { .. } => {
                    for (_, bar) in bars.drain() {
                        bar.finish_and_clear();
                    }
                    if let Some(line) = display.format_event(&event) {
                        println!("{}", line);
                    }
                }
                _ => {
                    if let Some(line) = display.format_event(&event) {
                        if bars.is_empty() || multi.println(&line).is_err() {
                            println!("{}", line);
                        }
                    }
                }
            }
        }

        for (_, bar) in bars.drain() {
            bar.finish_and_clear();
        }
    })
}
