//! Recursive directory brute force against one web root.

use crate::config::Config;
use crate::control::{ScanEvent, ScanSession, Stage};
use crate::discovery::acquire_slot;
use crate::persistence::PersistenceQueue;
use crate::utils::text::dedup_preserving_order;
use crate::utils::wordlist::DictionaryProvider;
use crate::web_scan::{build_client, extract_title, normalize_target, read_capped, resolve_web_service, ClientOptions};
use crate::Result;
use log::{debug, info};
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use url::Url;

#[derive(Debug, Clone)]
pub struct DirScanRequest {
    pub target: String,
    pub extensions: Vec<String>,
    pub threads: usize,
    pub timeout: Duration,
    pub exclude_404: bool,
    pub follow_redirects: bool,
    pub max_redirects: usize,
    /// Dictionary name or path; the configured default when `None`.
    pub wordlist: Option<String>,
    pub recursion_depth: usize,
    pub max_body_size: usize,
    pub user_agent: String,
}

impl DirScanRequest {
    pub fn from_config(config: &Config, target: &str) -> Self {
        Self {
            target: target.to_string(),
            extensions: config.web_scan.extensions.clone(),
            threads: config.web_scan.threads,
            timeout: config.web_request_timeout(),
            exclude_404: config.web_scan.exclude_404,
            follow_redirects: config.web_scan.follow_redirects,
            max_redirects: config.web_scan.max_redirects,
            wordlist: None,
            recursion_depth: config.web_scan.recursion_depth,
            max_body_size: config.web_scan.max_body_size,
            user_agent: config.scan.user_agent.clone(),
        }
    }
}

/// One probed path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirScanResult {
    pub url: String,
    pub status: u16,
    pub size: usize,
    pub location: String,
    pub fingerprint: String,
    pub title: String,
    pub content_type: String,
    pub depth: usize,
}

#[derive(Debug, Clone, Default)]
pub struct DirScanReport {
    pub target: String,
    pub results: Vec<DirScanResult>,
    pub levels_scanned: usize,
    pub requests: usize,
    pub cancelled: bool,
}

/// Recursive directory brute-forcer. Each BFS level runs the whole wordlist
/// against every base URL seeded by the level before it.
pub struct DirectoryScanner {
    persistence: PersistenceQueue,
    dictionaries: DictionaryProvider,
    default_wordlist: String,
}

impl DirectoryScanner {
    pub fn new(config: &Config, persistence: PersistenceQueue) -> Self {
        Self {
            persistence,
            dictionaries: DictionaryProvider::new(config.wordlists.dict_dir.clone()),
            default_wordlist: config.web_scan.default_wordlist.clone(),
        }
    }

    pub async fn run(&self, session: &ScanSession, request: &DirScanRequest) -> Result<DirScanReport> {
        let result = self.crawl(session, request).await;
        match &result {
            Ok(report) if report.cancelled => session.log("Directory scan cancelled"),
            Ok(report) => session.log(format!(
                "Directory scan finished: {} results over {} levels",
                report.results.len(),
                report.levels_scanned
            )),
            Err(e) => session.log(format!("Directory scan aborted: {}", e)),
        }
        session.complete();
        result
    }

    async fn crawl(&self, session: &ScanSession, request: &DirScanRequest) -> Result<DirScanReport> {
        let target = normalize_target(&request.target);
        session.log(format!(
            "Starting directory scan: {} (recursion depth {})",
            target, request.recursion_depth
        ));

        let dictionary = request.wordlist.as_deref().unwrap_or(&self.default_wordlist);
        let lines = self.dictionaries.load(dictionary).await?;
        let entries = expand_wordlist(&lines, &request.extensions);
        session.log(format!("Loaded {} dictionary entries", entries.len()));

        let client = build_client(&ClientOptions {
            timeout: request.timeout,
            follow_redirects: request.follow_redirects,
            max_redirects: request.max_redirects,
            user_agent: request.user_agent.clone(),
        })?;
        let web_service_id = resolve_web_service(&self.persistence, &target).await;

        let mut report = DirScanReport {
            target: target.clone(),
            ..Default::default()
        };
        let visited = Arc::new(Mutex::new(HashSet::from([target.clone()])));
        let levels = request.recursion_depth + 1;
        let mut current = vec![target.clone()];

        for depth in 0..levels {
            if current.is_empty() || session.is_cancelled() {
                break;
            }
            if depth > 0 {
                session.log(format!("Recursing into level {} with {} targets", depth, current.len()));
            }

            let total = current.len() * entries.len();
            let semaphore = Arc::new(Semaphore::new(request.threads.max(1)));
            let next_level = Arc::new(Mutex::new(Vec::new()));
            let found = Arc::new(Mutex::new(Vec::new()));
            let mut workers = JoinSet::new();
            let mut dispatched = 0usize;

            'dispatch: for base in &current {
                for path in &entries {
                    let Some(permit) = acquire_slot(session, &semaphore).await else {
                        break 'dispatch;
                    };
                    dispatched += 1;
                    let overall = (depth as f64 + dispatched as f64 / total as f64) / levels as f64;
                    session.progress(Stage::DirScan, overall * 100.0);

                    let url = format!("{}/{}", base, path.trim_start_matches('/'));
                    let probe = Probe {
                        client: client.clone(),
                        follow_redirects: request.follow_redirects,
                        max_body_size: request.max_body_size,
                    };
                    let worker = LevelWorker {
                        session: session.clone(),
                        persistence: self.persistence.clone(),
                        target: target.clone(),
                        web_service_id,
                        exclude_404: request.exclude_404,
                        recurse: depth < request.recursion_depth,
                        visited: visited.clone(),
                        next_level: next_level.clone(),
                        found: found.clone(),
                    };
                    workers.spawn(async move {
                        let _permit = permit;
                        if worker.session.is_cancelled() {
                            return;
                        }
                        if let Some(mut result) = probe.fetch(&url).await {
                            result.depth = depth;
                            worker.handle(result).await;
                        }
                    });
                }
            }

            while workers.join_next().await.is_some() {}

            report.requests += dispatched;
            report.levels_scanned = depth + 1;
            report.results.extend(std::mem::take(&mut *found.lock()));
            current = std::mem::take(&mut *next_level.lock());
        }

        report.cancelled = session.is_cancelled();
        if !report.cancelled {
            session.progress(Stage::DirScan, 100.0);
        }
        info!("Directory scan of {} produced {} results", target, report.results.len());
        Ok(report)
    }
}

/// Final URL of a followed redirect chain, empty when the request never
/// left `requested`. Both sides are compared in parsed form.
pub fn followed_location(requested: &str, final_url: &Url) -> String {
    match Url::parse(requested) {
        Ok(requested) if &requested == final_url => String::new(),
        _ => final_url.to_string(),
    }
}

struct Probe {
    client: Client,
    follow_redirects: bool,
    max_body_size: usize,
}

impl Probe {
    async fn fetch(&self, url: &str) -> Option<DirScanResult> {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("Request to {} failed: {}", url, e);
                return None;
            }
        };

        let status = response.status().as_u16();
        let content_type = header_value(&response, reqwest::header::CONTENT_TYPE);
        let location = if response.status().is_redirection() {
            header_value(&response, reqwest::header::LOCATION)
        } else if self.follow_redirects {
            followed_location(url, response.url())
        } else {
            String::new()
        };

        let body = read_capped(response, self.max_body_size).await;
        let title = if content_type.to_ascii_lowercase().contains("text/html") {
            extract_title(&String::from_utf8_lossy(&body)).unwrap_or_default()
        } else {
            String::new()
        };

        Some(DirScanResult {
            url: url.to_string(),
            status,
            size: body.len(),
            location,
            fingerprint: String::new(),
            title,
            content_type,
            depth: 0,
        })
    }
}

fn header_value(response: &reqwest::Response, name: reqwest::header::HeaderName) -> String {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

struct LevelWorker {
    session: ScanSession,
    persistence: PersistenceQueue,
    target: String,
    web_service_id: Option<i64>,
    exclude_404: bool,
    recurse: bool,
    visited: Arc<Mutex<HashSet<String>>>,
    next_level: Arc<Mutex<Vec<String>>>,
    found: Arc<Mutex<Vec<DirScanResult>>>,
}

impl LevelWorker {
    async fn handle(&self, result: DirScanResult) {
        if self.exclude_404 && result.status == 404 {
            return;
        }
        debug!("[{}] {} ({} bytes)", result.status, result.url, result.size);

        self.session.publish(ScanEvent::DirScanResult(result.clone()));
        self.persist(&result).await;

        if self.recurse && classify_directory(&result) {
            let next = next_level_target(&result);
            if self.visited.lock().insert(next.clone()) {
                self.next_level.lock().push(next);
            }
        }
        self.found.lock().push(result);
    }

    async fn persist(&self, result: &DirScanResult) {
        let result = result.clone();
        let target = self.target.clone();
        let web_service_id = self.web_service_id;
        self.persistence
            .submit(move |storage| {
                if let Some(id) = web_service_id {
                    let path = Url::parse(&result.url)
                        .map(|u| u.path().to_string())
                        .unwrap_or_else(|_| "/".to_string());
                    storage.add_web_directory(id, &path, &result)?;
                }
                storage.add_dir_scan_row(&target, &result)
            })
            .await
    }
}

/// A hit seeds the next level when its path ends in `/`, it answered 403,
/// or it redirects to a path ending in `/`.
pub fn classify_directory(result: &DirScanResult) -> bool {
    result.url.ends_with('/') || result.status == 403 || result.location.ends_with('/')
}

/// Base URL of the next level for a directory-like hit, following the
/// redirect target when there is one. Trailing slashes are dropped.
pub fn next_level_target(result: &DirScanResult) -> String {
    let location = result.location.as_str();
    let next = if location.is_empty() {
        result.url.clone()
    } else if location.starts_with("http://") || location.starts_with("https://") {
        location.to_string()
    } else if location.starts_with('/') {
        match Url::parse(&result.url).and_then(|base| base.join(location)) {
            Ok(joined) => joined.to_string(),
            Err(_) => location.to_string(),
        }
    } else {
        format!("{}/{}", result.url.trim_end_matches('/'), location)
    };
    next.trim_end_matches('/').to_string()
}

/// Expand `%EXT%` placeholders against every extension.
pub fn expand_wordlist(lines: &[String], extensions: &[String]) -> Vec<String> {
    let mut entries = Vec::with_capacity(lines.len());
    for line in lines {
        if line.contains("%EXT%") {
            for ext in extensions {
                entries.push(line.replace("%EXT%", ext.trim_start_matches('.')));
            }
        } else {
            entries.push(line.clone());
        }
    }
    dedup_preserving_order(&entries)
}
