use crate::config::Config;
use crate::control::{ScanEvent, ScanSession, Stage};
use crate::persistence::PersistenceQueue;
use crate::secrets::{analyze_content, is_dangerous_endpoint, ContentAnalysis};
use crate::types::SensitiveFinding;
use crate::utils::text::dedup_preserving_order;
use crate::web_scan::{build_client, read_capped, resolve_web_service, ClientOptions};
use crate::Result;
use futures::stream::{self, StreamExt};
use log::{debug, info};
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use url::Url;

/// Finding kind for endpoints confirmed by active verification.
pub const VERIFIED_API: &str = "Verified API";

const VERIFIED_STATUSES: &[u16] = &[200, 401, 403, 500];

#[derive(Debug, Clone)]
pub struct JsFinderOptions {
    /// Follow scripts referenced by scripts (two levels instead of one).
    pub deep_scan: bool,
    /// Probe every discovered endpoint afterwards.
    pub active_scan: bool,
    /// Skip endpoints that look destructive during active verification.
    pub danger_filter: bool,
    pub concurrency: usize,
    pub timeout: Duration,
    pub max_body_size: usize,
    pub user_agent: String,
}

impl JsFinderOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            deep_scan: config.js_finder.deep_scan,
            active_scan: config.js_finder.active_scan,
            danger_filter: config.js_finder.danger_filter,
            concurrency: config.js_finder.concurrency,
            timeout: config.js_request_timeout(),
            max_body_size: config.js_finder.max_body_size,
            user_agent: config.scan.user_agent.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JsFindResult {
    pub url: String,
    pub endpoints: Vec<String>,
    pub js_files: Vec<String>,
    pub findings: Vec<SensitiveFinding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JsFindResult {
    fn merge(&mut self, analysis: ContentAnalysis) {
        self.endpoints.extend(analysis.endpoints);
        self.js_files.extend(analysis.js_files);
        self.findings.extend(analysis.findings);
    }

    fn dedup(&mut self) {
        self.endpoints = dedup_preserving_order(&self.endpoints);
        self.js_files = dedup_preserving_order(&self.js_files);
        self.findings = dedup_preserving_order(&self.findings);
    }
}

pub struct JsFinder {
    persistence: PersistenceQueue,
}

impl JsFinder {
    pub fn new(persistence: PersistenceQueue) -> Self {
        Self { persistence }
    }

    pub async fn find(&self, session: &ScanSession, target: &str, options: &JsFinderOptions) -> Result<JsFindResult> {
        let result = self.crawl(session, target, options).await;
        match &result {
            Ok(found) => match &found.error {
                Some(error) => session.log(format!("JS finder failed: {}", error)),
                None => session.log(format!(
                    "JS finder finished: {} scripts, {} endpoints, {} findings",
                    found.js_files.len(),
                    found.endpoints.len(),
                    found.findings.len()
                )),
            },
            Err(e) => session.log(format!("JS finder aborted: {}", e)),
        }
        session.complete();
        result
    }

    async fn crawl(&self, session: &ScanSession, target: &str, options: &JsFinderOptions) -> Result<JsFindResult> {
        let target = if target.starts_with("http") {
            target.trim().to_string()
        } else {
            format!("http://{}", target.trim())
        };
        let mut result = JsFindResult {
            url: target.clone(),
            ..Default::default()
        };

        info!(
            "Starting JS finder on {} (deep: {}, active: {})",
            target, options.deep_scan, options.active_scan
        );
        let client = build_client(&ClientOptions {
            timeout: options.timeout,
            follow_redirects: true,
            max_redirects: 10,
            user_agent: options.user_agent.clone(),
        })?;
        let fetcher = Fetcher {
            client: client.clone(),
            max_body_size: options.max_body_size,
        };

        let Some(body) = fetcher.fetch(&target).await else {
            result.error = Some(format!("failed to fetch {}", target));
            return Ok(result);
        };

        let main = analyze_content(&body, &target);
        let mut queued: HashSet<String> = HashSet::from([target.clone()]);
        let mut queue = resolve_new(&target, &main.js_files, &mut queued);
        result.merge(main);

        let levels = if options.deep_scan { 2 } else { 1 };
        for level in 0..levels {
            if queue.is_empty() || session.is_cancelled() {
                break;
            }
            info!("Processing JS level {} ({} files)", level + 1, queue.len());

            let collect_next = level + 1 < levels;
            let merged = Mutex::new(JsFindResult::default());
            let next_level = Mutex::new(Vec::new());
            let done = AtomicUsize::new(0);
            let total = queue.len();

            stream::iter(queue.iter())
                .for_each_concurrent(options.concurrency.max(1), |script_url| {
                    let fetcher = &fetcher;
                    let merged = &merged;
                    let next_level = &next_level;
                    let done = &done;
                    async move {
                        if session.wait_if_paused().await {
                            return;
                        }
                        if let Some(content) = fetcher.fetch(script_url).await {
                            let analysis = analyze_content(&content, script_url);
                            if collect_next {
                                let mut next_level = next_level.lock();
                                for js in &analysis.js_files {
                                    if let Ok(full) = resolve_url(script_url, js) {
                                        next_level.push(full);
                                    }
                                }
                            }
                            merged.lock().merge(analysis);
                        }
                        let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                        let overall = (level as f64 + finished as f64 / total as f64) / levels as f64;
                        session.progress(Stage::JsFinder, overall * 100.0);
                    }
                })
                .await;

            let level_result = merged.into_inner();
            result.endpoints.extend(level_result.endpoints);
            result.js_files.extend(level_result.js_files);
            result.findings.extend(level_result.findings);

            queue = next_level
                .into_inner()
                .into_iter()
                .filter(|url| queued.insert(url.clone()))
                .collect();
        }

        result.dedup();

        if options.active_scan && !session.is_cancelled() {
            info!("Active verification of {} endpoints", result.endpoints.len());
            let verified = verify_endpoints(session, &client, &target, &result.endpoints, options).await;
            result.findings.extend(verified.into_iter().map(|value| SensitiveFinding {
                source: target.clone(),
                kind: VERIFIED_API.to_string(),
                value,
            }));
        }

        for finding in &result.findings {
            session.publish(ScanEvent::Finding(finding.clone()));
        }
        if !session.is_cancelled() {
            session.progress(Stage::JsFinder, 100.0);
        }

        self.persist(&result).await;
        Ok(result)
    }

    async fn persist(&self, result: &JsFindResult) {
        let Some(web_service_id) = resolve_web_service(&self.persistence, &result.url).await else {
            debug!("No web service for {}, JS results not stored", result.url);
            return;
        };

        let target = result.url.clone();
        let js_files = result.js_files.clone();
        let findings = result.findings.clone();
        self.persistence
            .submit(move |storage| {
                for js in &js_files {
                    let full = resolve_url(&target, js).unwrap_or_else(|_| js.clone());
                    storage.add_js_file(web_service_id, js, &full)?;
                }
                for finding in &findings {
                    storage.add_sensitive(web_service_id, finding)?;
                }
                Ok(())
            })
            .await
    }
}

struct Fetcher {
    client: Client,
    max_body_size: usize,
}

impl Fetcher {
    async fn fetch(&self, url: &str) -> Option<String> {
        match self.client.get(url).send().await {
            Ok(response) => {
                let body = read_capped(response, self.max_body_size).await;
                Some(String::from_utf8_lossy(&body).into_owned())
            }
            Err(e) => {
                debug!("Failed to fetch {}: {}", url, e);
                None
            }
        }
    }
}

/// Probe endpoints with HEAD, retrying with GET on 405. Returns
/// `"[status] url"` for every endpoint answering 200, 401, 403 or 500.
async fn verify_endpoints(
    session: &ScanSession,
    client: &Client,
    base: &str,
    endpoints: &[String],
    options: &JsFinderOptions,
) -> Vec<String> {
    let candidates: Vec<String> = endpoints
        .iter()
        .filter(|endpoint| !(options.danger_filter && is_dangerous_endpoint(endpoint)))
        .filter_map(|endpoint| {
            if endpoint.starts_with("http") {
                Some(endpoint.clone())
            } else {
                resolve_url(base, endpoint).ok()
            }
        })
        .collect();

    let verified = Mutex::new(Vec::new());
    stream::iter(candidates.iter())
        .for_each_concurrent(options.concurrency.max(1), |url| {
            let verified = &verified;
            async move {
                if session.wait_if_paused().await {
                    return;
                }
                let mut response = client.head(url).send().await;
                if matches!(&response, Ok(r) if r.status() == StatusCode::METHOD_NOT_ALLOWED) {
                    response = client.get(url).send().await;
                }
                if let Ok(response) = response {
                    let status = response.status().as_u16();
                    if VERIFIED_STATUSES.contains(&status) {
                        debug!("Verified endpoint [{}] {}", status, url);
                        verified.lock().push(format!("[{}] {}", status, url));
                    }
                }
            }
        })
        .await;

    verified.into_inner()
}

fn resolve_url(base: &str, reference: &str) -> std::result::Result<String, url::ParseError> {
    Ok(Url::parse(base)?.join(reference)?.to_string())
}

fn resolve_new(base: &str, js_files: &[String], queued: &mut HashSet<String>) -> Vec<String> {
    js_files
        .iter()
        .filter_map(|js| resolve_url(base, js).ok())
        .filter(|full| queued.insert(full.clone()))
        .collect()
}

