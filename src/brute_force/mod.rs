//! Dictionary credential testing against discovered services.
//!
//! Protocol plugins implement [`BruteForcer`] and are looked up by service
//! name through a [`PluginRegistry`] built at startup. [`BruteForceEngine`]
//! walks users (outer) and passwords (inner) for every target, dispatching
//! each attempt onto a bounded worker pool.

mod database;
mod remote;
pub mod smb;

pub use database::{MongoDbBruteForcer, MssqlBruteForcer, MysqlBruteForcer, PostgresBruteForcer, RedisBruteForcer};
pub use remote::{
    rdp_accepts_connection, telnet_login_succeeded, telnet_negotiate, vnc_key, vnc_response, FtpBruteForcer,
    LdapBruteForcer, RdpBruteForcer, SshBruteForcer, TelnetBruteForcer, VncBruteForcer, WinRmBruteForcer,
};
pub use smb::SmbBruteForcer;

use crate::config::Config;
use crate::control::{Channel, EventBus, ScanController, ScanEvent, ScanSession, Stage};
use crate::discovery::{acquire_slot, guess_service, percent};
use crate::persistence::PersistenceQueue;
use crate::types::{Credential, Protocol};
use crate::utils::wordlist::DictionaryProvider;
use crate::{Result, ScanError};
use async_trait::async_trait;
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;

/// One protocol's login attempt.
///
/// `Ok(false)` is a rejected credential. Connection failures may surface
/// as `Err`; the engine counts them as failed attempts.
#[async_trait]
pub trait BruteForcer: Send + Sync {
    async fn attempt_login(
        &self,
        target: IpAddr,
        port: u16,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<bool>;
    fn service_name(&self) -> &'static str;
    fn default_port(&self) -> u16;
}

/// Service name to plugin dispatch table.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn BruteForcer>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_plugins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SshBruteForcer));
        registry.register(Arc::new(FtpBruteForcer));
        registry.register(Arc::new(TelnetBruteForcer));
        registry.register(Arc::new(MysqlBruteForcer));
        registry.register(Arc::new(PostgresBruteForcer));
        registry.register(Arc::new(MssqlBruteForcer));
        registry.register(Arc::new(MongoDbBruteForcer));
        registry.register(Arc::new(RedisBruteForcer));
        registry.register(Arc::new(SmbBruteForcer));
        registry.register(Arc::new(VncBruteForcer));
        registry.register(Arc::new(LdapBruteForcer));
        registry.register(Arc::new(WinRmBruteForcer));
        registry.register(Arc::new(RdpBruteForcer));
        registry.alias("postgres", "postgresql");
        registry
    }

    pub fn register(&mut self, plugin: Arc<dyn BruteForcer>) {
        self.plugins.insert(plugin.service_name().to_string(), plugin);
    }

    /// Make `alias` dispatch to the plugin registered as `service`.
    pub fn alias(&mut self, alias: &str, service: &str) {
        if let Some(plugin) = self.plugins.get(service).cloned() {
            self.plugins.insert(alias.to_string(), plugin);
        }
    }

    pub fn get(&self, service: &str) -> Option<Arc<dyn BruteForcer>> {
        self.plugins.get(&service.to_ascii_lowercase()).cloned()
    }

    pub fn supports(&self, service: &str) -> bool {
        self.plugins.contains_key(&service.to_ascii_lowercase())
    }

    pub fn services(&self) -> Vec<&str> {
        self.plugins.keys().map(String::as_str).collect()
    }
}

/// A service-tagged endpoint to test.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BruteForceTarget {
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub service: String,
}

impl BruteForceTarget {
    pub fn new(ip: IpAddr, port: u16, service: &str) -> Self {
        Self {
            ip,
            port,
            protocol: Protocol::Tcp,
            service: service.to_ascii_lowercase(),
        }
    }
}

impl fmt::Display for BruteForceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.ip, self.port, self.service)
    }
}

/// Parses `ip:port:service`, or `ip:port` with the service guessed from the port.
impl FromStr for BruteForceTarget {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        let invalid = || ScanError::InvalidTarget(format!("expected ip:port[:service], got {}", s));

        let (ip, port, service) = match parts.as_slice() {
            [ip, port] => (*ip, *port, None),
            [ip, port, service] if !service.is_empty() => (*ip, *port, Some(*service)),
            _ => return Err(invalid()),
        };
        let ip: IpAddr = ip.parse().map_err(|_| invalid())?;
        let port: u16 = port.parse().map_err(|_| invalid())?;
        let service = service.unwrap_or_else(|| guess_service(port));
        Ok(Self::new(ip, port, service))
    }
}

#[derive(Debug, Clone)]
pub struct BruteForceRequest {
    /// Explicit targets; the engine's target book is used when empty.
    pub targets: Vec<BruteForceTarget>,
    pub user_dict: String,
    pub pass_dict: String,
    pub threads: usize,
    pub timeout: Duration,
    /// Services to attack; every registered one when empty.
    pub protocols: Vec<String>,
}

impl BruteForceRequest {
    pub fn from_config(config: &Config) -> Self {
        Self {
            targets: Vec::new(),
            user_dict: config.brute_force.user_dict.clone(),
            pass_dict: config.brute_force.pass_dict.clone(),
            threads: config.brute_force.threads,
            timeout: config.brute_force_timeout(),
            protocols: config.brute_force.protocols.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BruteForceReport {
    pub attempts: usize,
    pub skipped: Vec<BruteForceTarget>,
    pub credentials: Vec<Credential>,
    pub cancelled: bool,
}

/// Clears the running flag however the run ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct BruteForceEngine {
    registry: Arc<PluginRegistry>,
    persistence: PersistenceQueue,
    dictionaries: DictionaryProvider,
    controller: ScanController,
    running: AtomicBool,
    targets: RwLock<Vec<BruteForceTarget>>,
}

impl BruteForceEngine {
    pub fn new(config: &Config, persistence: PersistenceQueue, events: Arc<EventBus>) -> Self {
        Self::with_registry(config, persistence, events, PluginRegistry::with_default_plugins())
    }

    pub fn with_registry(
        config: &Config,
        persistence: PersistenceQueue,
        events: Arc<EventBus>,
        registry: PluginRegistry,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            persistence,
            dictionaries: DictionaryProvider::new(config.wordlists.dict_dir.clone()),
            controller: ScanController::new(Channel::BruteForce, events),
            running: AtomicBool::new(false),
            targets: RwLock::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn controller(&self) -> &ScanController {
        &self.controller
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Add to the target book. Returns `false` for a duplicate ip/port/service.
    pub fn add_target(&self, target: BruteForceTarget) -> bool {
        let mut targets = self.targets.write();
        if targets
            .iter()
            .any(|t| t.ip == target.ip && t.port == target.port && t.service == target.service)
        {
            return false;
        }
        info!("Added brute force target {}", target);
        targets.push(target);
        true
    }

    pub fn targets(&self) -> Vec<BruteForceTarget> {
        self.targets.read().clone()
    }

    pub fn clear_targets(&self) {
        self.targets.write().clear();
    }

    pub fn stop(&self) {
        if self.is_running() {
            self.controller.notice("Stopping brute force");
        }
        self.controller.stop();
    }

    /// Run one attack. `Ok(None)` when another run is still active; that is
    /// reported on the event channel rather than as an error.
    pub async fn run(&self, request: &BruteForceRequest) -> Result<Option<BruteForceReport>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.controller.notice("Brute force is already running");
            return Ok(None);
        }
        let _guard = RunGuard(&self.running);

        let session = self.controller.begin();
        session.log("Starting brute force");
        let result = self.attack(&session, request).await;
        match &result {
            Ok(report) => session.log(format!(
                "Brute force finished: {} attempts, {} credentials found{}",
                report.attempts,
                report.credentials.len(),
                if report.cancelled { " (cancelled)" } else { "" }
            )),
            Err(e) => session.log(format!("Brute force aborted: {}", e)),
        }
        session.complete();
        result.map(Some)
    }

    async fn attack(&self, session: &ScanSession, request: &BruteForceRequest) -> Result<BruteForceReport> {
        let users = self.dictionaries.load(&request.user_dict).await?;
        let passwords = self.dictionaries.load(&request.pass_dict).await?;
        session.log(format!("Loaded {} users and {} passwords", users.len(), passwords.len()));

        let targets = if request.targets.is_empty() {
            self.targets()
        } else {
            request.targets.clone()
        };
        let selected: HashSet<String> = request.protocols.iter().map(|p| p.to_ascii_lowercase()).collect();

        let mut report = BruteForceReport::default();
        let mut plan = Vec::new();
        for target in targets {
            let service = target.service.to_ascii_lowercase();
            if !selected.is_empty() && !selected.contains(&service) {
                continue;
            }
            match self.registry.get(&service) {
                Some(plugin) => plan.push((target, plugin)),
                None => {
                    session.log(format!("Skipping unsupported service {}", target));
                    report.skipped.push(target);
                }
            }
        }

        let total = plan.len() * users.len() * passwords.len();
        let semaphore = Arc::new(Semaphore::new(request.threads.max(1)));
        let cracked = Arc::new(Mutex::new(Vec::new()));
        let mut workers = JoinSet::new();
        let attempt_timeout = request.timeout;

        'targets: for (target, plugin) in plan {
            if session.is_cancelled() {
                break;
            }
            session.log(format!("Attacking {}", target));
            let found = Arc::new(AtomicBool::new(false));

            for user in &users {
                for pass in &passwords {
                    if found.load(Ordering::SeqCst) {
                        continue 'targets;
                    }
                    let Some(permit) = acquire_slot(session, &semaphore).await else {
                        break 'targets;
                    };
                    report.attempts += 1;
                    session.progress(Stage::BruteForce, percent(report.attempts, total));

                    let attempt = Attempt {
                        session: session.clone(),
                        persistence: self.persistence.clone(),
                        plugin: plugin.clone(),
                        target: target.clone(),
                        found: found.clone(),
                        cracked: cracked.clone(),
                    };
                    let (user, pass) = (user.clone(), pass.clone());
                    workers.spawn(async move {
                        let _permit = permit;
                        attempt.run(&user, &pass, attempt_timeout).await;
                    });
                }
            }
        }

        while workers.join_next().await.is_some() {}

        report.cancelled = session.is_cancelled();
        if !report.cancelled {
            session.progress(Stage::BruteForce, 100.0);
        }
        report.credentials = std::mem::take(&mut *cracked.lock());
        Ok(report)
    }
}

struct Attempt {
    session: ScanSession,
    persistence: PersistenceQueue,
    plugin: Arc<dyn BruteForcer>,
    target: BruteForceTarget,
    found: Arc<AtomicBool>,
    cracked: Arc<Mutex<Vec<Credential>>>,
}

impl Attempt {
    async fn run(&self, user: &str, pass: &str, attempt_timeout: Duration) {
        if self.found.load(Ordering::SeqCst) || self.session.is_cancelled() {
            return;
        }

        let target = &self.target;
        // Plugins apply the timeout per network step; bound the whole exchange too.
        let login = self
            .plugin
            .attempt_login(target.ip, target.port, user, pass, attempt_timeout);
        match timeout(attempt_timeout * 3, login).await {
            Ok(Ok(true)) => self.record(user, pass).await,
            Ok(Ok(false)) => debug!("Login failed {} -> {}/{}", target, user, pass),
            Ok(Err(e)) => debug!("Login error {} -> {}/{}: {}", target, user, pass, e),
            Err(_) => debug!("Login timed out {} -> {}/{}", target, user, pass),
        }
    }

    async fn record(&self, user: &str, pass: &str) {
        // First success per target wins; later in-flight successes are dropped.
        if self.found.swap(true, Ordering::SeqCst) {
            return;
        }
        let target = &self.target;
        let credential = Credential {
            target: target.ip,
            port: target.port,
            service: target.service.clone(),
            username: user.to_string(),
            password: pass.to_string(),
        };

        self.session
            .log(format!("[SUCCESS] Weak credential {} -> {} / {}", target, user, pass));
        self.session.publish(ScanEvent::CredentialFound(credential.clone()));
        if !self.session.is_cancelled() {
            self.persistence.record_credential(&credential).await;
        }
        self.cracked.lock().push(credential);
    }
}
