//! Single-writer persistence.
//!
//! [`PersistenceQueue`] owns the only [`Storage`] handle on a dedicated
//! thread and drains a bounded channel of write commands in order. Every
//! engine goes through it; nothing else touches the database.

use crate::dir_scan::DirScanResult;
use crate::types::{Credential, OpenPort, PortRecord, Protocol, SensitiveFinding};
use crate::utils::time::timestamp;
use crate::{Result, ScanError};
use log::{debug, error, warn};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Tables the engine writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record {
    Asset,
    Port,
    WebService,
    WebDirectory,
    DirScanRow,
    JsFile,
    Sensitive,
    AuthResult,
    WeakPassword,
    Info,
}

impl Record {
    fn table(&self) -> &'static str {
        match self {
            Record::Asset => "assets",
            Record::Port => "asset_ports",
            Record::WebService => "web_services",
            Record::WebDirectory => "web_directories",
            Record::DirScanRow => "dir_scan_results",
            Record::JsFile => "web_js_files",
            Record::Sensitive => "sensitive_results",
            Record::AuthResult => "auth_results",
            Record::WeakPassword => "weak_passwords",
            Record::Info => "info_gathering",
        }
    }
}

/// Upsert and append operations required by the engines.
///
/// Upserts look up by natural key, insert when absent, otherwise update the
/// mutable columns and return the existing id. Atomicity comes from the
/// queue running one command at a time.
pub trait Storage: Send {
    fn upsert_asset(&mut self, ip: &str, os: &str, alive: bool) -> Result<i64>;
    fn upsert_port(&mut self, asset_id: i64, record: &PortRecord) -> Result<i64>;
    fn upsert_web_service(
        &mut self,
        asset_id: i64,
        port_id: i64,
        url: &str,
        title: &str,
        server: &str,
        fingerprints: &str,
    ) -> Result<i64>;
    fn add_web_directory(&mut self, web_service_id: i64, path: &str, result: &DirScanResult) -> Result<()>;
    fn add_dir_scan_row(&mut self, target: &str, result: &DirScanResult) -> Result<()>;
    fn add_js_file(&mut self, web_service_id: i64, path: &str, full_url: &str) -> Result<()>;
    fn add_sensitive(&mut self, web_service_id: i64, finding: &SensitiveFinding) -> Result<()>;
    fn add_auth_result(&mut self, asset_id: i64, port_id: i64, credential: &Credential, success: bool) -> Result<()>;
    fn add_weak_password(&mut self, credential: &Credential) -> Result<()>;
    fn add_info(&mut self, target: &str, info_type: &str, content: &str) -> Result<()>;
    fn count(&mut self, record: Record) -> Result<u64>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS assets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ip TEXT NOT NULL UNIQUE,
    os TEXT NOT NULL DEFAULT '',
    alive INTEGER NOT NULL DEFAULT 0,
    last_scan_time TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS asset_ports (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    asset_id INTEGER NOT NULL REFERENCES assets(id),
    port INTEGER NOT NULL,
    protocol TEXT NOT NULL,
    service TEXT NOT NULL DEFAULT '',
    product TEXT NOT NULL DEFAULT '',
    version TEXT NOT NULL DEFAULT '',
    banner TEXT NOT NULL DEFAULT '',
    state TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (asset_id, port, protocol)
);
CREATE TABLE IF NOT EXISTS web_services (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    asset_id INTEGER NOT NULL REFERENCES assets(id),
    port_id INTEGER NOT NULL REFERENCES asset_ports(id),
    url TEXT NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    server TEXT NOT NULL DEFAULT '',
    fingerprints TEXT NOT NULL DEFAULT '',
    updated_at TEXT NOT NULL,
    UNIQUE (port_id, url)
);
CREATE TABLE IF NOT EXISTS web_directories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    web_service_id INTEGER NOT NULL REFERENCES web_services(id),
    path TEXT NOT NULL,
    status INTEGER NOT NULL,
    length INTEGER NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    content_type TEXT NOT NULL DEFAULT '',
    redirect TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS dir_scan_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    target TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    size INTEGER NOT NULL,
    location TEXT NOT NULL DEFAULT '',
    fingerprint TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS web_js_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    web_service_id INTEGER NOT NULL REFERENCES web_services(id),
    path TEXT NOT NULL,
    full_url TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS sensitive_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    web_service_id INTEGER NOT NULL REFERENCES web_services(id),
    source_file TEXT NOT NULL,
    info_type TEXT NOT NULL,
    content TEXT NOT NULL,
    context TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS auth_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    asset_id INTEGER NOT NULL REFERENCES assets(id),
    port_id INTEGER NOT NULL REFERENCES asset_ports(id),
    service_type TEXT NOT NULL,
    username TEXT NOT NULL,
    password TEXT NOT NULL,
    success INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS weak_passwords (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host TEXT NOT NULL,
    port INTEGER NOT NULL,
    service TEXT NOT NULL,
    username TEXT NOT NULL,
    password TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS info_gathering (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    target TEXT NOT NULL,
    info_type TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);
";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AssetRow {
    pub id: i64,
    pub ip: String,
    pub os: String,
    pub alive: bool,
    pub last_scan_time: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PortRow {
    pub id: i64,
    pub asset_id: i64,
    pub port: u16,
    pub protocol: String,
    pub service: String,
    pub banner: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WebServiceRow {
    pub id: i64,
    pub asset_id: i64,
    pub port_id: i64,
    pub url: String,
    pub title: String,
    pub server: String,
}

/// SQLite-backed [`Storage`].
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the database at `path` in WAL mode with the given
    /// lock-wait budget.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        debug!("Database {} opened (journal_mode={})", path.display(), mode);
        Self::initialize(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn asset_by_ip(&self, ip: &str) -> Result<Option<AssetRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, ip, os, alive, last_scan_time FROM assets WHERE ip = ?1",
                params![ip],
                |row| {
                    Ok(AssetRow {
                        id: row.get(0)?,
                        ip: row.get(1)?,
                        os: row.get(2)?,
                        alive: row.get(3)?,
                        last_scan_time: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn ports_for_asset(&self, asset_id: i64) -> Result<Vec<PortRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, asset_id, port, protocol, service, banner, state
             FROM asset_ports WHERE asset_id = ?1 ORDER BY port",
        )?;
        let rows = stmt
            .query_map(params![asset_id], |row| {
                Ok(PortRow {
                    id: row.get(0)?,
                    asset_id: row.get(1)?,
                    port: row.get(2)?,
                    protocol: row.get(3)?,
                    service: row.get(4)?,
                    banner: row.get(5)?,
                    state: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn web_services(&self) -> Result<Vec<WebServiceRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, asset_id, port_id, url, title, server FROM web_services ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(WebServiceRow {
                    id: row.get(0)?,
                    asset_id: row.get(1)?,
                    port_id: row.get(2)?,
                    url: row.get(3)?,
                    title: row.get(4)?,
                    server: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl Storage for SqliteStore {
    fn upsert_asset(&mut self, ip: &str, os: &str, alive: bool) -> Result<i64> {
        let now = timestamp();
        let existing: Option<i64> = self
            .conn
            .query_row("SELECT id FROM assets WHERE ip = ?1", params![ip], |row| row.get(0))
            .optional()?;

        match existing {
            Some(id) => {
                self.conn.execute(
                    "UPDATE assets SET os = COALESCE(NULLIF(?1, ''), os), alive = ?2, last_scan_time = ?3
                     WHERE id = ?4",
                    params![os, alive, now, id],
                )?;
                Ok(id)
            }
            None => {
                self.conn.execute(
                    "INSERT INTO assets (ip, os, alive, last_scan_time, created_at) VALUES (?1, ?2, ?3, ?4, ?4)",
                    params![ip, os, alive, now],
                )?;
                Ok(self.conn.last_insert_rowid())
            }
        }
    }

    fn upsert_port(&mut self, asset_id: i64, record: &PortRecord) -> Result<i64> {
        let now = timestamp();
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM asset_ports WHERE asset_id = ?1 AND port = ?2 AND protocol = ?3",
                params![asset_id, record.port, record.protocol.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => {
                self.conn.execute(
                    "UPDATE asset_ports SET
                        service = COALESCE(NULLIF(?1, ''), service),
                        product = COALESCE(NULLIF(?2, ''), product),
                        version = COALESCE(NULLIF(?3, ''), version),
                        banner = COALESCE(NULLIF(?4, ''), banner),
                        state = ?5,
                        updated_at = ?6
                     WHERE id = ?7",
                    params![
                        record.service,
                        record.product,
                        record.version,
                        record.banner,
                        record.state.as_str(),
                        now,
                        id
                    ],
                )?;
                Ok(id)
            }
            None => {
                self.conn.execute(
                    "INSERT INTO asset_ports
                        (asset_id, port, protocol, service, product, version, banner, state, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        asset_id,
                        record.port,
                        record.protocol.as_str(),
                        record.service,
                        record.product,
                        record.version,
                        record.banner,
                        record.state.as_str(),
                        now
                    ],
                )?;
                Ok(self.conn.last_insert_rowid())
            }
        }
    }

    fn upsert_web_service(
        &mut self,
        asset_id: i64,
        port_id: i64,
        url: &str,
        title: &str,
        server: &str,
        fingerprints: &str,
    ) -> Result<i64> {
        let now = timestamp();
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM web_services WHERE port_id = ?1 AND url = ?2",
                params![port_id, url],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => {
                self.conn.execute(
                    "UPDATE web_services SET
                        title = COALESCE(NULLIF(?1, ''), title),
                        server = COALESCE(NULLIF(?2, ''), server),
                        fingerprints = COALESCE(NULLIF(?3, ''), fingerprints),
                        updated_at = ?4
                     WHERE id = ?5",
                    params![title, server, fingerprints, now, id],
                )?;
                Ok(id)
            }
            None => {
                self.conn.execute(
                    "INSERT INTO web_services (asset_id, port_id, url, title, server, fingerprints, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![asset_id, port_id, url, title, server, fingerprints, now],
                )?;
                Ok(self.conn.last_insert_rowid())
            }
        }
    }

    fn add_web_directory(&mut self, web_service_id: i64, path: &str, result: &DirScanResult) -> Result<()> {
        self.conn.execute(
            "INSERT INTO web_directories
                (web_service_id, path, status, length, title, content_type, redirect, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                web_service_id,
                path,
                result.status,
                result.size as i64,
                result.title,
                result.content_type,
                result.location,
                timestamp()
            ],
        )?;
        Ok(())
    }

    fn add_dir_scan_row(&mut self, target: &str, result: &DirScanResult) -> Result<()> {
        self.conn.execute(
            "INSERT INTO dir_scan_results (target, url, status, size, location, fingerprint, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                target,
                result.url,
                result.status,
                result.size as i64,
                result.location,
                result.fingerprint,
                timestamp()
            ],
        )?;
        Ok(())
    }

    fn add_js_file(&mut self, web_service_id: i64, path: &str, full_url: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO web_js_files (web_service_id, path, full_url, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![web_service_id, path, full_url, timestamp()],
        )?;
        Ok(())
    }

    fn add_sensitive(&mut self, web_service_id: i64, finding: &SensitiveFinding) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sensitive_results (web_service_id, source_file, info_type, content, context, created_at)
             VALUES (?1, ?2, ?3, ?4, '', ?5)",
            params![web_service_id, finding.source, finding.kind, finding.value, timestamp()],
        )?;
        Ok(())
    }

    fn add_auth_result(&mut self, asset_id: i64, port_id: i64, credential: &Credential, success: bool) -> Result<()> {
        self.conn.execute(
            "INSERT INTO auth_results (asset_id, port_id, service_type, username, password, success, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                asset_id,
                port_id,
                credential.service,
                credential.username,
                credential.password,
                success,
                timestamp()
            ],
        )?;
        Ok(())
    }

    fn add_weak_password(&mut self, credential: &Credential) -> Result<()> {
        self.conn.execute(
            "INSERT INTO weak_passwords (host, port, service, username, password, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                credential.target.to_string(),
                credential.port,
                credential.service,
                credential.username,
                credential.password,
                timestamp()
            ],
        )?;
        Ok(())
    }

    fn add_info(&mut self, target: &str, info_type: &str, content: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO info_gathering (target, info_type, content, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![target, info_type, content, timestamp()],
        )?;
        Ok(())
    }

    fn count(&mut self, record: Record) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", record.table());
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

type Task = Box<dyn FnOnce(&mut dyn Storage) + Send + 'static>;

enum WriteCommand {
    Run(Task),
    Shutdown,
}

/// Cloneable handle onto the single storage writer.
#[derive(Clone)]
pub struct PersistenceQueue {
    sender: mpsc::Sender<WriteCommand>,
    worker: Arc<Mutex<Option<thread::JoinHandle<()>>>>,
}

impl PersistenceQueue {
    /// Move `storage` onto a dedicated writer thread.
    pub fn spawn<S: Storage + 'static>(storage: S, capacity: usize) -> Result<Self> {
        let (sender, mut receiver) = mpsc::channel::<WriteCommand>(capacity.max(1));

        let handle = thread::Builder::new()
            .name("rscout-writer".to_string())
            .spawn(move || {
                let mut storage = storage;
                while let Some(command) = receiver.blocking_recv() {
                    match command {
                        WriteCommand::Run(task) => task(&mut storage),
                        WriteCommand::Shutdown => break,
                    }
                }
                debug!("Persistence writer stopped");
            })?;

        Ok(Self {
            sender,
            worker: Arc::new(Mutex::new(Some(handle))),
        })
    }

    /// Fire-and-forget write. Failures are logged by the writer.
    pub async fn submit<F>(&self, task: F)
    where
        F: FnOnce(&mut dyn Storage) -> Result<()> + Send + 'static,
    {
        let command = WriteCommand::Run(Box::new(move |storage| {
            if let Err(e) = task(storage) {
                error!("Persistence task failed: {}", e);
            }
        }));
        if self.sender.send(command).await.is_err() {
            warn!("Persistence queue closed, dropping write");
        }
    }

    /// Run `task` on the writer and wait for its result.
    pub async fn execute<T, F>(&self, task: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn Storage) -> Result<T> + Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        let command = WriteCommand::Run(Box::new(move |storage| {
            let _ = reply.send(task(storage));
        }));
        self.sender
            .send(command)
            .await
            .map_err(|_| ScanError::Persistence("persistence queue closed".to_string()))?;
        response
            .await
            .map_err(|_| ScanError::Persistence("persistence writer dropped the reply".to_string()))?
    }

    /// Resolves once every command queued before it has been applied.
    pub async fn flush(&self) -> Result<()> {
        self.execute(|_| Ok(())).await
    }

    /// Drain pending writes and stop the writer thread.
    pub async fn shutdown(&self) {
        let _ = self.sender.send(WriteCommand::Shutdown).await;
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if tokio::task::spawn_blocking(move || handle.join()).await.is_err() {
                warn!("Persistence writer did not shut down cleanly");
            }
        }
    }

    pub async fn count(&self, record: Record) -> Result<u64> {
        self.execute(move |storage| storage.count(record)).await
    }

    pub async fn record_alive_host(&self, ip: IpAddr) {
        self.submit(move |storage| {
            let ip = ip.to_string();
            storage.upsert_asset(&ip, "", true)?;
            storage.add_info(&ip, "ICMP", "Alive")
        })
        .await
    }

    /// Asset + Port upsert for an open port, plus a WebService row for
    /// HTTP(S) services.
    pub async fn record_open_port(&self, open: &OpenPort) {
        let open = open.clone();
        self.submit(move |storage| {
            let ip = open.ip.to_string();
            let asset_id = storage.upsert_asset(&ip, "", true)?;
            let record = PortRecord::open(open.port, open.protocol, &open.service)
                .with_banner(open.banner.as_deref());
            let port_id = storage.upsert_port(asset_id, &record)?;
            if let Some(url) = open.base_url() {
                storage.upsert_web_service(asset_id, port_id, &url, "", "", "")?;
            }
            storage.add_info(&ip, "PortScan", &format!("{}/{} open", open.port, open.protocol))
        })
        .await
    }

    /// Upsert the Asset/Port/WebService chain for a crawled URL and return
    /// the WebService id.
    pub async fn bind_web_service(&self, ip: IpAddr, port: u16, scheme: &str, url: &str) -> Result<i64> {
        let scheme = scheme.to_string();
        let url = url.to_string();
        self.execute(move |storage| {
            let asset_id = storage.upsert_asset(&ip.to_string(), "", true)?;
            let port_id = storage.upsert_port(asset_id, &PortRecord::open(port, Protocol::Tcp, &scheme))?;
            storage.upsert_web_service(asset_id, port_id, &url, "", "", "")
        })
        .await
    }

    pub async fn record_credential(&self, credential: &Credential) {
        let credential = credential.clone();
        self.submit(move |storage| {
            let asset_id = storage.upsert_asset(&credential.target.to_string(), "", true)?;
            let record = PortRecord::open(credential.port, Protocol::Tcp, &credential.service);
            let port_id = storage.upsert_port(asset_id, &record)?;
            storage.add_auth_result(asset_id, port_id, &credential, true)?;
            storage.add_weak_password(&credential)
        })
        .await
    }
}
