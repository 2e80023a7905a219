//! Shared control plane for every engine: cancellation, pause, progress
//! and the event sink.

use crate::dir_scan::DirScanResult;
use crate::types::{Credential, OpenPort, SensitiveFinding};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Which engine an event belongs to.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Scan,
    DirScan,
    JsFinder,
    BruteForce,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::Scan => "scan",
            Channel::DirScan => "dir-scan",
            Channel::JsFinder => "js-finder",
            Channel::BruteForce => "brute-force",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Liveness,
    PortScan,
    UdpScan,
    DirScan,
    JsFinder,
    BruteForce,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Liveness => "liveness",
            Stage::PortScan => "port scan",
            Stage::UdpScan => "udp scan",
            Stage::DirScan => "directory scan",
            Stage::JsFinder => "js finder",
            Stage::BruteForce => "brute force",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    Log {
        channel: Channel,
        message: String,
        time: String,
    },
    Progress {
        channel: Channel,
        stage: Stage,
        percent: f64,
    },
    HostAlive {
        ip: IpAddr,
    },
    PortOpen(OpenPort),
    DirScanResult(DirScanResult),
    Finding(SensitiveFinding),
    CredentialFound(Credential),
    Complete {
        channel: Channel,
    },
}

impl ScanEvent {
    /// One JSON object, tagged by `event`.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Fan-out event sink. Delivery never blocks the publishing worker.
pub struct EventBus {
    subscribers: RwLock<Vec<mpsc::UnboundedSender<ScanEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ScanEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(tx);
        rx
    }

    pub fn publish(&self, event: ScanEvent) {
        let mut closed = false;
        {
            let subscribers = self.subscribers.read();
            for sender in subscribers.iter() {
                if sender.send(event.clone()).is_err() {
                    closed = true;
                }
            }
        }
        if closed {
            debug!("Event subscriber disconnected");
            self.subscribers.write().retain(|sender| !sender.is_closed());
        }
    }

    /// Drops every subscription. Receivers see the end of the stream once
    /// they have drained what was already delivered.
    pub fn close(&self) {
        self.subscribers.write().clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the session lifecycle of one engine family. Beginning a session
/// cancels whatever session was active before it.
pub struct ScanController {
    channel: Channel,
    events: Arc<EventBus>,
    parent: Option<CancellationToken>,
    current: Mutex<Option<CancellationToken>>,
    paused: watch::Sender<bool>,
}

impl ScanController {
    pub fn new(channel: Channel, events: Arc<EventBus>) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            channel,
            events,
            parent: None,
            current: Mutex::new(None),
            paused,
        }
    }

    /// Sessions become children of `parent`: cancelling it stops the active
    /// session and every session begun afterwards starts cancelled.
    pub fn with_parent(mut self, parent: CancellationToken) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn begin(&self) -> ScanSession {
        let token = self
            .parent
            .as_ref()
            .map_or_else(CancellationToken::new, CancellationToken::child_token);
        {
            let mut current = self.current.lock();
            if let Some(previous) = current.replace(token.clone()) {
                previous.cancel();
            }
        }
        self.paused.send_replace(false);

        let session = ScanSession {
            id: Uuid::new_v4(),
            channel: self.channel,
            token,
            paused: self.paused.subscribe(),
            events: self.events.clone(),
            progress: Arc::new(Mutex::new(HashMap::new())),
        };
        debug!("Started {} session {}", self.channel, session.id);
        session
    }

    pub fn stop(&self) {
        if let Some(token) = self.current.lock().as_ref() {
            token.cancel();
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.send_replace(paused);
        info!("[{}] {}", self.channel, if paused { "paused" } else { "resumed" });
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// Log through the event sink without an active session.
    pub fn notice(&self, message: impl Into<String>) {
        publish_log(&self.events, self.channel, message.into());
    }
}

/// Per-session handle cloned into every worker of every stage.
#[derive(Clone)]
pub struct ScanSession {
    id: Uuid,
    channel: Channel,
    token: CancellationToken,
    paused: watch::Receiver<bool>,
    events: Arc<EventBus>,
    progress: Arc<Mutex<HashMap<Stage, f64>>>,
}

impl ScanSession {
    /// A session with no controller behind it, for one-shot library use.
    pub fn detached(channel: Channel, events: Arc<EventBus>) -> Self {
        let (_, paused) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            channel,
            token: CancellationToken::new(),
            paused,
            events,
            progress: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Blocks while the session is paused. Returns `true` when the session
    /// was cancelled, in which case the caller should stop dispatching.
    pub async fn wait_if_paused(&self) -> bool {
        let mut paused = self.paused.clone();
        loop {
            if self.token.is_cancelled() {
                return true;
            }
            if !*paused.borrow_and_update() {
                return false;
            }
            tokio::select! {
                _ = self.token.cancelled() => return true,
                changed = paused.changed() => {
                    if changed.is_err() {
                        return self.token.is_cancelled();
                    }
                }
            }
        }
    }

    pub fn log(&self, message: impl Into<String>) {
        publish_log(&self.events, self.channel, message.into());
    }

    /// Reports stage progress, clamped to [0, 100] and never lower than the
    /// last value reported for the same stage.
    pub fn progress(&self, stage: Stage, percent: f64) {
        let percent = if percent.is_nan() { 0.0 } else { percent.clamp(0.0, 100.0) };
        {
            let mut progress = self.progress.lock();
            let last = progress.entry(stage).or_insert(0.0);
            if percent < *last {
                return;
            }
            *last = percent;
        }
        self.events.publish(ScanEvent::Progress {
            channel: self.channel,
            stage,
            percent,
        });
    }

    pub fn publish(&self, event: ScanEvent) {
        self.events.publish(event);
    }

    pub fn complete(&self) {
        self.events.publish(ScanEvent::Complete {
            channel: self.channel,
        });
    }
}

fn publish_log(events: &EventBus, channel: Channel, message: String) {
    info!("[{}] {}", channel, message);
    events.publish(ScanEvent::Log {
        channel,
        message,
        time: chrono::Local::now().format("%H:%M:%S").to_string(),
    });
}
