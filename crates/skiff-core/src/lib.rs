//! Skiff Core: per-file selection tracking and port forwarding for the Skiff daemon.
//!
//! The transfer engine and the NAT gateways are collaborators behind the traits declared
//! here. This crate only consumes their results (piece completion, mapping replies) and
//! issues commands to them (piece priorities, listen address).

mod activity;
mod files;
mod pieces;
mod portmap;

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub use activity::{
    activity, record_piece_completed, torrent_started, torrent_stopped, ActivityState,
    ActivityStats,
};
pub use files::{file_count, files, get_file, rename_file, set_file_check};
pub use pieces::{completion_bounds, file_completion, pending_bitmap, pending_bounds, pending_bytes};
pub use portmap::{
    check_external_reachable, commit_listen_addr, negotiate, reconcile, refresh_port_mapping,
    start_port_mapping_loop, stop_port_mapping_loop,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub check: bool,
    pub path: String,
    pub length: u64,
    pub bytes_completed: u64,
}

/// One file of a torrent as laid out in the engine's logical byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpan {
    pub path: String,
    pub offset: u64,
    pub length: u64,
}

/// Static metadata of a torrent. Files are index-aligned with the engine's file list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentLayout {
    pub piece_length: u64,
    pub files: Vec<FileSpan>,
}

/// A single torrent inside the transfer engine.
pub trait TorrentHandle: Send + Sync {
    /// Content identifier (hex info hash) used as the registry key.
    fn info_hash(&self) -> String;
    /// `None` while the engine has no metadata for the torrent yet.
    fn layout(&self) -> Option<TorrentLayout>;
    fn num_pieces(&self) -> usize;
    fn piece_length(&self, piece: usize) -> u64;
    fn piece_bytes_completed(&self, piece: usize) -> u64;
    /// Request download priority for pieces in `[begin, end)`.
    fn download_pieces(&self, begin: usize, end: usize);
    /// Drop download priority for pieces in `[begin, end)`.
    fn cancel_pieces(&self, begin: usize, end: usize);
    fn update_piece_priorities(&self);
    /// Whether the engine is currently transferring this torrent.
    fn is_active(&self) -> bool;
}

/// Process-wide engine settings this crate reads and writes.
pub trait TransferEngine: Send + Sync {
    fn listen_addr(&self) -> String;
    fn set_listen_addr(&self, addr: &str);
    /// Flips to `true` once the engine is shutting down.
    fn shutdown_signal(&self) -> tokio::sync::watch::Receiver<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
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

/// A NAT gateway found by discovery. Only borrowed for the duration of a negotiation.
#[async_trait]
pub trait NatDevice: Send + Sync {
    /// Human readable identifier used in logs.
    fn name(&self) -> String;
    async fn external_ip(&self) -> Result<IpAddr, NatError>;
    /// Returns the external port the gateway assigned. `external_port == 0` lets the
    /// gateway pick one.
    async fn add_port_mapping(
        &self,
        protocol: Protocol,
        internal_port: u16,
        external_port: u16,
        description: &str,
        lease: Duration,
    ) -> Result<u16, NatError>;
}

#[async_trait]
pub trait NatDiscovery: Send + Sync {
    async fn discover(&self, timeout: Duration) -> Vec<Arc<dyn NatDevice>>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("torrent not found: {0}")]
    TorrentNotFound(String),

    #[error("file index {index} out of range ({count} files)")]
    FileIndexOutOfRange { index: usize, count: usize },

    #[error("torrent metadata is not available yet")]
    MetadataUnavailable,

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("invalid listen address: {0}")]
    InvalidListenAddr(String),

    #[error("torrent already registered: {0}")]
    AlreadyRegistered(String),

    #[error("maximum number of torrents ({0}) reached")]
    TooManyTorrents(usize),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NatError {
    #[error("gateway rejected the mapping: {0}")]
    Mapping(String),

    #[error("external address lookup failed: {0}")]
    ExternalIp(String),

    #[error("gateway did not answer in time")]
    Timeout,
}

/// Externally forwarded addresses (`host:port`), one per transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub tcp: Option<String>,
    pub udp: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PortMappingSettings {
    pub refresh_interval: Duration,
    pub discovery_timeout: Duration,
    /// Upper bound for each individual gateway call.
    pub call_timeout: Duration,
    /// The probed port is appended to this URL.
    pub port_check_url: String,
    pub description: String,
}

impl PortMappingSettings {
    pub fn lease(&self) -> Duration {
        self.refresh_interval * 2
    }
}

impl Default for PortMappingSettings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
            discovery_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(5),
            port_check_url: "http://portcheck.transmissionbt.com/".to_string(),
            description: "skiff".to_string(),
        }
    }
}

/// Per-torrent selection and activity bookkeeping.
#[derive(Debug, Clone, Default)]
pub(crate) struct FileTrackingState {
    /// Empty until first needed, then one flag per file.
    pub(crate) checks: Vec<bool>,
    pub(crate) files_snapshot: Vec<FileRecord>,
    pub(crate) completed_bitmap: BTreeSet<usize>,
    pub(crate) completed_date: i64,
    pub(crate) seeding_time: i64,
    pub(crate) downloading_time: i64,
    pub(crate) activate_date: i64,
    /// A start has been booked and not yet closed by a stop.
    pub(crate) running: bool,
}

pub(crate) struct TorrentRecord {
    pub(crate) handle: Arc<dyn TorrentHandle>,
    pub(crate) tracking: FileTrackingState,
}

pub const MAX_TORRENTS: usize = 10000;

pub struct CoreState {
    started_at: Instant,
    pub(crate) engine: Arc<dyn TransferEngine>,
    pub(crate) torrents: HashMap<String, TorrentRecord>,
    pub(crate) ports: PortMapping,
    /// Address the engine binds locally; advertised when nothing is forwarded.
    pub(crate) local_listen_addr: String,
    pub(crate) settings: PortMappingSettings,
    pub(crate) refresher: Option<portmap::RefresherHandle>,
    /// Serializes reconciliation cycles. Held across gateway calls, unlike the state lock.
    pub(crate) reconcile_gate: Arc<tokio::sync::Mutex<()>>,
}

impl CoreState {
    pub fn settings(&self) -> &PortMappingSettings {
        &self.settings
    }

    pub fn local_listen_addr(&self) -> &str {
        &self.local_listen_addr
    }

    pub(crate) fn record_mut(&mut self, info_hash: &str) -> Result<&mut TorrentRecord, CoreError> {
        self.torrents
            .get_mut(info_hash)
            .ok_or_else(|| CoreError::TorrentNotFound(info_hash.to_string()))
    }

    pub(crate) fn record(&self, info_hash: &str) -> Result<&TorrentRecord, CoreError> {
        self.torrents
            .get(info_hash)
            .ok_or_else(|| CoreError::TorrentNotFound(info_hash.to_string()))
    }
}

pub type SharedState = Arc<tokio::sync::Mutex<CoreState>>;

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs() as i64
}

/// Builds the shared context. The engine's listen address at this point is taken as the
/// local address to fall back to when no port is forwarded.
pub fn new_state(engine: Arc<dyn TransferEngine>, settings: PortMappingSettings) -> SharedState {
    let local_listen_addr = engine.listen_addr();
    Arc::new(tokio::sync::Mutex::new(CoreState {
        started_at: Instant::now(),
        engine,
        torrents: HashMap::new(),
        ports: PortMapping::default(),
        local_listen_addr,
        settings,
        refresher: None,
        reconcile_gate: Arc::new(tokio::sync::Mutex::new(())),
    }))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    pub ok: bool,
    pub uptime_sec: u64,
    pub torrents: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub version: String,
}

pub fn health(state: &CoreState) -> Health {
    Health {
        ok: true,
        uptime_sec: state.started_at.elapsed().as_secs(),
        torrents: state.torrents.len(),
    }
}

pub fn version() -> Version {
    Version {
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

pub fn add_torrent(state: &mut CoreState, handle: Arc<dyn TorrentHandle>) -> Result<String, CoreError> {
    add_torrent_at(state, handle, now_secs())
}

pub(crate) fn add_torrent_at(
    state: &mut CoreState,
    handle: Arc<dyn TorrentHandle>,
    now: i64,
) -> Result<String, CoreError> {
    if state.torrents.len() >= MAX_TORRENTS {
        return Err(CoreError::TooManyTorrents(MAX_TORRENTS));
    }
    let info_hash = handle.info_hash();
    if state.torrents.contains_key(&info_hash) {
        return Err(CoreError::AlreadyRegistered(info_hash));
    }
    let tracking = FileTrackingState {
        activate_date: now,
        running: handle.is_active(),
        ..Default::default()
    };
    state
        .torrents
        .insert(info_hash.clone(), TorrentRecord { handle, tracking });
    info!("Registered torrent {}", info_hash);
    Ok(info_hash)
}

pub fn remove_torrent(state: &mut CoreState, info_hash: &str) -> Result<(), CoreError> {
    state
        .torrents
        .remove(info_hash)
        .ok_or_else(|| CoreError::TorrentNotFound(info_hash.to_string()))?;
    info!("Removed torrent {}", info_hash);
    Ok(())
}

pub fn list_torrents(state: &CoreState) -> Vec<String> {
    let mut out: Vec<String> = state.torrents.keys().cloned().collect();
    out.sort();
    out
}

pub fn port_mapping(state: &CoreState) -> PortMapping {
    state.ports.clone()
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory collaborators shared by the unit tests.

    use super::*;
    use parking_lot::Mutex;

    pub struct MockTorrent {
        pub hash: String,
        pub layout: Mutex<Option<TorrentLayout>>,
        pub total_len: u64,
        pub completed: Mutex<Vec<u64>>,
        pub priorities: Mutex<Vec<bool>>,
        pub calls: Mutex<Vec<String>>,
        pub active: Mutex<bool>,
    }

    impl MockTorrent {
        /// Files are laid out back to back in the order given.
        pub fn new(piece_length: u64, file_lengths: &[u64]) -> Self {
            let mut offset = 0;
            let mut files = Vec::new();
            for (i, len) in file_lengths.iter().enumerate() {
                files.push(FileSpan {
                    path: format!("dir/file{}.bin", i),
                    offset,
                    length: *len,
                });
                offset += len;
            }
            let num_pieces = offset.div_ceil(piece_length) as usize;
            Self {
                hash: "ab".repeat(20),
                layout: Mutex::new(Some(TorrentLayout { piece_length, files })),
                total_len: offset,
                completed: Mutex::new(vec![0; num_pieces]),
                priorities: Mutex::new(vec![true; num_pieces]),
                calls: Mutex::new(Vec::new()),
                active: Mutex::new(true),
            }
        }

        pub fn without_metadata(mut self) -> Self {
            self.layout = Mutex::new(None);
            self
        }

        pub fn complete_piece(&self, piece: usize) {
            let len = self.piece_length(piece);
            self.completed.lock()[piece] = len;
        }

        pub fn complete_all(&self) {
            for p in 0..self.num_pieces() {
                self.complete_piece(p);
            }
        }

        pub fn prioritized(&self) -> Vec<usize> {
            self.priorities
                .lock()
                .iter()
                .enumerate()
                .filter(|(_, on)| **on)
                .map(|(i, _)| i)
                .collect()
        }
    }

    impl TorrentHandle for MockTorrent {
        fn info_hash(&self) -> String {
            self.hash.clone()
        }

        fn layout(&self) -> Option<TorrentLayout> {
            self.layout.lock().clone()
        }

        fn num_pieces(&self) -> usize {
            self.completed.lock().len()
        }

        fn piece_length(&self, piece: usize) -> u64 {
            let Some(layout) = self.layout.lock().clone() else {
                return 0;
            };
            let start = piece as u64 * layout.piece_length;
            layout.piece_length.min(self.total_len.saturating_sub(start))
        }

        fn piece_bytes_completed(&self, piece: usize) -> u64 {
            self.completed.lock().get(piece).copied().unwrap_or(0)
        }

        fn download_pieces(&self, begin: usize, end: usize) {
            self.calls.lock().push(format!("download {}..{}", begin, end));
            let mut prio = self.priorities.lock();
            for p in begin..end.min(prio.len()) {
                prio[p] = true;
            }
        }

        fn cancel_pieces(&self, begin: usize, end: usize) {
            self.calls.lock().push(format!("cancel {}..{}", begin, end));
            let mut prio = self.priorities.lock();
            for p in begin..end.min(prio.len()) {
                prio[p] = false;
            }
        }

        fn update_piece_priorities(&self) {
            self.calls.lock().push("update".to_string());
        }

        fn is_active(&self) -> bool {
            *self.active.lock()
        }
    }

    pub struct MockEngine {
        pub addr: Mutex<String>,
        pub writes: Mutex<Vec<String>>,
        pub shutdown: tokio::sync::watch::Sender<bool>,
    }

    impl MockEngine {
        pub fn new(addr: &str) -> Arc<Self> {
            let (shutdown, _) = tokio::sync::watch::channel(false);
            Arc::new(Self {
                addr: Mutex::new(addr.to_string()),
                writes: Mutex::new(Vec::new()),
                shutdown,
            })
        }
    }

    impl TransferEngine for MockEngine {
        fn listen_addr(&self) -> String {
            self.addr.lock().clone()
        }

        fn set_listen_addr(&self, addr: &str) {
            self.writes.lock().push(addr.to_string());
            *self.addr.lock() = addr.to_string();
        }

        fn shutdown_signal(&self) -> tokio::sync::watch::Receiver<bool> {
            self.shutdown.subscribe()
        }
    }

    pub fn state_with(engine: Arc<MockEngine>) -> SharedState {
        new_state(engine, PortMappingSettings::default())
    }
}
