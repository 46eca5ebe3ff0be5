//! Local transfer engine: torrents whose pieces are verified against files under the
//! download directory. Peer transfer itself is out of scope; the engine keeps the
//! per-piece state and priorities the core reads and writes.

use std::{
    collections::HashMap,
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, RwLock};
use sha1::{Digest, Sha1};
use skiff_core::{TorrentHandle, TorrentLayout, TransferEngine};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::metainfo::Metainfo;

pub struct LocalEngine {
    listen_addr: RwLock<String>,
    shutdown: watch::Sender<bool>,
    torrents: RwLock<HashMap<String, Arc<LocalTorrent>>>,
}

impl LocalEngine {
    pub fn new(listen_addr: String) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            listen_addr: RwLock::new(listen_addr),
            shutdown,
            torrents: RwLock::new(HashMap::new()),
        })
    }

    /// Trips the shutdown signal observed by background tasks.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn insert(&self, torrent: Arc<LocalTorrent>) {
        self.torrents.write().insert(torrent.info_hash(), torrent);
    }

    pub fn get(&self, info_hash: &str) -> Option<Arc<LocalTorrent>> {
        self.torrents.read().get(info_hash).cloned()
    }

    pub fn remove(&self, info_hash: &str) -> Option<Arc<LocalTorrent>> {
        self.torrents.write().remove(info_hash)
    }
}

impl TransferEngine for LocalEngine {
    fn listen_addr(&self) -> String {
        self.listen_addr.read().clone()
    }

    fn set_listen_addr(&self, addr: &str) {
        *self.listen_addr.write() = addr.to_string();
    }

    fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

pub struct LocalTorrent {
    meta: Metainfo,
    root: PathBuf,
    verified: RwLock<Vec<bool>>,
    wanted: Mutex<Vec<bool>>,
    active: AtomicBool,
}

impl LocalTorrent {
    /// Content is expected under `root`, nothing is verified yet.
    pub fn new(meta: Metainfo, root: impl Into<PathBuf>) -> Self {
        let n = meta.piece_hashes.len();
        Self {
            meta,
            root: root.into(),
            verified: RwLock::new(vec![false; n]),
            wanted: Mutex::new(vec![true; n]),
            active: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn wanted_pieces(&self) -> Vec<usize> {
        self.wanted
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, w)| **w)
            .map(|(i, _)| i)
            .collect()
    }

    fn piece_range(&self, piece: usize) -> (u64, u64) {
        let start = piece as u64 * self.meta.piece_length;
        let end = start.saturating_add(self.meta.piece_length).min(self.meta.total_length);
        (start, end)
    }

    /// Reads the piece from disk and compares its SHA-1. Missing or short files read as
    /// not verified.
    fn verify_piece(&self, piece: usize) -> io::Result<bool> {
        let Some(expected) = self.meta.piece_hashes.get(piece) else {
            return Ok(false);
        };
        let (start, end) = self.piece_range(piece);
        let mut hasher = Sha1::new();
        let mut buf = Vec::new();

        for file in &self.meta.files {
            let file_end = file.offset + file.length;
            if file_end <= start || file.offset >= end {
                continue;
            }
            let from = start.max(file.offset);
            let to = end.min(file_end);
            if !read_segment(&self.root.join(&file.path), from - file.offset, to - from, &mut buf)? {
                return Ok(false);
            }
            hasher.update(&buf);
        }
        Ok(hasher.finalize().as_slice() == expected.as_slice())
    }

    /// Verifies every piece and returns the ones that became complete. Blocking.
    pub fn recheck(&self) -> io::Result<Vec<usize>> {
        let mut fresh = Vec::new();
        let mut results = Vec::with_capacity(self.meta.piece_hashes.len());
        for piece in 0..self.meta.piece_hashes.len() {
            results.push(self.verify_piece(piece)?);
        }
        let mut verified = self.verified.write();
        for (piece, ok) in results.into_iter().enumerate() {
            if ok && !verified[piece] {
                fresh.push(piece);
            }
            verified[piece] = ok;
        }
        info!(
            "{}: {} of {} pieces verified",
            self.meta.name,
            verified.iter().filter(|v| **v).count(),
            verified.len()
        );
        Ok(fresh)
    }
}

/// Fills `buf` with `len` bytes at `offset`. `Ok(false)` when the file is absent or short.
fn read_segment(path: &Path, offset: u64, len: u64, buf: &mut Vec<u8>) -> io::Result<bool> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    file.seek(SeekFrom::Start(offset))?;
    buf.clear();
    buf.resize(len as usize, 0);
    match file.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

impl TorrentHandle for LocalTorrent {
    fn info_hash(&self) -> String {
        self.meta.info_hash.clone()
    }

    fn layout(&self) -> Option<TorrentLayout> {
        Some(TorrentLayout {
            piece_length: self.meta.piece_length,
            files: self.meta.files.clone(),
        })
    }

    fn num_pieces(&self) -> usize {
        self.meta.piece_hashes.len()
    }

    fn piece_length(&self, piece: usize) -> u64 {
        if piece >= self.num_pieces() {
            return 0;
        }
        let (start, end) = self.piece_range(piece);
        end - start
    }

    fn piece_bytes_completed(&self, piece: usize) -> u64 {
        match self.verified.read().get(piece) {
            Some(true) => self.piece_length(piece),
            _ => 0,
        }
    }

    fn download_pieces(&self, begin: usize, end: usize) {
        let mut wanted = self.wanted.lock();
        let end = end.min(wanted.len());
        for w in wanted.iter_mut().take(end).skip(begin) {
            *w = true;
        }
    }

    fn cancel_pieces(&self, begin: usize, end: usize) {
        let mut wanted = self.wanted.lock();
        let end = end.min(wanted.len());
        for w in wanted.iter_mut().take(end).skip(begin) {
            *w = false;
        }
    }

    fn update_piece_priorities(&self) {
        let wanted = self.wanted.lock().iter().filter(|w| **w).count();
        debug!("{}: {} pieces wanted", self.meta.name, wanted);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}
