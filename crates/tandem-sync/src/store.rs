//! Durable change log, peer state and document snapshots.
//!
//! Three backends implement `ChangeStore`:
//!   - **memory**: nothing touches disk (tests, ephemeral replicas).
//!   - **JSON** (default): `changes.jsonl` is append-only, one change per
//!     line; `peers.json` and `snapshot.json` are rewritten atomically via
//!     temp+rename.
//!   - **RocksDB** (behind the `rocksdb` feature): changes keyed
//!     `change/{actor}/{seq:020}`, metadata under `meta/`.
//!
//! The change log is the only authoritative state. Snapshots and the
//! divergence index are caches rebuilt from it. A record is acknowledged
//! once its line, newline included, is synced; a torn final line left by a
//! crash mid-append is dropped on open, anything else unparsable is
//! `CorruptLog`.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tandem_core::{TandemError, TandemResult};

use crate::change::Change;
use crate::clock::VectorClock;
use crate::document::Document;
use crate::peers::PeerRegistry;

/// Materialized documents plus the clock of the changes they include.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub clock: VectorClock,
    pub documents: Vec<Document>,
}

pub trait ChangeStore: Send {
    /// Every stored change, in storage order.
    fn load_changes(&self) -> TandemResult<Vec<Change>>;

    /// Durably append one change.
    fn append(&mut self, change: &Change) -> TandemResult<()>;

    fn load_peers(&self) -> TandemResult<PeerRegistry>;

    fn save_peers(&mut self, peers: &PeerRegistry) -> TandemResult<()>;

    fn load_snapshot(&self) -> TandemResult<Option<Snapshot>>;

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> TandemResult<()>;
}

// ── Memory ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryStore {
    changes: Vec<Change>,
    peers: PeerRegistry,
    snapshot: Option<Snapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChangeStore for MemoryStore {
    fn load_changes(&self) -> TandemResult<Vec<Change>> {
        Ok(self.changes.clone())
    }

    fn append(&mut self, change: &Change) -> TandemResult<()> {
        self.changes.push(change.clone());
        Ok(())
    }

    fn load_peers(&self) -> TandemResult<PeerRegistry> {
        Ok(self.peers.clone())
    }

    fn save_peers(&mut self, peers: &PeerRegistry) -> TandemResult<()> {
        self.peers = peers.clone();
        Ok(())
    }

    fn load_snapshot(&self) -> TandemResult<Option<Snapshot>> {
        Ok(self.snapshot.clone())
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> TandemResult<()> {
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }
}

// ── JSON files ────────────────────────────────────────────────────────────────

pub struct JsonStore {
    dir: PathBuf,
    log: File,
}

impl JsonStore {
    const CHANGES: &'static str = "changes.jsonl";
    const PEERS: &'static str = "peers.json";
    const SNAPSHOT: &'static str = "snapshot.json";

    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: &Path) -> TandemResult<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating data dir: {}", dir.display()))?;
        let log_path = dir.join(Self::CHANGES);
        if log_path.exists() {
            repair_tail(&log_path)?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("opening change log: {}", log_path.display()))?;
        Ok(JsonStore {
            dir: dir.to_path_buf(),
            log,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_json<T: for<'de> Deserialize<'de>>(&self, name: &str) -> TandemResult<Option<T>> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let value = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(value))
    }

    /// Atomic write: temp file, then rename over the target.
    fn write_json<T: Serialize>(&self, name: &str, value: &T) -> TandemResult<()> {
        let path = self.dir.join(name);
        let json = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing {name}"))?;
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, &json)
            .with_context(|| format!("writing temp file: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("renaming to {}", path.display()))?;
        Ok(())
    }
}

impl ChangeStore for JsonStore {
    fn load_changes(&self) -> TandemResult<Vec<Change>> {
        let path = self.dir.join(Self::CHANGES);
        let file = File::open(&path)
            .with_context(|| format!("opening change log: {}", path.display()))?;

        let mut changes = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("reading {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let change: Change = serde_json::from_str(&line).map_err(|e| {
                TandemError::CorruptLog(format!("{} line {}: {e}", path.display(), n + 1))
            })?;
            changes.push(change);
        }
        Ok(changes)
    }

    fn append(&mut self, change: &Change) -> TandemResult<()> {
        let mut line = serde_json::to_vec(change)
            .map_err(|e| TandemError::Codec(format!("encoding change {}: {e}", change.id)))?;
        line.push(b'\n');
        let len = self
            .log
            .metadata()
            .with_context(|| format!("appending change {}", change.id))?
            .len();
        if let Err(e) = self.log.write_all(&line).and_then(|()| self.log.sync_data()) {
            // Leave no partial bytes for the next append to land on.
            if let Err(trunc) = self.log.set_len(len) {
                tracing::warn!(dir = %self.dir.display(), "truncating failed append: {trunc}");
            }
            return Err(anyhow::Error::new(e)
                .context(format!("appending change {}", change.id))
                .into());
        }
        Ok(())
    }

    fn load_peers(&self) -> TandemResult<PeerRegistry> {
        Ok(self.read_json(Self::PEERS)?.unwrap_or_default())
    }

    fn save_peers(&mut self, peers: &PeerRegistry) -> TandemResult<()> {
        self.write_json(Self::PEERS, peers)
    }

    fn load_snapshot(&self) -> TandemResult<Option<Snapshot>> {
        // A snapshot is a cache: an unreadable one is rebuilt from the log.
        match self.read_json(Self::SNAPSHOT) {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), "ignoring unreadable snapshot: {e}");
                Ok(None)
            }
        }
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> TandemResult<()> {
        self.write_json(Self::SNAPSHOT, snapshot)
    }
}

/// Drop a final line that lost its newline in a crash, unless it still
/// parses whole, in which case the newline is restored.
fn repair_tail(path: &Path) -> anyhow::Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("opening change log: {}", path.display()))?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(());
    }

    let start = last_line_start(&mut file, len)?;
    let mut tail = Vec::new();
    file.seek(SeekFrom::Start(start))?;
    file.read_to_end(&mut tail)?;
    if serde_json::from_slice::<Change>(&tail).is_ok() {
        file.seek(SeekFrom::End(0))?;
        file.write_all(b"\n")?;
        tracing::warn!(path = %path.display(), "change log ended without a newline, restored it");
    } else {
        file.set_len(start)?;
        tracing::warn!(
            path = %path.display(),
            dropped_bytes = len - start,
            "dropped a partially written record at the end of the change log"
        );
    }
    file.sync_data()
        .with_context(|| format!("syncing {}", path.display()))
}

/// Offset just past the last newline before `len`, or 0.
fn last_line_start(file: &mut File, len: u64) -> std::io::Result<u64> {
    let mut buf = [0u8; 8192];
    let mut end = len;
    while end > 0 {
        let start = end.saturating_sub(buf.len() as u64);
        let n = (end - start) as usize;
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut buf[..n])?;
        if let Some(i) = buf[..n].iter().rposition(|&b| b == b'\n') {
            return Ok(start + i as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}

// ── RocksDB ───────────────────────────────────────────────────────────────────

#[cfg(feature = "rocksdb")]
pub use rocksdb_backend::RocksStore;

#[cfg(feature = "rocksdb")]
mod rocksdb_backend {
    use super::*;

    const CHANGE_PREFIX: &str = "change/";
    const PEERS_KEY: &str = "meta/peers";
    const SNAPSHOT_KEY: &str = "meta/snapshot";

    /// Write-through RocksDB store; the WAL provides durability.
    pub struct RocksStore {
        db: rocksdb::DB,
    }

    impl RocksStore {
        pub fn open(db_path: &Path) -> TandemResult<Self> {
            let mut opts = rocksdb::Options::default();
            opts.create_if_missing(true);
            let db = rocksdb::DB::open(&opts, db_path)
                .with_context(|| format!("opening RocksDB: {}", db_path.display()))?;
            Ok(RocksStore { db })
        }

        fn get_json<T: for<'de> Deserialize<'de>>(&self, key: &str) -> TandemResult<Option<T>> {
            let Some(bytes) = self
                .db
                .get(key.as_bytes())
                .with_context(|| format!("reading {key}"))?
            else {
                return Ok(None);
            };
            let value =
                serde_json::from_slice(&bytes).with_context(|| format!("parsing {key}"))?;
            Ok(Some(value))
        }

        fn put_json<T: Serialize>(&self, key: &str, value: &T) -> TandemResult<()> {
            let json = serde_json::to_vec(value).with_context(|| format!("serializing {key}"))?;
            self.db
                .put(key.as_bytes(), json)
                .with_context(|| format!("writing {key}"))?;
            Ok(())
        }
    }

    pub(super) fn change_key(change: &Change) -> String {
        format!("{CHANGE_PREFIX}{}/{:020}", change.id.actor, change.id.seq)
    }

    impl ChangeStore for RocksStore {
        fn load_changes(&self) -> TandemResult<Vec<Change>> {
            let mut changes = Vec::new();
            let iter = self.db.iterator(rocksdb::IteratorMode::From(
                CHANGE_PREFIX.as_bytes(),
                rocksdb::Direction::Forward,
            ));
            for item in iter {
                let (key, value) = item.context("iterating change log")?;
                if !key.starts_with(CHANGE_PREFIX.as_bytes()) {
                    break;
                }
                let change: Change = serde_json::from_slice(&value).map_err(|e| {
                    TandemError::CorruptLog(format!(
                        "entry {}: {e}",
                        String::from_utf8_lossy(&key)
                    ))
                })?;
                changes.push(change);
            }
            Ok(changes)
        }

        fn append(&mut self, change: &Change) -> TandemResult<()> {
            let key = change_key(change);
            let json = serde_json::to_vec(change)
                .map_err(|e| TandemError::Codec(format!("encoding change {}: {e}", change.id)))?;
            self.db
                .put(key.as_bytes(), json)
                .with_context(|| format!("writing {key}"))?;
            Ok(())
        }

        fn load_peers(&self) -> TandemResult<PeerRegistry> {
            Ok(self.get_json(PEERS_KEY)?.unwrap_or_default())
        }

        fn save_peers(&mut self, peers: &PeerRegistry) -> TandemResult<()> {
            self.put_json(PEERS_KEY, peers)
        }

        fn load_snapshot(&self) -> TandemResult<Option<Snapshot>> {
            self.get_json(SNAPSHOT_KEY)
        }

        fn save_snapshot(&mut self, snapshot: &Snapshot) -> TandemResult<()> {
            self.put_json(SNAPSHOT_KEY, snapshot)
        }
    }
}

/// Open the backend named by `[replica] store`.
pub fn open_store(kind: &str, dir: &Path) -> TandemResult<Box<dyn ChangeStore>> {
    match kind {
        "json" => Ok(Box::new(JsonStore::open(dir)?)),
        "memory" => Ok(Box::new(MemoryStore::new())),
        #[cfg(feature = "rocksdb")]
        "rocksdb" => Ok(Box::new(RocksStore::open(&dir.join("changes.rocksdb"))?)),
        other => Err(TandemError::Config(format!(
            "unknown change store '{other}' (expected json, memory{})",
            if cfg!(feature = "rocksdb") { ", rocksdb" } else { "" }
        ))),
    }
}
