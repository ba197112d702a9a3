//! Versioned host table, the node's authoritative copy of the cluster state.
//!
//! Last-writer-wins by version: a candidate replaces the stored entry only
//! when its version is strictly greater. Equal versions keep what is
//! already stored, so re-applying an update is a no-op.
//!
//! The table always holds a sync-marker entry under SYNC_MARKER_ADDRESS.
//! It goes through the same merge path as everything else but is hidden
//! from `entries()` and `by_table()`, and merging it never reports a
//! domain change.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tblsync_core::entry::{HostEntry, SYNC_MARKER_ADDRESS};

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to decode host table: {0}")]
    DecodeFailed(serde_json::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to encode host table: {0}")]
    EncodeFailed(serde_json::Error),
    #[error("host table has no storage path")]
    NoStoragePath,
}

/// Table-name → member IPs, sorted for stable export.
pub type TableMembership = BTreeMap<String, BTreeSet<String>>;

pub struct VersionedTable {
    path: Option<PathBuf>,
    entries: BTreeMap<String, HostEntry>,
}

impl Default for VersionedTable {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionedTable {
    /// An in-memory table holding only the sync marker.
    pub fn new() -> Self {
        let mut table = Self {
            path: None,
            entries: BTreeMap::new(),
        };
        table.seed_sync_marker();
        table
    }

    /// An empty table that commits to `path`. Nothing is read.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        let mut table = Self::new();
        table.path = Some(path.into());
        table
    }

    /// Load the table stored at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TableError> {
        let mut table = Self::with_path(path);
        table.load()?;
        Ok(table)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Replace the whole table with the contents of the storage file.
    pub fn load(&mut self) -> Result<&mut Self, TableError> {
        let path = self.path.clone().ok_or(TableError::NoStoragePath)?;
        let bytes = fs::read(&path).map_err(|e| TableError::ReadFailed(path.clone(), e))?;
        self.load_from(bytes.as_slice())?;
        tracing::debug!(path = %path.display(), entries = self.entries.len(), "host table loaded");
        Ok(self)
    }

    /// Replace the whole table with records decoded from `reader`.
    ///
    /// On error the current contents are left untouched.
    pub fn load_from<R: Read>(&mut self, reader: R) -> Result<(), TableError> {
        let decoded: Vec<HostEntry> =
            serde_json::from_reader(reader).map_err(TableError::DecodeFailed)?;
        self.entries = decoded
            .into_iter()
            .map(|entry| (entry.physical_address.clone(), entry))
            .collect();
        self.seed_sync_marker();
        Ok(())
    }

    /// Merge a candidate entry.
    ///
    /// Returns true when the candidate was stored and is a domain entry,
    /// i.e. it is new state worth gossiping onward.
    pub fn update(&mut self, candidate: HostEntry) -> bool {
        if let Some(stored) = self.entries.get(&candidate.physical_address) {
            if candidate.version <= stored.version {
                return false;
            }
        }
        let is_marker = candidate.is_sync_marker();
        self.entries
            .insert(candidate.physical_address.clone(), candidate);
        !is_marker
    }

    /// Drop every entry whose `purge_at` has passed.
    pub fn purge(&mut self) -> bool {
        self.purge_expired(SystemTime::now())
    }

    /// Drop every entry with `purge_at <= now`. Returns whether any went.
    ///
    /// The sync marker is never purged, whatever its `purge_at`.
    pub fn purge_expired(&mut self, now: SystemTime) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.is_sync_marker() || !entry.is_expired(now));
        let removed = before - self.entries.len();
        if removed > 0 {
            tracing::debug!(removed, "purged expired host entries");
        }
        removed > 0
    }

    /// Persist every entry, the sync marker included, to the storage file.
    ///
    /// Writes are atomic: write to temp file, then rename.
    pub fn commit(&self) -> Result<(), TableError> {
        let path = self.path.as_ref().ok_or(TableError::NoStoragePath)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| TableError::WriteFailed(parent.to_path_buf(), e))?;
            }
        }

        let tmp_path = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)
                .map_err(|e| TableError::WriteFailed(tmp_path.clone(), e))?;
            self.commit_to(&mut file)?;
            file.sync_all()
                .map_err(|e| TableError::WriteFailed(tmp_path.clone(), e))?;
        }
        fs::rename(&tmp_path, path).map_err(|e| TableError::WriteFailed(path.clone(), e))?;

        tracing::trace!(path = %path.display(), entries = self.entries.len(), "host table committed");
        Ok(())
    }

    /// Write every entry as a pretty-printed JSON array.
    pub fn commit_to<W: Write>(&self, mut writer: W) -> Result<(), TableError> {
        let all: Vec<&HostEntry> = self.entries.values().collect();
        serde_json::to_writer_pretty(&mut writer, &all).map_err(TableError::EncodeFailed)?;
        writer
            .write_all(b"\n")
            .map_err(|e| TableError::EncodeFailed(serde_json::Error::io(e)))
    }

    /// Domain entries, sync marker excluded.
    pub fn entries(&self) -> impl Iterator<Item = &HostEntry> {
        self.entries.values().filter(|entry| !entry.is_sync_marker())
    }

    pub fn find_by_physical_address(&self, physical_address: &str) -> Option<&HostEntry> {
        self.entries.get(physical_address)
    }

    /// For every table name, the union of member entries' IP addresses.
    pub fn by_table(&self) -> TableMembership {
        let mut membership = TableMembership::new();
        for entry in self.entries() {
            for table in &entry.tables {
                membership
                    .entry(table.clone())
                    .or_default()
                    .extend(entry.ip_addresses.iter().cloned());
            }
        }
        membership
    }

    /// The sync marker's version.
    pub fn db_version(&self) -> i64 {
        self.entries
            .get(SYNC_MARKER_ADDRESS)
            .map(|marker| marker.version)
            .unwrap_or(-1)
    }

    /// Advance the sync marker by one. Called by the driver after a
    /// domain update was accepted.
    pub fn bump_sync_marker(&mut self) -> i64 {
        let mut marker = self
            .entries
            .get(SYNC_MARKER_ADDRESS)
            .cloned()
            .unwrap_or_else(HostEntry::sync_marker);
        marker.version += 1;
        let version = marker.version;
        self.update(marker);
        version
    }

    /// Number of domain entries.
    pub fn len(&self) -> usize {
        self.entries().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn seed_sync_marker(&mut self) {
        self.update(HostEntry::sync_marker());
    }
}
