//! Durable node state.
//!
//! Each node owns one state file, `<data_dir>/<node_id>.state`, holding the
//! current term, the vote, the last known leader and the full log as a
//! single JSON document. The file is rewritten atomically (temp file,
//! fsync, rename) after every mutating operation and read once at startup.
//! A CRC32 trailer detects partial writes.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ReplogError, Result};
use crate::raft::state::LogEntry;

/// The durable portion of a node's Raft state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub leader_id: Option<String>,
    pub entries: Vec<LogEntry>,
}

/// CRC32 (IEEE polynomial)
fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFFFFFF;
    for byte in data {
        crc ^= *byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB88320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// Handle to a node's state file.
#[derive(Debug)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    /// Open the state file for `node_id` under `data_dir`, creating the
    /// directory if needed. The file itself is created on first save.
    pub fn new<P: AsRef<Path>>(data_dir: P, node_id: &str) -> Result<Self> {
        let dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            path: dir.join(format!("{}.state", node_id)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted state, or `None` if no state has been saved yet.
    pub fn load(&self) -> Result<Option<PersistedState>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path)?;
        let content = content.trim();
        if content.is_empty() {
            return Ok(None);
        }

        // Format: "{json} {crc32_hex}"
        let (json, checksum_str) = content.rsplit_once(' ').ok_or_else(|| {
            ReplogError::Corruption(format!("{:?}: missing checksum", self.path))
        })?;

        let stored = u32::from_str_radix(checksum_str, 16).map_err(|_| {
            ReplogError::Corruption(format!("{:?}: invalid checksum format", self.path))
        })?;
        let computed = crc32(json.as_bytes());
        if stored != computed {
            return Err(ReplogError::Corruption(format!(
                "{:?}: checksum mismatch, stored {:08x}, computed {:08x}",
                self.path, stored, computed
            )));
        }

        let state: PersistedState = serde_json::from_str(json)
            .map_err(|e| ReplogError::Corruption(format!("{:?}: {}", self.path, e)))?;
        Ok(Some(state))
    }

    /// Write the state durably: serialize with a checksum trailer, write to
    /// a temp file, fsync, then rename over the previous version.
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        let json = serde_json::to_string(state)
            .map_err(|e| ReplogError::Internal(format!("state serialization failed: {}", e)))?;
        let content = format!("{} {:08x}\n", json, crc32(json.as_bytes()));

        let temp_path = self.path.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, &self.path)?;

        Ok(())
    }
}
