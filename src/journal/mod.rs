//! Append-only deployment journal
//!
//! Records are `u32` little-endian length prefixes followed by JSON payloads,
//! appended to `deployd.j001` in the journal directory. Writes optionally
//! rotate backups (`j002`..`jNNN`) and fsync on a time- or write-triggered
//! policy. Replay reads the intact prefix of the log and stops quietly at the
//! first short read or parse failure; a truncated tail is treated as a
//! normal shutdown artifact, not an error.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::errors::AgentError;

const JOURNAL_BASE: &str = "deployd.j";

fn default_filepath() -> PathBuf {
    PathBuf::from("/var/lib/deployd/")
}

fn default_sync_interval() -> u64 {
    300
}

fn default_backup_interval() -> u64 {
    3600
}

fn default_max_backups() -> u64 {
    10
}

/// Journal settings, nested under the `journal` key of the server
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    #[serde(default = "default_filepath")]
    pub filepath: PathBuf,

    #[serde(default, rename = "sync-on-write")]
    pub sync_on_write: bool,

    /// Seconds between forced fsyncs when `sync-on-write` is off
    #[serde(default = "default_sync_interval", rename = "sync-interval")]
    pub sync_interval: u64,

    #[serde(default, rename = "backup-on-write")]
    pub backup_on_write: bool,

    /// Seconds between backup rotations when `backup-on-write` is off
    #[serde(default = "default_backup_interval", rename = "backup-interval")]
    pub backup_interval: u64,

    #[serde(default = "default_max_backups", rename = "max-backups")]
    pub max_backups: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            filepath: default_filepath(),
            sync_on_write: false,
            sync_interval: default_sync_interval(),
            backup_on_write: false,
            backup_interval: default_backup_interval(),
            max_backups: default_max_backups(),
        }
    }
}

#[derive(Debug)]
struct JournalState {
    last_fsync: Option<Instant>,
    last_backup: Option<Instant>,
}

/// File-backed journal. All writes are serialized through an internal mutex;
/// the write path itself never retries a failure.
#[derive(Debug)]
pub struct FileJournal {
    config: JournalConfig,
    state: Mutex<JournalState>,
}

impl FileJournal {
    pub fn new(config: JournalConfig) -> Result<Self, AgentError> {
        match std::fs::metadata(&config.filepath) {
            Ok(meta) if !meta.is_dir() => {
                return Err(AgentError::Journal(format!(
                    "journal filepath is not a directory: {}",
                    config.filepath.display()
                )));
            }
            Ok(_) => {}
            Err(_) => {
                warn!(
                    "Journal directory does not exist, creating: {}",
                    config.filepath.display()
                );
                std::fs::create_dir_all(&config.filepath)
                    .map_err(|e| AgentError::Journal(e.to_string()))?;
            }
        }
        Ok(Self {
            config,
            state: Mutex::new(JournalState {
                last_fsync: None,
                last_backup: None,
            }),
        })
    }

    fn journal_file(&self, number: u64) -> PathBuf {
        self.config
            .filepath
            .join(format!("{}{:03}", JOURNAL_BASE, number))
    }

    /// Append one record. Serialization happens outside the lock; rotation,
    /// the write, and the fsync policy run under it.
    pub fn write_entry<T: Serialize>(&self, entry: &T) -> Result<(), AgentError> {
        let payload = serde_json::to_vec(entry)?;
        let mut record = Vec::with_capacity(payload.len() + 4);
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(&payload);

        let mut state = self.state.lock().expect("journal lock poisoned");
        let primary = self.journal_file(1);
        trace!("Writing journal entry to {}", primary.display());

        if primary.exists() && self.backup_due(&state) {
            if let Err(e) = self.rotate_backups(&primary) {
                error!("Journal backup rotation failed: {}", e);
            } else {
                state.last_backup = Some(Instant::now());
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&primary)
            .map_err(|e| AgentError::Journal(format!("could not open journal: {}", e)))?;

        file.write_all(&record)
            .map_err(|e| AgentError::Journal(format!("could not write journal: {}", e)))?;

        if self.fsync_due(&state) {
            file.sync_all()
                .map_err(|e| AgentError::Journal(format!("could not sync journal: {}", e)))?;
            state.last_fsync = Some(Instant::now());
        }

        Ok(())
    }

    /// Replay the primary journal file. Returns the records that decode
    /// cleanly, in write order; stops at the first malformed record.
    pub fn read_entries<T: DeserializeOwned>(&self) -> Vec<T> {
        let primary = self.journal_file(1);
        let mut file = match File::open(&primary) {
            Ok(file) => file,
            Err(_) => return Vec::new(),
        };

        let mut results = Vec::new();
        loop {
            let mut len_bytes = [0u8; 4];
            if !read_exact_or_stop(&mut file, &mut len_bytes) {
                break;
            }
            let len = u32::from_le_bytes(len_bytes) as usize;
            let mut payload = vec![0u8; len];
            if !read_exact_or_stop(&mut file, &mut payload) {
                warn!("Journal ends mid-record, replaying intact prefix only");
                break;
            }
            match serde_json::from_slice(&payload) {
                Ok(value) => results.push(value),
                Err(e) => {
                    warn!("Journal record failed to parse, stopping replay: {}", e);
                    break;
                }
            }
        }
        results
    }

    fn backup_due(&self, state: &JournalState) -> bool {
        self.config.backup_on_write
            || (self.config.backup_interval > 0
                && state.last_backup.map_or(true, |at| {
                    at.elapsed() >= Duration::from_secs(self.config.backup_interval)
                }))
    }

    fn fsync_due(&self, state: &JournalState) -> bool {
        self.config.sync_on_write
            || (self.config.sync_interval > 0
                && state.last_fsync.map_or(true, |at| {
                    at.elapsed() >= Duration::from_secs(self.config.sync_interval)
                }))
    }

    /// Shift `j002 → j003 → …` up to `max_backups` (the oldest is dropped),
    /// then copy the primary file to a fresh `j002` and fsync the copy.
    fn rotate_backups(&self, primary: &Path) -> Result<(), AgentError> {
        if self.config.max_backups < 2 {
            return Ok(());
        }
        if self.journal_file(2).exists() {
            self.rotate_file(2)?;
        }
        let backup = self.journal_file(2);
        std::fs::copy(primary, &backup).map_err(|e| AgentError::Journal(e.to_string()))?;
        File::open(&backup)
            .and_then(|f| f.sync_all())
            .map_err(|e| AgentError::Journal(e.to_string()))?;
        debug!("Rotated journal backup to {}", backup.display());
        Ok(())
    }

    fn rotate_file(&self, number: u64) -> Result<(), AgentError> {
        let next = number + 1;
        if next > self.config.max_backups {
            std::fs::remove_file(self.journal_file(number))
                .map_err(|e| AgentError::Journal(e.to_string()))?;
            return Ok(());
        }
        if self.journal_file(next).exists() {
            self.rotate_file(next)?;
        }
        std::fs::rename(self.journal_file(number), self.journal_file(next))
            .map_err(|e| AgentError::Journal(e.to_string()))?;
        Ok(())
    }
}

fn read_exact_or_stop(file: &mut File, buf: &mut [u8]) -> bool {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => return false,
            Ok(n) => filled += n,
            Err(_) => return false,
        }
    }
    true
}
