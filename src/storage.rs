use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::raft::state::LogEntry;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt state file: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
struct Meta {
    current_term: u64,
    voted_for: Option<u64>,
}

/// State reloaded from disk when a replica restarts.
#[derive(Debug, Default)]
pub struct Recovered {
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub log: Vec<LogEntry>,
}

/// Durable home of the replica's persistent state. Two files inside `dir`:
///
///   meta.json: current_term and voted_for, replaced atomically
///              (write temp, fsync, rename, fsync dir)
///   log.jsonl: one JSON-encoded entry per line, appended with fsync
///
/// Every save returns only after the data is on stable media, so a reply
/// that depends on the saved state can never outrun it.
pub struct Persister {
    dir: PathBuf,
    meta: Meta,
    /// Number of entries currently in log.jsonl.
    synced_len: usize,
    /// Term of the last entry in log.jsonl, 0 when empty.
    synced_last_term: u64,
}

impl Persister {
    /// Open (or create) the data directory and reload whatever it holds.
    pub fn open(dir: &Path) -> Result<(Self, Recovered), StorageError> {
        fs::create_dir_all(dir)?;
        let meta = read_meta(dir)?;
        let log = read_log(dir)?;

        let persister = Self {
            dir: dir.to_path_buf(),
            meta,
            synced_len: log.len(),
            synced_last_term: log.last().map(|e| e.term).unwrap_or(0),
        };
        let recovered = Recovered {
            current_term: meta.current_term,
            voted_for: meta.voted_for,
            log,
        };
        Ok((persister, recovered))
    }

    /// Durably record the current term and vote.
    pub fn save_meta(
        &mut self,
        current_term: u64,
        voted_for: Option<u64>,
    ) -> Result<(), StorageError> {
        let meta = Meta {
            current_term,
            voted_for,
        };
        if meta == self.meta {
            return Ok(());
        }

        let tmp = self.dir.join("meta.json.tmp");
        let bytes = serde_json::to_vec(&meta)?;
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, self.dir.join("meta.json"))?;
        // Fsync the directory so the rename survives a crash.
        File::open(&self.dir)?.sync_all()?;

        self.meta = meta;
        Ok(())
    }

    /// Durably record the log. Appends new entries when the previously
    /// synced prefix is untouched; otherwise rewrites the file atomically.
    ///
    /// The prefix check compares the term at the last synced position:
    /// truncation only ever happens at a term conflict, and two logs that
    /// agree on (index, term) agree on everything before it, so an
    /// unchanged tail term means an unchanged prefix.
    pub fn save_log(&mut self, log: &[LogEntry]) -> Result<(), StorageError> {
        let prefix_intact = self.synced_len == 0
            || (log.len() >= self.synced_len
                && log[self.synced_len - 1].term == self.synced_last_term);

        if prefix_intact {
            if log.len() > self.synced_len {
                self.append_entries(&log[self.synced_len..])?;
            }
        } else {
            self.rewrite_log(log)?;
        }

        self.synced_len = log.len();
        self.synced_last_term = log.last().map(|e| e.term).unwrap_or(0);
        Ok(())
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log.jsonl")
    }

    fn append_entries(&self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let mut buf = String::new();
        for entry in entries {
            buf.push_str(&serde_json::to_string(entry)?);
            buf.push('\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        file.write_all(buf.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn rewrite_log(&self, log: &[LogEntry]) -> Result<(), StorageError> {
        let tmp = self.dir.join("log.jsonl.tmp");
        let mut file = File::create(&tmp)?;
        for entry in log {
            let mut line = serde_json::to_string(entry)?;
            line.push('\n');
            file.write_all(line.as_bytes())?;
        }
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, self.log_path())?;
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

fn read_meta(dir: &Path) -> Result<Meta, StorageError> {
    let path = dir.join("meta.json");
    if !path.exists() {
        return Ok(Meta::default());
    }
    let bytes = fs::read(&path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn read_log(dir: &Path) -> Result<Vec<LogEntry>, StorageError> {
    let path = dir.join("log.jsonl");
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(&path)?;
    let lines: Vec<String> = BufReader::new(file)
        .lines()
        .collect::<io::Result<_>>()?;

    let mut entries = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<LogEntry>(line) {
            Ok(entry) => entries.push(entry),
            // A torn final line means the process died mid-append; the
            // entry was never acknowledged, so dropping it is safe.
            Err(_) if i == lines.len() - 1 => {
                tracing::warn!(line = i + 1, "dropping torn final log line");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(entries)
}
