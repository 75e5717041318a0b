//! Append-only ledger journal.
//!
//! Every ledger mutation is appended to a JSONL (JSON Lines) file with file
//! locking to ensure safe concurrent access. Replaying the journal rebuilds
//! the ledger.

use crate::{
    Amendment, DoseObligation, DoseStatus, Error, ObligationId, Prescription, PrescriptionId,
    ReminderAttempt, Result, RuleSegment,
};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// One recorded ledger mutation
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum JournalEntry {
    Registered {
        prescription: Prescription,
    },
    RuleEdited {
        prescription_id: PrescriptionId,
        segment: RuleSegment,
    },
    Generated {
        prescription_id: PrescriptionId,
        through: DateTime<Utc>,
        scheduled: Vec<DateTime<Utc>>,
    },
    Reminded {
        prescription_id: PrescriptionId,
        obligation_id: ObligationId,
        at: DateTime<Utc>,
    },
    AttemptLogged {
        prescription_id: PrescriptionId,
        attempt: ReminderAttempt,
    },
    Resolved {
        prescription_id: PrescriptionId,
        obligation_id: ObligationId,
        status: DoseStatus,
        actual_time: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    },
    Amended {
        prescription_id: PrescriptionId,
        obligation_id: ObligationId,
        amendment: Amendment,
    },
    Replenished {
        prescription_id: PrescriptionId,
        quantity: u32,
        at: DateTime<Utc>,
    },
    Archived {
        prescription_id: PrescriptionId,
        at: DateTime<Utc>,
    },
    /// Obligations written verbatim by compaction
    Restored {
        prescription_id: PrescriptionId,
        obligations: Vec<DoseObligation>,
    },
}

impl JournalEntry {
    pub fn prescription_id(&self) -> PrescriptionId {
        match self {
            JournalEntry::Registered { prescription } => prescription.id,
            JournalEntry::RuleEdited { prescription_id, .. }
            | JournalEntry::Generated { prescription_id, .. }
            | JournalEntry::Reminded { prescription_id, .. }
            | JournalEntry::AttemptLogged { prescription_id, .. }
            | JournalEntry::Resolved { prescription_id, .. }
            | JournalEntry::Amended { prescription_id, .. }
            | JournalEntry::Replenished { prescription_id, .. }
            | JournalEntry::Archived { prescription_id, .. }
            | JournalEntry::Restored { prescription_id, .. } => *prescription_id,
        }
    }
}

/// Destination for ledger mutations
pub trait LedgerSink: Send + Sync {
    fn append(&self, entry: &JournalEntry) -> Result<()>;
}

/// JSONL-based journal with file locking
pub struct JsonlJournal {
    path: PathBuf,
}

impl JsonlJournal {
    /// Create a new journal for the given path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Atomically replace the journal with `entries`
    ///
    /// Writes to a temp file in the same directory, syncs it, then renames
    /// it over the journal.
    pub fn compact(&self, entries: &[JournalEntry]) -> Result<()> {
        self.ensure_parent_dir()?;

        let temp = NamedTempFile::new_in(self.path.parent().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "journal path missing parent",
            ))
        })?)?;

        temp.as_file().lock_exclusive()?;
        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            for entry in entries {
                let line = serde_json::to_string(entry)?;
                writer.write_all(line.as_bytes())?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.as_file().unlock()?;

        temp.persist(&self.path).map_err(|e| Error::Io(e.error))?;

        tracing::info!(
            "Compacted journal {:?} to {} entries",
            self.path,
            entries.len()
        );
        Ok(())
    }
}

impl LedgerSink for JsonlJournal {
    fn append(&self, entry: &JournalEntry) -> Result<()> {
        self.ensure_parent_dir()?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;

        file.lock_exclusive()?;

        // A crash mid-append leaves a line without its newline
        let torn = ends_without_newline(&file)?;

        let mut writer = std::io::BufWriter::new(&file);
        if torn {
            writer.write_all(b"\n")?;
        }
        let line = serde_json::to_string(entry)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;

        file.unlock()?;
        Ok(())
    }
}

fn ends_without_newline(mut file: &File) -> Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// Exclusive hold on a journal across processes
///
/// Taken by short-lived commands so that one process's replay never races
/// another's appends. Released on drop.
pub struct JournalLock {
    file: File,
}

impl JournalLock {
    /// Block until the lock next to `journal` is ours
    pub fn acquire(journal: &Path) -> Result<Self> {
        if let Some(parent) = journal.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(journal.with_extension("lock"))?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for JournalLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Read all entries from a journal file
///
/// Lines that fail to parse (e.g. a write cut short by a crash) are skipped
/// with a warning.
pub fn read_entries(path: &Path) -> Result<Vec<JournalEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)?;
    file.lock_shared()?;

    let reader = BufReader::new(&file);
    let mut entries = Vec::new();

    for (line_num, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        entries.extend(parse_line(&line, line_num + 1));
    }

    file.unlock()?;
    tracing::debug!("Read {} entries from journal", entries.len());
    Ok(entries)
}

fn parse_line(line: &str, line_num: usize) -> Option<JournalEntry> {
    if line.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<JournalEntry>(line) {
        Ok(entry) => Some(entry),
        Err(e) => {
            tracing::warn!("Failed to parse journal entry at line {}: {}", line_num, e);
            None
        }
    }
}

/// What changed in a journal since a [`JournalCursor`] last looked
#[derive(Debug)]
pub enum Tail {
    /// Entries appended after the previous read
    Appended(Vec<JournalEntry>),
    /// The file was replaced (compaction); these are all of its entries
    Rewritten(Vec<JournalEntry>),
}

/// Read position in a journal that other processes also append to
///
/// Compaction replaces the file, which shows up as a file shorter than the
/// cursor or different bytes just before it; the whole journal is then
/// re-read.
#[derive(Clone, Debug, Default)]
pub struct JournalCursor {
    offset: u64,
    /// Bytes immediately before `offset`
    mark: Vec<u8>,
    lines: usize,
}

const MARK_LEN: u64 = 64;

impl JournalCursor {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Entries that appeared since the last call
    pub fn read_new(&mut self, path: &Path) -> Result<Tail> {
        if !path.exists() {
            let rewritten = self.offset > 0;
            *self = Self::default();
            return Ok(if rewritten {
                Tail::Rewritten(Vec::new())
            } else {
                Tail::Appended(Vec::new())
            });
        }

        let file = File::open(path)?;
        file.lock_shared()?;
        let read = self.read_locked(&file);
        file.unlock()?;
        read
    }

    fn read_locked(&mut self, file: &File) -> Result<Tail> {
        let len = file.metadata()?.len();
        let rewritten = len < self.offset || mark_before(file, self.offset)? != self.mark;
        if rewritten {
            *self = Self::default();
        }

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(self.offset))?;
        let mut entries = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line)?;
            // An unterminated last line is either being written or torn
            if n == 0 || !line.ends_with('\n') {
                break;
            }
            self.offset += n as u64;
            self.lines += 1;
            entries.extend(parse_line(&line, self.lines));
        }
        self.mark = mark_before(file, self.offset)?;

        Ok(if rewritten {
            Tail::Rewritten(entries)
        } else {
            Tail::Appended(entries)
        })
    }

    /// Treat everything currently in the journal as read
    ///
    /// Only sound while holding the [`JournalLock`] and after every entry
    /// in the file has been applied.
    pub fn skip_to_end(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            *self = Self::default();
            return Ok(());
        }
        let file = File::open(path)?;
        file.lock_shared()?;
        let marked = file
            .metadata()
            .map_err(Error::from)
            .and_then(|m| Ok((m.len(), mark_before(&file, m.len())?)));
        file.unlock()?;

        let (len, mark) = marked?;
        self.offset = len;
        self.mark = mark;
        Ok(())
    }
}

fn mark_before(mut file: &File, offset: u64) -> Result<Vec<u8>> {
    let start = offset.saturating_sub(MARK_LEN);
    let mut mark = vec![0u8; (offset - start) as usize];
    file.seek(SeekFrom::Start(start))?;
    file.read_exact(&mut mark)?;
    Ok(mark)
}
