//! Append-only session ledger.
//!
//! One newline-delimited JSON file per session at
//! `.claude/sessions/<id>/messages.jsonl`. Writers only ever append;
//! readers tolerate a torn final line by truncating at the last newline.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::event::HistoryRecord;
use super::Result;
use crate::env;

/// Handle to one session's message ledger.
#[derive(Debug, Clone)]
pub struct HistoryLedger {
    path: PathBuf,
}

impl HistoryLedger {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Open the ledger for a session, migrating a legacy project-scoped
    /// file (`.claude/projects/<project>/<id>.jsonl`) into place when one
    /// exists and the canonical file does not.
    pub fn open(
        claude_dir: &Path,
        project_path: &str,
        session_id: &str,
    ) -> Result<Self> {
        let path = claude_dir
            .join(env::session::SESSIONS_DIR_NAME)
            .join(session_id)
            .join(env::session::MESSAGES_FILE_NAME);

        if !path.exists() {
            let legacy = claude_dir
                .join(env::session::LEGACY_PROJECTS_DIR_NAME)
                .join(project_path)
                .join(format!("{}.jsonl", session_id));
            if legacy.is_file() {
                debug!(
                    from = %legacy.display(),
                    to = %path.display(),
                    "migrating legacy session ledger"
                );
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::rename(&legacy, &path)?;
            }
        }

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Each record is exactly one line.
    pub fn append(&self, record: &HistoryRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Read the last `n` records. A file with no trailing newline has its
    /// final partial line dropped; lines that fail to parse are skipped.
    pub fn tail(&self, n: usize) -> Result<Vec<HistoryRecord>> {
        let records = self.read_all()?;
        let start = records.len().saturating_sub(n);
        Ok(records[start..].to_vec())
    }

    /// Read a page of records for the paginated history endpoint.
    pub fn page(&self, offset: usize, limit: usize) -> Result<(Vec<HistoryRecord>, usize)> {
        let records = self.read_all()?;
        let total = records.len();
        let page = records
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect();
        Ok((page, total))
    }

    fn read_all(&self) -> Result<Vec<HistoryRecord>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        // Truncate at the last newline: a torn final line means a writer
        // died mid-append and the record never happened.
        let complete = match content.rfind('\n') {
            Some(idx) => &content[..idx],
            None => return Ok(Vec::new()),
        };

        Ok(complete
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "skipping corrupt ledger line");
                    None
                }
            })
            .collect())
    }

    /// Rename the ledger directory when a temporary session id is rebound
    /// to the runtime-assigned one.
    pub fn rename_session_dir(&self, new_path: PathBuf) -> Result<Self> {
        let old_dir = self.path.parent().map(Path::to_path_buf);
        let new_dir = new_path.parent().map(Path::to_path_buf);
        if let (Some(old_dir), Some(new_dir)) = (old_dir, new_dir) {
            if old_dir.exists() {
                if let Some(grandparent) = new_dir.parent() {
                    fs::create_dir_all(grandparent)?;
                }
                fs::rename(&old_dir, &new_dir)?;
            }
        }
        Ok(Self { path: new_path })
    }
}
