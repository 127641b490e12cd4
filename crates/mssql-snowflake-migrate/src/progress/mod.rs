//! Append-only record of tables whose export has completed.
//!
//! The record is a plain text file with one table name per line. It is only
//! ever appended to, one `write_all` + `sync_data` per entry. A crash during
//! an append can leave at most one unterminated trailing line; such a line is
//! treated as not recorded, and the next append cuts it off before writing.

use crate::error::{MigrateError, Result};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Durable set of exported table names.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    path: PathBuf,
}

impl ProgressTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every recorded table name. A missing file is an empty record.
    pub fn load(&self) -> Result<HashSet<String>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(e) => {
                return Err(MigrateError::Progress(format!(
                    "failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let (complete, torn) = match content.rfind('\n') {
            Some(idx) => (&content[..idx], &content[idx + 1..]),
            None => ("", content.as_str()),
        };

        if !torn.is_empty() {
            warn!(
                "Ignoring unterminated entry {:?} in {} (interrupted append)",
                torn,
                self.path.display()
            );
        }

        let tables: HashSet<String> = complete
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();

        debug!(
            "Loaded {} exported tables from {}",
            tables.len(),
            self.path.display()
        );
        Ok(tables)
    }

    /// Durably append `table` to the record.
    pub fn mark_complete(&self, table: &str) -> Result<()> {
        if table.is_empty() || table.contains('\n') || table.contains('\r') {
            return Err(MigrateError::Progress(format!(
                "table name {:?} cannot be recorded",
                table
            )));
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.path)?;

        discard_torn_entry(&mut file, &self.path)?;

        let mut entry = String::with_capacity(table.len() + 1);
        entry.push_str(table);
        entry.push('\n');

        file.write_all(entry.as_bytes())?;
        file.sync_data()?;

        debug!("Recorded {} in {}", table, self.path.display());
        Ok(())
    }
}

/// Truncate an unterminated trailing line left by an interrupted append.
///
/// Only bytes after the last newline are removed; complete entries are
/// never touched.
fn discard_torn_entry(file: &mut File, path: &Path) -> Result<()> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }

    file.seek(SeekFrom::Start(0))?;
    let mut content = Vec::with_capacity(len as usize);
    file.read_to_end(&mut content)?;

    let keep = match content.iter().rposition(|b| *b == b'\n') {
        Some(idx) => idx as u64 + 1,
        None => 0,
    };
    if keep < len {
        warn!(
            "Discarding {} bytes of unterminated entry in {}",
            len - keep,
            path.display()
        );
        file.set_len(keep)?;
    }
    Ok(())
}
