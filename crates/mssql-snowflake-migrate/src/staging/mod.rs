//! Staging area: one CSV artifact (plus a DDL sidecar) per exported table.
//!
//! The set of `*.csv` files in the staging directory is the load queue.
//! Artifacts are written to a `.tmp` path and renamed into place once fully
//! flushed, so a discovered artifact is always complete.

use crate::error::{MigrateError, Result};
use crate::source::{Row, RowSink};
use std::fs::File;
use std::io::{BufWriter, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Artifact file extension.
pub const ARTIFACT_EXTENSION: &str = "csv";

/// DDL sidecar file extension.
pub const DDL_EXTENSION: &str = "sql";

const TMP_SUFFIX: &str = ".tmp";

/// Directory holding staging artifacts.
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Deterministic artifact path for a table.
    pub fn artifact_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", table, ARTIFACT_EXTENSION))
    }

    /// Deterministic DDL sidecar path for a table.
    pub fn ddl_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", table, DDL_EXTENSION))
    }

    /// List complete artifacts, sorted by path. A missing directory is empty.
    pub fn discover(&self) -> Result<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut artifacts = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file()
                && path.extension().and_then(|e| e.to_str()) == Some(ARTIFACT_EXTENSION)
            {
                artifacts.push(path);
            }
        }
        artifacts.sort();

        debug!(
            "Discovered {} artifacts in {}",
            artifacts.len(),
            self.dir.display()
        );
        Ok(artifacts)
    }

    /// Start staging a table.
    ///
    /// The DDL sidecar and the CSV header are written under temporary names
    /// right away; rows are appended as they are pushed. Nothing becomes
    /// visible to [`discover`](Self::discover) until
    /// [`ArtifactWriter::finish`] renames both files into place.
    pub fn begin(&self, table: &str, ddl: &str, columns: &[String]) -> Result<ArtifactWriter> {
        check_table_name(table)?;
        std::fs::create_dir_all(&self.dir)?;

        let ddl_path = self.ddl_path(table);
        let artifact = self.artifact_path(table);
        let mut writer = ArtifactWriter {
            dir: self.dir.clone(),
            ddl_tmp: tmp_path(&ddl_path),
            artifact_tmp: tmp_path(&artifact),
            ddl_path,
            artifact,
            csv: None,
            columns: columns.len(),
            rows: 0,
            finished: false,
        };

        write_ddl(&writer.ddl_tmp, ddl)?;
        let file = File::create(&writer.artifact_tmp)?;
        let mut csv = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(BufWriter::new(file));
        csv.write_record(columns)?;
        writer.csv = Some(csv);

        Ok(writer)
    }
}

/// An artifact being written.
///
/// Dropping a writer without calling [`finish`](Self::finish) removes its
/// temporary files; a previously staged artifact for the table is untouched.
pub struct ArtifactWriter {
    dir: PathBuf,
    ddl_path: PathBuf,
    ddl_tmp: PathBuf,
    artifact: PathBuf,
    artifact_tmp: PathBuf,
    csv: Option<csv::Writer<BufWriter<File>>>,
    columns: usize,
    rows: u64,
    finished: bool,
}

impl ArtifactWriter {
    /// Append one row. NULL is written as an empty field.
    pub fn write_row(&mut self, row: &[Option<String>]) -> Result<()> {
        if row.len() != self.columns {
            return Err(MigrateError::Staging(format!(
                "row has {} cells, header has {}",
                row.len(),
                self.columns
            )));
        }
        let csv = self.csv.as_mut().ok_or_else(|| {
            MigrateError::Staging(format!("{} is already closed", self.artifact_tmp.display()))
        })?;
        csv.write_record(row.iter().map(|cell| cell.as_deref().unwrap_or("")))?;
        self.rows += 1;
        Ok(())
    }

    /// Flush, fsync and rename the sidecar and the CSV into place.
    pub fn finish(mut self) -> Result<(PathBuf, u64)> {
        let csv = self.csv.take().ok_or_else(|| {
            MigrateError::Staging(format!("{} is already closed", self.artifact_tmp.display()))
        })?;
        let flush_error = |e: String| {
            MigrateError::Staging(format!("failed to flush {}: {}", self.artifact_tmp.display(), e))
        };
        let file = csv
            .into_inner()
            .map_err(|e| flush_error(e.to_string()))?
            .into_inner()
            .map_err(|e| flush_error(e.to_string()))?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&self.ddl_tmp, &self.ddl_path)?;
        std::fs::rename(&self.artifact_tmp, &self.artifact)?;
        self.finished = true;
        sync_dir(&self.dir);

        debug!("Staged {} rows at {}", self.rows, self.artifact.display());
        Ok((self.artifact.clone(), self.rows))
    }
}

impl RowSink for ArtifactWriter {
    fn push(&mut self, row: Row) -> Result<()> {
        self.write_row(&row)
    }
}

impl Drop for ArtifactWriter {
    fn drop(&mut self) {
        if !self.finished {
            drop(self.csv.take());
            remove_if_exists(&self.ddl_tmp);
            remove_if_exists(&self.artifact_tmp);
        }
    }
}

/// Delete an artifact, then its DDL sidecar.
pub fn remove_artifact(artifact: &Path) -> Result<()> {
    std::fs::remove_file(artifact)?;
    let sidecar = artifact.with_extension(DDL_EXTENSION);
    match std::fs::remove_file(&sidecar) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", sidecar.display(), e),
    }
    Ok(())
}

/// Destination table name for an artifact (its file stem).
pub fn table_name(artifact: &Path) -> Result<String> {
    artifact
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or_else(|| {
            MigrateError::Staging(format!(
                "cannot derive a table name from {}",
                artifact.display()
            ))
        })
}

/// Read the DDL sidecar for an artifact, if one was staged.
pub fn read_ddl(artifact: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(artifact.with_extension(DDL_EXTENSION)) {
        Ok(ddl) => Ok(Some(ddl)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Batched reader over a staged CSV artifact.
pub struct ArtifactReader {
    reader: csv::Reader<File>,
    columns: Vec<String>,
    record: csv::StringRecord,
}

impl ArtifactReader {
    /// Open an artifact and read its header.
    pub fn open(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)?;
        let columns: Vec<String> = reader.headers()?.iter().map(String::from).collect();

        if columns.is_empty() {
            return Err(MigrateError::Staging(format!(
                "{} has no header row",
                path.display()
            )));
        }

        Ok(Self {
            reader,
            columns,
            record: csv::StringRecord::new(),
        })
    }

    /// Header column names, in file order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Read up to `max_rows` rows. An empty batch means end of file.
    pub fn next_batch(&mut self, max_rows: usize) -> Result<Vec<Row>> {
        let mut batch = Vec::with_capacity(max_rows.min(4096));
        while batch.len() < max_rows && self.reader.read_record(&mut self.record)? {
            let row = self
                .record
                .iter()
                .map(|field| {
                    if field.is_empty() {
                        None
                    } else {
                        Some(field.to_string())
                    }
                })
                .collect();
            batch.push(row);
        }
        Ok(batch)
    }
}

fn check_table_name(table: &str) -> Result<()> {
    if table.is_empty() || table == "." || table == ".." || table.contains(['/', '\\']) {
        return Err(MigrateError::Staging(format!(
            "table name {:?} cannot be used as a file name",
            table
        )));
    }
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(TMP_SUFFIX);
    PathBuf::from(name)
}

fn write_ddl(path: &Path, ddl: &str) -> Result<()> {
    let file = File::create(path)?;
    std::io::Write::write_all(&mut &file, ddl.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn remove_if_exists(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

/// Persist renames in the directory entry. Not supported on every platform.
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{row, stage};
    use tempfile::TempDir;

    const COLUMNS: &[&str] = &["id", "name", "note"];

    fn rows() -> Vec<Row> {
        vec![
            row(&[Some("1"), Some("Ada"), None]),
            row(&[Some("2"), Some("Grace, Hopper"), Some("line\nbreak")]),
            row(&[Some("3"), None, Some("\"quoted\"")]),
        ]
    }

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = TempDir::new().unwrap();
        let staging = StagingArea::new(dir.path().join("staging"));

        let path = stage(&staging, "Users", "CREATE TABLE Users (id INTEGER)", COLUMNS, rows()).unwrap();
        assert_eq!(path, staging.artifact_path("Users"));
        assert_eq!(table_name(&path).unwrap(), "Users");
        assert_eq!(
            read_ddl(&path).unwrap().as_deref(),
            Some("CREATE TABLE Users (id INTEGER)")
        );

        let mut reader = ArtifactReader::open(&path).unwrap();
        assert_eq!(reader.columns(), COLUMNS);

        let first = reader.next_batch(2).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0], row(&[Some("1"), Some("Ada"), None]));
        assert_eq!(first[1][1].as_deref(), Some("Grace, Hopper"));
        assert_eq!(first[1][2].as_deref(), Some("line\nbreak"));

        let second = reader.next_batch(2).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0][2].as_deref(), Some("\"quoted\""));

        assert!(reader.next_batch(2).unwrap().is_empty());
    }

    #[test]
    fn test_header_only_artifact() {
        let dir = TempDir::new().unwrap();
        let staging = StagingArea::new(dir.path());
        let path = stage(&staging, "Empty", "CREATE TABLE Empty (id INTEGER)", &["id"], vec![]).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "id\n");
        let mut reader = ArtifactReader::open(&path).unwrap();
        assert!(reader.next_batch(10).unwrap().is_empty());
    }

    #[test]
    fn test_rewrite_overwrites_previous_artifact() {
        let dir = TempDir::new().unwrap();
        let staging = StagingArea::new(dir.path());
        stage(&staging, "Users", "ddl", COLUMNS, rows()).unwrap();

        let path = stage(&staging, "Users", "ddl", &["id"], vec![row(&[Some("9")])]).unwrap();

        assert_eq!(std::fs::read_to_string(path).unwrap(), "id\n9\n");
        assert_eq!(staging.discover().unwrap().len(), 1);
    }

    #[test]
    fn test_failed_write_leaves_no_artifact() {
        let dir = TempDir::new().unwrap();
        let staging = StagingArea::new(dir.path());
        let ragged = vec![row(&[Some("1")])];

        assert!(stage(&staging, "Users", "ddl", &["id", "name"], ragged).is_err());
        assert!(!staging.artifact_path("Users").exists());
        assert!(!staging.ddl_path("Users").exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_rows_reach_disk_before_finish() {
        let dir = TempDir::new().unwrap();
        let staging = StagingArea::new(dir.path());
        let mut writer = staging.begin("Big", "ddl", &columns(&["id", "payload"])).unwrap();

        let payload = "x".repeat(100);
        for i in 0..10_000 {
            writer
                .push(vec![Some(i.to_string()), Some(payload.clone())])
                .unwrap();
        }

        // Buffered output is spilled to the temporary file, not held in memory.
        let tmp = dir.path().join("Big.csv.tmp");
        assert!(std::fs::metadata(&tmp).unwrap().len() > 500_000);
        assert!(staging.discover().unwrap().is_empty());

        let (path, count) = writer.finish().unwrap();
        assert_eq!(count, 10_000);
        assert!(!tmp.exists());
        assert_eq!(staging.discover().unwrap(), vec![path]);
    }

    #[test]
    fn test_abandoned_writer_keeps_previous_artifact() {
        let dir = TempDir::new().unwrap();
        let staging = StagingArea::new(dir.path());
        let previous = stage(&staging, "Users", "old ddl", &["id"], vec![row(&[Some("1")])]).unwrap();

        let mut writer = staging.begin("Users", "new ddl", &columns(&["id"])).unwrap();
        writer.push(row(&[Some("2")])).unwrap();
        drop(writer);

        assert_eq!(std::fs::read_to_string(&previous).unwrap(), "id\n1\n");
        assert_eq!(read_ddl(&previous).unwrap().as_deref(), Some("old ddl"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_discover_ignores_temporary_and_sidecar_files() {
        let dir = TempDir::new().unwrap();
        let staging = StagingArea::new(dir.path());
        stage(&staging, "B", "ddl", COLUMNS, rows()).unwrap();
        stage(&staging, "A", "ddl", COLUMNS, rows()).unwrap();
        std::fs::write(dir.path().join("C.csv.tmp"), "partial").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let found = staging.discover().unwrap();
        assert_eq!(found, vec![staging.artifact_path("A"), staging.artifact_path("B")]);
    }

    #[test]
    fn test_discover_missing_directory() {
        let dir = TempDir::new().unwrap();
        let staging = StagingArea::new(dir.path().join("absent"));
        assert!(staging.discover().unwrap().is_empty());
    }

    #[test]
    fn test_remove_deletes_artifact_and_sidecar() {
        let dir = TempDir::new().unwrap();
        let staging = StagingArea::new(dir.path());
        let path = stage(&staging, "Users", "ddl", COLUMNS, rows()).unwrap();

        remove_artifact(&path).unwrap();
        assert!(!path.exists());
        assert!(!staging.ddl_path("Users").exists());
    }

    #[test]
    fn test_rejects_path_like_table_names() {
        let dir = TempDir::new().unwrap();
        let staging = StagingArea::new(dir.path());
        assert!(staging.begin("../escape", "ddl", &columns(COLUMNS)).is_err());
        assert!(staging.begin("..", "ddl", &columns(COLUMNS)).is_err());
    }
}
