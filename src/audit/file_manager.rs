//! Durable audit files.
//!
//! One JSON object per line in `execution_<YYYYMMDD>_<HHMMSS>_<seq>.jsonl`.
//! Files are self-contained, so any of them can be deleted without
//! affecting the rest. A new file is started when the UTC day changes or
//! the current file reaches its entry ceiling.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use tracing::{debug, info, warn};

use super::ExecutionLogEntry;
use crate::error::AuditError;

const FILE_PREFIX: &str = "execution_";
const FILE_SUFFIX: &str = ".jsonl";
const NAME_TIME_FORMAT: &str = "%Y%m%d_%H%M%S";

struct CurrentFile {
    path: PathBuf,
    file: File,
    day: NaiveDate,
    entries: usize,
}

pub struct LogFileManager {
    dir: PathBuf,
    max_entries_per_file: usize,
    max_log_files: usize,
    retention: Option<Duration>,
    current: Option<CurrentFile>,
    seq: u32,
}

impl LogFileManager {
    pub fn new(
        dir: impl Into<PathBuf>,
        max_entries_per_file: usize,
        max_log_files: usize,
        retention_days: Option<u32>,
    ) -> Result<Self, AuditError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            max_entries_per_file: max_entries_per_file.max(1),
            max_log_files: max_log_files.max(1),
            retention: retention_days.map(|d| Duration::days(d as i64)),
            current: None,
            seq: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|c| c.path.as_path())
    }

    pub fn append(&mut self, entry: &ExecutionLogEntry) -> Result<(), AuditError> {
        self.append_at(entry, Utc::now())
    }

    /// Append one entry, rotating first if the day rolled or the file is full
    pub fn append_at(&mut self, entry: &ExecutionLogEntry, now: DateTime<Utc>) -> Result<(), AuditError> {
        let line = serde_json::to_string(entry)?;

        let needs_rotation = match &self.current {
            None => true,
            Some(current) => {
                current.day != now.date_naive() || current.entries >= self.max_entries_per_file
            }
        };
        if needs_rotation {
            self.rotate(now)?;
        }

        let Some(current) = self.current.as_mut() else {
            return Err(AuditError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "no open audit file",
            )));
        };
        writeln!(current.file, "{}", line)?;
        current.file.flush()?;
        current.entries += 1;
        Ok(())
    }

    /// Start a new file and prune old ones
    pub fn rotate(&mut self, now: DateTime<Utc>) -> Result<PathBuf, AuditError> {
        if let Some(previous) = self.current.take() {
            debug!(path = %previous.path.display(), entries = previous.entries, "Audit file closed");
        }

        let stamp = now.format(NAME_TIME_FORMAT);
        let (path, file) = loop {
            self.seq = self.seq.wrapping_add(1);
            let path = self
                .dir
                .join(format!("{}{}_{:04}{}", FILE_PREFIX, stamp, self.seq, FILE_SUFFIX));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => break (path, file),
                // Left over from an earlier run in the same second
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        };

        info!(path = %path.display(), "Audit file opened");
        self.current = Some(CurrentFile {
            path: path.clone(),
            file,
            day: now.date_naive(),
            entries: 0,
        });

        let removed = self.cleanup(now)?;
        if removed > 0 {
            info!(removed, "Pruned old audit files");
        }
        Ok(path)
    }

    /// Remove files beyond the count limit or older than the retention window.
    /// The open file is never removed.
    pub fn cleanup(&self, now: DateTime<Utc>) -> Result<usize, AuditError> {
        let files = self.list_files()?;
        let current = self.current_path();
        let mut removed = 0;
        let mut kept = Vec::new();

        for path in files {
            if Some(path.as_path()) == current {
                kept.push(path);
                continue;
            }
            let expired = match (self.retention, file_timestamp(&path)) {
                (Some(retention), Some(created)) => created < now - retention,
                _ => false,
            };
            if expired {
                remove_file(&path, &mut removed);
            } else {
                kept.push(path);
            }
        }

        // Oldest first, so the excess is at the front
        let excess = kept.len().saturating_sub(self.max_log_files);
        for path in kept.iter().take(excess) {
            if Some(path.as_path()) != current {
                remove_file(path, &mut removed);
            }
        }
        Ok(removed)
    }

    /// Audit files in the directory, oldest first
    pub fn list_files(&self) -> Result<Vec<PathBuf>, AuditError> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| is_audit_file(path))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Read one file, skipping blank and corrupt lines.
    ///
    /// Returns the entries in file order and the number of lines skipped.
    pub fn read_entries(path: &Path) -> Result<(Vec<ExecutionLogEntry>, usize), AuditError> {
        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        let mut skipped = 0;

        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    skipped += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ExecutionLogEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(_) => skipped += 1,
            }
        }

        if skipped > 0 {
            warn!(path = %path.display(), skipped, "Skipped corrupt audit lines");
        }
        Ok((entries, skipped))
    }
}

fn is_audit_file(path: &Path) -> bool {
    path.is_file()
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(FILE_PREFIX) && n.ends_with(FILE_SUFFIX))
}

/// Creation time encoded in an audit file name
fn file_timestamp(path: &Path) -> Option<DateTime<Utc>> {
    let name = path.file_name()?.to_str()?;
    let stamp = name.strip_prefix(FILE_PREFIX)?.get(..15)?;
    NaiveDateTime::parse_from_str(stamp, NAME_TIME_FORMAT)
        .ok()
        .map(|t| t.and_utc())
}

fn remove_file(path: &Path, removed: &mut usize) {
    match fs::remove_file(path) {
        Ok(()) => *removed += 1,
        Err(e) => warn!(path = %path.display(), "Failed to remove audit file: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionContext;
    use crate::models::{Bar, Timeframe};
    use crate::strategy::{ExecutionSignal, Metadata, SignalAction};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn entry(symbol: &str) -> ExecutionLogEntry {
        let now = Utc::now();
        let context = ExecutionContext {
            symbol: symbol.to_string(),
            timeframe: Timeframe::Min1,
            current_bar: Bar {
                symbol: symbol.to_string(),
                timeframe: Timeframe::Min1,
                timestamp: now,
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 1.0,
            },
            historical_bars: Vec::new(),
            plan_parameters: Metadata::new(),
            position: None,
            account_balance: 0.0,
            timestamp: now,
            edge_cases: Vec::new(),
        };
        ExecutionLogEntry::success("f", &context, ExecutionSignal::new(SignalAction::EnterLong, 0.7, ""), 1.0)
    }

    #[test]
    fn test_rotates_at_entry_ceiling() {
        let dir = TempDir::new().unwrap();
        let mut files = LogFileManager::new(dir.path(), 2, 10, None).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 4, 14, 30, 0).unwrap();

        for _ in 0..5 {
            files.append_at(&entry("AAPL"), now).unwrap();
        }

        let paths = files.list_files().unwrap();
        assert_eq!(paths.len(), 3);
        let counts: Vec<usize> = paths
            .iter()
            .map(|p| LogFileManager::read_entries(p).unwrap().0.len())
            .collect();
        assert_eq!(counts, vec![2, 2, 1]);
        assert_eq!(files.current_path(), Some(paths[2].as_path()));
    }

    #[test]
    fn test_rotates_on_day_change() {
        let dir = TempDir::new().unwrap();
        let mut files = LogFileManager::new(dir.path(), 100, 10, None).unwrap();
        let day1 = Utc.with_ymd_and_hms(2024, 3, 4, 23, 59, 0).unwrap();

        files.append_at(&entry("AAPL"), day1).unwrap();
        files.append_at(&entry("AAPL"), day1 + Duration::minutes(2)).unwrap();

        let paths = files.list_files().unwrap();
        assert_eq!(paths.len(), 2);
        let name = paths[1].file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("execution_20240305_000100_"));
    }

    #[test]
    fn test_keeps_most_recent_files() {
        let dir = TempDir::new().unwrap();
        let mut files = LogFileManager::new(dir.path(), 1, 10, None).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 4, 14, 30, 0).unwrap();

        for i in 0..15 {
            files.append_at(&entry(&format!("SYM{}", i)), now).unwrap();
        }

        let paths = files.list_files().unwrap();
        assert_eq!(paths.len(), 10);

        let newest = LogFileManager::read_entries(paths.last().unwrap()).unwrap().0;
        assert_eq!(newest[0].symbol, "SYM14");
        let oldest = LogFileManager::read_entries(&paths[0]).unwrap().0;
        assert_eq!(oldest[0].symbol, "SYM5");
    }

    #[test]
    fn test_prunes_by_age() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("execution_20240101_000000_0001.jsonl"), "").unwrap();
        fs::write(dir.path().join("execution_20240301_000000_0001.jsonl"), "").unwrap();
        fs::write(dir.path().join("unrelated.txt"), "").unwrap();

        let mut files = LogFileManager::new(dir.path(), 100, 10, Some(30)).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 4, 14, 30, 0).unwrap();
        files.append_at(&entry("AAPL"), now).unwrap();

        let names: Vec<String> = files
            .list_files()
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
        assert_eq!(names[0], "execution_20240301_000000_0001.jsonl");
        assert!(dir.path().join("unrelated.txt").exists());
    }

    #[test]
    fn test_corrupt_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let good = serde_json::to_string(&entry("AAPL")).unwrap();
        let path = dir.path().join("execution_20240304_143000_0001.jsonl");
        fs::write(&path, format!("{}\n{{\"partial\": \n\n{}\n", good, good)).unwrap();

        let (entries, skipped) = LogFileManager::read_entries(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(skipped, 1);
    }
}
