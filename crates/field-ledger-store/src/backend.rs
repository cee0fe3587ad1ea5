use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use field_ledger_core::{EntryRecord, LedgerError};

use crate::retry::{with_retry, RetryPolicy};

/// Storage backend behind the ledger. Implementations must accept and
/// produce codec-compatible [`EntryRecord`]s; callers never learn which
/// one served a request.
pub trait RecordBackend {
    fn name(&self) -> &'static str;

    /// Load every record the backend knows about.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when the backing store cannot be
    /// read at all. Individually corrupt records are skipped, not fatal.
    fn load(&self) -> Result<Vec<EntryRecord>, LedgerError>;

    /// Persist one new record.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] on write failure.
    fn append(&mut self, record: &EntryRecord) -> Result<(), LedgerError>;

    /// Replace the stored record carrying `record.id`.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] when no such record exists and
    /// [`LedgerError::Storage`] on write failure.
    fn update(&mut self, record: &EntryRecord) -> Result<(), LedgerError>;

    /// Ask the backend to compact its log. Returns whether a delegate
    /// actually ran; backends without one report `false`, not an error.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when the delegate ran and failed.
    fn compact(&mut self) -> Result<bool, LedgerError>;
}

/// Pick the backend once, at store construction: the tracker command if it
/// probes healthy, the self-managed record file otherwise.
#[must_use]
pub fn select_backend(
    tracker_command: Option<&str>,
    root: &Path,
    record_path: PathBuf,
) -> Box<dyn RecordBackend> {
    if let Some(command) = tracker_command {
        if TrackerBackend::probe(command, root) {
            tracing::debug!(command, "using tracker backend");
            return Box::new(TrackerBackend {
                program: command.to_string(),
                root: root.to_path_buf(),
            });
        }
        tracing::debug!(command, "tracker unavailable, falling back to record file");
    }
    Box::new(FileBackend { path: record_path })
}

/// Self-managed line-delimited record file.
///
/// Creates and appends on write, rewrites the whole file on update. The
/// rewrite is read-modify-write with no file lock: when two processes race,
/// the later writer wins in full and the earlier concurrent update is
/// lost. That is the documented single-operator tradeoff, kept on purpose.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl RecordBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn load(&self) -> Result<Vec<EntryRecord>, LedgerError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&self.path)
            .map_err(|e| LedgerError::Storage(format!("cannot read record file: {e}")))?;

        let mut records = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<EntryRecord>(line) {
                Ok(record) => records.push(record),
                Err(error) => {
                    // One corrupt line must not take the store down.
                    tracing::warn!(line = index + 1, %error, "skipping unparseable record line");
                }
            }
        }
        Ok(records)
    }

    fn append(&mut self, record: &EntryRecord) -> Result<(), LedgerError> {
        let line = serde_json::to_string(record)
            .map_err(|e| LedgerError::Storage(format!("cannot serialize record: {e}")))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| LedgerError::Storage(format!("cannot open record file: {e}")))?;
        writeln!(file, "{line}")
            .map_err(|e| LedgerError::Storage(format!("cannot append record: {e}")))
    }

    fn update(&mut self, record: &EntryRecord) -> Result<(), LedgerError> {
        let mut records = self.load()?;
        let Some(slot) = records.iter_mut().find(|r| r.id == record.id) else {
            return Err(LedgerError::NotFound(record.id.clone()));
        };
        *slot = record.clone();

        let mut contents = String::new();
        for stored in &records {
            let line = serde_json::to_string(stored)
                .map_err(|e| LedgerError::Storage(format!("cannot serialize record: {e}")))?;
            contents.push_str(&line);
            contents.push('\n');
        }
        write_atomic(&self.path, contents.as_bytes())
    }

    fn compact(&mut self) -> Result<bool, LedgerError> {
        Ok(false)
    }
}

/// External issue-tracking command speaking record JSON on stdout.
pub struct TrackerBackend {
    program: String,
    root: PathBuf,
}

impl TrackerBackend {
    /// Capability probe: the tracker is usable when `<cmd> status` runs and
    /// exits cleanly. A missing binary or a "not initialized" complaint
    /// both land here as an unhealthy probe, never as a per-call surprise.
    #[must_use]
    pub fn probe(program: &str, root: &Path) -> bool {
        Command::new(program)
            .arg("status")
            .current_dir(root)
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    fn run(&self, args: &[&str]) -> Result<String, LedgerError> {
        let output = Command::new(&self.program)
            .args(args)
            .current_dir(&self.root)
            .output()
            .map_err(|e| LedgerError::Storage(format!("cannot run tracker: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LedgerError::Storage(format!(
                "tracker {} exited with {}: {}",
                args.first().unwrap_or(&"?"),
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn run_with_retry(&self, operation: &str, args: &[&str]) -> Result<String, LedgerError> {
        with_retry(operation, &RetryPolicy::external_command(), || self.run(args))
    }
}

impl RecordBackend for TrackerBackend {
    fn name(&self) -> &'static str {
        "tracker"
    }

    fn load(&self) -> Result<Vec<EntryRecord>, LedgerError> {
        let stdout = self.run_with_retry("tracker list", &["list", "--json"])?;
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(trimmed)
            .map_err(|e| LedgerError::Storage(format!("tracker returned unparseable records: {e}")))
    }

    fn append(&mut self, record: &EntryRecord) -> Result<(), LedgerError> {
        let payload = serde_json::to_string(record)
            .map_err(|e| LedgerError::Storage(format!("cannot serialize record: {e}")))?;
        self.run_with_retry("tracker create", &["create", "--json", &payload])?;
        Ok(())
    }

    fn update(&mut self, record: &EntryRecord) -> Result<(), LedgerError> {
        let payload = serde_json::to_string(record)
            .map_err(|e| LedgerError::Storage(format!("cannot serialize record: {e}")))?;
        self.run_with_retry("tracker update", &["update", &record.id, "--json", &payload])?;
        Ok(())
    }

    fn compact(&mut self) -> Result<bool, LedgerError> {
        self.run_with_retry("tracker compact", &["compact"])?;
        Ok(true)
    }
}

/// Write `contents` to `path` through a sibling temp file persisted over
/// the destination, so readers never observe a half-written file.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), LedgerError> {
    let parent = path
        .parent()
        .ok_or_else(|| LedgerError::Storage(format!("no parent directory for {}", path.display())))?;
    let mut temp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| LedgerError::Storage(format!("cannot create temp file: {e}")))?;
    temp.write_all(contents)
        .map_err(|e| LedgerError::Storage(format!("cannot write temp file: {e}")))?;
    temp.persist(path)
        .map_err(|e| LedgerError::Storage(format!("cannot persist rewrite: {e}")))?;
    Ok(())
}
