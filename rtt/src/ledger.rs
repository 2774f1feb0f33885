//! Records the most recent day whose import completed without errors.
use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid ledger file: {0}")]
    Serde(#[from] serde_json::Error),
}

pub trait ImportLedger: Send + Sync {
    fn last_success(&self) -> Result<Option<NaiveDate>, LedgerError>;

    /// Moves the ledger forward to `day`. Returns false and leaves the ledger
    /// untouched when `day` is not newer than the recorded one.
    fn record_success(&self, day: NaiveDate) -> Result<bool, LedgerError>;
}

#[derive(Default)]
pub struct MemoryLedger {
    last: Mutex<Option<NaiveDate>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        MemoryLedger::default()
    }
}

impl ImportLedger for MemoryLedger {
    fn last_success(&self) -> Result<Option<NaiveDate>, LedgerError> {
        Ok(*self.last.lock())
    }

    fn record_success(&self, day: NaiveDate) -> Result<bool, LedgerError> {
        let mut last = self.last.lock();
        if last.is_some_and(|last| last >= day) {
            return Ok(false);
        }
        *last = Some(day);
        Ok(true)
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct LedgerFile {
    last_successful_import: NaiveDate,
}

pub struct FileLedger {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileLedger {
    pub fn new(path: &Path) -> Self {
        FileLedger {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    fn read(&self) -> Result<Option<NaiveDate>, LedgerError> {
        match fs::read(&self.path) {
            Ok(contents) => {
                let file: LedgerFile = serde_json::from_slice(&contents)?;
                Ok(Some(file.last_successful_import))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

impl ImportLedger for FileLedger {
    fn last_success(&self) -> Result<Option<NaiveDate>, LedgerError> {
        let _guard = self.lock.lock();
        self.read()
    }

    fn record_success(&self, day: NaiveDate) -> Result<bool, LedgerError> {
        let _guard = self.lock.lock();
        if self.read()?.is_some_and(|last| last >= day) {
            return Ok(false);
        }

        let contents = serde_json::to_vec_pretty(&LedgerFile {
            last_successful_import: day,
        })?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, contents)?;
        fs::rename(&tmp_path, &self.path)?;

        tracing::info!(%day, "updated last successful import");
        Ok(true)
    }
}
