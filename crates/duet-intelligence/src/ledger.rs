//! Usage counters per (scope, period) and their on-disk form.
//!
//! Each pair is persisted as `<dir>/<scope>__<period>.json`. Reservations
//! live only in memory: a restart forgets them, which is the same as
//! releasing them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// `(scope slug, period)`.
pub type LedgerKey = (String, String);

/// Committed and in-flight usage for one scope within one period.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub scope: String,
    pub period: String,
    pub tokens: u64,
    pub cost_usd: f64,
    /// Number of committed agent calls.
    pub requests: u64,
    /// Warning event already emitted for this period.
    #[serde(default)]
    pub warned: bool,
    /// Limit-reached event already emitted for this period.
    #[serde(default)]
    pub exhausted: bool,
    #[serde(skip)]
    pub reserved_tokens: u64,
    #[serde(skip)]
    pub reserved_cost_usd: f64,
}

impl LedgerEntry {
    pub fn new(scope: impl Into<String>, period: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            period: period.into(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> LedgerKey {
        (self.scope.clone(), self.period.clone())
    }

    /// Committed plus reserved tokens.
    pub fn projected_tokens(&self) -> u64 {
        self.tokens + self.reserved_tokens
    }

    pub fn projected_cost_usd(&self) -> f64 {
        self.cost_usd + self.reserved_cost_usd
    }

    pub(crate) fn release(&mut self, tokens: u64, cost_usd: f64) {
        self.reserved_tokens = self.reserved_tokens.saturating_sub(tokens);
        self.reserved_cost_usd = (self.reserved_cost_usd - cost_usd).max(0.0);
    }
}

/// In-memory view of every known entry.
#[derive(Debug, Default)]
pub struct Ledger {
    entries: HashMap<LedgerKey, LedgerEntry>,
}

impl Ledger {
    pub fn from_entries(entries: Vec<LedgerEntry>) -> Self {
        Self {
            entries: entries.into_iter().map(|e| (e.key(), e)).collect(),
        }
    }

    pub fn get(&self, key: &LedgerKey) -> Option<&LedgerEntry> {
        self.entries.get(key)
    }

    pub fn entry_mut(&mut self, key: &LedgerKey) -> &mut LedgerEntry {
        self.entries
            .entry(key.clone())
            .or_insert_with(|| LedgerEntry::new(key.0.clone(), key.1.clone()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// LedgerStore
// ---------------------------------------------------------------------------

/// Directory of ledger documents.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    dir: PathBuf,
}

impl LedgerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read every entry in the directory. Unreadable files are skipped with
    /// a warning so one bad record cannot lock out the whole ledger.
    pub fn load_all(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        std::fs::create_dir_all(&self.dir)?;
        let mut entries = Vec::new();
        for item in std::fs::read_dir(&self.dir)? {
            let path = item?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = std::fs::read_to_string(&path)
                .map_err(LedgerError::from)
                .and_then(|data| serde_json::from_str::<LedgerEntry>(&data).map_err(Into::into));
            match parsed {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable ledger entry"),
            }
        }
        debug!(count = entries.len(), dir = %self.dir.display(), "ledger loaded");
        Ok(entries)
    }

    pub fn save(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&entry.scope, &entry.period);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(entry)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn path_for(&self, scope: &str, period: &str) -> PathBuf {
        self.dir.join(format!("{scope}__{period}.json"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
