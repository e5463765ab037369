//! Edit log for transaction state.
//!
//! Every status transition appends the full transaction record; eviction of
//! expired transactions appends a removal. The file format is one JSON
//! document per line. A torn final line (crash mid-append) is dropped on
//! load; corruption anywhere else is an error.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::txn::TransactionState;
use crate::{DbId, TxnId};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "op", content = "entry", rename_all = "snake_case")]
pub enum JournalEntry {
    UpsertTransaction(TransactionState),
    RemoveTransactions { db_id: DbId, txn_ids: Vec<TxnId> },
}

pub trait EditLog: Send + Sync + 'static {
    fn append(&self, entry: &JournalEntry) -> anyhow::Result<()>;

    /// All entries in append order.
    fn load(&self) -> anyhow::Result<Vec<JournalEntry>>;
}

/// JSON-lines edit log backed by a local file.
pub struct FileEditLog {
    path: PathBuf,
    file: Mutex<File>,
    sync: bool,
}

impl FileEditLog {
    pub fn open(path: impl AsRef<Path>, sync: bool) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create journal dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .with_context(|| format!("open journal {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            sync,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EditLog for FileEditLog {
    fn append(&self, entry: &JournalEntry) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(entry).context("encode journal entry")?;
        line.push(b'\n');
        let mut file = self.file.lock().expect("journal file lock");
        file.write_all(&line).context("append journal entry")?;
        if self.sync {
            file.sync_data().context("sync journal")?;
        }
        Ok(())
    }

    fn load(&self) -> anyhow::Result<Vec<JournalEntry>> {
        let file = File::open(&self.path)
            .with_context(|| format!("open journal {}", self.path.display()))?;
        let lines: Vec<String> = BufReader::new(file)
            .lines()
            .collect::<Result<_, _>>()
            .context("read journal")?;
        let mut entries = Vec::with_capacity(lines.len());
        let last = lines.len().saturating_sub(1);
        for (idx, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(err) if idx == last => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %err,
                        "dropping torn journal tail"
                    );
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("decode journal line {}", idx + 1));
                }
            }
        }
        Ok(entries)
    }
}

/// Volatile edit log for tests and standalone runs without a data dir.
#[derive(Default)]
pub struct MemoryEditLog {
    entries: Mutex<Vec<JournalEntry>>,
}

impl MemoryEditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().expect("journal lock").clone()
    }
}

impl EditLog for MemoryEditLog {
    fn append(&self, entry: &JournalEntry) -> anyhow::Result<()> {
        self.entries.lock().expect("journal lock").push(entry.clone());
        Ok(())
    }

    fn load(&self) -> anyhow::Result<Vec<JournalEntry>> {
        Ok(self.entries())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::{
        LoadJobSourceType, PartitionCommitInfo, Quantiles, TableCommitInfo, TxnCoordinator,
        TxnStatus,
    };

    fn txn(txn_id: TxnId) -> TransactionState {
        TransactionState::new(
            1,
            vec![2],
            txn_id,
            format!("label-{txn_id}"),
            TxnCoordinator::fe("127.0.0.1"),
            LoadJobSourceType::Frontend,
            1_000,
            0,
        )
    }

    #[test]
    fn file_log_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("meta").join("txn_journal.log");
        {
            let log = FileEditLog::open(&path, true).expect("open");
            log.append(&JournalEntry::UpsertTransaction(txn(1))).expect("append");
            log.append(&JournalEntry::RemoveTransactions {
                db_id: 1,
                txn_ids: vec![1],
            })
            .expect("append");
        }
        let log = FileEditLog::open(&path, false).expect("reopen");
        let entries = log.load().expect("load");
        assert_eq!(entries.len(), 2);
        match &entries[0] {
            JournalEntry::UpsertTransaction(t) => assert_eq!(t.label, "label-1"),
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[test]
    fn committed_txn_with_commit_infos_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("txn_journal.log");

        let mut committed = txn(7);
        committed.status = TxnStatus::Committed;
        committed.commit_time = 2_000;
        let mut info = PartitionCommitInfo::new(100, 6);
        info.version_time = -2_500;
        info.compaction_score = Quantiles::compute(&[1.0, 3.0]);
        info.first_load_row_counts.insert(1000, 42);
        let mut table = TableCommitInfo::new(10);
        table.partitions.insert(100, info);
        committed.table_commit_infos.insert(10, table);
        committed.ledger.record_error(10_002);
        committed.ledger.record_unknown(10_013);

        let mut visible = committed.clone();
        visible.txn_id = 8;
        visible.status = TxnStatus::Visible;
        visible.finish_time = 3_000;

        {
            let log = FileEditLog::open(&path, true).expect("open");
            log.append(&JournalEntry::UpsertTransaction(committed.clone()))
                .expect("append");
            log.append(&JournalEntry::UpsertTransaction(visible.clone()))
                .expect("append");
        }
        let log = FileEditLog::open(&path, false).expect("reopen");
        let entries = log.load().expect("load");
        assert_eq!(
            entries,
            vec![
                JournalEntry::UpsertTransaction(committed),
                JournalEntry::UpsertTransaction(visible),
            ]
        );
    }

    #[test]
    fn torn_tail_is_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("txn_journal.log");
        let log = FileEditLog::open(&path, false).expect("open");
        log.append(&JournalEntry::UpsertTransaction(txn(1))).expect("append");
        drop(log);
        let mut file = OpenOptions::new().append(true).open(&path).expect("open raw");
        file.write_all(b"{\"op\":\"upsert_tra").expect("write torn tail");
        drop(file);

        let log = FileEditLog::open(&path, false).expect("reopen");
        assert_eq!(log.load().expect("load").len(), 1);
    }

    #[test]
    fn corruption_before_tail_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("txn_journal.log");
        fs::write(&path, "garbage\n").expect("write");
        let log = FileEditLog::open(&path, false).expect("open");
        log.append(&JournalEntry::UpsertTransaction(txn(1))).expect("append");
        assert!(log.load().is_err());
    }
}
