//! Startup recovery
//!
//! Rebuilds the index from the last checkpoint plus the journal:
//!
//! 1. load the checkpoint (if any)
//! 2. group journal records by transaction and redo every commit newer than
//!    the checkpoint; redo is idempotent because entries are installed, not
//!    merged
//! 3. prepared transactions without an outcome become in-doubt; everything
//!    else without a commit is aborted
//! 4. reconcile container bitmaps with the blocks the index references
//! 5. write a fresh checkpoint and drop journal segments it covers

use crate::index::{load_checkpoint, write_checkpoint, BLinkTree, Checkpoint};
use crate::storage::allocator::{Extent, SequenceGenerator};
use crate::storage::container::ContainerSet;
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::journal::{Journal, JournalOp};
use crate::storage::types::{Key, Lsn, TxId, Xid};
use crate::txn::manager::{PendingOp, RecoveredTx};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// What recovery found and did
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub checkpoint_lsn: Lsn,
    pub checkpoint_entries: usize,
    pub records_scanned: u64,
    pub commits_redone: usize,
    pub discarded: usize,
    pub in_doubt: usize,
    pub blocks_reclaimed: u64,
    pub blocks_restored: u64,
}

pub struct RecoveredState {
    pub index: BLinkTree,
    /// Last commit LSN; the visible LSN to start from
    pub visible: Lsn,
    pub in_doubt: Vec<RecoveredTx>,
    pub report: RecoveryReport,
}

/// A transaction seen in the journal without an outcome yet
struct OpenTx {
    xid: Option<Xid>,
    first_lsn: Lsn,
    ops: BTreeMap<Key, PendingOp>,
    prepared: bool,
}

pub fn recover(
    journal: &Journal,
    containers: &ContainerSet,
    checkpoint_path: &Path,
    ids: &SequenceGenerator,
    fanout: usize,
) -> StoreResult<RecoveredState> {
    let index = BLinkTree::new(fanout);
    let mut report = RecoveryReport::default();

    if let Some(checkpoint) = load_checkpoint(checkpoint_path)? {
        report.checkpoint_lsn = checkpoint.lsn;
        report.checkpoint_entries = checkpoint.entries.len();
        for (key, entry) in checkpoint.entries {
            index.insert(key, entry)?;
        }
    }
    let checkpoint_lsn = report.checkpoint_lsn;
    let mut visible = checkpoint_lsn;

    let mut open: HashMap<TxId, OpenTx> = HashMap::new();
    let mut max_tx = 0u64;
    for record in journal.read_from(Lsn::ZERO)? {
        let record = record?;
        report.records_scanned += 1;
        max_tx = max_tx.max(record.tx.0);

        let tx = open.entry(record.tx).or_insert_with(|| OpenTx {
            xid: None,
            first_lsn: record.lsn,
            ops: BTreeMap::new(),
            prepared: false,
        });
        match record.op {
            JournalOp::Begin { xid } => tx.xid = xid,
            JournalOp::Write { key, entry } => {
                tx.ops.insert(key, PendingOp::Write(entry));
            }
            JournalOp::Delete { key } => {
                tx.ops.insert(key, PendingOp::Delete);
            }
            JournalOp::Prepare => tx.prepared = true,
            JournalOp::Commit => {
                let Some(tx) = open.remove(&record.tx) else {
                    continue;
                };
                visible = visible.max(record.lsn);
                // Already part of the checkpoint
                if record.lsn <= checkpoint_lsn {
                    continue;
                }
                for (key, op) in tx.ops {
                    match op {
                        PendingOp::Write(mut entry) => {
                            entry.commit_lsn = record.lsn;
                            index.insert(key, entry)?;
                        }
                        PendingOp::Delete => {
                            index.delete(&key)?;
                        }
                    }
                }
                report.commits_redone += 1;
            }
            JournalOp::Abort => {
                open.remove(&record.tx);
            }
            JournalOp::Checkpoint { .. } => {
                open.remove(&record.tx);
            }
        }
    }
    ids.bump_past(max_tx);

    let mut in_doubt = Vec::new();
    let mut undecided: Vec<(TxId, OpenTx)> = open.into_iter().collect();
    undecided.sort_by_key(|(id, _)| *id);
    for (id, tx) in undecided {
        if tx.prepared {
            in_doubt.push(RecoveredTx {
                id,
                xid: tx.xid,
                first_lsn: tx.first_lsn,
                pending: tx.ops,
            });
        } else {
            journal.append(id, &JournalOp::Abort)?;
            report.discarded += 1;
        }
    }
    report.in_doubt = in_doubt.len();

    // Every block the index or an in-doubt transaction references is live;
    // everything else is a leak from an interrupted transaction.
    let mut referenced: HashMap<u64, Vec<Extent>> = HashMap::new();
    for (_, entry) in index.scan() {
        referenced.entry(entry.file_id).or_default().push(entry.extent());
    }
    for tx in &in_doubt {
        for op in tx.pending.values() {
            if let PendingOp::Write(entry) = op {
                referenced.entry(entry.file_id).or_default().push(entry.extent());
            }
        }
    }
    let reconciled = containers.reconcile(&referenced)?;
    containers.flush_bitmaps()?;
    report.blocks_reclaimed = reconciled.reclaimed;
    report.blocks_restored = reconciled.restored;

    write_checkpoint(
        checkpoint_path,
        &Checkpoint {
            lsn: visible,
            entries: index.scan().collect(),
        },
    )?;
    journal.append_durable(TxId(0), &JournalOp::Checkpoint { lsn: visible })?;
    journal.rotate()?;
    let horizon = in_doubt
        .iter()
        .map(|tx| tx.first_lsn)
        .min()
        .unwrap_or_else(|| journal.next_lsn());
    journal.truncate_before(horizon)?;

    if report.discarded > 0 || report.in_doubt > 0 {
        tracing::warn!(
            "Recovery discarded {} unfinished transactions, {} left in doubt",
            report.discarded,
            report.in_doubt
        );
    }
    tracing::info!(
        "Recovered {} keys at LSN {} ({} journal records, {} commits redone)",
        index.len(),
        visible,
        report.records_scanned,
        report.commits_redone
    );

    let shape = index.check_invariants()?;
    if shape.entries != index.len() {
        return Err(StoreError::Recovery(format!(
            "index holds {} entries but counts {}",
            shape.entries,
            index.len()
        )));
    }

    Ok(RecoveredState {
        index,
        visible,
        in_doubt,
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexEntry;
    use crate::storage::dirhash::DirHash;
    use crate::storage::journal::JournalOptions;
    use crate::storage::types::{Blob, DataType, Record};
    use crate::txn::xfile::XFiles;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    struct Disk {
        dir: TempDir,
    }

    impl Disk {
        fn new() -> Self {
            Self { dir: tempdir().unwrap() }
        }

        fn containers(&self) -> Arc<ContainerSet> {
            let hash = DirHash::open(self.dir.path().join("data"), 1000, 100, 16).unwrap();
            Arc::new(ContainerSet::new(hash, 8))
        }

        fn journal(&self) -> Journal {
            Journal::open(self.dir.path().join("journal"), JournalOptions::default())
                .unwrap()
                .0
        }

        fn ids(&self) -> SequenceGenerator {
            SequenceGenerator::open(self.dir.path().join("tx.seq"), 16).unwrap()
        }

        fn recover(&self) -> RecoveredState {
            self.recover_with(&self.ids())
        }

        fn recover_with(&self, ids: &SequenceGenerator) -> RecoveredState {
            let containers = self.containers();
            let journal = self.journal();
            recover(
                &journal,
                &containers,
                &self.dir.path().join("index.ckpt"),
                ids,
                8,
            )
            .unwrap()
        }
    }

    fn write_blob(files: &XFiles, key: &Key, tx: TxId, data: &[u8]) -> IndexEntry {
        let record = Record::Blob(Blob {
            origin: tx.0,
            version: 1,
            data: data.to_vec(),
        });
        files.write(key, &record, tx).unwrap()
    }

    #[test]
    fn test_committed_redone_uncommitted_discarded() {
        let disk = Disk::new();
        let kept = Key::new("/kept").unwrap();
        let lost = Key::new("/lost").unwrap();
        let commit_lsn;
        {
            let files = XFiles::new(disk.containers(), false);
            let journal = disk.journal();

            let entry = write_blob(&files, &kept, TxId(1), b"kept");
            journal.append(TxId(1), &JournalOp::Begin { xid: None }).unwrap();
            journal
                .append(TxId(1), &JournalOp::Write { key: kept.clone(), entry })
                .unwrap();
            files.sync(files.containers().file_id_for(&kept)).unwrap();
            commit_lsn = journal.append_durable(TxId(1), &JournalOp::Commit).unwrap();

            // Crash before the commit marker
            let entry = write_blob(&files, &lost, TxId(2), b"lost");
            journal.append(TxId(2), &JournalOp::Begin { xid: None }).unwrap();
            journal
                .append(TxId(2), &JournalOp::Write { key: lost.clone(), entry })
                .unwrap();
            journal.sync().unwrap();
            files.containers().flush_bitmaps().unwrap();
        }

        let ids = disk.ids();
        let state = disk.recover_with(&ids);
        assert_eq!(state.visible, commit_lsn);
        assert_eq!(state.report.commits_redone, 1);
        assert_eq!(state.report.discarded, 1);
        assert!(state.report.blocks_reclaimed > 0);

        let entry = state.index.lookup(&kept).unwrap().unwrap();
        assert_eq!(entry.commit_lsn, commit_lsn);
        assert_eq!(entry.data_type, DataType::Blob);
        assert!(state.index.lookup(&lost).unwrap().is_none());

        // Transaction ids continue past everything journaled
        assert!(ids.next_id().unwrap() > 2);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let disk = Disk::new();
        let key = Key::new("/twice").unwrap();
        {
            let files = XFiles::new(disk.containers(), false);
            let journal = disk.journal();
            let entry = write_blob(&files, &key, TxId(1), b"once");
            journal.append(TxId(1), &JournalOp::Begin { xid: None }).unwrap();
            journal
                .append(TxId(1), &JournalOp::Write { key: key.clone(), entry })
                .unwrap();
            journal.append_durable(TxId(1), &JournalOp::Commit).unwrap();
        }

        let first = disk.recover();
        let entries_first: Vec<_> = first.index.scan().collect();
        drop(first);

        let second = disk.recover();
        let entries_second: Vec<_> = second.index.scan().collect();
        assert_eq!(entries_first, entries_second);
        // The checkpoint already covers the commit
        assert_eq!(second.report.commits_redone, 0);
        assert_eq!(second.report.checkpoint_entries, 1);
    }

    /// A crash after the bitmaps were flushed but before the checkpoint
    /// landed leaves the whole journal to be redone again on restart.
    #[test]
    fn test_same_journal_redone_twice() {
        let disk = Disk::new();
        let keys: Vec<Key> = (0..6)
            .map(|n| Key::new(format!("/redo/{}", n)).unwrap())
            .collect();
        {
            let files = XFiles::new(disk.containers(), false);
            let journal = disk.journal();
            for (n, key) in keys.iter().enumerate() {
                let tx = TxId(n as u64 + 1);
                let entry = write_blob(&files, key, tx, &vec![n as u8; 3000]);
                journal.append(tx, &JournalOp::Begin { xid: None }).unwrap();
                journal
                    .append(tx, &JournalOp::Write { key: key.clone(), entry })
                    .unwrap();
                files.sync(files.containers().file_id_for(key)).unwrap();
                journal.append_durable(tx, &JournalOp::Commit).unwrap();
            }
            // A delete and an overwrite redone over the earlier commits
            let tx = TxId(10);
            let entry = write_blob(&files, &keys[1], tx, b"rewritten");
            journal.append(tx, &JournalOp::Begin { xid: None }).unwrap();
            journal
                .append(tx, &JournalOp::Delete { key: keys[0].clone() })
                .unwrap();
            journal
                .append(tx, &JournalOp::Write { key: keys[1].clone(), entry })
                .unwrap();
            files.sync(files.containers().file_id_for(&keys[1])).unwrap();
            journal.append_durable(tx, &JournalOp::Commit).unwrap();
            files.containers().flush_bitmaps().unwrap();
        }

        let journal_dir = disk.dir.path().join("journal");
        let segments: Vec<(std::path::PathBuf, Vec<u8>)> = std::fs::read_dir(&journal_dir)
            .unwrap()
            .map(|e| {
                let path = e.unwrap().path();
                let bytes = std::fs::read(&path).unwrap();
                (path, bytes)
            })
            .collect();

        let replay = || {
            let containers = disk.containers();
            let state = recover(
                &disk.journal(),
                &containers,
                &disk.dir.path().join("index.ckpt"),
                &disk.ids(),
                4,
            )
            .unwrap();
            (state, containers)
        };

        let (first, first_files) = replay();
        assert_eq!(first.report.commits_redone, 7);
        assert!(first.report.blocks_reclaimed > 0);
        let first_image: Vec<(Key, IndexEntry)> = first.index.scan().collect();
        let first_used = first_files.stats().used_blocks;
        drop((first, first_files));

        // Put the journal back as it was and lose the checkpoint
        std::fs::remove_file(disk.dir.path().join("index.ckpt")).unwrap();
        for entry in std::fs::read_dir(&journal_dir).unwrap() {
            std::fs::remove_file(entry.unwrap().path()).unwrap();
        }
        for (path, bytes) in &segments {
            std::fs::write(path, bytes).unwrap();
        }

        let (second, second_files) = replay();
        assert_eq!(second.report.checkpoint_entries, 0);
        assert_eq!(second.report.commits_redone, 7);
        // The bitmaps written by the first pass already agree with the index
        assert_eq!(second.report.blocks_reclaimed, 0);
        assert_eq!(second.report.blocks_restored, 0);
        let second_image: Vec<(Key, IndexEntry)> = second.index.scan().collect();
        assert_eq!(first_image, second_image);
        assert_eq!(second_files.stats().used_blocks, first_used);

        // Referenced blocks plus one header block per container
        let referenced: u64 = second_image.iter().map(|(_, e)| e.length).sum();
        let headers = second_files.stats().containers as u64;
        assert_eq!(first_used, referenced + headers);
        assert!(second.index.lookup(&keys[0]).unwrap().is_none());
        let files = XFiles::new(second_files, false);
        for (key, entry) in &second_image {
            let Record::Blob(blob) = files.read(key, entry).unwrap() else {
                panic!("{} is not a blob", key);
            };
            if key == &keys[1] {
                assert_eq!(blob.data, b"rewritten");
            } else {
                assert_eq!(blob.data.len(), 3000);
            }
        }
    }

    #[test]
    fn test_prepared_transaction_left_in_doubt() {
        let disk = Disk::new();
        let key = Key::new("/xa/pending").unwrap();
        let xid = Xid::new(1, b"global".to_vec(), b"branch".to_vec());
        {
            let files = XFiles::new(disk.containers(), false);
            let journal = disk.journal();
            let entry = write_blob(&files, &key, TxId(5), b"undecided");
            journal
                .append(TxId(5), &JournalOp::Begin { xid: Some(xid.clone()) })
                .unwrap();
            journal
                .append(TxId(5), &JournalOp::Write { key: key.clone(), entry })
                .unwrap();
            journal.append_durable(TxId(5), &JournalOp::Prepare).unwrap();
        }

        let state = disk.recover();
        assert_eq!(state.in_doubt.len(), 1);
        let tx = &state.in_doubt[0];
        assert_eq!(tx.id, TxId(5));
        assert_eq!(tx.xid.as_ref(), Some(&xid));
        assert!(tx.pending.contains_key(&key));
        // Not visible until resolved
        assert!(state.index.lookup(&key).unwrap().is_none());
        // Its blocks were not reclaimed
        assert_eq!(state.report.blocks_reclaimed, 0);
        drop(state);

        // Still in doubt after another restart
        assert_eq!(disk.recover().in_doubt.len(), 1);
    }
}
