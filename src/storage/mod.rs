//! Durability layer: write-ahead log, atomic snapshots, and recovery.
//!
//! [`AtomicPersistence`] orchestrates the pieces. Durable operations
//! append exactly one WAL record each and never mutate the in-memory
//! database; the facade has already done that and rolls its mutation
//! back if the append fails. Snapshots serialize the full maps through
//! [`AtomicFileWriter`], then the WAL records a CHECKPOINT, rotates to a
//! fresh segment, and deletes the superseded ones.
//!
//! Recovery is driven through the [`RecoveryStateMachine`]: analysis
//! probes the snapshot header and the log directory, replay loads the
//! snapshot and applies every intact record with
//! `sequence ≥ snapshot_sequence + 1` in order.

pub mod recovery;
pub mod snapshot;
pub mod wal;
pub mod writer;

pub use recovery::{
    AnalysisVerdict, RecoveryEvent, RecoveryInfo, RecoveryState, RecoveryStateMachine,
};
pub use wal::{CommitLog, LogEntry, LogEntryType, WalStats};
pub use writer::AtomicFileWriter;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::PersistenceConfig;
use crate::error::{Result, StorageError, VexDBError};
use crate::types::Vector;

/// Counters aggregated from the persistence layer.
#[derive(Clone, Debug, Default, Serialize)]
pub struct PersistenceStats {
    /// INSERT records appended (including replayed ones).
    pub total_logged_inserts: u64,
    /// UPDATE records appended (including replayed ones).
    pub total_logged_updates: u64,
    /// DELETE records appended (including replayed ones).
    pub total_logged_deletes: u64,
    /// Snapshots completed.
    pub total_checkpoints: u64,
    /// Explicit flushes requested.
    pub total_flushes: u64,
    /// Highest sequence applied during the last recovery.
    pub last_replayed_sequence: u64,
    /// Durable operations since the last snapshot.
    pub ops_since_last_checkpoint: u64,
    /// Whether recovery is in progress right now.
    pub recovering: bool,
    /// Commit log counters.
    pub wal: WalStats,
}

#[derive(Default)]
struct Counters {
    total_logged_inserts: u64,
    total_logged_updates: u64,
    total_logged_deletes: u64,
    total_checkpoints: u64,
    total_flushes: u64,
    last_replayed_sequence: u64,
    ops_since_last_checkpoint: u64,
}

struct PersistenceState {
    log: Option<CommitLog>,
    counters: Counters,
    recovery_state: RecoveryState,
    recovery_info: RecoveryInfo,
    last_checkpoint_wal_seq: u64,
}

/// WAL + snapshot orchestration.
///
/// Thread-safe behind an internal mutex; the facade holds its database
/// lock while calling in, so WAL append order matches mutation order.
pub struct AtomicPersistence {
    config: PersistenceConfig,
    snapshot_path: PathBuf,
    state: Mutex<PersistenceState>,
    recovering: AtomicBool,
}

impl AtomicPersistence {
    /// Creates the layer; no files are touched until `initialize()`.
    pub fn new(config: PersistenceConfig) -> Self {
        let snapshot_path = config.data_directory.join("main.db");
        Self {
            config,
            snapshot_path,
            state: Mutex::new(PersistenceState {
                log: None,
                counters: Counters::default(),
                recovery_state: RecoveryState::Uninitialized,
                recovery_info: RecoveryInfo::default(),
                last_checkpoint_wal_seq: 0,
            }),
            recovering: AtomicBool::new(false),
        }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, PersistenceState>> {
        self.state
            .lock()
            .map_err(|_| VexDBError::poisoned("persistence state"))
    }

    /// Path of the snapshot file (`<data_directory>/main.db`).
    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Active configuration.
    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    /// Creates directories, sweeps stale snapshot temporaries, and opens
    /// the commit log.
    pub fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.config.data_directory)?;
        fs::create_dir_all(&self.config.log_directory)?;
        self.sweep_stale_temporaries()?;

        let mut state = self.lock_state()?;
        if state.log.is_none() {
            state.log = Some(CommitLog::open(
                &self.config.log_directory,
                self.config.log_rotation_size,
                self.config.max_log_files,
            )?);
        }
        Ok(())
    }

    /// Removes interrupted snapshot writes left behind by a crash.
    fn sweep_stale_temporaries(&self) -> Result<()> {
        for entry in fs::read_dir(&self.config.data_directory)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().contains(".tmp.") {
                warn!(file = %entry.path().display(), "removing stale snapshot temporary");
                let _ = fs::remove_file(entry.path());
            }
        }
        Ok(())
    }

    /// Flushes the WAL. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        let mut state = self.lock_state()?;
        if let Some(log) = state.log.as_mut() {
            log.flush()?;
        }
        Ok(())
    }

    fn append_with<F>(&self, f: F) -> Result<u64>
    where
        F: FnOnce(&mut CommitLog) -> Result<u64>,
    {
        if self.recovering.load(Ordering::Acquire) {
            return Err(VexDBError::NotInitialized);
        }
        let mut state = self.lock_state()?;
        let log = state.log.as_mut().ok_or(VexDBError::NotInitialized)?;
        let seq = f(log)?;
        state.counters.ops_since_last_checkpoint += 1;
        Ok(seq)
    }

    /// Appends an INSERT record. The caller has already mutated the maps.
    pub fn log_insert(&self, key: &str, vector: &Vector, metadata: &str) -> Result<u64> {
        let seq = self.append_with(|log| log.append_insert(key, vector, metadata))?;
        self.lock_state()?.counters.total_logged_inserts += 1;
        Ok(seq)
    }

    /// Appends an UPDATE record. The caller has already mutated the maps.
    pub fn log_update(&self, key: &str, vector: &Vector, metadata: &str) -> Result<u64> {
        let seq = self.append_with(|log| log.append_update(key, vector, metadata))?;
        self.lock_state()?.counters.total_logged_updates += 1;
        Ok(seq)
    }

    /// Appends a DELETE record. The caller has already mutated the maps.
    pub fn log_remove(&self, key: &str) -> Result<u64> {
        let seq = self.append_with(|log| log.append_delete(key))?;
        self.lock_state()?.counters.total_logged_deletes += 1;
        Ok(seq)
    }

    /// Fsyncs the WAL.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.lock_state()?;
        let log = state.log.as_mut().ok_or(VexDBError::NotInitialized)?;
        log.flush()?;
        state.counters.total_flushes += 1;
        Ok(())
    }

    /// Appends a COMMIT marker and flushes. A marker-only checkpoint;
    /// the real snapshot goes through [`AtomicPersistence::save_snapshot`].
    pub fn checkpoint_marker(&self) -> Result<()> {
        let mut state = self.lock_state()?;
        let log = state.log.as_mut().ok_or(VexDBError::NotInitialized)?;
        log.append_commit()?;
        log.flush()?;
        Ok(())
    }

    /// Writes a snapshot of the maps, then records the checkpoint in the
    /// WAL, rotates to a fresh segment, and deletes superseded segments.
    ///
    /// After this returns, at most one live WAL segment remains.
    pub fn save_snapshot(
        &self,
        vectors: &HashMap<String, Vector>,
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        let mut state = self.lock_state()?;
        let log = state.log.as_mut().ok_or(VexDBError::NotInitialized)?;

        // Last sequence actually written, 0 on a virgin log.
        let next = log.stats().next_sequence;
        let sequence = next.saturating_sub(1);

        snapshot::write_snapshot(&self.snapshot_path, vectors, metadata, sequence)?;

        let snapshot_name = self.snapshot_path.to_string_lossy().into_owned();
        log.append_checkpoint(sequence, &snapshot_name)?;
        log.flush()?;
        log.rotate()?;
        log.retain_only_current()?;

        state.counters.total_checkpoints += 1;
        state.counters.ops_since_last_checkpoint = 0;
        state.last_checkpoint_wal_seq = sequence;

        info!(
            sequence,
            entries = vectors.len(),
            "checkpoint complete, WAL rotated"
        );
        Ok(())
    }

    /// True when enough operations accumulated or the active WAL segment
    /// outgrew the rotation bound.
    pub fn should_checkpoint(&self) -> bool {
        let Ok(state) = self.state.lock() else {
            return false;
        };
        let ops_due =
            state.counters.ops_since_last_checkpoint >= self.config.checkpoint_trigger_ops;
        let wal_big = state
            .log
            .as_ref()
            .map(|log| log.stats().current_log_size >= self.config.log_rotation_size)
            .unwrap_or(false);
        ops_due || wal_big
    }

    /// Resets the since-last-checkpoint counter. Idempotent; also done
    /// internally by `save_snapshot`.
    pub fn on_checkpoint_completed(&self) -> Result<()> {
        self.lock_state()?.counters.ops_since_last_checkpoint = 0;
        Ok(())
    }

    /// Recovers the maps from the latest snapshot plus WAL replay,
    /// driving the recovery state machine through its phases.
    ///
    /// On success the maps hold exactly the durable state and the
    /// machine reached READY. A corrupted snapshot surfaces as a
    /// [`StorageError`] and the machine parks in ERROR.
    pub fn load_database(
        &self,
        vectors: &mut HashMap<String, Vector>,
        metadata: &mut HashMap<String, String>,
    ) -> Result<()> {
        self.recovering.store(true, Ordering::Release);
        let result = self.load_database_inner(vectors, metadata);
        self.recovering.store(false, Ordering::Release);
        result
    }

    fn load_database_inner(
        &self,
        vectors: &mut HashMap<String, Vector>,
        metadata: &mut HashMap<String, String>,
    ) -> Result<()> {
        let mut machine = RecoveryStateMachine::new(
            &self.config.data_directory,
            &self.config.log_directory,
        );

        let analysis = machine.process_event(RecoveryEvent::StartAnalysis);
        let mut state = self.lock_state()?;

        if let Err(e) = analysis {
            state.recovery_state = machine.state();
            state.recovery_info = machine.info().clone();
            return Err(e);
        }

        match machine.state() {
            RecoveryState::Ready => {
                // Clean start: nothing on disk.
                vectors.clear();
                metadata.clear();
                state.counters.last_replayed_sequence = 0;
            }
            RecoveryState::RecoveryNeeded => {
                if !self.config.auto_recovery {
                    state.recovery_state = machine.state();
                    state.recovery_info = machine.info().clone();
                    return Err(StorageError::RecoveryRequired(
                        "on-disk state present and auto_recovery is disabled".to_string(),
                    )
                    .into());
                }

                let log = state.log.as_ref().ok_or(VexDBError::NotInitialized)?;
                let validate = self.config.validate_checksums;
                let mut replay_stats = (0u64, 0u64, 0u64, 0u64); // ins, upd, del, max_seq

                let replayed = machine.run_recovery_with(|info| {
                    replay(
                        info,
                        log,
                        validate,
                        vectors,
                        metadata,
                        &mut replay_stats,
                    )
                });
                if let Err(e) = replayed {
                    state.recovery_state = machine.state();
                    state.recovery_info = machine.info().clone();
                    return Err(e);
                }
                machine.process_event(RecoveryEvent::RecoveryComplete)?;

                let (ins, upd, del, max_seq) = replay_stats;
                state.counters.total_logged_inserts += ins;
                state.counters.total_logged_updates += upd;
                state.counters.total_logged_deletes += del;
                state.counters.last_replayed_sequence = max_seq;
                info!(
                    inserts = ins,
                    updates = upd,
                    deletes = del,
                    last_sequence = max_seq,
                    entries = vectors.len(),
                    "recovery replay complete"
                );
            }
            RecoveryState::Corrupted => {
                let message = machine
                    .info()
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "snapshot failed validation".to_string());
                // No repair hook installed by default: declare failure.
                machine.process_event(RecoveryEvent::FailureDetected)?;
                machine.process_event(RecoveryEvent::FailureDetected)?;
                state.recovery_state = machine.state();
                state.recovery_info = machine.info().clone();
                return Err(StorageError::corrupted(message).into());
            }
            other => {
                return Err(StorageError::recovery_failed(format!(
                    "unexpected recovery state {other}"
                ))
                .into());
            }
        }

        state.recovery_state = machine.state();
        state.recovery_info = machine.info().clone();
        Ok(())
    }

    /// True while `load_database` is running.
    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::Acquire)
    }

    /// Findings of the last recovery analysis.
    pub fn recovery_info(&self) -> Result<RecoveryInfo> {
        Ok(self.lock_state()?.recovery_info.clone())
    }

    /// Final state of the last recovery run.
    pub fn recovery_state(&self) -> Result<RecoveryState> {
        Ok(self.lock_state()?.recovery_state)
    }

    /// Counter snapshot.
    pub fn statistics(&self) -> Result<PersistenceStats> {
        let state = self.lock_state()?;
        Ok(PersistenceStats {
            total_logged_inserts: state.counters.total_logged_inserts,
            total_logged_updates: state.counters.total_logged_updates,
            total_logged_deletes: state.counters.total_logged_deletes,
            total_checkpoints: state.counters.total_checkpoints,
            total_flushes: state.counters.total_flushes,
            last_replayed_sequence: state.counters.last_replayed_sequence,
            ops_since_last_checkpoint: state.counters.ops_since_last_checkpoint,
            recovering: self.is_recovering(),
            wal: state
                .log
                .as_ref()
                .map(|log| log.stats())
                .unwrap_or_default(),
        })
    }

    /// Fails WAL appends after `n` more succeed. Test-only fault
    /// injection, reachable through the facade's hidden hook.
    #[doc(hidden)]
    pub fn inject_append_failures_after(&self, n: u64) -> Result<()> {
        let mut state = self.lock_state()?;
        let log = state.log.as_mut().ok_or(VexDBError::NotInitialized)?;
        log.fail_appends_after(n);
        Ok(())
    }
}

/// Applies every intact record with `sequence ≥ snapshot_sequence + 1`
/// onto the maps, in sequence order.
fn replay(
    info: &RecoveryInfo,
    log: &CommitLog,
    validate: bool,
    vectors: &mut HashMap<String, Vector>,
    metadata: &mut HashMap<String, String>,
    stats: &mut (u64, u64, u64, u64),
) -> Result<()> {
    let snapshot_seq = match &info.last_checkpoint_file {
        Some(path) => {
            let (loaded_vectors, loaded_metadata, seq) = snapshot::read_snapshot(path)?;
            *vectors = loaded_vectors;
            *metadata = loaded_metadata;
            seq
        }
        None => {
            vectors.clear();
            metadata.clear();
            0
        }
    };

    let since = snapshot_seq + 1;
    let entries = log.read_entries_since(since, validate)?;
    debug!(since, count = entries.len(), "replaying WAL records");

    let mut max_seq = snapshot_seq;
    for entry in entries {
        match entry.entry_type {
            LogEntryType::Insert | LogEntryType::Update => {
                let Some(record) = wal::decode_vector_record(&entry.data) else {
                    warn!(sequence = entry.sequence, "skipping undecodable record");
                    continue;
                };
                if record.metadata.is_empty() {
                    metadata.remove(&record.key);
                } else {
                    metadata.insert(record.key.clone(), record.metadata);
                }
                vectors.insert(record.key, record.vector);
                if entry.entry_type == LogEntryType::Insert {
                    stats.0 += 1;
                } else {
                    stats.1 += 1;
                }
            }
            LogEntryType::Delete => {
                let Some(key) = wal::decode_delete_record(&entry.data) else {
                    warn!(sequence = entry.sequence, "skipping undecodable record");
                    continue;
                };
                vectors.remove(&key);
                metadata.remove(&key);
                stats.2 += 1;
            }
            LogEntryType::Checkpoint | LogEntryType::Commit => {}
        }
        max_seq = max_seq.max(entry.sequence);
    }
    stats.3 = max_seq;
    Ok(())
}
