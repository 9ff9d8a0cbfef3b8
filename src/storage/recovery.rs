//! Recovery workflow state machine.
//!
//! Phases the crash-recovery workflow and guards illegal transitions.
//! The legal transition table:
//!
//! ```text
//! UNINITIALIZED  → ANALYZING
//! ANALYZING      → CLEAN | RECOVERY_NEEDED | CORRUPTED
//! CLEAN          → READY
//! RECOVERY_NEEDED→ RECOVERING
//! RECOVERING     → RECOVERED | CORRUPTED | FAILED
//! RECOVERED      → READY
//! CORRUPTED      → REPAIR | FAILED
//! REPAIR         → RECOVERED | FAILED
//! FAILED         → ERROR
//! ERROR          → ANALYZING   (manual intervention)
//! READY          → (terminal)
//! ```
//!
//! Any other transition is a programmer error and returns
//! [`StorageError::InvalidTransition`].
//!
//! Hooks for analysis, recovery, repair, and validation are injectable;
//! absent hooks, defaults run (header probes for analysis, no-ops for
//! the rest; the persistence layer supplies the real replay closure).

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Result, StorageError};
use crate::storage::snapshot;
use crate::storage::wal::CommitLog;

/// High-level phase of the recovery workflow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RecoveryState {
    /// Machine constructed, nothing examined yet.
    Uninitialized,
    /// On-disk state is being examined.
    Analyzing,
    /// Nothing on disk needs replay.
    Clean,
    /// A snapshot and/or WAL segments await replay.
    RecoveryNeeded,
    /// Replay in progress.
    Recovering,
    /// Replay finished, awaiting validation.
    Recovered,
    /// On-disk state failed validation.
    Corrupted,
    /// A repair hook is running.
    Repair,
    /// Recovery or repair failed.
    Failed,
    /// Database is usable. Terminal.
    Ready,
    /// Unrecoverable without manual intervention.
    Error,
}

impl RecoveryState {
    /// Upper-case name matching the on-wire/status convention.
    pub fn name(self) -> &'static str {
        match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::Analyzing => "ANALYZING",
            Self::Clean => "CLEAN",
            Self::RecoveryNeeded => "RECOVERY_NEEDED",
            Self::Recovering => "RECOVERING",
            Self::Recovered => "RECOVERED",
            Self::Corrupted => "CORRUPTED",
            Self::Repair => "REPAIR",
            Self::Failed => "FAILED",
            Self::Ready => "READY",
            Self::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Events that drive the machine between phases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryEvent {
    /// Begin examining on-disk state.
    StartAnalysis,
    /// Acknowledge a clean analysis.
    AnalysisComplete,
    /// Begin replaying.
    RecoveryStart,
    /// Validate the replayed state.
    RecoveryComplete,
    /// Corruption observed mid-recovery.
    CorruptionDetected,
    /// Unrecoverable failure observed.
    FailureDetected,
    /// Begin a repair attempt.
    RepairStart,
    /// Operator restarted the workflow after ERROR.
    ManualIntervention,
}

/// Verdict produced by the analysis phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum AnalysisVerdict {
    /// No snapshot and no WAL segments.
    #[default]
    Clean,
    /// Valid on-disk state exists and must be replayed.
    RecoveryNeeded,
    /// The snapshot header failed validation.
    Corrupted,
}

/// Findings of the analysis phase, surfaced in status reporting.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RecoveryInfo {
    /// What analysis concluded.
    pub verdict: AnalysisVerdict,
    /// Snapshot file, when one exists and validated.
    pub last_checkpoint_file: Option<PathBuf>,
    /// WAL sequence recorded in the snapshot header.
    pub last_checkpoint_sequence: u64,
    /// WAL segments found on disk.
    pub log_files: Vec<PathBuf>,
    /// Failure detail, when analysis or recovery failed.
    pub error_message: Option<String>,
}

/// Injectable analysis hook.
pub type AnalysisHook = Box<dyn Fn() -> Result<RecoveryInfo> + Send + Sync>;
/// Injectable recovery observer, run before the driver's replay closure.
pub type RecoveryHook = Box<dyn Fn(&RecoveryInfo) -> Result<()> + Send + Sync>;
/// Injectable repair hook. Without one, CORRUPTED routes to FAILED.
pub type RepairHook = Box<dyn Fn() -> Result<()> + Send + Sync>;
/// Injectable validation hook, run between RECOVERED and READY.
pub type ValidationHook = Box<dyn Fn() -> Result<()> + Send + Sync>;

/// The recovery workflow driver.
pub struct RecoveryStateMachine {
    state: RecoveryState,
    entered_at: Instant,
    data_dir: PathBuf,
    log_dir: PathBuf,
    info: RecoveryInfo,
    error_message: Option<String>,
    analysis_hook: Option<AnalysisHook>,
    recovery_hook: Option<RecoveryHook>,
    repair_hook: Option<RepairHook>,
    validation_hook: Option<ValidationHook>,
}

impl RecoveryStateMachine {
    /// Creates a machine examining the given directories.
    pub fn new(data_dir: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            state: RecoveryState::Uninitialized,
            entered_at: Instant::now(),
            data_dir: data_dir.into(),
            log_dir: log_dir.into(),
            info: RecoveryInfo::default(),
            error_message: None,
            analysis_hook: None,
            recovery_hook: None,
            repair_hook: None,
            validation_hook: None,
        }
    }

    /// Installs optional hooks; `None` keeps the default behavior.
    pub fn set_hooks(
        &mut self,
        analysis: Option<AnalysisHook>,
        recovery: Option<RecoveryHook>,
        repair: Option<RepairHook>,
        validation: Option<ValidationHook>,
    ) {
        self.analysis_hook = analysis;
        self.recovery_hook = recovery;
        self.repair_hook = repair;
        self.validation_hook = validation;
    }

    /// Current phase.
    pub fn state(&self) -> RecoveryState {
        self.state
    }

    /// Time spent in the current phase.
    pub fn time_in_state(&self) -> Duration {
        self.entered_at.elapsed()
    }

    /// Analysis findings gathered so far.
    pub fn info(&self) -> &RecoveryInfo {
        &self.info
    }

    /// Last failure message, if any phase failed.
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// True while a repair hook is installed.
    pub fn has_repair_hook(&self) -> bool {
        self.repair_hook.is_some()
    }

    /// Resets to UNINITIALIZED, discarding findings.
    pub fn reset(&mut self) {
        self.state = RecoveryState::Uninitialized;
        self.entered_at = Instant::now();
        self.info = RecoveryInfo::default();
        self.error_message = None;
    }

    fn can_transition(from: RecoveryState, to: RecoveryState) -> bool {
        use RecoveryState::*;
        match from {
            Uninitialized => to == Analyzing,
            Analyzing => matches!(to, Clean | RecoveryNeeded | Corrupted),
            Clean => to == Ready,
            RecoveryNeeded => to == Recovering,
            Recovering => matches!(to, Recovered | Corrupted | Failed),
            Recovered => to == Ready,
            Corrupted => matches!(to, Repair | Failed),
            Repair => matches!(to, Recovered | Failed),
            Failed => to == Error,
            Ready => false,
            Error => to == Analyzing,
        }
    }

    fn transition(&mut self, to: RecoveryState) -> Result<()> {
        if !Self::can_transition(self.state, to) {
            return Err(StorageError::InvalidTransition {
                from: self.state.name(),
                to: to.name(),
            }
            .into());
        }
        info!(from = %self.state, to = %to, "recovery state transition");
        self.state = to;
        self.entered_at = Instant::now();
        Ok(())
    }

    /// Feeds one event into the machine.
    ///
    /// Compound phases run inline: `StartAnalysis` performs the analysis
    /// and lands in CLEAN→READY, RECOVERY_NEEDED, or CORRUPTED.
    /// An event that has no meaning in the current phase is rejected as
    /// an invalid transition.
    pub fn process_event(&mut self, event: RecoveryEvent) -> Result<()> {
        use RecoveryEvent::*;
        use RecoveryState::*;

        match (self.state, event) {
            (Uninitialized, StartAnalysis) => {
                self.transition(Analyzing)?;
                self.run_analysis()
            }
            (Error, ManualIntervention) => {
                self.transition(Analyzing)?;
                self.error_message = None;
                self.run_analysis()
            }
            (Clean, AnalysisComplete) => self.transition(Ready),
            (RecoveryNeeded, RecoveryStart) => self.run_recovery_with(|_| Ok(())),
            (Recovered, RecoveryComplete) => self.run_validation(),
            (Recovering, CorruptionDetected) => self.transition(Corrupted),
            (Recovering, FailureDetected) | (Corrupted, FailureDetected) => {
                self.transition(Failed)
            }
            (Failed, FailureDetected) => self.transition(Error),
            (Corrupted, RepairStart) => self.run_repair(),
            (state, event) => Err(StorageError::InvalidTransition {
                from: state.name(),
                to: event_target_name(event),
            }
            .into()),
        }
    }

    /// Runs the replay phase with the driver's closure.
    ///
    /// Transitions RECOVERY_NEEDED → RECOVERING, runs the installed
    /// observer hook (if any) and then `replay`; success lands in
    /// RECOVERED, failure in FAILED with the message recorded.
    pub fn run_recovery_with<F>(&mut self, replay: F) -> Result<()>
    where
        F: FnOnce(&RecoveryInfo) -> Result<()>,
    {
        self.transition(RecoveryState::Recovering)?;

        let hook_result = match &self.recovery_hook {
            Some(hook) => hook(&self.info),
            None => Ok(()),
        };
        let result = hook_result.and_then(|()| replay(&self.info));

        match result {
            Ok(()) => self.transition(RecoveryState::Recovered),
            Err(e) => {
                warn!(error = %e, "recovery replay failed");
                self.error_message = Some(e.to_string());
                self.transition(RecoveryState::Failed)?;
                Err(e)
            }
        }
    }

    fn run_analysis(&mut self) -> Result<()> {
        let analysis = match &self.analysis_hook {
            Some(hook) => hook(),
            None => self.analyze_system_state(),
        };

        match analysis {
            Ok(info) => {
                self.info = info;
                match self.info.verdict {
                    AnalysisVerdict::Clean => {
                        self.transition(RecoveryState::Clean)?;
                        self.process_event(RecoveryEvent::AnalysisComplete)
                    }
                    AnalysisVerdict::RecoveryNeeded => {
                        self.transition(RecoveryState::RecoveryNeeded)
                    }
                    AnalysisVerdict::Corrupted => self.transition(RecoveryState::Corrupted),
                }
            }
            Err(e) => {
                self.error_message = Some(e.to_string());
                // Analysis itself blew up: corrupted is the only honest verdict.
                self.info.verdict = AnalysisVerdict::Corrupted;
                self.transition(RecoveryState::Corrupted)?;
                Err(e)
            }
        }
    }

    fn run_validation(&mut self) -> Result<()> {
        let result = match &self.validation_hook {
            Some(hook) => hook(),
            None => Ok(()),
        };
        match result {
            Ok(()) => self.transition(RecoveryState::Ready),
            Err(e) => {
                self.error_message = Some(e.to_string());
                self.transition(RecoveryState::Failed)?;
                Err(e)
            }
        }
    }

    fn run_repair(&mut self) -> Result<()> {
        self.transition(RecoveryState::Repair)?;
        let result = match &self.repair_hook {
            Some(hook) => hook(),
            None => Err(StorageError::recovery_failed("no repair hook installed").into()),
        };
        match result {
            Ok(()) => self.transition(RecoveryState::Recovered),
            Err(e) => {
                self.error_message = Some(e.to_string());
                self.transition(RecoveryState::Failed)?;
                Err(e)
            }
        }
    }

    /// Default analysis: probe the snapshot header, then list WAL
    /// segments.
    fn analyze_system_state(&self) -> Result<RecoveryInfo> {
        let mut info = RecoveryInfo::default();
        let snapshot_path = self.data_dir.join("main.db");

        if snapshot_path.exists() {
            if snapshot::validate_header(&snapshot_path) {
                info.verdict = AnalysisVerdict::RecoveryNeeded;
                info.last_checkpoint_sequence = snapshot::read_sequence(&snapshot_path);
                info.last_checkpoint_file = Some(snapshot_path);
                info.log_files = Self::find_log_files(&self.log_dir)?;
            } else {
                info.verdict = AnalysisVerdict::Corrupted;
                info.error_message = Some(format!(
                    "snapshot header failed validation: {}",
                    snapshot_path.display()
                ));
            }
            return Ok(info);
        }

        let logs = Self::find_log_files(&self.log_dir)?;
        if logs.is_empty() {
            info.verdict = AnalysisVerdict::Clean;
        } else {
            info.verdict = AnalysisVerdict::RecoveryNeeded;
            info.log_files = logs;
        }
        Ok(info)
    }

    /// WAL segments that actually contain bytes. A just-created empty
    /// segment is not evidence of prior state.
    fn find_log_files(log_dir: &Path) -> Result<Vec<PathBuf>> {
        Ok(CommitLog::list_segments(log_dir)?
            .into_iter()
            .filter(|path| {
                std::fs::metadata(path)
                    .map(|m| m.len() > 0)
                    .unwrap_or(false)
            })
            .collect())
    }
}

fn event_target_name(event: RecoveryEvent) -> &'static str {
    use RecoveryEvent::*;
    match event {
        StartAnalysis | ManualIntervention => "ANALYZING",
        AnalysisComplete => "READY",
        RecoveryStart => "RECOVERING",
        RecoveryComplete => "READY",
        CorruptionDetected => "CORRUPTED",
        FailureDetected => "FAILED",
        RepairStart => "REPAIR",
    }
}

impl std::fmt::Debug for RecoveryStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryStateMachine")
            .field("state", &self.state)
            .field("data_dir", &self.data_dir)
            .field("log_dir", &self.log_dir)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn machine(dir: &Path) -> RecoveryStateMachine {
        RecoveryStateMachine::new(dir.join("data"), dir.join("logs"))
    }

    #[test]
    fn test_clean_start_reaches_ready() {
        let dir = tempdir().unwrap();
        let mut sm = machine(dir.path());
        sm.process_event(RecoveryEvent::StartAnalysis).unwrap();
        assert_eq!(sm.state(), RecoveryState::Ready);
        assert_eq!(sm.info().verdict, AnalysisVerdict::Clean);
    }

    #[test]
    fn test_logs_trigger_recovery_needed() {
        let dir = tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let mut log = CommitLog::open(&log_dir, 1 << 20, 4).unwrap();
        log.append_commit().unwrap();

        let mut sm = machine(dir.path());
        sm.process_event(RecoveryEvent::StartAnalysis).unwrap();
        assert_eq!(sm.state(), RecoveryState::RecoveryNeeded);
        assert_eq!(sm.info().log_files.len(), 1);
    }

    #[test]
    fn test_valid_snapshot_recovery_path() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("data");
        std::fs::create_dir_all(&data_dir).unwrap();
        snapshot::write_snapshot(
            &data_dir.join("main.db"),
            &HashMap::new(),
            &HashMap::new(),
            11,
        )
        .unwrap();

        let mut sm = machine(dir.path());
        sm.process_event(RecoveryEvent::StartAnalysis).unwrap();
        assert_eq!(sm.state(), RecoveryState::RecoveryNeeded);
        assert_eq!(sm.info().last_checkpoint_sequence, 11);

        sm.run_recovery_with(|_| Ok(())).unwrap();
        assert_eq!(sm.state(), RecoveryState::Recovered);

        sm.process_event(RecoveryEvent::RecoveryComplete).unwrap();
        assert_eq!(sm.state(), RecoveryState::Ready);
    }

    #[test]
    fn test_corrupt_snapshot_goes_corrupted_then_failed() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("data");
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::write(data_dir.join("main.db"), b"garbage").unwrap();

        let mut sm = machine(dir.path());
        sm.process_event(RecoveryEvent::StartAnalysis).unwrap();
        assert_eq!(sm.state(), RecoveryState::Corrupted);

        // No repair hook: repair attempt fails into FAILED.
        assert!(sm.process_event(RecoveryEvent::RepairStart).is_err());
        assert_eq!(sm.state(), RecoveryState::Failed);

        sm.process_event(RecoveryEvent::FailureDetected).unwrap();
        assert_eq!(sm.state(), RecoveryState::Error);
    }

    #[test]
    fn test_repair_hook_recovers() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("data");
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::write(data_dir.join("main.db"), b"garbage").unwrap();

        let mut sm = machine(dir.path());
        sm.set_hooks(None, None, Some(Box::new(|| Ok(()))), None);
        sm.process_event(RecoveryEvent::StartAnalysis).unwrap();
        assert_eq!(sm.state(), RecoveryState::Corrupted);

        sm.process_event(RecoveryEvent::RepairStart).unwrap();
        assert_eq!(sm.state(), RecoveryState::Recovered);
    }

    #[test]
    fn test_failed_replay_lands_failed() {
        let dir = tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let mut log = CommitLog::open(&log_dir, 1 << 20, 4).unwrap();
        log.append_commit().unwrap();
        drop(log);

        let mut sm = machine(dir.path());
        sm.process_event(RecoveryEvent::StartAnalysis).unwrap();
        let err = sm.run_recovery_with(|_| {
            Err(StorageError::recovery_failed("simulated").into())
        });
        assert!(err.is_err());
        assert_eq!(sm.state(), RecoveryState::Failed);
        assert!(sm.error_message().unwrap().contains("simulated"));
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let dir = tempdir().unwrap();
        let mut sm = machine(dir.path());

        // RECOVERY_START straight out of UNINITIALIZED.
        let err = sm.process_event(RecoveryEvent::RecoveryStart).unwrap_err();
        assert!(matches!(
            err,
            crate::error::VexDBError::Storage(StorageError::InvalidTransition { .. })
        ));
        assert_eq!(sm.state(), RecoveryState::Uninitialized);

        // READY is terminal.
        sm.process_event(RecoveryEvent::StartAnalysis).unwrap();
        assert_eq!(sm.state(), RecoveryState::Ready);
        assert!(sm.process_event(RecoveryEvent::StartAnalysis).is_err());
    }

    #[test]
    fn test_manual_intervention_restarts_analysis() {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("data");
        std::fs::create_dir_all(&data_dir).unwrap();
        std::fs::write(data_dir.join("main.db"), b"garbage").unwrap();

        let mut sm = machine(dir.path());
        sm.process_event(RecoveryEvent::StartAnalysis).unwrap();
        sm.process_event(RecoveryEvent::FailureDetected).unwrap();
        sm.process_event(RecoveryEvent::FailureDetected).unwrap();
        assert_eq!(sm.state(), RecoveryState::Error);

        // Operator replaces the bad snapshot, then restarts the workflow.
        std::fs::remove_file(data_dir.join("main.db")).unwrap();
        sm.process_event(RecoveryEvent::ManualIntervention).unwrap();
        assert_eq!(sm.state(), RecoveryState::Ready);
    }

    #[test]
    fn test_reset() {
        let dir = tempdir().unwrap();
        let mut sm = machine(dir.path());
        sm.process_event(RecoveryEvent::StartAnalysis).unwrap();
        sm.reset();
        assert_eq!(sm.state(), RecoveryState::Uninitialized);
        assert!(sm.error_message().is_none());
    }
}
