//! Transactional multi-operation batches.
//!
//! A batch is an ordered list of insert/update/delete operations applied
//! sequentially and stopped at the first failure. The coordinator owns
//! transaction ids, up-front validation, and batch statistics; the apply
//! step is a closure so the same loop serves both the bare persistence
//! path (WAL-only, stop without rollback) and the facade path (maps +
//! WAL with per-operation rollback).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Result, ValidationError};
use crate::types::Vector;

/// Kind of a batch operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// Add a new entry.
    Insert,
    /// Replace an existing entry.
    Update,
    /// Remove an existing entry.
    Delete,
}

/// One operation inside a batch.
#[derive(Clone, Debug)]
pub struct BatchOperation {
    /// What to do.
    pub op: OperationType,
    /// Target key.
    pub key: String,
    /// Vector for insert/update; ignored for delete.
    pub vector: Option<Vector>,
    /// Metadata for insert/update; `None` means empty.
    pub metadata: Option<String>,
}

impl BatchOperation {
    /// Insert operation.
    pub fn insert(key: impl Into<String>, vector: Vector, metadata: Option<String>) -> Self {
        Self {
            op: OperationType::Insert,
            key: key.into(),
            vector: Some(vector),
            metadata,
        }
    }

    /// Update operation.
    pub fn update(key: impl Into<String>, vector: Vector, metadata: Option<String>) -> Self {
        Self {
            op: OperationType::Update,
            key: key.into(),
            vector: Some(vector),
            metadata,
        }
    }

    /// Delete operation.
    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            op: OperationType::Delete,
            key: key.into(),
            vector: None,
            metadata: None,
        }
    }
}

/// Outcome of a batch execution.
#[derive(Clone, Debug)]
pub struct BatchResult {
    /// True when every operation committed.
    pub success: bool,
    /// How many operations committed before the batch stopped.
    pub operations_committed: usize,
    /// Failure detail when `success` is false.
    pub error_message: Option<String>,
    /// Monotonic transaction id.
    pub transaction_id: u64,
    /// Wall time spent executing.
    pub duration: Duration,
}

/// Counters aggregated from the batch coordinator.
#[derive(Clone, Debug, Default, Serialize)]
pub struct BatchStats {
    /// Batches executed.
    pub total_batches: u64,
    /// Batches where every operation committed.
    pub successful_batches: u64,
    /// Batches stopped early.
    pub failed_batches: u64,
    /// Operations committed across all batches.
    pub total_operations: u64,
    /// `successful_batches / total_batches`, or 0.0 before any batch.
    pub success_rate: f64,
    /// `total_operations / total_batches`, or 0.0 before any batch.
    pub average_batch_size: f64,
}

/// Transaction ids, validation, and the sequential apply loop.
pub struct BatchCoordinator {
    max_batch_size: usize,
    enable_validation: bool,
    dimension: usize,
    transaction_counter: AtomicU64,
    total_batches: AtomicU64,
    successful_batches: AtomicU64,
    failed_batches: AtomicU64,
    total_operations: AtomicU64,
}

impl BatchCoordinator {
    /// Creates a coordinator from the database configuration.
    pub fn new(config: &Config) -> Self {
        Self {
            max_batch_size: config.max_batch_size,
            enable_validation: config.batch_validation,
            dimension: config.dimension,
            transaction_counter: AtomicU64::new(0),
            total_batches: AtomicU64::new(0),
            successful_batches: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
            total_operations: AtomicU64::new(0),
        }
    }

    /// Largest batch accepted.
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Whether up-front validation runs.
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation
    }

    fn next_transaction_id(&self) -> u64 {
        self.transaction_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Validates the whole batch before anything is applied.
    ///
    /// Rules: non-empty batch within the size cap; every key non-empty;
    /// insert/update carry a vector of the database dimension.
    pub fn validate(&self, operations: &[BatchOperation]) -> Result<()> {
        if operations.is_empty() {
            return Err(ValidationError::invalid_batch("batch is empty").into());
        }
        if operations.len() > self.max_batch_size {
            return Err(ValidationError::invalid_batch(format!(
                "batch of {} exceeds maximum {}",
                operations.len(),
                self.max_batch_size
            ))
            .into());
        }
        for (i, op) in operations.iter().enumerate() {
            if op.key.is_empty() {
                return Err(ValidationError::invalid_batch(format!(
                    "operation {i} has an empty key"
                ))
                .into());
            }
            if matches!(op.op, OperationType::Insert | OperationType::Update) {
                match &op.vector {
                    None => {
                        return Err(ValidationError::invalid_batch(format!(
                            "operation {i} ({:?}) is missing a vector",
                            op.op
                        ))
                        .into());
                    }
                    Some(v) if v.len() != self.dimension => {
                        return Err(ValidationError::invalid_batch(format!(
                            "operation {i} has dimension {} (expected {})",
                            v.len(),
                            self.dimension
                        ))
                        .into());
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }

    /// Applies `operations` through `apply` sequentially, stopping at the
    /// first failure.
    ///
    /// Validation failures reject the whole batch with
    /// `operations_committed = 0`. On an apply failure the result reports
    /// how many operations committed before the stop; whether those stay
    /// applied is the closure's contract (the bare WAL path keeps them,
    /// the facade rolls back only the failing operation's in-memory half).
    pub fn run<F>(&self, operations: &[BatchOperation], mut apply: F) -> BatchResult
    where
        F: FnMut(&BatchOperation) -> Result<()>,
    {
        let started = Instant::now();
        let transaction_id = self.next_transaction_id();
        self.total_batches.fetch_add(1, Ordering::Relaxed);

        if self.enable_validation {
            if let Err(e) = self.validate(operations) {
                self.failed_batches.fetch_add(1, Ordering::Relaxed);
                warn!(transaction_id, error = %e, "batch rejected by validation");
                return BatchResult {
                    success: false,
                    operations_committed: 0,
                    error_message: Some(e.to_string()),
                    transaction_id,
                    duration: started.elapsed(),
                };
            }
        }

        debug!(transaction_id, operations = operations.len(), "batch started");

        let mut committed = 0usize;
        let mut error_message = None;
        for op in operations {
            match apply(op) {
                Ok(()) => committed += 1,
                Err(e) => {
                    warn!(
                        transaction_id,
                        committed,
                        key = %op.key,
                        error = %e,
                        "batch stopped at failed operation"
                    );
                    error_message = Some(e.to_string());
                    break;
                }
            }
        }

        let success = committed == operations.len();
        if success {
            self.successful_batches.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_batches.fetch_add(1, Ordering::Relaxed);
        }
        self.total_operations
            .fetch_add(committed as u64, Ordering::Relaxed);

        BatchResult {
            success,
            operations_committed: committed,
            error_message,
            transaction_id,
            duration: started.elapsed(),
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> BatchStats {
        let total = self.total_batches.load(Ordering::Relaxed);
        let successful = self.successful_batches.load(Ordering::Relaxed);
        let operations = self.total_operations.load(Ordering::Relaxed);
        BatchStats {
            total_batches: total,
            successful_batches: successful,
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
            total_operations: operations,
            success_rate: if total == 0 {
                0.0
            } else {
                successful as f64 / total as f64
            },
            average_batch_size: if total == 0 {
                0.0
            } else {
                operations as f64 / total as f64
            },
        }
    }
}

impl std::fmt::Debug for BatchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("max_batch_size", &self.max_batch_size)
            .field("enable_validation", &self.enable_validation)
            .finish_non_exhaustive()
    }
}
