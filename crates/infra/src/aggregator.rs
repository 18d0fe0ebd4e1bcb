//! Batch completion counting under concurrent child completions.

use std::sync::Arc;

use tracing::{debug, info, warn};

use pixelflow_core::{AggregateRoot, BatchJobId, ExpectedVersion, JobId, TimeSource};
use pixelflow_jobs::{BatchError, BatchProgress, ChildOutcome};

use crate::store::{JobStore, JobStoreError};

/// Applies child outcomes to their batch with a read/compare-and-set loop.
///
/// Each loop iteration re-reads the batch, so the terminal decision is always
/// made from the version the write is conditioned on. Losing a write means
/// another child's increment landed; the loop is bounded by
/// `max_conflict_retries` re-reads.
#[derive(Clone)]
pub struct BatchAggregator<S> {
    store: S,
    clock: Arc<dyn TimeSource>,
    max_conflict_retries: u32,
}

impl<S: JobStore> BatchAggregator<S> {
    pub fn new(store: S, clock: Arc<dyn TimeSource>, max_conflict_retries: u32) -> Self {
        Self {
            store,
            clock,
            max_conflict_retries,
        }
    }

    /// Count `child` once toward `batch_id`.
    ///
    /// `became_terminal` in the result is set for exactly one caller per
    /// batch. A child already counted yields [`BatchError::AlreadyCounted`].
    pub fn increment_batch_progress(
        &self,
        batch_id: BatchJobId,
        child: JobId,
        outcome: ChildOutcome,
    ) -> Result<BatchProgress, BatchError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let current = self
                .store
                .get_batch(batch_id)
                .map_err(|e| BatchError::Store(e.to_string()))?
                .ok_or(BatchError::NotFound(batch_id))?;

            let progress = current.record_child(child, outcome.clone(), self.clock.now())?;

            match self
                .store
                .update_batch(&progress.batch, ExpectedVersion::Exact(current.version()))
            {
                Ok(()) => {
                    debug!(
                        batch_id = %batch_id,
                        job_id = %child,
                        completed = progress.batch.completed_count(),
                        total = progress.batch.total_count(),
                        "batch progress recorded"
                    );
                    if let Some(status) = progress.became_terminal {
                        info!(batch_id = %batch_id, status = ?status, "batch finished");
                    }
                    return Ok(progress);
                }
                Err(JobStoreError::Conflict { .. }) if attempts <= self.max_conflict_retries => {
                    debug!(batch_id = %batch_id, job_id = %child, attempt = attempts, "batch write conflict; re-reading");
                }
                Err(JobStoreError::Conflict { .. }) => {
                    warn!(batch_id = %batch_id, job_id = %child, attempts, "batch write conflicts exhausted");
                    return Err(BatchError::Conflict {
                        batch: batch_id,
                        attempts,
                    });
                }
                Err(e) => return Err(BatchError::Store(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryJobStore;
    use pixelflow_core::{AssetRef, JobError, ManualClock, SequentialIds, UserId};
    use pixelflow_jobs::{
        BatchItem, BatchJob, BatchStatus, Job, NewBatch, PartialFailurePolicy, create_batch,
    };
    use proptest::prelude::*;

    fn seeded(
        size: usize,
        policy: PartialFailurePolicy,
    ) -> (Arc<InMemoryJobStore>, Arc<ManualClock>, BatchJob, Vec<Job>) {
        let store = InMemoryJobStore::arc();
        let clock = Arc::new(ManualClock::epoch());
        let ids = SequentialIds::new();
        let (batch, children) = create_batch(
            NewBatch {
                user_id: UserId::new(),
                items: (0..size)
                    .map(|i| BatchItem {
                        prompt: None,
                        temp_asset_ref: AssetRef::new(format!("tmp/{i}.jpg")),
                    })
                    .collect(),
                policy,
            },
            clock.as_ref(),
            &ids,
        )
        .unwrap();
        store.insert_batch(batch.clone(), children.clone()).unwrap();
        (store, clock, batch, children)
    }

    #[test]
    fn terminal_status_is_decided_on_the_last_increment() {
        let (store, clock, batch, children) = seeded(3, PartialFailurePolicy::CompleteWithFailures);
        let aggregator = BatchAggregator::new(store.clone(), clock, 3);

        let first = aggregator
            .increment_batch_progress(*batch.id(), *children[0].id(), ChildOutcome::Succeeded)
            .unwrap();
        assert_eq!(first.became_terminal, None);

        aggregator
            .increment_batch_progress(
                *batch.id(),
                *children[1].id(),
                ChildOutcome::Failed {
                    error: JobError::provider("boom"),
                },
            )
            .unwrap();
        let last = aggregator
            .increment_batch_progress(*batch.id(), *children[2].id(), ChildOutcome::Succeeded)
            .unwrap();

        assert_eq!(last.became_terminal, Some(BatchStatus::Completed));
        let stored = store.get_batch(*batch.id()).unwrap().unwrap();
        assert_eq!(stored.completed_count(), 3);
        assert_eq!(stored.failed_children().count(), 1);
    }

    #[test]
    fn duplicate_delivery_is_not_double_counted() {
        let (store, clock, batch, children) = seeded(2, PartialFailurePolicy::default());
        let aggregator = BatchAggregator::new(store.clone(), clock, 3);

        aggregator
            .increment_batch_progress(*batch.id(), *children[0].id(), ChildOutcome::Succeeded)
            .unwrap();
        let err = aggregator
            .increment_batch_progress(*batch.id(), *children[0].id(), ChildOutcome::Succeeded)
            .unwrap_err();

        assert!(matches!(err, BatchError::AlreadyCounted { .. }));
        assert_eq!(store.get_batch(*batch.id()).unwrap().unwrap().completed_count(), 1);
    }

    #[test]
    fn unknown_batch_is_reported() {
        let store = InMemoryJobStore::arc();
        let aggregator = BatchAggregator::new(store, Arc::new(ManualClock::epoch()), 3);
        let missing = BatchJobId::new();
        let err = aggregator
            .increment_batch_progress(missing, JobId::new(), ChildOutcome::Succeeded)
            .unwrap_err();
        assert_eq!(err, BatchError::NotFound(missing));
    }

    #[test]
    fn concurrent_increments_count_every_child_and_finish_once() {
        const N: usize = 16;
        let (store, clock, batch, children) = seeded(N, PartialFailurePolicy::FailBatch);
        // Each lost write means some other writer won, so N re-reads always suffice.
        let aggregator = BatchAggregator::new(store.clone(), clock, N as u32);
        let batch_id = *batch.id();

        let results: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = children
                .iter()
                .enumerate()
                .map(|(i, child)| {
                    let aggregator = &aggregator;
                    let child_id = *child.id();
                    scope.spawn(move || {
                        let outcome = if i == 0 {
                            ChildOutcome::Failed {
                                error: JobError::provider("rejected"),
                            }
                        } else {
                            ChildOutcome::Succeeded
                        };
                        aggregator.increment_batch_progress(batch_id, child_id, outcome)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let terminal: Vec<_> = results
            .iter()
            .map(|r| r.as_ref().unwrap())
            .filter_map(|p| p.became_terminal)
            .collect();
        assert_eq!(terminal, vec![BatchStatus::Failed]);

        let stored = store.get_batch(batch_id).unwrap().unwrap();
        assert_eq!(stored.completed_count(), N as u32);
        assert_eq!(stored.status(), BatchStatus::Failed);
    }

    proptest! {
        #[test]
        fn redelivered_outcomes_finish_the_batch_exactly_once(
            failures in prop::collection::vec(any::<bool>(), 1..8),
            redeliver in prop::collection::vec(0usize..8, 0..6),
            fail_batch in any::<bool>(),
        ) {
            let policy = if fail_batch {
                PartialFailurePolicy::FailBatch
            } else {
                PartialFailurePolicy::CompleteWithFailures
            };
            let (store, clock, batch, children) = seeded(failures.len(), policy);
            let aggregator = BatchAggregator::new(store.clone(), clock, 3);
            let outcome = |failed: bool| {
                if failed {
                    ChildOutcome::Failed { error: JobError::provider("rejected") }
                } else {
                    ChildOutcome::Succeeded
                }
            };

            let mut terminal = Vec::new();
            for (i, (child, failed)) in children.iter().zip(&failures).enumerate() {
                let progress = aggregator
                    .increment_batch_progress(*batch.id(), *child.id(), outcome(*failed))
                    .unwrap();
                terminal.extend(progress.became_terminal);

                for &again in redeliver.iter().filter(|&&r| r <= i) {
                    let repeat = aggregator.increment_batch_progress(
                        *batch.id(),
                        *children[again].id(),
                        outcome(failures[again]),
                    );
                    prop_assert!(repeat.is_err());
                }
            }

            let expected = if fail_batch && failures.iter().any(|f| *f) {
                BatchStatus::Failed
            } else {
                BatchStatus::Completed
            };
            prop_assert_eq!(terminal, vec![expected]);
            let stored = store.get_batch(*batch.id()).unwrap().unwrap();
            prop_assert_eq!(stored.completed_count() as usize, failures.len());
            prop_assert_eq!(stored.status(), expected);
        }
    }
}
