//! Transaction merger
//!
//! One merger per partition. Callers on any thread submit commands; a
//! single named worker thread takes them off the queue in submission order,
//! runs as many as fit in the batch window inside one storage transaction,
//! and commits once.
//!
//! ## Batch protocol
//!
//! 1. Open a storage transaction and a batch window.
//! 2. For each command taken from the queue: savepoint, `execute`.
//!    - Ok: keep its output and envelope.
//!    - Command-level error: roll back to the savepoint, keep the error.
//!    - Transaction-fatal error: stop taking commands, abort the batch.
//! 3. Close the window when the queue is empty, `max_batch_size` commands
//!    ran, or `max_batch_duration` elapsed.
//! 4. Append the successful envelopes to the replay log as one
//!    [`LoggedBatch`] (the durability point), then publish the transaction.
//! 5. Resolve every completion. On abort, every command taken into the
//!    batch receives the same fatal error.
//!
//! Nobody observes a command's result before step 4 succeeded, so a caller
//! never sees a success that a crash could undo.

use crate::command::{LoggedBatch, MergedCommand};
use crate::completion::{Completion, PendingResult};
use crate::config::MergerConfig;
use crate::stats::{MergerStats, MergerStatsSnapshot};
use corvid_core::{CorvidError, CorvidResult, PartitionKey};
use corvid_durability::ReplayLog;
use corvid_storage::{CompareExchangeStore, PartitionStore, StorageTransaction};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, info, warn};

struct PendingCommand<C: MergedCommand> {
    command: C,
    completion: Arc<Completion<C::Output>>,
}

struct QueueState<C: MergedCommand> {
    pending: VecDeque<PendingCommand<C>>,
    closed: bool,
}

/// What happened to one command taken into a batch
struct Executed<C: MergedCommand> {
    completion: Arc<Completion<C::Output>>,
    result: CorvidResult<C::Output>,
    envelope: Option<C::Envelope>,
}

/// Everything the worker thread needs; shared with submitters
struct MergerInner<C: MergedCommand> {
    key: PartitionKey,
    config: MergerConfig,
    queue: Mutex<QueueState<C>>,
    work_ready: Condvar,
    stats: MergerStats,
    partition: Arc<PartitionStore>,
    compare_exchange: Arc<CompareExchangeStore>,
    log: Arc<dyn ReplayLog>,
    context: Arc<C::Context>,
}

/// Single-writer batching executor for one partition
pub struct TransactionMerger<C: MergedCommand> {
    inner: Arc<MergerInner<C>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<C: MergedCommand> TransactionMerger<C> {
    /// Start the merger thread for a partition
    ///
    /// The thread is named `corvid-merger-{database}-{partition}`.
    pub fn start(
        partition: Arc<PartitionStore>,
        compare_exchange: Arc<CompareExchangeStore>,
        log: Arc<dyn ReplayLog>,
        context: Arc<C::Context>,
        config: MergerConfig,
    ) -> CorvidResult<Self> {
        config.validate()?;
        let key = partition.key().clone();
        let inner = Arc::new(MergerInner {
            key: key.clone(),
            config,
            queue: Mutex::new(QueueState {
                pending: VecDeque::new(),
                closed: false,
            }),
            work_ready: Condvar::new(),
            stats: MergerStats::default(),
            partition,
            compare_exchange,
            log,
            context,
        });

        let worker_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name(format!(
                "corvid-merger-{}-{}",
                key.database,
                key.partition.as_u32()
            ))
            .spawn(move || worker_loop(&worker_inner))?;

        info!(target: "corvid::merger", partition = %key, "Merger started");

        Ok(Self {
            inner,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Partition this merger writes to
    pub fn partition_key(&self) -> &PartitionKey {
        &self.inner.key
    }

    /// Queue a command and return a handle to its eventual result
    ///
    /// Fails fast with `Backpressure` when the queue is full and with
    /// `MergerClosed` after [`close`](Self::close).
    pub fn enqueue(&self, command: C) -> CorvidResult<PendingResult<C::Output>> {
        self.push(command, true)
    }

    /// Queue a command that was already decided elsewhere
    ///
    /// Ignores `queue_capacity`: a cluster log entry cannot be refused by
    /// one node and accepted by another. Still fails after
    /// [`close`](Self::close).
    pub fn enqueue_decided(&self, command: C) -> CorvidResult<PendingResult<C::Output>> {
        self.push(command, false)
    }

    fn push(&self, command: C, bounded: bool) -> CorvidResult<PendingResult<C::Output>> {
        let completion = Arc::new(Completion::new());
        {
            let mut queue = self.inner.queue.lock();
            if queue.closed {
                return Err(CorvidError::MergerClosed {
                    partition: self.inner.key.to_string(),
                });
            }
            if bounded && queue.pending.len() >= self.inner.config.queue_capacity {
                self.inner.stats.record_rejected();
                return Err(CorvidError::Backpressure {
                    resource: format!("merger queue of {}", self.inner.key),
                    reason: format!(
                        "{} commands already queued",
                        self.inner.config.queue_capacity
                    ),
                });
            }
            queue.pending.push_back(PendingCommand {
                command,
                completion: Arc::clone(&completion),
            });
        }
        self.inner.work_ready.notify_one();
        Ok(PendingResult::new(completion))
    }

    /// Queue a command and block until its batch committed or failed
    pub fn submit(&self, command: C) -> CorvidResult<C::Output> {
        self.enqueue(command)?.wait()
    }

    /// Number of commands waiting to be taken into a batch
    pub fn queue_depth(&self) -> usize {
        self.inner.queue.lock().pending.len()
    }

    /// Counter snapshot
    pub fn stats(&self) -> MergerStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Stop accepting commands, drain the queue and join the worker
    ///
    /// Idempotent.
    pub fn close(&self) {
        {
            let mut queue = self.inner.queue.lock();
            queue.closed = true;
            self.inner.work_ready.notify_all();
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(target: "corvid::merger", partition = %self.inner.key, "Merger thread panicked");
            }
            info!(target: "corvid::merger", partition = %self.inner.key, "Merger closed");
        }
    }

    /// True after [`close`](Self::close)
    pub fn is_closed(&self) -> bool {
        self.inner.queue.lock().closed
    }
}

impl<C: MergedCommand> Drop for TransactionMerger<C> {
    fn drop(&mut self) {
        self.close();
    }
}

fn worker_loop<C: MergedCommand>(inner: &MergerInner<C>) {
    loop {
        let first = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(pending) = queue.pending.pop_front() {
                    break pending;
                }
                if queue.closed {
                    return;
                }
                inner.work_ready.wait(&mut queue);
            }
        };
        inner.run_batch(first);
    }
}

impl<C: MergedCommand> MergerInner<C> {
    fn run_batch(&self, first: PendingCommand<C>) {
        let window_start = Instant::now();
        let mut txn = StorageTransaction::begin(&self.partition, &self.compare_exchange);
        let mut executed: Vec<Executed<C>> = Vec::new();
        let mut fatal: Option<CorvidError> = None;
        let mut next = Some(first);

        while let Some(pending) = next.take() {
            if !pending.completion.begin_execution() {
                self.stats.record_canceled();
                debug!(target: "corvid::merger", partition = %self.key, "Skipped canceled command");
            } else if let Some(err) = self.execute_one(pending, &mut txn, &mut executed) {
                fatal = Some(err);
                break;
            }

            if executed.len() >= self.config.max_batch_size
                || window_start.elapsed() >= self.config.max_batch_duration
            {
                break;
            }
            next = self.queue.lock().pending.pop_front();
        }

        if executed.is_empty() {
            return;
        }

        let outcome = match fatal {
            Some(err) => Err(err),
            None => self.commit(txn, &mut executed),
        };

        let batch_len = executed.len() as u64;
        match outcome {
            Ok(position) => {
                let failed = executed.iter().filter(|e| e.result.is_err()).count() as u64;
                self.stats.record_commit(batch_len - failed, failed);
                debug!(
                    target: "corvid::merger",
                    partition = %self.key,
                    position,
                    commands = batch_len,
                    failed,
                    elapsed_us = window_start.elapsed().as_micros() as u64,
                    "Committed batch"
                );
                for done in executed {
                    done.completion.resolve(done.result);
                }
            }
            Err(err) => {
                self.stats.record_fatal_abort(batch_len);
                warn!(
                    target: "corvid::merger",
                    partition = %self.key,
                    commands = batch_len,
                    error = %err,
                    "Aborted batch"
                );
                for done in executed {
                    done.completion.resolve(Err(err.clone()));
                }
            }
        }
    }

    /// Run one command under a savepoint; returns the error if it is fatal
    fn execute_one(
        &self,
        pending: PendingCommand<C>,
        txn: &mut StorageTransaction<'_>,
        executed: &mut Vec<Executed<C>>,
    ) -> Option<CorvidError> {
        let PendingCommand {
            mut command,
            completion,
        } = pending;
        let savepoint = txn.savepoint();

        let result = command
            .execute(&self.context, txn)
            .and_then(|output| command.to_envelope().map(|envelope| (output, envelope)));

        match result {
            Ok((output, envelope)) => {
                executed.push(Executed {
                    completion,
                    result: Ok(output),
                    envelope: Some(envelope),
                });
                None
            }
            Err(err) if err.is_transaction_fatal() => {
                executed.push(Executed {
                    completion,
                    result: Err(err.clone()),
                    envelope: None,
                });
                Some(err)
            }
            Err(err) => {
                txn.rollback_to(savepoint);
                debug!(
                    target: "corvid::merger",
                    partition = %self.key,
                    kind = command.kind(),
                    error = %err,
                    "Command failed, batch continues"
                );
                executed.push(Executed {
                    completion,
                    result: Err(err),
                    envelope: None,
                });
                None
            }
        }
    }

    /// Log then publish; returns the log position (0 if nothing was logged)
    fn commit(
        &self,
        txn: StorageTransaction<'_>,
        executed: &mut [Executed<C>],
    ) -> CorvidResult<u64> {
        let envelopes: Vec<C::Envelope> = executed
            .iter_mut()
            .filter_map(|e| e.envelope.take())
            .collect();
        if envelopes.is_empty() {
            return Ok(0);
        }

        let payload = LoggedBatch::new(self.key.clone(), envelopes).to_bytes()?;
        let position = self.log.append(&payload)?;
        txn.commit()?;
        Ok(position)
    }
}
