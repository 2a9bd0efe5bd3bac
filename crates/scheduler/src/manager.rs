//! The execution manager: owns the live registries, the queue and the worker
//! budget, and drives every execution from submission to durable record.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use autoflow_context::{ExecutionContext, ResumeCommand};
use autoflow_core_types::{BatchId, BatchStatus, ExecutionId, ExecutionStatus, FlowError, Workflow};
use autoflow_driver::DriverFactory;
use autoflow_event_bus::{EventHub, FlowEvent};
use autoflow_flow::scope::flatten_calls;
use autoflow_flow::{ExecState, Executor, HandlerRegistry};
use autoflow_state_store::{BatchRecord, ExecutionRecord, ExecutionStore};

use crate::budget::WorkerBudget;
use crate::error::SchedulerError;
use crate::model::{
    BatchEntry, BatchMeta, BatchOptions, BatchState, BatchStopOutcome, ExecutionEntry,
    SchedulerConfig, StopOutcome,
};
use crate::queue::ExecutionQueue;

pub struct ExecutionManager {
    weak: Weak<Self>,
    config: SchedulerConfig,
    registry: Arc<HandlerRegistry>,
    driver_factory: Arc<dyn DriverFactory>,
    store: Arc<dyn ExecutionStore>,
    events: Arc<EventHub>,
    queue: ExecutionQueue,
    budget: WorkerBudget,
    executions: DashMap<ExecutionId, Arc<ExecutionEntry>>,
    batches: DashMap<BatchId, Arc<BatchMeta>>,
    next_worker: AtomicU64,
    /// Serializes queue scans so two triggers never double-dispatch.
    dispatch_gate: AsyncMutex<()>,
}

impl ExecutionManager {
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<HandlerRegistry>,
        driver_factory: Arc<dyn DriverFactory>,
        store: Arc<dyn ExecutionStore>,
        events: Arc<EventHub>,
    ) -> Arc<Self> {
        let budget = WorkerBudget::new(config.global_workers);
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            config,
            registry,
            driver_factory,
            store,
            events,
            queue: ExecutionQueue::new(),
            budget,
            executions: DashMap::new(),
            batches: DashMap::new(),
            next_worker: AtomicU64::new(0),
            dispatch_gate: AsyncMutex::new(()),
        })
    }

    /// Run one workflow immediately on a dedicated driver. Single executions
    /// never enter the queue and never count against the worker pool.
    pub async fn start_single(&self, workflow: Workflow) -> Result<ExecutionId, SchedulerError> {
        let workflow = flatten_calls(&workflow)?;
        if workflow.entry_node().is_none() {
            return Err(SchedulerError::InvalidWorkflow(format!(
                "workflow {} has no entry node",
                workflow.id
            )));
        }
        let driver = self.driver_factory.create().await?;
        let ctx = ExecutionContext::new();
        ctx.set_page(driver);

        let id = ExecutionId::new();
        let executor = Executor::new(
            id.clone(),
            workflow.clone(),
            self.registry.clone(),
            ctx,
            Some(self.events.clone()),
        );
        let entry = ExecutionEntry::new(
            id.clone(),
            None,
            &workflow,
            executor,
            ExecutionStatus::Running,
        );
        entry.state.lock().started_at = Some(Utc::now());
        self.executions.insert(id.clone(), entry.clone());
        self.persist_execution(&entry).await;
        info!(target: "scheduler", execution = %id, workflow = %workflow.id, "single execution started");
        self.spawn_run(entry);
        Ok(id)
    }

    /// Submit a batch. Invalid entries count toward the total but are never
    /// queued; valid ones enter the queue and dispatch under both worker
    /// caps.
    pub async fn start_batch(
        &self,
        entries: Vec<BatchEntry>,
        options: BatchOptions,
    ) -> Result<BatchId, SchedulerError> {
        let batch_id = BatchId::new();
        let total = entries.len();
        let workers = options
            .workers
            .unwrap_or(self.config.global_workers)
            .max(1);

        let mut workflows = Vec::new();
        let mut invalid = 0usize;
        for entry in entries {
            match entry {
                BatchEntry::Valid { workflow, path } => match flatten_calls(&workflow) {
                    Ok(flattened) if flattened.entry_node().is_some() => workflows.push(flattened),
                    Ok(_) => {
                        warn!(target: "scheduler", batch = %batch_id, ?path, "workflow has no entry node");
                        invalid += 1;
                    }
                    Err(err) => {
                        warn!(target: "scheduler", batch = %batch_id, ?path, error = %err, "workflow rejected");
                        invalid += 1;
                    }
                },
                BatchEntry::Invalid { path, error } => {
                    warn!(target: "scheduler", batch = %batch_id, ?path, error, "unreadable workflow");
                    invalid += 1;
                }
            }
        }
        let valid = workflows.len();
        self.budget.register_batch(batch_id.clone(), workers);

        let mut execution_ids = Vec::new();
        for workflow in workflows {
            let id = ExecutionId::new();
            let executor = Executor::new(
                id.clone(),
                workflow.clone(),
                self.registry.clone(),
                ExecutionContext::new(),
                Some(self.events.clone()),
            );
            let entry = ExecutionEntry::new(
                id.clone(),
                Some(batch_id.clone()),
                &workflow,
                executor,
                ExecutionStatus::Queued,
            );
            self.executions.insert(id.clone(), entry.clone());
            self.persist_execution(&entry).await;
            self.queue
                .push(id.clone(), batch_id.clone(), options.priority);
            execution_ids.push(id);
        }

        let meta = Arc::new(BatchMeta {
            id: batch_id.clone(),
            source: options.source,
            total,
            valid,
            invalid,
            workers,
            priority: options.priority,
            created_at: Utc::now(),
            output_path: options.output_path,
            executions: execution_ids,
            state: parking_lot::Mutex::new(BatchState {
                completed: 0,
                failed: 0,
                stopped: 0,
                running: 0,
                queued: valid,
                status: BatchStatus::Running,
                finished_at: None,
                completion_announced: false,
            }),
        });
        self.batches.insert(batch_id.clone(), meta.clone());
        if let Err(err) = self.store.save_batch(&meta.record()).await {
            warn!(target: "scheduler", batch = %batch_id, error = %err, "failed to persist batch record");
        }
        info!(
            target: "scheduler",
            batch = %batch_id, total, valid, invalid, workers, priority = meta.priority,
            "batch submitted"
        );
        self.events.publish(FlowEvent::BatchStarted {
            batch: batch_id.clone(),
            total,
            valid,
        });
        // A batch with nothing runnable is terminal right away.
        self.check_batch_completion(&meta).await;
        self.process_queue().await;
        Ok(batch_id)
    }

    /// Stop one execution. Queued entries are cancelled without ever
    /// dispatching; running ones get a cooperative stop signal.
    pub async fn stop_execution(&self, id: &ExecutionId) -> StopOutcome {
        let Some(entry) = self.executions.get(id).map(|e| e.value().clone()) else {
            return StopOutcome::default();
        };
        enum Found {
            Queued,
            Running,
            Terminal,
        }
        let found = {
            let mut state = entry.state.lock();
            match state.status {
                ExecutionStatus::Queued => {
                    state.cancelled = true;
                    Found::Queued
                }
                ExecutionStatus::Running => {
                    state.status = ExecutionStatus::Stopped;
                    Found::Running
                }
                _ => Found::Terminal,
            }
        };
        match found {
            Found::Queued => {
                // If the item is already in the dispatcher's hands the
                // cancelled flag makes it discard the entry instead.
                if self.queue.cancel(id) {
                    self.finalize_cancelled(&entry).await;
                }
                info!(target: "scheduler", execution = %id, "cancelled queued execution");
                StopOutcome {
                    was_queued: true,
                    ..StopOutcome::default()
                }
            }
            Found::Running => {
                entry.executor.stop();
                info!(target: "scheduler", execution = %id, "stop requested for running execution");
                StopOutcome {
                    was_running: true,
                    ..StopOutcome::default()
                }
            }
            Found::Terminal => StopOutcome::default(),
        }
    }

    /// Stop every running and queued member of a batch.
    pub async fn stop_batch(&self, id: &BatchId) -> Result<BatchStopOutcome, SchedulerError> {
        let Some(meta) = self.batches.get(id).map(|m| m.value().clone()) else {
            return Err(SchedulerError::UnknownBatch(id.clone()));
        };
        {
            let mut state = meta.state.lock();
            if state.status == BatchStatus::Running {
                state.status = BatchStatus::Stopped;
            }
        }
        let mut outcome = BatchStopOutcome::default();
        for exec_id in &meta.executions {
            let stopped = self.stop_execution(exec_id).await;
            if stopped.was_running {
                outcome.running_stopped += 1;
            }
            if stopped.was_queued {
                outcome.queued_cancelled += 1;
            }
        }
        self.persist_batch(&meta).await;
        info!(
            target: "scheduler",
            batch = %id,
            running_stopped = outcome.running_stopped,
            queued_cancelled = outcome.queued_cancelled,
            "batch stop requested"
        );
        Ok(outcome)
    }

    /// Stop everything: every batch, then every single execution.
    pub async fn stop_all(&self) -> BatchStopOutcome {
        let mut outcome = BatchStopOutcome::default();
        let batch_ids: Vec<BatchId> = self.batches.iter().map(|m| m.key().clone()).collect();
        for id in batch_ids {
            if let Ok(stopped) = self.stop_batch(&id).await {
                outcome.running_stopped += stopped.running_stopped;
                outcome.queued_cancelled += stopped.queued_cancelled;
            }
        }
        let singles: Vec<ExecutionId> = self
            .executions
            .iter()
            .filter(|e| e.value().batch.is_none())
            .map(|e| e.key().clone())
            .collect();
        for id in singles {
            if self.stop_execution(&id).await.was_running {
                outcome.running_stopped += 1;
            }
        }
        outcome
    }

    /// Release a paused execution. Returns false when it is not paused.
    pub fn resume_execution(&self, id: &ExecutionId, command: ResumeCommand) -> bool {
        self.executions
            .get(id)
            .map(|entry| entry.executor.resume(command))
            .unwrap_or(false)
    }

    /// Live entry first, durable record as fallback once evicted.
    pub async fn execution_status(
        &self,
        id: &ExecutionId,
    ) -> Result<Option<ExecutionRecord>, SchedulerError> {
        if let Some(entry) = self.executions.get(id) {
            return Ok(Some(entry.record()));
        }
        Ok(self.store.get_execution(id).await?)
    }

    pub async fn batch_status(&self, id: &BatchId) -> Result<Option<BatchRecord>, SchedulerError> {
        if let Some(meta) = self.batches.get(id) {
            return Ok(Some(meta.record()));
        }
        Ok(self.store.get_batch(id).await?)
    }

    pub async fn batch_executions(
        &self,
        id: &BatchId,
    ) -> Result<Vec<ExecutionRecord>, SchedulerError> {
        if let Some(meta) = self.batches.get(id).map(|m| m.value().clone()) {
            let mut records = Vec::new();
            for exec_id in &meta.executions {
                if let Some(record) = self.execution_status(exec_id).await? {
                    records.push(record);
                }
            }
            return Ok(records);
        }
        Ok(self.store.get_batch_executions(id).await?)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FlowEvent> {
        self.events.subscribe()
    }

    /// Scan the queue front to back, dispatching everything both caps allow
    /// and consuming cancelled items. Entries of batches at their cap are
    /// scanned past without losing their place.
    async fn process_queue(&self) {
        let _gate = self.dispatch_gate.lock().await;
        loop {
            if !self.budget.has_global_capacity() {
                break;
            }
            let Some(item) = self.queue.take_first(|item| {
                let cancelled = self
                    .executions
                    .get(&item.execution)
                    .map(|entry| entry.state.lock().cancelled)
                    .unwrap_or(true);
                cancelled || self.budget.batch_has_capacity(&item.batch)
            }) else {
                break;
            };
            let Some(entry) = self.executions.get(&item.execution).map(|e| e.value().clone())
            else {
                continue;
            };
            if entry.state.lock().cancelled {
                self.finalize_cancelled(&entry).await;
                continue;
            }
            if !self.budget.try_acquire(&item.batch) {
                // Lost the capacity we just saw; put the item back with its
                // original position.
                self.queue.requeue(item);
                break;
            }
            // The Queued->Running flip and the cancelled re-check share the
            // state lock; a stop that set the flag after the scan above is
            // caught here instead of dispatching.
            let dispatched = {
                let mut state = entry.state.lock();
                if state.cancelled {
                    None
                } else {
                    let worker = self.next_worker.fetch_add(1, Ordering::Relaxed) + 1;
                    state.status = ExecutionStatus::Running;
                    state.worker = Some(worker);
                    state.started_at = Some(Utc::now());
                    Some(worker)
                }
            };
            let Some(worker) = dispatched else {
                self.budget.release(&item.batch);
                self.finalize_cancelled(&entry).await;
                continue;
            };
            if let Some(meta) = self.batches.get(&item.batch).map(|m| m.value().clone()) {
                {
                    let mut state = meta.state.lock();
                    state.queued = state.queued.saturating_sub(1);
                    state.running += 1;
                }
                self.persist_batch(&meta).await;
            }
            self.persist_execution(&entry).await;
            info!(
                target: "scheduler",
                execution = %entry.id, batch = %item.batch, worker,
                "dispatching queued execution"
            );
            self.spawn_run(entry);
        }
    }

    fn spawn_run(&self, entry: Arc<ExecutionEntry>) {
        let Some(manager) = self.weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let worker = entry.state.lock().worker;
            manager.events.publish(FlowEvent::ExecutionStarted {
                execution: entry.id.clone(),
                batch: entry.batch.clone(),
                worker,
            });
            let result = entry.executor.execute().await;
            manager.finish_execution(entry, result).await;
        });
    }

    /// The single finish path: terminal status, worker release, batch
    /// accounting, persistence, events, queue re-scan, linger eviction.
    async fn finish_execution(&self, entry: Arc<ExecutionEntry>, result: Result<(), FlowError>) {
        let status = {
            let mut state = entry.state.lock();
            if state.finalized {
                return;
            }
            state.finalized = true;
            let status = if state.status == ExecutionStatus::Stopped
                || entry.executor.status() == ExecState::Stopped
            {
                ExecutionStatus::Stopped
            } else {
                match &result {
                    Ok(()) => ExecutionStatus::Completed,
                    Err(err) => {
                        state.last_error = Some(err.to_string());
                        ExecutionStatus::Error
                    }
                }
            };
            state.status = status;
            state.finished_at = Some(Utc::now());
            status
        };
        if let Err(err) = &result {
            warn!(target: "scheduler", execution = %entry.id, error = %err, "execution failed");
        }
        let error = entry.state.lock().last_error.clone();
        self.persist_execution(&entry).await;

        if let Some(batch_id) = entry.batch.clone() {
            // Release and re-scan form one logical step; the dispatch gate
            // keeps observers consistent.
            self.budget.release(&batch_id);
            if let Some(meta) = self.batches.get(&batch_id).map(|m| m.value().clone()) {
                {
                    let mut state = meta.state.lock();
                    state.running = state.running.saturating_sub(1);
                    match status {
                        ExecutionStatus::Completed => state.completed += 1,
                        ExecutionStatus::Error => state.failed += 1,
                        ExecutionStatus::Stopped => state.stopped += 1,
                        _ => {}
                    }
                }
                self.persist_batch(&meta).await;
                self.check_batch_completion(&meta).await;
            }
            self.events.publish(FlowEvent::ExecutionFinished {
                execution: entry.id.clone(),
                batch: Some(batch_id),
                status,
                error,
            });
            self.process_queue().await;
        } else {
            self.events.publish(FlowEvent::ExecutionFinished {
                execution: entry.id.clone(),
                batch: None,
                status,
                error,
            });
        }
        self.schedule_execution_eviction(entry.id.clone());
    }

    /// Terminal accounting for a queued entry that was cancelled before
    /// dispatch. Idempotent with the normal finish path.
    async fn finalize_cancelled(&self, entry: &Arc<ExecutionEntry>) {
        {
            let mut state = entry.state.lock();
            if state.finalized {
                return;
            }
            state.finalized = true;
            state.status = ExecutionStatus::Stopped;
            state.finished_at = Some(Utc::now());
        }
        self.persist_execution(entry).await;
        if let Some(batch_id) = &entry.batch {
            if let Some(meta) = self.batches.get(batch_id).map(|m| m.value().clone()) {
                {
                    let mut state = meta.state.lock();
                    state.queued = state.queued.saturating_sub(1);
                    state.stopped += 1;
                }
                self.persist_batch(&meta).await;
                self.check_batch_completion(&meta).await;
            }
        }
        self.events.publish(FlowEvent::ExecutionFinished {
            execution: entry.id.clone(),
            batch: entry.batch.clone(),
            status: ExecutionStatus::Stopped,
            error: None,
        });
        self.schedule_execution_eviction(entry.id.clone());
    }

    /// A batch is terminal once every valid member reached a terminal
    /// status. Any failure makes it an error batch; an explicit stop wins
    /// over completion.
    async fn check_batch_completion(&self, meta: &Arc<BatchMeta>) {
        let summary = {
            let mut state = meta.state.lock();
            if state.completion_announced {
                return;
            }
            if state.completed + state.failed + state.stopped < meta.valid {
                return;
            }
            if state.status == BatchStatus::Running {
                state.status = if state.failed > 0 {
                    BatchStatus::Error
                } else if state.stopped > 0 {
                    BatchStatus::Stopped
                } else {
                    BatchStatus::Completed
                };
            }
            state.finished_at = Some(Utc::now());
            state.completion_announced = true;
            (state.status, state.completed, state.failed)
        };
        let (status, completed, failed) = summary;
        info!(
            target: "scheduler",
            batch = %meta.id, %status, completed, failed,
            "batch finished"
        );
        self.persist_batch(meta).await;
        self.events.publish(FlowEvent::BatchCompleted {
            batch: meta.id.clone(),
            status,
            completed,
            failed,
        });
        self.schedule_batch_eviction(meta.id.clone());
    }

    async fn persist_execution(&self, entry: &ExecutionEntry) {
        if let Err(err) = self.store.save_execution(&entry.record()).await {
            warn!(target: "scheduler", execution = %entry.id, error = %err, "failed to persist execution record");
        }
    }

    /// Batch records are saved whole on submission; afterwards only the
    /// moving parts are written.
    async fn persist_batch(&self, meta: &BatchMeta) {
        let (progress, status, finished_at) = {
            let state = meta.state.lock();
            (BatchMeta::progress(&state), state.status, state.finished_at)
        };
        if let Err(err) = self
            .store
            .update_batch_progress(&meta.id, progress, status, finished_at)
            .await
        {
            warn!(target: "scheduler", batch = %meta.id, error = %err, "failed to persist batch progress");
        }
    }

    /// Durable records are already written; the live entry lingers briefly
    /// for cheap status queries, then the registry forgets it.
    fn schedule_execution_eviction(&self, id: ExecutionId) {
        let Some(manager) = self.weak.upgrade() else {
            return;
        };
        let linger = self.config.terminal_linger;
        tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            manager.executions.remove(&id);
        });
    }

    fn schedule_batch_eviction(&self, id: BatchId) {
        let Some(manager) = self.weak.upgrade() else {
            return;
        };
        let linger = self.config.terminal_linger;
        tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            manager.budget.forget_batch(&id);
            manager.batches.remove(&id);
        });
    }

    #[cfg(test)]
    pub(crate) fn live_executions(&self) -> usize {
        self.executions.len()
    }
}
