//! Per-namespace change coordination.
//!
//! A [`ChangeQueue`] collects pending `{parameter id → value}` edits for one
//! namespace and hands them to the namespace's [`Executor`] in batches.
//!
//! Edits queued before an accept form one *generation*: every caller that
//! queued into it awaits the same [`BatchWait`], which settles once the whole
//! generation has been executed (possibly over several partial accepts), has
//! failed, or has been rejected. Accept snapshots the selected keys and clears
//! them from the pending map before the executor runs, so edits that arrive
//! while a batch is in flight are never merged into it. If the snapshot took
//! every pending key, later edits open a new generation.
//!
//! At most one executor call is in flight per namespace: accepts serialize on
//! an async gate, and the in-flight batch is tracked as `Option<InFlightBatch>`.
//! The queue removes itself from its [`ChangeRegistry`] once it holds no
//! pending values, no unsettled generation and no in-flight batch.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info_span, warn, Instrument};

use crate::error::FlowError;
use crate::history::HistoryState;
use crate::model::{ParamValue, ParamValues};

/// Priority of session namespaces.
pub const SESSION_PRIORITY: i32 = 0;
/// Priority of generic (custom-parameter) namespaces. Lower is accepted first
/// among namespaces the dependency graph does not order.
pub const GENERIC_PRIORITY: i32 = -1;

/// Result every co-batched caller receives: the executed (amended) values of
/// the generation, or the reason it did not execute.
pub type BatchOutcome = Result<ParamValues, FlowError>;

/// Applies a batch of values to the real backing system.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        namespace: &str,
        values: &ParamValues,
        skip_history: bool,
    ) -> Result<(), FlowError>;
}

/// Output of a [`PreExecutionHook`]: the values to execute and any extra
/// namespaces' state to merge into the resulting history entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Amendment {
    pub values: ParamValues,
    pub history_state: HistoryState,
}

impl Amendment {
    pub fn unchanged(values: ParamValues) -> Self {
        Self {
            values,
            history_state: HistoryState::new(),
        }
    }
}

/// Rewrites or augments a batch before the executor sees it.
#[async_trait]
pub trait PreExecutionHook: Send + Sync {
    async fn amend(&self, namespace: &str, values: ParamValues) -> Result<Amendment, FlowError>;
}

/// Told about every successful executor run.
pub trait ExecutionRecorder: Send + Sync {
    fn record(
        &self,
        namespace: &str,
        executed: &ParamValues,
        extra_history: HistoryState,
        skip_history: bool,
    );
}

/// Collaborators a queue needs to execute. Read at accept time, so a hook or
/// executor replaced while edits are pending takes effect for the next batch.
#[derive(Clone)]
pub struct QueueConfig {
    pub executor: Arc<dyn Executor>,
    pub priority: i32,
    pub hook: Option<Arc<dyn PreExecutionHook>>,
    pub recorder: Option<Arc<dyn ExecutionRecorder>>,
}

/// Shared settlement of one generation. Cheap to clone; every clone resolves
/// to the same outcome.
#[derive(Clone)]
pub struct BatchWait(Shared<BoxFuture<'static, BatchOutcome>>);

impl Future for BatchWait {
    type Output = BatchOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<BatchOutcome> {
        self.0.poll_unpin(cx)
    }
}

/// Result of [`ChangeQueue::remove_value_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removal {
    pub removed: bool,
    pub is_empty: bool,
}

struct Generation {
    id: u64,
    sender: Mutex<Option<oneshot::Sender<BatchOutcome>>>,
    executed: Mutex<ParamValues>,
    wait: BatchWait,
}

impl Generation {
    fn new(id: u64) -> Arc<Self> {
        let (tx, rx) = oneshot::channel();
        let wait = async move {
            rx.await.unwrap_or_else(|_| {
                Err(FlowError::Interrupted {
                    reason: "change queue dropped before settling".into(),
                })
            })
        }
        .boxed()
        .shared();
        Arc::new(Self {
            id,
            sender: Mutex::new(Some(tx)),
            executed: Mutex::new(ParamValues::new()),
            wait: BatchWait(wait),
        })
    }

    fn settle(&self, outcome: BatchOutcome) {
        if let Some(tx) = self.sender.lock().take() {
            let _ = tx.send(outcome);
        }
    }

    /// Resolve with everything executed in this generation.
    fn resolve(&self) {
        let executed = self.executed.lock().clone();
        self.settle(Ok(executed));
    }

    fn has_executed(&self) -> bool {
        !self.executed.lock().is_empty()
    }
}

struct InFlightBatch {
    values: ParamValues,
    generation: Arc<Generation>,
}

#[derive(Debug, Clone)]
enum Selection {
    All,
    Ids(Vec<String>),
    /// Keys queued by auto-mode parameters.
    Auto,
}

#[derive(Default)]
struct QueueState {
    values: IndexMap<String, ParamValue>,
    auto_ids: IndexSet<String>,
    pending: Option<Arc<Generation>>,
    in_flight: Option<InFlightBatch>,
    accept_scheduled: bool,
    next_generation: u64,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.values.is_empty() && self.pending.is_none() && self.in_flight.is_none()
    }

    fn pending_generation(&mut self) -> Arc<Generation> {
        if let Some(generation) = &self.pending {
            return Arc::clone(generation);
        }
        self.next_generation += 1;
        let generation = Generation::new(self.next_generation);
        self.pending = Some(Arc::clone(&generation));
        generation
    }
}

/// The per-namespace change queue. Obtain one through [`ChangeRegistry`].
pub struct ChangeQueue {
    namespace: String,
    config: Mutex<QueueConfig>,
    registry: Weak<ChangeRegistry>,
    state: Mutex<QueueState>,
    gate: tokio::sync::Mutex<()>,
}

impl ChangeQueue {
    fn new(namespace: &str, config: QueueConfig, registry: Weak<ChangeRegistry>) -> Self {
        Self {
            namespace: namespace.to_string(),
            config: Mutex::new(config),
            registry,
            state: Mutex::new(QueueState::default()),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn priority(&self) -> i32 {
        self.config.lock().priority
    }

    pub fn set_executor(&self, executor: Arc<dyn Executor>) {
        self.config.lock().executor = executor;
    }

    pub fn set_hook(&self, hook: Option<Arc<dyn PreExecutionHook>>) {
        self.config.lock().hook = hook;
    }

    /// True while an executor call for this namespace is in flight.
    pub fn is_executing(&self) -> bool {
        self.state.lock().in_flight.is_some()
    }

    /// Values handed to the in-flight executor call, if any.
    pub fn executing_values(&self) -> Option<ParamValues> {
        self.state.lock().in_flight.as_ref().map(|f| f.values.clone())
    }

    /// Pending values not yet snapshotted by an accept.
    pub fn values(&self) -> ParamValues {
        self.state
            .lock()
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().values.is_empty()
    }

    /// Settlement of the pending generation, or of the in-flight one when
    /// nothing is pending.
    pub fn wait(&self) -> Option<BatchWait> {
        let state = self.state.lock();
        state
            .pending
            .as_ref()
            .or(state.in_flight.as_ref().map(|f| &f.generation))
            .map(|g| g.wait.clone())
    }

    /// Queue (or overwrite) a pending value. Returns the settlement of the
    /// generation the value joined.
    pub fn add_value_change(&self, parameter_id: &str, value: ParamValue, auto: bool) -> BatchWait {
        let mut state = self.state.lock();
        let generation = state.pending_generation();
        state.values.insert(parameter_id.to_string(), value);
        if auto {
            state.auto_ids.insert(parameter_id.to_string());
        } else {
            state.auto_ids.shift_remove(parameter_id);
        }
        debug!(
            namespace = %self.namespace,
            parameter = parameter_id,
            generation = generation.id,
            pending = state.values.len(),
            "value change queued"
        );
        generation.wait.clone()
    }

    /// Drop a pending value. Idempotent: removing an absent key reports
    /// `removed: false`.
    pub fn remove_value_change(&self, parameter_id: &str) -> Removal {
        let mut state = self.state.lock();
        let removed = state.values.shift_remove(parameter_id).is_some();
        state.auto_ids.shift_remove(parameter_id);
        Removal {
            removed,
            is_empty: state.values.is_empty(),
        }
    }

    /// Discard the pending generation without calling the executor. Every
    /// caller awaiting it falls back to its last executed value.
    ///
    /// Fails with `AlreadyExecuting` when the pending values belong to a
    /// generation whose earlier part is in flight right now.
    pub fn reject(&self) -> Result<(), FlowError> {
        let generation = {
            let mut state = self.state.lock();
            let Some(generation) = state.pending.clone() else {
                drop(state);
                self.purge_if_idle();
                return Ok(());
            };
            let in_flight = state
                .in_flight
                .as_ref()
                .is_some_and(|f| Arc::ptr_eq(&f.generation, &generation));
            if in_flight {
                if state.values.is_empty() {
                    return Ok(());
                }
                return Err(FlowError::AlreadyExecuting {
                    namespace: self.namespace.clone(),
                });
            }
            state.values.clear();
            state.auto_ids.clear();
            state.pending = None;
            generation
        };
        debug!(namespace = %self.namespace, generation = generation.id, "changes rejected");
        if generation.has_executed() {
            // An earlier partial accept of this generation already ran.
            generation.resolve();
        } else {
            generation.settle(Err(FlowError::Rejected {
                namespace: self.namespace.clone(),
            }));
        }
        self.purge_if_idle();
        Ok(())
    }

    /// Drop pending values and settle their generation with `Interrupted`.
    /// An in-flight batch is left to finish.
    pub fn interrupt(&self, reason: &str) {
        let generation = {
            let mut state = self.state.lock();
            let in_flight_generation = state.in_flight.as_ref().map(|f| Arc::clone(&f.generation));
            state.values.clear();
            state.auto_ids.clear();
            let pending = state.pending.take();
            match (pending, in_flight_generation) {
                (Some(p), Some(f)) if Arc::ptr_eq(&p, &f) => None,
                (pending, _) => pending,
            }
        };
        if let Some(generation) = generation {
            generation.settle(Err(FlowError::Interrupted {
                reason: reason.to_string(),
            }));
        }
        self.purge_if_idle();
    }

    /// Execute pending values. `parameter_ids` restricts the snapshot; `None`
    /// takes the whole queue. Waits for any in-flight batch of this namespace
    /// to finish first. Returns the amended values that were executed (empty
    /// when nothing matched).
    pub async fn accept(
        &self,
        skip_history: bool,
        parameter_ids: Option<&[String]>,
    ) -> Result<ParamValues, FlowError> {
        let selection = match parameter_ids {
            Some(ids) => Selection::Ids(ids.to_vec()),
            None => Selection::All,
        };
        self.accept_selection(skip_history, selection).await
    }

    /// Arrange for auto-mode values to be accepted after `window`. At most one
    /// deferred accept is outstanding per queue.
    pub fn schedule_accept(self: &Arc<Self>, window: Duration, skip_history: bool) {
        {
            let mut state = self.state.lock();
            if state.accept_scheduled {
                return;
            }
            state.accept_scheduled = true;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(namespace = %self.namespace, "no async runtime, deferred accept skipped");
            self.state.lock().accept_scheduled = false;
            return;
        };
        let queue = Arc::clone(self);
        handle.spawn(async move {
            if !window.is_zero() {
                tokio::time::sleep(window).await;
            }
            if let Err(err) = queue.accept_selection(skip_history, Selection::Auto).await {
                debug!(namespace = %queue.namespace, error = %err, "deferred accept failed");
            }
        });
    }

    async fn accept_selection(
        &self,
        skip_history: bool,
        selection: Selection,
    ) -> Result<ParamValues, FlowError> {
        let _gate = self.gate.lock().await;
        let Some((snapshot, generation, residual)) = self.take_snapshot(&selection) else {
            debug!(namespace = %self.namespace, ?selection, "accept found nothing to execute");
            self.purge_if_idle();
            return Ok(ParamValues::new());
        };
        let span = info_span!(
            "accept",
            namespace = %self.namespace,
            generation = generation.id,
            batch_size = snapshot.len(),
            residual
        );
        let outcome = self.run_batch(snapshot, skip_history).instrument(span).await;
        self.finish_batch(&generation, outcome)
    }

    fn take_snapshot(
        &self,
        selection: &Selection,
    ) -> Option<(ParamValues, Arc<Generation>, usize)> {
        let mut state = self.state.lock();
        if matches!(selection, Selection::Auto) {
            state.accept_scheduled = false;
        }
        let keys: Vec<String> = match selection {
            Selection::All => state.values.keys().cloned().collect(),
            Selection::Ids(ids) => ids
                .iter()
                .filter(|id| state.values.contains_key(id.as_str()))
                .cloned()
                .collect(),
            Selection::Auto => state
                .auto_ids
                .iter()
                .filter(|id| state.values.contains_key(id.as_str()))
                .cloned()
                .collect(),
        };
        if keys.is_empty() {
            return None;
        }
        let generation = state.pending.clone()?;
        let mut snapshot = ParamValues::new();
        for key in keys {
            state.auto_ids.shift_remove(&key);
            if let Some(value) = state.values.shift_remove(&key) {
                snapshot.insert(key, value);
            }
        }
        let residual = state.values.len();
        if residual == 0 {
            state.pending = None;
        }
        state.in_flight = Some(InFlightBatch {
            values: snapshot.clone(),
            generation: Arc::clone(&generation),
        });
        Some((snapshot, generation, residual))
    }

    async fn run_batch(
        &self,
        snapshot: ParamValues,
        skip_history: bool,
    ) -> Result<ParamValues, FlowError> {
        let config = self.config.lock().clone();
        let amendment = match &config.hook {
            Some(hook) => hook.amend(&self.namespace, snapshot).await?,
            None => Amendment::unchanged(snapshot),
        };
        config
            .executor
            .execute(&self.namespace, &amendment.values, skip_history)
            .await?;
        debug!(keys = amendment.values.len(), "batch executed");
        if let Some(recorder) = &config.recorder {
            recorder.record(
                &self.namespace,
                &amendment.values,
                amendment.history_state,
                skip_history,
            );
        }
        Ok(amendment.values)
    }

    fn finish_batch(&self, generation: &Arc<Generation>, outcome: BatchOutcome) -> BatchOutcome {
        let still_pending = {
            let mut state = self.state.lock();
            state.in_flight = None;
            let still_pending = state
                .pending
                .as_ref()
                .is_some_and(|g| Arc::ptr_eq(g, generation));
            match &outcome {
                Ok(values) => generation
                    .executed
                    .lock()
                    .extend(values.iter().map(|(k, v)| (k.clone(), v.clone()))),
                Err(_) if still_pending => {
                    // The residual of a failed generation fails with it.
                    state.values.clear();
                    state.auto_ids.clear();
                    state.pending = None;
                }
                Err(_) => {}
            }
            still_pending
        };
        match &outcome {
            Ok(_) if still_pending => {
                debug!(namespace = %self.namespace, "partial accept, residual values stay queued");
            }
            Ok(_) => generation.resolve(),
            Err(err) => {
                warn!(namespace = %self.namespace, error = %err, "batch execution failed");
                generation.settle(Err(err.clone()));
            }
        }
        self.purge_if_idle();
        outcome
    }

    fn purge_if_idle(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_if_idle(self);
        }
    }
}

/// Namespace → live [`ChangeQueue`]. Lock order: registry, then queue state.
#[derive(Default)]
pub struct ChangeRegistry {
    queues: Mutex<HashMap<String, Arc<ChangeQueue>>>,
}

impl ChangeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, namespace: &str) -> Option<Arc<ChangeQueue>> {
        self.queues.lock().get(namespace).cloned()
    }

    /// The namespace's queue, created with `config` if none exists.
    pub fn get_or_create(
        self: &Arc<Self>,
        namespace: &str,
        config: impl FnOnce() -> QueueConfig,
    ) -> Arc<ChangeQueue> {
        self.entry(&mut self.queues.lock(), namespace, config)
    }

    /// Get-or-create plus `add_value_change` under the registry lock, so a
    /// concurrent purge cannot orphan the new value.
    pub fn enqueue(
        self: &Arc<Self>,
        namespace: &str,
        config: impl FnOnce() -> QueueConfig,
        parameter_id: &str,
        value: ParamValue,
        auto: bool,
    ) -> (Arc<ChangeQueue>, BatchWait) {
        let mut queues = self.queues.lock();
        let queue = self.entry(&mut queues, namespace, config);
        let wait = queue.add_value_change(parameter_id, value, auto);
        (queue, wait)
    }

    fn entry(
        self: &Arc<Self>,
        queues: &mut HashMap<String, Arc<ChangeQueue>>,
        namespace: &str,
        config: impl FnOnce() -> QueueConfig,
    ) -> Arc<ChangeQueue> {
        Arc::clone(queues.entry(namespace.to_string()).or_insert_with(|| {
            debug!(namespace, "change queue created");
            Arc::new(ChangeQueue::new(namespace, config(), Arc::downgrade(self)))
        }))
    }

    pub fn remove(&self, namespace: &str) -> Option<Arc<ChangeQueue>> {
        self.queues.lock().remove(namespace)
    }

    pub fn all(&self) -> Vec<Arc<ChangeQueue>> {
        self.queues.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.queues.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.lock().is_empty()
    }

    fn remove_if_idle(&self, queue: &ChangeQueue) {
        let mut queues = self.queues.lock();
        let is_registered = queues
            .get(queue.namespace())
            .is_some_and(|q| std::ptr::eq(Arc::as_ptr(q), queue));
        if is_registered && queue.state.lock().is_idle() {
            queues.remove(queue.namespace());
            debug!(namespace = queue.namespace(), "change queue purged");
        }
    }
}
