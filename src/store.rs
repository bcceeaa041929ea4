//! The orchestrator: registered namespaces with their parameter stores, the
//! per-namespace change queues, pre-execution hooks, the dependency graph
//! and the cross-namespace history.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures_util::future::{self, BoxFuture, FutureExt};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use ts_rs::TS;

use crate::changes::{
    BatchOutcome, ChangeQueue, ChangeRegistry, ExecutionRecorder, Executor, PreExecutionHook,
    QueueConfig, GENERIC_PRIORITY, SESSION_PRIORITY,
};
use crate::error::FlowError;
use crate::executor::{JsonPayloadHook, Session, SessionCallbacks, SessionExecutor};
use crate::graph::NamespaceGraph;
use crate::history::{HistoryEntry, HistoryInfo, HistoryStack, HistoryState};
use crate::model::{ParamKind, ParamValue, ParamValues, ParameterDefinition};
use crate::parameter::{ExecuteOptions, ParameterExecutor, ParameterStore};
use crate::progress::{ProgressSink, TracingProgress};
use crate::settings::OrchestratorSettings;

/// Per-parameter policy: `true` means edits wait for an explicit accept.
pub type AcceptRejectSelector = Arc<dyn Fn(&ParameterDefinition) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub enum NamespaceKind {
    Session,
    Generic,
}

/// A generic parameter plus an optional externally supplied current value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericParameterDefinition {
    #[serde(flatten)]
    pub definition: ParameterDefinition,
    #[serde(default)]
    pub value: Option<ParamValue>,
}

impl From<ParameterDefinition> for GenericParameterDefinition {
    fn from(definition: ParameterDefinition) -> Self {
        Self {
            definition,
            value: None,
        }
    }
}

struct NamespaceEntry {
    kind: NamespaceKind,
    priority: i32,
    executor: Arc<dyn Executor>,
    parameters: IndexMap<String, Arc<ParameterStore>>,
}

// ── Shared state ───────────────────────────────────────────────────

struct Inner {
    settings: OrchestratorSettings,
    namespaces: RwLock<IndexMap<String, NamespaceEntry>>,
    changes: Arc<ChangeRegistry>,
    hooks: RwLock<HashMap<String, Arc<dyn PreExecutionHook>>>,
    graph: RwLock<NamespaceGraph>,
    history: Mutex<HistoryStack>,
    progress: Arc<dyn ProgressSink>,
}

impl Inner {
    fn queue_config(self: &Arc<Self>, namespace: &str) -> Option<QueueConfig> {
        let (executor, priority) = {
            let namespaces = self.namespaces.read();
            let entry = namespaces.get(namespace)?;
            (Arc::clone(&entry.executor), entry.priority)
        };
        let hook = self.hooks.read().get(namespace).cloned();
        Some(QueueConfig {
            executor,
            priority,
            hook,
            recorder: Some(Arc::new(HistoryRecorder(Arc::downgrade(self)))),
        })
    }

    fn stores(&self, namespace: &str) -> Result<IndexMap<String, Arc<ParameterStore>>, FlowError> {
        self.namespaces
            .read()
            .get(namespace)
            .map(|entry| entry.parameters.clone())
            .ok_or_else(|| FlowError::not_found(format!("Namespace {namespace}")))
    }

    fn store(&self, namespace: &str, parameter_id: &str) -> Result<Arc<ParameterStore>, FlowError> {
        self.stores(namespace)?
            .get(parameter_id)
            .cloned()
            .ok_or_else(|| FlowError::not_found(format!("Parameter {parameter_id} in {namespace}")))
    }

    /// Last executed value of every parameter of `namespace`.
    fn exec_values(&self, namespace: &str) -> ParamValues {
        self.stores(namespace)
            .map(|stores| {
                stores
                    .iter()
                    .map(|(id, store)| (id.clone(), store.with_state(|s| s.exec_value.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Marks executed values on the stores and pushes the history entry for
/// every successful, non-suppressed executor run.
struct HistoryRecorder(Weak<Inner>);

impl ExecutionRecorder for HistoryRecorder {
    fn record(
        &self,
        namespace: &str,
        executed: &ParamValues,
        extra_history: HistoryState,
        skip_history: bool,
    ) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        if let Ok(stores) = inner.stores(namespace) {
            for (id, value) in executed {
                if let Some(store) = stores.get(id) {
                    store.mark_executed(value);
                }
            }
        }
        if skip_history {
            return;
        }
        let mut state = extra_history;
        state.insert(namespace.to_string(), inner.exec_values(namespace));
        let entry = inner.history.lock().push(state);
        info!(namespace, time = entry.time, "history entry pushed");
    }
}

// ── Consumer-level executor ────────────────────────────────────────

/// What a [`ParameterStore`] calls to execute: routes the value into the
/// namespace's change queue and turns the batch outcome into the value the
/// store settles on. Failures never escape; they resolve to the store's
/// last executed value.
struct NamespaceParameterExecutor {
    inner: Weak<Inner>,
    namespace: String,
    accept_reject_mode: bool,
}

impl ParameterExecutor for NamespaceParameterExecutor {
    fn execute(
        &self,
        parameter_id: &str,
        ui: ParamValue,
        exec: ParamValue,
        options: ExecuteOptions,
    ) -> BoxFuture<'static, ParamValue> {
        let Some(inner) = self.inner.upgrade() else {
            return future::ready(exec).boxed();
        };

        if ui == exec {
            // Edited back to the executed value: drop the pending change.
            if let Some(queue) = inner.changes.get(&self.namespace) {
                let removal = queue.remove_value_change(parameter_id);
                if removal.removed && removal.is_empty {
                    if let Err(e) = queue.reject() {
                        debug!(namespace = %self.namespace, error = %e, "no-op batch left to finish");
                    }
                }
            }
            return future::ready(exec).boxed();
        }

        let Some(config) = inner.queue_config(&self.namespace) else {
            warn!(namespace = %self.namespace, parameter = parameter_id, "namespace is not registered");
            return future::ready(exec).boxed();
        };
        let auto = !self.accept_reject_mode && !options.caller_accepts;
        let (queue, wait) =
            inner
                .changes
                .enqueue(&self.namespace, move || config, parameter_id, ui, auto);
        let namespace = self.namespace.clone();
        let parameter_id = parameter_id.to_string();
        let weak = Weak::clone(&self.inner);

        if options.force_immediate {
            let ids = (!options.accept_all).then(|| vec![parameter_id.clone()]);
            return async move {
                let outcome = match queue.accept(options.skip_history, ids.as_deref()).await {
                    Ok(values) if values.contains_key(&parameter_id) => Ok(values),
                    // Another accept took this key; wait for its batch.
                    Ok(_) => wait.await,
                    Err(e) => Err(e),
                };
                let exec = current_exec(&weak, &namespace, &parameter_id, exec);
                settled_value(&namespace, &parameter_id, outcome, exec)
            }
            .boxed();
        }

        if auto {
            queue.schedule_accept(inner.settings.batch_window(), options.skip_history);
        }
        async move {
            let outcome = wait.await;
            let exec = current_exec(&weak, &namespace, &parameter_id, exec);
            settled_value(&namespace, &parameter_id, outcome, exec)
        }
        .boxed()
    }
}

/// The store's executed value once its batch has settled. An earlier
/// partial accept of the same generation may have moved it past `captured`.
fn current_exec(inner: &Weak<Inner>, namespace: &str, parameter_id: &str, captured: ParamValue) -> ParamValue {
    inner
        .upgrade()
        .and_then(|inner| inner.store(namespace, parameter_id).ok())
        .map_or(captured, |store| store.with_state(|s| s.exec_value.clone()))
}

fn settled_value(
    namespace: &str,
    parameter_id: &str,
    outcome: BatchOutcome,
    exec: ParamValue,
) -> ParamValue {
    match outcome {
        Ok(values) => values.get(parameter_id).cloned().unwrap_or(exec),
        Err(e) if e.is_interruption() || matches!(e, FlowError::Rejected { .. }) => {
            debug!(namespace, parameter = parameter_id, reason = %e, "change dropped, rolled back");
            exec
        }
        Err(e) => {
            warn!(namespace, parameter = parameter_id, error = %e, "execution failed, rolled back");
            exec
        }
    }
}

// ── Orchestrator ───────────────────────────────────────────────────

/// Entry point for hosts. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(OrchestratorSettings::default())
    }
}

impl Orchestrator {
    pub fn new(settings: OrchestratorSettings) -> Self {
        Self::with_progress(settings, Arc::new(TracingProgress))
    }

    pub fn with_progress(settings: OrchestratorSettings, progress: Arc<dyn ProgressSink>) -> Self {
        let history = HistoryStack::new(settings.max_history_entries);
        Self {
            inner: Arc::new(Inner {
                settings,
                namespaces: RwLock::new(IndexMap::new()),
                changes: ChangeRegistry::new(),
                hooks: RwLock::new(HashMap::new()),
                graph: RwLock::new(NamespaceGraph::new()),
                history: Mutex::new(history),
                progress,
            }),
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    // ── Registration ──

    /// Register a session under its id. A session already registered under
    /// that id is replaced; its pending changes are interrupted.
    pub fn add_session(
        &self,
        session: Arc<dyn Session>,
        selector: Option<AcceptRejectSelector>,
        callbacks: SessionCallbacks,
    ) {
        let namespace = session.id().to_string();
        if self.detach(&namespace, "session replaced") {
            info!(namespace = %namespace, "session replaced");
        }
        let parameters = session
            .parameter_definitions()
            .into_iter()
            .map(|definition| {
                let initial = session.staged_value(&definition.id).map(ParamValue::Text);
                let store = self.new_store(&namespace, definition, initial, selector.as_ref());
                (store.id().to_string(), store)
            })
            .collect::<IndexMap<_, _>>();
        let request_exports = callbacks
            .request_exports
            .unwrap_or(self.inner.settings.request_default_exports);
        let executor = Arc::new(SessionExecutor::new(
            session,
            request_exports,
            Arc::clone(&self.inner.progress),
            callbacks,
        ));
        info!(namespace = %namespace, parameters = parameters.len(), "session registered");
        self.inner.namespaces.write().insert(
            namespace,
            NamespaceEntry {
                kind: NamespaceKind::Session,
                priority: SESSION_PRIORITY,
                executor,
                parameters,
            },
        );
    }

    /// Register parameters that no session owns, executed by `executor`.
    pub fn add_generic(
        &self,
        namespace: &str,
        selector: Option<AcceptRejectSelector>,
        definitions: Vec<GenericParameterDefinition>,
        executor: Arc<dyn Executor>,
        depends_on: &[String],
    ) -> Result<(), FlowError> {
        self.set_dependencies(namespace, depends_on)?;
        self.detach(namespace, "namespace re-registered");
        let parameters = definitions
            .into_iter()
            .map(|GenericParameterDefinition { definition, value }| {
                let store = self.new_store(namespace, definition, value, selector.as_ref());
                (store.id().to_string(), store)
            })
            .collect::<IndexMap<_, _>>();
        info!(namespace, parameters = parameters.len(), ?depends_on, "generic namespace registered");
        self.inner.namespaces.write().insert(
            namespace.to_string(),
            NamespaceEntry {
                kind: NamespaceKind::Generic,
                priority: GENERIC_PRIORITY,
                executor,
                parameters,
            },
        );
        Ok(())
    }

    /// Idempotent re-registration of a generic namespace. Stores whose
    /// definition and accept/reject mode are unchanged are kept; their values
    /// are only reset when a supplied `value` differs from the executed one.
    pub fn sync_generic(
        &self,
        namespace: &str,
        selector: Option<AcceptRejectSelector>,
        definitions: Vec<GenericParameterDefinition>,
        executor: Arc<dyn Executor>,
        depends_on: &[String],
    ) -> Result<(), FlowError> {
        let Ok(existing) = self.inner.stores(namespace) else {
            return self.add_generic(namespace, selector, definitions, executor, depends_on);
        };
        self.set_dependencies(namespace, depends_on)?;

        let mut parameters = IndexMap::new();
        let mut reused = 0usize;
        for GenericParameterDefinition { definition, value } in definitions {
            let mode = self.accept_reject_mode(selector.as_ref(), &definition);
            let store = match existing.get(&definition.id) {
                Some(store)
                    if store.definition() == &definition && store.accept_reject_mode() == mode =>
                {
                    reused += 1;
                    if let Some(value) = value {
                        sync_value(store, &value);
                    }
                    Arc::clone(store)
                }
                _ => self.new_store(namespace, definition, value, selector.as_ref()),
            };
            parameters.insert(store.id().to_string(), store);
        }

        if let Some(entry) = self.inner.namespaces.write().get_mut(namespace) {
            entry.parameters = parameters;
            entry.executor = Arc::clone(&executor);
        }
        if let Some(queue) = self.inner.changes.get(namespace) {
            queue.set_executor(executor);
        }
        debug!(namespace, reused, "generic namespace synced");
        Ok(())
    }

    /// Drop a namespace with its stores, hook and dependency edges. Pending
    /// changes settle with `Interrupted`.
    pub fn remove_namespace(&self, namespace: &str) -> bool {
        let removed = self.detach(namespace, "namespace removed");
        self.inner.hooks.write().remove(namespace);
        self.inner.graph.write().remove(namespace);
        if removed {
            info!(namespace, "namespace removed");
        }
        removed
    }

    /// Drop the namespace's stores and queue, keeping its hook and edges.
    fn detach(&self, namespace: &str, reason: &str) -> bool {
        let removed = self.inner.namespaces.write().shift_remove(namespace).is_some();
        if let Some(queue) = self.inner.changes.remove(namespace) {
            queue.interrupt(reason);
        }
        removed
    }

    fn new_store(
        &self,
        namespace: &str,
        definition: ParameterDefinition,
        initial: Option<ParamValue>,
        selector: Option<&AcceptRejectSelector>,
    ) -> Arc<ParameterStore> {
        let mode = self.accept_reject_mode(selector, &definition);
        let executor = Arc::new(NamespaceParameterExecutor {
            inner: Arc::downgrade(&self.inner),
            namespace: namespace.to_string(),
            accept_reject_mode: mode,
        });
        Arc::new(ParameterStore::new(definition, initial, executor, mode))
    }

    fn accept_reject_mode(
        &self,
        selector: Option<&AcceptRejectSelector>,
        definition: &ParameterDefinition,
    ) -> bool {
        selector.map_or(self.inner.settings.default_accept_reject_mode, |s| s(definition))
    }

    fn set_dependencies(&self, namespace: &str, depends_on: &[String]) -> Result<(), FlowError> {
        let mut graph = self.inner.graph.write();
        let previous = graph.dependencies(namespace);
        graph.set_dependencies(namespace, depends_on);
        if let Err(e) = graph.check_acyclic() {
            graph.set_dependencies(namespace, &previous);
            return Err(e);
        }
        Ok(())
    }

    // ── Lookup ──

    pub fn namespaces(&self) -> Vec<String> {
        self.inner.namespaces.read().keys().cloned().collect()
    }

    pub fn namespace_kind(&self, namespace: &str) -> Option<NamespaceKind> {
        self.inner.namespaces.read().get(namespace).map(|e| e.kind)
    }

    pub fn get_parameters(&self, namespace: &str) -> Result<Vec<Arc<ParameterStore>>, FlowError> {
        Ok(self.inner.stores(namespace)?.into_values().collect())
    }

    /// Find a parameter by id, else by name or display name, optionally
    /// restricted to one type.
    pub fn get_parameter(
        &self,
        namespace: &str,
        query: &str,
        kind: Option<ParamKind>,
    ) -> Result<Arc<ParameterStore>, FlowError> {
        let stores = self.inner.stores(namespace)?;
        let kind_matches =
            |store: &&Arc<ParameterStore>| kind.map_or(true, |k| store.definition().param_type.kind() == k);
        stores
            .get(query)
            .filter(kind_matches)
            .or_else(|| {
                stores
                    .values()
                    .filter(kind_matches)
                    .find(|s| s.definition().matches(query))
            })
            .cloned()
            .ok_or_else(|| FlowError::not_found(format!("Parameter {query} in {namespace}")))
    }

    // ── Changes ──

    /// The namespace's change queue, created if it does not exist. A queue
    /// created here stays registered until the next accept or reject on it;
    /// use [`Orchestrator::existing_changes`] to look without registering.
    pub fn get_changes(&self, namespace: &str) -> Result<Arc<ChangeQueue>, FlowError> {
        let config = self
            .inner
            .queue_config(namespace)
            .ok_or_else(|| FlowError::not_found(format!("Namespace {namespace}")))?;
        Ok(self.inner.changes.get_or_create(namespace, move || config))
    }

    /// The namespace's change queue if one is live. Never creates one.
    pub fn existing_changes(&self, namespace: &str) -> Option<Arc<ChangeQueue>> {
        self.inner.changes.get(namespace)
    }

    /// Set several values of one namespace and execute them as one batch.
    ///
    /// Every value is validated before any state changes; an unknown
    /// parameter or invalid value fails the whole call untouched. Execution
    /// errors are returned; the stores roll back to their executed values.
    pub async fn batch_parameter_value_update(
        &self,
        namespace: &str,
        values: &ParamValues,
        skip_history: bool,
    ) -> Result<ParamValues, FlowError> {
        let mut validated = Vec::with_capacity(values.len());
        for (id, value) in values {
            let store = self.inner.store(namespace, id)?;
            let value = store.validate(value)?;
            validated.push((store, value));
        }

        let options = ExecuteOptions {
            skip_history,
            caller_accepts: true,
            ..ExecuteOptions::default()
        };
        let pending: Vec<_> = validated
            .iter()
            .map(|(store, value)| {
                store.set_ui_value(value);
                store.execute(options)
            })
            .collect();

        let Some(queue) = self.inner.changes.get(namespace) else {
            future::join_all(pending).await;
            return Ok(ParamValues::new());
        };
        debug!(namespace, keys = validated.len(), "batch update queued");
        let (accepted, _) =
            future::join(queue.accept(skip_history, None), future::join_all(pending)).await;
        accepted
    }

    /// Accept everything pending for `namespace`.
    pub async fn accept_changes(
        &self,
        namespace: &str,
        skip_history: bool,
    ) -> Result<ParamValues, FlowError> {
        match self.inner.changes.get(namespace) {
            Some(queue) => queue.accept(skip_history, None).await,
            None => Ok(ParamValues::new()),
        }
    }

    pub fn reject_changes(&self, namespace: &str) -> Result<(), FlowError> {
        match self.inner.changes.get(namespace) {
            Some(queue) => queue.reject(),
            None => Ok(()),
        }
    }

    /// Accept every namespace with pending changes, dependents before the
    /// namespaces they depend on. Stops at the first failure.
    pub async fn accept_all_changes(&self, skip_history: bool) -> Result<HistoryState, FlowError> {
        let queues: Vec<Arc<ChangeQueue>> = self
            .inner
            .changes
            .all()
            .into_iter()
            .filter(|q| !q.is_empty())
            .collect();
        let ranked: Vec<(String, i32)> = queues
            .iter()
            .map(|q| (q.namespace().to_string(), q.priority()))
            .collect();
        let order = self.inner.graph.read().acceptance_order(&ranked)?;

        let mut accepted = HistoryState::new();
        for namespace in order {
            let Some(queue) = queues.iter().find(|q| q.namespace() == namespace) else {
                continue;
            };
            let values = queue.accept(skip_history, None).await?;
            accepted.insert(namespace, values);
        }
        Ok(accepted)
    }

    /// Reject every pending queue. Returns the first refusal, after trying all.
    pub fn reject_all_changes(&self) -> Result<(), FlowError> {
        let mut first_error = None;
        for queue in self.inner.changes.all() {
            if let Err(e) = queue.reject() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    // ── Hooks ──

    /// One hook per namespace; setting a second one replaces the first.
    pub fn set_pre_execution_hook(&self, namespace: &str, hook: Arc<dyn PreExecutionHook>) {
        let previous = self
            .inner
            .hooks
            .write()
            .insert(namespace.to_string(), Arc::clone(&hook));
        if previous.is_some() {
            warn!(namespace, "pre-execution hook overwritten");
        }
        if let Some(queue) = self.inner.changes.get(namespace) {
            queue.set_hook(Some(hook));
        }
    }

    pub fn remove_pre_execution_hook(&self, namespace: &str) -> bool {
        let removed = self.inner.hooks.write().remove(namespace).is_some();
        if let Some(queue) = self.inner.changes.get(namespace) {
            queue.set_hook(None);
        }
        removed
    }

    /// Hook that splices `source_namespace`'s executed values as JSON into
    /// `payload_parameter` of the batch it amends.
    pub fn payload_hook(
        &self,
        payload_parameter: &str,
        source_namespace: &str,
    ) -> Arc<dyn PreExecutionHook> {
        let inner = Arc::downgrade(&self.inner);
        let source = source_namespace.to_string();
        Arc::new(JsonPayloadHook::new(
            payload_parameter,
            source_namespace,
            Arc::new(move || {
                inner
                    .upgrade()
                    .map(|inner| inner.exec_values(&source))
                    .unwrap_or_default()
            }),
        ))
    }

    // ── Dependency gating ──

    pub fn dependencies(&self, namespace: &str) -> Vec<String> {
        self.inner.graph.read().dependencies(namespace)
    }

    /// True while any namespace `namespace` depends on is executing.
    pub fn is_blocked(&self, namespace: &str) -> bool {
        self.dependencies(namespace).iter().any(|dependee| {
            self.inner
                .changes
                .get(dependee)
                .is_some_and(|q| q.is_executing())
        })
    }

    // ── History ──

    pub fn push_history_state(&self, state: HistoryState) -> HistoryEntry {
        let entry = self.inner.history.lock().push(state);
        debug!(time = entry.time, "history entry pushed");
        entry
    }

    /// Executed values of `namespaces` (all registered namespaces if empty).
    pub fn snapshot_state(&self, namespaces: &[String]) -> HistoryState {
        let names = if namespaces.is_empty() {
            self.namespaces()
        } else {
            namespaces.to_vec()
        };
        names
            .into_iter()
            .filter_map(|namespace| {
                self.inner.stores(&namespace).ok()?;
                let values = self.inner.exec_values(&namespace);
                Some((namespace, values))
            })
            .collect()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.inner.history.lock().entries().to_vec()
    }

    pub fn history_info(&self) -> HistoryInfo {
        self.inner.history.lock().info()
    }

    /// Apply entry `index` to every namespace it covers, then move the cursor.
    pub async fn restore_history_state_from_index(&self, index: usize) -> Result<(), FlowError> {
        let entry = self.inner.history.lock().entry(index)?.clone();
        self.apply_state(&entry.state).await?;
        self.inner.history.lock().set_index(index)?;
        info!(index, time = entry.time, "history restored");
        Ok(())
    }

    pub async fn restore_history_state_from_timestamp(&self, time: i64) -> Result<(), FlowError> {
        let index = self
            .inner
            .history
            .lock()
            .find_by_time(time)
            .ok_or(FlowError::HistoryEntryNotFound { time })?;
        self.restore_history_state_from_index(index).await
    }

    /// Restore an entry handed back by the host (e.g. from its navigation
    /// stack). Matched by timestamp, else by content; an unmatched entry is
    /// applied without moving the cursor. Returns the matched index.
    pub async fn restore_history_state_from_entry(
        &self,
        entry: &HistoryEntry,
    ) -> Result<Option<usize>, FlowError> {
        let index = {
            let history = self.inner.history.lock();
            history
                .find_by_time(entry.time)
                .or_else(|| history.find_matching(&entry.state))
        };
        match index {
            Some(index) => {
                self.restore_history_state_from_index(index).await?;
                Ok(Some(index))
            }
            None => {
                debug!(time = entry.time, "unknown history entry applied without moving the cursor");
                self.apply_state(&entry.state).await?;
                Ok(None)
            }
        }
    }

    /// Step the cursor back. Returns the new index, or None at the start.
    pub async fn undo(&self) -> Result<Option<usize>, FlowError> {
        let Some(index) = self.inner.history.lock().undo_index() else {
            return Ok(None);
        };
        self.restore_history_state_from_index(index).await?;
        Ok(Some(index))
    }

    pub async fn redo(&self) -> Result<Option<usize>, FlowError> {
        let Some(index) = self.inner.history.lock().redo_index() else {
            return Ok(None);
        };
        self.restore_history_state_from_index(index).await?;
        Ok(Some(index))
    }

    pub fn reset_history(&self) {
        self.inner.history.lock().reset();
        debug!("history reset");
    }

    async fn apply_state(&self, state: &HistoryState) -> Result<(), FlowError> {
        let updates = state
            .iter()
            .map(|(namespace, values)| self.batch_parameter_value_update(namespace, values, true));
        future::join_all(updates)
            .await
            .into_iter()
            .find_map(Result::err)
            .map_or(Ok(()), Err)
    }
}

fn sync_value(store: &ParameterStore, value: &ParamValue) {
    match store.validate(value) {
        Ok(value) if store.with_state(|s| s.exec_value != value) => {
            store.set_ui_and_exec_value(&value);
        }
        Ok(_) => {}
        Err(e) => warn!(parameter = store.id(), error = %e, "supplied value ignored"),
    }
}
