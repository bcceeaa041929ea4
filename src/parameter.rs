//! Per-parameter state and actions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::FlowError;
use crate::model::{ParamValue, ParameterDefinition};

// ── State ──────────────────────────────────────────────────────────

/// Value triple of one parameter. `dirty == (ui_value != exec_value)` after
/// every action, and `ui_value` has always passed validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ParameterState {
    pub ui_value: ParamValue,
    pub exec_value: ParamValue,
    pub dirty: bool,
}

impl ParameterState {
    pub fn settled(value: ParamValue) -> Self {
        Self {
            ui_value: value.clone(),
            exec_value: value,
            dirty: false,
        }
    }

    fn set_ui(&mut self, value: ParamValue) {
        self.ui_value = value;
        self.dirty = self.ui_value != self.exec_value;
    }

    fn settle(&mut self, value: ParamValue) {
        *self = Self::settled(value);
    }
}

/// Flags for [`ParameterStore::execute`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Accept right away instead of waiting for the batch to be accepted.
    pub force_immediate: bool,
    pub skip_history: bool,
    /// With `force_immediate`, accept the whole namespace queue rather than
    /// only this parameter's key.
    pub accept_all: bool,
    /// The caller accepts the queue itself; no deferred accept is scheduled.
    pub caller_accepts: bool,
}

impl ExecuteOptions {
    pub fn immediate() -> Self {
        Self {
            force_immediate: true,
            ..Self::default()
        }
    }
}

/// Routes a parameter's execute request into its namespace's change queue.
///
/// The queueing work happens synchronously inside `execute`; the returned
/// future only waits for settlement. It resolves to the value the parameter
/// should settle on and never fails: execution errors resolve to `exec`.
pub trait ParameterExecutor: Send + Sync {
    fn execute(
        &self,
        parameter_id: &str,
        ui: ParamValue,
        exec: ParamValue,
        options: ExecuteOptions,
    ) -> BoxFuture<'static, ParamValue>;
}

// ── Observers ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type StateObserver = Arc<dyn Fn(&ParameterState) + Send + Sync>;

// ── Store ──────────────────────────────────────────────────────────

/// Owns one parameter's state. Mutation only happens through the actions
/// below; observers are told about every change after the lock is released.
pub struct ParameterStore {
    definition: ParameterDefinition,
    state: RwLock<ParameterState>,
    executor: Arc<dyn ParameterExecutor>,
    accept_reject_mode: bool,
    observers: Mutex<Vec<(SubscriptionId, StateObserver)>>,
    next_subscription: AtomicU64,
}

impl ParameterStore {
    /// `initial` falls back to the definition's default when absent or invalid.
    pub fn new(
        definition: ParameterDefinition,
        initial: Option<ParamValue>,
        executor: Arc<dyn ParameterExecutor>,
        accept_reject_mode: bool,
    ) -> Self {
        let value = initial
            .and_then(|v| definition.coerce(&v).ok())
            .unwrap_or_else(|| default_value(&definition));
        Self {
            definition,
            state: RwLock::new(ParameterState::settled(value)),
            executor,
            accept_reject_mode,
            observers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn definition(&self) -> &ParameterDefinition {
        &self.definition
    }

    pub fn accept_reject_mode(&self) -> bool {
        self.accept_reject_mode
    }

    pub fn state(&self) -> ParameterState {
        self.state.read().clone()
    }

    pub fn with_state<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&ParameterState) -> R,
    {
        let guard = self.state.read();
        f(&guard)
    }

    pub fn is_valid(&self, value: &ParamValue) -> bool {
        self.definition.is_valid(value)
    }

    /// The throwing form of [`is_valid`](Self::is_valid): returns the
    /// canonical value or the reason it was refused.
    pub fn validate(&self, value: &ParamValue) -> Result<ParamValue, FlowError> {
        self.definition.coerce(value)
    }

    /// Returns false, leaving state untouched, when `value` is invalid.
    pub fn set_ui_value(&self, value: &ParamValue) -> bool {
        let Ok(value) = self.definition.coerce(value) else {
            return false;
        };
        self.mutate(|s| s.set_ui(value));
        true
    }

    /// Set both values without executing.
    pub fn set_ui_and_exec_value(&self, value: &ParamValue) -> bool {
        let Ok(value) = self.definition.coerce(value) else {
            return false;
        };
        self.mutate(|s| s.settle(value));
        true
    }

    /// Record that `value` reached the backing system while the execute
    /// future that will settle it is still pending.
    pub(crate) fn mark_executed(&self, value: &ParamValue) {
        let value = self
            .definition
            .coerce(value)
            .unwrap_or_else(|_| value.clone());
        self.mutate(|s| {
            s.exec_value = value;
            s.dirty = s.ui_value != s.exec_value;
        });
    }

    pub fn reset_to_default_value(&self) {
        let value = default_value(&self.definition);
        self.mutate(|s| s.set_ui(value));
    }

    pub fn reset_to_exec_value(&self) {
        self.mutate(|s| {
            let exec = s.exec_value.clone();
            s.set_ui(exec);
        });
    }

    /// Queue the current ui value for execution. Queueing happens before this
    /// returns; the future settles the state on the executed value (or the
    /// last executed value when the batch failed or was rejected).
    pub fn execute(self: &Arc<Self>, options: ExecuteOptions) -> BoxFuture<'static, ParamValue> {
        let (ui, exec) = self.with_state(|s| (s.ui_value.clone(), s.exec_value.clone()));
        let pending = self
            .executor
            .execute(&self.definition.id, ui, exec, options);
        let store = Arc::clone(self);
        async move {
            let value = pending.await;
            store.mutate(|s| s.settle(value.clone()));
            value
        }
        .boxed()
    }

    pub fn subscribe(&self, observer: StateObserver) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push((id, observer));
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(sid, _)| *sid != id);
        observers.len() != before
    }

    fn mutate(&self, f: impl FnOnce(&mut ParameterState)) {
        let snapshot = {
            let mut guard = self.state.write();
            let before = guard.clone();
            f(&mut guard);
            if *guard == before {
                return;
            }
            guard.clone()
        };
        let observers: Vec<StateObserver> =
            self.observers.lock().iter().map(|(_, o)| Arc::clone(o)).collect();
        for observer in observers {
            observer(&snapshot);
        }
    }
}

fn default_value(definition: &ParameterDefinition) -> ParamValue {
    definition
        .coerce(&definition.defval)
        .unwrap_or_else(|_| definition.defval.clone())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::model::ParamType;

    /// Settles every request on a fixed outcome.
    struct FixedExecutor {
        outcome: Option<ParamValue>,
        requests: Mutex<Vec<(String, ParamValue, ExecuteOptions)>>,
    }

    impl ParameterExecutor for FixedExecutor {
        fn execute(
            &self,
            parameter_id: &str,
            ui: ParamValue,
            _exec: ParamValue,
            options: ExecuteOptions,
        ) -> BoxFuture<'static, ParamValue> {
            self.requests
                .lock()
                .push((parameter_id.to_string(), ui.clone(), options));
            let value = match &self.outcome {
                Some(v) => v.clone(),
                None => ui,
            };
            async move { value }.boxed()
        }
    }

    fn width_store(outcome: Option<ParamValue>) -> (Arc<ParameterStore>, Arc<FixedExecutor>) {
        let executor = Arc::new(FixedExecutor {
            outcome,
            requests: Mutex::new(Vec::new()),
        });
        let definition = ParameterDefinition::new(
            "width",
            ParamType::Float {
                min: Some(0.0),
                max: Some(100.0),
                decimal_places: None,
            },
            ParamValue::Float(10.0),
        );
        let store = Arc::new(ParameterStore::new(
            definition,
            None,
            Arc::clone(&executor) as Arc<dyn ParameterExecutor>,
            false,
        ));
        (store, executor)
    }

    #[test]
    fn test_set_ui_value_validates_and_marks_dirty() {
        let (store, _) = width_store(None);
        assert!(!store.set_ui_value(&"200".into()));
        assert_eq!(store.state(), ParameterState::settled(ParamValue::Float(10.0)));

        assert!(store.set_ui_value(&"50".into()));
        let state = store.state();
        assert_eq!(state.ui_value, ParamValue::Float(50.0));
        assert_eq!(state.exec_value, ParamValue::Float(10.0));
        assert!(state.dirty);

        assert!(store.set_ui_value(&ParamValue::Float(10.0)));
        assert!(!store.state().dirty);
    }

    #[test]
    fn test_local_resets() {
        let (store, _) = width_store(None);
        store.set_ui_and_exec_value(&ParamValue::Float(30.0));
        store.set_ui_value(&ParamValue::Float(40.0));
        store.reset_to_exec_value();
        assert_eq!(store.state(), ParameterState::settled(ParamValue::Float(30.0)));

        store.reset_to_default_value();
        let state = store.state();
        assert_eq!(state.ui_value, ParamValue::Float(10.0));
        assert!(state.dirty);
    }

    #[test]
    fn test_validate_reports_reason() {
        let (store, _) = width_store(None);
        assert!(matches!(
            store.validate(&ParamValue::Float(-1.0)),
            Err(FlowError::InvalidValue { .. })
        ));
        assert_eq!(store.validate(&"5".into()).unwrap(), ParamValue::Float(5.0));
    }

    #[tokio::test]
    async fn test_execute_settles_on_returned_value() {
        let (store, executor) = width_store(Some(ParamValue::Float(42.0)));
        store.set_ui_value(&ParamValue::Float(50.0));
        let value = store.execute(ExecuteOptions::immediate()).await;

        assert_eq!(value, ParamValue::Float(42.0));
        assert_eq!(store.state(), ParameterState::settled(ParamValue::Float(42.0)));
        let requests = executor.requests.lock();
        assert_eq!(requests[0].0, "width");
        assert_eq!(requests[0].1, ParamValue::Float(50.0));
        assert!(requests[0].2.force_immediate);
    }

    #[test]
    fn test_observers_receive_changes_until_unsubscribed() {
        let (store, _) = width_store(None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let id = store.subscribe({
            let seen = Arc::clone(&seen);
            Arc::new(move |s: &ParameterState| seen.lock().push(s.ui_value.clone()))
        });

        store.set_ui_value(&ParamValue::Float(20.0));
        // No-op mutation is not reported.
        store.set_ui_value(&ParamValue::Float(20.0));
        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));
        store.set_ui_value(&ParamValue::Float(30.0));

        assert_eq!(seen.lock().as_slice(), &[ParamValue::Float(20.0)]);
    }
}
