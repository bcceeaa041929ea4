//! Concrete [`Executor`]s and the ready-made payload hook.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::changes::{Amendment, Executor, PreExecutionHook};
use crate::error::FlowError;
use crate::history::HistoryState;
use crate::model::{ParamKind, ParamValue, ParamValues, ParameterDefinition};
use crate::progress::{emit_progress, ProgressSink};

// ── Session ────────────────────────────────────────────────────────

/// A backing connection to a remote parametric model. Values are staged on
/// the session as strings and applied by `customize`.
#[async_trait]
pub trait Session: Send + Sync {
    /// Used as the namespace.
    fn id(&self) -> &str;

    fn parameter_definitions(&self) -> Vec<ParameterDefinition>;

    /// Value currently staged for a parameter, as the remote model sees it.
    fn staged_value(&self, parameter_id: &str) -> Option<String>;

    fn stage(&self, parameter_id: &str, value: String);

    /// Clear whatever is staged for a parameter so the remote model falls
    /// back to its own value.
    fn unstage(&self, parameter_id: &str);

    /// Upload the file a `File` parameter refers to. Returns the reference to
    /// stage in its place.
    async fn upload_file(&self, parameter_id: &str, value: &ParamValue) -> Result<String, FlowError>;

    /// Apply the staged values remotely.
    async fn customize(&self, request_exports: bool) -> Result<(), FlowError>;
}

pub type ExecutedCallback = Arc<dyn Fn(&str, &ParamValues) + Send + Sync>;
pub type FailedCallback = Arc<dyn Fn(&str, &FlowError) + Send + Sync>;

/// Hooks the host passes when registering a session.
#[derive(Clone, Default)]
pub struct SessionCallbacks {
    /// Overrides `request_default_exports` from the settings.
    pub request_exports: Option<bool>,
    pub on_executed: Option<ExecutedCallback>,
    pub on_failed: Option<FailedCallback>,
}

/// Executes batches against a [`Session`]: uploads files, stages the
/// stringified values, customizes. Staged values are restored if any step
/// fails.
pub struct SessionExecutor {
    session: Arc<dyn Session>,
    definitions: HashMap<String, ParameterDefinition>,
    request_exports: bool,
    progress: Arc<dyn ProgressSink>,
    callbacks: SessionCallbacks,
}

impl SessionExecutor {
    pub fn new(
        session: Arc<dyn Session>,
        request_exports: bool,
        progress: Arc<dyn ProgressSink>,
        callbacks: SessionCallbacks,
    ) -> Self {
        let definitions = session
            .parameter_definitions()
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();
        Self {
            session,
            definitions,
            request_exports,
            progress,
            callbacks,
        }
    }

    async fn stage_and_customize(
        &self,
        values: &ParamValues,
        staged: &mut Vec<(String, Option<String>)>,
    ) -> Result<(), FlowError> {
        let mut prepared = Vec::with_capacity(values.len());
        for (id, value) in values {
            let definition = self
                .definitions
                .get(id)
                .ok_or_else(|| FlowError::not_found(format!("Session parameter {id}")))?;
            let text = if definition.param_type.kind() == ParamKind::File {
                self.session.upload_file(id, value).await?
            } else {
                definition.stringify(value)
            };
            prepared.push((id, text));
        }

        for (id, text) in prepared {
            staged.push((id.clone(), self.session.staged_value(id)));
            self.session.stage(id, text);
        }
        self.session.customize(self.request_exports).await
    }

    fn roll_back(&self, staged: Vec<(String, Option<String>)>) {
        for (id, previous) in staged.into_iter().rev() {
            match previous {
                Some(previous) => self.session.stage(&id, previous),
                None => self.session.unstage(&id),
            }
        }
    }
}

#[async_trait]
impl Executor for SessionExecutor {
    async fn execute(
        &self,
        namespace: &str,
        values: &ParamValues,
        _skip_history: bool,
    ) -> Result<(), FlowError> {
        let op = format!("customize:{namespace}");
        emit_progress(self.progress.as_ref(), &op, "start", 0.0, None);

        let mut staged = Vec::new();
        match self.stage_and_customize(values, &mut staged).await {
            Ok(()) => {
                emit_progress(self.progress.as_ref(), &op, "done", 1.0, None);
                if let Some(callback) = &self.callbacks.on_executed {
                    callback(namespace, values);
                }
                Ok(())
            }
            Err(e) => {
                warn!(namespace, error = %e, restored = staged.len(), "customize failed, staged values restored");
                self.roll_back(staged);
                emit_progress(self.progress.as_ref(), &op, "failed", 1.0, Some(&e.to_string()));
                if let Some(callback) = &self.callbacks.on_failed {
                    callback(namespace, &e);
                }
                Err(e)
            }
        }
    }
}

// ── Generic ────────────────────────────────────────────────────────

/// Executor backed by a caller-supplied async function, for parameters that
/// no session owns.
pub struct GenericExecutor<F> {
    callback: F,
}

impl<F, Fut> GenericExecutor<F>
where
    F: Fn(String, ParamValues, bool) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), FlowError>> + Send + 'static,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

#[async_trait]
impl<F, Fut> Executor for GenericExecutor<F>
where
    F: Fn(String, ParamValues, bool) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), FlowError>> + Send + 'static,
{
    async fn execute(
        &self,
        namespace: &str,
        values: &ParamValues,
        skip_history: bool,
    ) -> Result<(), FlowError> {
        (self.callback)(namespace.to_string(), values.clone(), skip_history).await
    }
}

/// Shorthand for an `Arc<dyn Executor>` around a closure.
pub fn generic_executor<F, Fut>(callback: F) -> Arc<dyn Executor>
where
    F: Fn(String, ParamValues, bool) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), FlowError>> + Send + 'static,
{
    Arc::new(GenericExecutor::new(callback))
}

// ── Payload hook ───────────────────────────────────────────────────

pub type ValuesSource = Arc<dyn Fn() -> ParamValues + Send + Sync>;

/// Splices another namespace's current values, serialized as one JSON
/// object, into a `Json` parameter of the batch. The spliced namespace is
/// also recorded in the batch's history entry.
pub struct JsonPayloadHook {
    payload_parameter: String,
    source_namespace: String,
    source: ValuesSource,
}

impl JsonPayloadHook {
    pub fn new(
        payload_parameter: impl Into<String>,
        source_namespace: impl Into<String>,
        source: ValuesSource,
    ) -> Self {
        Self {
            payload_parameter: payload_parameter.into(),
            source_namespace: source_namespace.into(),
            source,
        }
    }
}

#[async_trait]
impl PreExecutionHook for JsonPayloadHook {
    async fn amend(&self, namespace: &str, mut values: ParamValues) -> Result<Amendment, FlowError> {
        let source_values = (self.source)();
        let payload = serde_json::to_string(&source_values)?;
        debug!(
            namespace,
            source = %self.source_namespace,
            parameter = %self.payload_parameter,
            "payload spliced into batch"
        );
        values.insert(self.payload_parameter.clone(), ParamValue::Text(payload));
        let mut history_state = HistoryState::new();
        history_state.insert(self.source_namespace.clone(), source_values);
        Ok(Amendment {
            values,
            history_state,
        })
    }
}
