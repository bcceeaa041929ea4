//! Single dispatch point for scripted and agent-driven access.
//!
//! A [`Command`] is plain data (`{"command": "set_value", "params": {...}}`),
//! so the CLI, a chat agent's tool calls and tests all drive the orchestrator
//! the same way.

#![allow(clippy::needless_pass_by_value)]

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FlowError;
use crate::history::{HistoryInfo, HistoryState};
use crate::model::{ParamKind, ParamValue, ParamValues};
use crate::parameter::{ExecuteOptions, ParameterState, ParameterStore};
use crate::store::Orchestrator;

// ── Params ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NamespaceParams {
    pub namespace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GetParameterParams {
    pub namespace: String,
    /// Id, name or display name.
    pub parameter: String,
    #[serde(default)]
    pub kind: Option<ParamKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SetValueParams {
    pub namespace: String,
    /// Id, name or display name.
    pub parameter: String,
    pub value: ParamValue,
    /// Execute right away instead of joining the pending batch.
    #[serde(default)]
    pub force_immediate: bool,
    #[serde(default)]
    pub skip_history: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BatchUpdateParams {
    pub namespace: String,
    /// Parameter id → value.
    pub values: ParamValues,
    #[serde(default)]
    pub skip_history: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct AcceptChangesParams {
    /// Omit to accept every namespace.
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub skip_history: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RejectChangesParams {
    /// Omit to reject every namespace.
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Exactly one of `index` and `time`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RestoreHistoryParams {
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default)]
    pub time: Option<i64>,
}

// ── Command ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", content = "params", rename_all = "snake_case")]
pub enum Command {
    GetParameters(NamespaceParams),
    GetParameter(GetParameterParams),
    SetValue(SetValueParams),
    BatchUpdate(BatchUpdateParams),
    AcceptChanges(AcceptChangesParams),
    RejectChanges(RejectChangesParams),
    Undo,
    Redo,
    RestoreHistory(RestoreHistoryParams),
    HistoryInfo,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::GetParameters(_) => "get_parameters",
            Command::GetParameter(_) => "get_parameter",
            Command::SetValue(_) => "set_value",
            Command::BatchUpdate(_) => "batch_update",
            Command::AcceptChanges(_) => "accept_changes",
            Command::RejectChanges(_) => "reject_changes",
            Command::Undo => "undo",
            Command::Redo => "redo",
            Command::RestoreHistory(_) => "restore_history",
            Command::HistoryInfo => "history_info",
        }
    }

    /// Build a command from a tool call (name + JSON input).
    pub fn from_tool_call(name: &str, input: &Value) -> Result<Command, FlowError> {
        let bare = serde_json::json!({ "command": name });
        let parsed: Result<Command, serde_json::Error> = if input.is_null() {
            serde_json::from_value(bare)
        } else {
            // Agents send `{}` for commands without params.
            serde_json::from_value(serde_json::json!({ "command": name, "params": input })).or_else(
                |e| match input.as_object() {
                    Some(map) if map.is_empty() => serde_json::from_value(bare),
                    _ => Err(e),
                },
            )
        };
        parsed.map_err(|e| FlowError::ValidationError {
            message: format!("Invalid call to {name}: {e}"),
        })
    }
}

// ── Output ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ParameterInfo {
    pub id: String,
    pub label: String,
    pub kind: ParamKind,
    pub accept_reject_mode: bool,
    pub state: ParameterState,
}

impl ParameterInfo {
    fn from_store(store: &ParameterStore) -> Self {
        let definition = store.definition();
        Self {
            id: definition.id.clone(),
            label: definition.label().to_string(),
            kind: definition.param_type.kind(),
            accept_reject_mode: store.accept_reject_mode(),
            state: store.state(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum CommandResult {
    Parameters(Vec<ParameterInfo>),
    Parameter(ParameterInfo),
    Value(ParamValue),
    Values(ParamValues),
    Accepted(HistoryState),
    History(HistoryInfo),
    Unit,
}

/// `message` serves the CLI and agents, `result` carries typed data.
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutput {
    pub message: String,
    pub result: CommandResult,
}

impl CommandOutput {
    pub fn new(message: impl Into<String>, result: CommandResult) -> Self {
        Self {
            message: message.into(),
            result,
        }
    }
}

// ── Dispatch ─────────────────────────────────────────────────────

pub async fn dispatch(orchestrator: &Orchestrator, command: Command) -> Result<CommandOutput, FlowError> {
    match command {
        Command::GetParameters(p) => {
            let infos: Vec<ParameterInfo> = orchestrator
                .get_parameters(&p.namespace)?
                .iter()
                .map(|s| ParameterInfo::from_store(s))
                .collect();
            let lines: Vec<String> = infos.iter().map(describe).collect();
            Ok(CommandOutput::new(lines.join("\n"), CommandResult::Parameters(infos)))
        }
        Command::GetParameter(p) => {
            let store = orchestrator.get_parameter(&p.namespace, &p.parameter, p.kind)?;
            let info = ParameterInfo::from_store(&store);
            Ok(CommandOutput::new(describe(&info), CommandResult::Parameter(info)))
        }
        Command::SetValue(p) => set_value(orchestrator, p).await,
        Command::BatchUpdate(p) => {
            let executed = orchestrator
                .batch_parameter_value_update(&p.namespace, &p.values, p.skip_history)
                .await?;
            Ok(CommandOutput::new(
                format!("Executed {} value(s) in {}", executed.len(), p.namespace),
                CommandResult::Values(executed),
            ))
        }
        Command::AcceptChanges(p) => {
            let accepted = match p.namespace {
                Some(namespace) => {
                    let values = orchestrator.accept_changes(&namespace, p.skip_history).await?;
                    let mut accepted = HistoryState::new();
                    if !values.is_empty() {
                        accepted.insert(namespace, values);
                    }
                    accepted
                }
                None => orchestrator.accept_all_changes(p.skip_history).await?,
            };
            let count: usize = accepted.values().map(ParamValues::len).sum();
            Ok(CommandOutput::new(
                format!("Accepted {count} change(s) in {} namespace(s)", accepted.len()),
                CommandResult::Accepted(accepted),
            ))
        }
        Command::RejectChanges(p) => {
            match &p.namespace {
                Some(namespace) => orchestrator.reject_changes(namespace)?,
                None => orchestrator.reject_all_changes()?,
            }
            Ok(CommandOutput::new("Changes rejected", CommandResult::Unit))
        }
        Command::Undo => {
            let moved = orchestrator.undo().await?;
            history_output(orchestrator, moved.map_or("Nothing to undo".into(), |i| format!("Restored entry {i}")))
        }
        Command::Redo => {
            let moved = orchestrator.redo().await?;
            history_output(orchestrator, moved.map_or("Nothing to redo".into(), |i| format!("Restored entry {i}")))
        }
        Command::RestoreHistory(p) => {
            match (p.index, p.time) {
                (Some(index), None) => orchestrator.restore_history_state_from_index(index).await?,
                (None, Some(time)) => orchestrator.restore_history_state_from_timestamp(time).await?,
                _ => return Err("restore_history needs exactly one of index or time".into()),
            }
            history_output(orchestrator, "History restored".to_string())
        }
        Command::HistoryInfo => {
            let info = orchestrator.history_info();
            history_output(orchestrator, format!("{} entries", info.len))
        }
    }
}

async fn set_value(orchestrator: &Orchestrator, p: SetValueParams) -> Result<CommandOutput, FlowError> {
    let store = orchestrator.get_parameter(&p.namespace, &p.parameter, None)?;
    let value = store.validate(&p.value)?;
    store.set_ui_value(&value);
    let options = ExecuteOptions {
        force_immediate: p.force_immediate,
        skip_history: p.skip_history,
        ..ExecuteOptions::default()
    };
    if p.force_immediate {
        let executed = store.execute(options).await;
        return Ok(CommandOutput::new(
            format!("{} = {executed}", store.id()),
            CommandResult::Value(executed),
        ));
    }
    // Settles once the batch is accepted; the caller does not wait for it.
    tokio::spawn(store.execute(options));
    Ok(CommandOutput::new(
        format!("{} queued as {value}", store.id()),
        CommandResult::Value(value),
    ))
}

fn history_output(orchestrator: &Orchestrator, message: String) -> Result<CommandOutput, FlowError> {
    Ok(CommandOutput::new(message, CommandResult::History(orchestrator.history_info())))
}

fn describe(info: &ParameterInfo) -> String {
    let marker = if info.state.dirty { " *" } else { "" };
    format!(
        "{} ({:?}) = {} [executed {}]{marker}",
        info.label, info.kind, info.state.ui_value, info.state.exec_value
    )
}

// ── Tool catalog ─────────────────────────────────────────────────

/// A command's name, description and JSON schema for its params.
#[derive(Debug, Clone, Serialize)]
pub struct ToolEntry {
    pub name: &'static str,
    pub description: &'static str,
    pub param_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

fn schema_value<T: JsonSchema>() -> Value {
    let root = schema_for!(T);
    serde_json::to_value(root).unwrap_or(empty_object_schema())
}

fn entry(name: &'static str, description: &'static str, param_schema: Value) -> ToolEntry {
    ToolEntry {
        name,
        description,
        param_schema,
    }
}

pub fn tool_catalog() -> Vec<ToolEntry> {
    vec![
        entry("get_parameters", "List a namespace's parameters with their ui and executed values", schema_value::<NamespaceParams>()),
        entry("get_parameter", "Look up one parameter by id, name or display name", schema_value::<GetParameterParams>()),
        entry("set_value", "Set a parameter's value and queue it for execution", schema_value::<SetValueParams>()),
        entry("batch_update", "Set several values of one namespace and execute them together", schema_value::<BatchUpdateParams>()),
        entry("accept_changes", "Execute pending changes of one namespace or of all", schema_value::<AcceptChangesParams>()),
        entry("reject_changes", "Discard pending changes of one namespace or of all", schema_value::<RejectChangesParams>()),
        entry("undo", "Restore the previous history entry", empty_object_schema()),
        entry("redo", "Restore the next history entry", empty_object_schema()),
        entry("restore_history", "Restore a history entry by index or timestamp", schema_value::<RestoreHistoryParams>()),
        entry("history_info", "Report undo/redo availability", empty_object_schema()),
    ]
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::executor::generic_executor;
    use crate::model::{ParamType, ParameterDefinition};

    fn orchestrator() -> Orchestrator {
        let orchestrator = Orchestrator::default();
        let definition = ParameterDefinition::new(
            "count",
            ParamType::Int {
                min: Some(0),
                max: Some(10),
            },
            ParamValue::Int(1),
        );
        orchestrator
            .add_generic(
                "custom",
                None,
                vec![definition.into()],
                generic_executor(|_, _, _| async { Ok(()) }),
                &[],
            )
            .unwrap();
        orchestrator
    }

    #[test]
    fn test_commands_parse_from_tagged_json() {
        let command: Command = serde_json::from_str(
            r#"{"command": "set_value", "params": {"namespace": "m1", "parameter": "width", "value": 50}}"#,
        )
        .unwrap();
        assert!(matches!(command, Command::SetValue(ref p) if p.value == ParamValue::Int(50) && !p.force_immediate));

        let undo: Command = serde_json::from_str(r#"{"command": "undo"}"#).unwrap();
        assert_eq!(undo.name(), "undo");
    }

    #[test]
    fn test_from_tool_call_reports_bad_input() {
        let ok = Command::from_tool_call("history_info", &Value::Null).unwrap();
        assert!(matches!(ok, Command::HistoryInfo));
        let ok = Command::from_tool_call("undo", &serde_json::json!({})).unwrap();
        assert!(matches!(ok, Command::Undo));
        let err = Command::from_tool_call("batch_update", &serde_json::json!({"namespace": 1})).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_catalog_covers_every_command() {
        let catalog = tool_catalog();
        assert_eq!(catalog.len(), 10);
        let set_value = catalog.iter().find(|e| e.name == "set_value").unwrap();
        let properties = &set_value.param_schema["properties"];
        assert!(properties.get("namespace").is_some());
        assert!(properties.get("value").is_some());
    }

    #[tokio::test]
    async fn test_dispatch_batch_then_undo() {
        let orchestrator = orchestrator();
        let first = Command::from_tool_call(
            "batch_update",
            &serde_json::json!({"namespace": "custom", "values": {"count": 3}}),
        )
        .unwrap();
        dispatch(&orchestrator, first).await.unwrap();
        let second = Command::from_tool_call(
            "batch_update",
            &serde_json::json!({"namespace": "custom", "values": {"count": 5}}),
        )
        .unwrap();
        dispatch(&orchestrator, second).await.unwrap();

        let output = dispatch(&orchestrator, Command::Undo).await.unwrap();
        assert!(matches!(output.result, CommandResult::History(ref info) if info.index == Some(0) && info.can_redo));
        let store = orchestrator.get_parameter("custom", "count", None).unwrap();
        assert_eq!(store.state().exec_value, ParamValue::Int(3));
    }

    #[tokio::test]
    async fn test_dispatch_rejects_invalid_value() {
        let orchestrator = orchestrator();
        let command = Command::SetValue(SetValueParams {
            namespace: "custom".into(),
            parameter: "count".into(),
            value: ParamValue::Int(99),
            force_immediate: true,
            skip_history: false,
        });
        let err = dispatch(&orchestrator, command).await.unwrap_err();
        assert!(matches!(err, FlowError::InvalidValue { .. }));
    }
}
