pub mod changes;
pub mod command;
pub mod error;
pub mod executor;
pub mod graph;
pub mod history;
pub mod model;
pub mod parameter;
pub mod progress;
pub mod settings;
pub mod store;
pub mod telemetry;

pub use changes::{Amendment, ChangeQueue, Executor, PreExecutionHook};
pub use error::FlowError;
pub use executor::{generic_executor, Session, SessionCallbacks};
pub use history::{HistoryEntry, HistoryInfo, HistoryState};
pub use model::{ParamKind, ParamType, ParamValue, ParamValues, ParameterDefinition};
pub use parameter::{ExecuteOptions, ParameterState, ParameterStore};
pub use settings::OrchestratorSettings;
pub use store::{AcceptRejectSelector, GenericParameterDefinition, NamespaceKind, Orchestrator};
