pub mod definition;
pub mod value;

// Re-export commonly used types at the model level.
pub use definition::{ParamKind, ParamType, ParameterDefinition};
pub use value::{ParamValue, ParamValues};
