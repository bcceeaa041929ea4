use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use super::value::ParamValue;
use crate::error::FlowError;

/// Type and constraints of a parameter. Drives validation and stringification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[ts(export)]
pub enum ParamType {
    Float {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
        #[serde(default)]
        decimal_places: Option<u32>,
    },
    Int {
        #[serde(default)]
        min: Option<i64>,
        #[serde(default)]
        max: Option<i64>,
    },
    Bool,
    /// Value is the index of the selected choice.
    StringList { choices: Vec<String> },
    Text {
        #[serde(default)]
        max_length: Option<usize>,
    },
    /// `#rrggbb`, `#rrggbbaa`, `0xrrggbb` or `0xrrggbbaa`.
    Color,
    /// Reference to a file; the session executor uploads it before customizing.
    File,
    /// Text that must parse as JSON. Used for synthetic payload parameters.
    Json,
}

/// Discriminant of [`ParamType`], used to filter lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS, JsonSchema)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum ParamKind {
    Float,
    Int,
    Bool,
    StringList,
    Text,
    Color,
    File,
    Json,
}

impl ParamType {
    pub fn kind(&self) -> ParamKind {
        match self {
            ParamType::Float { .. } => ParamKind::Float,
            ParamType::Int { .. } => ParamKind::Int,
            ParamType::Bool => ParamKind::Bool,
            ParamType::StringList { .. } => ParamKind::StringList,
            ParamType::Text { .. } => ParamKind::Text,
            ParamType::Color => ParamKind::Color,
            ParamType::File => ParamKind::File,
            ParamType::Json => ParamKind::Json,
        }
    }
}

/// Static description of one parameter. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ParameterDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub displayname: Option<String>,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub group: Option<String>,
    pub defval: ParamValue,
    #[serde(default)]
    pub hidden: bool,
}

impl ParameterDefinition {
    pub fn new(id: impl Into<String>, param_type: ParamType, defval: ParamValue) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            displayname: None,
            param_type,
            group: None,
            defval,
            hidden: false,
        }
    }

    /// True if `query` is this parameter's id, name, or display name.
    pub fn matches(&self, query: &str) -> bool {
        self.id == query || self.name == query || self.displayname.as_deref() == Some(query)
    }

    /// Label for messages: display name, falling back to name.
    pub fn label(&self) -> &str {
        self.displayname.as_deref().unwrap_or(&self.name)
    }

    /// Validate `value` and convert it into the canonical variant for this
    /// parameter type (e.g. `"50"` → `Float(50.0)`). Never mutates anything.
    pub fn coerce(&self, value: &ParamValue) -> Result<ParamValue, FlowError> {
        match &self.param_type {
            ParamType::Float {
                min,
                max,
                decimal_places,
            } => {
                let v = self.number(value)?;
                if !v.is_finite() {
                    return Err(self.invalid("value must be finite"));
                }
                let v = match decimal_places {
                    Some(places) => round_to(v, *places),
                    None => v,
                };
                check_range(v, *min, *max).map_err(|m| self.invalid(m))?;
                Ok(ParamValue::Float(v))
            }
            ParamType::Int { min, max } => {
                let v = match value {
                    ParamValue::Int(v) => *v,
                    #[allow(clippy::cast_possible_truncation)]
                    ParamValue::Float(v) if v.fract() == 0.0 && v.is_finite() => *v as i64,
                    ParamValue::Text(s) => s
                        .trim()
                        .parse::<i64>()
                        .map_err(|_| self.invalid(format!("\"{s}\" is not an integer")))?,
                    other => return Err(self.invalid(format!("{other} is not an integer"))),
                };
                check_range(v, *min, *max).map_err(|m| self.invalid(m))?;
                Ok(ParamValue::Int(v))
            }
            ParamType::Bool => match value {
                ParamValue::Bool(v) => Ok(ParamValue::Bool(*v)),
                ParamValue::Text(s) if s.eq_ignore_ascii_case("true") => Ok(ParamValue::Bool(true)),
                ParamValue::Text(s) if s.eq_ignore_ascii_case("false") => {
                    Ok(ParamValue::Bool(false))
                }
                other => Err(self.invalid(format!("{other} is not a boolean"))),
            },
            ParamType::StringList { choices } => {
                let index = match value {
                    ParamValue::Int(i) => usize::try_from(*i).ok(),
                    ParamValue::Text(s) => s
                        .trim()
                        .parse::<usize>()
                        .ok()
                        .or_else(|| choices.iter().position(|c| c == s)),
                    _ => None,
                };
                match index {
                    Some(i) if i < choices.len() => Ok(ParamValue::Int(i64::try_from(i).map_err(
                        |_| self.invalid("choice index overflow"),
                    )?)),
                    _ => Err(self.invalid(format!(
                        "{value} is not one of {} choices",
                        choices.len()
                    ))),
                }
            }
            ParamType::Text { max_length } => {
                let s = self.text(value)?;
                if let Some(limit) = max_length {
                    if s.chars().count() > *limit {
                        return Err(self.invalid(format!("text longer than {limit} characters")));
                    }
                }
                Ok(ParamValue::Text(s.to_string()))
            }
            ParamType::Color => {
                let s = self.text(value)?;
                if is_color(s) {
                    Ok(ParamValue::Text(s.to_ascii_lowercase()))
                } else {
                    Err(self.invalid(format!("\"{s}\" is not a color")))
                }
            }
            ParamType::File => {
                let s = self.text(value)?;
                if s.is_empty() {
                    return Err(self.invalid("file reference is empty"));
                }
                Ok(ParamValue::Text(s.to_string()))
            }
            ParamType::Json => {
                let s = self.text(value)?;
                serde_json::from_str::<serde_json::Value>(s)
                    .map_err(|e| self.invalid(format!("not valid JSON: {e}")))?;
                Ok(ParamValue::Text(s.to_string()))
            }
        }
    }

    pub fn is_valid(&self, value: &ParamValue) -> bool {
        self.coerce(value).is_ok()
    }

    /// String form of a value as sent to a session.
    pub fn stringify(&self, value: &ParamValue) -> String {
        match (&self.param_type, value) {
            (
                ParamType::Float {
                    decimal_places: Some(places),
                    ..
                },
                v,
            ) => match v.as_float() {
                Some(f) => format!("{f:.prec$}", prec = *places as usize),
                None => v.to_string(),
            },
            (_, v) => v.to_string(),
        }
    }

    fn number(&self, value: &ParamValue) -> Result<f64, FlowError> {
        match value {
            ParamValue::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| self.invalid(format!("\"{s}\" is not a number"))),
            other => other
                .as_float()
                .ok_or_else(|| self.invalid(format!("{other} is not a number"))),
        }
    }

    fn text<'a>(&self, value: &'a ParamValue) -> Result<&'a str, FlowError> {
        value
            .as_text()
            .ok_or_else(|| self.invalid(format!("{value} is not text")))
    }

    fn invalid(&self, message: impl Into<String>) -> FlowError {
        FlowError::InvalidValue {
            parameter: self.id.clone(),
            message: message.into(),
        }
    }
}

fn check_range<T: PartialOrd + std::fmt::Display + Copy>(
    v: T,
    min: Option<T>,
    max: Option<T>,
) -> Result<(), String> {
    if let Some(min) = min {
        if v < min {
            return Err(format!("{v} is below the minimum {min}"));
        }
    }
    if let Some(max) = max {
        if v > max {
            return Err(format!("{v} exceeds the maximum {max}"));
        }
    }
    Ok(())
}

fn round_to(v: f64, places: u32) -> f64 {
    let factor = 10f64.powi(i32::try_from(places).unwrap_or(i32::MAX));
    (v * factor).round() / factor
}

fn is_color(s: &str) -> bool {
    let hex = s
        .strip_prefix('#')
        .or_else(|| s.strip_prefix("0x"))
        .or_else(|| s.strip_prefix("0X"));
    hex.is_some_and(|h| (h.len() == 6 || h.len() == 8) && h.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn width() -> ParameterDefinition {
        ParameterDefinition::new(
            "width",
            ParamType::Float {
                min: Some(0.0),
                max: Some(100.0),
                decimal_places: Some(2),
            },
            ParamValue::Float(10.0),
        )
    }

    #[test]
    fn test_float_coercion_and_range() {
        let def = width();
        assert_eq!(def.coerce(&"50".into()).unwrap(), ParamValue::Float(50.0));
        assert_eq!(def.coerce(&ParamValue::Int(7)).unwrap(), ParamValue::Float(7.0));
        assert_eq!(
            def.coerce(&ParamValue::Float(1.234_5)).unwrap(),
            ParamValue::Float(1.23)
        );
        assert!(!def.is_valid(&"200".into()));
        assert!(!def.is_valid(&ParamValue::Float(-0.5)));
        assert!(!def.is_valid(&ParamValue::Float(f64::NAN)));
        assert!(!def.is_valid(&"wide".into()));
    }

    #[test]
    fn test_invalid_value_names_parameter() {
        let err = width().coerce(&"200".into()).unwrap_err();
        assert!(matches!(err, FlowError::InvalidValue { ref parameter, .. } if parameter == "width"));
    }

    #[test]
    fn test_string_list_accepts_index_or_choice() {
        let def = ParameterDefinition::new(
            "finish",
            ParamType::StringList {
                choices: vec!["matte".into(), "gloss".into()],
            },
            ParamValue::Int(0),
        );
        assert_eq!(def.coerce(&"gloss".into()).unwrap(), ParamValue::Int(1));
        assert_eq!(def.coerce(&"0".into()).unwrap(), ParamValue::Int(0));
        assert!(!def.is_valid(&ParamValue::Int(2)));
        assert!(!def.is_valid(&ParamValue::Int(-1)));
    }

    #[test]
    fn test_bool_color_and_json() {
        let flag = ParameterDefinition::new("flag", ParamType::Bool, ParamValue::Bool(false));
        assert_eq!(flag.coerce(&"TRUE".into()).unwrap(), ParamValue::Bool(true));

        let color = ParameterDefinition::new("color", ParamType::Color, "#ffffff".into());
        assert_eq!(
            color.coerce(&"0xFF0000AA".into()).unwrap(),
            ParamValue::Text("0xff0000aa".into())
        );
        assert!(!color.is_valid(&"red".into()));

        let payload = ParameterDefinition::new("payload", ParamType::Json, "{}".into());
        assert!(payload.is_valid(&r#"{"a": 1}"#.into()));
        assert!(!payload.is_valid(&"{a".into()));
    }

    #[test]
    fn test_text_max_length() {
        let def = ParameterDefinition::new(
            "label",
            ParamType::Text {
                max_length: Some(3),
            },
            "".into(),
        );
        assert!(def.is_valid(&"abc".into()));
        assert!(!def.is_valid(&"abcd".into()));
    }

    #[test]
    fn test_stringify_uses_decimal_places() {
        assert_eq!(width().stringify(&ParamValue::Float(5.0)), "5.00");
        let count = ParameterDefinition::new(
            "count",
            ParamType::Int { min: None, max: None },
            ParamValue::Int(1),
        );
        assert_eq!(count.stringify(&ParamValue::Int(3)), "3");
    }

    #[test]
    fn test_matches_id_name_or_displayname() {
        let mut def = width();
        def.name = "Width".into();
        def.displayname = Some("Box width".into());
        assert!(def.matches("width"));
        assert!(def.matches("Width"));
        assert!(def.matches("Box width"));
        assert!(!def.matches("height"));
    }
}
