//! Template configuration (`fengine.yaml`) and schema-driven data validation.
//!
//! A template repository looks like this:
//!
//! ```text
//! <template-repo>/
//!   fengine.yaml     (variables + rendering options, optional)
//!   template/        (the tree that gets rendered)
//! ```
//!
//! Validation never stops at the first problem: every missing variable and
//! every kind mismatch is collected into [`TemplateError::InvalidTemplateData`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{template_io_err, DataError, DataErrorKind, TemplateError};
use crate::types::TemplateData;

/// File name of the template configuration at the template repository root.
pub const CONFIG_FILENAME: &str = "fengine.yaml";

/// Subdirectory of the template repository holding the renderable tree.
pub const TEMPLATE_DIRNAME: &str = "template";

/// Variable name → definition.
pub type TemplateSchema = BTreeMap<String, VariableDefinition>;

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Element kind of a `list` variable. Only string lists are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ListElementType {
    #[default]
    Str,
}

/// One declared template variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VariableDefinition {
    Str {
        #[serde(default)]
        description: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
    Int {
        #[serde(default)]
        description: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<i64>,
    },
    Bool {
        #[serde(default)]
        description: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<bool>,
    },
    List {
        #[serde(default)]
        description: String,
        #[serde(default)]
        element_type: ListElementType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Vec<String>>,
    },
    Object {
        #[serde(default)]
        description: String,
        #[serde(default)]
        children: TemplateSchema,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<serde_json::Map<String, Value>>,
    },
}

impl VariableDefinition {
    /// Short kind name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            VariableDefinition::Str { .. } => "str",
            VariableDefinition::Int { .. } => "int",
            VariableDefinition::Bool { .. } => "bool",
            VariableDefinition::List { .. } => "list",
            VariableDefinition::Object { .. } => "object",
        }
    }

    pub fn description(&self) -> &str {
        match self {
            VariableDefinition::Str { description, .. }
            | VariableDefinition::Int { description, .. }
            | VariableDefinition::Bool { description, .. }
            | VariableDefinition::List { description, .. }
            | VariableDefinition::Object { description, .. } => description,
        }
    }

    /// The declared default as a JSON value, if any.
    pub fn default_value(&self) -> Option<Value> {
        match self {
            VariableDefinition::Str { default, .. } => default.clone().map(Value::String),
            VariableDefinition::Int { default, .. } => default.map(Value::from),
            VariableDefinition::Bool { default, .. } => default.map(Value::Bool),
            VariableDefinition::List { default, .. } => default
                .as_ref()
                .map(|items| Value::Array(items.iter().cloned().map(Value::String).collect())),
            VariableDefinition::Object { default, .. } => default.clone().map(Value::Object),
        }
    }

    /// A variable is required iff it has no default.
    pub fn is_required(&self) -> bool {
        self.default_value().is_none()
    }

    /// Check `value` against this definition and return the normalised value.
    ///
    /// Text inputs (from the CLI or `.fvars`) are coerced to the declared kind
    /// when they parse unambiguously. Object values get their children's
    /// defaults filled in.
    pub fn validate(&self, path: &str, value: &Value, errors: &mut Vec<DataError>) -> Option<Value> {
        let mismatch = |errors: &mut Vec<DataError>| {
            errors.push(DataError {
                path: path.to_string(),
                kind: DataErrorKind::Mismatch {
                    expected: self.kind(),
                    found: json_kind(value).to_string(),
                },
            });
            None
        };

        match (self, value) {
            (VariableDefinition::Str { .. }, Value::String(_)) => Some(value.clone()),
            (VariableDefinition::Int { .. }, Value::Number(n)) if n.is_i64() => Some(value.clone()),
            (VariableDefinition::Int { .. }, Value::String(s)) => match s.trim().parse::<i64>() {
                Ok(n) => Some(Value::from(n)),
                Err(_) => mismatch(errors),
            },
            (VariableDefinition::Bool { .. }, Value::Bool(_)) => Some(value.clone()),
            (VariableDefinition::Bool { .. }, Value::String(s)) => match s.trim() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => mismatch(errors),
            },
            (VariableDefinition::List { .. }, Value::Array(items))
                if items.iter().all(Value::is_string) =>
            {
                Some(value.clone())
            }
            (VariableDefinition::List { .. }, Value::String(s)) => {
                match serde_json::from_str::<Vec<String>>(s) {
                    Ok(items) => Some(Value::Array(items.into_iter().map(Value::String).collect())),
                    Err(_) => mismatch(errors),
                }
            }
            (VariableDefinition::Object { children, .. }, Value::Object(map)) => {
                let data: TemplateData = map.clone().into_iter().collect();
                let full = validate_into(children, &data, path, errors);
                Some(Value::Object(full.into_iter().collect()))
            }
            (VariableDefinition::Object { children, .. }, Value::String(s)) => {
                match serde_json::from_str::<serde_json::Map<String, Value>>(s) {
                    Ok(map) => {
                        let data: TemplateData = map.into_iter().collect();
                        let full = validate_into(children, &data, path, errors);
                        Some(Value::Object(full.into_iter().collect()))
                    }
                    Err(_) => mismatch(errors),
                }
            }
            _ => mismatch(errors),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        Value::Number(_) => "float",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// `[A-Za-z][A-Za-z0-9_]*`
pub fn is_valid_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate `data` against `schema` and return the fully defaulted data set.
///
/// Keys present in `data` but not declared in `schema` are carried through
/// unchanged and logged.
pub fn validate(schema: &TemplateSchema, data: &TemplateData) -> Result<TemplateData, TemplateError> {
    let mut errors = Vec::new();
    let full = validate_into(schema, data, "", &mut errors);
    if errors.is_empty() {
        Ok(full)
    } else {
        Err(TemplateError::InvalidTemplateData { errors })
    }
}

fn validate_into(
    schema: &TemplateSchema,
    data: &TemplateData,
    prefix: &str,
    errors: &mut Vec<DataError>,
) -> TemplateData {
    let mut full = TemplateData::new();

    for (name, definition) in schema {
        let path = join_path(prefix, name);
        match data.get(name) {
            Some(value) => {
                if let Some(valid) = definition.validate(&path, value, errors) {
                    full.insert(name.clone(), valid);
                }
            }
            None => match definition.default_value() {
                // Object defaults may omit children that carry their own defaults.
                Some(default) => {
                    if let Some(valid) = definition.validate(&path, &default, errors) {
                        full.insert(name.clone(), valid);
                    }
                }
                None => errors.push(DataError {
                    path,
                    kind: DataErrorKind::Missing,
                }),
            },
        }
    }

    for (name, value) in data {
        if !schema.contains_key(name) {
            tracing::warn!(
                variable = %join_path(prefix, name),
                "template data contains a variable the template does not declare"
            );
            full.insert(name.clone(), value.clone());
        }
    }

    full
}

// ---------------------------------------------------------------------------
// Configuration file
// ---------------------------------------------------------------------------

/// Rendering options from `fengine.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderingConfig {
    /// Glob patterns (relative to `template/`) whose content is copied verbatim.
    #[serde(default)]
    pub excluded_files: Vec<String>,
}

/// Parsed `fengine.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateConfiguration {
    #[serde(default)]
    pub variables: TemplateSchema,
    #[serde(default)]
    pub rendering: RenderingConfig,
}

impl TemplateConfiguration {
    /// Load `<template_root>/fengine.yaml`. A missing file yields the empty configuration.
    pub fn load_at(template_root: &Path) -> Result<Self, TemplateError> {
        let path = config_path(template_root);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no template configuration, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(template_io_err(&path, e)),
        };
        Self::from_yaml_str(&contents, &path)
    }

    /// Parse and check a configuration document. `path` is only used for error context.
    pub fn from_yaml_str(contents: &str, path: &Path) -> Result<Self, TemplateError> {
        // An empty document deserializes to unit, not a mapping.
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(contents).map_err(|source| TemplateError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.check()?;
        Ok(config)
    }

    /// Enforce schema invariants: variable names and self-consistent defaults.
    pub fn check(&self) -> Result<(), TemplateError> {
        let mut errors = Vec::new();
        check_schema(&self.variables, "", &mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TemplateError::InvalidSchema { errors })
        }
    }

    /// Validate user data against this template's variables.
    pub fn validate_data(&self, data: &TemplateData) -> Result<TemplateData, TemplateError> {
        validate(&self.variables, data)
    }
}

fn check_schema(schema: &TemplateSchema, prefix: &str, errors: &mut Vec<String>) {
    for (name, definition) in schema {
        let path = join_path(prefix, name);
        if !is_valid_variable_name(name) {
            errors.push(format!(
                "variable name '{path}' must match [A-Za-z][A-Za-z0-9_]*"
            ));
        }
        if let VariableDefinition::Object {
            children, default, ..
        } = definition
        {
            check_schema(children, &path, errors);
            if let Some(default) = default {
                let mut data_errors = Vec::new();
                let data: TemplateData = default.clone().into_iter().collect();
                validate_into(children, &data, &path, &mut data_errors);
                errors.extend(
                    data_errors
                        .into_iter()
                        .map(|e| format!("default of '{path}' is invalid: {e}")),
                );
            }
        }
    }
}

/// `<template_root>/fengine.yaml`
pub fn config_path(template_root: &Path) -> PathBuf {
    template_root.join(CONFIG_FILENAME)
}

/// `<template_root>/template`
pub fn template_dir(template_root: &Path) -> PathBuf {
    template_root.join(TEMPLATE_DIRNAME)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema(yaml: &str) -> TemplateSchema {
        TemplateConfiguration::from_yaml_str(yaml, Path::new("fengine.yaml"))
            .expect("config")
            .variables
    }

    fn data(value: Value) -> TemplateData {
        serde_json::from_value(value).expect("data")
    }

    #[test]
    fn defaults_fill_absent_variables() {
        let schema = schema(
            r#"
variables:
  name: {type: str, description: "who"}
  age: {type: int, description: "how old", default: 18}
"#,
        );
        let full = validate(&schema, &data(json!({"name": "Jon"}))).expect("valid");
        assert_eq!(full.get("name"), Some(&json!("Jon")));
        assert_eq!(full.get("age"), Some(&json!(18)));
    }

    #[test]
    fn accumulates_every_error() {
        let schema = schema(
            r#"
variables:
  name: {type: str}
  other: {type: str}
  enabled: {type: bool}
"#,
        );
        let err = validate(&schema, &data(json!({"enabled": 3}))).unwrap_err();
        let TemplateError::InvalidTemplateData { errors } = err else {
            panic!("expected InvalidTemplateData");
        };
        assert_eq!(errors.len(), 3, "got: {errors:?}");
        assert!(errors
            .iter()
            .any(|e| e.path == "enabled" && matches!(e.kind, DataErrorKind::Mismatch { .. })));
    }

    #[test]
    fn nested_object_defaults_are_filled_recursively() {
        let schema = schema(
            r#"
variables:
  db:
    type: object
    children:
      host: {type: str, default: localhost}
      port: {type: int, default: 5432}
    default: {}
"#,
        );
        let full = validate(&schema, &TemplateData::new()).expect("valid");
        assert_eq!(full["db"], json!({"host": "localhost", "port": 5432}));

        let partial = validate(&schema, &data(json!({"db": {"port": 6543}}))).expect("valid");
        assert_eq!(partial["db"], json!({"host": "localhost", "port": 6543}));
    }

    #[test]
    fn nested_errors_use_dotted_paths() {
        let schema = schema(
            r#"
variables:
  db:
    type: object
    children:
      port: {type: int}
"#,
        );
        let err = validate(&schema, &data(json!({"db": {"port": "abc"}}))).unwrap_err();
        assert!(err.to_string().contains("'db.port' expected int"), "got: {err}");
    }

    #[test]
    fn text_values_are_coerced_to_declared_kind() {
        let schema = schema(
            r#"
variables:
  replicas: {type: int}
  debug: {type: bool}
  tags: {type: list}
"#,
        );
        let full = validate(
            &schema,
            &data(json!({"replicas": "3", "debug": "true", "tags": "[\"a\", \"b\"]"})),
        )
        .expect("valid");
        assert_eq!(full["replicas"], json!(3));
        assert_eq!(full["debug"], json!(true));
        assert_eq!(full["tags"], json!(["a", "b"]));
    }

    #[test]
    fn extra_keys_are_kept() {
        let schema = schema("variables:\n  name: {type: str}\n");
        let full = validate(&schema, &data(json!({"name": "x", "adhoc": 1}))).expect("valid");
        assert_eq!(full.get("adhoc"), Some(&json!(1)));
    }

    #[test]
    fn invalid_variable_names_are_rejected() {
        let err = TemplateConfiguration::from_yaml_str(
            "variables:\n  1bad: {type: str}\n",
            Path::new("fengine.yaml"),
        )
        .unwrap_err();
        assert!(matches!(err, TemplateError::InvalidSchema { .. }), "got: {err}");
    }

    #[test]
    fn object_default_must_match_children() {
        let err = TemplateConfiguration::from_yaml_str(
            r#"
variables:
  db:
    type: object
    children:
      port: {type: int}
    default: {port: "not-a-number"}
"#,
            Path::new("fengine.yaml"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("default of 'db'"), "got: {err}");
    }

    #[test]
    fn required_iff_no_default() {
        let def = VariableDefinition::Str {
            description: String::new(),
            default: None,
        };
        assert!(def.is_required());
        let def = VariableDefinition::Bool {
            description: String::new(),
            default: Some(false),
        };
        assert!(!def.is_required());
    }

    #[test]
    fn empty_config_file_means_no_variables() {
        let config =
            TemplateConfiguration::from_yaml_str("\n", Path::new("fengine.yaml")).expect("config");
        assert!(config.variables.is_empty());
        assert!(config.rendering.excluded_files.is_empty());
    }
}
