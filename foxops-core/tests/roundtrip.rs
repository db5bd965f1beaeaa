//! Roundtrip serialisation tests for the incarnation state sidecar.
//!
//! Each `#[case]` is isolated — no shared state.

use std::path::Path;

use foxops_core::{IncarnationState, TemplateConfiguration, TemplateData, VariableDefinition};
use rstest::rstest;
use serde_json::json;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn data(value: serde_json::Value) -> TemplateData {
    serde_json::from_value(value).expect("template data")
}

fn minimal_state() -> IncarnationState {
    IncarnationState {
        template_repository: "template".into(),
        template_repository_version: "main".into(),
        template_repository_version_hash: "1111111".into(),
        template_data: TemplateData::new(),
        template_data_full: TemplateData::new(),
    }
}

fn defaulted_state() -> IncarnationState {
    IncarnationState {
        template_repository: "https://git.example.com/templates/service.git".into(),
        template_repository_version: "v1.2.0".into(),
        template_repository_version_hash: "2f4c1a0d9e".into(),
        template_data: data(json!({"name": "Jon"})),
        template_data_full: data(json!({"name": "Jon", "age": 18, "tags": ["a", "b"]})),
    }
}

fn nested_state() -> IncarnationState {
    IncarnationState {
        template_repository: "/srv/templates/db".into(),
        template_repository_version: "feature/x".into(),
        template_repository_version_hash: "abcdef0123".into(),
        template_data: data(json!({"db": {"port": 6543}})),
        template_data_full: data(json!({"db": {"host": "localhost", "port": 6543}, "debug": false})),
    }
}

fn unicode_state() -> IncarnationState {
    IncarnationState {
        template_repository: "templates/アプリ".into(),
        template_repository_version: "v1".into(),
        template_repository_version_hash: "ffff".into(),
        template_data: data(json!({"title": "日本語・한국어・العربية", "quote": "<>&\"'"})),
        template_data_full: data(json!({"title": "日本語・한국어・العربية", "quote": "<>&\"'"})),
    }
}

// ---------------------------------------------------------------------------
// Parameterised roundtrip test
// ---------------------------------------------------------------------------

#[rstest]
#[case("minimal", minimal_state())]
#[case("defaulted", defaulted_state())]
#[case("nested_objects", nested_state())]
#[case("unicode_strings", unicode_state())]
fn state_roundtrip(#[case] label: &str, #[case] state: IncarnationState) {
    let yaml = state
        .to_yaml_string()
        .unwrap_or_else(|e| panic!("[{label}] serialize failed: {e}"));
    let back = IncarnationState::from_yaml_str(&yaml, Path::new(".fengine.yaml"))
        .unwrap_or_else(|e| panic!("[{label}] deserialize failed: {e}"));
    assert_eq!(state, back, "[{label}] roundtrip");
}

#[test]
fn legacy_document_without_full_data_copies_template_data() {
    let legacy = r#"
template_repository: https://git.example.com/t.git
template_repository_version: v1.0.0
template_repository_version_hash: 0123abc
template_data:
  name: Jon
  age: 18
"#;
    let state = IncarnationState::from_yaml_str(legacy, Path::new(".fengine.yaml")).expect("parse");
    assert_eq!(state.template_data_full, state.template_data);
    assert_eq!(state.template_data["age"], json!(18));
}

// ---------------------------------------------------------------------------
// Template configuration roundtrip (all variable kinds)
// ---------------------------------------------------------------------------

#[rstest]
#[case("str", "{type: str, description: d, default: x}")]
#[case("int", "{type: int, description: d, default: 3}")]
#[case("bool", "{type: bool, description: d, default: true}")]
#[case("list", "{type: list, description: d, element_type: str, default: [a]}")]
#[case(
    "object",
    "{type: object, description: d, children: {port: {type: int, default: 1}}, default: {}}"
)]
fn variable_kind_roundtrip(#[case] kind: &str, #[case] definition: &str) {
    let yaml = format!("variables:\n  v: {definition}\n");
    let config = TemplateConfiguration::from_yaml_str(&yaml, Path::new("fengine.yaml"))
        .unwrap_or_else(|e| panic!("[{kind}] parse failed: {e}"));
    let def: &VariableDefinition = &config.variables["v"];
    assert_eq!(def.kind(), kind);
    assert_eq!(def.description(), "d");

    let out = serde_yaml::to_string(&config).expect("serialize");
    let back = TemplateConfiguration::from_yaml_str(&out, Path::new("fengine.yaml"))
        .unwrap_or_else(|e| panic!("[{kind}] reparse failed: {e}"));
    assert_eq!(config, back, "[{kind}] roundtrip");
}
