//! Template data helpers: merging, `KEY=VALUE` assignments and `.fvars` files.

use serde_json::Value;

use crate::error::TemplateError;
use crate::types::TemplateData;

/// Name of the optional side-input file inside an incarnation directory.
pub const FVARS_FILENAME: &str = ".fvars";

/// Merge `update` over `base`.
///
/// Per key the update wins, except when both sides hold a mapping: then the
/// mappings are merged key by key instead of replaced wholesale.
pub fn merge_data(base: &TemplateData, update: &TemplateData) -> TemplateData {
    let mut merged = base.clone();
    for (key, value) in update {
        match (merged.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                for (child_key, child_value) in incoming {
                    existing.insert(child_key.clone(), child_value.clone());
                }
            }
            _ => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

/// Parse a single `KEY=VALUE` assignment. The value is kept as text.
pub fn parse_assignment(raw: &str) -> Result<(String, Value), TemplateError> {
    let Some((key, value)) = raw.split_once('=') else {
        return Err(TemplateError::InvalidAssignment(raw.to_string()));
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(TemplateError::InvalidAssignment(raw.to_string()));
    }
    Ok((key.to_string(), Value::String(value.to_string())))
}

/// Parse many assignments into a data set; later assignments win.
pub fn parse_assignments<I, S>(raw: I) -> Result<TemplateData, TemplateError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut data = TemplateData::new();
    for item in raw {
        let (key, value) = parse_assignment(item.as_ref())?;
        data.insert(key, value);
    }
    Ok(data)
}

/// Parse the contents of a `.fvars` file.
///
/// One `KEY=VALUE` per line; blank lines and `#` comments are skipped.
pub fn parse_fvars(contents: &str) -> Result<TemplateData, TemplateError> {
    parse_assignments(
        contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#')),
    )
}

/// Layer explicit data over fvars: explicitly supplied values always win.
pub fn with_fvars(fvars: &TemplateData, explicit: &TemplateData) -> TemplateData {
    let mut data = fvars.clone();
    data.extend(explicit.iter().map(|(k, v)| (k.clone(), v.clone())));
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: Value) -> TemplateData {
        serde_json::from_value(value).expect("data")
    }

    #[test]
    fn merge_replaces_scalars_and_merges_mappings() {
        let base = data(json!({"name": "Jon", "db": {"host": "a", "port": 1}}));
        let update = data(json!({"name": "Ygritte", "db": {"port": 2}}));
        let merged = merge_data(&base, &update);
        assert_eq!(merged["name"], json!("Ygritte"));
        assert_eq!(merged["db"], json!({"host": "a", "port": 2}));
    }

    #[test]
    fn merge_with_empty_update_is_identity() {
        let base = data(json!({"name": "Jon", "age": 18}));
        assert_eq!(merge_data(&base, &TemplateData::new()), base);
    }

    #[test]
    fn assignment_splits_on_first_equals() {
        let (key, value) = parse_assignment("url=http://x?a=b").expect("parse");
        assert_eq!(key, "url");
        assert_eq!(value, json!("http://x?a=b"));
    }

    #[test]
    fn assignment_without_equals_is_rejected() {
        assert!(matches!(
            parse_assignment("novalue"),
            Err(TemplateError::InvalidAssignment(_))
        ));
        assert!(parse_assignment("=value").is_err());
    }

    #[test]
    fn fvars_skip_comments_and_blanks() {
        let parsed = parse_fvars("# team defaults\n\nowner=platform\n  region = eu \n").expect("fvars");
        assert_eq!(parsed["owner"], json!("platform"));
        assert_eq!(parsed["region"], json!(" eu"));
    }

    #[test]
    fn explicit_data_wins_over_fvars() {
        let fvars = data(json!({"owner": "platform", "region": "eu"}));
        let explicit = data(json!({"owner": "payments"}));
        let layered = with_fvars(&fvars, &explicit);
        assert_eq!(layered["owner"], json!("payments"));
        assert_eq!(layered["region"], json!("eu"));
    }
}
