//! Template context — the rendering payload built from [`TemplateData`].

use foxops_core::TemplateData;

use crate::error::RenderError;

/// Convert template data into a [`tera::Context`].
///
/// Every top-level variable becomes a top-level name in templates, so
/// `{{ name }}` and `{{ db.port }}` both resolve directly.
pub fn to_tera_context(data: &TemplateData) -> Result<tera::Context, RenderError> {
    tera::Context::from_serialize(data).map_err(RenderError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_values_are_addressable() {
        let data: TemplateData =
            serde_json::from_value(json!({"name": "Jon", "db": {"port": 5432}})).unwrap();
        let ctx = to_tera_context(&data).expect("context");
        assert_eq!(ctx.get("name"), Some(&json!("Jon")));
        assert_eq!(ctx.get("db"), Some(&json!({"port": 5432})));
    }

    #[test]
    fn empty_data_builds_empty_context() {
        let ctx = to_tera_context(&TemplateData::new()).expect("context");
        assert!(ctx.get("anything").is_none());
    }
}
