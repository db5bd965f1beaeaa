pub mod diff;
pub mod initialize;
pub mod update;

use std::path::Path;

use anyhow::{Context, Result};

use foxops_core::{data::parse_assignments, TemplateData};

/// `KEY=VALUE` flags as template data.
pub(crate) fn parse_data_flags(raw: &[String]) -> Result<TemplateData> {
    parse_assignments(raw).context("invalid --data value")
}

/// Local template paths become absolute so the recorded location stays valid
/// from any working directory; anything else is taken as a git URL.
pub(crate) fn resolve_template_repository(raw: &str) -> Result<String> {
    let path = Path::new(raw);
    if !path.exists() {
        return Ok(raw.to_string());
    }
    let absolute = path
        .canonicalize()
        .with_context(|| format!("cannot resolve template path '{raw}'"))?;
    Ok(absolute.to_string_lossy().into_owned())
}
