//! Pipeline configuration stored under `.tkt/pipeline.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::pipeline::PipelineSpec;

/// Load and validate the pipeline from a TOML file.
///
/// A missing file is an error: a project without a pipeline is not provisioned.
pub fn load_pipeline(path: &Path) -> Result<PipelineSpec> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read pipeline {} (run `tkt init`)", path.display()))?;
    let spec: PipelineSpec =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    spec.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    debug!(
        workflows = spec.workflows.len(),
        agent = %spec.agent,
        "loaded pipeline"
    );
    Ok(spec)
}
