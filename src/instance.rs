//! Instance descriptors and the naming scheme that binds an instance to its
//! pre-built evaluation image.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Descriptor file name expected inside each instance directory.
pub const INSTANCE_JSON: &str = "instance.json";

/// Immutable per-instance input, loaded once from `instance.json`.
///
/// The wire key for the fix patch is `patch`; the instance id is taken from
/// the directory name, so the JSON field is informational only.
#[derive(Debug, Deserialize, Clone)]
pub struct InstanceDescriptor {
    #[serde(default)]
    pub instance_id: String,
    #[serde(default, rename = "patch")]
    pub fix_patch: String,
    #[serde(default)]
    pub test_patch: String,
}

/// Load the descriptor from `<instance_dir>/instance.json`.
pub fn load_descriptor(instance_dir: &Path) -> Result<InstanceDescriptor> {
    let path = instance_dir.join(INSTANCE_JSON);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("read {}", path.display()))?;
    let descriptor = serde_json::from_str(&content)
        .with_context(|| format!("parse {}", path.display()))?;
    Ok(descriptor)
}

/// Derive the image reference for an instance.
///
/// Format: `{namespace}/sweb.eval.{arch}.{lowercase instance_id}:{tag}`.
/// Images are looked up, never built.
pub fn image_name(instance_id: &str, namespace: &str, arch: &str, tag: &str) -> String {
    format!(
        "{namespace}/sweb.eval.{arch}.{}:{tag}",
        instance_id.to_lowercase()
    )
}

/// Derive a container name unique per instance and per run.
///
/// The run timestamp keeps successive runs from colliding on leftover
/// containers; both stages of one instance reuse the name because stage 1's
/// container is removed before stage 2's is created.
pub fn container_name(instance_id: &str, run_epoch_secs: i64) -> String {
    format!("eval_{}_{run_epoch_secs}", instance_id.replace('/', "_"))
}

/// Resolve the instance set for a run.
///
/// An explicit list wins; otherwise every subdirectory of `output_dir` that
/// contains a descriptor qualifies, in sorted order. `max_instances` caps the
/// front of the list either way.
pub fn resolve_instances(
    output_dir: &Path,
    explicit: &[String],
    max_instances: Option<usize>,
) -> Result<Vec<String>> {
    let mut instances = if explicit.is_empty() {
        discover_instances(output_dir)?
    } else {
        explicit.to_vec()
    };
    if let Some(max) = max_instances {
        instances.truncate(max);
    }
    Ok(instances)
}

fn discover_instances(output_dir: &Path) -> Result<Vec<String>> {
    let mut instances = Vec::new();
    let entries = std::fs::read_dir(output_dir)
        .with_context(|| format!("read {}", output_dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let path: PathBuf = entry.path();
        if path.is_dir() && path.join(INSTANCE_JSON).exists() {
            if let Some(name) = path.file_name() {
                instances.push(name.to_string_lossy().to_string());
            }
        }
    }
    instances.sort();
    Ok(instances)
}
