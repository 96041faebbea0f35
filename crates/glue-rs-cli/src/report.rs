use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use glue_rs::{
    CapabilityRegistry, DeviceClass, GlueConfig, ShapeFunctionRegistry, ShapePlanArtifact,
};

/// Reads a JSON configuration file, falling back to the environment when no file is given.
pub fn load_config(path: Option<&Path>) -> Result<GlueConfig> {
    let Some(path) = path else {
        return Ok(GlueConfig::from_env());
    };
    let blob = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&blob).with_context(|| format!("invalid config {}", path.display()))
}

pub fn parse_device(value: &str) -> Result<DeviceClass, String> {
    DeviceClass::parse(value).ok_or_else(|| {
        let known: Vec<_> = DeviceClass::ALL.iter().map(|device| device.as_str()).collect();
        format!("unknown device '{value}', expected one of {}", known.join(", "))
    })
}

/// Loads a shape plan, as JSON when the file ends in `.json` and as bincode otherwise.
pub fn load_plan(path: &Path) -> Result<ShapePlanArtifact> {
    let is_json = path
        .extension()
        .is_some_and(|extension| extension.eq_ignore_ascii_case("json"));
    let artifact = if is_json {
        let blob = fs::read_to_string(path)
            .with_context(|| format!("failed to read plan {}", path.display()))?;
        ShapePlanArtifact::from_json_str(&blob)
    } else {
        ShapePlanArtifact::load_bincode(path)
    };
    artifact.with_context(|| format!("failed to load plan {}", path.display()))
}

pub fn identifier_rows(registry: &CapabilityRegistry, device: DeviceClass) -> Vec<String> {
    registry
        .identifiers(device)
        .into_iter()
        .map(|record| {
            let shape = record
                .shape_function_key()
                .filter(|_| record.is_dynamic_shape())
                .map_or_else(|| "static".to_string(), |key| key.to_string());
            format!(
                "{name}\t{shape}\tv{version}\t{library}",
                name = record.name(),
                version = record.library_version,
                library = record.library().name(),
            )
        })
        .collect()
}

pub fn shape_function_rows(shape_functions: &ShapeFunctionRegistry) -> Vec<String> {
    shape_functions
        .keys()
        .into_iter()
        .filter_map(|key| {
            let record = shape_functions.record(key)?;
            Some(format!("{key}\t{}\tv{}", record.name, record.version))
        })
        .collect()
}

pub fn version_rows(registry: &CapabilityRegistry) -> Vec<String> {
    registry
        .library_versions()
        .iter()
        .map(|(library, version)| format!("{library}\tv{version}"))
        .collect()
}
