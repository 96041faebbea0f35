use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::device::DeviceClass;

pub const KERNEL_PATH_ENV: &str = "GC_KERNEL_PATH";
pub const RUN_FUSER_ENV: &str = "GLUE_RUN_FUSER";
pub const FUSER_LIB_ENV: &str = "GLUE_FUSER_LIB";
pub const COMPLEX_LIB_ENV: &str = "GLUE_COMPLEX_LIB";
pub const COMPLEX_GUID_EXTRACTOR_ENV: &str = "GLUE_COMPLEX_GUID_EXTRACTOR";
pub const ALLOW_DUPLICATE_KERNELS_ENV: &str = "GLUE_ALLOW_DUPLICATE_KERNELS";
pub const DETERMINISTIC_MODE_ENV: &str = "GLUE_DETERMINISTIC_MODE";
pub const MAX_AVAILABLE_TPC_ENV: &str = "GLUE_MAX_AVAILABLE_TPC";

pub const DEFAULT_FUSER_LIB: &str = "libTPCFuser.so";
/// Upper bound on first-party search paths; a plug-in's position is its precedence index.
pub const MAX_KERNEL_LIBRARIES: usize = 16;

/// Whether kernels are asked for deterministic code.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeterministicMode {
    #[default]
    Off,
    On,
    /// Each node decides through its instantiation request.
    PerNode,
}

impl DeterministicMode {
    pub fn resolve(self, node_requested: bool) -> bool {
        match self {
            DeterministicMode::Off => false,
            DeterministicMode::On => true,
            DeterministicMode::PerNode => node_requested,
        }
    }

    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "node" | "per_node" | "per-node" => DeterministicMode::PerNode,
            other if parse_bool(other) => DeterministicMode::On,
            _ => DeterministicMode::Off,
        }
    }
}

/// Knobs controlling plug-in discovery and instantiation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlueConfig {
    /// First-party plug-in paths in precedence order. `None` when `GC_KERNEL_PATH` is unset.
    pub kernel_paths: Option<Vec<PathBuf>>,
    pub run_fuser: bool,
    /// Overrides the per-device fuser library name.
    pub fuser_lib: Option<PathBuf>,
    pub complex_lib: Option<PathBuf>,
    pub complex_guid_extractor: bool,
    pub allow_duplicate_kernels: bool,
    pub deterministic: DeterministicMode,
    pub max_available_tpc: Option<u32>,
}

impl GlueConfig {
    pub fn from_env() -> Self {
        Self {
            kernel_paths: env::var(KERNEL_PATH_ENV)
                .ok()
                .map(|value| split_kernel_paths(&value)),
            run_fuser: env_flag(RUN_FUSER_ENV),
            fuser_lib: env_path(FUSER_LIB_ENV),
            complex_lib: env_path(COMPLEX_LIB_ENV),
            complex_guid_extractor: env_flag(COMPLEX_GUID_EXTRACTOR_ENV),
            allow_duplicate_kernels: env_flag(ALLOW_DUPLICATE_KERNELS_ENV),
            deterministic: env::var(DETERMINISTIC_MODE_ENV)
                .map(|value| DeterministicMode::parse(&value))
                .unwrap_or_default(),
            max_available_tpc: env::var(MAX_AVAILABLE_TPC_ENV)
                .ok()
                .and_then(|value| value.trim().parse().ok()),
        }
    }

    pub fn fuser_lib_for(&self, device: DeviceClass) -> PathBuf {
        self.fuser_lib
            .clone()
            .unwrap_or_else(|| default_fuser_lib(device))
    }

    pub fn max_available_tpc_for(&self, device: DeviceClass) -> u32 {
        self.max_available_tpc
            .unwrap_or_else(|| device.default_max_available_tpc())
    }

    pub fn complex_enabled(&self) -> bool {
        self.complex_guid_extractor && self.complex_lib.is_some()
    }
}

pub fn default_fuser_lib(_device: DeviceClass) -> PathBuf {
    PathBuf::from(DEFAULT_FUSER_LIB)
}

/// Splits a colon-separated search path, dropping empty segments.
pub fn split_kernel_paths(value: &str) -> Vec<PathBuf> {
    value
        .split(':')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(PathBuf::from)
        .collect()
}

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn env_flag(name: &str) -> bool {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    env::var_os(name)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_paths_skip_empty_segments() {
        let paths = split_kernel_paths("/opt/a/libtpc.so::/opt/b/libtpc.so:");
        assert_eq!(
            paths,
            [
                PathBuf::from("/opt/a/libtpc.so"),
                PathBuf::from("/opt/b/libtpc.so")
            ]
        );
    }

    #[test]
    fn deterministic_mode_accepts_flags_and_per_node() {
        assert_eq!(DeterministicMode::parse("yes"), DeterministicMode::On);
        assert_eq!(DeterministicMode::parse("node"), DeterministicMode::PerNode);
        assert_eq!(DeterministicMode::parse("0"), DeterministicMode::Off);
        assert!(DeterministicMode::PerNode.resolve(true));
        assert!(!DeterministicMode::PerNode.resolve(false));
    }

    #[test]
    fn json_config_fills_missing_fields_with_defaults() {
        let config: GlueConfig = serde_json::from_str(r#"{"run_fuser": true}"#)
            .unwrap_or_else(|err| panic!("unexpected error: {err}"));
        assert!(config.run_fuser);
        assert_eq!(config.kernel_paths, None);
        assert_eq!(
            config.fuser_lib_for(DeviceClass::Gaudi2),
            PathBuf::from(DEFAULT_FUSER_LIB)
        );
        assert_eq!(config.max_available_tpc_for(DeviceClass::Gaudi3), 64);
    }
}
