use std::env;
use std::path::PathBuf;

use glue_rs::config::{
    ALLOW_DUPLICATE_KERNELS_ENV, COMPLEX_GUID_EXTRACTOR_ENV, COMPLEX_LIB_ENV,
    DETERMINISTIC_MODE_ENV, FUSER_LIB_ENV, KERNEL_PATH_ENV, MAX_AVAILABLE_TPC_ENV, RUN_FUSER_ENV,
};
use glue_rs::{CapabilityRegistry, DeterministicMode, DeviceClass, GlueConfig, GlueError};
use serial_test::serial;

const ALL_VARS: [&str; 8] = [
    KERNEL_PATH_ENV,
    RUN_FUSER_ENV,
    FUSER_LIB_ENV,
    COMPLEX_LIB_ENV,
    COMPLEX_GUID_EXTRACTOR_ENV,
    ALLOW_DUPLICATE_KERNELS_ENV,
    DETERMINISTIC_MODE_ENV,
    MAX_AVAILABLE_TPC_ENV,
];

/// Restores the glue variables when dropped.
struct EnvGuard {
    saved: Vec<(&'static str, Option<String>)>,
}

impl EnvGuard {
    fn clean() -> Self {
        let saved = ALL_VARS
            .iter()
            .map(|name| (*name, env::var(name).ok()))
            .collect();
        for name in ALL_VARS {
            env::remove_var(name);
        }
        Self { saved }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (name, value) in &self.saved {
            match value {
                Some(value) => env::set_var(name, value),
                None => env::remove_var(name),
            }
        }
    }
}

#[test]
#[serial]
fn unset_environment_gives_the_defaults() {
    let _guard = EnvGuard::clean();
    assert_eq!(GlueConfig::from_env(), GlueConfig::default());

    let mut registry = CapabilityRegistry::from_env();
    registry
        .init(DeviceClass::Gaudi2)
        .unwrap_or_else(|err| panic!("unexpected error: {err}"));
    assert!(registry.is_initialized(DeviceClass::Gaudi2));
    assert!(registry.identifiers(DeviceClass::Gaudi2).is_empty());
    assert!(registry.load_failures().is_empty());
}

#[test]
#[serial]
fn environment_overrides_every_knob() {
    let _guard = EnvGuard::clean();
    env::set_var(KERNEL_PATH_ENV, "/opt/glue/libtpc.so::/opt/glue/libextra.so");
    env::set_var(RUN_FUSER_ENV, "true");
    env::set_var(FUSER_LIB_ENV, "/opt/glue/libfuser.so");
    env::set_var(COMPLEX_LIB_ENV, "/opt/glue/libcomplex.so");
    env::set_var(COMPLEX_GUID_EXTRACTOR_ENV, "1");
    env::set_var(ALLOW_DUPLICATE_KERNELS_ENV, "off");
    env::set_var(DETERMINISTIC_MODE_ENV, "node");
    env::set_var(MAX_AVAILABLE_TPC_ENV, " 12 ");

    let config = GlueConfig::from_env();
    assert_eq!(
        config.kernel_paths,
        Some(vec![
            PathBuf::from("/opt/glue/libtpc.so"),
            PathBuf::from("/opt/glue/libextra.so"),
        ])
    );
    assert!(config.run_fuser);
    assert_eq!(
        config.fuser_lib_for(DeviceClass::Gaudi3),
        PathBuf::from("/opt/glue/libfuser.so")
    );
    assert!(config.complex_enabled());
    assert!(!config.allow_duplicate_kernels);
    assert_eq!(config.deterministic, DeterministicMode::PerNode);
    assert_eq!(config.max_available_tpc_for(DeviceClass::Gaudi), 12);
}

#[test]
#[serial]
fn unloadable_search_path_entries_are_recorded_and_skipped() {
    let _guard = EnvGuard::clean();
    let dir = tempfile::tempdir().expect("create temp dir");
    let missing = dir.path().join("libmissing_glue.so");
    let not_a_library = dir.path().join("libgarbage_glue.so");
    std::fs::write(&not_a_library, b"not an ELF").expect("write placeholder");
    env::set_var(
        KERNEL_PATH_ENV,
        format!("{}:{}", missing.display(), not_a_library.display()),
    );

    let mut registry = CapabilityRegistry::from_env();
    registry
        .init(DeviceClass::Gaudi2)
        .unwrap_or_else(|err| panic!("unexpected error: {err}"));
    assert!(registry.identifiers(DeviceClass::Gaudi2).is_empty());
    assert_eq!(registry.load_failures().len(), 2);
    assert!(registry
        .load_failures()
        .iter()
        .all(|err| matches!(err, GlueError::PluginLoadFailure { .. })));

    registry
        .init(DeviceClass::Gaudi2)
        .unwrap_or_else(|err| panic!("unexpected error: {err}"));
    assert_eq!(registry.load_failures().len(), 2, "second init is a no-op");
}
