//! Per-device database of what the loaded glue-code libraries can do.
//!
//! The registry is populated once through `&mut self` (`init`, the `load_*` methods) and then
//! queried through `&self`, so it can be shared behind an `Arc` after start-up. Loading problems
//! with a single library are logged, recorded in [`CapabilityRegistry::load_failures`] and
//! skipped; only a conflicting duplicate declaration aborts initialisation.

mod complex;
mod record;

pub use complex::ComplexCapabilityIndex;
pub use record::CapabilityRecord;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::abi::{
    GlueCodeReturn, HabanaKernelInstantiation, HabanaKernelParams, NodeDataLayouts, RawDeviceId,
    TensorManipulationSuggestion,
};
use crate::config::{default_fuser_lib, GlueConfig, MAX_KERNEL_LIBRARIES};
use crate::device::{DeviceClass, Feature, FeatureSupport};
use crate::error::{GlueError, GlueResult};
use crate::identifier::{is_fused_name, OperationIdentifier, FUSED_KERNEL_MARKER};
use crate::loader::PluginLibrary;
use crate::shape::builtin::{CORE_SHAPE_FUNCTION_VERSION, SPLIT_FUSED_SIF};
use crate::shape::io::call_plugin_shape_inference;
use crate::shape::{
    PluginShapeInference, ShapeFunction, ShapeFunctionRecord, ShapeFunctionRegistry, ShapeOrigin,
    SifOutputs, SifParams,
};

#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    config: GlueConfig,
    kernels: [HashMap<String, CapabilityRecord>; DeviceClass::COUNT],
    fuser: [Option<CapabilityRecord>; DeviceClass::COUNT],
    complex: ComplexCapabilityIndex,
    initialized: [bool; DeviceClass::COUNT],
    libraries: HashMap<PathBuf, Arc<PluginLibrary>>,
    library_versions: BTreeMap<String, u64>,
    load_failures: Vec<GlueError>,
    features: FeatureSupport,
}

impl CapabilityRegistry {
    pub fn new(config: GlueConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        Self::new(GlueConfig::from_env())
    }

    pub fn config(&self) -> &GlueConfig {
        &self.config
    }

    pub fn is_initialized(&self, device: DeviceClass) -> bool {
        self.initialized[device.index()]
    }

    /// Loads every configured plug-in for `device`. A second call for the same device does
    /// nothing.
    pub fn init(&mut self, device: DeviceClass) -> GlueResult<()> {
        self.init_device(device, false)
    }

    /// Initialises every device except Greco, using each device's default fuser library.
    pub fn init_all(&mut self) -> GlueResult<()> {
        for device in DeviceClass::ALL {
            if device == DeviceClass::Greco {
                continue;
            }
            self.init_device(device, true)?;
        }
        Ok(())
    }

    /// ABI entry: [`DeviceClass::RAW_MAX`] means every device.
    pub fn init_raw(&mut self, raw: RawDeviceId) -> GlueResult<()> {
        if raw == DeviceClass::RAW_MAX {
            return self.init_all();
        }
        let device = DeviceClass::from_raw(raw)
            .ok_or_else(|| GlueError::contract(format!("device id {raw} is out of range")))?;
        self.init(device)
    }

    fn init_device(&mut self, device: DeviceClass, use_default_fuser: bool) -> GlueResult<()> {
        if self.initialized[device.index()] {
            return Ok(());
        }
        self.initialized[device.index()] = true;

        self.load_kernel_path(device)?;

        if self.config.run_fuser {
            let path = if use_default_fuser {
                default_fuser_lib(device)
            } else {
                self.config.fuser_lib_for(device)
            };
            if let Some(library) = self.open_or_record(&path) {
                self.load_fuser_library(device, library);
            }
        }

        if self.config.complex_guid_extractor {
            match self.config.complex_lib.clone() {
                Some(path) => {
                    if let Some(library) = self.open_or_record(&path) {
                        self.load_complex_library(device, library);
                    }
                }
                None => tracing::error!(%device, "complex extractor enabled without a library"),
            }
        }

        self.features.derive_for(device);
        Ok(())
    }

    fn load_kernel_path(&mut self, device: DeviceClass) -> GlueResult<()> {
        let Some(paths) = self.config.kernel_paths.clone() else {
            tracing::error!(
                %device,
                variable = crate::config::KERNEL_PATH_ENV,
                "kernel search path is undefined"
            );
            return Ok(());
        };

        for (index, path) in paths.iter().enumerate() {
            if index >= MAX_KERNEL_LIBRARIES {
                let err = GlueError::load_failure(
                    path,
                    format!("at most {MAX_KERNEL_LIBRARIES} kernel libraries are supported"),
                );
                tracing::error!(%device, path = %path.display(), "{err}");
                self.load_failures.push(err);
                continue;
            }
            tracing::info!(%device, path = %path.display(), "loading kernels");
            if let Some(library) = self.open_or_record(path) {
                self.load_kernel_library(device, library, Some(index as u8))?;
            }
        }

        if self.kernels[device.index()].is_empty() {
            tracing::warn!(%device, "no kernels registered");
        }
        Ok(())
    }

    fn open_or_record(&mut self, path: &Path) -> Option<Arc<PluginLibrary>> {
        if let Some(library) = self.libraries.get(path) {
            return Some(Arc::clone(library));
        }
        match PluginLibrary::open(path) {
            Ok(library) => {
                let library = Arc::new(library);
                self.libraries
                    .insert(path.to_path_buf(), Arc::clone(&library));
                Some(library)
            }
            Err(err) => {
                tracing::error!(path = %path.display(), error = %err, "could not open plug-in");
                self.load_failures.push(err);
                None
            }
        }
    }

    fn library_version_or_warn(library: &PluginLibrary) -> u64 {
        library.library_version().unwrap_or_else(|| {
            tracing::warn!(library = library.name(), "plug-in exports no version, using 0");
            0
        })
    }

    fn record_failure(&mut self, library: &PluginLibrary, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(library = library.name(), %reason, "plug-in rejected");
        self.load_failures.push(GlueError::load_failure(library.name(), reason));
    }

    /// Registers every identifier `library` enumerates for `device`. The first library to
    /// register an identifier keeps it. A soft failure (missing entry point, failed enumeration)
    /// is recorded and returns `Ok(())`; a conflicting duplicate returns
    /// [`GlueError::DuplicateRegistration`] and registers nothing from this library.
    pub fn load_kernel_library(
        &mut self,
        device: DeviceClass,
        library: Arc<PluginLibrary>,
        precedence: Option<u8>,
    ) -> GlueResult<()> {
        let version = Self::library_version_or_warn(&library);

        let entries = library.entry_points();
        let required = [
            ("GetShapeInference", entries.shape_inference.is_some()),
            ("InstantiateTpcKernel", entries.instantiate.is_some()),
            ("GetKernelGuids", entries.kernel_guids.is_some()),
        ];
        if let Some((entry_point, _)) = required.iter().find(|(_, present)| !*present) {
            self.record_failure(&library, format!("missing entry point {entry_point}"));
            return Ok(());
        }
        for (entry_point, present) in [
            ("GetSupportedDataLayouts", entries.supported_layouts.is_some()),
            (
                "GetSuggestedTensorManipulation",
                entries.suggested_manipulation.is_some(),
            ),
        ] {
            if !present {
                tracing::warn!(
                    library = library.name(),
                    entry_point,
                    "optional entry point missing"
                );
            }
        }

        let guids = match library.kernel_guids(device) {
            Ok(guids) => guids.unwrap_or_default(),
            Err(err) => {
                tracing::error!(
                    library = library.name(),
                    %device,
                    error = %err,
                    "enumeration failed"
                );
                self.load_failures.push(err);
                return Ok(());
            }
        };

        let table = &self.kernels[device.index()];
        let mut fresh = Vec::with_capacity(guids.len());
        for info in &guids {
            let identifier = OperationIdentifier::from_guid_info(info)
                .with_origin(ShapeOrigin::FirstPartyPlugin);
            match table.get(identifier.name()) {
                Some(existing) => {
                    let allowed = self.config.allow_duplicate_kernels || identifier.is_fused();
                    if allowed && existing.is_dynamic_shape() {
                        return Err(GlueError::DuplicateRegistration {
                            identifier: identifier.name().to_string(),
                        });
                    }
                    tracing::debug!(
                        %device,
                        identifier = identifier.name(),
                        library = library.name(),
                        "identifier already registered, keeping the first"
                    );
                }
                None => fresh.push(identifier),
            }
        }

        let table = &mut self.kernels[device.index()];
        for identifier in fresh {
            tracing::trace!(%device, identifier = identifier.name(), "registering kernel");
            let name = identifier.name().to_string();
            table.entry(name).or_insert_with(|| {
                CapabilityRecord::from_library(&library, identifier, version, precedence)
            });
        }
        self.library_versions
            .insert(library.name().to_string(), version);
        Ok(())
    }

    /// The fuser exposes one capability shared by every fused identifier; its shapes come from
    /// the compiled-in split-fused routine.
    pub fn load_fuser_library(&mut self, device: DeviceClass, library: Arc<PluginLibrary>) {
        let version = Self::library_version_or_warn(&library);
        let entries = library.entry_points();
        if entries.instantiate.is_none() || entries.kernel_guids.is_none() {
            self.record_failure(
                &library,
                "fuser library lacks InstantiateTpcKernel or GetKernelGuids",
            );
            return;
        }

        let identifier = OperationIdentifier::new(FUSED_KERNEL_MARKER)
            .with_hash(SPLIT_FUSED_SIF)
            .with_origin(ShapeOrigin::CoreInference)
            .with_dynamic_shapes(true);
        let mut record = CapabilityRecord::from_library(
            &library,
            identifier,
            CORE_SHAPE_FUNCTION_VERSION,
            None,
        );
        record.shape_inference = None;
        self.fuser[device.index()] = Some(record);
        self.library_versions
            .insert(library.name().to_string(), version);
    }

    pub fn load_complex_library(&mut self, device: DeviceClass, library: Arc<PluginLibrary>) {
        let Some(version) = library.library_version() else {
            self.record_failure(&library, "complex library exports no GetLibVersion");
            return;
        };
        match self.complex.load(&library, device, version) {
            Ok(()) => {
                self.library_versions
                    .insert(library.name().to_string(), version);
            }
            Err(err) => {
                tracing::error!(
                    library = library.name(),
                    %device,
                    error = %err,
                    "complex library rejected"
                );
                self.load_failures.push(err);
            }
        }
    }

    /// Primary record for `name`, falling back to the fuser record for fused identifiers.
    pub fn lookup(&self, name: &str, device: DeviceClass) -> GlueResult<&CapabilityRecord> {
        self.kernels[device.index()]
            .get(name)
            .or_else(|| {
                is_fused_name(name)
                    .then(|| self.fuser[device.index()].as_ref())
                    .flatten()
            })
            .ok_or_else(|| GlueError::NotFound {
                identifier: name.to_string(),
                device,
            })
    }

    fn dynamic_record(&self, name: &str, device: DeviceClass) -> Option<&CapabilityRecord> {
        self.lookup(name, device)
            .ok()
            .filter(|record| record.is_dynamic_shape())
    }

    pub fn complex(&self) -> &ComplexCapabilityIndex {
        &self.complex
    }

    /// Runs the matched plug-in's instantiate entry point.
    ///
    /// # Safety
    ///
    /// Every pointer inside `params` and `instance` must be valid for the plug-in to read and
    /// write as the calling convention describes (tensor arrays of the declared counts, auxiliary
    /// and instruction buffers of the declared sizes).
    pub unsafe fn instantiate(
        &self,
        params: &HabanaKernelParams,
        device: DeviceClass,
        name: &str,
        instance: &mut HabanaKernelInstantiation,
    ) -> GlueResult<()> {
        let record = self.lookup(name, device)?;
        let Some(instantiate) = record.instantiate else {
            return Err(GlueError::NotFound {
                identifier: name.to_string(),
                device,
            });
        };
        let code = instantiate(params, instance);
        if !code.is_success() {
            tracing::debug!(%device, identifier = name, %code, "instantiate returned");
        }
        GlueError::from_code(code, name, device)
    }

    /// # Safety
    ///
    /// `params` must satisfy the same contract as for [`Self::instantiate`]; `layouts` must be
    /// null (size query) or point to `*layout_count` writable entries.
    pub unsafe fn supported_layouts(
        &self,
        params: &HabanaKernelParams,
        device: DeviceClass,
        name: &str,
        layouts: *mut NodeDataLayouts,
        layout_count: &mut u32,
    ) -> GlueResult<()> {
        let record = self
            .complex
            .record(name, device)
            .or_else(|| self.lookup(name, device).ok());
        let Some(get_layouts) = record.and_then(|record| record.supported_layouts) else {
            tracing::warn!(%device, identifier = name, "no supported-layouts entry point");
            return Err(unsupported(name));
        };
        let code = get_layouts(params, layouts, layout_count);
        if !code.is_success() {
            tracing::warn!(%device, identifier = name, %code, "supported layouts returned");
        }
        GlueError::from_code(code, name, device)
    }

    /// # Safety
    ///
    /// `params` must satisfy the same contract as for [`Self::instantiate`].
    pub unsafe fn suggested_manipulation(
        &self,
        params: &HabanaKernelParams,
        device: DeviceClass,
        name: &str,
        suggestion: &mut TensorManipulationSuggestion,
    ) -> GlueResult<()> {
        let record = self
            .complex
            .record(name, device)
            .filter(|record| record.suggested_manipulation.is_some())
            .or_else(|| self.lookup(name, device).ok());
        let Some(suggest) = record.and_then(|record| record.suggested_manipulation) else {
            return Err(unsupported(name));
        };
        let code = suggest(params, suggestion);
        if !code.is_success() {
            tracing::debug!(%device, identifier = name, %code, "suggested manipulation returned");
        }
        GlueError::from_code(code, name, device)
    }

    pub fn library_version(&self, device: DeviceClass, name: &str) -> GlueResult<u64> {
        if let Some(complex) = self.complex.dynamic_record(name, device) {
            if complex.shape_inference.is_none() {
                if let Some(primary) = self.dynamic_record(name, device) {
                    tracing::debug!(
                        identifier = name,
                        "complex identifier uses the kernel library's shape function"
                    );
                    return Ok(primary.library_version);
                }
            }
            return Ok(complex.library_version);
        }
        if let Ok(primary) = self.lookup(name, device) {
            return Ok(primary.library_version);
        }
        if let Some(complex) = self.complex.record(name, device) {
            return Ok(complex.library_version);
        }
        tracing::error!(%device, identifier = name, "no library version for unknown identifier");
        Err(GlueError::NotFound {
            identifier: name.to_string(),
            device,
        })
    }

    /// Key of the shape function that serves `name`, if it supports dynamic shapes.
    pub fn shape_function_id(
        &self,
        device: DeviceClass,
        name: &str,
    ) -> Option<crate::shape::ShapeFunctionKey> {
        let has_hash = |record: &&CapabilityRecord| record.identifier.hash() != 0;
        self.complex
            .dynamic_record(name, device)
            .filter(has_hash)
            .or_else(|| self.dynamic_record(name, device).filter(has_hash))
            .and_then(CapabilityRecord::shape_function_key)
    }

    fn shape_inference_record(&self, device: DeviceClass, name: &str) -> Option<&CapabilityRecord> {
        self.complex
            .dynamic_record(name, device)
            .filter(|record| record.shape_inference.is_some())
            .or_else(|| {
                self.dynamic_record(name, device)
                    .filter(|record| record.shape_inference.is_some())
            })
    }

    /// Runs the plug-in shape-inference routine serving `name`.
    pub fn run_shape_inference(
        &self,
        device: DeviceClass,
        name: &str,
        params: &SifParams,
        outputs: &mut SifOutputs,
    ) -> GlueResult<()> {
        let Some(record) = self.shape_inference_record(device, name) else {
            return Err(GlueError::Unsupported {
                identifier: name.to_string(),
                code: GlueCodeReturn::SIF_NULL_PTR,
            });
        };
        let Some(entry) = record.shape_inference else {
            return Err(unsupported(name));
        };
        let code = call_plugin_shape_inference(entry, device, &record.identifier, params, outputs);
        if !code.is_success() {
            tracing::warn!(%device, identifier = name, %code, "shape inference returned");
        }
        GlueError::from_code(code, name, device)
    }

    /// Publishes the shape-inference entry point of every dynamic-shape record.
    pub fn register_shape_functions(
        &self,
        registry: &mut ShapeFunctionRegistry,
    ) -> GlueResult<usize> {
        let mut published = 0;
        for device in DeviceClass::ALL {
            let mut records: Vec<&CapabilityRecord> = self.kernels[device.index()]
                .values()
                .chain(self.complex.records(device))
                .filter(|record| record.is_dynamic_shape())
                .collect();
            records.sort_by(|a, b| a.name().cmp(b.name()));

            for record in records {
                let (Some(entry), Some(key)) = (record.shape_inference, record.shape_function_key())
                else {
                    continue;
                };
                registry.register_record(
                    key,
                    ShapeFunctionRecord {
                        function: ShapeFunction::plugin(entry, Arc::clone(record.library())),
                        version: record.library_version,
                        name: record.name().to_string(),
                        identifier: Some(record.identifier.clone()),
                    },
                )?;
                published += 1;
            }
        }
        Ok(published)
    }

    pub fn has_identifier(&self, name: &str, device: DeviceClass) -> bool {
        self.lookup(name, device).is_ok() || self.complex.is_supported(name, device)
    }

    pub fn is_dynamic_shape(&self, name: &str, device: DeviceClass) -> bool {
        self.dynamic_record(name, device).is_some()
            || self.complex.dynamic_record(name, device).is_some()
    }

    /// Full 64-bit hash (origin tag included) recorded for `name`, or 0 when unknown.
    pub fn kernel_hash(&self, name: &str, device: DeviceClass) -> u64 {
        match self.lookup(name, device) {
            Ok(record) => record
                .shape_function_key()
                .map(|key| key.raw())
                .unwrap_or(0),
            Err(_) => {
                tracing::info!(%device, identifier = name, "no hash for unknown identifier");
                0
            }
        }
    }

    /// Identifiers registered for `device`, sorted by name.
    pub fn identifiers(&self, device: DeviceClass) -> Vec<&CapabilityRecord> {
        let mut records: Vec<_> = self.kernels[device.index()].values().collect();
        records.sort_by(|a, b| a.name().cmp(b.name()));
        records
    }

    pub fn fuser_record(&self, device: DeviceClass) -> Option<&CapabilityRecord> {
        self.fuser[device.index()].as_ref()
    }

    /// Version of every successfully loaded library, keyed by path or name.
    pub fn library_versions(&self) -> &BTreeMap<String, u64> {
        &self.library_versions
    }

    pub fn load_failures(&self) -> &[GlueError] {
        &self.load_failures
    }

    pub fn supports_feature(&self, device: DeviceClass, feature: Feature) -> bool {
        self.features.is_supported(device, feature)
    }

    /// Drops every record and library handle and forgets which devices were initialised.
    pub fn clear(&mut self) {
        for table in &mut self.kernels {
            table.clear();
        }
        self.fuser = Default::default();
        self.complex.clear();
        self.initialized = [false; DeviceClass::COUNT];
        self.libraries.clear();
        self.library_versions.clear();
        self.load_failures.clear();
        self.features.clear();
    }
}

impl PluginShapeInference for CapabilityRegistry {
    fn run_shape_inference(
        &self,
        device: DeviceClass,
        identifier: &str,
        params: &SifParams,
        outputs: &mut SifOutputs,
    ) -> GlueResult<()> {
        CapabilityRegistry::run_shape_inference(self, device, identifier, params, outputs)
    }
}

fn unsupported(name: &str) -> GlueError {
    GlueError::Unsupported {
        identifier: name.to_string(),
        code: GlueCodeReturn::FAILED,
    }
}
