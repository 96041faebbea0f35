//! Opening glue-code libraries and resolving their entry points.
//!
//! A [`PluginLibrary`] is a bag of optional function pointers plus whatever keeps them alive. Which
//! entry points a library must export depends on how the registry uses it, so nothing here fails
//! because a symbol is missing.

use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr;

use libloading::Library;

use crate::abi::{
    GetKernelGuidsFn, GetLibVersionFn, GetShapeInferenceFn, GetSuggestedManipulationFn,
    GetSupportedDataLayoutsFn, GlueCodeReturn, GuidInfo, InstantiateFn,
    FUNCTIONAL_COMPLEX_GUIDS_ENTRY_POINT, KERNEL_GUIDS_ENTRY_POINT,
    KERNEL_INSTANTIATION_ENTRY_POINT, LIB_VERSION_ENTRY_POINT,
    PERFORMANCE_COMPLEX_GUIDS_ENTRY_POINT, SHAPE_INFERENCE_ENTRY_POINT,
    SUGGESTED_MANIPULATION_ENTRY_POINT, SUPPORTED_DATA_LAYOUTS_ENTRY_POINT,
};
use crate::device::DeviceClass;
use crate::error::{GlueError, GlueResult};

/// Entry points a glue-code library may export.
#[derive(Clone, Copy, Default)]
pub struct PluginEntryPoints {
    pub kernel_guids: Option<GetKernelGuidsFn>,
    pub instantiate: Option<InstantiateFn>,
    pub supported_layouts: Option<GetSupportedDataLayoutsFn>,
    pub suggested_manipulation: Option<GetSuggestedManipulationFn>,
    pub shape_inference: Option<GetShapeInferenceFn>,
    pub library_version: Option<GetLibVersionFn>,
    pub functional_complex_guids: Option<GetKernelGuidsFn>,
    pub performance_complex_guids: Option<GetKernelGuidsFn>,
}

impl PluginEntryPoints {
    fn resolve(lib: &Library) -> Self {
        Self {
            kernel_guids: optional_symbol(lib, KERNEL_GUIDS_ENTRY_POINT),
            instantiate: optional_symbol(lib, KERNEL_INSTANTIATION_ENTRY_POINT),
            supported_layouts: optional_symbol(lib, SUPPORTED_DATA_LAYOUTS_ENTRY_POINT),
            suggested_manipulation: optional_symbol(lib, SUGGESTED_MANIPULATION_ENTRY_POINT),
            shape_inference: optional_symbol(lib, SHAPE_INFERENCE_ENTRY_POINT),
            library_version: optional_symbol(lib, LIB_VERSION_ENTRY_POINT),
            functional_complex_guids: optional_symbol(lib, FUNCTIONAL_COMPLEX_GUIDS_ENTRY_POINT),
            performance_complex_guids: optional_symbol(
                lib,
                PERFORMANCE_COMPLEX_GUIDS_ENTRY_POINT,
            ),
        }
    }
}

fn optional_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> Option<T> {
    // SAFETY: Every entry-point name is paired with its declared C signature in `abi`.
    unsafe { lib.get::<T>(name) }.ok().map(|symbol| *symbol)
}

/// A loaded glue-code library. Function pointers stay valid for as long as this value lives.
pub struct PluginLibrary {
    name: String,
    path: Option<PathBuf>,
    entries: PluginEntryPoints,
    _lib: Option<Library>,
}

impl fmt::Debug for PluginLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginLibrary")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl PluginLibrary {
    pub fn open(path: impl AsRef<Path>) -> GlueResult<Self> {
        let path = path.as_ref();
        // SAFETY: Loading runs the library's initialisers; glue-code libraries are trusted inputs
        // named by the compiler's configuration.
        let lib = unsafe { Library::new(path) }
            .map_err(|err| GlueError::load_failure(path, err.to_string()))?;
        let entries = PluginEntryPoints::resolve(&lib);
        Ok(Self {
            name: path.display().to_string(),
            path: Some(path.to_path_buf()),
            entries,
            _lib: Some(lib),
        })
    }

    /// Wraps functions linked into the current process.
    pub fn from_entry_points(name: impl Into<String>, entries: PluginEntryPoints) -> Self {
        Self {
            name: name.into(),
            path: None,
            entries,
            _lib: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn entry_points(&self) -> &PluginEntryPoints {
        &self.entries
    }

    pub fn library_version(&self) -> Option<u64> {
        let get_version = self.entries.library_version?;
        // SAFETY: `GetLibVersion` takes no arguments and only returns a value.
        Some(unsafe { get_version() })
    }

    pub fn instantiate(&self) -> Option<InstantiateFn> {
        self.entries.instantiate
    }

    pub fn supported_layouts(&self) -> Option<GetSupportedDataLayoutsFn> {
        self.entries.supported_layouts
    }

    pub fn suggested_manipulation(&self) -> Option<GetSuggestedManipulationFn> {
        self.entries.suggested_manipulation
    }

    pub fn shape_inference(&self) -> Option<GetShapeInferenceFn> {
        self.entries.shape_inference
    }

    /// Identifiers this library implements for `device`. `Ok(None)` when the library does not
    /// export the enumeration entry point.
    pub fn kernel_guids(&self, device: DeviceClass) -> GlueResult<Option<Vec<GuidInfo>>> {
        self.entries
            .kernel_guids
            .map(|enumerate| self.enumerate(enumerate, device, "GetKernelGuids"))
            .transpose()
    }

    pub fn functional_complex_guids(
        &self,
        device: DeviceClass,
    ) -> GlueResult<Option<Vec<GuidInfo>>> {
        self.entries
            .functional_complex_guids
            .map(|enumerate| self.enumerate(enumerate, device, "GetFunctionalComplexGuids"))
            .transpose()
    }

    pub fn performance_complex_guids(
        &self,
        device: DeviceClass,
    ) -> GlueResult<Option<Vec<GuidInfo>>> {
        self.entries
            .performance_complex_guids
            .map(|enumerate| self.enumerate(enumerate, device, "GetPerformanceComplexGuids"))
            .transpose()
    }

    fn enumerate(
        &self,
        enumerate: GetKernelGuidsFn,
        device: DeviceClass,
        entry_point: &str,
    ) -> GlueResult<Vec<GuidInfo>> {
        let mut count = 0u32;
        // SAFETY: A null array with a zero count asks only for the number of entries.
        let code = unsafe { enumerate(device.raw(), &mut count, ptr::null_mut()) };
        self.check_enumeration(code, entry_point)?;
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut guids = vec![GuidInfo::default(); count as usize];
        let mut filled = count;
        // SAFETY: `guids` holds exactly `filled` writable entries.
        let code = unsafe { enumerate(device.raw(), &mut filled, guids.as_mut_ptr()) };
        self.check_enumeration(code, entry_point)?;
        guids.truncate(filled.min(count) as usize);
        Ok(guids)
    }

    fn check_enumeration(&self, code: GlueCodeReturn, entry_point: &str) -> GlueResult<()> {
        if code.is_success() {
            return Ok(());
        }
        Err(GlueError::load_failure(
            self.path.clone().unwrap_or_else(|| PathBuf::from(&self.name)),
            format!("{entry_point} failed with {code}"),
        ))
    }
}
