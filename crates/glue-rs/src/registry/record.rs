use std::fmt;
use std::sync::Arc;

use crate::abi::{
    GetShapeInferenceFn, GetSuggestedManipulationFn, GetSupportedDataLayoutsFn, InstantiateFn,
};
use crate::identifier::OperationIdentifier;
use crate::loader::PluginLibrary;
use crate::shape::ShapeFunctionKey;

/// What one plug-in declared for one identifier on one device.
#[derive(Clone)]
pub struct CapabilityRecord {
    pub library_version: u64,
    pub identifier: OperationIdentifier,
    /// Position of the supplying library in the search path; `None` outside the search path.
    pub precedence: Option<u8>,
    pub instantiate: Option<InstantiateFn>,
    pub supported_layouts: Option<GetSupportedDataLayoutsFn>,
    pub suggested_manipulation: Option<GetSuggestedManipulationFn>,
    pub shape_inference: Option<GetShapeInferenceFn>,
    library: Arc<PluginLibrary>,
}

impl CapabilityRecord {
    pub(crate) fn from_library(
        library: &Arc<PluginLibrary>,
        identifier: OperationIdentifier,
        library_version: u64,
        precedence: Option<u8>,
    ) -> Self {
        Self {
            library_version,
            identifier,
            precedence,
            instantiate: library.instantiate(),
            supported_layouts: library.supported_layouts(),
            suggested_manipulation: library.suggested_manipulation(),
            shape_inference: library.shape_inference(),
            library: Arc::clone(library),
        }
    }

    pub fn name(&self) -> &str {
        self.identifier.name()
    }

    pub fn is_dynamic_shape(&self) -> bool {
        self.identifier.supports_dynamic_shapes
    }

    pub fn shape_function_key(&self) -> Option<ShapeFunctionKey> {
        self.identifier.shape_function_key()
    }

    pub fn library(&self) -> &Arc<PluginLibrary> {
        &self.library
    }
}

impl fmt::Debug for CapabilityRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRecord")
            .field("identifier", &self.identifier.name())
            .field("library", &self.library.name())
            .field("library_version", &self.library_version)
            .field("precedence", &self.precedence)
            .field("dynamic_shape", &self.is_dynamic_shape())
            .field("shape_inference", &self.shape_inference.is_some())
            .finish()
    }
}
