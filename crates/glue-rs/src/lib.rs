pub mod abi;
pub mod artifact;
pub mod config;
pub mod device;
pub mod error;
pub mod identifier;
pub mod loader;
pub mod registry;
pub mod session;
pub mod shape;

pub use artifact::{
    NodeShapePlan, ShapeFunctionBinding, ShapePlanArtifact, ARTIFACT_FORMAT_VERSION,
};
pub use config::{DeterministicMode, GlueConfig};
pub use device::{DeviceClass, Feature};
pub use error::{ArtifactError, BufferKind, GlueError, GlueResult};
pub use identifier::OperationIdentifier;
pub use loader::{PluginEntryPoints, PluginLibrary};
pub use registry::{CapabilityRecord, CapabilityRegistry, ComplexCapabilityIndex};
pub use session::{
    InstantiationRequest, InstantiationResult, KernelInstantiationSession, NodeTensor,
};
pub use shape::{ShapeFunctionKey, ShapeFunctionRegistry, ShapeOrigin};
