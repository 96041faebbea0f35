//! Shape functions: keys, the registry that owns them, the compiled-in routines and the runner
//! for fused chains.

pub mod builtin;
pub mod io;
pub mod key;
pub mod multi;
pub mod registry;

pub use builtin::{
    core_inference_key, core_manipulation_key, evaluate_split_fused, SplitMetadata,
    CORE_SHAPE_FUNCTION_VERSION,
};
pub use io::{invalidate_tensor, is_tensor_invalid, SifOutputs, SifParams, SmfOutputs, SmfParams};
pub use key::{ShapeFunctionKey, ShapeOrigin};
pub use multi::{
    FusedNodeShapes, MultiNodeShapeInferenceRunner, MultiSifNodeInfo, PluginShapeInference,
    ShapeBound, ShapeRecord, SubNodeInfo, SubNodeTensor, TensorLocation,
};
pub use registry::{
    CoreInferenceFn, CoreManipulationFn, PluginShapeFunction, RegistrationOutcome, ShapeFunction,
    ShapeFunctionOverride, ShapeFunctionRecord, ShapeFunctionRegistry,
};
