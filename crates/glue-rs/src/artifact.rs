//! Persisted shape plan: the shape-function key and library version each dynamic node was
//! compiled against.
//!
//! A plan is only usable with a live [`ShapeFunctionRegistry`] that still serves every recorded key
//! at the recorded version; anything else is rejected before use.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::device::DeviceClass;
use crate::error::{ArtifactError, GlueError, GlueResult};
use crate::registry::CapabilityRegistry;
use crate::shape::{MultiSifNodeInfo, ShapeFunctionKey, ShapeFunctionRegistry};

pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeFunctionBinding {
    pub key: ShapeFunctionKey,
    pub version: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeShapePlan {
    pub node_name: String,
    pub identifier: String,
    #[serde(default)]
    pub shape_function: Option<ShapeFunctionBinding>,
    #[serde(default)]
    pub multi_sif: Option<MultiSifNodeInfo>,
}

impl NodeShapePlan {
    pub fn new(node_name: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            identifier: identifier.into(),
            shape_function: None,
            multi_sif: None,
        }
    }

    /// Records the shape function the registry currently serves for `identifier`, if any.
    pub fn from_registry(
        registry: &CapabilityRegistry,
        device: DeviceClass,
        node_name: impl Into<String>,
        identifier: impl Into<String>,
    ) -> GlueResult<Self> {
        let mut plan = Self::new(node_name, identifier);
        if let Some(key) = registry.shape_function_id(device, &plan.identifier) {
            let version = registry.library_version(device, &plan.identifier)?;
            plan.shape_function = Some(ShapeFunctionBinding { key, version });
        }
        Ok(plan)
    }

    pub fn with_binding(mut self, key: ShapeFunctionKey, version: u64) -> Self {
        self.shape_function = Some(ShapeFunctionBinding { key, version });
        self
    }

    pub fn with_multi_sif(mut self, info: MultiSifNodeInfo) -> Self {
        self.multi_sif = Some(info);
        self
    }

    /// Every binding the node depends on, sub-operations included. Static sub-operations carry the
    /// invalid key and are skipped.
    pub fn bindings(&self) -> Vec<ShapeFunctionBinding> {
        let sub_nodes = self
            .multi_sif
            .iter()
            .flat_map(|info| info.nodes.iter())
            .map(|sub_node| ShapeFunctionBinding {
                key: sub_node.sif_key,
                version: sub_node.sif_version,
            });
        self.shape_function
            .into_iter()
            .chain(sub_nodes)
            .filter(|binding| binding.key.is_valid())
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapePlanArtifact {
    pub format_version: u32,
    pub nodes: Vec<NodeShapePlan>,
}

impl Default for ShapePlanArtifact {
    fn default() -> Self {
        Self::new()
    }
}

impl ShapePlanArtifact {
    pub fn new() -> Self {
        Self {
            format_version: ARTIFACT_FORMAT_VERSION,
            nodes: Vec::new(),
        }
    }

    pub fn with_nodes(mut self, nodes: Vec<NodeShapePlan>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn push(&mut self, node: NodeShapePlan) {
        self.nodes.push(node);
    }

    /// Fails on the first binding the live registry does not serve at the recorded version.
    pub fn validate(&self, registry: &ShapeFunctionRegistry) -> GlueResult<()> {
        for (index, node) in self.nodes.iter().enumerate() {
            for binding in node.bindings() {
                registry
                    .check_binding(binding.key, binding.version)
                    .map_err(|err| {
                        tracing::error!(
                            node = index,
                            node_name = %node.node_name,
                            key = %binding.key,
                            recorded = binding.version,
                            error = %err,
                            "shape plan rejected"
                        );
                        err
                    })?;
            }
        }
        Ok(())
    }

    pub fn to_json_string(&self) -> GlueResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| GlueError::Artifact(ArtifactError::from(err)))
    }

    pub fn from_json_str(src: &str) -> GlueResult<Self> {
        let artifact: Self = serde_json::from_str(src).map_err(ArtifactError::from)?;
        artifact.check_format()
    }

    pub fn to_bincode_bytes(&self) -> GlueResult<Vec<u8>> {
        bincode::serialize(self).map_err(|err| GlueError::Artifact(ArtifactError::from(err)))
    }

    pub fn from_bincode_slice(bytes: &[u8]) -> GlueResult<Self> {
        let artifact: Self = bincode::deserialize(bytes).map_err(ArtifactError::from)?;
        artifact.check_format()
    }

    pub fn save_bincode<P: AsRef<Path>>(&self, path: P) -> GlueResult<()> {
        let bytes = self.to_bincode_bytes()?;
        fs::write(path, bytes).map_err(ArtifactError::from)?;
        Ok(())
    }

    pub fn load_bincode<P: AsRef<Path>>(path: P) -> GlueResult<Self> {
        let bytes = fs::read(path).map_err(ArtifactError::from)?;
        Self::from_bincode_slice(&bytes)
    }

    /// Loads and validates in one step so an unchecked plan never reaches the caller.
    pub fn load_validated<P: AsRef<Path>>(
        path: P,
        registry: &ShapeFunctionRegistry,
    ) -> GlueResult<Self> {
        let artifact = Self::load_bincode(path)?;
        artifact.validate(registry)?;
        Ok(artifact)
    }

    fn check_format(self) -> GlueResult<Self> {
        if self.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(ArtifactError::FormatVersion {
                found: self.format_version,
                expected: ARTIFACT_FORMAT_VERSION,
            }
            .into());
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::{
        core_inference_key, ShapeRecord, SubNodeInfo, SubNodeTensor, TensorLocation,
        CORE_SHAPE_FUNCTION_VERSION,
    };

    fn static_sub_node() -> SubNodeInfo {
        SubNodeInfo {
            node_name: "cast".to_string(),
            identifier: "cast_f32_to_i32".to_string(),
            sif_key: ShapeFunctionKey::INVALID,
            sif_version: 0,
            node_params: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            input_permutations: Vec::new(),
            output_permutations: Vec::new(),
        }
    }

    #[test]
    fn bindings_skip_static_sub_operations() {
        let mut reduce = static_sub_node();
        reduce.sif_key = core_inference_key(2);
        reduce.sif_version = CORE_SHAPE_FUNCTION_VERSION;
        let plan = NodeShapePlan::new("fused_0", "fused_kernel_0")
            .with_binding(core_inference_key(4), CORE_SHAPE_FUNCTION_VERSION)
            .with_multi_sif(MultiSifNodeInfo {
                internal_tensor_count: 0,
                nodes: vec![static_sub_node(), reduce],
            });
        let keys: Vec<_> = plan.bindings().iter().map(|binding| binding.key).collect();
        assert_eq!(keys, [core_inference_key(4), core_inference_key(2)]);
    }

    #[test]
    fn unknown_format_version_is_rejected() {
        let mut artifact = ShapePlanArtifact::new();
        artifact.format_version = ARTIFACT_FORMAT_VERSION + 1;
        let bytes = artifact
            .to_bincode_bytes()
            .unwrap_or_else(|err| panic!("unexpected error: {err}"));
        let err = ShapePlanArtifact::from_bincode_slice(&bytes).expect_err("should be rejected");
        assert!(matches!(
            err,
            GlueError::Artifact(ArtifactError::FormatVersion { found: 2, .. })
        ));
    }

    #[test]
    fn json_dump_keeps_shape_records() {
        let mut sub_node = static_sub_node();
        sub_node.outputs.push(SubNodeTensor {
            shape: ShapeRecord {
                max_sizes: vec![4, 1, 1],
                min_sizes: vec![1, 1, 1],
                data_type: 0,
            },
            location: TensorLocation::Internal(0),
        });
        let node = NodeShapePlan::new("n", "fused_kernel_1").with_multi_sif(MultiSifNodeInfo {
            internal_tensor_count: 1,
            nodes: vec![sub_node],
        });
        let artifact = ShapePlanArtifact::new().with_nodes(vec![node]);
        let json = artifact
            .to_json_string()
            .unwrap_or_else(|err| panic!("unexpected error: {err}"));
        let back = ShapePlanArtifact::from_json_str(&json)
            .unwrap_or_else(|err| panic!("unexpected error: {err}"));
        assert_eq!(back, artifact);
    }
}
