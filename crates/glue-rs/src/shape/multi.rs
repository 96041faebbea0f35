//! Shape inference for fused operations that were expanded into a chain of sub-operations.
//!
//! The chain is described by a [`MultiSifNodeInfo`]: every sub-operation names the shape function
//! that computes its outputs and where each of its tensors lives. Tensors that never leave the
//! chain are "internal" and exist only in this runner's scratch table.

use serde::{Deserialize, Serialize};

use crate::abi::{DataType, NodeTensorPermutation, TensorGeometry, MAX_TENSOR_DIM};
use crate::device::DeviceClass;
use crate::error::{GlueError, GlueResult};

use super::io::{SifOutputs, SifParams};
use super::key::ShapeFunctionKey;
use super::registry::ShapeFunctionRegistry;

/// Serialisable copy of a [`TensorGeometry`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeRecord {
    pub max_sizes: Vec<u64>,
    pub min_sizes: Vec<u64>,
    pub data_type: u32,
}

impl ShapeRecord {
    pub fn to_geometry(&self) -> TensorGeometry {
        let mut geometry = TensorGeometry {
            dims: self.max_sizes.len().min(MAX_TENSOR_DIM) as u32,
            data_type: DataType(self.data_type),
            ..TensorGeometry::default()
        };
        for (dim, size) in self.max_sizes.iter().take(MAX_TENSOR_DIM).enumerate() {
            geometry.max_sizes[dim] = *size;
        }
        for (dim, size) in self.min_sizes.iter().take(MAX_TENSOR_DIM).enumerate() {
            geometry.min_sizes[dim] = *size;
        }
        geometry
    }
}

impl From<&TensorGeometry> for ShapeRecord {
    fn from(geometry: &TensorGeometry) -> Self {
        Self {
            max_sizes: geometry.max_dims().to_vec(),
            min_sizes: geometry.min_dims().to_vec(),
            data_type: geometry.data_type.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorLocation {
    FusedInput(usize),
    FusedOutput(usize),
    Internal(usize),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubNodeTensor {
    pub shape: ShapeRecord,
    pub location: TensorLocation,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubNodeInfo {
    pub node_name: String,
    /// Operation identifier used when the shape function lives in a plug-in.
    pub identifier: String,
    /// [`ShapeFunctionKey::INVALID`] for static sub-operations.
    pub sif_key: ShapeFunctionKey,
    pub sif_version: u64,
    #[serde(default)]
    pub node_params: Vec<u8>,
    pub inputs: Vec<SubNodeTensor>,
    pub outputs: Vec<SubNodeTensor>,
    /// One entry per input; an empty list means every input keeps its layout.
    #[serde(default)]
    pub input_permutations: Vec<Vec<u32>>,
    #[serde(default)]
    pub output_permutations: Vec<Vec<u32>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiSifNodeInfo {
    pub internal_tensor_count: usize,
    pub nodes: Vec<SubNodeInfo>,
}

/// Which bound of each dynamic dimension a run computes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShapeBound {
    Min,
    Max,
}

impl ShapeBound {
    /// Geometry with the selected bound moved into `max_sizes`, where shape functions read it.
    fn select(self, geometry: &TensorGeometry) -> TensorGeometry {
        let mut selected = *geometry;
        if self == ShapeBound::Min {
            selected.max_sizes = geometry.min_sizes;
        }
        selected
    }

    fn store(self, target: &mut TensorGeometry, computed: &TensorGeometry) {
        target.dims = computed.dims;
        match self {
            ShapeBound::Max => target.max_sizes = computed.max_sizes,
            ShapeBound::Min => target.min_sizes = computed.max_sizes,
        }
    }
}

/// Shape inference through plug-in entry points, addressed by identifier name.
pub trait PluginShapeInference {
    fn run_shape_inference(
        &self,
        device: DeviceClass,
        identifier: &str,
        params: &SifParams,
        outputs: &mut SifOutputs,
    ) -> GlueResult<()>;
}

/// Fused node being inferred: its interface tensors and dispatch parameters.
#[derive(Clone, Copy, Debug)]
pub struct FusedNodeShapes<'a> {
    pub node_id: u64,
    pub inputs: &'a [TensorGeometry],
    pub max_available_tpc: u32,
}

pub struct MultiNodeShapeInferenceRunner<'a> {
    shape_functions: &'a ShapeFunctionRegistry,
    plugins: &'a dyn PluginShapeInference,
    device: DeviceClass,
}

impl<'a> MultiNodeShapeInferenceRunner<'a> {
    pub fn new(
        shape_functions: &'a ShapeFunctionRegistry,
        plugins: &'a dyn PluginShapeInference,
        device: DeviceClass,
    ) -> Self {
        Self {
            shape_functions,
            plugins,
            device,
        }
    }

    /// Runs every sub-operation in order. `outputs` holds the fused node's declared outputs and
    /// receives the computed bound plus the merged invalid mask. The first failing sub-operation
    /// aborts the run.
    pub fn run(
        &self,
        info: &MultiSifNodeInfo,
        node: FusedNodeShapes<'_>,
        outputs: &mut SifOutputs,
        bound: ShapeBound,
    ) -> GlueResult<()> {
        let mut internal: Vec<Option<TensorGeometry>> = vec![None; info.internal_tensor_count];

        for (index, sub_node) in info.nodes.iter().enumerate() {
            let inputs = sub_node
                .inputs
                .iter()
                .map(|tensor| {
                    self.resolve_input(sub_node, tensor, node.inputs, outputs, &internal)
                        .map(|geometry| bound.select(&geometry))
                })
                .collect::<GlueResult<Vec<_>>>()?;
            let declared: Vec<TensorGeometry> = sub_node
                .outputs
                .iter()
                .map(|tensor| bound.select(&tensor.shape.to_geometry()))
                .collect();
            let mut computed = SifOutputs::from_declared(declared);

            if sub_node.sif_key.is_valid() {
                let params = SifParams {
                    node_id: node.node_id,
                    inputs,
                    node_params: sub_node.node_params.clone(),
                    output_count: sub_node.outputs.len(),
                    input_permutations: permutations(&sub_node.input_permutations),
                    output_permutations: permutations(&sub_node.output_permutations),
                    max_available_tpc: node.max_available_tpc,
                };
                self.dispatch(sub_node, &params, &mut computed)
                    .map_err(|err| {
                        tracing::error!(
                            device = %self.device,
                            sub_node = %sub_node.node_name,
                            index,
                            error = %err,
                            "sub-operation shape inference failed"
                        );
                        err
                    })?;
            }

            for (slot, tensor) in sub_node.outputs.iter().enumerate() {
                let result = &computed.outputs[slot];
                match tensor.location {
                    TensorLocation::Internal(id) => {
                        let entry = internal.get_mut(id).ok_or_else(|| {
                            GlueError::contract(format!(
                                "sub-operation {} writes internal tensor {id} beyond the declared {}",
                                sub_node.node_name, info.internal_tensor_count
                            ))
                        })?;
                        if computed.is_invalid(slot) {
                            tracing::debug!(
                                sub_node = %sub_node.node_name,
                                internal_tensor = id,
                                "invalid intermediate shape stays inside the chain"
                            );
                        }
                        let mut geometry = tensor.shape.to_geometry();
                        bound.store(&mut geometry, result);
                        *entry = Some(geometry);
                    }
                    TensorLocation::FusedOutput(external) => {
                        let target = outputs.outputs.get_mut(external).ok_or_else(|| {
                            GlueError::contract(format!(
                                "sub-operation {} writes fused output {external} which does not exist",
                                sub_node.node_name
                            ))
                        })?;
                        bound.store(target, result);
                        if computed.is_invalid(slot) {
                            outputs.invalidate(external);
                        }
                    }
                    TensorLocation::FusedInput(external) => {
                        return Err(GlueError::contract(format!(
                            "sub-operation {} writes fused input {external}",
                            sub_node.node_name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn dispatch(
        &self,
        sub_node: &SubNodeInfo,
        params: &SifParams,
        outputs: &mut SifOutputs,
    ) -> GlueResult<()> {
        let is_core = sub_node
            .sif_key
            .origin()
            .is_some_and(|origin| origin.is_core());
        if is_core {
            self.shape_functions
                .invoke_inference(sub_node.sif_key, self.device, params, outputs)
        } else {
            self.plugins
                .run_shape_inference(self.device, &sub_node.identifier, params, outputs)
        }
    }

    fn resolve_input(
        &self,
        sub_node: &SubNodeInfo,
        tensor: &SubNodeTensor,
        fused_inputs: &[TensorGeometry],
        fused_outputs: &SifOutputs,
        internal: &[Option<TensorGeometry>],
    ) -> GlueResult<TensorGeometry> {
        let geometry = match tensor.location {
            TensorLocation::FusedInput(external) => fused_inputs.get(external).copied(),
            TensorLocation::FusedOutput(external) => fused_outputs.outputs.get(external).copied(),
            TensorLocation::Internal(id) => {
                let written = internal.get(id).copied().flatten();
                if written.is_none() {
                    tracing::error!(
                        sub_node = %sub_node.node_name,
                        internal_tensor = id,
                        "internal tensor read before it was written"
                    );
                }
                written
            }
        };
        geometry.ok_or_else(|| {
            GlueError::contract(format!(
                "sub-operation {} reads unavailable tensor {:?}",
                sub_node.node_name, tensor.location
            ))
        })
    }
}

/// Permutations are only handed to shape functions when at least one is not the identity.
fn permutations(recorded: &[Vec<u32>]) -> Option<Vec<NodeTensorPermutation>> {
    let converted: Vec<NodeTensorPermutation> = recorded
        .iter()
        .map(|values| {
            let mut permutation = NodeTensorPermutation::identity();
            for (slot, value) in permutation.permutation.iter_mut().zip(values) {
                *slot = *value;
            }
            permutation
        })
        .collect();
    converted
        .iter()
        .any(|permutation| !permutation.is_identity())
        .then_some(converted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_permutations_are_not_forwarded() {
        assert_eq!(permutations(&[vec![0, 1, 2], vec![]]), None);
        let forwarded = permutations(&[vec![1, 0]]).expect("non-identity permutation");
        assert_eq!(forwarded[0].permutation[..3], [1, 0, 2]);
    }

    #[test]
    fn min_bound_reads_and_writes_the_lower_side() {
        let mut geometry = TensorGeometry::fixed(&[8, 4], DataType::F32);
        geometry.min_sizes[0] = 2;
        let selected = ShapeBound::Min.select(&geometry);
        assert_eq!(selected.max_dims(), [2, 4]);

        let mut target = geometry;
        let mut computed = selected;
        computed.max_sizes[1] = 1;
        ShapeBound::Min.store(&mut target, &computed);
        assert_eq!(target.min_dims(), [2, 1]);
        assert_eq!(target.max_dims(), [8, 4]);
    }
}
