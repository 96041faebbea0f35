//! Flattening of node tensors into the plug-in parameter block.

use std::ffi::c_void;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::abi::{
    write_c_chars, DataType, HabanaKernelParams, Tensor, TensorQuantizationParam,
    UniqueShapeInferenceHash, UserParams, GLUE_API_VERSION, MAX_DIMS_PER_ENTRY, MAX_TENSOR_DIM,
};
use crate::device::DeviceClass;
use crate::error::{GlueError, GlueResult};

pub type Dims = SmallVec<[u64; MAX_DIMS_PER_ENTRY]>;

pub const LOG_SIGMA_EXP_IDENTIFIER: &str = "logsigmaexp_st2_i32";
pub const AVERAGE_POOLING_IDENTIFIER: &str = "average_pooling_i8";
pub const NOP_IDENTIFIER: &str = "nop";

const FORCE_ASM_VERSION_FLAG: u32 = 1 << 0;

/// A node operand as the compiler sees it.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeTensor {
    pub sizes: Dims,
    /// Lower bounds of dynamic dimensions; `None` for static tensors.
    pub min_sizes: Option<Dims>,
    pub data_type: DataType,
    pub quantization: TensorQuantizationParam,
    /// `None` for the identity layout.
    pub permutation: Option<SmallVec<[u32; MAX_DIMS_PER_ENTRY]>>,
    pub reducible: bool,
    pub shape_tensor: bool,
    /// Host-resident constant content handed to the kernel.
    pub static_data: Option<Arc<[u8]>>,
}

impl NodeTensor {
    pub fn new(sizes: &[u64], data_type: DataType) -> Self {
        Self {
            sizes: Dims::from_slice(sizes),
            min_sizes: None,
            data_type,
            quantization: TensorQuantizationParam {
                zero_point: 0,
                scale: 1.0,
            },
            permutation: None,
            reducible: false,
            shape_tensor: false,
            static_data: None,
        }
    }

    pub fn with_min_sizes(mut self, min_sizes: &[u64]) -> Self {
        self.min_sizes = Some(Dims::from_slice(min_sizes));
        self
    }

    pub fn with_permutation(mut self, permutation: &[u32]) -> Self {
        self.permutation = Some(SmallVec::from_slice(permutation));
        self
    }

    pub fn with_static_data(mut self, data: impl Into<Arc<[u8]>>) -> Self {
        self.static_data = Some(data.into());
        self
    }

    pub fn reducible(mut self) -> Self {
        self.reducible = true;
        self
    }

    pub fn shape_tensor(mut self) -> Self {
        self.shape_tensor = true;
        self
    }

    pub fn rank(&self) -> usize {
        self.sizes.len()
    }

    fn validate(&self, role: &str, index: usize) -> GlueResult<()> {
        if self.rank() > MAX_TENSOR_DIM {
            return Err(GlueError::contract(format!(
                "{role} {index} has rank {} above the supported {MAX_TENSOR_DIM}",
                self.rank()
            )));
        }
        if let Some(min_sizes) = &self.min_sizes {
            if min_sizes.len() != self.rank() {
                return Err(GlueError::contract(format!(
                    "{role} {index} has {} min sizes for rank {}",
                    min_sizes.len(),
                    self.rank()
                )));
            }
        }
        if let Some(permutation) = &self.permutation {
            if permutation.len() != self.rank() {
                return Err(GlueError::contract(format!(
                    "{role} {index} has a permutation of length {} for rank {}",
                    permutation.len(),
                    self.rank()
                )));
            }
        }
        Ok(())
    }
}

/// Descriptor entries used by a tensor of `rank` dimensions. Rank 0 still takes one entry.
pub fn descriptor_entries(rank: usize) -> usize {
    rank.div_ceil(MAX_DIMS_PER_ENTRY).max(1)
}

/// Appends the descriptor entries for `tensor` and returns how many were written.
pub fn pack_tensor(tensor: &NodeTensor, output: bool, entries: &mut Vec<Tensor>) -> usize {
    let rank = tensor.rank();
    let used = descriptor_entries(rank);
    let identity = tensor.permutation.is_none() || output;
    let data = match (&tensor.static_data, tensor.shape_tensor || output) {
        (Some(data), false) => data.as_ptr().cast::<c_void>(),
        _ => std::ptr::null(),
    };

    for entry in 0..used {
        let offset = entry * MAX_DIMS_PER_ENTRY;
        let mut packed = Tensor::default();
        packed.geometry.data_type = tensor.data_type;
        packed.geometry.dims = rank.saturating_sub(offset).min(MAX_DIMS_PER_ENTRY) as u32;

        for slot in 0..MAX_TENSOR_DIM {
            let dim = offset + slot;
            let inside = slot < MAX_DIMS_PER_ENTRY && dim < rank;
            if inside {
                packed.geometry.max_sizes[slot] = tensor.sizes[dim];
                packed.geometry.min_sizes[slot] = tensor
                    .min_sizes
                    .as_ref()
                    .map_or(tensor.sizes[dim], |min_sizes| min_sizes[dim]);
            } else {
                packed.geometry.max_sizes[slot] = 1;
                packed.geometry.min_sizes[slot] = 1;
            }
            packed.permutation[slot] = match (&tensor.permutation, inside && !identity) {
                (Some(permutation), true) => permutation[dim].min(MAX_DIMS_PER_ENTRY as u32),
                _ => slot as u32,
            };
        }

        if !tensor.shape_tensor {
            packed.quantization_param = tensor.quantization;
            packed.set_reducible(tensor.reducible);
            packed.p_data = data;
        }
        entries.push(packed);
    }
    used
}

/// Everything an instantiate call needs, ready to hand to the plug-in.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstantiationRequest {
    pub identifier: String,
    pub node_id: u64,
    pub inputs: Vec<NodeTensor>,
    pub outputs: Vec<NodeTensor>,
    pub node_params: Vec<u8>,
    /// Node-level request, honoured when deterministic mode is per node.
    pub deterministic: bool,
}

impl InstantiationRequest {
    pub fn new(identifier: impl Into<String>, node_id: u64) -> Self {
        Self {
            identifier: identifier.into(),
            node_id,
            ..Self::default()
        }
    }

    pub fn input(mut self, tensor: NodeTensor) -> Self {
        self.inputs.push(tensor);
        self
    }

    pub fn output(mut self, tensor: NodeTensor) -> Self {
        self.outputs.push(tensor);
        self
    }

    pub fn with_node_params(mut self, node_params: Vec<u8>) -> Self {
        self.node_params = node_params;
        self
    }
}

/// Dispatch settings resolved by the session before packing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchSettings {
    pub device: DeviceClass,
    pub deterministic: bool,
    pub max_available_tpc: u32,
    /// Registry hash for the identifier, origin byte included.
    pub name_hash: u64,
    pub kernel_properties: u32,
}

/// Parameter block plus the storage its pointers refer to. The storage is never resized after
/// construction, so the pointers stay valid for the lifetime of the value.
#[derive(Debug)]
pub struct PreparedParams {
    params: HabanaKernelParams,
    inputs: Vec<Tensor>,
    outputs: Vec<Tensor>,
    node_params: Vec<u8>,
    _static_data: Vec<Arc<[u8]>>,
}

impl PreparedParams {
    pub fn build(request: &InstantiationRequest, settings: DispatchSettings) -> GlueResult<Self> {
        if request.identifier.is_empty() {
            return Err(GlueError::contract("instantiation request without identifier"));
        }
        for (index, tensor) in request.inputs.iter().enumerate() {
            tensor.validate("input", index)?;
        }
        for (index, tensor) in request.outputs.iter().enumerate() {
            tensor.validate("output", index)?;
        }

        let mut inputs = Vec::new();
        for tensor in &request.inputs {
            pack_tensor(tensor, false, &mut inputs);
        }
        let mut outputs = Vec::new();
        for tensor in &request.outputs {
            pack_tensor(tensor, true, &mut outputs);
        }

        let mut debug_flags = 0;
        match request.identifier.as_str() {
            LOG_SIGMA_EXP_IDENTIFIER => {
                if let Some(first) = outputs.first_mut() {
                    first.geometry.dims = 1;
                }
            }
            AVERAGE_POOLING_IDENTIFIER => debug_flags |= FORCE_ASM_VERSION_FLAG,
            NOP_IDENTIFIER if inputs.is_empty() => {
                let mut placeholder = Tensor::default();
                placeholder.geometry.data_type = DataType::F32;
                inputs.push(placeholder);
            }
            _ => {}
        }

        let static_data = request
            .inputs
            .iter()
            .filter_map(|tensor| tensor.static_data.clone())
            .collect();

        let mut prepared = Self {
            params: HabanaKernelParams {
                api_version: GLUE_API_VERSION,
                device_id: settings.device.raw(),
                max_available_tpc: settings.max_available_tpc,
                use_deterministic: u32::from(settings.deterministic),
                unique_node_id: request.node_id,
                debug_flags,
                ..HabanaKernelParams::default()
            },
            inputs,
            outputs,
            node_params: request.node_params.clone(),
            _static_data: static_data,
        };
        write_c_chars(&mut prepared.params.guid.name, &request.identifier);
        prepared.params.guid.name_hash = UniqueShapeInferenceHash(settings.name_hash);
        prepared.params.guid.kernel_properties = settings.kernel_properties;

        prepared.params.input_tensors = prepared.inputs.as_mut_ptr();
        prepared.params.input_tensor_nr = prepared.inputs.len() as u32;
        prepared.params.output_tensors = prepared.outputs.as_mut_ptr();
        prepared.params.output_tensor_nr = prepared.outputs.len() as u32;
        prepared.params.node_params = if prepared.node_params.is_empty() {
            UserParams::default()
        } else {
            UserParams {
                node_params: prepared.node_params.as_mut_ptr().cast::<c_void>(),
                node_params_size: prepared.node_params.len() as u32,
            }
        };
        Ok(prepared)
    }

    pub fn params(&self) -> &HabanaKernelParams {
        &self.params
    }

    pub fn inputs(&self) -> &[Tensor] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Tensor] {
        &self.outputs
    }

    pub fn identifier(&self) -> String {
        self.params.guid.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> DispatchSettings {
        DispatchSettings {
            device: DeviceClass::Gaudi2,
            deterministic: false,
            max_available_tpc: 24,
            name_hash: 0,
            kernel_properties: 0,
        }
    }

    #[test]
    fn entry_count_rounds_rank_up() {
        assert_eq!(descriptor_entries(0), 1);
        assert_eq!(descriptor_entries(1), 1);
        assert_eq!(descriptor_entries(5), 1);
        assert_eq!(descriptor_entries(6), 2);
        assert_eq!(descriptor_entries(11), 3);
    }

    #[test]
    fn shape_tensor_carries_geometry_only() {
        let tensor = NodeTensor::new(&[4, 2], DataType::I32)
            .shape_tensor()
            .reducible()
            .with_static_data(vec![1u8, 2, 3]);
        let mut entries = Vec::new();
        pack_tensor(&tensor, false, &mut entries);
        assert_eq!(entries[0].geometry.max_dims(), [4, 2]);
        assert!(!entries[0].reducible());
        assert!(entries[0].p_data.is_null());
    }

    #[test]
    fn permutation_values_are_clamped() {
        let tensor = NodeTensor::new(&[2, 3], DataType::F32).with_permutation(&[9, 0]);
        let mut entries = Vec::new();
        pack_tensor(&tensor, false, &mut entries);
        assert_eq!(entries[0].permutation[..3], [5, 0, 2]);
    }

    #[test]
    fn special_cased_identifiers_adjust_the_block() {
        let request = InstantiationRequest::new(LOG_SIGMA_EXP_IDENTIFIER, 1)
            .input(NodeTensor::new(&[8, 8], DataType::I32))
            .output(NodeTensor::new(&[8, 8], DataType::I32));
        let prepared = PreparedParams::build(&request, settings())
            .unwrap_or_else(|err| panic!("unexpected error: {err}"));
        assert_eq!(prepared.outputs()[0].geometry.dims, 1);

        let request = InstantiationRequest::new(AVERAGE_POOLING_IDENTIFIER, 2)
            .input(NodeTensor::new(&[8], DataType::I8));
        let prepared = PreparedParams::build(&request, settings())
            .unwrap_or_else(|err| panic!("unexpected error: {err}"));
        assert_eq!(prepared.params().debug_flags, 1);

        let request = InstantiationRequest::new(NOP_IDENTIFIER, 3);
        let prepared = PreparedParams::build(&request, settings())
            .unwrap_or_else(|err| panic!("unexpected error: {err}"));
        assert_eq!(prepared.params().input_tensor_nr, 1);
        assert_eq!(prepared.inputs()[0].geometry.data_type, DataType::F32);
    }

    #[test]
    fn inconsistent_min_sizes_are_a_contract_violation() {
        let request = InstantiationRequest::new("add_f32", 1)
            .input(NodeTensor::new(&[8, 8], DataType::F32).with_min_sizes(&[1]));
        let err = PreparedParams::build(&request, settings()).expect_err("should be rejected");
        assert!(matches!(err, GlueError::Contract { .. }));
    }
}
