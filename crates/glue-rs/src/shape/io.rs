//! Owned inputs and outputs of shape functions, and their translation to the plug-in ABI.

use std::ffi::c_void;
use std::ptr;

use crate::abi::{
    GetShapeInferenceFn, GlueCodeReturn, NodeTensorPermutation, ShapeInferenceOutput,
    ShapeInferenceParams, TensorGeometry, TensorShapeInfo, UserParams, GLUE_API_VERSION,
};
use crate::device::DeviceClass;
use crate::identifier::OperationIdentifier;

/// Input of a shape-inference call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SifParams {
    pub node_id: u64,
    pub inputs: Vec<TensorGeometry>,
    /// Operation-specific parameter block, passed through untouched.
    pub node_params: Vec<u8>,
    pub output_count: usize,
    pub input_permutations: Option<Vec<NodeTensorPermutation>>,
    pub output_permutations: Option<Vec<NodeTensorPermutation>>,
    pub max_available_tpc: u32,
}

/// Result of a shape-inference call: one geometry per output plus a bitmask of outputs whose
/// shape could not be determined.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SifOutputs {
    pub outputs: Vec<TensorGeometry>,
    pub invalid_mask: Vec<u32>,
}

impl SifOutputs {
    pub fn new(output_count: usize) -> Self {
        Self::from_declared(vec![TensorGeometry::default(); output_count])
    }

    /// Starts from the shapes the graph already declares for the outputs; routines that validate
    /// ranks compare against these.
    pub fn from_declared(outputs: Vec<TensorGeometry>) -> Self {
        let words = mask_words(outputs.len());
        Self {
            outputs,
            invalid_mask: vec![0; words],
        }
    }

    pub fn invalidate(&mut self, index: usize) {
        invalidate_tensor(index, &mut self.invalid_mask);
    }

    pub fn is_invalid(&self, index: usize) -> bool {
        is_tensor_invalid(index, &self.invalid_mask)
    }

    fn reserve_outputs(&mut self, output_count: usize) {
        if self.outputs.len() < output_count {
            self.outputs.resize(output_count, TensorGeometry::default());
        }
        let words = mask_words(output_count);
        if self.invalid_mask.len() < words {
            self.invalid_mask.resize(words, 0);
        }
    }
}

fn mask_words(count: usize) -> usize {
    count.div_ceil(32).max(1)
}

/// Sets bit `index % 32` of word `index / 32`, growing the mask when needed.
pub fn invalidate_tensor(index: usize, mask: &mut Vec<u32>) {
    let word = index / 32;
    if mask.len() <= word {
        mask.resize(word + 1, 0);
    }
    mask[word] |= 1 << (index % 32);
}

pub fn is_tensor_invalid(index: usize, mask: &[u32]) -> bool {
    mask.get(index / 32)
        .is_some_and(|word| word & (1 << (index % 32)) != 0)
}

/// Input of a shape-manipulation call.
#[derive(Clone, Copy, Debug)]
pub struct SmfParams<'a> {
    pub inputs: &'a [TensorGeometry],
    pub outputs: &'a [TensorGeometry],
    pub metadata: &'a [u8],
    pub in_patch_values: &'a [u32],
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SmfOutputs {
    pub patch_values: Vec<u32>,
    pub should_bypass: bool,
}

/// Runs a plug-in shape-inference entry point over owned buffers and copies the results back.
pub(crate) fn call_plugin_shape_inference(
    entry: GetShapeInferenceFn,
    device: DeviceClass,
    identifier: &OperationIdentifier,
    params: &SifParams,
    outputs: &mut SifOutputs,
) -> GlueCodeReturn {
    outputs.reserve_outputs(params.output_count);

    let mut input_infos: Vec<TensorShapeInfo> = params
        .inputs
        .iter()
        .map(|geometry| TensorShapeInfo {
            geometry: *geometry,
            ..TensorShapeInfo::default()
        })
        .collect();
    let mut output_infos: Vec<TensorShapeInfo> = outputs.outputs[..params.output_count]
        .iter()
        .map(|geometry| TensorShapeInfo {
            geometry: *geometry,
            ..TensorShapeInfo::default()
        })
        .collect();
    let mut input_ptrs: Vec<*mut TensorShapeInfo> = input_infos
        .iter_mut()
        .map(|info| info as *mut TensorShapeInfo)
        .collect();
    let mut output_ptrs: Vec<*mut TensorShapeInfo> = output_infos
        .iter_mut()
        .map(|info| info as *mut TensorShapeInfo)
        .collect();

    let mut node_params = params.node_params.clone();
    let mut input_permutations = params.input_permutations.clone();
    let mut output_permutations = params.output_permutations.clone();
    let mut guid = identifier.to_guid_info();

    let abi_params = ShapeInferenceParams {
        api_version: GLUE_API_VERSION,
        unique_node_id: params.node_id,
        guid,
        input_tensors: input_ptrs.as_mut_ptr(),
        input_tensors_nr: params.inputs.len() as u32,
        node_params: UserParams {
            node_params: if node_params.is_empty() {
                ptr::null_mut()
            } else {
                node_params.as_mut_ptr().cast::<c_void>()
            },
            node_params_size: node_params.len() as u32,
        },
        output_tensors_nr: params.output_count as u32,
        input_permutations: permutation_ptr(&mut input_permutations),
        output_permutations: permutation_ptr(&mut output_permutations),
        p_guid: &mut guid,
        max_available_tpc: params.max_available_tpc,
        reserved: [0; 3],
    };
    let mut abi_output = ShapeInferenceOutput {
        output_tensors: output_ptrs.as_mut_ptr(),
        invalid_mask: outputs.invalid_mask.as_mut_ptr(),
        reserved: [0; 6],
    };

    // SAFETY: Every pointer in the parameter blocks refers to a local buffer that outlives the
    // call, and the counts match the buffers' lengths.
    let code = unsafe { entry(device.raw(), &abi_params, &mut abi_output) };

    for (geometry, info) in outputs.outputs.iter_mut().zip(&output_infos) {
        *geometry = info.geometry;
    }
    code
}

fn permutation_ptr(
    permutations: &mut Option<Vec<NodeTensorPermutation>>,
) -> *mut NodeTensorPermutation {
    match permutations {
        Some(values) if !values.is_empty() => values.as_mut_ptr(),
        _ => ptr::null_mut(),
    }
}
