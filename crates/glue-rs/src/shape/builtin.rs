//! Shape functions compiled into the crate.
//!
//! These run on the compiler side for operations whose shape math does not depend on any plug-in:
//! pass-through ops, reductions, splits, and fused kernels whose output shape is described by an
//! equation string emitted by the fuser. They follow the plug-in convention of reporting status as
//! a [`GlueCodeReturn`] and only ever read and write `max_sizes`; callers computing lower bounds
//! swap the min side in before the call.

use crate::abi::{GlueCodeReturn, TensorGeometry, MAX_TENSOR_DIM};
use crate::device::DeviceClass;

use super::io::{SifOutputs, SifParams, SmfOutputs, SmfParams};
use super::key::{ShapeFunctionKey, ShapeOrigin};
use super::registry::{CoreInferenceFn, CoreManipulationFn, ShapeFunction, ShapeFunctionRegistry};

/// Version recorded for every compiled-in shape function.
pub const CORE_SHAPE_FUNCTION_VERSION: u64 = 1;

pub const IDENTITY_SIF: u64 = 0;
pub const COPY_INPUT_SHAPE_SIF: u64 = 1;
pub const REDUCTION_SIF: u64 = 2;
pub const SPLIT_SIF: u64 = 3;
pub const SPLIT_FUSED_SIF: u64 = 4;

pub const DYNAMIC_EXECUTION_SMF: u64 = 0;
pub const PATCH_SIZES_SMF: u64 = 1;

const SPLIT_HEADER_BYTES: usize = 8;

type SifStatus = Result<(), GlueCodeReturn>;

pub fn core_inference_key(id: u64) -> ShapeFunctionKey {
    ShapeFunctionKey::new(ShapeOrigin::CoreInference, id)
}

pub fn core_manipulation_key(id: u64) -> ShapeFunctionKey {
    ShapeFunctionKey::new(ShapeOrigin::CoreManipulation, id)
}

const CORE_INFERENCE: [(u64, &str, CoreInferenceFn); 5] = [
    (IDENTITY_SIF, "identity", identity),
    (COPY_INPUT_SHAPE_SIF, "copy_input_shape", copy_input_shape),
    (REDUCTION_SIF, "reduction", reduction),
    (SPLIT_SIF, "split", split),
    (SPLIT_FUSED_SIF, "split_fused", split_fused),
];

const CORE_MANIPULATION: [(u64, &str, CoreManipulationFn); 2] = [
    (DYNAMIC_EXECUTION_SMF, "dynamic_execution", dynamic_execution),
    (PATCH_SIZES_SMF, "patch_sizes", patch_sizes),
];

pub(crate) fn register_core_functions(registry: &mut ShapeFunctionRegistry) {
    let inference = CORE_INFERENCE.iter().map(|(id, name, func)| {
        (
            core_inference_key(*id),
            *name,
            ShapeFunction::Inference(*func),
        )
    });
    let manipulation = CORE_MANIPULATION.iter().map(|(id, name, func)| {
        (
            core_manipulation_key(*id),
            *name,
            ShapeFunction::Manipulation(*func),
        )
    });
    for (key, name, function) in inference.chain(manipulation) {
        if let Err(err) = registry.register(key, function, name, CORE_SHAPE_FUNCTION_VERSION) {
            tracing::error!(key = %key, error = %err, "failed to register core shape function");
        }
    }
}

fn status(result: SifStatus) -> GlueCodeReturn {
    match result {
        Ok(()) => GlueCodeReturn::SUCCESS,
        Err(code) => code,
    }
}

fn require_inputs(routine: &str, params: &SifParams, valid: bool) -> SifStatus {
    if valid {
        return Ok(());
    }
    tracing::error!(
        routine,
        inputs = params.inputs.len(),
        "invalid number of input tensors"
    );
    Err(GlueCodeReturn::INCOMPATIBLE_INPUT_COUNT)
}

fn require_outputs(
    routine: &str,
    params: &SifParams,
    outputs: &SifOutputs,
    valid: bool,
) -> SifStatus {
    if valid && outputs.outputs.len() >= params.output_count {
        return Ok(());
    }
    tracing::error!(
        routine,
        outputs = params.output_count,
        "invalid number of output tensors"
    );
    Err(GlueCodeReturn::INCOMPATIBLE_OUTPUT_COUNT)
}

fn require_rank(routine: &str, actual: u32, expected: u32) -> SifStatus {
    if actual == expected {
        return Ok(());
    }
    tracing::error!(routine, expected, actual, "unexpected tensor rank");
    Err(GlueCodeReturn::FAILED)
}

fn copy_max_sizes(
    routine: &str,
    source: &TensorGeometry,
    target: &mut TensorGeometry,
) -> SifStatus {
    require_rank(routine, target.dims, source.dims)?;
    target.max_sizes = source.max_sizes;
    Ok(())
}

/// Output 0 takes input 0's shape; with two inputs the second one is a shape tensor and wins.
pub fn identity(
    device: DeviceClass,
    params: &SifParams,
    outputs: &mut SifOutputs,
) -> GlueCodeReturn {
    if params.inputs.len() != 2 {
        return copy_input_shape(device, params, outputs);
    }
    status(identity_from_shape_tensor(params, outputs))
}

fn identity_from_shape_tensor(params: &SifParams, outputs: &mut SifOutputs) -> SifStatus {
    require_outputs("identity", params, outputs, params.output_count == 1)?;
    copy_max_sizes("identity", &params.inputs[1], &mut outputs.outputs[0])
}

pub fn copy_input_shape(
    _device: DeviceClass,
    params: &SifParams,
    outputs: &mut SifOutputs,
) -> GlueCodeReturn {
    status(copy_input_shape_impl(params, outputs))
}

fn copy_input_shape_impl(params: &SifParams, outputs: &mut SifOutputs) -> SifStatus {
    require_inputs("copy_input_shape", params, params.inputs.len() == 1)?;
    require_outputs("copy_input_shape", params, outputs, params.output_count == 1)?;
    copy_max_sizes("copy_input_shape", &params.inputs[0], &mut outputs.outputs[0])
}

/// Keeps the input's sizes; the reduced dimension is already 1 in the declared output.
pub fn reduction(
    _device: DeviceClass,
    params: &SifParams,
    outputs: &mut SifOutputs,
) -> GlueCodeReturn {
    status(reduction_impl(params, outputs))
}

fn reduction_impl(params: &SifParams, outputs: &mut SifOutputs) -> SifStatus {
    require_inputs("reduction", params, !params.inputs.is_empty())?;
    require_outputs("reduction", params, outputs, params.output_count == 1)?;
    outputs.outputs[0].max_sizes = params.inputs[0].max_sizes;
    Ok(())
}

/// Split metadata: `axis: u32`, `count: u32`, then `count` little-endian `u64` sizes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SplitMetadata {
    pub axis: u32,
    pub sizes: Vec<u64>,
}

impl SplitMetadata {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(SPLIT_HEADER_BYTES + self.sizes.len() * 8);
        bytes.extend_from_slice(&self.axis.to_le_bytes());
        bytes.extend_from_slice(&(self.sizes.len() as u32).to_le_bytes());
        for size in &self.sizes {
            bytes.extend_from_slice(&size.to_le_bytes());
        }
        bytes
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let axis = u32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?);
        let count = u32::from_le_bytes(bytes.get(4..8)?.try_into().ok()?) as usize;
        let body = &bytes[SPLIT_HEADER_BYTES..];
        if body.len() != count.checked_mul(8)? {
            return None;
        }
        let sizes = body
            .chunks_exact(8)
            .map(|chunk| {
                let mut word = [0u8; 8];
                word.copy_from_slice(chunk);
                u64::from_le_bytes(word)
            })
            .collect();
        Some(Self { axis, sizes })
    }
}

pub fn split(_device: DeviceClass, params: &SifParams, outputs: &mut SifOutputs) -> GlueCodeReturn {
    status(split_impl(params, outputs))
}

fn split_impl(params: &SifParams, outputs: &mut SifOutputs) -> SifStatus {
    require_inputs("split", params, params.inputs.len() == 1)?;
    require_outputs("split", params, outputs, params.output_count >= 1)?;
    let Some(metadata) = SplitMetadata::parse(&params.node_params) else {
        tracing::error!(
            size = params.node_params.len(),
            "malformed split metadata"
        );
        return Err(GlueCodeReturn::MISSING_PRIVATE_STRUCTURE);
    };

    let input = &params.inputs[0];
    let axis = metadata.axis as usize;
    if axis >= input.rank() {
        tracing::error!(axis, rank = input.rank(), "split axis out of range");
        return Err(GlueCodeReturn::FAILED);
    }

    let count = params.output_count;
    let axis_size = input.max_sizes[axis];
    let produced = &mut outputs.outputs[..count];

    // Splitting the last axis into unit slices may drop that axis from every output.
    let drops_axis = axis_size == count as u64
        && axis + 1 == input.rank()
        && produced.iter().all(|output| output.rank() + 1 == input.rank());
    if drops_axis {
        for output in produced.iter_mut() {
            output.max_sizes[..axis].copy_from_slice(&input.max_sizes[..axis]);
        }
        return Ok(());
    }

    let mut allocated = 0u64;
    for (index, output) in produced.iter_mut().enumerate() {
        require_rank("split", output.dims, input.dims)?;
        output.max_sizes[..input.rank()].copy_from_slice(input.max_dims());
        let requested = metadata.sizes.get(index).copied().unwrap_or(0);
        let size = requested.min(axis_size.saturating_sub(allocated));
        output.max_sizes[axis] = size;
        allocated += size;
    }
    Ok(())
}

/// Evaluates the output-shape equation carried in `node_params` (see [`evaluate_split_fused`]).
pub fn split_fused(
    _device: DeviceClass,
    params: &SifParams,
    outputs: &mut SifOutputs,
) -> GlueCodeReturn {
    status(split_fused_impl(params, outputs))
}

fn split_fused_impl(params: &SifParams, outputs: &mut SifOutputs) -> SifStatus {
    require_inputs("split_fused", params, !params.inputs.is_empty())?;
    require_outputs("split_fused", params, outputs, params.output_count > 0)?;
    let equation_bytes = params
        .node_params
        .split(|byte| *byte == 0)
        .next()
        .unwrap_or_default();
    let equation = std::str::from_utf8(equation_bytes).map_err(|_| {
        tracing::error!("split-fused equation is not valid UTF-8");
        GlueCodeReturn::MISSING_PRIVATE_STRUCTURE
    })?;
    evaluate_split_fused(
        equation,
        &params.inputs,
        &mut outputs.outputs[..params.output_count],
    )
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EquationOp {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
    CeilDiv,
    Max,
    Min,
    Pow,
}

impl EquationOp {
    fn parse(symbol: char) -> Option<Self> {
        Some(match symbol {
            '+' => EquationOp::Add,
            '-' => EquationOp::Sub,
            '*' => EquationOp::Mul,
            '/' => EquationOp::Div,
            '\\' => EquationOp::CeilDiv,
            '>' => EquationOp::Max,
            '<' => EquationOp::Min,
            '^' => EquationOp::Pow,
            _ => return None,
        })
    }

    fn apply(self, lhs: u64, rhs: u64) -> Option<u64> {
        match self {
            EquationOp::Assign => Some(rhs),
            EquationOp::Add => lhs.checked_add(rhs),
            EquationOp::Sub => lhs.checked_sub(rhs),
            EquationOp::Mul => lhs.checked_mul(rhs),
            EquationOp::Div => lhs.checked_div(rhs),
            EquationOp::CeilDiv => (rhs != 0).then(|| lhs.div_ceil(rhs)),
            EquationOp::Max => Some(lhs.max(rhs)),
            EquationOp::Min => Some(lhs.min(rhs)),
            EquationOp::Pow => lhs.checked_pow(u32::try_from(rhs).ok()?),
        }
    }
}

/// Interprets a fused-kernel shape equation.
///
/// Label `a..z` followed by an input index reads that dimension of that input (`b1` is dimension 1
/// of input 1); bare integers are constants. Operators apply strictly left to right with no
/// precedence. `,` closes a dimension and `;` closes an output tensor; the end of the string closes
/// both. Example: `a0*2,b0+b1;c0\2` produces a rank-2 and a rank-1 output.
pub fn evaluate_split_fused(
    equation: &str,
    inputs: &[TensorGeometry],
    outputs: &mut [TensorGeometry],
) -> SifStatus {
    let fail = |reason: &str| {
        tracing::error!(equation, reason, "cannot evaluate split-fused equation");
        GlueCodeReturn::FAILED
    };

    let bytes = equation.as_bytes();
    let mut pos = 0;
    let mut out = 0usize;
    let mut dim = 0usize;
    let mut size = 0u64;
    let mut op = EquationOp::Assign;

    while pos < bytes.len() {
        let symbol = bytes[pos] as char;
        if symbol.is_ascii_lowercase() {
            pos += 1;
            let (input, next) = read_number(bytes, pos);
            if next == pos {
                return Err(fail("label without an input index"));
            }
            pos = next;
            let label_dim = (symbol as u8 - b'a') as usize;
            let operand = inputs
                .get(input as usize)
                .filter(|geometry| label_dim < geometry.rank())
                .map(|geometry| geometry.max_sizes[label_dim])
                .ok_or_else(|| fail("label refers to a missing input dimension"))?;
            size = op.apply(size, operand).ok_or_else(|| fail("arithmetic overflow"))?;
        } else if symbol.is_ascii_digit() {
            let (constant, next) = read_number(bytes, pos);
            pos = next;
            size = op.apply(size, constant).ok_or_else(|| fail("arithmetic overflow"))?;
        } else {
            match symbol {
                ',' => {
                    close_dim(equation, outputs, out, &mut dim, size)?;
                }
                ';' => {
                    close_dim(equation, outputs, out, &mut dim, size)?;
                    out += 1;
                    dim = 0;
                }
                _ => {
                    op = EquationOp::parse(symbol).ok_or_else(|| fail("unknown operator"))?;
                    pos += 1;
                    continue;
                }
            }
            size = 0;
            op = EquationOp::Assign;
            pos += 1;
        }
    }
    close_dim(equation, outputs, out, &mut dim, size)
}

fn close_dim(
    equation: &str,
    outputs: &mut [TensorGeometry],
    out: usize,
    dim: &mut usize,
    size: u64,
) -> SifStatus {
    let Some(output) = outputs.get_mut(out) else {
        tracing::error!(equation, out, "equation names more outputs than the node has");
        return Err(GlueCodeReturn::INCOMPATIBLE_OUTPUT_COUNT);
    };
    if *dim >= MAX_TENSOR_DIM {
        tracing::error!(equation, out, "equation exceeds the maximum tensor rank");
        return Err(GlueCodeReturn::FAILED);
    }
    output.max_sizes[*dim] = size;
    *dim += 1;
    output.dims = *dim as u32;
    Ok(())
}

fn read_number(bytes: &[u8], start: usize) -> (u64, usize) {
    let mut value = 0u64;
    let mut pos = start;
    while let Some(digit) = bytes.get(pos).filter(|byte| byte.is_ascii_digit()) {
        value = value.saturating_mul(10).saturating_add(u64::from(digit - b'0'));
        pos += 1;
    }
    (value, pos)
}

/// Bypasses execution when any output is empty.
pub fn dynamic_execution(params: &SmfParams<'_>, outputs: &mut SmfOutputs) {
    outputs.should_bypass = params
        .outputs
        .iter()
        .any(|output| output.max_dims().contains(&0));
}

/// Patches output 0's sizes into the kernel's descriptors.
pub fn patch_sizes(params: &SmfParams<'_>, outputs: &mut SmfOutputs) {
    outputs.patch_values = params
        .outputs
        .first()
        .map(|output| {
            output
                .max_dims()
                .iter()
                .map(|size| u32::try_from(*size).unwrap_or(u32::MAX))
                .collect()
        })
        .unwrap_or_default();
    outputs.should_bypass = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::DataType;

    fn geometry(sizes: &[u64]) -> TensorGeometry {
        TensorGeometry::fixed(sizes, DataType::F32)
    }

    #[test]
    fn split_clamps_sizes_to_remaining_extent() {
        let params = SifParams {
            inputs: vec![geometry(&[4, 10])],
            node_params: SplitMetadata {
                axis: 1,
                sizes: vec![6, 6],
            }
            .to_bytes(),
            output_count: 2,
            ..SifParams::default()
        };
        let mut outputs = SifOutputs::from_declared(vec![geometry(&[4, 6]), geometry(&[4, 6])]);
        assert_eq!(
            split(DeviceClass::Gaudi2, &params, &mut outputs),
            GlueCodeReturn::SUCCESS
        );
        assert_eq!(outputs.outputs[0].max_dims(), [4, 6]);
        assert_eq!(outputs.outputs[1].max_dims(), [4, 4]);
    }

    #[test]
    fn split_into_unit_slices_may_drop_the_last_axis() {
        let params = SifParams {
            inputs: vec![geometry(&[10, 5, 2])],
            node_params: SplitMetadata {
                axis: 2,
                sizes: vec![1, 1],
            }
            .to_bytes(),
            output_count: 2,
            ..SifParams::default()
        };
        let mut outputs = SifOutputs::from_declared(vec![geometry(&[1, 1]), geometry(&[1, 1])]);
        assert_eq!(
            split(DeviceClass::Gaudi2, &params, &mut outputs),
            GlueCodeReturn::SUCCESS
        );
        assert_eq!(outputs.outputs[1].max_dims(), [10, 5]);
    }

    #[test]
    fn split_rejects_truncated_metadata() {
        let params = SifParams {
            inputs: vec![geometry(&[4])],
            node_params: vec![0, 0, 0, 0, 2, 0, 0, 0],
            output_count: 1,
            ..SifParams::default()
        };
        let mut outputs = SifOutputs::from_declared(vec![geometry(&[4])]);
        assert_eq!(
            split(DeviceClass::Gaudi2, &params, &mut outputs),
            GlueCodeReturn::MISSING_PRIVATE_STRUCTURE
        );
    }

    #[test]
    fn equation_applies_operators_left_to_right() {
        let inputs = [geometry(&[3, 8, 7]), geometry(&[2, 4, 7])];
        let mut outputs = [TensorGeometry::default(), TensorGeometry::default()];
        evaluate_split_fused("a0*2+1,b0+b1;c0\\2,c1>9<20", &inputs, &mut outputs)
            .unwrap_or_else(|code| panic!("unexpected status: {code}"));
        assert_eq!(outputs[0].max_dims(), [7, 12]);
        assert_eq!(outputs[1].max_dims(), [4, 9]);
    }

    #[test]
    fn equation_reports_missing_dimensions_and_outputs() {
        let inputs = [geometry(&[3])];
        let mut outputs = [TensorGeometry::default()];
        assert_eq!(
            evaluate_split_fused("b0", &inputs, &mut outputs),
            Err(GlueCodeReturn::FAILED)
        );
        assert_eq!(
            evaluate_split_fused("a0;a0", &inputs, &mut outputs),
            Err(GlueCodeReturn::INCOMPATIBLE_OUTPUT_COUNT)
        );
        assert_eq!(
            evaluate_split_fused("a0/0", &inputs, &mut outputs),
            Err(GlueCodeReturn::FAILED)
        );
    }

    #[test]
    fn identity_prefers_the_shape_tensor() {
        let params = SifParams {
            inputs: vec![geometry(&[8, 8]), geometry(&[2, 3])],
            output_count: 1,
            ..SifParams::default()
        };
        let mut outputs = SifOutputs::from_declared(vec![geometry(&[1, 1])]);
        assert_eq!(
            identity(DeviceClass::Gaudi, &params, &mut outputs),
            GlueCodeReturn::SUCCESS
        );
        assert_eq!(outputs.outputs[0].max_dims(), [2, 3]);
    }

    #[test]
    fn manipulation_routines_bypass_empty_outputs_and_patch_sizes() {
        let empty = [geometry(&[4, 0])];
        let full = [geometry(&[4, 2])];
        let mut outputs = SmfOutputs::default();
        let params = SmfParams {
            inputs: &[],
            outputs: &empty,
            metadata: &[],
            in_patch_values: &[],
        };
        dynamic_execution(&params, &mut outputs);
        assert!(outputs.should_bypass);

        let params = SmfParams {
            outputs: &full,
            ..params
        };
        dynamic_execution(&params, &mut outputs);
        assert!(!outputs.should_bypass);
        patch_sizes(&params, &mut outputs);
        assert_eq!(outputs.patch_values, [4, 2]);
    }
}
