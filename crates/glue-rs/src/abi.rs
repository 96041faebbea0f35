//! Plug-in calling convention.
//!
//! Every type in this module crosses the compiler/plug-in boundary and mirrors the C header that
//! glue-code libraries are built against. Field order, widths and padding are load-bearing: do not
//! reorder fields or replace the raw bit-field words with Rust enums here. Safe, idiomatic views of
//! these structures live next to their users (`shape`, `session`).

use std::ffi::{c_char, c_void};
use std::fmt;

/// Array length used by every per-dimension field of the ABI.
pub const MAX_TENSOR_DIM: usize = 25;
/// Rank carried by a single tensor descriptor entry; higher ranks span several entries.
pub const MAX_DIMS_PER_ENTRY: usize = 5;
pub const MAX_NODE_NAME: usize = 64;
pub const MAX_SCALAR_PARAMS: usize = 32;
pub const MAX_INDEX_SPACE_DIM_SIZE: usize = 5;
/// Upper bound on auxiliary tensors and on entries of a manipulation suggestion.
pub const MAX_TENSOR_NR: usize = 16;
/// `apiVersion` written into every parameter block.
pub const GLUE_API_VERSION: i32 = 1;

pub const KERNEL_GUIDS_ENTRY_POINT: &[u8] = b"GetKernelGuids\0";
pub const KERNEL_INSTANTIATION_ENTRY_POINT: &[u8] = b"InstantiateTpcKernel\0";
pub const SUPPORTED_DATA_LAYOUTS_ENTRY_POINT: &[u8] = b"GetSupportedDataLayouts\0";
pub const SUGGESTED_MANIPULATION_ENTRY_POINT: &[u8] = b"GetSuggestedTensorManipulation\0";
pub const SHAPE_INFERENCE_ENTRY_POINT: &[u8] = b"GetShapeInference\0";
pub const LIB_VERSION_ENTRY_POINT: &[u8] = b"GetLibVersion\0";
pub const FUNCTIONAL_COMPLEX_GUIDS_ENTRY_POINT: &[u8] = b"GetFunctionalComplexGuids\0";
pub const PERFORMANCE_COMPLEX_GUIDS_ENTRY_POINT: &[u8] = b"GetPerformanceComplexGuids\0";

/// Raw `DeviceId` as passed to entry points.
pub type RawDeviceId = u32;

/// Status returned by every plug-in entry point.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlueCodeReturn(pub i32);

impl GlueCodeReturn {
    pub const SUCCESS: Self = Self(0);
    pub const NODE_NOT_FOUND: Self = Self(1);
    pub const INSUFFICIENT_ISA_BUFFER: Self = Self(2);
    pub const INCOMPATIBLE_INPUT_COUNT: Self = Self(3);
    pub const INCOMPATIBLE_INPUT_SIZE: Self = Self(4);
    pub const INCOMPATIBLE_OUTPUT_COUNT: Self = Self(5);
    pub const INCOMPATIBLE_OUTPUT_SIZE: Self = Self(6);
    pub const INCOMPATIBLE_DATA_TYPE: Self = Self(7);
    pub const UNSUPPORTED_LAYER_CONFIGURATION: Self = Self(8);
    pub const INSUFFICIENT_AUX_BUFFER_SIZE: Self = Self(9);
    pub const UNSUPPORTED_QUANT_PARAMS: Self = Self(10);
    pub const UNSUPPORTED_BROADCAST_MODE: Self = Self(11);
    pub const UNSUPPORTED_API_VERSION: Self = Self(12);
    pub const NON_STATIC_INPUT_TENSOR: Self = Self(13);
    pub const KERNEL_REQUIRE_REDUCIBLE_TENSOR: Self = Self(14);
    pub const INVALID_SHAPE_INFERENCE_ID: Self = Self(15);
    pub const KERNEL_INVALID_SCALAR_ARGUMENT: Self = Self(16);
    pub const UNSUPPORTED_LOW_FCD_INPUT: Self = Self(17);
    pub const INSUFFICIENT_ELF_BUFFER: Self = Self(18);
    pub const MISSING_PRIVATE_STRUCTURE: Self = Self(19);
    pub const UNSUPPORTED_5D_TENSORS: Self = Self(20);
    pub const CGUID_GRAPH_UNCHANGED: Self = Self(21);
    pub const SIF_NULL_PTR: Self = Self(22);
    pub const UNSUPPORTED_DYNAMIC_SHAPE: Self = Self(23);
    pub const UNSUPPORTED_HUGE_TENSORS: Self = Self(24);
    pub const FAILED: Self = Self(400);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "GLUE_SUCCESS",
            1 => "GLUE_NODE_NOT_FOUND",
            2 => "GLUE_INSUFFICIENT_ISA_BUFFER",
            3 => "GLUE_INCOMPATIBLE_INPUT_COUNT",
            4 => "GLUE_INCOMPATIBLE_INPUT_SIZE",
            5 => "GLUE_INCOMPATIBLE_OUTPUT_COUNT",
            6 => "GLUE_INCOMPATIBLE_OUTPUT_SIZE",
            7 => "GLUE_INCOMPATIBLE_DATA_TYPE",
            8 => "GLUE_UNSUPPORTED_LAYER_CONFIGURATION",
            9 => "GLUE_INSUFFICIENT_AUX_BUFFER_SIZE",
            10 => "GLUE_UNSUPPORTED_QUANT_PARAMS",
            11 => "GLUE_UNSUPPORTED_BROADCAST_MODE",
            12 => "GLUE_UNSUPPORTED_API_VERSION",
            13 => "GLUE_NON_STATIC_INPUT_TENSOR",
            14 => "GLUE_KERNEL_REQUIRE_REDUCIBLE_TENSOR",
            15 => "GLUE_INVALID_SHAPE_INFERENCE_ID",
            16 => "GLUE_KERNEL_INVALID_SCALAR_ARGUMENT",
            17 => "GLUE_UNSUPPORTED_LOW_FCD_INPUT",
            18 => "GLUE_INSUFFICIENT_ELF_BUFFER",
            19 => "GLUE_MISSING_PRIVATE_STRUCTURE",
            20 => "GLUE_UNSUPPORTED_5D_TENSORS",
            21 => "GLUE_CGUID_GRAPH_UNCHANGED",
            22 => "GLUE_SIF_NULL_PTR",
            23 => "GLUE_UNSUPPORTED_DYNAMIC_SHAPE",
            24 => "GLUE_UNSUPPORTED_HUGE_TENSORS",
            400 => "GLUE_FAILED",
            _ => "UNKNOWN RETURN VALUE",
        }
    }
}

impl fmt::Debug for GlueCodeReturn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

impl fmt::Display for GlueCodeReturn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Element type bit flag (`TensorDataType`).
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DataType(pub u32);

impl DataType {
    pub const I4: Self = Self(1 << 0);
    pub const U4: Self = Self(1 << 1);
    pub const I8: Self = Self(1 << 2);
    pub const U8: Self = Self(1 << 3);
    pub const F8_152: Self = Self(1 << 4);
    pub const F8_143: Self = Self(1 << 5);
    pub const I16: Self = Self(1 << 6);
    pub const U16: Self = Self(1 << 7);
    pub const BF16: Self = Self(1 << 8);
    pub const F16: Self = Self(1 << 9);
    pub const I32: Self = Self(1 << 10);
    pub const U32: Self = Self(1 << 11);
    pub const F32: Self = Self(1 << 12);
    pub const I64: Self = Self(1 << 13);
    pub const U64: Self = Self(1 << 14);

    /// Storage width in bits, `None` for values that are not a single known flag.
    pub fn bit_width(self) -> Option<u64> {
        let bits = match self {
            Self::I4 | Self::U4 => 4,
            Self::I8 | Self::U8 | Self::F8_152 | Self::F8_143 => 8,
            Self::I16 | Self::U16 | Self::BF16 | Self::F16 => 16,
            Self::I32 | Self::U32 | Self::F32 => 32,
            Self::I64 | Self::U64 => 64,
            _ => return None,
        };
        Some(bits)
    }

    /// Byte size of `elements` packed elements, rounding partial bytes up.
    pub fn byte_size(self, elements: u64) -> Option<u64> {
        let bits = self.bit_width()?;
        elements.checked_mul(bits).map(|total| total.div_ceil(8))
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TensorGeometry {
    pub dims: u32,
    pub max_sizes: [u64; MAX_TENSOR_DIM],
    pub min_sizes: [u64; MAX_TENSOR_DIM],
    pub data_type: DataType,
}

impl Default for TensorGeometry {
    fn default() -> Self {
        Self {
            dims: 0,
            max_sizes: [0; MAX_TENSOR_DIM],
            min_sizes: [0; MAX_TENSOR_DIM],
            data_type: DataType::default(),
        }
    }
}

impl TensorGeometry {
    /// Builds a geometry with identical min and max sizes.
    pub fn fixed(sizes: &[u64], data_type: DataType) -> Self {
        let mut geometry = Self {
            dims: sizes.len().min(MAX_TENSOR_DIM) as u32,
            data_type,
            ..Self::default()
        };
        for (dim, size) in sizes.iter().take(MAX_TENSOR_DIM).enumerate() {
            geometry.max_sizes[dim] = *size;
            geometry.min_sizes[dim] = *size;
        }
        geometry
    }

    pub fn max_dims(&self) -> &[u64] {
        &self.max_sizes[..self.rank()]
    }

    pub fn min_dims(&self) -> &[u64] {
        &self.min_sizes[..self.rank()]
    }

    pub fn rank(&self) -> usize {
        (self.dims as usize).min(MAX_TENSOR_DIM)
    }

    pub fn max_element_count(&self) -> Option<u64> {
        self.max_dims()
            .iter()
            .try_fold(1u64, |acc, dim| acc.checked_mul(*dim))
    }
}

/// `TensorQuantizationParam`. The leading byte is a C union of signed zero point, unsigned zero
/// point and fp8 exponent bias.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TensorQuantizationParam {
    pub zero_point: i8,
    pub scale: f64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TensorDataLayout {
    pub layout: [c_char; MAX_TENSOR_DIM],
}

impl TensorDataLayout {
    pub fn as_string(&self) -> String {
        c_chars_to_string(&self.layout)
    }
}

pub const TENSOR_FLAG_REDUCIBLE: u32 = 1 << 0;
pub const TENSOR_FLAG_NULL: u32 = 1 << 1;

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Tensor {
    pub geometry: TensorGeometry,
    pub quantization_param: TensorQuantizationParam,
    pub layout: TensorDataLayout,
    /// Bit 0: reducible, bit 1: null (optional operand not provided).
    pub flags: u32,
    pub p_data: *const c_void,
    pub permutation: [u32; MAX_TENSOR_DIM],
    pub reserved: [u32; 6],
}

impl Default for Tensor {
    fn default() -> Self {
        Self {
            geometry: TensorGeometry::default(),
            quantization_param: TensorQuantizationParam::default(),
            layout: TensorDataLayout::default(),
            flags: 0,
            p_data: std::ptr::null(),
            permutation: [0; MAX_TENSOR_DIM],
            reserved: [0; 6],
        }
    }
}

impl Tensor {
    pub fn reducible(&self) -> bool {
        self.flags & TENSOR_FLAG_REDUCIBLE != 0
    }

    pub fn set_reducible(&mut self, value: bool) {
        set_flag(&mut self.flags, TENSOR_FLAG_REDUCIBLE, value);
    }
}

pub const AUX_FLAG_SRAM_ALLOC: u32 = 1 << 0;
pub const AUX_FLAG_NO_INIT: u32 = 1 << 1;

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct AuxTensor {
    pub geometry: TensorGeometry,
    pub p_data: *mut c_void,
    /// In: capacity supplied by the compiler. Out: capacity the plug-in requires.
    pub buffer_size: u64,
    pub flags: u32,
    pub reserved: [u32; 6],
}

impl Default for AuxTensor {
    fn default() -> Self {
        Self {
            geometry: TensorGeometry::default(),
            p_data: std::ptr::null_mut(),
            buffer_size: 0,
            flags: 0,
            reserved: [0; 6],
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DimIndexSpaceMapping {
    pub index_space_dim: u32,
    pub a: f32,
    pub start_b: f32,
    pub end_b: f32,
    pub all_required: bool,
}

pub const ACCESS_ALL_REQUIRED: u32 = 1 << 0;
pub const ACCESS_MEMSET_BEFORE_EXECUTION: u32 = 1 << 1;
pub const ACCESS_INPUTS_REUSABILITY_SHIFT: u32 = 2;
pub const ACCESS_INPUTS_REUSABILITY_MASK: u32 = 0xffff << ACCESS_INPUTS_REUSABILITY_SHIFT;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TensorAccessPattern {
    /// Bit-field word: all-required, memset-before-execution, 16-bit input reusability mask,
    /// reusability binding, sparse access, no-RMW, fully-accessed-once, fully-written.
    pub value: u32,
    pub mapping: [DimIndexSpaceMapping; MAX_TENSOR_DIM],
    /// `ElementValue` union; every member fits in the low bytes of this word.
    pub memset_value: u64,
    pub reserved: [u32; 6],
}

impl Default for TensorAccessPattern {
    fn default() -> Self {
        Self {
            value: 0,
            mapping: [DimIndexSpaceMapping::default(); MAX_TENSOR_DIM],
            memset_value: 0,
            reserved: [0; 6],
        }
    }
}

impl TensorAccessPattern {
    pub fn all_required(&self) -> bool {
        self.value & ACCESS_ALL_REQUIRED != 0
    }

    pub fn memset_before_execution(&self) -> bool {
        self.value & ACCESS_MEMSET_BEFORE_EXECUTION != 0
    }

    pub fn inputs_reusability(&self) -> u16 {
        ((self.value & ACCESS_INPUTS_REUSABILITY_MASK) >> ACCESS_INPUTS_REUSABILITY_SHIFT) as u16
    }
}

/// `UniqueShapeInferenceHash`: 56-bit hash value in the low bits, 8-bit shared-object id above it.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct UniqueShapeInferenceHash(pub u64);

impl UniqueShapeInferenceHash {
    pub const HASH_BITS: u32 = 56;
    pub const HASH_MASK: u64 = (1u64 << Self::HASH_BITS) - 1;

    pub fn new(hash_value: u64, shared_object_id: u8) -> Self {
        Self((hash_value & Self::HASH_MASK) | (u64::from(shared_object_id) << Self::HASH_BITS))
    }

    pub fn hash_value(self) -> u64 {
        self.0 & Self::HASH_MASK
    }

    pub fn shared_object_id(self) -> u8 {
        (self.0 >> Self::HASH_BITS) as u8
    }
}

pub const KERNEL_SUPPORTS_DYNAMIC_SHAPES: u32 = 1 << 0;
pub const KERNEL_SUPPORTS_64BIT: u32 = 1 << 1;

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct GuidInfo {
    pub name: [c_char; MAX_NODE_NAME],
    pub name_hash: UniqueShapeInferenceHash,
    pub kernel_properties: u32,
}

impl Default for GuidInfo {
    fn default() -> Self {
        Self {
            name: [0; MAX_NODE_NAME],
            name_hash: UniqueShapeInferenceHash::default(),
            kernel_properties: 0,
        }
    }
}

impl GuidInfo {
    /// Builds an entry, truncating `name` to leave room for the terminating NUL.
    pub fn new(name: &str, name_hash: UniqueShapeInferenceHash, kernel_properties: u32) -> Self {
        let mut info = Self {
            name_hash,
            kernel_properties,
            ..Self::default()
        };
        write_c_chars(&mut info.name, name);
        info
    }

    pub fn name(&self) -> String {
        c_chars_to_string(&self.name)
    }

    pub fn supports_dynamic_shapes(&self) -> bool {
        self.kernel_properties & KERNEL_SUPPORTS_DYNAMIC_SHAPES != 0
    }

    pub fn supports_64bit(&self) -> bool {
        self.kernel_properties & KERNEL_SUPPORTS_64BIT != 0
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct UserParams {
    pub node_params: *mut c_void,
    pub node_params_size: u32,
}

impl Default for UserParams {
    fn default() -> Self {
        Self {
            node_params: std::ptr::null_mut(),
            node_params_size: 0,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct HabanaKernelParams {
    pub api_version: i32,
    pub device_id: RawDeviceId,
    pub guid: GuidInfo,
    pub node_params: UserParams,
    pub input_tensors: *mut Tensor,
    pub input_tensor_nr: u32,
    pub output_tensors: *mut Tensor,
    pub output_tensor_nr: u32,
    pub max_available_tpc: u32,
    pub use_deterministic: u32,
    pub unique_node_id: u64,
    pub debug_flags: u32,
    pub valid_input_tensors: u16,
    pub valid_output_tensors: u16,
    pub reserved: [u32; 24],
}

impl Default for HabanaKernelParams {
    fn default() -> Self {
        Self {
            api_version: 0,
            device_id: 0,
            guid: GuidInfo::default(),
            node_params: UserParams::default(),
            input_tensors: std::ptr::null_mut(),
            input_tensor_nr: 0,
            output_tensors: std::ptr::null_mut(),
            output_tensor_nr: 0,
            max_available_tpc: 0,
            use_deterministic: 0,
            unique_node_id: 0,
            debug_flags: 0,
            valid_input_tensors: 0,
            valid_output_tensors: 0,
            reserved: [0; 24],
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DeviceKernel {
    /// Host buffer receiving the kernel container, allocated by the compiler.
    pub kernel_elf: *mut c_void,
    /// In: capacity of `kernel_elf`. Out: size the plug-in needs.
    pub elf_size: u32,
    pub scalar_params: [u32; MAX_SCALAR_PARAMS],
    pub params_nr: u32,
}

impl Default for DeviceKernel {
    fn default() -> Self {
        Self {
            kernel_elf: std::ptr::null_mut(),
            elf_size: 0,
            scalar_params: [0; MAX_SCALAR_PARAMS],
            params_nr: 0,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct HabanaKernelInstantiation {
    pub index_space_rank: u32,
    pub index_space_geometry: [u64; MAX_INDEX_SPACE_DIM_SIZE],
    pub input_tensor_access_pattern: *mut TensorAccessPattern,
    pub output_tensor_access_pattern: *mut TensorAccessPattern,
    pub auxiliary_tensors: *mut AuxTensor,
    pub auxiliary_tensor_nr: u32,
    pub kernel: DeviceKernel,
    /// 0 disables the hint; otherwise `preferred_split_dim - 1` is the dimension to split.
    pub preferred_split_dim: u32,
    pub reserved: [u32; 15],
}

impl Default for HabanaKernelInstantiation {
    fn default() -> Self {
        Self {
            index_space_rank: 0,
            index_space_geometry: [0; MAX_INDEX_SPACE_DIM_SIZE],
            input_tensor_access_pattern: std::ptr::null_mut(),
            output_tensor_access_pattern: std::ptr::null_mut(),
            auxiliary_tensors: std::ptr::null_mut(),
            auxiliary_tensor_nr: 0,
            kernel: DeviceKernel::default(),
            preferred_split_dim: 0,
            reserved: [0; 15],
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct NodeDataLayouts {
    pub inputs: *mut TensorDataLayout,
    pub input_tensor_nr: u32,
    pub outputs: *mut TensorDataLayout,
    pub output_tensor_nr: u32,
    pub shape_tensors: *mut TensorDataLayout,
    pub shape_tensor_nr: u32,
}

pub const TENSOR_OP_NONE: u32 = 0;
pub const TENSOR_OP_TRANSPOSE: u32 = 1;
pub const TENSOR_OP_RESHAPE: u32 = 2;
pub const TENSOR_OP_TILE: u32 = 3;

/// `TensorOperation`; `values` is the permutation for transposes and the new shape for reshapes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TensorOperation {
    pub op_type: u32,
    pub values: [u32; MAX_TENSOR_DIM],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TensorManipulationSuggestion {
    pub input_tensors: [TensorOperation; MAX_TENSOR_NR],
    pub output_tensors: [TensorOperation; MAX_TENSOR_NR],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeTensorPermutation {
    pub permutation: [u32; MAX_TENSOR_DIM],
}

impl NodeTensorPermutation {
    pub fn identity() -> Self {
        let mut permutation = [0u32; MAX_TENSOR_DIM];
        for (dim, slot) in permutation.iter_mut().enumerate() {
            *slot = dim as u32;
        }
        Self { permutation }
    }

    pub fn is_identity(&self) -> bool {
        self.permutation
            .iter()
            .enumerate()
            .all(|(dim, value)| *value as usize == dim)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct TensorShapeInfo {
    pub geometry: TensorGeometry,
    /// Host copy of a shape tensor's content, may be null.
    pub host_address: *mut u32,
    pub reserved: [u32; 8],
}

impl Default for TensorShapeInfo {
    fn default() -> Self {
        Self {
            geometry: TensorGeometry::default(),
            host_address: std::ptr::null_mut(),
            reserved: [0; 8],
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ShapeInferenceParams {
    pub api_version: i32,
    pub unique_node_id: u64,
    pub guid: GuidInfo,
    pub input_tensors: *mut *mut TensorShapeInfo,
    pub input_tensors_nr: u32,
    pub node_params: UserParams,
    pub output_tensors_nr: u32,
    /// Null when every input permutation is the identity.
    pub input_permutations: *mut NodeTensorPermutation,
    pub output_permutations: *mut NodeTensorPermutation,
    pub p_guid: *mut GuidInfo,
    pub max_available_tpc: u32,
    pub reserved: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ShapeInferenceOutput {
    pub output_tensors: *mut *mut TensorShapeInfo,
    /// One bit per output, 32 outputs per word.
    pub invalid_mask: *mut u32,
    pub reserved: [u32; 6],
}

pub type GetKernelGuidsFn = unsafe extern "C" fn(
    device_id: RawDeviceId,
    kernel_count: *mut u32,
    guids: *mut GuidInfo,
) -> GlueCodeReturn;
pub type InstantiateFn = unsafe extern "C" fn(
    params: *const HabanaKernelParams,
    instance: *mut HabanaKernelInstantiation,
) -> GlueCodeReturn;
pub type GetSupportedDataLayoutsFn = unsafe extern "C" fn(
    params: *const HabanaKernelParams,
    supported_layouts: *mut NodeDataLayouts,
    layout_count: *mut u32,
) -> GlueCodeReturn;
pub type GetSuggestedManipulationFn = unsafe extern "C" fn(
    params: *const HabanaKernelParams,
    suggestion: *mut TensorManipulationSuggestion,
) -> GlueCodeReturn;
pub type GetShapeInferenceFn = unsafe extern "C" fn(
    device_id: RawDeviceId,
    input: *const ShapeInferenceParams,
    output: *mut ShapeInferenceOutput,
) -> GlueCodeReturn;
pub type GetLibVersionFn = unsafe extern "C" fn() -> u64;

/// Copies `value` into a NUL-terminated fixed-size C string, truncating at `N - 1` bytes.
pub fn write_c_chars<const N: usize>(dst: &mut [c_char; N], value: &str) {
    dst.fill(0);
    for (slot, byte) in dst.iter_mut().zip(value.bytes().take(N.saturating_sub(1))) {
        *slot = byte as c_char;
    }
}

pub fn c_chars_to_string(src: &[c_char]) -> String {
    let bytes: Vec<u8> = src
        .iter()
        .take_while(|c| **c != 0)
        .map(|c| *c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn set_flag(word: &mut u32, bit: u32, value: bool) {
    if value {
        *word |= bit;
    } else {
        *word &= !bit;
    }
}
