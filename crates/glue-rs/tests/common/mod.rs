#![allow(dead_code)]

//! In-process glue-code libraries used by the integration tests.

use std::sync::Arc;

use glue_rs::abi::{
    AuxTensor, DataType, GlueCodeReturn, GuidInfo, HabanaKernelInstantiation, HabanaKernelParams,
    NodeDataLayouts, ShapeInferenceOutput, ShapeInferenceParams, TensorGeometry,
    UniqueShapeInferenceHash, KERNEL_SUPPORTS_DYNAMIC_SHAPES,
};
use glue_rs::{PluginEntryPoints, PluginLibrary};

pub const ADD_HASH: u64 = 0x0add;
pub const AUX_BYTES: u64 = 16;
pub const ELF_BYTES: u32 = 64;
pub const SCALAR_PARAM: u32 = 42;

type GuidEntry = (&'static str, u64, u32);

const LIBRARY_A_GUIDS: [GuidEntry; 3] = [
    ("add_f32", ADD_HASH, KERNEL_SUPPORTS_DYNAMIC_SHAPES),
    ("relu_fwd_f32", 0, 0),
    ("nop", 0, 0),
];

const LIBRARY_B_GUIDS: [GuidEntry; 3] = [
    ("add_f32", ADD_HASH, KERNEL_SUPPORTS_DYNAMIC_SHAPES),
    ("relu_fwd_f32", 0, 0),
    ("mul_f32", 0, 0),
];

const SESSION_GUIDS: [GuidEntry; 5] = [
    ("resize_then_succeed", 0, 0),
    ("aux_keeps_growing", 0, 0),
    ("aux_stuck", 0, 0),
    ("rejects_data_type", 0, 0),
    ("checks_packing", 0, 0),
];

const COMPLEX_FUNCTIONAL_GUIDS: [GuidEntry; 1] =
    [("softmax_f32", 0, KERNEL_SUPPORTS_DYNAMIC_SHAPES)];
const COMPLEX_PERFORMANCE_GUIDS: [GuidEntry; 1] =
    [("add_f32", 0, KERNEL_SUPPORTS_DYNAMIC_SHAPES)];

/// Size query when `guids` is null, otherwise fills at most `*count` entries.
unsafe fn fill_guids(
    entries: &[GuidEntry],
    count: *mut u32,
    guids: *mut GuidInfo,
) -> GlueCodeReturn {
    if guids.is_null() {
        *count = entries.len() as u32;
        return GlueCodeReturn::SUCCESS;
    }
    let written = entries.len().min(*count as usize);
    for (index, (name, hash, properties)) in entries.iter().take(written).enumerate() {
        *guids.add(index) =
            GuidInfo::new(name, UniqueShapeInferenceHash::new(*hash, 0), *properties);
    }
    *count = written as u32;
    GlueCodeReturn::SUCCESS
}

unsafe extern "C" fn library_a_guids(
    _: u32,
    count: *mut u32,
    guids: *mut GuidInfo,
) -> GlueCodeReturn {
    fill_guids(&LIBRARY_A_GUIDS, count, guids)
}

unsafe extern "C" fn library_b_guids(
    _: u32,
    count: *mut u32,
    guids: *mut GuidInfo,
) -> GlueCodeReturn {
    fill_guids(&LIBRARY_B_GUIDS, count, guids)
}

unsafe extern "C" fn session_guids(
    _: u32,
    count: *mut u32,
    guids: *mut GuidInfo,
) -> GlueCodeReturn {
    fill_guids(&SESSION_GUIDS, count, guids)
}

unsafe extern "C" fn no_guids(
    _: u32,
    count: *mut u32,
    guids: *mut GuidInfo,
) -> GlueCodeReturn {
    fill_guids(&[], count, guids)
}

unsafe extern "C" fn complex_functional_guids(
    _: u32,
    count: *mut u32,
    guids: *mut GuidInfo,
) -> GlueCodeReturn {
    fill_guids(&COMPLEX_FUNCTIONAL_GUIDS, count, guids)
}

unsafe extern "C" fn complex_performance_guids(
    _: u32,
    count: *mut u32,
    guids: *mut GuidInfo,
) -> GlueCodeReturn {
    fill_guids(&COMPLEX_PERFORMANCE_GUIDS, count, guids)
}

unsafe extern "C" fn version_7() -> u64 {
    7
}

unsafe extern "C" fn version_8() -> u64 {
    8
}

unsafe extern "C" fn version_3() -> u64 {
    3
}

/// Every output takes the shape of input 0.
pub unsafe extern "C" fn copy_first_input_shape(
    _: u32,
    params: *const ShapeInferenceParams,
    output: *mut ShapeInferenceOutput,
) -> GlueCodeReturn {
    let params = &*params;
    let output = &mut *output;
    if params.input_tensors_nr == 0 {
        return GlueCodeReturn::INCOMPATIBLE_INPUT_COUNT;
    }
    let input = (**params.input_tensors).geometry;
    for index in 0..params.output_tensors_nr as usize {
        let target = &mut **output.output_tensors.add(index);
        target.geometry.dims = input.dims;
        target.geometry.max_sizes = input.max_sizes;
        target.geometry.min_sizes = input.min_sizes;
    }
    GlueCodeReturn::SUCCESS
}

/// A second shape-inference routine so re-registration with a different address is observable.
pub unsafe extern "C" fn invalidate_all_outputs(
    _: u32,
    params: *const ShapeInferenceParams,
    output: *mut ShapeInferenceOutput,
) -> GlueCodeReturn {
    let params = &*params;
    let output = &mut *output;
    for index in 0..params.output_tensors_nr as usize {
        *output.invalid_mask.add(index / 32) |= 1 << (index % 32);
    }
    GlueCodeReturn::SUCCESS
}

/// Reports a single supported layout combination and fills nothing.
pub unsafe extern "C" fn single_layout(
    _: *const HabanaKernelParams,
    layouts: *mut NodeDataLayouts,
    layout_count: *mut u32,
) -> GlueCodeReturn {
    if layouts.is_null() {
        *layout_count = 1;
    }
    GlueCodeReturn::SUCCESS
}

fn identifier_of(params: &HabanaKernelParams) -> String {
    params.guid.name()
}

unsafe fn request_auxiliary(instance: &mut HabanaKernelInstantiation, size: u64) {
    let aux: &mut AuxTensor = &mut *instance.auxiliary_tensors;
    aux.geometry = TensorGeometry::fixed(&[size / 4], DataType::F32);
    aux.buffer_size = size;
    instance.auxiliary_tensor_nr = 1;
}

unsafe fn current_auxiliary_size(instance: &HabanaKernelInstantiation) -> u64 {
    if instance.auxiliary_tensor_nr == 0 {
        return 0;
    }
    (*instance.auxiliary_tensors).buffer_size
}

/// Dispatches on the identifier so one library can play every instantiation scenario.
pub unsafe extern "C" fn scripted_instantiate(
    params: *const HabanaKernelParams,
    instance: *mut HabanaKernelInstantiation,
) -> GlueCodeReturn {
    let params = &*params;
    let instance = &mut *instance;
    match identifier_of(params).as_str() {
        "resize_then_succeed" => resize_then_succeed(instance),
        "aux_keeps_growing" => {
            let next = current_auxiliary_size(instance) + AUX_BYTES;
            request_auxiliary(instance, next);
            GlueCodeReturn::INSUFFICIENT_AUX_BUFFER_SIZE
        }
        "aux_stuck" => {
            request_auxiliary(instance, 2 * AUX_BYTES);
            GlueCodeReturn::INSUFFICIENT_AUX_BUFFER_SIZE
        }
        "checks_packing" => checks_packing(params),
        "nop" | "add_f32" | "relu_fwd_f32" | "mul_f32" => GlueCodeReturn::SUCCESS,
        _ => GlueCodeReturn::INCOMPATIBLE_DATA_TYPE,
    }
}

/// Asks for one 16-byte auxiliary buffer, then for a 64-byte instruction buffer, then succeeds.
unsafe fn resize_then_succeed(instance: &mut HabanaKernelInstantiation) -> GlueCodeReturn {
    if current_auxiliary_size(instance) < AUX_BYTES {
        request_auxiliary(instance, AUX_BYTES);
        return GlueCodeReturn::INSUFFICIENT_AUX_BUFFER_SIZE;
    }
    if instance.kernel.kernel_elf.is_null() || instance.kernel.elf_size < ELF_BYTES {
        instance.kernel.elf_size = ELF_BYTES;
        return GlueCodeReturn::INSUFFICIENT_ELF_BUFFER;
    }

    request_auxiliary(instance, AUX_BYTES);
    let aux = &*instance.auxiliary_tensors;
    std::ptr::write_bytes(aux.p_data.cast::<u8>(), 0x5a, AUX_BYTES as usize);
    std::ptr::write_bytes(instance.kernel.kernel_elf.cast::<u8>(), 0xab, ELF_BYTES as usize);
    instance.kernel.elf_size = ELF_BYTES;
    instance.kernel.scalar_params[0] = SCALAR_PARAM;
    instance.kernel.params_nr = 1;
    instance.index_space_rank = 2;
    instance.index_space_geometry[..2].copy_from_slice(&[4, 1]);
    instance.preferred_split_dim = 1;
    GlueCodeReturn::SUCCESS
}

/// Succeeds only for one rank-7 F32 input and one rank-2 output packed as the ABI requires.
unsafe fn checks_packing(params: &HabanaKernelParams) -> GlueCodeReturn {
    if params.input_tensor_nr != 2 || params.output_tensor_nr != 1 {
        return GlueCodeReturn::INCOMPATIBLE_INPUT_COUNT;
    }
    let inputs = std::slice::from_raw_parts(params.input_tensors, 2);
    let output = &*params.output_tensors;
    let padded = inputs[1].geometry.dims == 2
        && inputs[1].geometry.max_sizes[2..5].iter().all(|size| *size == 1)
        && inputs[1].permutation[..5] == [0, 1, 2, 3, 4];
    if !padded || !output.p_data.is_null() {
        return GlueCodeReturn::INCOMPATIBLE_INPUT_SIZE;
    }
    GlueCodeReturn::SUCCESS
}

pub fn library_a() -> Arc<PluginLibrary> {
    Arc::new(PluginLibrary::from_entry_points(
        "lib_a",
        PluginEntryPoints {
            kernel_guids: Some(library_a_guids),
            instantiate: Some(scripted_instantiate),
            shape_inference: Some(copy_first_input_shape),
            library_version: Some(version_7),
            ..PluginEntryPoints::default()
        },
    ))
}

pub fn library_b() -> Arc<PluginLibrary> {
    Arc::new(PluginLibrary::from_entry_points(
        "lib_b",
        PluginEntryPoints {
            kernel_guids: Some(library_b_guids),
            instantiate: Some(scripted_instantiate),
            shape_inference: Some(copy_first_input_shape),
            library_version: Some(version_8),
            ..PluginEntryPoints::default()
        },
    ))
}

/// Same identifiers as [`library_a`] at the same version but a different shape routine.
pub fn library_a_rebuilt() -> Arc<PluginLibrary> {
    Arc::new(PluginLibrary::from_entry_points(
        "lib_a_rebuilt",
        PluginEntryPoints {
            kernel_guids: Some(library_a_guids),
            instantiate: Some(scripted_instantiate),
            shape_inference: Some(invalidate_all_outputs),
            library_version: Some(version_7),
            ..PluginEntryPoints::default()
        },
    ))
}

pub fn session_library() -> Arc<PluginLibrary> {
    Arc::new(PluginLibrary::from_entry_points(
        "lib_session",
        PluginEntryPoints {
            kernel_guids: Some(session_guids),
            instantiate: Some(scripted_instantiate),
            shape_inference: Some(copy_first_input_shape),
            library_version: Some(version_7),
            ..PluginEntryPoints::default()
        },
    ))
}

pub fn library_without_instantiate() -> Arc<PluginLibrary> {
    Arc::new(PluginLibrary::from_entry_points(
        "lib_incomplete",
        PluginEntryPoints {
            kernel_guids: Some(library_b_guids),
            shape_inference: Some(copy_first_input_shape),
            ..PluginEntryPoints::default()
        },
    ))
}

pub fn fuser_library() -> Arc<PluginLibrary> {
    Arc::new(PluginLibrary::from_entry_points(
        "lib_fuser",
        PluginEntryPoints {
            kernel_guids: Some(no_guids),
            instantiate: Some(scripted_instantiate),
            library_version: Some(version_3),
            ..PluginEntryPoints::default()
        },
    ))
}

pub fn complex_library() -> Arc<PluginLibrary> {
    Arc::new(PluginLibrary::from_entry_points(
        "lib_complex",
        PluginEntryPoints {
            supported_layouts: Some(single_layout),
            shape_inference: Some(invalidate_all_outputs),
            library_version: Some(version_3),
            functional_complex_guids: Some(complex_functional_guids),
            performance_complex_guids: Some(complex_performance_guids),
            ..PluginEntryPoints::default()
        },
    ))
}

pub fn unwrap_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    result.unwrap_or_else(|err| panic!("unexpected error: {err}"))
}
