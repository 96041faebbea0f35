mod common;

use glue_rs::abi::{DataType, GlueCodeReturn};
use glue_rs::session::{BufferSet, KernelBinaryCache, WholeContainer, MAX_INSTANTIATE_ATTEMPTS};
use glue_rs::{
    BufferKind, CapabilityRegistry, DeviceClass, GlueConfig, GlueError, InstantiationRequest,
    KernelInstantiationSession, NodeTensor,
};

use common::{unwrap_ok, AUX_BYTES, ELF_BYTES, SCALAR_PARAM};

const DEVICE: DeviceClass = DeviceClass::Gaudi2;

fn session_registry() -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new(GlueConfig::default());
    unwrap_ok(registry.load_kernel_library(DEVICE, common::session_library(), Some(0)));
    unwrap_ok(registry.load_kernel_library(DEVICE, common::library_a(), Some(1)));
    registry
}

fn request(identifier: &str) -> InstantiationRequest {
    InstantiationRequest::new(identifier, 11)
        .input(NodeTensor::new(&[4, 1], DataType::F32))
        .output(NodeTensor::new(&[4, 1], DataType::F32))
}

#[test]
fn buffers_grow_until_the_kernel_fits() {
    let registry = session_registry();
    let mut session = KernelInstantiationSession::new(&registry, DEVICE);

    let result = unwrap_ok(session.instantiate(&request("resize_then_succeed")));
    assert_eq!(result.attempts, 3);
    assert_eq!(session.attempts(), 3);
    assert_eq!(result.node_id, 11);
    assert_eq!(result.identifier, "resize_then_succeed");
    assert_eq!(result.index_space.as_slice(), [4, 1]);
    assert_eq!(result.scalar_params, [SCALAR_PARAM]);
    assert_eq!(result.preferred_split_dim, Some(0));
    assert_eq!(result.input_access_patterns.len(), 1);
    assert_eq!(result.output_access_patterns.len(), 1);

    assert_eq!(result.auxiliary.len(), 1);
    let aux = &result.auxiliary[0];
    assert_eq!(aux.data.len() as u64, AUX_BYTES);
    assert!(aux.data.iter().all(|byte| *byte == 0x5a));
    assert!(!aux.sram_alloc());

    assert_eq!(result.kernel.container().len(), ELF_BYTES as usize);
    assert!(!result.kernel.is_extracted());

    assert_eq!(session.buffers().auxiliary_sizes(), [AUX_BYTES as usize]);
    assert_eq!(session.buffers().instruction_size(), ELF_BYTES as usize);
    let again = unwrap_ok(session.instantiate(&request("resize_then_succeed")));
    assert_eq!(again.attempts, 1);
}

#[test]
fn growing_auxiliary_requests_stop_at_the_retry_bound() {
    let registry = session_registry();
    let mut session = KernelInstantiationSession::new(&registry, DEVICE);

    let err = session
        .instantiate(&request("aux_keeps_growing"))
        .expect_err("the kernel never gets enough auxiliary memory");
    assert!(matches!(
        err,
        GlueError::InsufficientBuffer {
            kind: BufferKind::Auxiliary,
            ..
        }
    ));
    assert_eq!(session.attempts(), MAX_INSTANTIATE_ATTEMPTS);
    assert_eq!(session.buffers().auxiliary_count(), 0);
}

#[test]
fn repeated_auxiliary_request_is_not_retried() {
    let registry = session_registry();
    let mut session = KernelInstantiationSession::new(&registry, DEVICE);

    let err = session
        .instantiate(&request("aux_stuck"))
        .expect_err("the same size is requested twice");
    assert!(matches!(err, GlueError::InsufficientBuffer { .. }));
    assert_eq!(session.attempts(), 2);
    assert_eq!(session.buffers().auxiliary_count(), 0);
}

#[test]
fn other_plugin_failures_are_reported_without_retrying() {
    let registry = session_registry();
    let mut session = KernelInstantiationSession::new(&registry, DEVICE);

    let err = session
        .instantiate(&request("rejects_data_type"))
        .expect_err("plug-in rejects the node");
    assert_eq!(err.raw_code(), Some(GlueCodeReturn::INCOMPATIBLE_DATA_TYPE));
    assert_eq!(session.attempts(), 1);

    let err = session
        .instantiate(&request("conv2d_f32"))
        .expect_err("no library declares the identifier");
    assert!(err.is_not_found());
}

#[test]
fn presized_buffers_skip_the_resize_round_trips() {
    let registry = session_registry();
    let buffers = BufferSet::with_sizes(&[AUX_BYTES as usize], ELF_BYTES as usize);
    let mut session = KernelInstantiationSession::new(&registry, DEVICE).with_buffers(buffers);
    let result = unwrap_ok(session.instantiate(&request("resize_then_succeed")));
    assert_eq!(result.attempts, 1);
}

#[test]
fn high_rank_operands_are_split_across_descriptor_entries() {
    let registry = session_registry();
    let mut session = KernelInstantiationSession::new(&registry, DEVICE);
    let request = InstantiationRequest::new("checks_packing", 3)
        .input(NodeTensor::new(&[2, 3, 4, 5, 6, 7, 8], DataType::F32))
        .output(NodeTensor::new(&[6, 7], DataType::F32).with_static_data(vec![0u8; 4]));

    let prepared = unwrap_ok(session.prepare(&request));
    assert_eq!(prepared.inputs().len(), 2);
    assert_eq!(prepared.inputs()[1].geometry.max_dims(), [7, 8]);

    let result = unwrap_ok(session.instantiate_prepared(&prepared));
    assert!(result.auxiliary.is_empty());
    assert!(result.kernel.container().is_empty());
}

#[test]
fn nop_without_inputs_gets_a_placeholder_operand() {
    let registry = session_registry();
    let session = KernelInstantiationSession::new(&registry, DEVICE);
    let prepared = unwrap_ok(session.prepare(&InstantiationRequest::new("nop", 5)));
    assert_eq!(prepared.inputs().len(), 1);
    assert_eq!(prepared.inputs()[0].geometry.data_type, DataType::F32);
    assert_eq!(prepared.params().max_available_tpc, 24);
    assert_eq!(prepared.params().device_id, DEVICE.raw());
}

#[test]
fn extracted_binaries_are_cached_by_node() {
    let registry = session_registry();
    let mut session = KernelInstantiationSession::new(&registry, DEVICE);
    let mut result = unwrap_ok(session.instantiate(&request("resize_then_succeed")));

    let cache = KernelBinaryCache::new();
    let binary = unwrap_ok(result.kernel.extract(result.node_id, &WholeContainer, &cache));
    assert_eq!(binary.code.len(), ELF_BYTES as usize);
    assert!(result.kernel.is_extracted());
    assert!(unwrap_ok(cache.get(result.node_id)).is_some());
}
