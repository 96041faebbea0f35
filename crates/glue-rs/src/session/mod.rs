//! Per-node instantiation driver.
//!
//! A session packs the node's operands into the plug-in parameter block, calls the matched
//! capability and recovers from the two buffer-size failures by resizing and retrying, at most
//! [`MAX_INSTANTIATE_ATTEMPTS`] times in total.

pub mod binary;
pub mod packing;
pub mod retry;

pub use binary::{
    BinaryExtractor, DeviceKernelImage, KernelBinary, KernelBinaryCache, WholeContainer,
};
pub use packing::{
    descriptor_entries, pack_tensor, DispatchSettings, InstantiationRequest, NodeTensor,
    PreparedParams,
};
pub use retry::{
    retry_bounded, BufferSet, GrowToReported, ResizePolicy, Retried, Step,
    MAX_INSTANTIATE_ATTEMPTS,
};

use std::ffi::c_void;

use smallvec::SmallVec;

use crate::abi::{
    AuxTensor, HabanaKernelInstantiation, TensorAccessPattern, TensorGeometry,
    AUX_FLAG_NO_INIT, AUX_FLAG_SRAM_ALLOC, MAX_INDEX_SPACE_DIM_SIZE, MAX_SCALAR_PARAMS,
    MAX_TENSOR_NR,
};
use crate::device::DeviceClass;
use crate::error::{BufferKind, GlueError, GlueResult};
use crate::registry::CapabilityRegistry;

/// Auxiliary tensor requested by a kernel, with the host buffer holding its initial content.
#[derive(Clone, Debug, PartialEq)]
pub struct AuxiliaryBuffer {
    pub geometry: TensorGeometry,
    pub flags: u32,
    pub data: Vec<u8>,
}

impl AuxiliaryBuffer {
    pub fn sram_alloc(&self) -> bool {
        self.flags & AUX_FLAG_SRAM_ALLOC != 0
    }

    pub fn no_init(&self) -> bool {
        self.flags & AUX_FLAG_NO_INIT != 0
    }
}

#[derive(Clone, Debug)]
pub struct InstantiationResult {
    pub identifier: String,
    pub node_id: u64,
    pub index_space: SmallVec<[u64; MAX_INDEX_SPACE_DIM_SIZE]>,
    pub input_access_patterns: Vec<TensorAccessPattern>,
    pub output_access_patterns: Vec<TensorAccessPattern>,
    pub auxiliary: Vec<AuxiliaryBuffer>,
    pub scalar_params: Vec<u32>,
    /// Dimension the kernel prefers to be split on.
    pub preferred_split_dim: Option<usize>,
    pub kernel: DeviceKernelImage,
    pub attempts: usize,
}

/// What the plug-in wrote during one call, copied out before the call's buffers move.
#[derive(Debug)]
struct AttemptReport {
    index_space: SmallVec<[u64; MAX_INDEX_SPACE_DIM_SIZE]>,
    input_patterns: Vec<TensorAccessPattern>,
    output_patterns: Vec<TensorAccessPattern>,
    auxiliary: Vec<(TensorGeometry, u32)>,
    requested_auxiliary: Vec<usize>,
    kernel_size: usize,
    scalar_params: Vec<u32>,
    preferred_split_dim: u32,
}

/// Instantiation output block wired to the attempt's buffers. The vectors are never resized
/// after construction.
struct Attempt {
    instance: HabanaKernelInstantiation,
    auxiliary: Vec<AuxTensor>,
    input_patterns: Vec<TensorAccessPattern>,
    output_patterns: Vec<TensorAccessPattern>,
}

impl Attempt {
    fn new(buffers: &mut BufferSet, inputs: usize, outputs: usize) -> Self {
        let mut auxiliary = vec![AuxTensor::default(); MAX_TENSOR_NR];
        for (slot, buffer) in auxiliary.iter_mut().zip(buffers.auxiliary_mut().iter_mut()) {
            slot.p_data = buffer.as_mut_ptr().cast::<c_void>();
            slot.buffer_size = buffer.len() as u64;
        }
        let mut input_patterns = vec![TensorAccessPattern::default(); inputs];
        let mut output_patterns = vec![TensorAccessPattern::default(); outputs];

        let mut instance = HabanaKernelInstantiation {
            input_tensor_access_pattern: input_patterns.as_mut_ptr(),
            output_tensor_access_pattern: output_patterns.as_mut_ptr(),
            auxiliary_tensors: auxiliary.as_mut_ptr(),
            auxiliary_tensor_nr: buffers.auxiliary_count() as u32,
            ..HabanaKernelInstantiation::default()
        };
        let instruction = buffers.instruction_mut();
        if !instruction.is_empty() {
            instance.kernel.kernel_elf = instruction.as_mut_ptr().cast::<c_void>();
            instance.kernel.elf_size = instruction.len() as u32;
        }

        Self {
            instance,
            auxiliary,
            input_patterns,
            output_patterns,
        }
    }

    fn report(self) -> GlueResult<AttemptReport> {
        let instance = &self.instance;
        let auxiliary_count = instance.auxiliary_tensor_nr as usize;
        if auxiliary_count > MAX_TENSOR_NR {
            return Err(GlueError::contract(format!(
                "plug-in reported {auxiliary_count} auxiliary tensors, at most {MAX_TENSOR_NR} are supported"
            )));
        }
        let auxiliary = &self.auxiliary[..auxiliary_count];
        let requested_auxiliary = auxiliary
            .iter()
            .map(|aux| {
                usize::try_from(aux.buffer_size).map_err(|_| {
                    GlueError::contract(format!(
                        "auxiliary buffer of {} bytes does not fit in memory",
                        aux.buffer_size
                    ))
                })
            })
            .collect::<GlueResult<Vec<_>>>()?;

        let rank = (instance.index_space_rank as usize).min(MAX_INDEX_SPACE_DIM_SIZE);
        let params = (instance.kernel.params_nr as usize).min(MAX_SCALAR_PARAMS);
        Ok(AttemptReport {
            index_space: SmallVec::from_slice(&instance.index_space_geometry[..rank]),
            input_patterns: self.input_patterns.clone(),
            output_patterns: self.output_patterns.clone(),
            auxiliary: auxiliary
                .iter()
                .map(|aux| (aux.geometry, aux.flags))
                .collect(),
            requested_auxiliary,
            kernel_size: instance.kernel.elf_size as usize,
            scalar_params: instance.kernel.scalar_params[..params].to_vec(),
            preferred_split_dim: instance.preferred_split_dim,
        })
    }
}

/// Drives instantiation of one node. Owned by a single compilation task.
#[derive(Debug)]
pub struct KernelInstantiationSession<'r, P = GrowToReported> {
    registry: &'r CapabilityRegistry,
    device: DeviceClass,
    policy: P,
    buffers: BufferSet,
    attempts: usize,
}

impl<'r> KernelInstantiationSession<'r> {
    pub fn new(registry: &'r CapabilityRegistry, device: DeviceClass) -> Self {
        Self::with_policy(registry, device, GrowToReported)
    }
}

impl<'r, P: ResizePolicy> KernelInstantiationSession<'r, P> {
    pub fn with_policy(registry: &'r CapabilityRegistry, device: DeviceClass, policy: P) -> Self {
        Self {
            registry,
            device,
            policy,
            buffers: BufferSet::default(),
            attempts: 0,
        }
    }

    /// Starts the first attempt with pre-sized buffers instead of empty ones.
    pub fn with_buffers(mut self, buffers: BufferSet) -> Self {
        self.buffers = buffers;
        self
    }

    pub fn device(&self) -> DeviceClass {
        self.device
    }

    /// Buffers kept for the next instantiation; empty of auxiliaries after a failure.
    pub fn buffers(&self) -> &BufferSet {
        &self.buffers
    }

    /// Calls made by the most recent instantiation.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Builds the parameter block for `request` with the registry's hash and configuration.
    pub fn prepare(&self, request: &InstantiationRequest) -> GlueResult<PreparedParams> {
        let config = self.registry.config();
        let kernel_properties = self
            .registry
            .lookup(&request.identifier, self.device)
            .map(|record| record.identifier.kernel_properties())
            .unwrap_or(0);
        PreparedParams::build(
            request,
            DispatchSettings {
                device: self.device,
                deterministic: config.deterministic.resolve(request.deterministic),
                max_available_tpc: config.max_available_tpc_for(self.device),
                name_hash: self.registry.kernel_hash(&request.identifier, self.device),
                kernel_properties,
            },
        )
    }

    pub fn instantiate(
        &mut self,
        request: &InstantiationRequest,
    ) -> GlueResult<InstantiationResult> {
        let prepared = self.prepare(request)?;
        self.instantiate_prepared(&prepared)
    }

    pub fn instantiate_prepared(
        &mut self,
        prepared: &PreparedParams,
    ) -> GlueResult<InstantiationResult> {
        let identifier = prepared.identifier();
        let registry = self.registry;
        let device = self.device;
        let policy = &self.policy;
        let inputs = prepared.inputs().len();
        let outputs = prepared.outputs().len();

        let retried = retry_bounded(
            MAX_INSTANTIATE_ATTEMPTS,
            std::mem::take(&mut self.buffers),
            |buffers, attempt| {
                let mut call = Attempt::new(buffers, inputs, outputs);
                // SAFETY: `prepared` owns every array its parameter block points to, and `call`
                // points into `buffers` and its own vectors; all of them outlive this call.
                let status = unsafe {
                    registry.instantiate(prepared.params(), device, &identifier, &mut call.instance)
                };
                let report = match call.report() {
                    Ok(report) => report,
                    Err(err) => return Step::Done(Err(err)),
                };
                match status {
                    Ok(()) => Step::Done(Ok(report)),
                    Err(
                        err @ GlueError::InsufficientBuffer {
                            kind: BufferKind::Auxiliary,
                            ..
                        },
                    ) => match policy.resize_auxiliary(buffers, &report.requested_auxiliary) {
                        Some(next) => {
                            tracing::debug!(
                                %device,
                                identifier = %identifier,
                                attempt,
                                sizes = ?report.requested_auxiliary,
                                "growing auxiliary buffers"
                            );
                            Step::Retry {
                                next,
                                outcome: Err(err),
                            }
                        }
                        None => {
                            tracing::error!(
                                %device,
                                identifier = %identifier,
                                "instantiation failed ({err}), unable to increase auxiliary buffers"
                            );
                            Step::Done(Err(err))
                        }
                    },
                    Err(
                        err @ GlueError::InsufficientBuffer {
                            kind: BufferKind::Instruction,
                            ..
                        },
                    ) => {
                        tracing::debug!(
                            %device,
                            identifier = %identifier,
                            attempt,
                            size = report.kernel_size,
                            "growing instruction buffer"
                        );
                        Step::Retry {
                            next: policy.resize_instruction(buffers, report.kernel_size),
                            outcome: Err(err),
                        }
                    }
                    Err(err) => Step::Done(Err(err)),
                }
            },
        );

        self.attempts = retried.attempts;
        let mut buffers = retried.state;
        let outcome = retried
            .outcome
            .and_then(|report| validate_auxiliary(&report, &mut buffers).map(|()| report));

        let report = match outcome {
            Ok(report) => report,
            Err(err) => {
                if retried.exhausted {
                    tracing::warn!(
                        %device,
                        identifier = %identifier,
                        attempts = retried.attempts,
                        "instantiation retry bound exhausted"
                    );
                }
                tracing::warn!(%device, identifier = %identifier, error = %err, "glue code failed");
                buffers.truncate_auxiliary(0);
                self.buffers = buffers;
                return Err(err);
            }
        };

        let container_size = report.kernel_size.min(buffers.instruction_size());
        let kernel = DeviceKernelImage::new(buffers.instruction()[..container_size].to_vec());
        let auxiliary_sizes = buffers.auxiliary_sizes();
        let auxiliary = report
            .auxiliary
            .iter()
            .zip(buffers.take_auxiliary())
            .map(|((geometry, flags), data)| AuxiliaryBuffer {
                geometry: *geometry,
                flags: *flags,
                data,
            })
            .collect();
        self.buffers = BufferSet::with_sizes(&auxiliary_sizes, buffers.instruction_size());

        Ok(InstantiationResult {
            identifier,
            node_id: prepared.params().unique_node_id,
            index_space: report.index_space,
            input_access_patterns: report.input_patterns,
            output_access_patterns: report.output_patterns,
            auxiliary,
            scalar_params: report.scalar_params,
            preferred_split_dim: report
                .preferred_split_dim
                .checked_sub(1)
                .map(|dim| dim as usize),
            kernel,
            attempts: retried.attempts,
        })
    }
}

/// Drops buffers beyond the reported count and checks each kept buffer against its geometry.
fn validate_auxiliary(report: &AttemptReport, buffers: &mut BufferSet) -> GlueResult<()> {
    buffers.truncate_auxiliary(report.auxiliary.len());
    for (index, (geometry, _)) in report.auxiliary.iter().enumerate() {
        let expected = geometry
            .max_element_count()
            .and_then(|elements| geometry.data_type.byte_size(elements));
        let actual = buffers.auxiliary(index).map(|data| data.len() as u64);
        if expected.is_none() || expected != actual {
            return Err(GlueError::contract(format!(
                "auxiliary tensor {index} buffer size {actual:?} does not match its geometry ({expected:?} bytes)"
            )));
        }
    }
    Ok(())
}
