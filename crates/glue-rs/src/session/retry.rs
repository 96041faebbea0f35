//! Bounded resize-and-retry loop used by instantiation.

use crate::abi::MAX_TENSOR_NR;

/// Instantiate calls made before a node is given up on.
pub const MAX_INSTANTIATE_ATTEMPTS: usize = 5;

/// Decision taken after one attempt.
#[derive(Debug)]
pub enum Step<S, T> {
    /// Stop and report `T`.
    Done(T),
    /// Try again with `next`; `outcome` is reported if no attempt is left.
    Retry { next: S, outcome: T },
}

#[derive(Debug)]
pub struct Retried<S, T> {
    pub state: S,
    pub outcome: T,
    pub attempts: usize,
    /// The last attempt asked for a retry that the bound did not allow.
    pub exhausted: bool,
}

/// Runs `attempt` until it returns [`Step::Done`] or `max_attempts` calls have been made. At least
/// one attempt is always made. Each retry replaces the state with the one the attempt produced.
pub fn retry_bounded<S, T>(
    max_attempts: usize,
    initial: S,
    mut attempt: impl FnMut(&mut S, usize) -> Step<S, T>,
) -> Retried<S, T> {
    let mut state = initial;
    let mut attempts = 0;
    loop {
        attempts += 1;
        match attempt(&mut state, attempts) {
            Step::Done(outcome) => {
                return Retried {
                    state,
                    outcome,
                    attempts,
                    exhausted: false,
                }
            }
            Step::Retry { next, outcome } => {
                state = next;
                if attempts >= max_attempts {
                    return Retried {
                        state,
                        outcome,
                        attempts,
                        exhausted: true,
                    };
                }
            }
        }
    }
}

/// Host buffers lent to the plug-in for one instantiate call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferSet {
    auxiliary: Vec<Vec<u8>>,
    instruction: Vec<u8>,
}

impl BufferSet {
    /// Zero-filled buffers of the given sizes.
    /// At most [`MAX_TENSOR_NR`] auxiliary buffers are kept.
    pub fn with_sizes(auxiliary: &[usize], instruction: usize) -> Self {
        Self {
            auxiliary: auxiliary
                .iter()
                .take(MAX_TENSOR_NR)
                .map(|size| vec![0; *size])
                .collect(),
            instruction: vec![0; instruction],
        }
    }

    pub fn auxiliary_count(&self) -> usize {
        self.auxiliary.len()
    }

    pub fn auxiliary_sizes(&self) -> Vec<usize> {
        self.auxiliary.iter().map(Vec::len).collect()
    }

    pub fn auxiliary(&self, index: usize) -> Option<&[u8]> {
        self.auxiliary.get(index).map(Vec::as_slice)
    }

    pub fn instruction_size(&self) -> usize {
        self.instruction.len()
    }

    pub fn instruction(&self) -> &[u8] {
        &self.instruction
    }

    pub(crate) fn auxiliary_mut(&mut self) -> &mut [Vec<u8>] {
        &mut self.auxiliary
    }

    pub(crate) fn instruction_mut(&mut self) -> &mut Vec<u8> {
        &mut self.instruction
    }

    pub(crate) fn truncate_auxiliary(&mut self, count: usize) {
        self.auxiliary.truncate(count);
    }

    pub(crate) fn take_auxiliary(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.auxiliary)
    }
}

/// How buffers grow after the plug-in reports them too small.
pub trait ResizePolicy {
    /// Buffers for the next attempt given the per-buffer sizes the plug-in asked for, or `None`
    /// when the request would not change anything.
    fn resize_auxiliary(&self, current: &BufferSet, requested: &[usize]) -> Option<BufferSet>;

    fn resize_instruction(&self, current: &BufferSet, requested: usize) -> BufferSet;
}

/// Sizes every buffer exactly as the plug-in reported.
#[derive(Clone, Copy, Debug, Default)]
pub struct GrowToReported;

impl ResizePolicy for GrowToReported {
    fn resize_auxiliary(&self, current: &BufferSet, requested: &[usize]) -> Option<BufferSet> {
        let current_sizes = current.auxiliary_sizes();
        let changed = requested
            .iter()
            .enumerate()
            .any(|(index, size)| current_sizes.get(index).copied().unwrap_or(0) != *size);
        changed.then(|| BufferSet::with_sizes(requested, current.instruction_size()))
    }

    fn resize_instruction(&self, current: &BufferSet, requested: usize) -> BufferSet {
        BufferSet::with_sizes(&current.auxiliary_sizes(), requested)
    }
}
