//! Tarn VM Core Runtime
//!
//! This crate provides the stack-walking and virtual-register recovery
//! subsystem of the Tarn VM:
//! - Logical call frames in both representations (interpreted shadow
//!   frames and compiled frames described by codegen metadata)
//! - Stack-map decoding and virtual-register reads/writes at any depth
//! - Machine-register context tracking across unwinding
//! - Cooperative cross-thread checkpoints and suspension
//! - Deoptimize-on-write promotion of compiled frames

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod decoder;
pub mod deopt;
pub mod fragment;
pub mod frame;
pub mod gc;
pub mod instrument;
pub mod machine_context;
pub mod stack_map;
pub mod sync;
pub mod thread;
pub mod thread_list;
pub mod walker;

pub use decoder::VRegKind;
pub use deopt::{DeoptimizationQueue, Deoptimizer};
pub use fragment::{
    CompiledFragment, CompiledFragmentBuilder, InterpretedFragment, ManagedStack,
    RegisterSnapshot, StackFragment,
};
pub use frame::{frame_flags, FrameId, InterpretedFrame, PendingFrame};
pub use gc::{Heap, NonMovingBarrier, ObjectRef, ReadBarrier};
pub use instrument::{ReturnAddressTable, EXIT_SENTINEL};
pub use machine_context::MachineContext;
pub use stack_map::{
    runtime_frame_info, CodeTable, CompiledCode, DexRegisterLocation, DexRegisterMap, FrameInfo,
    InlineInfoEntry, StackMap, StackMask,
};
pub use sync::Barrier;
pub use thread::{Checkpoint, ThreadId, ThreadState, VmThread};
pub use thread_list::{ThreadRegistry, DEFAULT_CHECKPOINT_TIMEOUT};
pub use walker::{StackWalkKind, StackWalker, WalkEnv, NO_SOURCE_PC};

/// VM runtime errors
///
/// Register reads and writes never surface through this type; a dead or
/// unmapped value is reported as an absent result, not an error. `VmError`
/// covers registry-level failures where the operation itself could not run.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// Target thread is not registered
    #[error("Thread {0} not found")]
    ThreadNotFound(u64),

    /// Method handle does not resolve
    #[error("Unknown method id {0}")]
    UnknownMethod(u32),

    /// A checkpoint was not acknowledged within the deadline
    #[error("Checkpoint timed out after {0:?}")]
    CheckpointTimeout(std::time::Duration),
}

/// VM runtime result
pub type VmResult<T> = Result<T, VmError>;
