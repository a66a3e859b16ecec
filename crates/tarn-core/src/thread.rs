//! VM threads and cooperative safe points
//!
//! A `VmThread` owns one logical call stack and cooperates with the rest
//! of the runtime through safe points: between bytecode instructions (and
//! at compiled-code poll sites) the executing thread calls
//! [`VmThread::check_safe_point`], which drains the checkpoint closures
//! other threads have queued for it. Nothing ever walks a runnable
//! thread's stack from outside; see [`crate::thread_list`] for the
//! cross-thread protocol.

use crate::fragment::ManagedStack;
use crate::frame::{FrameId, PendingFrame};
use crate::instrument::ReturnAddressTable;
use crossbeam::queue::SegQueue;
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a VM thread
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ThreadId(u64);

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

impl ThreadId {
    /// Generate a new unique ThreadId
    pub fn new() -> Self {
        ThreadId(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Create a ThreadId from a u64 value
    pub fn from_u64(id: u64) -> Self {
        ThreadId(id)
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        Self::new()
    }
}

/// Execution state of a VM thread
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ThreadState {
    /// Executing managed code; only the thread itself may touch its stack
    Runnable,
    /// Parked at a safe point; others may inspect it
    Suspended,
}

/// A closure scheduled for execution at a thread's next safe point
pub type Checkpoint = Box<dyn FnOnce(&VmThread) + Send>;

/// One VM thread: a logical stack plus the tables keyed to it
pub struct VmThread {
    /// Unique identifier
    id: ThreadId,

    /// Current state
    state: Mutex<ThreadState>,

    /// The thread's logical call stack
    stack: Mutex<ManagedStack>,

    /// Closures queued for the next safe point
    checkpoints: SegQueue<Checkpoint>,

    /// Debugger-written interpreted frames awaiting deoptimization
    pending_frames: Mutex<FxHashMap<FrameId, PendingFrame>>,

    /// Instrumentation return-address redirections
    instrumentation: Mutex<ReturnAddressTable>,

    /// OS thread this VM thread is attached to (if any)
    os_thread: Mutex<Option<std::thread::ThreadId>>,
}

impl VmThread {
    /// Create a detached thread in the runnable state
    pub fn new() -> Self {
        Self {
            id: ThreadId::new(),
            state: Mutex::new(ThreadState::Runnable),
            stack: Mutex::new(ManagedStack::new()),
            checkpoints: SegQueue::new(),
            pending_frames: Mutex::new(FxHashMap::default()),
            instrumentation: Mutex::new(ReturnAddressTable::new()),
            os_thread: Mutex::new(None),
        }
    }

    /// The thread's unique ID
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Current state
    pub fn state(&self) -> ThreadState {
        *self.state.lock()
    }

    /// Park at a safe point; pending checkpoints run first
    pub fn mark_suspended(&self) {
        self.check_safe_point();
        *self.state.lock() = ThreadState::Suspended;
    }

    /// Leave the parked state
    pub fn mark_runnable(&self) {
        *self.state.lock() = ThreadState::Runnable;
    }

    /// Bind this VM thread to the calling OS thread
    pub fn attach_current(&self) {
        *self.os_thread.lock() = Some(std::thread::current().id());
    }

    /// Whether the calling OS thread owns this VM thread
    pub fn is_current(&self) -> bool {
        *self.os_thread.lock() == Some(std::thread::current().id())
    }

    /// The thread's logical stack
    pub fn stack(&self) -> &Mutex<ManagedStack> {
        &self.stack
    }

    /// Queue a closure for the next safe point
    pub fn request_checkpoint(&self, checkpoint: Checkpoint) {
        self.checkpoints.push(checkpoint);
    }

    /// Run every queued checkpoint
    ///
    /// Called by the owning thread at its safe points. Also called by a
    /// requester on behalf of a thread that parked before draining its
    /// queue; that is only sound because a suspended thread does not touch
    /// its own state.
    pub fn check_safe_point(&self) {
        while let Some(checkpoint) = self.checkpoints.pop() {
            checkpoint(self);
        }
    }

    /// Whether checkpoints are waiting
    pub fn has_pending_checkpoints(&self) -> bool {
        !self.checkpoints.is_empty()
    }

    /// Debugger override frames, keyed by frame identity
    pub fn pending_frames(&self) -> MutexGuard<'_, FxHashMap<FrameId, PendingFrame>> {
        self.pending_frames.lock()
    }

    /// Instrumentation redirection table
    pub fn instrumentation(&self) -> MutexGuard<'_, ReturnAddressTable> {
        self.instrumentation.lock()
    }
}

impl Default for VmThread {
    fn default() -> Self {
        Self::new()
    }
}
