//! Thread registry and the cross-thread checkpoint protocol
//!
//! Other subsystems never walk a foreign runnable thread's stack directly.
//! They schedule a checkpoint: a closure the target runs at its own next
//! safe point, acknowledged through a counting [`Barrier`] the requester
//! blocks on. The registry's locks are held only long enough to locate and
//! validate targets; no process-wide lock spans a walk.
//!
//! A target that is already suspended has its closure run by the requester
//! on its behalf, which is sound because a suspended thread does not touch
//! its own state. A runnable target that never reaches a safe point stalls
//! the requester until the deadline; that is the accepted structural risk
//! of the cooperative model.

use crate::sync::Barrier;
use crate::thread::{ThreadId, ThreadState, VmThread};
use crate::{VmError, VmResult};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default deadline for checkpoint acknowledgment
pub const DEFAULT_CHECKPOINT_TIMEOUT: Duration = Duration::from_secs(10);

/// How often a blocked requester re-examines a silent target
const ACK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Process-wide registry of VM threads
#[derive(Default)]
pub struct ThreadRegistry {
    /// Registration order, for fan-out enumeration
    list: RwLock<Vec<Arc<VmThread>>>,

    /// Handle lookup by numeric id
    by_id: DashMap<u64, Arc<VmThread>>,
}

impl ThreadRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a thread
    pub fn register(&self, thread: Arc<VmThread>) {
        self.by_id.insert(thread.id().as_u64(), thread.clone());
        self.list.write().push(thread);
    }

    /// Remove a thread on exit
    pub fn unregister(&self, id: ThreadId) {
        self.by_id.remove(&id.as_u64());
        self.list.write().retain(|t| t.id() != id);
    }

    /// Look up a registered thread
    pub fn find(&self, id: ThreadId) -> Option<Arc<VmThread>> {
        self.by_id.get(&id.as_u64()).map(|t| t.clone())
    }

    /// Number of registered threads
    pub fn len(&self) -> usize {
        self.list.read().len()
    }

    /// Whether no threads are registered
    pub fn is_empty(&self) -> bool {
        self.list.read().is_empty()
    }

    /// Run a closure on a target thread at its next safe point
    ///
    /// Blocks until the target acknowledges or the default deadline
    /// passes. Suspended targets have the closure run on their behalf
    /// immediately. The registry lock is released before anything runs.
    pub fn run_checkpoint<F>(&self, target: ThreadId, f: F) -> VmResult<()>
    where
        F: FnOnce(&VmThread) + Send + 'static,
    {
        self.run_checkpoint_deadline(target, f, DEFAULT_CHECKPOINT_TIMEOUT)
    }

    /// [`ThreadRegistry::run_checkpoint`] with an explicit deadline
    pub fn run_checkpoint_deadline<F>(
        &self,
        target: ThreadId,
        f: F,
        timeout: Duration,
    ) -> VmResult<()>
    where
        F: FnOnce(&VmThread) + Send + 'static,
    {
        let thread = self
            .find(target)
            .ok_or(VmError::ThreadNotFound(target.as_u64()))?;
        // No registry lock is held past this point.

        if thread.state() == ThreadState::Suspended || thread.is_current() {
            f(&thread);
            return Ok(());
        }

        let barrier = Arc::new(Barrier::new(1));
        let ack = barrier.clone();
        thread.request_checkpoint(Box::new(move |t| {
            f(t);
            ack.pass();
        }));

        self.await_acknowledgment(&barrier, std::slice::from_ref(&thread), timeout)
    }

    /// Run a closure on every registered thread at its next safe point
    ///
    /// One barrier is incremented once per participating thread. Returns
    /// the number of threads that ran the closure.
    pub fn run_checkpoint_all<F>(&self, f: F) -> VmResult<usize>
    where
        F: Fn(&VmThread) + Send + Sync + 'static,
    {
        let threads: Vec<Arc<VmThread>> = self.list.read().clone();
        // Enumeration lock released before any closure runs.

        let f = Arc::new(f);
        let barrier = Arc::new(Barrier::new(0));
        let mut awaited = Vec::new();

        for thread in &threads {
            if thread.state() == ThreadState::Suspended || thread.is_current() {
                (*f)(thread);
                continue;
            }
            barrier.increment(1);
            let f = f.clone();
            let ack = barrier.clone();
            thread.request_checkpoint(Box::new(move |t| {
                (*f)(t);
                ack.pass();
            }));
            awaited.push(thread.clone());
        }

        self.await_acknowledgment(&barrier, &awaited, DEFAULT_CHECKPOINT_TIMEOUT)?;
        Ok(threads.len())
    }

    /// Park a thread at its next safe point and wait for it
    pub fn suspend(&self, target: ThreadId) -> VmResult<()> {
        self.run_checkpoint(target, |t| {
            // Running inside the safe point: the queue is already drained.
            t.mark_suspended();
        })
    }

    /// Let a suspended thread run again
    pub fn resume(&self, target: ThreadId) -> VmResult<()> {
        let thread = self
            .find(target)
            .ok_or(VmError::ThreadNotFound(target.as_u64()))?;
        thread.mark_runnable();
        Ok(())
    }

    /// Block until the barrier clears, draining targets that parked
    /// between our state check and their next safe point.
    fn await_acknowledgment(
        &self,
        barrier: &Barrier,
        targets: &[Arc<VmThread>],
        timeout: Duration,
    ) -> VmResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if barrier.wait_timeout(ACK_POLL_INTERVAL) {
                return Ok(());
            }
            for thread in targets {
                if thread.state() == ThreadState::Suspended && thread.has_pending_checkpoints() {
                    thread.check_safe_point();
                }
            }
            if Instant::now() >= deadline {
                return Err(VmError::CheckpointTimeout(timeout));
            }
        }
    }
}
