//! Stack traversal across frame representations
//!
//! A [`StackWalker`] iterates a thread's logical call stack fragment by
//! fragment, innermost first, dispatching one visit per logical frame.
//! Interpreted fragments walk their explicit frame chain; compiled
//! fragments are decoded frame by frame from captured raw stack memory
//! using the metadata in the [`crate::stack_map`] tables: resolve the
//! header, expand inline chains, read the return address, advance by the
//! frame size. The walker is also the cursor: while a visit callback runs,
//! register queries ([`StackWalker::get_vreg`] and friends, defined in
//! [`crate::decoder`]) answer against the frame currently under the
//! cursor.
//!
//! Construction enforces the suspension precondition: only the current
//! thread or a suspended thread may be walked. Violations are caller bugs
//! and abort.

use crate::fragment::{CompiledFragment, ManagedStack, StackFragment};
use crate::frame::{FrameId, InterpretedFrame};
use crate::gc::{CompactionGuard, Heap, ObjectRef};
use crate::instrument::EXIT_SENTINEL;
use crate::machine_context::MachineContext;
use crate::stack_map::{runtime_frame_info, CodeTable, CompiledCode, DexRegisterMap, FrameInfo, StackMap};
use crate::thread::{ThreadState, VmThread};
use crate::deopt::Deoptimizer;
use parking_lot::MutexGuard;
use tarn_bytecode::{Method, MethodId, MethodTable};

/// Source pc reported when no stack map covers the current native pc
pub const NO_SOURCE_PC: u32 = u32::MAX;

/// Whether a walk expands compiler-inlined calls into their own visits
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StackWalkKind {
    /// Visit each inline level as its own logical frame
    IncludeInlinedFrames,
    /// Visit only physical frames
    SkipInlinedFrames,
}

/// The collaborators a walk consults
///
/// Bundles the read-only tables and the mutation sink so a walker can be
/// constructed from any subsystem without threading four references
/// through every call.
#[derive(Copy, Clone)]
pub struct WalkEnv<'e> {
    /// Method registry
    pub methods: &'e MethodTable,
    /// Compiled metadata registry
    pub code: &'e CodeTable,
    /// Heap bridge (read barrier + compaction pinning)
    pub heap: &'e Heap,
    /// Deoptimization collaborator for writes into compiled frames
    pub deopt: &'e dyn Deoptimizer,
}

/// Cursor position within the walk
#[derive(Debug, Copy, Clone)]
pub(crate) enum Cursor {
    /// An explicit interpreted frame
    Interpreted {
        /// Logical fragment index
        fragment: usize,
        /// Index into the fragment's frame vector
        frame: usize,
    },
    /// A compiled frame, possibly one of its inline levels
    Compiled {
        /// Logical fragment index
        fragment: usize,
        /// Frame base offset in the fragment's memory
        frame_base: usize,
        /// Native pc executing in this frame
        pc: u64,
        /// `Some(i)` while visiting inline level `i` (0 = outermost)
        inline: Option<usize>,
    },
    /// A compiled-to-runtime transition marker
    Transition,
}

/// Walks one thread's call stack and answers frame-local queries
pub struct StackWalker<'a> {
    pub(crate) thread: &'a VmThread,
    pub(crate) env: WalkEnv<'a>,
    kind: StackWalkKind,
    pub(crate) stack: MutexGuard<'a, ManagedStack>,
    _no_compaction: CompactionGuard<'a>,
    pub(crate) context: MachineContext,
    pub(crate) cursor: Option<Cursor>,
    depth: u64,
}

impl<'a> StackWalker<'a> {
    /// Create a walker over a thread's stack
    ///
    /// # Panics
    ///
    /// Panics if the target is neither the current thread nor suspended.
    /// Walking a running foreign thread is a caller contract violation,
    /// not a recoverable condition.
    pub fn new(thread: &'a VmThread, env: WalkEnv<'a>, kind: StackWalkKind) -> Self {
        assert!(
            thread.is_current() || thread.state() == ThreadState::Suspended,
            "cannot walk thread {}: neither current nor suspended",
            thread.id().as_u64()
        );
        let no_compaction = env.heap.pin_compaction();
        let stack = thread.stack().lock();
        Self {
            thread,
            env,
            kind,
            stack,
            _no_compaction: no_compaction,
            context: MachineContext::empty(),
            cursor: None,
            depth: 0,
        }
    }

    /// Visit every logical frame, innermost first
    ///
    /// The visitor returns `false` to stop the walk early.
    pub fn walk<F>(&mut self, visitor: F)
    where
        F: FnMut(&mut Self) -> bool,
    {
        self.walk_with_transitions(false, visitor)
    }

    /// [`StackWalker::walk`], optionally visiting transition markers
    ///
    /// With `include_transitions`, each compiled-to-runtime transition is
    /// visited as a frame whose method is `None`.
    pub fn walk_with_transitions<F>(&mut self, include_transitions: bool, mut visitor: F)
    where
        F: FnMut(&mut Self) -> bool,
    {
        self.depth = 0;
        self.cursor = None;

        let num_fragments = self.stack.len();
        'fragments: for fragment_idx in 0..num_fragments {
            enum Shape {
                Interpreted(usize),
                Compiled(u64),
            }
            let shape = match self.stack.fragment(fragment_idx) {
                Some(StackFragment::Interpreted(f)) => Shape::Interpreted(f.len()),
                Some(StackFragment::Compiled(c)) => Shape::Compiled(c.top_pc()),
                None => break,
            };

            match shape {
                Shape::Interpreted(len) => {
                    for frame in (0..len).rev() {
                        self.cursor = Some(Cursor::Interpreted {
                            fragment: fragment_idx,
                            frame,
                        });
                        if !visitor(self) {
                            break 'fragments;
                        }
                        self.depth += 1;
                    }
                }
                Shape::Compiled(top_pc) => {
                    {
                        let snapshot = Self::compiled(&self.stack, fragment_idx).snapshot();
                        self.context = MachineContext::from_snapshot(snapshot);
                    }
                    let mut pc = top_pc;
                    let mut frame_base = 0usize;

                    loop {
                        let method_word =
                            match Self::compiled(&self.stack, fragment_idx).method_word(frame_base) {
                                Some(word) => word,
                                None => {
                                    debug_assert!(false, "compiled fragment ends without a transition marker");
                                    break;
                                }
                            };

                        if method_word == 0 {
                            // Transition back into the runtime.
                            if include_transitions {
                                self.cursor = Some(Cursor::Transition);
                                if !visitor(self) {
                                    break 'fragments;
                                }
                                self.depth += 1;
                            }
                            break;
                        }

                        let method_id = MethodId::from_raw((method_word - 1) as u32);
                        let info = *self.frame_info_for(method_id);
                        debug_assert!(
                            info.frame_size >= info.return_pc_offset + 8,
                            "frame size {} cannot contain return pc at {}",
                            info.frame_size,
                            info.return_pc_offset
                        );

                        if self.kind == StackWalkKind::IncludeInlinedFrames {
                            let inline_len = self
                                .stack_map_at(method_id, pc)
                                .map_or(0, |map| map.inline_info.len());
                            // Innermost inline level first.
                            for inline in (0..inline_len).rev() {
                                self.cursor = Some(Cursor::Compiled {
                                    fragment: fragment_idx,
                                    frame_base,
                                    pc,
                                    inline: Some(inline),
                                });
                                if !visitor(self) {
                                    break 'fragments;
                                }
                                self.depth += 1;
                            }
                        }

                        self.cursor = Some(Cursor::Compiled {
                            fragment: fragment_idx,
                            frame_base,
                            pc,
                            inline: None,
                        });
                        if !visitor(self) {
                            break 'fragments;
                        }
                        self.depth += 1;

                        // Step outward: return address, then frame size.
                        let return_slot = frame_base + info.return_pc_offset as usize;
                        let mut return_pc =
                            match Self::compiled(&self.stack, fragment_idx).read_u64(return_slot) {
                                Some(pc) => pc,
                                None => {
                                    debug_assert!(false, "return pc slot outside captured fragment");
                                    break;
                                }
                            };

                        if return_pc == EXIT_SENTINEL {
                            // Instrumentation wrapped this call; the real
                            // return address lives in the redirection table.
                            let redirected = self.thread.instrumentation().resolve(frame_base);
                            match redirected {
                                Some(original) => return_pc = original,
                                None => {
                                    debug_assert!(
                                        self.thread.instrumentation().is_exempt(method_id),
                                        "exit sentinel with no redirection entry for method {}",
                                        method_id.as_u32()
                                    );
                                    break;
                                }
                            }
                        }

                        {
                            let fragment = Self::compiled(&self.stack, fragment_idx);
                            if let Some(bytes) = fragment.frame_bytes(frame_base, info.frame_size) {
                                self.context.fill_callee_saves(bytes, &info);
                            }
                        }

                        pc = return_pc;
                        frame_base += info.frame_size as usize;
                    }
                }
            }
        }

        self.cursor = None;
    }

    /// Number of logical frames a full walk of this thread would visit
    pub fn compute_num_frames(thread: &VmThread, env: WalkEnv<'_>, kind: StackWalkKind) -> usize {
        let mut walker = StackWalker::new(thread, env, kind);
        let mut count = 0usize;
        walker.walk(|_| {
            count += 1;
            true
        });
        count
    }

    /// Report every live managed reference on the stack to the collector
    ///
    /// Interpreted frames report their flagged slots; compiled frames
    /// report exactly the slots and registers the liveness masks mark.
    /// Roots are reported raw: the collector is the consumer, so no read
    /// barrier applies.
    pub fn visit_roots<F>(&mut self, mut visitor: F)
    where
        F: FnMut(ObjectRef),
    {
        self.walk(|walker| {
            match walker.cursor {
                Some(Cursor::Interpreted { fragment, frame }) => {
                    if let Some(StackFragment::Interpreted(f)) = walker.stack.fragment(fragment) {
                        f.frames()[frame].visit_references(|_, obj| visitor(obj));
                    }
                }
                Some(Cursor::Compiled {
                    fragment,
                    frame_base,
                    pc,
                    inline: None,
                }) => {
                    let method = match Self::compiled(&walker.stack, fragment).method_at(frame_base)
                    {
                        Some(method) => method,
                        None => return true,
                    };
                    if let Some(map) = walker.stack_map_at(method, pc) {
                        let compiled = Self::compiled(&walker.stack, fragment);
                        for slot in map.stack_mask.iter_set() {
                            if let Some(raw) = compiled.read_u32(frame_base + slot as usize * 4) {
                                visitor(ObjectRef::from_u32(raw));
                            }
                        }
                        for reg in 0..32u16 {
                            if map.register_bit(reg) {
                                if let Some(value) = walker.context.get(reg) {
                                    visitor(ObjectRef::from_u32(value as u32));
                                }
                            }
                        }
                    }
                }
                // Inline levels share the physical frame's masks.
                _ => {}
            }
            true
        });
    }

    // ========================================================================
    // Frame accessors (valid while a visit callback runs)
    // ========================================================================

    /// The method executing in the current logical frame
    ///
    /// `None` at a transition marker.
    pub fn method(&self) -> Option<MethodId> {
        match self.cursor? {
            Cursor::Interpreted { fragment, frame } => match self.stack.fragment(fragment) {
                Some(StackFragment::Interpreted(f)) => Some(f.frames()[frame].method()),
                _ => None,
            },
            Cursor::Compiled {
                fragment,
                frame_base,
                pc,
                inline,
            } => {
                let physical = Self::compiled(&self.stack, fragment).method_at(frame_base)?;
                match inline {
                    None => Some(physical),
                    Some(level) => {
                        let map = self.stack_map_at(physical, pc)?;
                        Some(map.inline_info.get(level)?.method)
                    }
                }
            }
            Cursor::Transition => None,
        }
    }

    /// Source pc of the current logical frame
    ///
    /// [`NO_SOURCE_PC`] when no map covers the current native pc.
    pub fn source_pc(&self) -> u32 {
        match self.cursor {
            Some(Cursor::Interpreted { fragment, frame }) => match self.stack.fragment(fragment) {
                Some(StackFragment::Interpreted(f)) => f.frames()[frame].dex_pc(),
                _ => NO_SOURCE_PC,
            },
            Some(Cursor::Compiled {
                fragment,
                frame_base,
                pc,
                inline,
            }) => {
                let physical = match Self::compiled(&self.stack, fragment).method_at(frame_base) {
                    Some(method) => method,
                    None => return NO_SOURCE_PC,
                };
                match self.stack_map_at(physical, pc) {
                    Some(map) => match inline {
                        None => map.source_pc,
                        Some(level) => map
                            .inline_info
                            .get(level)
                            .map_or(NO_SOURCE_PC, |e| e.source_pc),
                    },
                    None => NO_SOURCE_PC,
                }
            }
            Some(Cursor::Transition) | None => NO_SOURCE_PC,
        }
    }

    /// Whether the current frame is interpreted
    pub fn is_interpreted(&self) -> bool {
        matches!(self.cursor, Some(Cursor::Interpreted { .. }))
    }

    /// Whether the current visit is an inline level of a compiled frame
    pub fn is_inline_frame(&self) -> bool {
        matches!(
            self.cursor,
            Some(Cursor::Compiled { inline: Some(_), .. })
        )
    }

    /// Number of logical frames visited before the current one
    pub fn depth(&self) -> u64 {
        self.depth
    }

    /// Identity token for the current frame, stable for this walk
    pub fn frame_id(&self) -> FrameId {
        FrameId(self.depth)
    }

    // ========================================================================
    // Internal resolution helpers (shared with the decoder)
    // ========================================================================

    pub(crate) fn compiled(stack: &ManagedStack, fragment: usize) -> &CompiledFragment {
        match stack.fragment(fragment) {
            Some(StackFragment::Compiled(c)) => c,
            _ => unreachable!("cursor points into a compiled fragment"),
        }
    }

    /// Frame header for a method: its compiled header, or the shared
    /// runtime-synthesized one for runtime-internal dispatch.
    pub(crate) fn frame_info_for(&self, method: MethodId) -> &FrameInfo {
        let descriptor = self.env.methods.get(method);
        let runtime_managed = descriptor.map_or(true, |m| {
            m.is_runtime_internal() || m.is_native() || m.is_proxy() || !m.has_code()
        });
        if runtime_managed {
            return runtime_frame_info();
        }
        match self.env.code.get(method) {
            Some(code) => &code.frame_info,
            // Compiled frame for a method with no registered code: decode
            // with the runtime layout so the walk can continue.
            None => runtime_frame_info(),
        }
    }

    pub(crate) fn code_for(&self, method: MethodId) -> Option<&'a CompiledCode> {
        self.env.code.get(method).map(|arc| arc.as_ref())
    }

    pub(crate) fn stack_map_at(&self, method: MethodId, pc: u64) -> Option<&'a StackMap> {
        let code = self.code_for(method)?;
        code.stack_map_for_native_pc(code.native_pc_offset(pc))
    }

    /// The register map governing the current logical frame: the inline
    /// level's private map inside an inline chain, else the physical map's.
    pub(crate) fn cur_dex_register_map(&self) -> Option<&'a DexRegisterMap> {
        match self.cursor? {
            Cursor::Compiled {
                fragment,
                frame_base,
                pc,
                inline,
            } => {
                let physical = Self::compiled(&self.stack, fragment).method_at(frame_base)?;
                let map = self.stack_map_at(physical, pc)?;
                match inline {
                    None => map.dex_register_map.as_ref(),
                    Some(level) => map.inline_info.get(level)?.dex_register_map.as_ref(),
                }
            }
            _ => None,
        }
    }

    /// The physical stack map covering the current compiled frame
    pub(crate) fn cur_stack_map(&self) -> Option<&'a StackMap> {
        match self.cursor? {
            Cursor::Compiled {
                fragment,
                frame_base,
                pc,
                ..
            } => {
                let physical = Self::compiled(&self.stack, fragment).method_at(frame_base)?;
                self.stack_map_at(physical, pc)
            }
            _ => None,
        }
    }

    /// The method descriptor of the current logical frame
    pub(crate) fn cur_method_descriptor(&self) -> Option<(MethodId, &'a Method)> {
        let id = self.method()?;
        Some((id, self.env.methods.get(id)?))
    }

    /// The current interpreted frame, if the cursor is on one
    pub(crate) fn cur_interpreted(&self) -> Option<&InterpretedFrame> {
        match self.cursor? {
            Cursor::Interpreted { fragment, frame } => match self.stack.fragment(fragment) {
                Some(StackFragment::Interpreted(f)) => f.frames().get(frame),
                _ => None,
            },
            _ => None,
        }
    }

    /// Mutable access to the current interpreted frame
    pub(crate) fn cur_interpreted_mut(&mut self) -> Option<&mut InterpretedFrame> {
        match self.cursor? {
            Cursor::Interpreted { fragment, frame } => match self.stack.fragment_mut(fragment) {
                Some(StackFragment::Interpreted(f)) => f.frame_mut(frame),
                _ => None,
            },
            _ => None,
        }
    }
}
