//! Integration tests for stack traversal and register recovery
//!
//! Builds mixed interpreted/compiled stacks out of captured fragments and
//! checks visit order, counting, liveness-mask enforcement, constant
//! decoding, instrumentation redirection, and deoptimize-on-write.

use std::sync::Arc;
use tarn_bytecode::{Method, MethodId, MethodTable};
use tarn_core::{
    CodeTable, CompiledCode, CompiledFragmentBuilder, DeoptimizationQueue, DexRegisterLocation,
    DexRegisterMap, FrameInfo, Heap, InlineInfoEntry, InterpretedFragment, InterpretedFrame,
    ObjectRef, ReadBarrier, RegisterSnapshot, StackFragment, StackMap, StackWalkKind, StackWalker,
    VRegKind, VmThread, WalkEnv, EXIT_SENTINEL,
};

struct Runtime {
    methods: MethodTable,
    code: CodeTable,
    heap: Heap,
    deopt: Arc<DeoptimizationQueue>,
}

impl Runtime {
    fn new() -> Self {
        Self {
            methods: MethodTable::new(),
            code: CodeTable::new(),
            heap: Heap::non_moving(),
            deopt: Arc::new(DeoptimizationQueue::new()),
        }
    }

    fn with_heap(heap: Heap) -> Self {
        Self {
            heap,
            ..Self::new()
        }
    }

    fn env(&self) -> WalkEnv<'_> {
        WalkEnv {
            methods: &self.methods,
            code: &self.code,
            heap: &self.heap,
            deopt: self.deopt.as_ref(),
        }
    }

    fn method(&mut self, name: &str, num_registers: u16) -> MethodId {
        self.methods
            .register(Method::new(name, num_registers, 0))
            .unwrap()
    }
}

fn current_thread() -> Arc<VmThread> {
    let thread = Arc::new(VmThread::new());
    thread.attach_current();
    thread
}

/// The canonical two-fragment scenario:
/// A (interpreted, 3 registers) called from C, inlined at sourcePc=10 into
/// B (compiled, 64-byte frame).
fn inline_scenario(runtime: &mut Runtime) -> (Arc<VmThread>, MethodId, MethodId, MethodId) {
    let a = runtime.method("A.run", 3);
    let b = runtime.method("B.call", 4);
    let c = runtime.method("C.helper", 2);

    let b_info = FrameInfo::new(64, 56);
    let mut map = StackMap::new(16, 42);
    map.inline_info.push(InlineInfoEntry {
        source_pc: 10,
        method: c,
        dex_register_map: None,
    });
    runtime
        .code
        .register(b, CompiledCode::new(0x1000, b_info, vec![map]));

    let mut builder = CompiledFragmentBuilder::new();
    builder.push_frame(b, &b_info, 0, |_| {});
    let compiled = builder.finish(0x1010, RegisterSnapshot::default());

    let a_descriptor = runtime.methods.get(a).unwrap().clone();
    let mut a_frame = InterpretedFrame::new(a, &a_descriptor, 5);
    a_frame.set_vreg(0, 11);
    let mut interpreted = InterpretedFragment::new();
    interpreted.push_frame(a_frame);

    let thread = current_thread();
    {
        let mut stack = thread.stack().lock();
        // Oldest fragment first: B's compiled fragment, then A's.
        stack.push_fragment(StackFragment::Compiled(compiled));
        stack.push_fragment(StackFragment::Interpreted(interpreted));
    }
    (thread, a, b, c)
}

#[test]
fn test_visit_order_interpreted_then_inline_then_physical() {
    let mut runtime = Runtime::new();
    let (thread, a, b, c) = inline_scenario(&mut runtime);

    let mut visits = Vec::new();
    let mut walker = StackWalker::new(&thread, runtime.env(), StackWalkKind::IncludeInlinedFrames);
    walker.walk(|w| {
        visits.push((w.method(), w.source_pc(), w.is_interpreted(), w.is_inline_frame(), w.depth()));
        true
    });

    assert_eq!(
        visits,
        vec![
            (Some(a), 5, true, false, 0),
            (Some(c), 10, false, true, 1),
            (Some(b), 42, false, false, 2),
        ]
    );
}

#[test]
fn test_compute_num_frames_matches_visit_count() {
    let mut runtime = Runtime::new();
    let (thread, ..) = inline_scenario(&mut runtime);

    for kind in [StackWalkKind::IncludeInlinedFrames, StackWalkKind::SkipInlinedFrames] {
        let mut count = 0usize;
        let mut walker = StackWalker::new(&thread, runtime.env(), kind);
        walker.walk(|_| {
            count += 1;
            true
        });
        assert_eq!(StackWalker::compute_num_frames(&thread, runtime.env(), kind), count);
    }

    // Skipping inline frames drops exactly the one inline level.
    assert_eq!(
        StackWalker::compute_num_frames(&thread, runtime.env(), StackWalkKind::SkipInlinedFrames),
        2
    );
}

#[test]
fn test_inline_levels_expand_to_n_plus_one_visits() {
    let mut runtime = Runtime::new();
    let outer = runtime.method("Outer.m", 4);
    let mid = runtime.method("Mid.m", 2);
    let leaf = runtime.method("Leaf.m", 1);

    let info = FrameInfo::new(64, 56);
    let mut map = StackMap::new(8, 3);
    // Emitted outermost-first: mid inlined into outer, leaf into mid.
    map.inline_info.push(InlineInfoEntry {
        source_pc: 20,
        method: mid,
        dex_register_map: None,
    });
    map.inline_info.push(InlineInfoEntry {
        source_pc: 30,
        method: leaf,
        dex_register_map: None,
    });
    runtime
        .code
        .register(outer, CompiledCode::new(0x4000, info, vec![map]));

    let mut builder = CompiledFragmentBuilder::new();
    builder.push_frame(outer, &info, 0, |_| {});
    let thread = current_thread();
    thread
        .stack()
        .lock()
        .push_fragment(StackFragment::Compiled(
            builder.finish(0x4008, RegisterSnapshot::default()),
        ));

    let mut visits = Vec::new();
    let mut walker = StackWalker::new(&thread, runtime.env(), StackWalkKind::IncludeInlinedFrames);
    walker.walk(|w| {
        visits.push((w.method().unwrap(), w.source_pc()));
        true
    });

    // Two inline levels produce exactly three visits, innermost first.
    assert_eq!(visits, vec![(leaf, 30), (mid, 20), (outer, 3)]);
}

#[test]
fn test_early_termination_stops_walk() {
    let mut runtime = Runtime::new();
    let (thread, ..) = inline_scenario(&mut runtime);

    let mut count = 0usize;
    let mut walker = StackWalker::new(&thread, runtime.env(), StackWalkKind::IncludeInlinedFrames);
    walker.walk(|_| {
        count += 1;
        false
    });
    assert_eq!(count, 1);
}

#[test]
fn test_transitions_are_visited_on_request() {
    let mut runtime = Runtime::new();
    let (thread, ..) = inline_scenario(&mut runtime);

    let mut methods = Vec::new();
    let mut walker = StackWalker::new(&thread, runtime.env(), StackWalkKind::IncludeInlinedFrames);
    walker.walk_with_transitions(true, |w| {
        methods.push(w.method());
        true
    });

    // A, C, B, then the compiled-to-runtime transition marker.
    assert_eq!(methods.len(), 4);
    assert_eq!(methods[3], None);
}

#[test]
fn test_no_false_positive_references() {
    let mut runtime = Runtime::new();
    let m = runtime.method("M.opt", 4);

    let info = FrameInfo::new(64, 56);
    let mut map = StackMap::new(4, 9);
    // v0 in a stack slot, v1 in a machine register; neither liveness bit
    // set, and both holding plausible-looking stale pointers.
    map.dex_register_map = Some(DexRegisterMap::new(vec![
        DexRegisterLocation::InStack { offset: 16 },
        DexRegisterLocation::InRegister { id: 2 },
    ]));
    runtime
        .code
        .register(m, CompiledCode::new(0x2000, info, vec![map]));

    let mut builder = CompiledFragmentBuilder::new();
    builder.push_frame(m, &info, 0, |f| {
        f.set_u32(16, 0xdead_0001);
    });
    let snapshot = RegisterSnapshot {
        core: vec![(2, 0xdead_0002)],
        fpu: vec![],
    };
    let thread = current_thread();
    thread
        .stack()
        .lock()
        .push_fragment(StackFragment::Compiled(builder.finish(0x2004, snapshot)));

    let mut walker = StackWalker::new(&thread, runtime.env(), StackWalkKind::IncludeInlinedFrames);
    walker.walk(|w| {
        // Reference reads refuse both locations.
        assert_eq!(w.get_vreg(0, VRegKind::Reference), None);
        assert_eq!(w.get_vreg(1, VRegKind::Reference), None);
        // The same slots decode fine as integers.
        assert_eq!(w.get_vreg(0, VRegKind::Int), Some(0xdead_0001));
        assert_eq!(w.get_vreg(1, VRegKind::Int), Some(0xdead_0002));
        true
    });
}

#[test]
fn test_reference_reads_require_and_honor_masks() {
    let mut runtime = Runtime::new();
    let m = runtime.method("M.live", 4);

    let info = FrameInfo::new(64, 56);
    let mut map = StackMap::new(4, 9);
    map.stack_mask.set(4); // byte offset 16
    map.register_mask = 1 << 2;
    map.dex_register_map = Some(DexRegisterMap::new(vec![
        DexRegisterLocation::InStack { offset: 16 },
        DexRegisterLocation::InRegister { id: 2 },
    ]));
    runtime
        .code
        .register(m, CompiledCode::new(0x2000, info, vec![map]));

    let mut builder = CompiledFragmentBuilder::new();
    builder.push_frame(m, &info, 0, |f| {
        f.set_u32(16, 0x80);
    });
    let snapshot = RegisterSnapshot {
        core: vec![(2, 0x90)],
        fpu: vec![],
    };
    let thread = current_thread();
    thread
        .stack()
        .lock()
        .push_fragment(StackFragment::Compiled(builder.finish(0x2004, snapshot)));

    let mut walker = StackWalker::new(&thread, runtime.env(), StackWalkKind::IncludeInlinedFrames);
    walker.walk(|w| {
        assert_eq!(w.get_vreg(0, VRegKind::Reference), Some(0x80));
        assert_eq!(w.get_vreg(1, VRegKind::Reference), Some(0x90));
        true
    });
}

#[test]
fn test_constant_zero_is_null_other_constants_are_not_references() {
    let mut runtime = Runtime::new();
    let m = runtime.method("M.const", 3);

    let info = FrameInfo::new(32, 24);
    let mut map = StackMap::new(0, 1);
    map.dex_register_map = Some(DexRegisterMap::new(vec![
        DexRegisterLocation::Constant { value: 0 },
        DexRegisterLocation::Constant { value: 5 },
        DexRegisterLocation::None,
    ]));
    runtime
        .code
        .register(m, CompiledCode::new(0x3000, info, vec![map]));

    let mut builder = CompiledFragmentBuilder::new();
    builder.push_frame(m, &info, 0, |_| {});
    let thread = current_thread();
    thread
        .stack()
        .lock()
        .push_fragment(StackFragment::Compiled(
            builder.finish(0x3000, RegisterSnapshot::default()),
        ));

    let mut walker = StackWalker::new(&thread, runtime.env(), StackWalkKind::IncludeInlinedFrames);
    walker.walk(|w| {
        // Literal zero is a found null.
        assert_eq!(w.get_vreg(0, VRegKind::Reference), Some(0));
        // Any other constant is not a reference.
        assert_eq!(w.get_vreg(1, VRegKind::Reference), None);
        assert_eq!(w.get_vreg(1, VRegKind::Int), Some(5));
        // Dead is dead.
        assert_eq!(w.get_vreg(2, VRegKind::Int), None);
        true
    });
}

#[test]
fn test_register_accessibility_is_monotone_across_frames() {
    let mut runtime = Runtime::new();
    let inner = runtime.method("Inner.m", 2);
    let outer = runtime.method("Outer.m", 2);

    // The inner frame spills callee-saved register 9; register 1 is
    // caller-saved and dies at the first unwind.
    let inner_info = FrameInfo::with_spills(64, 56, 1 << 9, 0);
    let outer_info = FrameInfo::new(48, 40);

    let mut inner_map = StackMap::new(8, 1);
    inner_map.dex_register_map = Some(DexRegisterMap::new(vec![
        DexRegisterLocation::InRegister { id: 1 },
        DexRegisterLocation::InRegister { id: 9 },
    ]));
    runtime
        .code
        .register(inner, CompiledCode::new(0x5000, inner_info, vec![inner_map]));

    let mut outer_map = StackMap::new(32, 7);
    outer_map.dex_register_map = Some(DexRegisterMap::new(vec![
        DexRegisterLocation::InRegister { id: 1 },
        DexRegisterLocation::InRegister { id: 9 },
    ]));
    runtime
        .code
        .register(outer, CompiledCode::new(0x6000, outer_info, vec![outer_map]));

    let mut builder = CompiledFragmentBuilder::new();
    builder.push_frame(inner, &inner_info, 0x6020, |f| {
        // The caller's register 9 value, preserved in the spill slot.
        f.set_u64(48, 0x9999);
    });
    builder.push_frame(outer, &outer_info, 0, |_| {});
    let snapshot = RegisterSnapshot {
        core: vec![(1, 0x1111), (9, 0x2222)],
        fpu: vec![],
    };
    let thread = current_thread();
    thread
        .stack()
        .lock()
        .push_fragment(StackFragment::Compiled(builder.finish(0x5008, snapshot)));

    let mut reads = Vec::new();
    let mut walker = StackWalker::new(&thread, runtime.env(), StackWalkKind::IncludeInlinedFrames);
    walker.walk(|w| {
        reads.push((w.get_vreg(0, VRegKind::Int), w.get_vreg(1, VRegKind::Int)));
        true
    });

    assert_eq!(
        reads,
        vec![
            // Inner frame: both registers straight from the snapshot.
            (Some(0x1111), Some(0x2222)),
            // Outer frame: caller-saved register 1 is gone; callee-saved
            // register 9 reads the value the inner frame spilled.
            (None, Some(0x9999)),
        ]
    );
}

#[test]
fn test_double_pair_lives_in_fpu_register_halves() {
    let mut runtime = Runtime::new();
    let m = runtime.method("M.fp", 2);

    let info = FrameInfo::new(32, 24);
    let mut map = StackMap::new(0, 1);
    map.dex_register_map = Some(DexRegisterMap::new(vec![
        DexRegisterLocation::InFpuRegister { id: 3 },
        DexRegisterLocation::InFpuRegisterHigh { id: 3 },
    ]));
    runtime
        .code
        .register(m, CompiledCode::new(0xc000, info, vec![map]));

    let mut builder = CompiledFragmentBuilder::new();
    builder.push_frame(m, &info, 0, |_| {});
    let snapshot = RegisterSnapshot {
        core: vec![],
        fpu: vec![(3, 0xaabb_ccdd_1122_3344)],
    };
    let thread = current_thread();
    thread
        .stack()
        .lock()
        .push_fragment(StackFragment::Compiled(builder.finish(0xc000, snapshot)));

    let mut walker = StackWalker::new(&thread, runtime.env(), StackWalkKind::IncludeInlinedFrames);
    walker.walk(|w| {
        assert_eq!(
            w.get_vreg_pair(0, VRegKind::DoubleLo, VRegKind::DoubleHi),
            Some(0xaabb_ccdd_1122_3344)
        );
        assert_eq!(w.get_vreg(0, VRegKind::Float), Some(0x1122_3344));
        assert_eq!(w.get_vreg(1, VRegKind::DoubleHi), Some(0xaabb_ccdd));
        // References never live in FPU registers.
        assert_eq!(w.get_vreg(0, VRegKind::Reference), None);
        true
    });
}

#[test]
fn test_write_to_compiled_frame_promotes_and_requests_deopt() {
    let mut runtime = Runtime::new();
    let (thread, _, b, _) = inline_scenario(&mut runtime);

    let mut walker = StackWalker::new(&thread, runtime.env(), StackWalkKind::IncludeInlinedFrames);
    walker.walk(|w| {
        if w.method() == Some(b) && !w.is_inline_frame() {
            assert!(w.set_vreg(1, 4242, VRegKind::Int));
            // The override is immediately visible through the read path.
            assert_eq!(w.get_vreg(1, VRegKind::Int), Some(4242));
        }
        true
    });
    drop(walker);

    // One deoptimization request for B's physical frame (depth 2).
    let requests = runtime.deopt.drain();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, thread.id());
    assert_eq!(requests[0].1 .0, 2);

    // A later walk still sees the staged value.
    let mut walker = StackWalker::new(&thread, runtime.env(), StackWalkKind::IncludeInlinedFrames);
    walker.walk(|w| {
        if w.method() == Some(b) && !w.is_inline_frame() {
            assert_eq!(w.get_vreg(1, VRegKind::Int), Some(4242));
        }
        true
    });
}

#[test]
fn test_untouched_registers_still_decode_from_compiled_maps() {
    let mut runtime = Runtime::new();
    let m = runtime.method("M.partial", 2);

    let info = FrameInfo::new(64, 56);
    let mut map = StackMap::new(0, 1);
    map.dex_register_map = Some(DexRegisterMap::new(vec![
        DexRegisterLocation::Constant { value: 7 },
        DexRegisterLocation::Constant { value: 8 },
    ]));
    runtime
        .code
        .register(m, CompiledCode::new(0x7000, info, vec![map]));

    let mut builder = CompiledFragmentBuilder::new();
    builder.push_frame(m, &info, 0, |_| {});
    let thread = current_thread();
    thread
        .stack()
        .lock()
        .push_fragment(StackFragment::Compiled(
            builder.finish(0x7000, RegisterSnapshot::default()),
        ));

    let mut walker = StackWalker::new(&thread, runtime.env(), StackWalkKind::IncludeInlinedFrames);
    walker.walk(|w| {
        assert!(w.set_vreg(0, 100, VRegKind::Int));
        // The written register reads back the override; the untouched one
        // still decodes from the stack map.
        assert_eq!(w.get_vreg(0, VRegKind::Int), Some(100));
        assert_eq!(w.get_vreg(1, VRegKind::Int), Some(8));
        true
    });
}

#[test]
fn test_instrumentation_sentinel_is_substituted() {
    let mut runtime = Runtime::new();
    let inner = runtime.method("Inner.w", 1);
    let outer = runtime.method("Outer.w", 1);

    let inner_info = FrameInfo::new(32, 24);
    let outer_info = FrameInfo::new(48, 40);
    runtime.code.register(
        inner,
        CompiledCode::new(0x8000, inner_info, vec![StackMap::new(0, 2)]),
    );
    runtime.code.register(
        outer,
        CompiledCode::new(0x9000, outer_info, vec![StackMap::new(16, 6)]),
    );

    // Instrumentation wrapped the inner call: the frame's return pc slot
    // holds the sentinel, the real pc lives in the redirection table.
    let mut builder = CompiledFragmentBuilder::new();
    let inner_base = builder.push_frame(inner, &inner_info, EXIT_SENTINEL, |_| {});
    builder.push_frame(outer, &outer_info, 0, |_| {});
    let thread = current_thread();
    thread.instrumentation().record(inner_base, 0x9010);
    thread
        .stack()
        .lock()
        .push_fragment(StackFragment::Compiled(
            builder.finish(0x8000, RegisterSnapshot::default()),
        ));

    let mut visits = Vec::new();
    let mut walker = StackWalker::new(&thread, runtime.env(), StackWalkKind::IncludeInlinedFrames);
    walker.walk(|w| {
        visits.push((w.method().unwrap(), w.source_pc()));
        true
    });

    // The walk continued past the sentinel into the outer frame, whose
    // source pc resolves through the substituted return address.
    assert_eq!(visits, vec![(inner, 2), (outer, 6)]);
}

#[test]
fn test_read_barrier_normalizes_decoded_references() {
    struct Forwarding;
    impl ReadBarrier for Forwarding {
        fn finalize_root_read(&self, reference: ObjectRef) -> ObjectRef {
            // Every surviving object moved up by 0x1000.
            ObjectRef::from_u32(reference.as_u32() + 0x1000)
        }
    }

    let mut runtime = Runtime::with_heap(Heap::new(Box::new(Forwarding)));
    let m = runtime.method("M.moved", 1);

    let info = FrameInfo::new(32, 24);
    let mut map = StackMap::new(0, 1);
    map.stack_mask.set(4);
    map.dex_register_map = Some(DexRegisterMap::new(vec![DexRegisterLocation::InStack {
        offset: 16,
    }]));
    runtime
        .code
        .register(m, CompiledCode::new(0xa000, info, vec![map]));

    let mut builder = CompiledFragmentBuilder::new();
    builder.push_frame(m, &info, 0, |f| {
        f.set_u32(16, 0x500);
    });
    let thread = current_thread();
    thread
        .stack()
        .lock()
        .push_fragment(StackFragment::Compiled(
            builder.finish(0xa000, RegisterSnapshot::default()),
        ));

    let mut walker = StackWalker::new(&thread, runtime.env(), StackWalkKind::IncludeInlinedFrames);
    walker.walk(|w| {
        // The stale snapshot address is normalized before being returned.
        assert_eq!(w.get_vreg(0, VRegKind::Reference), Some(0x1500));
        // Primitive reads are untouched.
        assert_eq!(w.get_vreg(0, VRegKind::Int), Some(0x500));
        true
    });
}

#[test]
fn test_visit_roots_reports_exactly_the_live_references() {
    let mut runtime = Runtime::new();
    let compiled_m = runtime.method("M.roots", 2);
    let interp_m = runtime.method("I.roots", 3);

    let info = FrameInfo::new(64, 56);
    let mut map = StackMap::new(0, 1);
    map.stack_mask.set(4); // live reference slot at byte offset 16
    map.register_mask = 1 << 3; // live reference in register 3
    runtime
        .code
        .register(compiled_m, CompiledCode::new(0xb000, info, vec![map]));

    let mut builder = CompiledFragmentBuilder::new();
    builder.push_frame(compiled_m, &info, 0, |f| {
        f.set_u32(16, 0x71);
        f.set_u32(20, 0xbad); // not in the mask, must not be reported
    });
    let snapshot = RegisterSnapshot {
        core: vec![(3, 0x72), (4, 0xbad)],
        fpu: vec![],
    };

    let descriptor = runtime.methods.get(interp_m).unwrap().clone();
    let mut frame = InterpretedFrame::new(interp_m, &descriptor, 0);
    frame.set_vreg_reference(0, ObjectRef::from_u32(0x73));
    frame.set_vreg(1, 0xbad);
    let mut interpreted = InterpretedFragment::new();
    interpreted.push_frame(frame);

    let thread = current_thread();
    {
        let mut stack = thread.stack().lock();
        stack.push_fragment(StackFragment::Compiled(builder.finish(0xb000, snapshot)));
        stack.push_fragment(StackFragment::Interpreted(interpreted));
    }

    let mut roots = Vec::new();
    let mut walker = StackWalker::new(&thread, runtime.env(), StackWalkKind::IncludeInlinedFrames);
    walker.visit_roots(|obj| roots.push(obj.as_u32()));

    assert_eq!(roots, vec![0x73, 0x71, 0x72]);
}

#[test]
#[should_panic(expected = "neither current nor suspended")]
fn test_walking_a_runnable_foreign_thread_aborts() {
    let runtime = Runtime::new();
    // Never attached, never suspended.
    let thread = Arc::new(VmThread::new());
    let _walker = StackWalker::new(&thread, runtime.env(), StackWalkKind::IncludeInlinedFrames);
}
