//! Compiler-emitted method metadata consumed during stack walks
//!
//! Compiled frames store nothing about themselves at runtime; their layout
//! is described entirely by side tables the optimizing compiler emits per
//! method. This module models that consumed interface:
//!
//! - [`FrameInfo`]: the compiled-method header (frame size, return-pc slot,
//!   callee-save spill masks)
//! - [`StackMap`]: per native-instruction-offset metadata mapping back to a
//!   source pc, register/stack liveness masks, and inline-call chains
//! - [`DexRegisterLocation`]: where one virtual register lives at one point
//! - [`CompiledCode`]: a method's native code range plus its maps
//! - [`CodeTable`]: registry from method handles to their compiled metadata
//!
//! # Frame layout
//!
//! ```text
//! frame base + frame_size ──────────────────┐ (caller's frame follows)
//!   [return pc]            8 bytes          │ at return_pc_offset
//!   [core spill slots]     8 bytes each     │ ascending register id,
//!   [fpu spill slots]      8 bytes each     │ last slot below return pc
//!   ...vreg stack slots, outgoing args...   │
//!   [method id]            8 bytes          │ at frame base
//! frame base ───────────────────────────────┘
//! ```

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tarn_bytecode::MethodId;

/// Compiled-method frame header
///
/// A pure function of (method, optimization state): the frame size must
/// equal the byte gap between this frame's base and its caller's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Total frame size in bytes
    pub frame_size: u32,

    /// Byte offset of the return-pc slot from the frame base
    pub return_pc_offset: u32,

    /// Core registers spilled in this frame (bit per register id)
    pub core_spill_mask: u32,

    /// FPU registers spilled in this frame (bit per register id)
    pub fpu_spill_mask: u32,
}

impl FrameInfo {
    /// Create a header with no spilled registers
    pub const fn new(frame_size: u32, return_pc_offset: u32) -> Self {
        Self {
            frame_size,
            return_pc_offset,
            core_spill_mask: 0,
            fpu_spill_mask: 0,
        }
    }

    /// Create a header with spill masks
    pub const fn with_spills(
        frame_size: u32,
        return_pc_offset: u32,
        core_spill_mask: u32,
        fpu_spill_mask: u32,
    ) -> Self {
        Self {
            frame_size,
            return_pc_offset,
            core_spill_mask,
            fpu_spill_mask,
        }
    }

    /// Byte offset of a spilled core register's slot within the frame
    ///
    /// Spill slots sit directly below the return-pc slot, ascending
    /// register id, the highest-id register closest to the return pc.
    pub fn core_spill_offset(&self, reg: u16) -> Option<u32> {
        if reg >= 32 || self.core_spill_mask & (1 << reg) == 0 {
            return None;
        }
        let below = (self.core_spill_mask >> (reg + 1)).count_ones();
        Some(self.return_pc_offset - (below + 1) * 8)
    }

    /// Byte offset of a spilled FPU register's slot within the frame
    ///
    /// FPU spills sit below the core spill area, same ordering.
    pub fn fpu_spill_offset(&self, reg: u16) -> Option<u32> {
        if reg >= 32 || self.fpu_spill_mask & (1 << reg) == 0 {
            return None;
        }
        let core_bytes = self.core_spill_mask.count_ones() * 8;
        let below = (self.fpu_spill_mask >> (reg + 1)).count_ones();
        Some(self.return_pc_offset - core_bytes - (below + 1) * 8)
    }
}

/// Where a virtual register's value lives at one native program point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DexRegisterLocation {
    /// Provably dead at this point
    None,

    /// 32-bit word at the given byte offset from the frame base
    InStack {
        /// Byte offset from the frame base
        offset: u32,
    },

    /// Low 32 bits of a core machine register
    InRegister {
        /// Machine register id
        id: u16,
    },

    /// High 32 bits of a core machine register (upper half of a pair)
    InRegisterHigh {
        /// Machine register id
        id: u16,
    },

    /// Low 32 bits of an FPU register
    InFpuRegister {
        /// FPU register id
        id: u16,
    },

    /// High 32 bits of an FPU register (upper half of a pair)
    InFpuRegisterHigh {
        /// FPU register id
        id: u16,
    },

    /// Compile-time constant folded into the code
    Constant {
        /// The embedded value
        value: i32,
    },
}

/// One location per declared virtual register
#[derive(Debug, Clone, Default)]
pub struct DexRegisterMap {
    locations: Vec<DexRegisterLocation>,
}

impl DexRegisterMap {
    /// Build a map from per-register locations
    pub fn new(locations: Vec<DexRegisterLocation>) -> Self {
        Self { locations }
    }

    /// Location of the given virtual register
    ///
    /// Registers beyond the mapped range are dead.
    #[inline]
    pub fn location(&self, reg: u16) -> DexRegisterLocation {
        self.locations
            .get(reg as usize)
            .copied()
            .unwrap_or(DexRegisterLocation::None)
    }

    /// Number of mapped registers
    #[inline]
    pub fn len(&self) -> usize {
        self.locations.len()
    }

    /// Whether the map covers no registers
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

/// Bitset over a frame's 32-bit stack slots
///
/// A set bit means the slot holds a live managed reference at the map's
/// program point. Unset slots may contain stale bit patterns.
#[derive(Debug, Clone, Default)]
pub struct StackMask {
    words: Vec<u64>,
}

impl StackMask {
    /// Empty mask (no slot holds a live reference)
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a mask from slot indices
    pub fn from_slots(slots: &[u32]) -> Self {
        let mut mask = Self::new();
        for &slot in slots {
            mask.set(slot);
        }
        mask
    }

    /// Mark a slot as holding a live reference
    pub fn set(&mut self, slot: u32) {
        let word = (slot / 64) as usize;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (slot % 64);
    }

    /// Whether a slot holds a live reference
    #[inline]
    pub fn is_set(&self, slot: u32) -> bool {
        self.words
            .get((slot / 64) as usize)
            .map_or(false, |w| w & (1 << (slot % 64)) != 0)
    }

    /// Iterate over set slot indices, ascending
    pub fn iter_set(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, &w)| {
            (0..64)
                .filter(move |bit| w & (1 << bit) != 0)
                .map(move |bit| wi as u32 * 64 + bit)
        })
    }
}

/// One inlined call level at a native program point
#[derive(Debug, Clone)]
pub struct InlineInfoEntry {
    /// Source pc inside the inlined callee
    pub source_pc: u32,

    /// The inlined method
    pub method: MethodId,

    /// The inlined callee's own register locations
    pub dex_register_map: Option<DexRegisterMap>,
}

/// Per native-instruction-offset metadata
#[derive(Debug, Clone)]
pub struct StackMap {
    /// Offset from the method's native code start
    pub native_pc_offset: u32,

    /// Source pc this native point maps back to
    pub source_pc: u32,

    /// Core registers holding live references (bit per register id)
    pub register_mask: u32,

    /// Stack slots holding live references
    pub stack_mask: StackMask,

    /// Register locations for the physical frame's method
    pub dex_register_map: Option<DexRegisterMap>,

    /// Inline chain, outermost-first as emitted; empty when nothing is inlined
    pub inline_info: Vec<InlineInfoEntry>,
}

impl StackMap {
    /// Create a map with no liveness and no locations
    pub fn new(native_pc_offset: u32, source_pc: u32) -> Self {
        Self {
            native_pc_offset,
            source_pc,
            register_mask: 0,
            stack_mask: StackMask::new(),
            dex_register_map: None,
            inline_info: Vec::new(),
        }
    }

    /// Whether this point sits inside at least one inlined call
    #[inline]
    pub fn has_inline_info(&self) -> bool {
        !self.inline_info.is_empty()
    }

    /// Whether the given core register holds a live reference here
    #[inline]
    pub fn register_bit(&self, reg: u16) -> bool {
        reg < 32 && self.register_mask & (1 << reg) != 0
    }
}

/// A method's compiled form: native code range plus its side tables
#[derive(Debug, Clone)]
pub struct CompiledCode {
    /// Address where the method's native code begins
    pub code_start: u64,

    /// Frame header
    pub frame_info: FrameInfo,

    /// Stack maps sorted by native pc offset
    pub stack_maps: Vec<StackMap>,
}

impl CompiledCode {
    /// Create compiled metadata; maps are sorted on construction
    pub fn new(code_start: u64, frame_info: FrameInfo, mut stack_maps: Vec<StackMap>) -> Self {
        stack_maps.sort_by_key(|m| m.native_pc_offset);
        Self {
            code_start,
            frame_info,
            stack_maps,
        }
    }

    /// Offset of a native pc inside this method's code
    #[inline]
    pub fn native_pc_offset(&self, pc: u64) -> u32 {
        debug_assert!(pc >= self.code_start);
        (pc - self.code_start) as u32
    }

    /// The map covering a native pc offset
    ///
    /// Returns the nearest map at or before the offset, which also covers
    /// return addresses pointing just past a call instruction.
    pub fn stack_map_for_native_pc(&self, offset: u32) -> Option<&StackMap> {
        match self
            .stack_maps
            .binary_search_by_key(&offset, |m| m.native_pc_offset)
        {
            Ok(i) => Some(&self.stack_maps[i]),
            Err(0) => None,
            Err(i) => Some(&self.stack_maps[i - 1]),
        }
    }
}

/// Registry from method handles to compiled metadata
///
/// Methods without an entry are interpreter-only (or runtime-internal).
#[derive(Debug, Default)]
pub struct CodeTable {
    entries: FxHashMap<MethodId, Arc<CompiledCode>>,
}

impl CodeTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach compiled metadata to a method
    pub fn register(&mut self, method: MethodId, code: CompiledCode) {
        self.entries.insert(method, Arc::new(code));
    }

    /// Compiled metadata for a method, if it was compiled
    #[inline]
    pub fn get(&self, method: MethodId) -> Option<&Arc<CompiledCode>> {
        self.entries.get(&method)
    }
}

/// Frame header shared by runtime-internal dispatch frames
///
/// Frames with no declaring class (native/abstract/proxy bridges, runtime
/// stubs) have no method-specific compiled header; they all use this
/// runtime-synthesized layout.
pub fn runtime_frame_info() -> &'static FrameInfo {
    static INFO: Lazy<FrameInfo> = Lazy::new(|| FrameInfo::new(32, 24));
    &INFO
}
