//! Interpreted frames and frame identity
//!
//! An interpreted frame is the explicit, heap-resident representation of
//! one call: an array slot per declared virtual register plus a parallel
//! is-reference bit per slot. The interpreter creates one on entry; the
//! decoder creates one lazily when a write targets a compiled frame
//! (deoptimize-on-write, see [`crate::decoder`]).

use crate::gc::ObjectRef;
use tarn_bytecode::{Method, MethodId};

/// Frame identity token, stable for the duration of one walk
///
/// Assigned as the depth from the top of the stack at walk time; for a
/// suspended thread the frames below a given depth cannot change, so the
/// token remains valid until the thread resumes. Keys the per-thread
/// pending-frame table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FrameId(pub u64);

/// Interpreted-frame flag bits
pub mod frame_flags {
    /// Pop this frame without completing the current instruction
    pub const FORCE_POP: u8 = 1 << 0;
    /// Deliver a frame-pop event when this call returns
    pub const NOTIFY_ON_POP: u8 = 1 << 1;
    /// Suppress method-exit events for this call
    pub const SKIP_EXIT_EVENTS: u8 = 1 << 2;
}

/// Compact bitset, one bit per virtual register
#[derive(Debug, Clone, Default)]
struct RegBits {
    words: Vec<u64>,
}

impl RegBits {
    fn with_len(len: usize) -> Self {
        Self {
            words: vec![0; (len + 63) / 64],
        }
    }

    #[inline]
    fn get(&self, i: usize) -> bool {
        self.words
            .get(i / 64)
            .map_or(false, |w| w & (1 << (i % 64)) != 0)
    }

    #[inline]
    fn set(&mut self, i: usize, value: bool) {
        if let Some(w) = self.words.get_mut(i / 64) {
            if value {
                *w |= 1 << (i % 64);
            } else {
                *w &= !(1 << (i % 64));
            }
        }
    }
}

/// An explicit call frame with per-register storage
///
/// The register array length always equals the method's declared register
/// count; this is checked at construction.
#[derive(Debug, Clone)]
pub struct InterpretedFrame {
    method: MethodId,
    dex_pc: u32,
    registers: Vec<u32>,
    reference_bits: RegBits,
    flags: u8,
}

impl InterpretedFrame {
    /// Create a frame for a method, all registers zeroed
    pub fn new(method_id: MethodId, method: &Method, dex_pc: u32) -> Self {
        let count = method.num_registers as usize;
        Self {
            method: method_id,
            dex_pc,
            registers: vec![0; count],
            reference_bits: RegBits::with_len(count),
            flags: 0,
        }
    }

    /// The method executing in this frame
    #[inline]
    pub fn method(&self) -> MethodId {
        self.method
    }

    /// Current source pc
    #[inline]
    pub fn dex_pc(&self) -> u32 {
        self.dex_pc
    }

    /// Advance the source pc
    #[inline]
    pub fn set_dex_pc(&mut self, dex_pc: u32) {
        self.dex_pc = dex_pc;
    }

    /// Number of virtual registers
    #[inline]
    pub fn num_registers(&self) -> u16 {
        self.registers.len() as u16
    }

    /// Read a register's raw 32-bit value
    #[inline]
    pub fn vreg(&self, reg: u16) -> u32 {
        self.registers[reg as usize]
    }

    /// Store a primitive value, clearing the reference bit
    #[inline]
    pub fn set_vreg(&mut self, reg: u16, value: u32) {
        self.registers[reg as usize] = value;
        self.reference_bits.set(reg as usize, false);
    }

    /// Store a reference, setting the reference bit
    #[inline]
    pub fn set_vreg_reference(&mut self, reg: u16, value: ObjectRef) {
        self.registers[reg as usize] = value.as_u32();
        self.reference_bits.set(reg as usize, true);
    }

    /// Whether the register currently holds a reference
    #[inline]
    pub fn is_reference(&self, reg: u16) -> bool {
        self.reference_bits.get(reg as usize)
    }

    /// Read a register as a reference, if its shadow bit is set
    #[inline]
    pub fn vreg_reference(&self, reg: u16) -> Option<ObjectRef> {
        if self.is_reference(reg) {
            Some(ObjectRef::from_u32(self.registers[reg as usize]))
        } else {
            None
        }
    }

    /// Test a frame flag (see [`frame_flags`])
    #[inline]
    pub fn flag(&self, bit: u8) -> bool {
        self.flags & bit != 0
    }

    /// Set or clear a frame flag
    #[inline]
    pub fn set_flag(&mut self, bit: u8, value: bool) {
        if value {
            self.flags |= bit;
        } else {
            self.flags &= !bit;
        }
    }

    /// Visit every register currently flagged as a reference
    pub fn visit_references<F>(&self, mut visitor: F)
    where
        F: FnMut(u16, ObjectRef),
    {
        for reg in 0..self.registers.len() {
            if self.reference_bits.get(reg) {
                visitor(reg as u16, ObjectRef::from_u32(self.registers[reg]));
            }
        }
    }
}

/// A pending interpreted frame created by a debugger write
///
/// Holds the values a debugger stored into a compiled frame before the
/// deoptimization transition runs, plus one updated bit per register so
/// that untouched registers keep decoding from the compiled frame's maps.
#[derive(Debug, Clone)]
pub struct PendingFrame {
    frame: InterpretedFrame,
    updated: RegBits,
}

impl PendingFrame {
    /// Create an empty pending frame seeded with the current source pc
    pub fn new(method_id: MethodId, method: &Method, dex_pc: u32) -> Self {
        let count = method.num_registers as usize;
        Self {
            frame: InterpretedFrame::new(method_id, method, dex_pc),
            updated: RegBits::with_len(count),
        }
    }

    /// The frame being assembled
    #[inline]
    pub fn frame(&self) -> &InterpretedFrame {
        &self.frame
    }

    /// Record an explicit primitive override
    pub fn set_override(&mut self, reg: u16, value: u32) {
        self.frame.set_vreg(reg, value);
        self.updated.set(reg as usize, true);
    }

    /// Record an explicit reference override
    pub fn set_override_reference(&mut self, reg: u16, value: ObjectRef) {
        self.frame.set_vreg_reference(reg, value);
        self.updated.set(reg as usize, true);
    }

    /// The override for a register, if one was written
    ///
    /// Returns the raw value and whether it was stored as a reference.
    pub fn override_value(&self, reg: u16) -> Option<(u32, bool)> {
        if reg < self.frame.num_registers() && self.updated.get(reg as usize) {
            Some((self.frame.vreg(reg), self.frame.is_reference(reg)))
        } else {
            None
        }
    }
}
