//! Machine-register context tracked across unwinding
//!
//! A walk over compiled frames needs the physical register values the
//! suspended thread last held. The context starts from a full snapshot and
//! narrows as the walk steps outward: caller-saved registers become
//! inaccessible the moment a frame is unwound (the caller's values were
//! never preserved), while callee-saved registers are refreshed from the
//! unwound frame's spill slots. Accessibility only ever decreases.

use crate::fragment::RegisterSnapshot;
use crate::stack_map::FrameInfo;

/// Number of core registers in the exemplar machine model
pub const NUM_CORE_REGS: usize = 32;

/// Number of FPU registers in the exemplar machine model
pub const NUM_FPU_REGS: usize = 32;

/// Core registers the calling convention requires callees to preserve
///
/// Registers 8..16 are callee-saved; everything else is clobberable by a
/// call and unknowable once the frame that held it is unwound.
pub const CALLEE_SAVED_CORE_MASK: u32 = 0x0000_ff00;

/// FPU registers the calling convention requires callees to preserve
pub const CALLEE_SAVED_FPU_MASK: u32 = 0x0000_ff00;

/// Snapshot of CPU registers for frames still live on the physical stack
///
/// `None` means the register is no longer accessible at the current unwind
/// point; its value at that depth cannot be recovered.
#[derive(Debug, Clone)]
pub struct MachineContext {
    core: [Option<u64>; NUM_CORE_REGS],
    fpu: [Option<u64>; NUM_FPU_REGS],
}

impl MachineContext {
    /// A context with every register inaccessible
    ///
    /// Used for walks that only count or classify frames and never read
    /// register-resident values.
    pub fn empty() -> Self {
        Self {
            core: [None; NUM_CORE_REGS],
            fpu: [None; NUM_FPU_REGS],
        }
    }

    /// Build the innermost-frame context from a captured snapshot
    pub fn from_snapshot(snapshot: &RegisterSnapshot) -> Self {
        let mut ctx = Self::empty();
        for &(id, value) in &snapshot.core {
            if (id as usize) < NUM_CORE_REGS {
                ctx.core[id as usize] = Some(value);
            }
        }
        for &(id, value) in &snapshot.fpu {
            if (id as usize) < NUM_FPU_REGS {
                ctx.fpu[id as usize] = Some(value);
            }
        }
        ctx
    }

    /// Whether a core register is still accessible at this unwind point
    #[inline]
    pub fn is_accessible(&self, id: u16) -> bool {
        (id as usize) < NUM_CORE_REGS && self.core[id as usize].is_some()
    }

    /// Whether an FPU register is still accessible at this unwind point
    #[inline]
    pub fn is_accessible_fpu(&self, id: u16) -> bool {
        (id as usize) < NUM_FPU_REGS && self.fpu[id as usize].is_some()
    }

    /// Read a core register, if accessible
    #[inline]
    pub fn get(&self, id: u16) -> Option<u64> {
        self.core.get(id as usize).copied().flatten()
    }

    /// Read an FPU register, if accessible
    #[inline]
    pub fn get_fpu(&self, id: u16) -> Option<u64> {
        self.fpu.get(id as usize).copied().flatten()
    }

    /// Write a core register; false if it is not accessible here
    #[inline]
    pub fn set(&mut self, id: u16, value: u64) -> bool {
        match self.core.get_mut(id as usize) {
            Some(slot) if slot.is_some() => {
                *slot = Some(value);
                true
            }
            _ => false,
        }
    }

    /// Write an FPU register; false if it is not accessible here
    #[inline]
    pub fn set_fpu(&mut self, id: u16, value: u64) -> bool {
        match self.fpu.get_mut(id as usize) {
            Some(slot) if slot.is_some() => {
                *slot = Some(value);
                true
            }
            _ => false,
        }
    }

    /// Narrow the context past one unwound frame
    ///
    /// Callee-saved registers spilled in the unwound frame are reloaded
    /// from its spill slots so the context describes the caller. Registers
    /// the calling convention does not preserve are evicted. A register
    /// that is already inaccessible is never resurrected.
    pub fn fill_callee_saves(&mut self, frame: &[u8], info: &FrameInfo) {
        for id in 0..NUM_CORE_REGS as u16 {
            if self.core[id as usize].is_none() {
                continue;
            }
            if let Some(offset) = info.core_spill_offset(id) {
                if let Some(value) = read_u64(frame, offset) {
                    self.core[id as usize] = Some(value);
                }
            } else if CALLEE_SAVED_CORE_MASK & (1 << id) == 0 {
                self.core[id as usize] = None;
            }
        }
        for id in 0..NUM_FPU_REGS as u16 {
            if self.fpu[id as usize].is_none() {
                continue;
            }
            if let Some(offset) = info.fpu_spill_offset(id) {
                if let Some(value) = read_u64(frame, offset) {
                    self.fpu[id as usize] = Some(value);
                }
            } else if CALLEE_SAVED_FPU_MASK & (1 << id) == 0 {
                self.fpu[id as usize] = None;
            }
        }
    }
}

fn read_u64(frame: &[u8], offset: u32) -> Option<u64> {
    let offset = offset as usize;
    let bytes = frame.get(offset..offset + 8)?;
    Some(u64::from_le_bytes(bytes.try_into().unwrap()))
}
