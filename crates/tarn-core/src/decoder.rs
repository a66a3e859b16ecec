//! Virtual-register recovery: reads and writes at any stack depth
//!
//! Register queries are answered against the frame currently under a
//! [`StackWalker`]'s cursor. The read path resolves where the value lives
//! right now — interpreted array slot, stack slot, machine register, or
//! embedded constant — consulting the liveness masks before trusting any
//! reference, and normalizing every found reference through the heap's
//! read barrier. A dead or unmapped value is an absent result, never an
//! error.
//!
//! The write path promotes compiled frames on demand: the value is staged
//! in a pending interpreted frame keyed by frame identity, the touched
//! register is marked so untouched ones keep decoding from the compiled
//! maps, and the transition itself is requested from the external
//! deoptimization collaborator.

use crate::frame::PendingFrame;
use crate::gc::ObjectRef;
use crate::stack_map::DexRegisterLocation;
use crate::walker::{Cursor, StackWalker};

/// Interpretation a caller places on a virtual register
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VRegKind {
    /// Managed reference
    Reference,
    /// 32-bit integer
    Int,
    /// 32-bit float
    Float,
    /// Low half of a 64-bit integer pair
    LongLo,
    /// High half of a 64-bit integer pair
    LongHi,
    /// Low half of a 64-bit float pair
    DoubleLo,
    /// High half of a 64-bit float pair
    DoubleHi,
}

impl VRegKind {
    /// Whether this kind names a managed reference
    #[inline]
    pub fn is_reference(self) -> bool {
        self == VRegKind::Reference
    }
}

fn check_pair_kinds(lo: VRegKind, hi: VRegKind) {
    // A mismatched pair is a caller contract violation, not a decode
    // failure.
    assert!(
        matches!(
            (lo, hi),
            (VRegKind::LongLo, VRegKind::LongHi) | (VRegKind::DoubleLo, VRegKind::DoubleHi)
        ),
        "mismatched 64-bit register pair kinds: {:?}/{:?}",
        lo,
        hi
    );
}

impl<'a> StackWalker<'a> {
    /// Read a virtual register of the current logical frame
    ///
    /// Returns `None` when the value is dead, unmapped, or resides in a
    /// machine register that is no longer accessible at this unwind
    /// point. `Some(0)` for a reference kind is a found null.
    pub fn get_vreg(&self, reg: u16, kind: VRegKind) -> Option<u32> {
        // Debugger overrides win over both representations.
        if let Some((value, is_ref)) = self
            .thread
            .pending_frames()
            .get(&self.frame_id())
            .and_then(|pending| pending.override_value(reg))
        {
            if kind.is_reference() {
                if !is_ref {
                    return None;
                }
                return Some(self.finalize_reference(value));
            }
            return Some(value);
        }

        if let Some(frame) = self.cur_interpreted() {
            if reg >= frame.num_registers() {
                return None;
            }
            if kind.is_reference() {
                let obj = frame.vreg_reference(reg)?;
                return Some(self.finalize_reference(obj.as_u32()));
            }
            return Some(frame.vreg(reg));
        }

        self.get_vreg_compiled(reg, kind)
    }

    /// Read an adjacent register pair as one 64-bit value
    ///
    /// # Panics
    ///
    /// Panics unless the kinds form a matching long or double lo/hi pair.
    pub fn get_vreg_pair(&self, reg: u16, lo_kind: VRegKind, hi_kind: VRegKind) -> Option<u64> {
        check_pair_kinds(lo_kind, hi_kind);
        let lo = self.get_vreg(reg, lo_kind)?;
        let hi = self.get_vreg(reg + 1, hi_kind)?;
        Some((hi as u64) << 32 | lo as u64)
    }

    /// Write a virtual register of the current logical frame
    ///
    /// Interpreted frames are written in place. Writing a compiled frame
    /// stages the value in the thread's pending frame for this call and
    /// requests deoptimization; the request is skipped entirely when the
    /// frame is already interpreted. Returns false when the method has no
    /// executable body or the register does not exist.
    pub fn set_vreg(&mut self, reg: u16, value: u32, kind: VRegKind) -> bool {
        let (method_id, method) = match self.cur_method_descriptor() {
            Some(pair) => pair,
            None => return false,
        };
        if !method.has_code() {
            return false;
        }
        if reg >= method.num_registers {
            return false;
        }

        if self.is_interpreted() {
            let frame = match self.cur_interpreted_mut() {
                Some(frame) => frame,
                None => return false,
            };
            if kind.is_reference() {
                frame.set_vreg_reference(reg, ObjectRef::from_u32(value));
            } else {
                frame.set_vreg(reg, value);
            }
            return true;
        }

        if !matches!(self.cursor, Some(Cursor::Compiled { .. })) {
            return false;
        }

        let frame_id = self.frame_id();
        let dex_pc = self.source_pc();
        {
            let mut pending = self.thread.pending_frames();
            let entry = pending
                .entry(frame_id)
                .or_insert_with(|| PendingFrame::new(method_id, method, dex_pc));
            if kind.is_reference() {
                entry.set_override_reference(reg, ObjectRef::from_u32(value));
            } else {
                entry.set_override(reg, value);
            }
        }
        self.env
            .deopt
            .request_deoptimization(self.thread.id(), frame_id);
        true
    }

    /// Write an adjacent register pair from one 64-bit value
    ///
    /// # Panics
    ///
    /// Panics unless the kinds form a matching long or double lo/hi pair.
    pub fn set_vreg_pair(
        &mut self,
        reg: u16,
        value: u64,
        lo_kind: VRegKind,
        hi_kind: VRegKind,
    ) -> bool {
        check_pair_kinds(lo_kind, hi_kind);
        self.set_vreg(reg, value as u32, lo_kind)
            && self.set_vreg(reg + 1, (value >> 32) as u32, hi_kind)
    }

    fn get_vreg_compiled(&self, reg: u16, kind: VRegKind) -> Option<u32> {
        let (fragment, frame_base) = match self.cursor? {
            Cursor::Compiled {
                fragment,
                frame_base,
                ..
            } => (fragment, frame_base),
            _ => return None,
        };

        // Liveness masks come from the physical map even inside an inline
        // chain; locations come from the chain level's own map.
        let map = self.cur_stack_map()?;
        let locations = self.cur_dex_register_map()?;

        let raw = match locations.location(reg) {
            DexRegisterLocation::None => return None,
            DexRegisterLocation::InStack { offset } => {
                if kind.is_reference() && !map.stack_mask.is_set(offset / 4) {
                    // Unmapped slots may hold stale bit patterns; never
                    // hand one out as a reference.
                    return None;
                }
                Self::compiled(&self.stack, fragment).read_u32(frame_base + offset as usize)?
            }
            DexRegisterLocation::InRegister { id } => {
                if kind.is_reference() && !map.register_bit(id) {
                    return None;
                }
                self.context.get(id)? as u32
            }
            DexRegisterLocation::InRegisterHigh { id } => {
                if kind.is_reference() {
                    return None;
                }
                (self.context.get(id)? >> 32) as u32
            }
            DexRegisterLocation::InFpuRegister { id } => {
                if kind.is_reference() {
                    return None;
                }
                self.context.get_fpu(id)? as u32
            }
            DexRegisterLocation::InFpuRegisterHigh { id } => {
                if kind.is_reference() {
                    return None;
                }
                (self.context.get_fpu(id)? >> 32) as u32
            }
            DexRegisterLocation::Constant { value } => {
                // A literal zero is an acceptable null; any other constant
                // cannot be a reference.
                if kind.is_reference() && value != 0 {
                    return None;
                }
                value as u32
            }
        };

        if kind.is_reference() {
            return Some(self.finalize_reference(raw));
        }
        Some(raw)
    }

    fn finalize_reference(&self, raw: u32) -> u32 {
        self.env
            .heap
            .finalize_root_read(ObjectRef::from_u32(raw))
            .as_u32()
    }
}
