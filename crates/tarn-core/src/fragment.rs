//! Managed stack fragments
//!
//! A thread's logical call stack is an ordered sequence of fragments,
//! newest first. Each fragment owns one contiguous segment in exactly one
//! representation:
//!
//! - an interpreted fragment owns a chain of [`InterpretedFrame`]s;
//! - a compiled fragment owns the raw stack bytes captured below a known
//!   top frame, plus the native pc and register snapshot taken when
//!   execution left compiled code.
//!
//! Compiled frames are never long-lived pointers into native memory here;
//! a fragment is an owned byte buffer and every access is bounds-checked
//! against the frame layout the metadata declares. Within the buffer,
//! offset 0 is the newest frame's base, the first 8 bytes of each frame
//! hold the executing method's id, and a zero method word terminates the
//! fragment (the transition back into the runtime).

use crate::frame::InterpretedFrame;
use crate::stack_map::FrameInfo;
use tarn_bytecode::MethodId;

/// Register values captured when execution left compiled code
///
/// Seeds the walker's [`crate::MachineContext`] when it enters the
/// fragment.
#[derive(Debug, Clone, Default)]
pub struct RegisterSnapshot {
    /// (core register id, value) pairs
    pub core: Vec<(u16, u64)>,

    /// (fpu register id, value) pairs
    pub fpu: Vec<(u16, u64)>,
}

/// A chain of interpreted frames, caller links implicit in position
///
/// Frames are stored oldest first; the newest frame is last, mirroring
/// push/pop order on interpreter entry and return.
#[derive(Debug, Default)]
pub struct InterpretedFragment {
    frames: Vec<InterpretedFrame>,
}

impl InterpretedFragment {
    /// Create an empty fragment
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a frame on interpreter entry
    pub fn push_frame(&mut self, frame: InterpretedFrame) {
        self.frames.push(frame);
    }

    /// Pop the newest frame on return
    pub fn pop_frame(&mut self) -> Option<InterpretedFrame> {
        self.frames.pop()
    }

    /// All frames, oldest first
    #[inline]
    pub fn frames(&self) -> &[InterpretedFrame] {
        &self.frames
    }

    /// Mutable access to a frame by position
    #[inline]
    pub fn frame_mut(&mut self, index: usize) -> Option<&mut InterpretedFrame> {
        self.frames.get_mut(index)
    }

    /// Number of frames in the chain
    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the chain is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// A captured region of raw compiled-frame stack memory
#[derive(Debug)]
pub struct CompiledFragment {
    memory: Vec<u8>,
    top_pc: u64,
    snapshot: RegisterSnapshot,
}

impl CompiledFragment {
    /// Native pc executing in the newest frame of this fragment
    #[inline]
    pub fn top_pc(&self) -> u64 {
        self.top_pc
    }

    /// Register snapshot captured at the transition out of compiled code
    #[inline]
    pub fn snapshot(&self) -> &RegisterSnapshot {
        &self.snapshot
    }

    /// Size of the captured region in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    /// Whether the region is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    /// The raw method word at a frame base; zero marks the fragment's end
    ///
    /// Method ids are stored off by one so that id 0 never collides with
    /// the transition marker.
    pub fn method_word(&self, frame_base: usize) -> Option<u64> {
        self.read_u64(frame_base)
    }

    /// The method executing at a frame base
    ///
    /// `None` at the transition marker (and past the captured region).
    pub fn method_at(&self, frame_base: usize) -> Option<MethodId> {
        match self.method_word(frame_base) {
            Some(0) | None => None,
            Some(word) => Some(MethodId::from_raw((word - 1) as u32)),
        }
    }

    /// Bounds-checked 8-byte read
    pub fn read_u64(&self, offset: usize) -> Option<u64> {
        let bytes = self.memory.get(offset..offset + 8)?;
        Some(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Bounds-checked 4-byte read
    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        let bytes = self.memory.get(offset..offset + 4)?;
        Some(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// One frame's bytes, bounded by its declared size
    pub fn frame_bytes(&self, frame_base: usize, frame_size: u32) -> Option<&[u8]> {
        self.memory.get(frame_base..frame_base + frame_size as usize)
    }
}

/// Assembles a compiled fragment the way the execution engine captures one
///
/// Frames are pushed innermost first; each `push_frame` call adds the next
/// outer frame. `finish` appends the zero method word that marks the
/// transition back into the runtime.
#[derive(Debug, Default)]
pub struct CompiledFragmentBuilder {
    memory: Vec<u8>,
}

impl CompiledFragmentBuilder {
    /// Start an empty fragment
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one frame, innermost first
    ///
    /// The closure receives the frame's bytes to fill in vreg slots and
    /// spill slots. The method word and return pc are laid down by the
    /// builder; `return_pc` is the native pc the caller resumes at.
    pub fn push_frame<F>(&mut self, method: MethodId, info: &FrameInfo, return_pc: u64, fill: F) -> usize
    where
        F: FnOnce(&mut FrameBytes<'_>),
    {
        let base = self.memory.len();
        self.memory.resize(base + info.frame_size as usize, 0);

        let mut bytes = FrameBytes {
            bytes: &mut self.memory[base..base + info.frame_size as usize],
        };
        // Off-by-one encoding keeps method id 0 distinct from the marker.
        bytes.set_u64(0, method.as_u32() as u64 + 1);
        bytes.set_u64(info.return_pc_offset as usize, return_pc);
        fill(&mut bytes);
        base
    }

    /// Seal the fragment with its top pc and register snapshot
    pub fn finish(mut self, top_pc: u64, snapshot: RegisterSnapshot) -> CompiledFragment {
        // Transition marker: a frame slot whose method word is zero.
        self.memory.extend_from_slice(&[0u8; 8]);
        CompiledFragment {
            memory: self.memory,
            top_pc,
            snapshot,
        }
    }
}

/// Mutable view over one frame's bytes during capture
#[derive(Debug)]
pub struct FrameBytes<'a> {
    bytes: &'a mut [u8],
}

impl FrameBytes<'_> {
    /// Store a 32-bit word at a byte offset within the frame
    pub fn set_u32(&mut self, offset: usize, value: u32) {
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Store a 64-bit word at a byte offset within the frame
    pub fn set_u64(&mut self, offset: usize, value: u64) {
        self.bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }
}

/// One contiguous owned segment of a thread's logical stack
#[derive(Debug)]
pub enum StackFragment {
    /// Explicit frames executed by the interpreter
    Interpreted(InterpretedFragment),

    /// Raw stack memory below a known top compiled frame
    Compiled(CompiledFragment),
}

/// A thread's full logical stack: an ordered sequence of fragments
///
/// Fragments are stored in push order (oldest first); logical traversal
/// is newest first via [`ManagedStack::fragments_newest_first`].
#[derive(Debug, Default)]
pub struct ManagedStack {
    fragments: Vec<StackFragment>,
}

impl ManagedStack {
    /// Create an empty stack
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a fragment as execution enters a new segment
    pub fn push_fragment(&mut self, fragment: StackFragment) {
        self.fragments.push(fragment);
    }

    /// Pop the newest fragment as execution leaves it
    pub fn pop_fragment(&mut self) -> Option<StackFragment> {
        self.fragments.pop()
    }

    /// Fragments in logical order, newest first
    pub fn fragments_newest_first(&self) -> impl Iterator<Item = &StackFragment> {
        self.fragments.iter().rev()
    }

    /// Fragment by logical index (0 = newest)
    pub fn fragment(&self, index: usize) -> Option<&StackFragment> {
        let len = self.fragments.len();
        if index < len {
            self.fragments.get(len - 1 - index)
        } else {
            None
        }
    }

    /// Mutable fragment by logical index (0 = newest)
    pub fn fragment_mut(&mut self, index: usize) -> Option<&mut StackFragment> {
        let len = self.fragments.len();
        if index < len {
            self.fragments.get_mut(len - 1 - index)
        } else {
            None
        }
    }

    /// Number of fragments
    #[inline]
    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    /// Whether the stack has no fragments
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}
