//! Method descriptors and the method registry
//!
//! A `Method` describes one bytecode-level function: how many virtual
//! registers its body declares, how many of those are incoming arguments,
//! and its access flags. The runtime never stores methods by value; it
//! passes around `MethodId` handles resolved through a `MethodTable`.

use thiserror::Error;

/// Method registry errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MethodError {
    /// Method handle does not resolve in this table
    #[error("Unknown method id {0}")]
    UnknownMethod(u32),

    /// Argument registers exceed the declared register count
    #[error("Method {name} declares {num_ins} ins but only {num_registers} registers")]
    InvalidRegisterCounts {
        /// Offending method name
        name: String,
        /// Declared incoming-argument register count
        num_ins: u16,
        /// Declared total register count
        num_registers: u16,
    },
}

/// Method access flags
pub mod flags {
    /// Method body is native code behind a JNI-style bridge
    pub const NATIVE: u32 = 1 << 0;
    /// Method has no body at all
    pub const ABSTRACT: u32 = 1 << 1;
    /// Method is a proxy dispatch stub
    pub const PROXY: u32 = 1 << 2;
    /// Method is runtime-internal dispatch with no declaring class
    pub const RUNTIME_INTERNAL: u32 = 1 << 3;
}

/// Unique identifier for a registered method
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(u32);

impl MethodId {
    /// Create a method ID from its raw table index
    pub const fn from_raw(raw: u32) -> Self {
        MethodId(raw)
    }

    /// Get the raw table index
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// A bytecode-level method descriptor
#[derive(Debug, Clone)]
pub struct Method {
    /// Method name (qualified, for diagnostics)
    pub name: String,

    /// Total number of virtual registers the body declares
    pub num_registers: u16,

    /// Number of incoming-argument registers (suffix of the register file)
    pub num_ins: u16,

    /// Access flags (see [`flags`])
    pub flags: u32,
}

impl Method {
    /// Create a plain method with a bytecode body
    pub fn new(name: impl Into<String>, num_registers: u16, num_ins: u16) -> Self {
        Self {
            name: name.into(),
            num_registers,
            num_ins,
            flags: 0,
        }
    }

    /// Create a method with explicit access flags
    pub fn with_flags(name: impl Into<String>, num_registers: u16, num_ins: u16, flags: u32) -> Self {
        Self {
            name: name.into(),
            num_registers,
            num_ins,
            flags,
        }
    }

    /// Whether this method has an executable bytecode body
    ///
    /// Native, abstract, and runtime-internal methods have none; their
    /// frames cannot be re-executed by an interpreter.
    #[inline]
    pub fn has_code(&self) -> bool {
        self.flags & (flags::NATIVE | flags::ABSTRACT | flags::RUNTIME_INTERNAL) == 0
    }

    /// Whether this method is runtime-internal dispatch
    #[inline]
    pub fn is_runtime_internal(&self) -> bool {
        self.flags & flags::RUNTIME_INTERNAL != 0
    }

    /// Whether this method is a proxy stub
    #[inline]
    pub fn is_proxy(&self) -> bool {
        self.flags & flags::PROXY != 0
    }

    /// Whether this method is native
    #[inline]
    pub fn is_native(&self) -> bool {
        self.flags & flags::NATIVE != 0
    }
}

/// Append-only method registry
///
/// Handles are dense indices; registration order defines identity. The
/// table is built once at load time and read-shared afterwards.
#[derive(Debug, Default)]
pub struct MethodTable {
    methods: Vec<Method>,
}

impl MethodTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method and return its handle
    ///
    /// # Errors
    ///
    /// Returns `MethodError::InvalidRegisterCounts` if the method declares
    /// more argument registers than total registers.
    pub fn register(&mut self, method: Method) -> Result<MethodId, MethodError> {
        if method.num_ins > method.num_registers {
            return Err(MethodError::InvalidRegisterCounts {
                name: method.name,
                num_ins: method.num_ins,
                num_registers: method.num_registers,
            });
        }

        let id = MethodId(self.methods.len() as u32);
        self.methods.push(method);
        Ok(id)
    }

    /// Resolve a handle
    #[inline]
    pub fn get(&self, id: MethodId) -> Option<&Method> {
        self.methods.get(id.0 as usize)
    }

    /// Resolve a handle, failing with a registry error
    pub fn try_get(&self, id: MethodId) -> Result<&Method, MethodError> {
        self.get(id).ok_or(MethodError::UnknownMethod(id.0))
    }

    /// Find a method by name (linear; diagnostics and tests only)
    pub fn find_by_name(&self, name: &str) -> Option<MethodId> {
        self.methods
            .iter()
            .position(|m| m.name == name)
            .map(|i| MethodId(i as u32))
    }

    /// Number of registered methods
    #[inline]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether the table is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}
