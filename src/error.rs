//! Unified error types for waylay

use crate::registry::HookId;

/// all errors that can occur while registering, removing or driving hooks
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// null pointer where a target, vtable or method was expected
    #[error("unexpected null pointer in {context}")]
    NullTarget { context: &'static str },

    /// method address not present in the probed vtable
    #[error("address {address:#x} not found in vtable (not virtual?)")]
    NotVirtual { address: usize },

    /// vtable slot index outside the table
    #[error("vtable slot {index} out of bounds (table has {len} entries)")]
    SlotOutOfBounds { index: usize, len: usize },

    /// code-address hooks are only implemented for x86_64
    #[error("inline code patching not supported on this architecture")]
    UnsupportedArchitecture,

    /// target prologue could not be decoded
    #[error("failed to decode instructions at {address:#x}: {reason}")]
    DecodeFailed { address: usize, reason: String },

    /// displaced prologue could not be re-encoded at the trampoline address
    #[error("failed to relocate prologue of {address:#x}")]
    RelocationFailed { address: usize },

    /// executable memory allocation failed
    #[error("failed to allocate {size} bytes of executable memory")]
    AllocationFailed { size: usize },

    /// mprotect refused the protection change
    #[error("failed to change protection for {size} bytes at {address:#x}")]
    ProtectionChangeFailed { address: usize, size: usize },

    /// a registration disagrees with the target's established signature
    #[error("signature mismatch: expected {expected}, found {found}")]
    SignatureMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// an owner pointer needs a first argument to substitute
    #[error("owner pointer supplied for a signature with no arguments")]
    OwnerWithoutReceiver,

    /// hook id is not (or no longer) registered
    #[error("unknown hook id {0:?}")]
    UnknownHook(HookId),

    /// context operation used outside an active dispatch
    #[error("no hook dispatch is active on this thread")]
    NoActiveCall,

    /// the chain's target was never patched
    #[error("target has no active patch")]
    NotPatched,
}

/// result type alias using HookError
pub type Result<T> = std::result::Result<T, HookError>;
