//! Architecture-specific code generation
//!
//! Inline patching needs three capabilities from the target architecture:
//! encoding jumps, finding instruction boundaries in a prologue, and
//! relocating the displaced prologue into a trampoline. Only x86_64 provides
//! them today; other targets still get vtable hooks, which need none of this.

#[cfg(target_arch = "x86_64")]
mod x64;

#[cfg(target_arch = "x86_64")]
pub use x64::X64;

#[cfg(target_arch = "x86_64")]
pub type NativeArch = X64;

/// architecture-specific instruction encoding and rewriting
pub trait Architecture: Sized + 'static {
    /// size of a near relative jump (jmp rel32)
    const JMP_REL_SIZE: usize;

    /// size of an absolute jump stub
    const JMP_ABS_SIZE: usize;

    /// encode a near relative jump from source to target
    ///
    /// returns None if the distance exceeds the rel32 range (±2GB)
    fn encode_jmp_rel(source: usize, target: usize) -> Option<Vec<u8>>;

    /// encode an absolute jump stub
    fn encode_jmp_abs(target: usize) -> Vec<u8>;

    /// encode a NOP sled of the specified size
    fn encode_nop_sled(size: usize) -> Vec<u8>;

    /// find an instruction boundary at or after `required_size` bytes
    ///
    /// returns the offset of the boundary, or None if decoding fails before
    /// enough bytes are covered.
    fn find_instruction_boundary(code: &[u8], required_size: usize) -> Option<usize>;

    /// relocate a block of instructions moved from old_address to new_address
    ///
    /// rewrites relative branches and RIP-relative operands so they still
    /// reference their original targets.
    fn relocate_block(code: &[u8], old_address: usize, new_address: usize) -> Option<Vec<u8>>;
}
