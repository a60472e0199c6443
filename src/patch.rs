//! Target patching: inline code detours and vtable slot swaps
//!
//! A [`CodePatch`] rewrites a function prologue with a jump to a detour
//! and preserves the displaced instructions in a trampoline, so the
//! original remains callable. A [`SlotPatch`] swaps one vtable entry and
//! remembers the previous address. Both restore the target when dropped.

use tracing::debug;

use crate::error::{HookError, Result};
use crate::memory::{ExecutableMemory, Protection, ProtectionGuard};

#[cfg(target_arch = "x86_64")]
use crate::arch::{Architecture, NativeArch};

// prologue bytes fetched for decoding; enough to cover an absolute stub
// plus the longest x86 instruction straddling its end
#[cfg(target_arch = "x86_64")]
const PROLOGUE_READ: usize = 32;

/// inline detour on a function entry point
pub struct CodePatch {
    target: usize,
    stolen: Vec<u8>,
    trampoline: usize,
    armed: bool,
    // keeps the trampoline mapping alive
    _memory: ExecutableMemory,
}

#[cfg(target_arch = "x86_64")]
impl CodePatch {
    /// patch `target` to jump to `detour`, building a trampoline for the
    /// displaced prologue
    ///
    /// # Safety
    /// `target` must be the entry of a function at least one stub long,
    /// and no thread may be executing its prologue during the write.
    pub unsafe fn install(target: usize, detour: usize) -> Result<Self> {
        if target == 0 {
            return Err(HookError::NullTarget { context: "target" });
        }
        if detour == 0 {
            return Err(HookError::NullTarget { context: "detour" });
        }

        let mut stub = match NativeArch::encode_jmp_rel(target, detour) {
            Some(jmp) => jmp,
            None => NativeArch::encode_jmp_abs(detour),
        };

        // SAFETY: target points at readable code per contract
        let prologue =
            unsafe { std::slice::from_raw_parts(target as *const u8, PROLOGUE_READ) }.to_vec();

        let boundary = NativeArch::find_instruction_boundary(&prologue, stub.len()).ok_or(
            HookError::DecodeFailed {
                address: target,
                reason: "no instruction boundary within prologue".into(),
            },
        )?;
        let stolen = prologue[..boundary].to_vec();

        // relocated code can grow when short branches are widened
        let mut memory =
            ExecutableMemory::allocate(boundary * 2 + NativeArch::JMP_ABS_SIZE + 16)?;
        let trampoline = memory.base();

        let relocated = NativeArch::relocate_block(&stolen, target, trampoline)
            .ok_or(HookError::RelocationFailed { address: target })?;
        memory.write(&relocated)?;
        memory.write(&NativeArch::encode_jmp_abs(target + boundary))?;

        stub.extend_from_slice(&NativeArch::encode_nop_sled(boundary - stub.len()));

        let _guard = ProtectionGuard::new(
            target,
            boundary,
            Protection::READ_WRITE_EXEC,
            Protection::READ_EXEC,
        )?;
        // SAFETY: guard made the prologue writable; stub fits in boundary
        unsafe {
            std::ptr::copy_nonoverlapping(stub.as_ptr(), target as *mut u8, stub.len());
        }

        debug!(target = %format_args!("{target:#x}"), trampoline = %format_args!("{trampoline:#x}"), stolen = boundary, "installed inline patch");

        Ok(Self {
            target,
            stolen,
            trampoline,
            armed: true,
            _memory: memory,
        })
    }
}

#[cfg(not(target_arch = "x86_64"))]
impl CodePatch {
    /// inline patching needs prologue rewriting, which only the x86_64
    /// backend provides
    pub unsafe fn install(_target: usize, _detour: usize) -> Result<Self> {
        Err(HookError::UnsupportedArchitecture)
    }
}

impl CodePatch {
    /// address of the function this patch covers
    pub fn target(&self) -> usize {
        self.target
    }

    /// callable address that runs the displaced prologue and resumes the
    /// original body
    pub fn trampoline_address(&self) -> usize {
        self.trampoline
    }

    /// put the original prologue back while keeping the trampoline
    /// mapped for threads still returning through it
    pub fn disarm(&mut self) -> Result<()> {
        if !self.armed {
            return Ok(());
        }
        self.armed = false;
        let _guard = ProtectionGuard::new(
            self.target,
            self.stolen.len(),
            Protection::READ_WRITE_EXEC,
            Protection::READ_EXEC,
        )?;
        // SAFETY: stolen holds the original prologue bytes for target
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.stolen.as_ptr(),
                self.target as *mut u8,
                self.stolen.len(),
            );
        }
        debug!(target = %format_args!("{:#x}", self.target), "restored inline patch");
        Ok(())
    }
}

impl Drop for CodePatch {
    fn drop(&mut self) {
        let _ = self.disarm();
    }
}

// SAFETY: the raw addresses identify foreign code the patch owns
// exclusively; nothing here is tied to a thread
unsafe impl Send for CodePatch {}
unsafe impl Sync for CodePatch {}

/// a single replaced vtable entry
pub struct SlotPatch {
    vtable: *mut usize,
    index: usize,
    original: usize,
    armed: bool,
}

impl SlotPatch {
    /// point `vtable[index]` at `detour`, remembering the previous entry
    ///
    /// # Safety
    /// `vtable` must stay alive for the patch's lifetime and `index`
    /// must be within the table.
    pub unsafe fn install(vtable: *mut usize, index: usize, detour: usize) -> Result<Self> {
        if detour == 0 {
            return Err(HookError::NullTarget { context: "detour" });
        }
        // SAFETY: per the function contract
        let original = unsafe { crate::vtable::write_slot(vtable, index, detour) }?;
        debug!(vtable = %format_args!("{:#x}", vtable as usize), index, "installed slot patch");
        Ok(Self {
            vtable,
            index,
            original,
            armed: true,
        })
    }

    /// the code address the slot held before patching
    pub fn original_address(&self) -> usize {
        self.original
    }

    /// put the original entry back in the slot
    pub fn disarm(&mut self) -> Result<()> {
        if !self.armed {
            return Ok(());
        }
        self.armed = false;
        // SAFETY: install's contract keeps the table alive while we exist
        unsafe { crate::vtable::write_slot(self.vtable, self.index, self.original) }.map(|_| ())
    }
}

impl Drop for SlotPatch {
    fn drop(&mut self) {
        let _ = self.disarm();
    }
}

// SAFETY: the table outlives the patch per install's contract; slot
// writes are pointer-sized stores guarded against races by the registry
unsafe impl Send for SlotPatch {}
unsafe impl Sync for SlotPatch {}
