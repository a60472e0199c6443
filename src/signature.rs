//! ABI bridge built on libffi
//!
//! Targets are described by a [`Signature`] (argument kinds plus return
//! kind), which lowers to a libffi call interface. Two directions flow
//! through here: calling a raw code address with an erased argument array,
//! and exposing Rust dispatch logic as a callable C entry point via a
//! closure thunk.

use std::os::raw::c_void;

use libffi::low::ffi_cif;
use libffi::middle::{Cif, Closure, CodePtr, Type};

use crate::error::{HookError, Result};

/// machine-level kind of a single argument or return value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Void,
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    Isize,
    Usize,
    F32,
    F64,
    Pointer,
}

impl ValueKind {
    /// natural size of the value in bytes
    pub fn size(self) -> usize {
        match self {
            ValueKind::Void => 0,
            ValueKind::Bool | ValueKind::I8 | ValueKind::U8 => 1,
            ValueKind::I16 | ValueKind::U16 => 2,
            ValueKind::I32 | ValueKind::U32 | ValueKind::F32 => 4,
            ValueKind::I64 | ValueKind::U64 | ValueKind::F64 => 8,
            ValueKind::Isize | ValueKind::Usize | ValueKind::Pointer => {
                std::mem::size_of::<usize>()
            }
        }
    }

    /// lower to the matching libffi type descriptor
    pub fn ffi_type(self) -> Type {
        match self {
            ValueKind::Void => Type::void(),
            ValueKind::Bool | ValueKind::U8 => Type::u8(),
            ValueKind::I8 => Type::i8(),
            ValueKind::I16 => Type::i16(),
            ValueKind::U16 => Type::u16(),
            ValueKind::I32 => Type::i32(),
            ValueKind::U32 => Type::u32(),
            ValueKind::I64 => Type::i64(),
            ValueKind::U64 => Type::u64(),
            ValueKind::Isize => Type::isize(),
            ValueKind::Usize => Type::usize(),
            ValueKind::F32 => Type::f32(),
            ValueKind::F64 => Type::f64(),
            ValueKind::Pointer => Type::pointer(),
        }
    }

    pub fn is_void(self) -> bool {
        matches!(self, ValueKind::Void)
    }

    fn is_signed_int(self) -> bool {
        matches!(
            self,
            ValueKind::I8 | ValueKind::I16 | ValueKind::I32 | ValueKind::I64 | ValueKind::Isize
        )
    }

    fn is_float(self) -> bool {
        matches!(self, ValueKind::F32 | ValueKind::F64)
    }
}

/// call signature of a hooked target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    args: Vec<ValueKind>,
    ret: ValueKind,
}

impl Signature {
    pub fn new(args: Vec<ValueKind>, ret: ValueKind) -> Result<Self> {
        if args.iter().any(|kind| kind.is_void()) {
            return Err(HookError::SignatureMismatch {
                expected: "non-void argument kinds",
                found: "void argument",
            });
        }
        Ok(Self { args, ret })
    }

    pub fn args(&self) -> &[ValueKind] {
        &self.args
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    pub fn ret(&self) -> ValueKind {
        self.ret
    }

    /// prepare a libffi call interface for this signature
    pub fn build_cif(&self) -> Cif {
        Cif::new(
            self.args.iter().map(|kind| kind.ffi_type()),
            self.ret.ffi_type(),
        )
    }
}

/// scratch buffer large enough for any supported return value
///
/// libffi widens integral returns narrower than a machine word to a full
/// `ffi_arg`, so the buffer is always word sized. on little-endian targets
/// the natural-size value sits at the start of the buffer.
pub type RetBuffer = u64;

/// read the natural-size return value out of a call's scratch buffer
///
/// # Safety
/// `dest` must be valid for `kind.size()` bytes.
pub unsafe fn copy_ret_from_buffer(kind: ValueKind, buffer: &RetBuffer, dest: *mut u8) {
    let src = buffer as *const RetBuffer as *const u8;
    // SAFETY: caller guarantees dest; src holds at least kind.size() bytes
    unsafe { std::ptr::copy_nonoverlapping(src, dest, kind.size()) };
}

/// write a natural-size value into a closure's return area, widening
/// integral kinds to a full `ffi_arg` as libffi expects
///
/// # Safety
/// `src` must point to a valid value of `kind`; `dest` must be valid for
/// writes of a full `RetBuffer`.
pub unsafe fn store_ret_widened(kind: ValueKind, src: *const u8, dest: *mut RetBuffer) {
    if kind.is_void() {
        return;
    }
    if kind.is_float() || kind.size() == std::mem::size_of::<RetBuffer>() {
        // SAFETY: per contract; exact-size copy into the start of the buffer
        unsafe {
            *dest = 0;
            std::ptr::copy_nonoverlapping(src, dest as *mut u8, kind.size());
        }
        return;
    }

    // SAFETY: src holds kind.size() bytes per contract
    let widened = unsafe {
        if kind.is_signed_int() {
            match kind.size() {
                1 => (*(src as *const i8)) as i64 as u64,
                2 => (*(src as *const i16)) as i64 as u64,
                _ => (*(src as *const i32)) as i64 as u64,
            }
        } else {
            let mut value: u64 = 0;
            std::ptr::copy_nonoverlapping(src, &mut value as *mut u64 as *mut u8, kind.size());
            value
        }
    };
    // SAFETY: dest is valid for a RetBuffer write per contract
    unsafe { *dest = widened };
}

/// invoke a raw code address through a prepared call interface
///
/// `args` follows libffi layout: an array of `arg_count` pointers, each
/// pointing at an argument value. the widened result lands in `ret`.
///
/// # Safety
/// `entry` must be callable with the ABI described by `cif`, and `args`
/// must match its arity and kinds.
pub unsafe fn call_erased(cif: &Cif, entry: usize, args: *mut *mut c_void, ret: &mut RetBuffer) {
    let code = CodePtr(entry as *mut c_void);
    // SAFETY: per the function contract
    unsafe {
        libffi::raw::ffi_call(
            cif.as_raw_ptr(),
            Some(*code.as_safe_fun()),
            ret as *mut RetBuffer as *mut c_void,
            args,
        );
    }
}

/// a raw code address paired with a prepared call interface
///
/// adapts an address back into something invocable with a known
/// signature, without committing to a Rust function type. hooks use this
/// to call the entry handed out by a recall, or any other address whose
/// signature they know.
pub struct BoundCallable {
    entry: usize,
    cif: Cif,
}

impl BoundCallable {
    pub fn new(entry: usize, signature: &Signature) -> Result<Self> {
        if entry == 0 {
            return Err(HookError::NullTarget { context: "entry" });
        }
        Ok(Self {
            entry,
            cif: signature.build_cif(),
        })
    }

    pub fn entry(&self) -> usize {
        self.entry
    }

    /// invoke the bound address with an erased argument array
    ///
    /// # Safety
    /// same contract as [`call_erased`] for the bound entry.
    pub unsafe fn call_raw(&self, args: *mut *mut c_void, ret: &mut RetBuffer) {
        // SAFETY: per the function contract
        unsafe { call_erased(&self.cif, self.entry, args, ret) };
    }
}

/// erased dispatch handler behind a closure thunk
///
/// receives the caller's argument array and a pointer to the widened
/// return area.
pub type ErasedHandler = Box<dyn Fn(*const *const c_void, *mut RetBuffer)>;

unsafe extern "C" fn thunk_callback(
    _cif: &ffi_cif,
    result: &mut RetBuffer,
    args: *const *const c_void,
    userdata: &ErasedHandler,
) {
    userdata(args, result);
}

/// a C-callable entry point backed by a Rust handler
///
/// the generated code forwards every call, whatever its signature says,
/// into the boxed handler. the thunk owns both the closure's executable
/// page and the handler, so the entry address stays valid for the thunk's
/// lifetime.
pub struct ClosureThunk {
    entry: usize,
    // declaration order matters: the closure references the handler and
    // must be dropped first
    _closure: Closure<'static>,
    handler: *mut ErasedHandler,
}

impl ClosureThunk {
    pub fn new(signature: &Signature, handler: ErasedHandler) -> Self {
        let cif = signature.build_cif();
        let handler = Box::into_raw(Box::new(handler));
        // SAFETY: handler outlives the closure; both live and die with self
        let userdata: &'static ErasedHandler = unsafe { &*handler };
        let closure = Closure::new(cif, thunk_callback, userdata);
        let entry = *closure.code_ptr() as usize;
        Self {
            entry,
            _closure: closure,
            handler,
        }
    }

    /// address callable as a function with the thunk's signature
    pub fn entry_address(&self) -> usize {
        self.entry
    }
}

impl Drop for ClosureThunk {
    fn drop(&mut self) {
        // SAFETY: handler came from Box::into_raw in new; the closure
        // field was dropped before this runs
        drop(unsafe { Box::from_raw(self.handler) });
    }
}

// SAFETY: the thunk itself is immutable executable code plus a prepared
// cif that is never mutated after prep; the handler runs on whichever
// thread calls the entry, and handlers capturing thread-bound state are
// kept in thread-local storage so they never migrate
unsafe impl Send for ClosureThunk {}
unsafe impl Sync for ClosureThunk {}
