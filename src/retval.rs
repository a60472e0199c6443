//! Type-erased return-value storage for in-flight calls
//!
//! Callbacks communicate with the dispatcher through a per-call slot: a
//! callback saves a verdict plus an optional replacement value, the
//! original stage saves the target's actual result, and the outermost
//! return stage reads whichever value wins. Values are erased to raw
//! bytes with caller-supplied clone and drop functions so the engine
//! never needs to know the concrete type.

use std::alloc::{self, Layout};
use std::os::raw::c_void;

/// verdict a callback attaches to its saved value
///
/// ordering matters: a higher verdict takes precedence over a lower one
/// for the rest of the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Action {
    /// no opinion; the target's own result stands
    Ignore,
    /// run the target, but return the saved value instead of its result
    Override,
    /// skip the target entirely and return the saved value
    Supersede,
}

/// clones a value of the erased type from src into uninitialized dst
pub type CopyFn = unsafe extern "C" fn(dst: *mut c_void, src: *const c_void);

/// drops a value of the erased type in place
pub type DropFn = unsafe extern "C" fn(ptr: *mut c_void);

/// clone-into-place helper for a concrete type, usable as a [`CopyFn`]
///
/// # Safety
/// `src` must point to a valid `T` and `dst` to uninitialized storage
/// suitable for a `T`.
pub unsafe extern "C" fn copy_value<T: Clone>(dst: *mut c_void, src: *const c_void) {
    // SAFETY: per the function contract
    unsafe { std::ptr::write(dst as *mut T, (*(src as *const T)).clone()) };
}

/// in-place drop helper for a concrete type, usable as a [`DropFn`]
///
/// # Safety
/// `ptr` must point to a valid `T` that is not used afterwards.
pub unsafe extern "C" fn drop_value<T>(ptr: *mut c_void) {
    // SAFETY: per the function contract
    unsafe { std::ptr::drop_in_place(ptr as *mut T) };
}

// conservative alignment for erased values; covers every primitive and
// the 16-byte SIMD-ish aggregates a caller could reasonably save
const VALUE_ALIGN: usize = 16;

/// one saved value: an owned allocation plus its drop function
struct ValueCell {
    data: *mut u8,
    size: usize,
    drop_fn: Option<DropFn>,
}

impl ValueCell {
    /// copy `size` bytes (or clone via `copy_fn`) from src into a fresh
    /// allocation
    ///
    /// # Safety
    /// `src` must be valid for the erased type; `copy_fn`/`drop_fn` must
    /// match that type.
    unsafe fn new(
        src: *const c_void,
        size: usize,
        copy_fn: Option<CopyFn>,
        drop_fn: Option<DropFn>,
    ) -> Self {
        debug_assert!(size > 0);
        let layout = Layout::from_size_align(size, VALUE_ALIGN)
            .unwrap_or_else(|_| Layout::new::<u8>());
        // SAFETY: size > 0, layout is valid
        let data = unsafe { alloc::alloc(layout) };
        if data.is_null() {
            alloc::handle_alloc_error(layout);
        }
        // SAFETY: data is a fresh allocation of `size` bytes; src per contract
        unsafe {
            match copy_fn {
                Some(copy) => copy(data as *mut c_void, src),
                None => std::ptr::copy_nonoverlapping(src as *const u8, data, size),
            }
        }
        Self {
            data,
            size,
            drop_fn,
        }
    }

    fn as_ptr(&self) -> *mut c_void {
        self.data as *mut c_void
    }
}

impl Drop for ValueCell {
    fn drop(&mut self) {
        // SAFETY: data holds a live value of the erased type
        unsafe {
            if let Some(drop_fn) = self.drop_fn {
                drop_fn(self.data as *mut c_void);
            }
            let layout = Layout::from_size_align(self.size, VALUE_ALIGN)
                .unwrap_or_else(|_| Layout::new::<u8>());
            alloc::dealloc(self.data, layout);
        }
    }
}

/// per-call return slot: the highest verdict so far plus up to two values
///
/// the replacement value comes from callbacks (verdicts above
/// [`Action::Ignore`]), the original value from the target's own run.
/// the effective value is the replacement whenever one outranks the
/// target's result.
#[derive(Default)]
pub struct ReturnSlot {
    action: Option<Action>,
    replacement: Option<ValueCell>,
    original: Option<ValueCell>,
}

impl ReturnSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// highest verdict saved so far this call
    pub fn action(&self) -> Action {
        self.action.unwrap_or(Action::Ignore)
    }

    /// whether any value is currently stored
    fn occupied(&self) -> bool {
        self.replacement.is_some() || self.original.is_some()
    }

    /// record a verdict and, if `src` is non-null, the accompanying value
    ///
    /// an `Ignore` value only lands in an empty box: once any value is
    /// stored, later `Ignore` saves keep their verdict but drop the value
    /// without ever invoking its copy or drop functions. `post_original`
    /// marks the save made by the original stage; such values land in the
    /// original cell instead of the replacement cell.
    ///
    /// # Safety
    /// when non-null, `src` must point to a valid value of `size` bytes
    /// and `copy_fn`/`drop_fn` must match its type.
    pub unsafe fn save(
        &mut self,
        action: Action,
        src: *const c_void,
        size: usize,
        copy_fn: Option<CopyFn>,
        drop_fn: Option<DropFn>,
        post_original: bool,
    ) {
        if self.action.map_or(true, |current| action >= current) {
            self.action = Some(action);
        }

        if src.is_null() || size == 0 {
            return;
        }
        if action == Action::Ignore && self.occupied() {
            return;
        }

        // SAFETY: per the function contract
        let cell = unsafe { ValueCell::new(src, size, copy_fn, drop_fn) };
        if post_original {
            self.original = Some(cell);
        } else {
            self.replacement = Some(cell);
        }
    }

    /// pointer to the value the call should currently return
    ///
    /// with `effective` the replacement wins when its verdict outranks
    /// the target's result, and whichever cell holds a value answers for
    /// an `Ignore` verdict; otherwise only the replacement cell is
    /// consulted. None for void-style calls with nothing saved.
    pub fn value_ptr(&self, effective: bool) -> Option<*mut c_void> {
        if effective {
            if self.action() >= Action::Override {
                if let Some(cell) = &self.replacement {
                    return Some(cell.as_ptr());
                }
            }
            self.original
                .as_ref()
                .or(self.replacement.as_ref())
                .map(ValueCell::as_ptr)
        } else {
            self.replacement.as_ref().map(ValueCell::as_ptr)
        }
    }

    /// drop both stored values and reset the verdict
    pub fn destroy(&mut self) {
        self.replacement = None;
        self.original = None;
        self.action = None;
    }
}
