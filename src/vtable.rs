//! Virtual method table inspection and patching
//!
//! A vtable is treated as a flat array of code addresses. Slot writes go
//! through a protection guard because compilers place vtables in
//! read-only sections. Shadow tables are engine-owned writable copies
//! used when a caller wants to hook one object without touching the
//! class-wide table.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::error::{HookError, Result};
use crate::memory::{Protection, ProtectionGuard};

const PTR_SIZE: usize = std::mem::size_of::<usize>();

/// upper bound when probing a table of unknown length
pub const MAX_PROBE_SLOTS: usize = 1024;

/// read the code address stored in a vtable slot
///
/// # Safety
/// `vtable` must point to a live table with at least `index + 1` slots.
pub unsafe fn read_slot(vtable: *const usize, index: usize) -> Result<usize> {
    if vtable.is_null() {
        return Err(HookError::NullTarget { context: "vtable" });
    }
    // SAFETY: per the function contract
    Ok(unsafe { *vtable.add(index) })
}

/// overwrite a vtable slot, returning the previous code address
///
/// # Safety
/// same requirements as [`read_slot`]; no other thread may be mid-write
/// to the same slot.
pub unsafe fn write_slot(vtable: *mut usize, index: usize, value: usize) -> Result<usize> {
    if vtable.is_null() {
        return Err(HookError::NullTarget { context: "vtable" });
    }

    let slot_address = vtable as usize + index * PTR_SIZE;
    let _guard = ProtectionGuard::new(
        slot_address,
        PTR_SIZE,
        Protection::READ_WRITE,
        Protection::READ,
    )?;

    // SAFETY: per the function contract; guard made the slot writable
    unsafe {
        let slot = vtable.add(index);
        let previous = *slot;
        // pointer-sized aligned store, atomic on the supported targets
        std::ptr::write_volatile(slot, value);
        Ok(previous)
    }
}

/// find the slot holding `method` by scanning the table
///
/// probing stops at the first null entry or after [`MAX_PROBE_SLOTS`].
///
/// # Safety
/// `vtable` must point to a live table terminated within the probe range.
pub unsafe fn slot_index(vtable: *const usize, method: usize) -> Result<usize> {
    if vtable.is_null() {
        return Err(HookError::NullTarget { context: "vtable" });
    }
    if method == 0 {
        return Err(HookError::NullTarget { context: "method" });
    }

    for index in 0..MAX_PROBE_SLOTS {
        // SAFETY: per the function contract
        let entry = unsafe { *vtable.add(index) };
        if entry == 0 {
            break;
        }
        if entry == method {
            return Ok(index);
        }
    }

    Err(HookError::NotVirtual { address: method })
}

/// decode an Itanium-ABI member pointer into a vtable slot index
///
/// virtual members encode `slot * ptr_size + 1` in the pointer field;
/// non-virtual members hold a plain code address and yield None.
pub fn member_slot_index(member: usize) -> Option<usize> {
    if member & 1 == 1 {
        Some((member - 1) / PTR_SIZE)
    } else {
        None
    }
}

/// resolve a member pointer to the code address it would call on `object`
///
/// # Safety
/// for virtual members, `object` must point to an object whose first
/// word is a valid vtable with enough slots.
pub unsafe fn extract_code_address(object: *const *const usize, member: usize) -> Result<usize> {
    match member_slot_index(member) {
        Some(index) => {
            if object.is_null() {
                return Err(HookError::NullTarget { context: "object" });
            }
            // SAFETY: per the function contract
            let vtable = unsafe { *object };
            unsafe { read_slot(vtable, index) }
        }
        None => {
            if member == 0 {
                return Err(HookError::NullTarget { context: "member" });
            }
            Ok(member)
        }
    }
}

// shadow tables allocated by the engine, keyed by their base address
static SHADOW_TABLES: Lazy<Mutex<HashMap<usize, Box<[usize]>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// clone the first `slot_count` slots of a table into an engine-owned
/// writable copy
///
/// the copy lives until [`release_shadow`] is called with its address.
///
/// # Safety
/// `vtable` must point to a live table with at least `slot_count` slots.
pub unsafe fn create_shadow(vtable: *const usize, slot_count: usize) -> Result<*mut usize> {
    if vtable.is_null() {
        return Err(HookError::NullTarget { context: "vtable" });
    }
    if slot_count == 0 {
        return Err(HookError::SlotOutOfBounds { index: 0, len: 0 });
    }

    // SAFETY: per the function contract
    let slots: Box<[usize]> =
        unsafe { std::slice::from_raw_parts(vtable, slot_count) }.into();
    let base = slots.as_ptr() as usize;

    SHADOW_TABLES
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .insert(base, slots);

    Ok(base as *mut usize)
}

/// free a shadow table created by [`create_shadow`]
///
/// returns false when the address is not a live shadow table.
pub fn release_shadow(vtable: *mut usize) -> bool {
    SHADOW_TABLES
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .remove(&(vtable as usize))
        .is_some()
}

/// whether the address is a live engine-owned shadow table
pub fn is_shadow(vtable: *const usize) -> bool {
    SHADOW_TABLES
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .contains_key(&(vtable as usize))
}
