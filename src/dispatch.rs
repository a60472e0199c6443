//! Layered call dispatch
//!
//! Every call redirected into a chain's entry thunk lands here and walks
//! the layer stack in six steps:
//!
//! 1. descent: pre callbacks run outermost to innermost, stopping early
//!    when one supersedes the call
//! 2. original stage: the innermost visited layer's call-original
//!    provider runs once, with the caller's arguments, unless the call
//!    was superseded or already recalled
//! 3. ascent: post callbacks run innermost to outermost for every
//!    visited layer
//! 4. return stage: the outermost layer's make-return callback produces
//!    the value handed back to the caller
//!
//! Callbacks share the target's full signature; their own return values
//! are ignored except for make-return. A recall issued from a pre
//! callback re-runs the inner layers and the original with rewritten
//! arguments, and suppresses the automatic original stage afterwards.

use std::os::raw::c_void;
use std::rc::Rc;
use std::sync::{Arc, Weak};

use libffi::middle::Cif;
use tracing::trace;

use crate::chain::HookChain;
use crate::context::{self, CallContext, ContextScope};
use crate::error::Result;
use crate::retval::{Action, CopyFn, DropFn};
use crate::signature::{call_erased, store_ret_widened, ClosureThunk, RetBuffer, ValueKind};

/// entry point invoked by a chain's thunk
pub(crate) fn enter(chain: &Weak<HookChain>, args: *const *const c_void, ret: *mut RetBuffer) {
    // the registry's graveyard keeps chains alive while their thunk is
    // reachable; a dead weak means shutdown already ran
    let Some(chain) = chain.upgrade() else { return };

    chain.enter_call();
    run_call(&chain, args, ret);
    let reclaimed = chain.exit_call();

    for layer in &reclaimed {
        if let Some(on_removed) = layer.on_removed {
            on_removed(layer.id());
        }
    }
}

fn run_call(chain: &Arc<HookChain>, args: *const *const c_void, ret: *mut RetBuffer) {
    let layers = chain.snapshot();
    let cif = chain.signature().build_cif();
    let ret_kind = chain.signature().ret();
    let arg_count = chain.signature().arg_count();

    if layers.is_empty() {
        // nothing registered; behave as the plain target
        if let Ok(original) = chain.original_entry() {
            // SAFETY: args match the chain signature by construction
            unsafe { call_erased(&cif, original, args as *mut *mut c_void, &mut *ret) };
        }
        return;
    }

    let ctx = Rc::new(CallContext::new(Arc::clone(chain), Arc::clone(&layers)));
    let _scope = ContextScope::enter(Rc::clone(&ctx));
    let outermost = layers.len() - 1;
    let mut scratch: RetBuffer = 0;

    // descent
    for index in (0..=outermost).rev() {
        ctx.set_position(index);
        let layer = &layers[index];
        if layer.pre != 0 {
            // SAFETY: callback shares the target signature
            unsafe { invoke(&cif, layer.pre, args, layer.owner, arg_count, &mut scratch) };
        }
        if ctx.current_action() == Action::Supersede {
            trace!(layer = index, "call superseded");
            break;
        }
        // a recall already visited the layers beneath this one
        if ctx.recalled() {
            break;
        }
    }

    let innermost = ctx.innermost_visited();

    // original stage
    if ctx.current_action() < Action::Supersede && !ctx.recalled() {
        ctx.set_position(innermost);
        let provider = layers[innermost].call_original;
        if provider != 0 {
            // the provider calls the original itself and saves its result
            // SAFETY: callback shares the target signature
            unsafe { invoke(&cif, provider, args, 0, arg_count, &mut scratch) };
        } else if let Ok(original) = chain.original_entry() {
            // SAFETY: args match the chain signature by construction
            unsafe {
                call_erased(&cif, original, args as *mut *mut c_void, &mut scratch);
                save_raw_result(&ctx, ret_kind, &scratch);
            }
        }
    }

    // ascent
    for index in innermost..=outermost {
        ctx.set_position(index);
        let layer = &layers[index];
        if layer.post != 0 {
            // SAFETY: callback shares the target signature
            unsafe { invoke(&cif, layer.post, args, layer.owner, arg_count, &mut scratch) };
        }
    }

    // return stage
    ctx.set_position(outermost);
    let return_maker = layers[outermost].make_return;
    if return_maker != 0 {
        // SAFETY: callback shares the target signature; its return value
        // becomes the call's return value
        unsafe {
            invoke(
                &cif,
                return_maker,
                args,
                layers[outermost].owner,
                arg_count,
                &mut *ret,
            )
        };
    } else {
        // SAFETY: the slot value, when present, has the return kind
        unsafe { emit_slot_value(&ctx, ret_kind, ret) };
    }
    // a forgotten destroy must not leak past the call
    ctx.with_slot(|slot| slot.destroy());
}

/// invoke a callback, substituting `owner` for the first argument when set
///
/// # Safety
/// `entry` must be callable with the chain signature and `args` must
/// hold `arg_count` valid argument pointers.
unsafe fn invoke(
    cif: &Cif,
    entry: usize,
    args: *const *const c_void,
    owner: usize,
    arg_count: usize,
    ret: &mut RetBuffer,
) {
    if owner != 0 && arg_count > 0 {
        let owner_value = owner;
        // SAFETY: arg_count pointers are readable per contract
        let mut substituted: Vec<*mut c_void> =
            unsafe { std::slice::from_raw_parts(args as *const *mut c_void, arg_count) }.to_vec();
        substituted[0] = &owner_value as *const usize as *mut c_void;
        // SAFETY: per the function contract; owner_value outlives the call
        unsafe { call_erased(cif, entry, substituted.as_mut_ptr(), ret) };
    } else {
        // SAFETY: per the function contract
        unsafe { call_erased(cif, entry, args as *mut *mut c_void, ret) };
    }
}

/// save a raw call result into the context slot as the original's value
///
/// # Safety
/// `buffer` must hold a value of `ret_kind` at its start.
unsafe fn save_raw_result(ctx: &CallContext, ret_kind: ValueKind, buffer: &RetBuffer) {
    if ret_kind.is_void() {
        ctx.with_slot(|slot| {
            // SAFETY: null src records the verdict only
            unsafe { slot.save(Action::Ignore, std::ptr::null(), 0, None, None, true) }
        });
        return;
    }
    let src = buffer as *const RetBuffer as *const c_void;
    ctx.with_slot(|slot| {
        // SAFETY: plain-old-data copy of ret_kind.size() bytes
        unsafe { slot.save(Action::Ignore, src, ret_kind.size(), None, None, true) }
    });
}

/// copy the slot's effective value into a call's return area
///
/// # Safety
/// `ret` must be valid for a full `RetBuffer` write.
unsafe fn emit_slot_value(ctx: &CallContext, ret_kind: ValueKind, ret: *mut RetBuffer) {
    if ret_kind.is_void() {
        return;
    }
    if let Some(value) = ctx.with_slot(|slot| slot.value_ptr(true)) {
        // SAFETY: the stored value has the return kind per the save path
        unsafe { store_ret_widened(ret_kind, value as *const u8, &mut *ret) };
    }
}

/// save a verdict and hand back an entry that re-runs the inner layers
/// and the original with rewritten arguments
///
/// the returned address is callable with the target's signature until
/// the current call finishes. calling it runs the pre callbacks of the
/// layers beneath the current one, then the unhooked original, with the
/// new arguments; the automatic original stage is suppressed for the
/// rest of the call and the entry returns the original's result.
///
/// # Safety
/// same value contract as [`context::save_return_value`]; must be called
/// from inside a pre callback.
pub unsafe fn do_recall(
    action: Action,
    src: *const c_void,
    size: usize,
    copy_fn: Option<CopyFn>,
    drop_fn: Option<DropFn>,
) -> Result<usize> {
    let ctx = context::current()?;
    // SAFETY: per the function contract
    ctx.with_slot(|slot| unsafe { slot.save(action, src, size, copy_fn, drop_fn, false) });

    let position = ctx.position();
    let resume_ctx = Rc::downgrade(&ctx);
    let thunk = ClosureThunk::new(
        ctx.chain().signature(),
        Box::new(move |new_args, ret| {
            let Some(ctx) = resume_ctx.upgrade() else { return };
            resume(&ctx, position, new_args, ret);
        }),
    );

    let entry = thunk.entry_address();
    ctx.keep_recall_thunk(thunk);
    Ok(entry)
}

/// recall body: descend below `position` and run the original with the
/// rewritten arguments
fn resume(
    ctx: &Rc<CallContext>,
    position: usize,
    args: *const *const c_void,
    ret: *mut RetBuffer,
) {
    ctx.mark_recalled();

    let chain = Arc::clone(ctx.chain());
    let layers = Arc::clone(ctx.layers());
    let cif = chain.signature().build_cif();
    let ret_kind = chain.signature().ret();
    let arg_count = chain.signature().arg_count();
    let mut scratch: RetBuffer = 0;

    for index in (0..position).rev() {
        ctx.set_position(index);
        let layer = &layers[index];
        if layer.pre != 0 {
            // SAFETY: callback shares the target signature
            unsafe { invoke(&cif, layer.pre, args, layer.owner, arg_count, &mut scratch) };
        }
        if ctx.current_action() == Action::Supersede {
            break;
        }
    }

    if ctx.current_action() < Action::Supersede {
        if let Ok(original) = chain.original_entry() {
            // SAFETY: rewritten args match the chain signature per the
            // recall contract
            unsafe {
                call_erased(&cif, original, args as *mut *mut c_void, &mut scratch);
                save_raw_result(ctx, ret_kind, &scratch);
            }
        }
    }

    // the recall entry returns what the call currently would
    // SAFETY: ret is the closure's return area
    unsafe { emit_slot_value(ctx, ret_kind, ret) };
    ctx.set_position(position);
}
