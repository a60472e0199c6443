//! Per-call state and the thread-local call stack
//!
//! Every dispatched call gets a [`CallContext`]: the chain it runs on, a
//! snapshot of the layers it will visit, the return slot, and bookkeeping
//! for recalls. Contexts form a thread-local stack so hooked functions
//! may call other hooked functions (or themselves) reentrantly; the
//! innermost context is the one the callback-facing accessors observe.

use std::cell::{Cell, RefCell};
use std::os::raw::c_void;
use std::rc::Rc;
use std::sync::Arc;

use crate::chain::{HookChain, HookLayer};
use crate::error::{HookError, Result};
use crate::retval::{Action, CopyFn, DropFn, ReturnSlot};
use crate::signature::ClosureThunk;

pub struct CallContext {
    chain: Arc<HookChain>,
    layers: Arc<Vec<Arc<HookLayer>>>,
    // index of the layer currently executing a callback
    position: Cell<usize>,
    // lowest layer index whose callbacks ran this call; descent is
    // contiguous from the outermost layer down
    innermost_visited: Cell<usize>,
    recalled: Cell<bool>,
    slot: RefCell<ReturnSlot>,
    // recall entry points must outlive the invocations made through them
    recall_thunks: RefCell<Vec<ClosureThunk>>,
}

impl CallContext {
    pub(crate) fn new(chain: Arc<HookChain>, layers: Arc<Vec<Arc<HookLayer>>>) -> Self {
        let outermost = layers.len().saturating_sub(1);
        Self {
            chain,
            layers,
            position: Cell::new(outermost),
            innermost_visited: Cell::new(outermost),
            recalled: Cell::new(false),
            slot: RefCell::new(ReturnSlot::new()),
            recall_thunks: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn chain(&self) -> &Arc<HookChain> {
        &self.chain
    }

    pub(crate) fn layers(&self) -> &Arc<Vec<Arc<HookLayer>>> {
        &self.layers
    }

    pub(crate) fn position(&self) -> usize {
        self.position.get()
    }

    pub(crate) fn set_position(&self, index: usize) {
        self.position.set(index);
        if index < self.innermost_visited.get() {
            self.innermost_visited.set(index);
        }
    }

    pub(crate) fn innermost_visited(&self) -> usize {
        self.innermost_visited.get()
    }

    pub(crate) fn recalled(&self) -> bool {
        self.recalled.get()
    }

    pub(crate) fn mark_recalled(&self) {
        self.recalled.set(true);
    }

    pub(crate) fn current_action(&self) -> Action {
        self.slot.borrow().action()
    }

    pub(crate) fn with_slot<R>(&self, f: impl FnOnce(&mut ReturnSlot) -> R) -> R {
        f(&mut self.slot.borrow_mut())
    }

    pub(crate) fn keep_recall_thunk(&self, thunk: ClosureThunk) {
        self.recall_thunks.borrow_mut().push(thunk);
    }
}

thread_local! {
    static CALL_STACK: RefCell<Vec<Rc<CallContext>>> = const { RefCell::new(Vec::new()) };
}

/// innermost in-flight call on this thread
pub(crate) fn current() -> Result<Rc<CallContext>> {
    CALL_STACK
        .with(|stack| stack.borrow().last().cloned())
        .ok_or(HookError::NoActiveCall)
}

/// pushes on construction, pops on drop
pub(crate) struct ContextScope;

impl ContextScope {
    pub(crate) fn enter(ctx: Rc<CallContext>) -> Self {
        CALL_STACK.with(|stack| stack.borrow_mut().push(ctx));
        Self
    }
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        CALL_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// record a callback's verdict and optional replacement return value
///
/// `post_original` distinguishes the save made on behalf of the target's
/// own result from a callback's replacement.
///
/// # Safety
/// when non-null, `src` must point to a valid value of `size` bytes and
/// `copy_fn`/`drop_fn` must match its type.
pub unsafe fn save_return_value(
    action: Action,
    src: *const c_void,
    size: usize,
    copy_fn: Option<CopyFn>,
    drop_fn: Option<DropFn>,
    post_original: bool,
) -> Result<()> {
    let ctx = current()?;
    // SAFETY: per the function contract
    ctx.with_slot(|slot| unsafe { slot.save(action, src, size, copy_fn, drop_fn, post_original) });
    Ok(())
}

/// pointer to the value the in-flight call would currently return
///
/// with `effective`, a replacement that outranks the target's own result
/// wins; otherwise only the replacement is consulted. None when nothing
/// has been saved, as with void returns.
pub fn current_value_ptr(effective: bool) -> Result<Option<*mut c_void>> {
    let ctx = current()?;
    Ok(ctx.with_slot(|slot| slot.value_ptr(effective)))
}

/// typed convenience over [`save_return_value`]
///
/// clones `value` into the slot with the matching typed copy and drop
/// functions.
pub fn save_return<T: Clone>(action: Action, value: &T, post_original: bool) -> Result<()> {
    // SAFETY: src/size/copy/drop all describe the same T
    unsafe {
        save_return_value(
            action,
            value as *const T as *const c_void,
            std::mem::size_of::<T>(),
            Some(crate::retval::copy_value::<T>),
            Some(crate::retval::drop_value::<T>),
            post_original,
        )
    }
}

/// typed read of the value the in-flight call would currently return
///
/// # Safety
/// the saved value must actually be a `T`.
pub unsafe fn current_value<T: Copy>(effective: bool) -> Result<Option<T>> {
    // SAFETY: per the function contract
    Ok(current_value_ptr(effective)?.map(|ptr| unsafe { *(ptr as *const T) }))
}

/// drop the in-flight call's saved return values
pub fn destroy_return_value() -> Result<()> {
    let ctx = current()?;
    ctx.with_slot(ReturnSlot::destroy);
    Ok(())
}

/// address of the unhooked target, callable with the target's signature
///
/// for inline hooks this is the trampoline; for vtable hooks the address
/// the slot held before patching.
pub fn original_function() -> Result<usize> {
    let ctx = current()?;
    ctx.chain().original_entry()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_fail_outside_a_call() {
        assert!(matches!(current(), Err(HookError::NoActiveCall)));
        assert!(matches!(
            current_value_ptr(true),
            Err(HookError::NoActiveCall)
        ));
        assert!(matches!(destroy_return_value(), Err(HookError::NoActiveCall)));
        assert!(matches!(original_function(), Err(HookError::NoActiveCall)));
    }
}
