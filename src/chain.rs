//! Hook chains: the per-target stack of layered registrations
//!
//! One chain exists per hooked target. Its live layer list is copy-on-
//! write: dispatch grabs an `Arc` snapshot and never observes a
//! mutation mid-call, so removal is always safe for calls already in
//! flight. Layers removed while calls are running are parked until the
//! chain drains, at which point their removal callbacks fire.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::trace;

use crate::error::{HookError, Result};
use crate::patch::{CodePatch, SlotPatch};
use crate::registry::HookId;
use crate::signature::{ClosureThunk, Signature};

/// notified with the hook's id once the layer is fully retired
pub type RemovalCallback = extern "C" fn(HookId);

/// what a chain is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetIdentity {
    /// a function entry point, patched inline
    Code(usize),
    /// one slot of a virtual method table
    VtableSlot { vtable: usize, index: usize },
}

/// one registered hook within a chain
pub struct HookLayer {
    pub(crate) id: HookId,
    // substituted receiver for pre/post/return callbacks; 0 = none
    pub(crate) owner: usize,
    pub(crate) pre: usize,
    pub(crate) post: usize,
    pub(crate) make_return: usize,
    pub(crate) call_original: usize,
    pub(crate) on_removed: Option<RemovalCallback>,
    pub(crate) auto_release_shadow: bool,
}

impl HookLayer {
    pub fn id(&self) -> HookId {
        self.id
    }
}

pub(crate) enum PatchKind {
    Code(CodePatch),
    Slot(SlotPatch),
}

struct ChainState {
    // oldest registration first; the newest layer is outermost
    live: Arc<Vec<Arc<HookLayer>>>,
    // removed while calls were in flight; drained when the chain idles
    parked: Vec<Arc<HookLayer>>,
}

/// outcome of a layer removal, consumed by the registry
pub(crate) struct RemoveOutcome {
    /// layers whose removal callbacks should fire now, outside any lock
    pub retired: Vec<Arc<HookLayer>>,
    /// the chain has no live layers left
    pub now_empty: bool,
}

pub struct HookChain {
    identity: TargetIdentity,
    signature: Signature,
    thunk: ClosureThunk,
    patch: Mutex<Option<PatchKind>>,
    state: Mutex<ChainState>,
    in_flight: AtomicUsize,
    // set once any layer asks for its shadow table to be freed with it
    release_shadow_on_empty: AtomicBool,
}

impl HookChain {
    /// build a chain whose entry thunk dispatches through the chain itself
    pub(crate) fn new(identity: TargetIdentity, signature: Signature) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<HookChain>| {
            let dispatch_chain = weak.clone();
            let thunk = ClosureThunk::new(
                &signature,
                Box::new(move |args, ret| crate::dispatch::enter(&dispatch_chain, args, ret)),
            );
            Self {
                identity,
                signature,
                thunk,
                patch: Mutex::new(None),
                state: Mutex::new(ChainState {
                    live: Arc::new(Vec::new()),
                    parked: Vec::new(),
                }),
                in_flight: AtomicUsize::new(0),
                release_shadow_on_empty: AtomicBool::new(false),
            }
        })
    }

    pub fn identity(&self) -> TargetIdentity {
        self.identity
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// address callers are redirected to
    pub(crate) fn entry_address(&self) -> usize {
        self.thunk.entry_address()
    }

    pub(crate) fn attach_patch(&self, patch: PatchKind) {
        *self.patch.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(patch);
    }

    /// restore the target in place
    ///
    /// the patch object stays attached so its trampoline and original
    /// address remain valid for callers still inside the chain's thunk.
    pub(crate) fn detach_patch(&self) {
        let mut patch = self.patch.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match patch.as_mut() {
            Some(PatchKind::Code(code)) => {
                let _ = code.disarm();
            }
            Some(PatchKind::Slot(slot)) => {
                let _ = slot.disarm();
            }
            None => {}
        }
    }

    /// callable address of the unhooked target
    pub fn original_entry(&self) -> Result<usize> {
        let patch = self.patch.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match patch.as_ref() {
            Some(PatchKind::Code(code)) => Ok(code.trampoline_address()),
            Some(PatchKind::Slot(slot)) => Ok(slot.original_address()),
            None => Err(HookError::NotPatched),
        }
    }

    /// current live layers, oldest first
    pub(crate) fn snapshot(&self) -> Arc<Vec<Arc<HookLayer>>> {
        Arc::clone(&self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).live)
    }

    pub(crate) fn add_layer(&self, layer: HookLayer) {
        if layer.auto_release_shadow {
            self.release_shadow_on_empty.store(true, Ordering::Release);
        }
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut live: Vec<Arc<HookLayer>> = state.live.as_ref().clone();
        live.push(Arc::new(layer));
        state.live = Arc::new(live);
        trace!(layers = state.live.len(), "layer added");
    }

    /// detach the layer with `id` from the live list
    ///
    /// with `deferred`, retirement waits for the chain to drain when
    /// calls are in flight; otherwise the layer retires immediately.
    pub(crate) fn remove_layer(&self, id: HookId, deferred: bool) -> Result<RemoveOutcome> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let index = state
            .live
            .iter()
            .position(|layer| layer.id == id)
            .ok_or(HookError::UnknownHook(id))?;

        let mut live: Vec<Arc<HookLayer>> = state.live.as_ref().clone();
        let layer = live.remove(index);
        state.live = Arc::new(live);
        let now_empty = state.live.is_empty();

        let idle = self.in_flight.load(Ordering::Acquire) == 0;
        let retired = if !deferred || idle {
            vec![layer]
        } else {
            state.parked.push(layer);
            Vec::new()
        };

        Ok(RemoveOutcome { retired, now_empty })
    }

    /// strip every layer at once, for shutdown
    pub(crate) fn clear_layers(&self) -> Vec<Arc<HookLayer>> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut retired: Vec<Arc<HookLayer>> = state.live.as_ref().clone();
        state.live = Arc::new(Vec::new());
        retired.append(&mut state.parked);
        retired
    }

    pub(crate) fn enter_call(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// leave a call; when the chain drains, parked layers retire and are
    /// handed back for their removal callbacks
    pub(crate) fn exit_call(&self) -> Vec<Arc<HookLayer>> {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) != 1 {
            return Vec::new();
        }
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut state.parked)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn wants_shadow_release(&self) -> bool {
        self.release_shadow_on_empty.load(Ordering::Acquire)
    }
}
