//! Global hook registry
//!
//! All live chains and hook ids live behind one process-wide lock. The
//! registry also keeps a graveyard: chains whose last layer was removed
//! stay allocated until [`shutdown`], because a thread that entered a
//! chain's thunk may still be unwinding through its executable memory
//! when the chain empties.

use std::collections::HashMap;
use std::os::raw::c_void;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use tracing::{debug, info};

use crate::chain::{HookChain, HookLayer, PatchKind, RemovalCallback, TargetIdentity};
use crate::error::{HookError, Result};
use crate::patch::{CodePatch, SlotPatch};
use crate::signature::Signature;
use crate::vtable;

/// opaque handle to a registered hook
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(pub(crate) i32);

impl HookId {
    /// sentinel for "no hook", mirrors the C convention of returning -1
    pub const INVALID: HookId = HookId(-1);

    pub fn raw(self) -> i32 {
        self.0
    }

    pub fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl std::fmt::Display for HookId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// ids are never reused, even across remove/setup cycles
static NEXT_ID: AtomicI32 = AtomicI32::new(0);

fn allocate_id() -> HookId {
    HookId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

/// callbacks and options for one hook layer
///
/// callback fields are raw code addresses callable with the hooked
/// target's full signature; zero means "not provided" and the dispatcher
/// falls back to calling the original and forwarding the saved value
/// itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct HookRegistration {
    owner: usize,
    pre: usize,
    post: usize,
    make_return: usize,
    call_original: usize,
    on_removed: Option<RemovalCallback>,
    auto_release_shadow: bool,
}

impl HookRegistration {
    pub fn new() -> Self {
        Self::default()
    }

    /// substitute this pointer for the first argument of pre, post and
    /// make-return invocations
    pub fn owner(mut self, owner: *mut c_void) -> Self {
        self.owner = owner as usize;
        self
    }

    /// callback run while descending into the call
    pub fn pre(mut self, address: usize) -> Self {
        self.pre = address;
        self
    }

    /// callback run while ascending out of the call
    pub fn post(mut self, address: usize) -> Self {
        self.post = address;
        self
    }

    /// callback that produces the value returned to the caller
    pub fn make_return(mut self, address: usize) -> Self {
        self.make_return = address;
        self
    }

    /// callback that invokes the original and saves its result
    pub fn call_original(mut self, address: usize) -> Self {
        self.call_original = address;
        self
    }

    /// notified once the layer is fully retired
    pub fn on_removed(mut self, callback: RemovalCallback) -> Self {
        self.on_removed = Some(callback);
        self
    }

    /// free the engine-owned shadow vtable when the target's last hook
    /// is removed
    pub fn auto_release_shadow(mut self, release: bool) -> Self {
        self.auto_release_shadow = release;
        self
    }

    fn into_layer(self, id: HookId) -> HookLayer {
        HookLayer {
            id,
            owner: self.owner,
            pre: self.pre,
            post: self.post,
            make_return: self.make_return,
            call_original: self.call_original,
            on_removed: self.on_removed,
            auto_release_shadow: self.auto_release_shadow,
        }
    }
}

#[derive(Default)]
struct Registry {
    chains: HashMap<TargetIdentity, Arc<HookChain>>,
    hooks: HashMap<HookId, TargetIdentity>,
    graveyard: Vec<Arc<HookChain>>,
}

static REGISTRY: Lazy<Mutex<Registry>> = Lazy::new(|| Mutex::new(Registry::default()));

fn lock_registry() -> std::sync::MutexGuard<'static, Registry> {
    REGISTRY.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn validate(signature: &Signature, registration: &HookRegistration) -> Result<()> {
    if registration.owner != 0 && signature.arg_count() == 0 {
        return Err(HookError::OwnerWithoutReceiver);
    }
    Ok(())
}

fn attach_layer(
    registry: &mut Registry,
    identity: TargetIdentity,
    signature: Signature,
    registration: HookRegistration,
    install: impl FnOnce(&Arc<HookChain>) -> Result<PatchKind>,
) -> Result<HookId> {
    let chain = match registry.chains.get(&identity) {
        Some(existing) => {
            if existing.signature() != &signature {
                return Err(HookError::SignatureMismatch {
                    expected: "the signature the target was first hooked with",
                    found: "a different signature",
                });
            }
            Arc::clone(existing)
        }
        None => {
            let chain = HookChain::new(identity, signature);
            let patch = install(&chain)?;
            chain.attach_patch(patch);
            registry.chains.insert(identity, Arc::clone(&chain));
            chain
        }
    };

    let id = allocate_id();
    chain.add_layer(registration.into_layer(id));
    registry.hooks.insert(id, identity);
    debug!(%id, ?identity, "hook registered");
    Ok(id)
}

/// stack a hook on a function entry point
///
/// the first registration on a target patches its prologue; later ones
/// layer on top of the existing chain and must carry the same signature.
///
/// # Safety
/// `target` must be the entry of a function with the given signature, at
/// least one jump stub long, with no thread executing its prologue
/// during installation. every callback address in `registration` must be
/// callable with that same signature for as long as the hook is live.
pub unsafe fn setup_hook(
    target: usize,
    signature: Signature,
    registration: HookRegistration,
) -> Result<HookId> {
    if target == 0 {
        return Err(HookError::NullTarget { context: "target" });
    }
    validate(&signature, &registration)?;

    let mut registry = lock_registry();
    attach_layer(
        &mut registry,
        TargetIdentity::Code(target),
        signature,
        registration,
        // SAFETY: per the function contract
        |chain| unsafe { CodePatch::install(target, chain.entry_address()).map(PatchKind::Code) },
    )
}

/// stack a hook on a vtable slot
///
/// # Safety
/// `vtable` must stay alive with at least `index + 1` slots while the
/// hook is live; callback addresses as for [`setup_hook`].
pub unsafe fn setup_virtual_hook(
    vtable: *mut usize,
    index: usize,
    signature: Signature,
    registration: HookRegistration,
) -> Result<HookId> {
    if vtable.is_null() {
        return Err(HookError::NullTarget { context: "vtable" });
    }
    validate(&signature, &registration)?;

    let mut registry = lock_registry();
    attach_layer(
        &mut registry,
        TargetIdentity::VtableSlot {
            vtable: vtable as usize,
            index,
        },
        signature,
        registration,
        // SAFETY: per the function contract
        |chain| unsafe { SlotPatch::install(vtable, index, chain.entry_address()).map(PatchKind::Slot) },
    )
}

/// remove a hook
///
/// with `deferred`, retirement (and the removal callback) waits until no
/// call is in flight on the target; otherwise the layer retires
/// immediately. either way the layer stops receiving new calls at once.
/// when the last layer leaves a chain the target is restored and the
/// chain moves to the graveyard.
pub fn remove_hook(id: HookId, deferred: bool) -> Result<()> {
    let retired = {
        let mut registry = lock_registry();
        let identity = registry
            .hooks
            .remove(&id)
            .ok_or(HookError::UnknownHook(id))?;
        let chain = registry
            .chains
            .get(&identity)
            .cloned()
            .ok_or(HookError::UnknownHook(id))?;

        let outcome = chain.remove_layer(id, deferred)?;

        if outcome.now_empty {
            chain.detach_patch();
            registry.chains.remove(&identity);

            if let TargetIdentity::VtableSlot { vtable, .. } = identity {
                if chain.wants_shadow_release() {
                    vtable::release_shadow(vtable as *mut usize);
                }
            }

            registry.graveyard.push(chain);
            debug!(?identity, "target restored, chain parked in graveyard");
        }

        outcome.retired
    };

    // removal callbacks run outside the registry lock
    for layer in &retired {
        if let Some(on_removed) = layer.on_removed {
            on_removed(layer.id());
        }
    }

    Ok(())
}

/// whether the id refers to a live hook
pub fn is_hooked(id: HookId) -> bool {
    lock_registry().hooks.contains_key(&id)
}

/// tear down every hook and free all engine memory
///
/// restores every patched target, fires the removal callbacks of all
/// remaining layers, and drops the graveyard. the caller must guarantee
/// no thread is inside a hooked call or about to enter one.
pub fn shutdown() {
    let mut retired = Vec::new();

    {
        let mut registry = lock_registry();
        for chain in registry.chains.values() {
            chain.detach_patch();
            retired.extend(chain.clear_layers());
        }
        registry.chains.clear();
        registry.hooks.clear();
        registry.graveyard.clear();
        info!(hooks = retired.len(), "engine shut down");
    }

    for layer in &retired {
        if let Some(on_removed) = layer.on_removed {
            on_removed(layer.id());
        }
    }
}
