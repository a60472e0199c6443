#![cfg(unix)]
#![deny(unsafe_op_in_unsafe_fn)]

//! waylay: a stackable runtime call-interception engine
//!
//! Hooks attach to function entry points (inline prologue patching) or
//! vtable slots, and any number of hooks stack on the same target. Every
//! intercepted call walks the layer stack through four stages:
//!
//! - *pre* callbacks, outermost to innermost, each able to ignore,
//!   override the return value, or supersede the call entirely
//! - the *original stage*: one call-original provider invocation, which
//!   runs the unhooked target and saves its result
//! - *post* callbacks, innermost back out
//! - the outermost *make-return* callback, which produces the value the
//!   interception hands back to the caller
//!
//! Callbacks share the hooked target's full signature and talk to the
//! engine through a per-call return slot ([`save_return_value`],
//! [`current_value_ptr`]) plus [`original_function`] and [`do_recall`].
//! Return values cross the engine type-erased, with caller-supplied
//! clone and drop functions ([`copy_value`], [`drop_value`]).
//!
//! # Example
//!
//! ```no_run
//! use waylay::{HookRegistration, Signature, ValueKind};
//!
//! extern "C" fn pre(flag: i32) -> i32 {
//!     // inspect or veto the call here
//!     let _ = flag;
//!     0
//! }
//!
//! # fn target(_: i32) -> i32 { 0 }
//! let signature = Signature::new(vec![ValueKind::I32], ValueKind::I32)?;
//! let id = unsafe {
//!     waylay::setup_hook(
//!         target as usize,
//!         signature,
//!         HookRegistration::new().pre(pre as usize),
//!     )?
//! };
//! waylay::remove_hook(id, false)?;
//! # Ok::<(), waylay::HookError>(())
//! ```
//!
//! Inline hooks on function addresses need the x86_64 backend; vtable
//! hooks work on every supported unix target.

pub mod arch;
pub mod chain;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod memory;
pub mod patch;
pub mod registry;
pub mod retval;
pub mod signature;
pub mod vtable;

// re-exports for convenience
pub use chain::{RemovalCallback, TargetIdentity};
pub use context::{
    current_value, current_value_ptr, destroy_return_value, original_function, save_return,
    save_return_value,
};
pub use dispatch::do_recall;
pub use error::{HookError, Result};
pub use registry::{
    is_hooked, remove_hook, setup_hook, setup_virtual_hook, shutdown, HookId, HookRegistration,
};
pub use retval::{copy_value, drop_value, Action, CopyFn, DropFn};
pub use signature::{BoundCallable, Signature, ValueKind};

/// library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
