//! interception of plain function entry points
//!
//! inline prologue patching only exists on the x86_64 backend, and the
//! protection plumbing is exercised on linux.

#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

mod common;

use std::os::raw::c_void;
use std::ptr;

use common::{clear_log, log, take_log};
use waylay::{
    copy_value, drop_value, Action, HookId, HookRegistration, Signature, ValueKind,
};

type Target = extern "C" fn(i32) -> i32;

fn signature() -> Signature {
    Signature::new(vec![ValueKind::I32], ValueKind::I32).unwrap()
}

// callbacks shared by every i32(i32) target in this file

extern "C" fn pre_noop(_value: i32) -> i32 {
    log("pre");
    unsafe {
        waylay::save_return_value(Action::Ignore, ptr::null(), 0, None, None, false).unwrap();
    }
    0
}

extern "C" fn post_noop(_value: i32) -> i32 {
    log("post");
    0
}

extern "C" fn call_original(value: i32) -> i32 {
    log("call_original");
    let original: Target =
        unsafe { std::mem::transmute(waylay::original_function().unwrap()) };
    let result = original(value);
    unsafe {
        waylay::save_return_value(
            Action::Ignore,
            &result as *const i32 as *const c_void,
            std::mem::size_of::<i32>(),
            Some(copy_value::<i32>),
            Some(drop_value::<i32>),
            true,
        )
        .unwrap();
    }
    result
}

extern "C" fn make_return(_value: i32) -> i32 {
    log("make_return");
    let ptr = waylay::current_value_ptr(true).unwrap().unwrap();
    let result = unsafe { *(ptr as *const i32) };
    waylay::destroy_return_value().unwrap();
    result
}

extern "C" fn on_removed(id: HookId) {
    log(format!("on_removed {}", id.raw()));
}

fn noop_registration() -> HookRegistration {
    HookRegistration::new()
        .pre(pre_noop as usize)
        .post(post_noop as usize)
        .make_return(make_return as usize)
        .call_original(call_original as usize)
        .on_removed(on_removed)
}

extern "C" fn pre_override(_value: i32) -> i32 {
    log("pre_override");
    let replacement: i32 = -1;
    unsafe {
        waylay::save_return_value(
            Action::Override,
            &replacement as *const i32 as *const c_void,
            std::mem::size_of::<i32>(),
            Some(copy_value::<i32>),
            Some(drop_value::<i32>),
            false,
        )
        .unwrap();
    }
    0
}

extern "C" fn pre_supersede(_value: i32) -> i32 {
    log("pre_supersede");
    let replacement: i32 = 9001;
    unsafe {
        waylay::save_return_value(
            Action::Supersede,
            &replacement as *const i32 as *const c_void,
            std::mem::size_of::<i32>(),
            Some(copy_value::<i32>),
            Some(drop_value::<i32>),
            false,
        )
        .unwrap();
    }
    0
}

extern "C" fn pre_recall(_value: i32) -> i32 {
    log("pre_recall");
    let entry =
        unsafe { waylay::do_recall(Action::Ignore, ptr::null(), 0, None, None).unwrap() };
    let recall: Target = unsafe { std::mem::transmute(entry) };
    recall(1337);
    0
}

// distinct targets per test so parallel tests never share a chain; the
// bodies do real work to keep their prologues honest under optimization

#[inline(never)]
extern "C" fn scale_a(value: i32) -> i32 {
    log("original");
    value.wrapping_mul(2).wrapping_add(1)
}

#[inline(never)]
extern "C" fn scale_b(value: i32) -> i32 {
    log("original");
    value.wrapping_mul(3).wrapping_add(2)
}

#[inline(never)]
extern "C" fn scale_c(value: i32) -> i32 {
    log("original");
    value.wrapping_mul(5).wrapping_add(3)
}

#[inline(never)]
extern "C" fn scale_d(value: i32) -> i32 {
    log("original");
    value.wrapping_mul(7).wrapping_add(4)
}

#[inline(never)]
extern "C" fn scale_e(value: i32) -> i32 {
    log("original");
    value.wrapping_mul(11).wrapping_add(5)
}

#[inline(never)]
extern "C" fn record_f(value: i32) -> i32 {
    log(format!("original {value}"));
    value
}

#[inline(never)]
extern "C" fn outer_g(value: i32) -> i32 {
    log("outer_original");
    value.wrapping_add(1000)
}

#[test]
fn noop_hook_preserves_behavior_and_order() {
    clear_log();
    let unhooked = scale_a(21);
    clear_log();

    let id = unsafe {
        waylay::setup_hook(scale_a as usize, signature(), noop_registration()).unwrap()
    };
    assert!(id.is_valid());

    assert_eq!(scale_a(21), unhooked);
    assert_eq!(
        take_log(),
        ["pre", "call_original", "original", "post", "make_return"]
    );

    waylay::remove_hook(id, false).unwrap();
    assert_eq!(take_log(), [format!("on_removed {}", id.raw())]);

    assert_eq!(scale_a(21), unhooked);
    assert_eq!(take_log(), ["original"]);
}

#[test]
fn stacked_hooks_nest_around_one_original_stage() {
    clear_log();
    let first = unsafe {
        waylay::setup_hook(scale_b as usize, signature(), noop_registration()).unwrap()
    };
    let second = unsafe {
        waylay::setup_hook(scale_b as usize, signature(), noop_registration()).unwrap()
    };

    assert_eq!(scale_b(4), scale_b_unhooked(4));
    assert_eq!(
        take_log(),
        ["pre", "pre", "call_original", "original", "post", "post", "make_return"]
    );

    // dropping the inner hook leaves a single-layer chain
    waylay::remove_hook(first, false).unwrap();
    clear_log();

    assert_eq!(scale_b(4), scale_b_unhooked(4));
    assert_eq!(
        take_log(),
        ["pre", "call_original", "original", "post", "make_return"]
    );

    waylay::remove_hook(second, false).unwrap();
}

fn scale_b_unhooked(value: i32) -> i32 {
    value.wrapping_mul(3).wrapping_add(2)
}

#[test]
fn override_replaces_result_but_runs_original() {
    clear_log();
    let id = unsafe {
        waylay::setup_hook(
            scale_c as usize,
            signature(),
            noop_registration().pre(pre_override as usize),
        )
        .unwrap()
    };

    assert_eq!(scale_c(10), -1);
    let entries = take_log();
    assert!(entries.contains(&"original".to_string()));

    waylay::remove_hook(id, false).unwrap();
    assert_eq!(scale_c(10), 53);
}

#[test]
fn supersede_skips_original_entirely() {
    clear_log();
    let id = unsafe {
        waylay::setup_hook(
            scale_d as usize,
            signature(),
            noop_registration().pre(pre_supersede as usize),
        )
        .unwrap()
    };

    assert_eq!(scale_d(10), 9001);
    let entries = take_log();
    assert!(!entries.contains(&"original".to_string()));
    assert!(!entries.contains(&"call_original".to_string()));
    assert_eq!(entries.last().map(String::as_str), Some("make_return"));

    waylay::remove_hook(id, false).unwrap();
    assert_eq!(scale_d(10), 74);
}

#[test]
fn inner_supersede_still_runs_outer_posts() {
    clear_log();
    // first registration is innermost
    let inner = unsafe {
        waylay::setup_hook(
            scale_e as usize,
            signature(),
            noop_registration().pre(pre_supersede as usize),
        )
        .unwrap()
    };
    let outer = unsafe {
        waylay::setup_hook(scale_e as usize, signature(), noop_registration()).unwrap()
    };

    assert_eq!(scale_e(1), 9001);
    assert_eq!(
        take_log(),
        ["pre", "pre_supersede", "post", "post", "make_return"]
    );

    waylay::remove_hook(inner, false).unwrap();
    waylay::remove_hook(outer, false).unwrap();
}

#[test]
fn recall_rewrites_arguments() {
    clear_log();
    let id = unsafe {
        waylay::setup_hook(
            record_f as usize,
            signature(),
            noop_registration().pre(pre_recall as usize),
        )
        .unwrap()
    };

    // the caller passes 7 but the pre callback recalls with 1337
    assert_eq!(record_f(7), 1337);
    let entries = take_log();
    assert!(entries.contains(&"original 1337".to_string()));
    assert!(!entries.contains(&"original 7".to_string()));
    assert!(!entries.contains(&"call_original".to_string()));

    waylay::remove_hook(id, false).unwrap();
    assert_eq!(record_f(7), 7);
}

// a pre callback that itself calls another hooked function
extern "C" fn pre_reentrant(_value: i32) -> i32 {
    log("pre_outer");
    // scale_a-equivalent target hooked by the same test
    assert_eq!(outer_inner_target(2), 2_i32.wrapping_mul(13).wrapping_add(6));
    0
}

#[inline(never)]
extern "C" fn outer_inner_target(value: i32) -> i32 {
    log("inner_original");
    value.wrapping_mul(13).wrapping_add(6)
}

#[test]
fn hooked_calls_nest_across_targets() {
    clear_log();
    let inner_id = unsafe {
        waylay::setup_hook(outer_inner_target as usize, signature(), noop_registration())
            .unwrap()
    };
    let outer_id = unsafe {
        waylay::setup_hook(
            outer_g as usize,
            signature(),
            noop_registration().pre(pre_reentrant as usize),
        )
        .unwrap()
    };

    assert_eq!(outer_g(1), 1001);
    let entries = take_log();
    // the inner interception ran to completion inside the outer pre
    assert_eq!(entries.first().map(String::as_str), Some("pre_outer"));
    assert!(entries.contains(&"inner_original".to_string()));
    assert!(entries.contains(&"outer_original".to_string()));
    assert_eq!(entries.last().map(String::as_str), Some("make_return"));

    waylay::remove_hook(outer_id, false).unwrap();
    waylay::remove_hook(inner_id, false).unwrap();
}

#[test]
fn mismatched_signature_rejected_on_stacking() {
    let id = unsafe {
        waylay::setup_hook(
            mismatch_target as usize,
            signature(),
            noop_registration(),
        )
        .unwrap()
    };

    let wider = Signature::new(vec![ValueKind::I32, ValueKind::I32], ValueKind::I32).unwrap();
    let result = unsafe { waylay::setup_hook(mismatch_target as usize, wider, noop_registration()) };
    assert!(matches!(
        result,
        Err(waylay::HookError::SignatureMismatch { .. })
    ));

    waylay::remove_hook(id, false).unwrap();
}

#[inline(never)]
extern "C" fn mismatch_target(value: i32) -> i32 {
    log("original");
    value.wrapping_mul(17).wrapping_add(8)
}
