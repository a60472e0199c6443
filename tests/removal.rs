//! hook removal semantics, immediate and deferred
#![cfg(target_os = "linux")]

mod common;

use std::os::raw::c_void;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use common::{clear_log, log, take_log};
use waylay::{
    copy_value, drop_value, Action, HookError, HookId, HookRegistration, Signature, ValueKind,
};

#[repr(C)]
struct Counter {
    vtable: *const usize,
    value: i32,
}

type GetFn = extern "C" fn(*mut Counter) -> i32;

#[inline(never)]
extern "C" fn counter_get(obj: *mut Counter) -> i32 {
    log("original");
    unsafe { (*obj).value }
}

fn make_table() -> Vec<usize> {
    vec![counter_get as usize, 0]
}

fn call_get(obj: &mut Counter) -> i32 {
    let entry: GetFn = unsafe { std::mem::transmute(*obj.vtable) };
    entry(obj)
}

fn signature() -> Signature {
    Signature::new(vec![ValueKind::Pointer], ValueKind::I32).unwrap()
}

extern "C" fn call_original(obj: *mut Counter) -> i32 {
    log("call_original");
    let original: GetFn = unsafe { std::mem::transmute(waylay::original_function().unwrap()) };
    let result = original(obj);
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

extern "C" fn make_return(_obj: *mut Counter) -> i32 {
    log("make_return");
    let ptr = waylay::current_value_ptr(true).unwrap().unwrap();
    let result = unsafe { *(ptr as *const i32) };
    waylay::destroy_return_value().unwrap();
    result
}

extern "C" fn on_removed(id: HookId) {
    log(format!("on_removed {}", id.raw()));
}

fn base_registration() -> HookRegistration {
    HookRegistration::new()
        .make_return(make_return as usize)
        .call_original(call_original as usize)
        .on_removed(on_removed)
}

// the pre callback below removes its own hook mid-call
static SELF_ID: AtomicI32 = AtomicI32::new(-1);

extern "C" fn pre_remove_self(_obj: *mut Counter) -> i32 {
    log("pre_remove_self");
    let id = HookId::from_raw(SELF_ID.load(Ordering::Acquire));
    waylay::remove_hook(id, true).unwrap();
    0
}

#[test]
fn deferred_self_removal_finishes_the_call_first() {
    clear_log();
    let mut table = make_table();
    let mut obj = Counter {
        vtable: table.as_ptr(),
        value: 11,
    };

    let id = unsafe {
        waylay::setup_virtual_hook(
            table.as_mut_ptr(),
            0,
            signature(),
            base_registration().pre(pre_remove_self as usize),
        )
        .unwrap()
    };
    SELF_ID.store(id.raw(), Ordering::Release);

    // the layer retires only once the call it removed itself from exits
    assert_eq!(call_get(&mut obj), 11);
    assert_eq!(
        take_log(),
        [
            "pre_remove_self".to_string(),
            "call_original".to_string(),
            "original".to_string(),
            "make_return".to_string(),
            format!("on_removed {}", id.raw()),
        ]
    );
    assert!(!waylay::is_hooked(id));

    // target restored, later calls go straight to the original
    assert_eq!(call_get(&mut obj), 11);
    assert_eq!(take_log(), ["original"]);
}

#[test]
fn deferred_removal_while_idle_retires_at_once() {
    clear_log();
    let mut table = make_table();

    let id = unsafe {
        waylay::setup_virtual_hook(table.as_mut_ptr(), 0, signature(), base_registration())
            .unwrap()
    };

    waylay::remove_hook(id, true).unwrap();
    assert_eq!(take_log(), [format!("on_removed {}", id.raw())]);
    assert_eq!(table[0], counter_get as usize);
}

// state for parking a call inside its pre callback while another thread
// removes the hook out from under it
static PARKED: AtomicBool = AtomicBool::new(false);
static RELEASE: AtomicBool = AtomicBool::new(false);
static RETIREMENTS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn pre_park(_obj: *mut Counter) -> i32 {
    PARKED.store(true, Ordering::Release);
    while !RELEASE.load(Ordering::Acquire) {
        std::thread::yield_now();
    }
    0
}

extern "C" fn on_removed_count(_id: HookId) {
    RETIREMENTS.fetch_add(1, Ordering::AcqRel);
}

#[test]
fn cross_thread_deferred_removal_waits_for_the_call() {
    let mut table = make_table();
    let table_ptr = table.as_ptr() as usize;

    let registration = HookRegistration::new()
        .pre(pre_park as usize)
        .on_removed(on_removed_count);
    let id = unsafe {
        waylay::setup_virtual_hook(table.as_mut_ptr(), 0, signature(), registration).unwrap()
    };

    std::thread::scope(|scope| {
        let caller = scope.spawn(move || {
            let mut obj = Counter {
                vtable: table_ptr as *const usize,
                value: 23,
            };
            call_get(&mut obj)
        });

        while !PARKED.load(Ordering::Acquire) {
            std::thread::yield_now();
        }

        // the call is inside its pre callback; retire the hook from here
        waylay::remove_hook(id, true).unwrap();
        assert!(!waylay::is_hooked(id));
        // retirement waits for the in-flight call
        assert_eq!(RETIREMENTS.load(Ordering::Acquire), 0);

        RELEASE.store(true, Ordering::Release);
        assert_eq!(caller.join().unwrap(), 23);
    });

    // the draining call performed the retirement, exactly once
    assert_eq!(RETIREMENTS.load(Ordering::Acquire), 1);
    assert_eq!(table[0], counter_get as usize);
}

extern "C" fn pre_inner(_obj: *mut Counter) -> i32 {
    log("pre_inner");
    0
}

extern "C" fn pre_outer(_obj: *mut Counter) -> i32 {
    log("pre_outer");
    0
}

#[test]
fn removed_layer_stops_receiving_calls() {
    clear_log();
    let mut table = make_table();
    let mut obj = Counter {
        vtable: table.as_ptr(),
        value: 3,
    };

    let inner = unsafe {
        waylay::setup_virtual_hook(
            table.as_mut_ptr(),
            0,
            signature(),
            base_registration().pre(pre_inner as usize),
        )
        .unwrap()
    };
    let outer = unsafe {
        waylay::setup_virtual_hook(
            table.as_mut_ptr(),
            0,
            signature(),
            HookRegistration::new()
                .pre(pre_outer as usize)
                .on_removed(on_removed),
        )
        .unwrap()
    };

    waylay::remove_hook(outer, false).unwrap();
    clear_log();

    assert_eq!(call_get(&mut obj), 3);
    let entries = take_log();
    assert!(entries.contains(&"pre_inner".to_string()));
    assert!(!entries.contains(&"pre_outer".to_string()));

    waylay::remove_hook(inner, false).unwrap();
}

#[test]
fn ids_stay_retired_after_removal() {
    let mut table = make_table();

    let id = unsafe {
        waylay::setup_virtual_hook(table.as_mut_ptr(), 0, signature(), base_registration())
            .unwrap()
    };
    assert!(waylay::is_hooked(id));

    waylay::remove_hook(id, false).unwrap();
    assert!(!waylay::is_hooked(id));
    assert!(matches!(
        waylay::remove_hook(id, false),
        Err(HookError::UnknownHook(_))
    ));

    // a fresh hook on the same slot gets a fresh id
    let next = unsafe {
        waylay::setup_virtual_hook(table.as_mut_ptr(), 0, signature(), base_registration())
            .unwrap()
    };
    assert_ne!(next, id);
    waylay::remove_hook(next, false).unwrap();
    clear_log();
}

#[test]
fn invalid_id_is_rejected() {
    assert!(!HookId::INVALID.is_valid());
    assert!(matches!(
        waylay::remove_hook(HookId::INVALID, false),
        Err(HookError::UnknownHook(_))
    ));
}
