//! shared helpers for the integration suite
//!
//! callback invocations are recorded in a thread-local log; each test
//! runs on its own thread, so logs never bleed between tests.

use std::cell::RefCell;

thread_local! {
    static LOG: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

pub fn log(entry: impl Into<String>) {
    LOG.with(|log| log.borrow_mut().push(entry.into()));
}

pub fn take_log() -> Vec<String> {
    LOG.with(|log| std::mem::take(&mut *log.borrow_mut()))
}

pub fn clear_log() {
    let _ = take_log();
}
