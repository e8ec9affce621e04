use std::sync::atomic::{AtomicBool, Ordering};

/// Global debug flags toggled via console.
/// When a flag is true, the module logs at info! level instead of being silent.
pub static DEBUG_TOUCH: AtomicBool = AtomicBool::new(false);
pub static DEBUG_CLOUD: AtomicBool = AtomicBool::new(false);
pub static DEBUG_AUDIO: AtomicBool = AtomicBool::new(false);

/// Request flags: the console sets these, the main loop acts on them.
pub static REQUEST_UPDATE_CHECK: AtomicBool = AtomicBool::new(false);

pub fn is_on(flag: &AtomicBool) -> bool {
    flag.load(Ordering::Relaxed)
}

pub fn set(flag: &AtomicBool, val: bool) {
    flag.store(val, Ordering::Relaxed);
}

pub fn toggle(flag: &AtomicBool) -> bool {
    let old = flag.load(Ordering::Relaxed);
    flag.store(!old, Ordering::Relaxed);
    !old
}

/// Consume a request flag: returns true at most once per set.
pub fn take(flag: &AtomicBool) -> bool {
    flag.swap(false, Ordering::Relaxed)
}

pub fn status_line() -> String {
    format!(
        "touch={} cloud={} audio={}",
        if is_on(&DEBUG_TOUCH) { "ON" } else { "off" },
        if is_on(&DEBUG_CLOUD) { "ON" } else { "off" },
        if is_on(&DEBUG_AUDIO) { "ON" } else { "off" },
    )
}
