use std::cell::Cell;

thread_local! {
    static KERNEL_MUTEX_OWNED: Cell<bool> = Cell::new(false);
}

/// Whether the current thread holds the kernel mutex.
pub fn kernel_mutex_own() -> bool {
    KERNEL_MUTEX_OWNED.with(|c| c.get())
}

pub(crate) fn set_kernel_mutex_own(val: bool) {
    KERNEL_MUTEX_OWNED.with(|c| c.set(val));
}

/// No latch may be requested while the kernel mutex is held.
pub fn assert_no_kernel_mutex(what: &str) {
    debug_assert!(
        !kernel_mutex_own(),
        "latch request ({}) while holding the kernel mutex",
        what
    );
}
