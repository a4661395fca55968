mod lock_sys;
mod wait_for_graph;

pub use lock_sys::{LockMode, LockSys, RecLockKey};
