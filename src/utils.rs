use std::{
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    thread::sleep,
    time::Duration,
};

use log::warn;

pub use crate::log::init_log;
use crate::error::{ErrorCode, SmallError};

/// `wl()` / `rl()` for the dictionary locks, which are taken even when
/// poisoned.
pub trait HandyRwLock<T> {
    fn wl(&self) -> RwLockWriteGuard<'_, T>;
    fn rl(&self) -> RwLockReadGuard<'_, T>;
}

impl<T> HandyRwLock<T> for RwLock<T> {
    fn wl(&self) -> RwLockWriteGuard<'_, T> {
        self.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn rl(&self) -> RwLockReadGuard<'_, T> {
        self.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded retry with a fixed sleep between the attempts.
///
/// Only errors carrying `retry_on` are retried, everything else is
/// returned at once. The last error is returned when the attempts are
/// used up.
#[derive(Debug, Clone, Copy)]
pub struct Retry {
    pub attempts: usize,
    pub backoff: Duration,
    pub retry_on: ErrorCode,
}

impl Retry {
    pub fn new(attempts: usize, backoff: Duration, retry_on: ErrorCode) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
            retry_on,
        }
    }

    pub fn run<T, F>(&self, mut op: F) -> Result<T, SmallError>
    where
        F: FnMut(usize) -> Result<T, SmallError>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Err(e) if e.is(self.retry_on) && attempt + 1 < self.attempts => {
                    warn!(
                        "attempt {} failed with {}, retry in {:?}",
                        attempt, e, self.backoff
                    );
                    attempt += 1;
                    sleep(self.backoff);
                }
                r => return r,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_gives_up() {
        let retry = Retry::new(3, Duration::from_millis(1), ErrorCode::OutOfFileSpace);
        let mut calls = 0;
        let r: Result<(), SmallError> = retry.run(|_| {
            calls += 1;
            Err(SmallError::new(ErrorCode::OutOfFileSpace, "full"))
        });
        assert!(r.unwrap_err().is(ErrorCode::OutOfFileSpace));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_other_errors_pass_through() {
        let retry = Retry::new(5, Duration::from_millis(1), ErrorCode::OutOfFileSpace);
        let mut calls = 0;
        let r: Result<(), SmallError> = retry.run(|_| {
            calls += 1;
            Err(SmallError::new(ErrorCode::Corruption, "bad"))
        });
        assert!(r.unwrap_err().is(ErrorCode::Corruption));
        assert_eq!(calls, 1);

        let r = retry.run(|attempt| {
            if attempt < 2 {
                Err(SmallError::new(ErrorCode::OutOfFileSpace, "full"))
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(r.unwrap(), 2);
    }

    #[test]
    fn test_poisoned_lock_still_usable() {
        let lock = std::sync::Arc::new(RwLock::new(1));
        let l = std::sync::Arc::clone(&lock);
        let r = std::thread::spawn(move || {
            let mut guard = l.wl();
            *guard = 2;
            panic!("writer died");
        })
        .join();
        assert!(r.is_err());
        assert!(lock.is_poisoned());
        assert_eq!(*lock.rl(), 2);
        *lock.wl() += 1;
        assert_eq!(*lock.rl(), 3);
    }
}
