//! Extension trait to ignore mutex poisoning.
//!
//! Session, catalog and gate state live behind `std::sync::Mutex`. A worker that panics inside
//! a driver call poisons whatever it held; the data stays valid, so lock sites take the guard
//! back instead of propagating the poison.

use std::sync::{Mutex, MutexGuard};

pub trait IgnorePoison<T> {
    /// Locks the mutex, ignoring poison. Use this for state where a panic in another
    /// thread doesn't invalidate the data.
    fn lock_ignore_poison(&self) -> MutexGuard<'_, T>;
}

impl<T> IgnorePoison<T> for Mutex<T> {
    fn lock_ignore_poison(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_lock_recovers_after_panic() {
        let counter = Arc::new(Mutex::new(0u32));
        let poisoner = Arc::clone(&counter);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(counter.lock().is_err());
        *counter.lock_ignore_poison() += 1;
        assert_eq!(*counter.lock_ignore_poison(), 1);
    }
}
