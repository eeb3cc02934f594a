//! The pool header embeds a small spinlock instead of an OS mutex
//! handle: the region may be mapped at different addresses in
//! different processes, and wiring up a `pthread_mutex_t` with the
//! `PSHARED` attribute across that boundary is exactly the kind of
//! mutex-primitive plumbing this crate leaves to its caller (see
//! §1/§4.F of the specification).  A single atomic word in shared
//! memory works across cooperating processes on one machine without
//! any of that.
use std::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// A spinlock whose state lives entirely in the 4 bytes of `state`,
/// so it is safe to embed directly in a shared-memory header.
#[repr(C)]
pub struct RegionLock {
    state: AtomicU32,
}

impl RegionLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    /// Acquires the lock, spinning (with a short backoff) until it is free.
    pub fn lock(&self) {
        let mut spins: u32 = 0;

        while self
            .state
            .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spins += 1;
            if spins < 64 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Releases the lock.  Calling this without holding the lock is
    /// a logic error, but does not corrupt the lock's own state.
    pub fn unlock(&self) {
        self.state.store(UNLOCKED, Ordering::Release);
    }
}

impl Default for RegionLock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII helper mirroring `std::sync::MutexGuard`, for pool-internal
/// operations that always want lock/unlock paired.
pub struct RegionLockGuard<'a> {
    lock: &'a RegionLock,
}

impl<'a> RegionLockGuard<'a> {
    pub fn acquire(lock: &'a RegionLock) -> Self {
        lock.lock();
        Self { lock }
    }
}

impl Drop for RegionLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn uncontended_lock_unlock() {
        let lock = RegionLock::new();
        lock.lock();
        lock.unlock();
    }

    #[test]
    fn guard_unlocks_on_drop() {
        let lock = RegionLock::new();
        {
            let _guard = RegionLockGuard::acquire(&lock);
        }
        // If the guard failed to unlock, this would spin forever.
        lock.lock();
        lock.unlock();
    }

    #[test]
    fn contended_threads_serialize() {
        let lock = Arc::new(RegionLock::new());
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let _guard = RegionLockGuard::acquire(&lock);
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::Relaxed), 8000);
    }
}
