use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    mem,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// Returned when acquiring a lock whose previous holder unwound inside the
/// critical section.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("spin lock poisoned by a panic inside its critical section")]
pub struct PoisonError;

pub struct SpinLock<T> {
    /// lock state
    /// * `false`: unlocked
    /// * `true`: locked
    locked: AtomicBool,
    /// Set when a critical section unwound; sticky until [`SpinLock::clear_poison`].
    poisoned: AtomicBool,
    inner: UnsafeCell<T>,
}

// Safety: mutual exclusion; only T: Send may cross threads.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Whether a previous critical section unwound while holding the lock.
    #[inline]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Accept whatever state the protected value was left in.
    #[inline]
    pub fn clear_poison(&self) {
        self.poisoned.store(false, Ordering::Release);
    }

    /// Try once; returns immediately.
    ///
    /// # Errors
    /// [`PoisonError`] if the lock was acquired but is poisoned. The lock is
    /// released again before returning.
    #[inline]
    pub fn try_lock(&self) -> Option<Result<SpinLockGuard<'_, T>, PoisonError>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(self.guard())
        } else {
            None
        }
    }

    /// Spin until acquired (TATAS), then return a guard.
    ///
    /// # Errors
    /// [`PoisonError`] if a previous holder unwound. The lock is not held on
    /// return in that case.
    #[inline]
    pub fn lock(&self) -> Result<SpinLockGuard<'_, T>, PoisonError> {
        // Fast path: take the lock if it looks free.
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Contended path: spin on a read (cheap), then retry CAS.
            while self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                while self.locked.load(Ordering::Relaxed) {
                    spin_loop();
                }
            }
        }
        self.guard()
    }

    /// Closure convenience, built on the guard.
    ///
    /// If `f` unwinds, the lock is poisoned regardless of whether the `std`
    /// feature is enabled.
    ///
    /// # Errors
    /// [`PoisonError`] if the lock was poisoned before `f` could run.
    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, PoisonError> {
        let mut g = self.lock()?;
        let bomb = PoisonOnUnwind(&self.poisoned);
        let result = f(&mut g);
        mem::forget(bomb);
        Ok(result)
    }

    /// Mutable access when you have `&mut self` (no contention possible).
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    /// Consume the lock and return the protected value, poisoned or not.
    #[inline]
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }

    #[inline]
    fn guard(&self) -> Result<SpinLockGuard<'_, T>, PoisonError> {
        if self.poisoned.load(Ordering::Acquire) {
            self.locked.store(false, Ordering::Release);
            return Err(PoisonError);
        }
        Ok(SpinLockGuard { lock: self })
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Poisons the flag it points to if dropped; forgotten on the normal path.
struct PoisonOnUnwind<'a>(&'a AtomicBool);

impl Drop for PoisonOnUnwind<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        #[cfg(any(test, feature = "std"))]
        if std::thread::panicking() {
            self.lock.poisoned.store(true, Ordering::Release);
        }
        // Release publishes the critical section.
        self.lock.locked.store(false, Ordering::Release);
    }
}
