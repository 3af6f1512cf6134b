use crate::irq::IrqGuard;
use core::{
    cell::UnsafeCell,
    fmt,
    hint::spin_loop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// Number of failed acquisition rounds after which a waiter gives up and
/// reports a deadlock instead of spinning forever.
pub const DEADLOCK_SPIN_LIMIT: u64 = 1 << 32;

pub struct SpinLock<T> {
    /// lock state
    /// * `false`: unlocked
    /// * `true`: locked
    locked: AtomicBool,
    /// Human readable owner, reported when a deadlock is detected.
    name: &'static str,
    inner: UnsafeCell<T>,
}

// Safety: mutual exclusion; only T: Send may cross threads.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(inner: T) -> Self {
        Self::named("anonymous", inner)
    }

    /// Create a lock whose name shows up in deadlock diagnostics.
    pub const fn named(name: &'static str, inner: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            name,
            inner: UnsafeCell::new(inner),
        }
    }

    #[inline]
    fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Try once; returns immediately.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.try_acquire() {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Spin until acquired (TATAS), then return a guard.
    ///
    /// # Panics
    /// If the lock stays taken for [`DEADLOCK_SPIN_LIMIT`] rounds.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        if !self.try_acquire() {
            self.lock_contended();
        }
        SpinLockGuard { lock: self }
    }

    #[cold]
    fn lock_contended(&self) {
        let mut spins: u64 = 0;
        loop {
            while self.locked.load(Ordering::Relaxed) {
                spins += 1;
                assert!(
                    spins < DEADLOCK_SPIN_LIMIT,
                    "deadlock: spin lock `{}` never released",
                    self.name
                );
                spin_loop();
            }
            if self.try_acquire() {
                return;
            }
        }
    }

    /// Acquire the lock with local interrupts disabled for the guard's lifetime.
    ///
    /// Use this for state that is also touched from interrupt context, so a
    /// handler can never spin on a lock its own CPU already holds.
    #[inline]
    pub fn lock_irq(&self) -> IrqSpinLockGuard<'_, T> {
        let irq = IrqGuard::new();
        let guard = self.lock();
        IrqSpinLockGuard { guard, _irq: irq }
    }

    /// Closure convenience, built on the guard.
    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.lock();
        f(&mut g)
    }

    /// Whether someone currently holds the lock (racy; diagnostics only).
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Mutable access when you have `&mut self` (no contention possible).
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("name", &self.name)
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
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
        // Release publishes the critical section.
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// Guard returned by [`SpinLock::lock_irq`].
///
/// Field order matters: the lock is released before interrupts are restored.
pub struct IrqSpinLockGuard<'a, T> {
    guard: SpinLockGuard<'a, T>,
    _irq: IrqGuard,
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
