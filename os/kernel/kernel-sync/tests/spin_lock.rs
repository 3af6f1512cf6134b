use kernel_sync::{IrqGuard, SpinLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn guard_unlocks_on_drop() {
    let l = SpinLock::new(0_u32);
    {
        let mut g = l.lock();
        *g = 41;
        assert!(l.is_locked());
    }
    assert!(!l.is_locked());

    let mut g = l.lock();
    *g += 1;
    assert_eq!(*g, 42);
}

#[test]
fn try_lock_fails_while_held() {
    let l = SpinLock::named("frames", 7u8);

    let g1 = l.try_lock();
    assert!(g1.is_some());
    assert!(l.try_lock().is_none());

    drop(g1);
    assert_eq!(l.try_lock().map(|g| *g), Some(7));
}

#[test]
fn irq_mode_still_excludes() {
    let l = SpinLock::new(Vec::<u32>::new());
    {
        let mut g = l.lock_irq();
        g.push(1);
        assert!(l.try_lock().is_none());
    }
    l.with_lock(|v| v.push(2));
    assert_eq!(l.lock().as_slice(), &[1, 2]);
}

#[test]
fn irq_guards_nest() {
    let outer = IrqGuard::new();
    let inner = IrqGuard::new();
    // The inner guard always observes interrupts as disabled.
    assert!(!inner.were_enabled());
    drop(inner);
    drop(outer);
}

#[test]
fn debug_output_names_the_lock() {
    let l = SpinLock::named("page-map", ());
    let s = format!("{l:?}");
    assert!(s.contains("page-map"));
    assert!(s.contains("locked: false"));
}

#[test]
fn contended_increments_are_exact_and_exclusive() {
    let threads = 8;
    let iters = 5_000;

    let lock = Arc::new(SpinLock::new(0usize));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let lock = Arc::clone(&lock);
            let in_cs = Arc::clone(&in_cs);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for i in 0..iters {
                    let mut g = if (t + i) % 2 == 0 {
                        either::Left(lock.lock())
                    } else {
                        either::Right(lock.lock_irq())
                    };
                    let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(prev, 0, "mutual exclusion violated");
                    *g.value_mut() += 1;
                    in_cs.fetch_sub(1, Ordering::SeqCst);
                    drop(g);
                    thread::yield_now();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(lock.with_lock(|v| *v), threads * iters);
}

#[test]
fn lock_is_released_on_panic() {
    let l = SpinLock::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");
    assert_eq!(l.with_lock(|v| *v), 123);
}

#[test]
fn get_mut_and_into_inner_bypass_the_lock() {
    let mut l = SpinLock::new(vec![1, 2, 3]);
    l.get_mut().push(4);
    assert_eq!(l.into_inner(), vec![1, 2, 3, 4]);
}

/// Minimal two-guard sum so the contention test can mix both lock modes.
mod either {
    use kernel_sync::{IrqSpinLockGuard, SpinLockGuard};

    pub enum Guard<'a> {
        Left(SpinLockGuard<'a, usize>),
        Right(IrqSpinLockGuard<'a, usize>),
    }

    pub use Guard::{Left, Right};

    impl Guard<'_> {
        pub fn value_mut(&mut self) -> &mut usize {
            match self {
                Left(g) => g,
                Right(g) => g,
            }
        }
    }
}
