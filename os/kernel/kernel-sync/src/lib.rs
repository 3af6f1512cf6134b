//! # Kernel synchronization primitives
//!
//! Every lock in the memory subsystem is a [`SpinLock`]: plain mutual
//! exclusion that never sleeps, with an optional interrupt-disabling mode
//! ([`SpinLock::lock_irq`]) for state shared with interrupt handlers.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;

pub use irq::IrqGuard;
pub use spin_lock::{DEADLOCK_SPIN_LIMIT, IrqSpinLockGuard, SpinLock, SpinLockGuard};
