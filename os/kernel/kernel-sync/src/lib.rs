//! # Kernel synchronization primitives
//!
//! Interrupt-safe spinlocks shared by the buddy allocator, the heap layer and
//! the heap manager.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;

pub use irq::IrqGuard;
pub use spin_lock::{IrqSpinLockGuard, SpinLock, SpinLockGuard};
