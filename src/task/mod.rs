// SPDX-License-Identifier: MPL-2.0

//! Minimal per-CPU atomic-context bookkeeping.
//!
//! This crate has no scheduler of its own: every lock is a spin lock and every
//! fault path runs to completion without blocking. What remains of the task
//! layer is the bookkeeping that [`crate::sync::SpinLock`] needs to know whether
//! preemption (and, transitively, IRQs) are currently disabled on this CPU.

mod preempt;

pub use self::preempt::{
    disable_preempt, in_atomic, is_in_preemption, is_preemptible, panic_if_in_atomic,
    DisablePreemptGuard,
};
