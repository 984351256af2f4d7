// SPDX-License-Identifier: MPL-2.0

mod rwlock;
mod spin;

pub use self::{
    rwlock::{RwLock, RwLockReadGuard, RwLockUpgradeableGuard, RwLockWriteGuard},
    spin::{SpinLock, SpinLockGuard},
};
