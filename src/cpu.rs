// SPDX-License-Identifier: MPL-2.0

//! CPU-local storage and CPU exception decoding.

use core::{cell::UnsafeCell, ops::Deref};

pub use trapframe::GeneralRegs;

use crate::trap::disable_local;

/// Defines a CPU-local variable.
///
/// # Example
///
/// ```rust
/// use crate::cpu_local;
/// use core::cell::RefCell;
///
/// cpu_local! {
///     static FOO: RefCell<u32> = RefCell::new(1);
///
///     #[allow(unused)]
///     pub static BAR: RefCell<f32> = RefCell::new(1.0);
/// }
/// CpuLocal::borrow_with(&FOO, |val| {
///     println!("FOO VAL: {:?}", *val);
/// })
///
/// ```
#[macro_export]
macro_rules! cpu_local {
    // empty
    () => {};

    // multiple declarations
    ($(#[$attr:meta])* $vis:vis static $name:ident: $t:ty = $init:expr; $($rest:tt)*) => {
        $(#[$attr])* $vis static $name: $crate::CpuLocal<$t> = unsafe { $crate::CpuLocal::new($init) };
        $crate::cpu_local!($($rest)*);
    };

    // single declaration
    ($(#[$attr:meta])* $vis:vis static $name:ident: $t:ty = $init:expr) => (
        // TODO: reimplement cpu-local variable to support multi-core
        $(#[$attr])* $vis static $name: $crate::CpuLocal<$t> = $crate::CpuLocal::new($init);
    );
}

/// CPU-local objects.
///
/// A CPU-local object only gives you immutable references to the underlying value.
/// To mutate the value, one can use atomic values (e.g., `AtomicU32`) or internally mutable
/// objects (e.g., `RefCell`).
///
/// The `CpuLocal<T: Sync>` can be used directly.
/// Otherwise, the `CpuLocal<T>` must be used through `CpuLocal::borrow_with`.
///
/// TODO: re-implement `CpuLocal` to be genuinely per-core once SMP bring-up lands.
pub struct CpuLocal<T>(UnsafeCell<T>);

// Safety. At any given time, only one task can access the inner value T of a cpu-local variable.
unsafe impl<T> Sync for CpuLocal<T> {}

impl<T> CpuLocal<T> {
    /// Initialize CPU-local object
    /// Developer cannot construct a valid CpuLocal object arbitrarily
    #[allow(clippy::missing_safety_doc)]
    pub const unsafe fn new(val: T) -> Self {
        Self(UnsafeCell::new(val))
    }

    /// Borrow an immutable reference to the underlying value and feed it to a closure.
    ///
    /// During the execution of the closure, local IRQs are disabled. This ensures that
    /// the CPU-local object is only accessed by the current task or IRQ handler.
    /// As local IRQs are disabled, one should keep the closure as short as possible.
    pub fn borrow_with<U, F: FnOnce(&T) -> U>(this: &Self, f: F) -> U {
        let _guard = disable_local();
        // Safety. Now that the local IRQs are disabled, this CPU-local object can only be
        // accessed by the current task/thread. So it is safe to get its immutable reference
        // regardless of whether `T` implements `Sync` or not.
        let val_ref = unsafe { this.do_borrow() };
        f(val_ref)
    }

    unsafe fn do_borrow(&self) -> &T {
        &*self.0.get()
    }
}

impl<T: Sync> Deref for CpuLocal<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.0.get() }
    }
}

bitflags::bitflags! {
    /// The error code pushed by the CPU alongside a `#PF` (page fault) exception,
    /// per Intel SDM Vol. 3A Section 4.7.
    pub struct PageFaultErrorCode: usize {
        /// The fault was caused by a page-protection violation.
        /// When not set, the fault was caused by a not-present page.
        const PRESENT  = 1 << 0;
        /// The access that caused the fault was a write.
        const WRITE    = 1 << 1;
        /// The access that caused the fault originated from user mode.
        const USER     = 1 << 2;
        /// One or more page directory entries contain reserved bits which are set to 1.
        const RESERVED_WRITE = 1 << 3;
        /// The fault was caused by an instruction fetch.
        const INSTRUCTION = 1 << 4;
    }
}

/// A minimal taxonomy of the CPU exception vectors this crate cares about.
///
/// Only the page fault vector is decoded; every other vector is reported as
/// [`CpuException::Other`] and left to whatever owns the trap vector table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuException {
    DivideError,
    Debug,
    NonMaskableInterrupt,
    Breakpoint,
    Overflow,
    BoundRangeExceeded,
    InvalidOpcode,
    DeviceNotAvailable,
    DoubleFault,
    InvalidTss,
    SegmentNotPresent,
    StackSegmentFault,
    GeneralProtectionFault,
    PageFault,
    X87FloatingPointException,
    AlignmentCheck,
    MachineCheck,
    SimdFloatingPointException,
    VirtualizationException,
    Other(u16),
}

pub const PAGE_FAULT_VECTOR: u16 = 14;

/// Whether the current CPU has the no-execute page protection feature
/// enabled (`EFER.NXE`).
///
/// [`crate::arch::enable_common_cpu_features`] sets this bit unconditionally
/// at boot, so in practice this is always `true` once the crate is
/// initialized; the check exists so that [`crate::vm::region::Region`]'s PTE
/// builder never asserts the `NO_EXECUTE` bit on hardware that lacks it.
pub fn has_nx_support() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        use x86_64::registers::model_specific::{Efer, EferFlags};
        Efer::read().contains(EferFlags::NO_EXECUTE_ENABLE)
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
}

impl CpuException {
    pub const fn is_cpu_exception(vector: u16) -> bool {
        vector < 32
    }

    pub fn to_cpu_exception(vector: u16) -> Option<Self> {
        if !Self::is_cpu_exception(vector) {
            return None;
        }
        Some(match vector {
            0 => Self::DivideError,
            1 => Self::Debug,
            2 => Self::NonMaskableInterrupt,
            3 => Self::Breakpoint,
            4 => Self::Overflow,
            5 => Self::BoundRangeExceeded,
            6 => Self::InvalidOpcode,
            7 => Self::DeviceNotAvailable,
            8 => Self::DoubleFault,
            10 => Self::InvalidTss,
            11 => Self::SegmentNotPresent,
            12 => Self::StackSegmentFault,
            13 => Self::GeneralProtectionFault,
            14 => Self::PageFault,
            16 => Self::X87FloatingPointException,
            17 => Self::AlignmentCheck,
            18 => Self::MachineCheck,
            19 => Self::SimdFloatingPointException,
            20 => Self::VirtualizationException,
            other => Self::Other(other),
        })
    }
}
