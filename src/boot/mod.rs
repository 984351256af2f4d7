// SPDX-License-Identifier: MPL-2.0

//! The architecture-independent boot module, which provides a universal interface
//! from the bootloader to the rest of the framework.
//!
//! Only the slice of bootloader-provided information that the memory subsystem needs
//! to bring itself up is kept here: the initial physical memory map. Command-line
//! parsing, initramfs, ACPI/framebuffer arguments and entry-point dispatch belong to
//! a bootable kernel built on top of this crate, not to the memory subsystem itself.

pub mod memory_region;

use alloc::vec::Vec;

use spin::Once;

use self::memory_region::MemoryRegion;

static MEMORY_REGIONS: Once<Vec<MemoryRegion>> = Once::new();

/// Registers the memory regions discovered by the platform-specific boot code.
///
/// Must be called once, before [`init`] and before [`crate::vm::init`].
pub fn register_memory_regions(regions: Vec<MemoryRegion>) {
    MEMORY_REGIONS.call_once(|| regions);
}

/// The memory regions handed over by the bootloader.
pub fn memory_regions() -> &'static [MemoryRegion] {
    MEMORY_REGIONS.get().map(Vec::as_slice).unwrap_or(&[])
}

/// The initialization method of the boot module.
///
/// After initializing the boot module, [`memory_regions`] may be called.
/// The initialization must be done after the heap is set and before physical
/// mappings are cancelled.
pub fn init() {
    MEMORY_REGIONS.call_once(Vec::new);
}
