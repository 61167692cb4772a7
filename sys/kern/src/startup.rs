// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup.
//!
//! The application's reset path does its hardware setup and then calls
//! [`start_kernel`] with the boot task descriptors. From that point the
//! boot stack *is* the idle task: the first dispatch parks the boot
//! context in the idle task's saved-SP slot, and whenever nothing else is
//! runnable, control comes back to the loop at the bottom of
//! `start_kernel`.

use core::mem::MaybeUninit;

use abi::TaskDesc;

use crate::arch;
use crate::kernel::Kernel;

static mut KERNEL: MaybeUninit<Kernel<'static>> = MaybeUninit::uninit();

/// Boots the kernel over the RAM left past the loaded image and runs the
/// boot tasks. Panics if the boot configuration is rejected; there is
/// nobody to report that to.
///
/// # Safety
///
/// This can be called exactly once per boot.
pub unsafe fn start_kernel(boot_tasks: &[TaskDesc]) -> ! {
    klog!("starting: kernel");
    let arena = arch::heap_region();
    let kernel = match Kernel::new(arena, boot_tasks) {
        Ok(kernel) => kernel,
        Err(_) => panic!("boot configuration rejected"),
    };
    let slot = &mut *core::ptr::addr_of_mut!(KERNEL);
    let kernel = slot.write(kernel);

    klog!("starting: first task");
    kernel.run_new();

    // Idle task body. We land back here whenever the ready queue drains.
    loop {
        arch::wait_for_interrupt();
    }
}

/// Grants the trap layer access to the kernel singleton.
///
/// # Safety
///
/// Only meaningful after `start_kernel` has initialized the singleton,
/// and only sound because kernel entries never re-enter: interrupts are
/// masked for their duration, so at most one mutable reference exists at
/// a time.
pub unsafe fn with_kernel<R>(body: impl FnOnce(&mut Kernel<'static>) -> R) -> R {
    let slot = &mut *core::ptr::addr_of_mut!(KERNEL);
    body(slot.assume_init_mut())
}
