// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv7-M.
//!
//! The kernel proper is portable; everything that knows about registers,
//! processor state words, or the shape of RAM lives here. The two pieces
//! with teeth are:
//!
//! - `switch_stacks`, the context switch primitive. Given a pointer to the
//!   outgoing task's saved-SP slot and the incoming task's saved SP, it
//!   parks the callee-saved state of the current kernel thread on its own
//!   stack, records the resulting stack pointer through the slot, and
//!   resumes whatever the incoming stack was doing when it was parked. A
//!   brand new task's stack is fabricated to look parked-in-this-way (see
//!   `task::init_task_frame`), so the same pop sequence also launches tasks.
//!
//! - `heap_region`, which hands the allocator the RAM between the end of
//!   the loaded image (a linker symbol) and `RAM_END`.

/// Log stuff. This defines a macro, `klog!`, which can be used in perf- and
/// size-sensitive contexts to log stuff that will normally not be logged.
///
/// With no `klog-*` feature enabled it compiles to nothing.
#[cfg(not(any(feature = "klog-semihosting", feature = "klog-itm")))]
macro_rules! klog {
    ($s:expr) => { };
    ($s:expr, $($tt:tt)*) => { };
}

#[cfg(feature = "klog-itm")]
macro_rules! klog {
    ($s:expr) => {
        #[allow(unused_unsafe)]
        unsafe {
            let stim = &mut (*cortex_m::peripheral::ITM::ptr()).stim[0];
            cortex_m::iprintln!(stim, $s);
        }
    };
    ($s:expr, $($tt:tt)*) => {
        #[allow(unused_unsafe)]
        unsafe {
            let stim = &mut (*cortex_m::peripheral::ITM::ptr()).stim[0];
            cortex_m::iprintln!(stim, $s, $($tt)*);
        }
    };
}

#[cfg(feature = "klog-semihosting")]
macro_rules! klog {
    ($s:expr) => { let _ = cortex_m_semihosting::hprintln!($s); };
    ($s:expr, $($tt:tt)*) => {
        let _ = cortex_m_semihosting::hprintln!($s, $($tt)*);
    };
}

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

macro_rules! uassert_eq {
    ($cond1:expr, $cond2:expr) => {
        if $cond1 != $cond2 {
            panic!("Assertion failed!");
        }
    };
}

/// Initial xPSR value installed in the user-mode half of a fabricated task
/// frame. Just the Thumb state bit; everything else starts clear.
pub const INIT_PSR_USER: u32 = 0x0100_0000;

/// End of kernel-managed RAM. The allocator serves `[image_end, RAM_END)`.
pub const RAM_END: usize = 0x2004_0000;

extern "C" {
    /// Linker-provided symbol marking the first byte past the loaded image.
    static __image_end: u8;

    /// SVC exit trampoline, provided by the trap layer. A fabricated task
    /// frame "returns" here so the trampoline can install the user-mode
    /// initial context stacked above it.
    static SVC_RESTORE: u8;

    /// Stores the current SP through `out_sp`, adopts `in_sp`, and resumes
    /// whatever that stack was doing. See the module docs.
    pub fn switch_stacks(out_sp: *mut usize, in_sp: usize);

    /// One-way variant of `switch_stacks` used to leave the boot stack for
    /// the first task. Does not save anything.
    pub fn start_first_task(in_sp: usize) -> !;
}

core::arch::global_asm!(
    "
    .section .text.switch_stacks
    .syntax unified
    .thumb_func
    .global switch_stacks
switch_stacks:
    push {{r4-r11, lr}}
    mov r2, sp
    str r2, [r0]
    mov sp, r1
    pop {{r4-r11, pc}}

    .section .text.start_first_task
    .thumb_func
    .global start_first_task
start_first_task:
    mov sp, r0
    pop {{r4-r11, pc}}
    "
);

/// Address of the SVC exit trampoline, for fabricating task frames.
pub fn svc_restore_addr() -> u32 {
    unsafe { core::ptr::addr_of!(SVC_RESTORE) as u32 }
}

/// Produces the RAM the heap allocator manages, rounded in to 8-byte
/// alignment. May be empty if the image has crowded out the heap; the
/// allocator will refuse to initialize in that case.
///
/// # Safety
///
/// Call once, at startup, before any allocator exists. Calling it twice
/// would alias the arena.
pub unsafe fn heap_region() -> &'static mut [u8] {
    let base = (core::ptr::addr_of!(__image_end) as usize + 7) & !7;
    let len = RAM_END.saturating_sub(base) & !3;
    core::slice::from_raw_parts_mut(base as *mut u8, len)
}

/// Idles the CPU until something interesting happens.
pub fn wait_for_interrupt() {
    cortex_m::asm::wfi();
}
