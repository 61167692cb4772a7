// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stand-in architecture for non-ARM builds.
//!
//! This exists so the portable parts of the kernel can be compiled, unit
//! tested, and simulated on a host. It defines the same names as `arm_m`,
//! but `switch_stacks` only records the request -- control flow continues
//! in the caller, so host code observes scheduling decisions through kernel
//! state rather than by actually losing the CPU.

use core::sync::atomic::{AtomicUsize, Ordering};

macro_rules! klog {
    ($s:expr) => { };
    ($s:expr, $($tt:tt)*) => { };
}

macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond)
    };
}

macro_rules! uassert_eq {
    ($cond1:expr, $cond2:expr) => {
        assert_eq!($cond1, $cond2)
    };
}

/// Initial processor-state word for the user half of a fabricated frame.
/// Arbitrary but recognizable in stack dumps.
pub const INIT_PSR_USER: u32 = 0x0000_0010;

/// Nominal end of "RAM" for the simulated memory map.
pub const RAM_END: usize = 0x2004_0000;

/// Recognizable stand-in for the SVC exit trampoline's address.
pub fn svc_restore_addr() -> u32 {
    0x1000_0001
}

static SWITCH_FROM: AtomicUsize = AtomicUsize::new(0);
static SWITCH_TO: AtomicUsize = AtomicUsize::new(0);
static SWITCH_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Records the switch request and returns. The outgoing slot is left
/// untouched so a host test can still inspect the fabricated frame it
/// points at.
///
/// # Safety
///
/// Trivially safe here; the signature matches the real primitive.
pub unsafe fn switch_stacks(out_sp: *mut usize, in_sp: usize) {
    SWITCH_FROM.store(out_sp as usize, Ordering::Relaxed);
    SWITCH_TO.store(in_sp, Ordering::Relaxed);
    SWITCH_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// Last (out_sp, in_sp) pair handed to `switch_stacks`, for tests.
pub fn last_switch() -> (usize, usize) {
    (
        SWITCH_FROM.load(Ordering::Relaxed),
        SWITCH_TO.load(Ordering::Relaxed),
    )
}

/// Number of `switch_stacks` calls so far, for tests.
pub fn switch_count() -> usize {
    SWITCH_COUNT.load(Ordering::Relaxed)
}

pub fn start_first_task(_in_sp: usize) -> ! {
    panic!("entering userland");
}

const FAKE_RAM_SIZE: usize = 0x1_0000;

#[repr(align(8))]
struct FakeRam([u8; FAKE_RAM_SIZE]);

static mut FAKE_RAM: FakeRam = FakeRam([0; FAKE_RAM_SIZE]);

/// Simulated equivalent of the ARM heap region: a static 64 KiB arena.
///
/// # Safety
///
/// Call once; a second call would alias the arena.
pub unsafe fn heap_region() -> &'static mut [u8] {
    let ram: &'static mut FakeRam = &mut *core::ptr::addr_of_mut!(FAKE_RAM);
    &mut ram.0
}

pub fn wait_for_interrupt() {
    core::hint::spin_loop();
}
