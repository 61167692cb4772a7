// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared fixtures for the kernel's host tests.

use abi::{Priority, TaskDesc, TaskFlags, U_STACK_SIZE};

use crate::kernel::Kernel;

pub const ARENA_SIZE: usize = 32768;

/// Heap arenas must start 8-aligned; a bare `Box<[u8]>` doesn't promise
/// that.
#[repr(align(8))]
pub struct Backing(pub [u8; ARENA_SIZE]);

impl Backing {
    pub fn new() -> Box<Self> {
        Box::new(Backing([0; ARENA_SIZE]))
    }
}

/// A plain unprivileged descriptor at the given priority.
pub fn desc(priority: Priority) -> TaskDesc {
    TaskDesc {
        entry_point: 0x0800_0101,
        priority,
        stack_size: U_STACK_SIZE,
        flags: TaskFlags::empty(),
    }
}

/// Boots a kernel over `backing` with the given tasks and dispatches the
/// first one, the way startup would.
pub fn boot<'m>(backing: &'m mut Backing, tasks: &[TaskDesc]) -> Kernel<'m> {
    let mut kernel = Kernel::new(&mut backing.0, tasks).unwrap();
    kernel.run_new();
    kernel
}
