// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task control blocks and their initial machine state.
//!
//! A `Task` is one slot in the fixed task table. Dormant slots are fully
//! reusable; everything in them is rewritten by `reset`. Each task owns a
//! statically sized kernel stack; unprivileged tasks additionally get a
//! user stack carved out of the kernel heap at creation time.

use abi::{Priority, TaskFlags, TaskState, Tid, K_STACK_SIZE, MAX_TASKS};

use crate::arch;
use crate::mailbox::Mailbox;

pub(crate) const K_STACK_WORDS: usize = (K_STACK_SIZE / 4) as usize;

/// Kernel stack storage. The alignment matters: fabricated frames assume
/// the stack top is 8-aligned.
#[repr(align(8))]
pub struct KernelStack(pub [u32; K_STACK_WORDS]);

/// One slot of the task table.
pub struct Task {
    pub tid: Tid,
    pub priority: Priority,
    pub flags: TaskFlags,
    pub state: TaskState,
    /// Entry point address, as given at creation.
    pub entry_point: u32,
    /// This task's kernel stack.
    pub kstack: KernelStack,
    /// Saved kernel stack pointer. Written by the context switch when the
    /// task is descheduled; seeded by `seed_frame` at creation.
    pub ksp: usize,
    /// User stack, as (heap payload offset, size). `None` for privileged
    /// tasks, which run on their kernel stack alone.
    pub ustack: Option<(u32, u32)>,
    /// Mailbox metadata, once `mbx_create` has been called.
    pub mailbox: Option<Mailbox>,
    /// Insertion order most recently assigned to this task by the ready
    /// queue. Still meaningful while the task runs (it is the order its
    /// root entry carries).
    pub order: u8,
}

impl Task {
    /// An unused slot. Only `tid` and `state` are meaningful.
    pub fn dormant(tid: Tid) -> Self {
        Self {
            tid,
            priority: Priority::NULL_TASK,
            flags: TaskFlags::empty(),
            state: TaskState::Dormant,
            entry_point: 0,
            kstack: KernelStack([0; K_STACK_WORDS]),
            ksp: 0,
            ustack: None,
            mailbox: None,
            order: 0,
        }
    }

    pub fn is_privileged(&self) -> bool {
        self.flags.contains(TaskFlags::PRIVILEGED)
    }

    /// Rewrites this slot for a fresh task and fabricates its initial
    /// kernel stack frame. `user_sp` is the address of the top of the user
    /// stack, ignored for privileged tasks.
    pub fn reset(
        &mut self,
        priority: Priority,
        flags: TaskFlags,
        entry_point: u32,
        ustack: Option<(u32, u32)>,
        user_sp: usize,
    ) {
        self.priority = priority;
        self.flags = flags;
        self.state = TaskState::Ready;
        self.entry_point = entry_point;
        self.ustack = ustack;
        self.mailbox = None;
        self.order = 0;
        let privileged = flags.contains(TaskFlags::PRIVILEGED);
        let sp_index = init_task_frame(
            &mut self.kstack.0,
            entry_point,
            user_sp as u32,
            privileged,
        );
        self.ksp = self.kstack.0.as_ptr() as usize + sp_index * 4;
    }
}

/// Fabricates the initial kernel stack frame for a task, returning the
/// word index the saved stack pointer should start at.
///
/// The frame is laid out so the context switch's restore sequence (pop
/// r4-r11 and the program counter) "returns" into the right place with a
/// zeroed register file:
///
/// - For a privileged task, the popped program counter is the entry point
///   itself; the task starts and stays on its kernel stack.
/// - For an unprivileged task, the popped program counter is the SVC exit
///   trampoline, and stacked above the kernel frame is the user-mode
///   initial context the trampoline installs: r0-r12 zeroed, the user
///   stack pointer, the entry point, and the initial xPSR.
///
/// A pad word keeps the resulting pointer 8-aligned.
pub(crate) fn init_task_frame(
    stack: &mut [u32; K_STACK_WORDS],
    entry_point: u32,
    user_sp: u32,
    privileged: bool,
) -> usize {
    let mut sp = K_STACK_WORDS;
    macro_rules! push {
        ($word:expr) => {{
            sp -= 1;
            stack[sp] = $word;
        }};
    }

    push!(0); // alignment pad

    if privileged {
        push!(entry_point); // popped into pc
    } else {
        // User-mode initial context, consumed by the trampoline:
        // ascending in memory r0..r12, uSP, pc, xPSR.
        push!(arch::INIT_PSR_USER);
        push!(entry_point);
        push!(user_sp);
        for _ in 0..13 {
            push!(0); // r12 down to r0
        }
        push!(arch::svc_restore_addr()); // popped into pc
    }
    for _ in 0..8 {
        push!(0); // r11 down to r4
    }
    sp
}

/// LIFO pool of assignable task ids. `Tid::NULL` and `Tid::KCD` are held
/// out: the former names the idle task, the latter is claimed only by a
/// boot descriptor.
pub(crate) struct TidPool {
    free: [Tid; MAX_TASKS],
    top: usize,
}

impl TidPool {
    pub fn new() -> Self {
        let mut pool = Self {
            free: [Tid::NULL; MAX_TASKS],
            top: 0,
        };
        // Stacked in descending order so ids hand out ascending.
        for raw in (1..MAX_TASKS as u8).rev() {
            if Tid(raw) != Tid::KCD {
                pool.free[pool.top] = Tid(raw);
                pool.top += 1;
            }
        }
        pool
    }

    pub fn alloc(&mut self) -> Option<Tid> {
        if self.top == 0 {
            return None;
        }
        self.top -= 1;
        Some(self.free[self.top])
    }

    /// Returns an id to the pool at task exit. The KCD slot stays
    /// reserved even after its occupant exits.
    pub fn release(&mut self, tid: Tid) {
        if tid == Tid::KCD {
            return;
        }
        uassert!(self.top < self.free.len());
        self.free[self.top] = tid;
        self.top += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privileged_frame_enters_entry_directly() {
        let mut stack = [0xFFFF_FFFFu32; K_STACK_WORDS];
        let sp = init_task_frame(&mut stack, 0x0800_1235, 0, true);
        // Pad word, pc, eight callee-saved registers.
        assert_eq!(sp, K_STACK_WORDS - 10);
        assert_eq!(sp % 2, 0);
        assert_eq!(stack[sp..sp + 8], [0; 8]); // r4-r11
        assert_eq!(stack[sp + 8], 0x0800_1235); // pc
    }

    #[test]
    fn unprivileged_frame_routes_through_trampoline() {
        let mut stack = [0xFFFF_FFFFu32; K_STACK_WORDS];
        let entry = 0x0800_4321;
        let user_sp = 0x2001_8000;
        let sp = init_task_frame(&mut stack, entry, user_sp, false);
        // Pad word, 16-word user context, pc, eight registers.
        assert_eq!(sp, K_STACK_WORDS - 26);
        assert_eq!(sp % 2, 0);
        assert_eq!(stack[sp..sp + 8], [0; 8]); // r4-r11
        assert_eq!(stack[sp + 8], arch::svc_restore_addr()); // pc
        assert_eq!(stack[sp + 9..sp + 22], [0; 13]); // r0-r12
        assert_eq!(stack[sp + 22], user_sp);
        assert_eq!(stack[sp + 23], entry);
        assert_eq!(stack[sp + 24], arch::INIT_PSR_USER);
    }

    #[test]
    fn tid_pool_hands_out_every_unreserved_id_once() {
        let mut pool = TidPool::new();
        let mut seen = Vec::new();
        while let Some(tid) = pool.alloc() {
            seen.push(tid);
        }
        assert_eq!(seen.len(), MAX_TASKS - 2);
        assert!(!seen.contains(&Tid::NULL));
        assert!(!seen.contains(&Tid::KCD));
        assert_eq!(seen[0], Tid(1));

        pool.release(Tid(5));
        pool.release(Tid::KCD);
        assert_eq!(pool.alloc(), Some(Tid(5)));
        assert_eq!(pool.alloc(), None);
    }
}
