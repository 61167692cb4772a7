// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel state value: task table, ready queue, heap, and the
//! scheduling rules that tie them together.
//!
//! All kernel entry points (see `syscalls`) thread through a single
//! `&mut Kernel`. There is no interior locking anywhere: entries run to
//! completion with respect to each other, which is what makes the heap,
//! queue, and mailbox mutations safe.
//!
//! Scheduling model: the ready queue orders the running task (at its
//! root) and every `Ready` task by (priority, arrival). The idle task --
//! slot 0, always live, never queued -- runs exactly when the queue is
//! empty. A task entering the ready set preempts the running task only by
//! *strictly* outranking its priority; everything else queues behind its
//! priority class.

use abi::{
    KernError, Priority, TaskDesc, TaskFlags, TaskState, Tid, MAX_TASKS,
    U_STACK_SIZE,
};

use crate::arch;
use crate::heap::Heap;
use crate::readyq::{Entry, ReadyQueue};
use crate::task::{Task, TidPool};

pub struct Kernel<'m> {
    pub(crate) heap: Heap<'m>,
    pub(crate) tasks: [Task; MAX_TASKS],
    pub(crate) ready: ReadyQueue,
    /// Index of the task whose state is `Running`.
    pub(crate) current: usize,
    pub(crate) tid_pool: TidPool,
}

impl<'m> Kernel<'m> {
    /// Boots the kernel over `arena`: initializes the heap, installs the
    /// idle task as current, and creates each boot task. No preemption
    /// happens here; the caller dispatches the first real task with
    /// [`Kernel::run_new`] once it is ready to give up its own stack.
    pub fn new(
        arena: &'m mut [u8],
        boot_tasks: &[TaskDesc],
    ) -> Result<Self, KernError> {
        let heap = Heap::new(arena).map_err(|_| KernError::OutOfMemory)?;
        let mut kernel = Self {
            heap,
            tasks: core::array::from_fn(|i| Task::dormant(Tid(i as u8))),
            ready: ReadyQueue::new(),
            current: 0,
            tid_pool: TidPool::new(),
        };

        let idle = &mut kernel.tasks[0];
        idle.priority = Priority::NULL_TASK;
        idle.flags = TaskFlags::PRIVILEGED;
        idle.state = TaskState::Running;

        for desc in boot_tasks {
            let tid = if desc.flags.contains(TaskFlags::CMD_DISPATCHER) {
                if kernel.tasks[Tid::KCD.index()].state != TaskState::Dormant {
                    return Err(KernError::OutOfTaskIds);
                }
                Tid::KCD
            } else {
                kernel.tid_pool.alloc().ok_or(KernError::OutOfTaskIds)?
            };
            kernel.create_task_in_slot(tid, desc)?;
            let order = kernel
                .ready
                .push(tid, desc.priority)
                .map_err(|_| KernError::QueueFull)?;
            kernel.tasks[tid.index()].order = order;
        }
        klog!("boot: {} tasks ready", boot_tasks.len());
        Ok(kernel)
    }

    /// Validates `desc` and rebuilds the dormant slot `tid` from it,
    /// including the user stack allocation for unprivileged tasks.
    pub(crate) fn create_task_in_slot(
        &mut self,
        tid: Tid,
        desc: &TaskDesc,
    ) -> Result<(), KernError> {
        if desc.priority == Priority::NULL_TASK
            || desc.priority == Priority::RT
        {
            return Err(KernError::BadPriority);
        }
        if desc.entry_point == 0 {
            return Err(KernError::BadEntryPoint);
        }
        let privileged = desc.flags.contains(TaskFlags::PRIVILEGED);

        let (ustack, user_sp) = if privileged {
            (None, 0)
        } else {
            if desc.stack_size < U_STACK_SIZE || desc.stack_size % 8 != 0 {
                return Err(KernError::BadStackSize);
            }
            // The stack is kernel-owned so exit can reclaim it no matter
            // which task is current by then.
            let off = self
                .heap
                .alloc(desc.stack_size, Tid::NULL)
                .ok_or(KernError::OutOfMemory)?;
            let top = self.heap.payload_addr(off) + desc.stack_size as usize;
            (Some((off, desc.stack_size)), top)
        };

        uassert!(self.tasks[tid.index()].state == TaskState::Dormant);
        self.tasks[tid.index()].reset(
            desc.priority,
            desc.flags,
            desc.entry_point,
            ustack,
            user_sp,
        );
        Ok(())
    }

    /// The next task to run: the queue root, or the idle task when the
    /// queue is empty.
    pub(crate) fn scheduler(&self) -> usize {
        match self.ready.peek() {
            Some(entry) => entry.tid.index(),
            None => 0,
        }
    }

    /// Asks the scheduler for the next task and switches to it if it
    /// differs from the current one.
    pub(crate) fn run_new(&mut self) {
        let next = self.scheduler();
        if next != self.current {
            self.switch_to(next);
        }
    }

    /// Unconditional dispatch of task `next`. The outgoing task keeps any
    /// blocked/dormant state it just entered; only a still-running task
    /// reverts to `Ready`.
    pub(crate) fn switch_to(&mut self, next: usize) {
        let old = self.current;
        uassert!(next != old);
        self.current = next;
        if self.tasks[old].state == TaskState::Running {
            self.tasks[old].state = TaskState::Ready;
        }
        self.tasks[next].state = TaskState::Running;
        let out_sp: *mut usize = &mut self.tasks[old].ksp;
        let in_sp = self.tasks[next].ksp;
        // Safety: both stack pointers come from live TCBs; the outgoing
        // slot stays valid because TCBs never move.
        unsafe { arch::switch_stacks(out_sp, in_sp) }
    }

    /// Applies the preemption rule to task `b`, which has just become
    /// `Ready` (created, or woken by a message): if it strictly outranks
    /// the running task it takes the CPU now, with the displaced task
    /// re-queued behind its priority class; otherwise it queues normally.
    /// Either way `b` earns a fresh arrival position.
    pub(crate) fn enter_ready_set(&mut self, b: usize) -> Result<(), KernError> {
        let b_tid = self.tasks[b].tid;
        let b_prio = self.tasks[b].priority;
        let cur = self.current;
        let cur_prio = self.tasks[cur].priority;

        if !b_prio.is_more_important_than(cur_prio) {
            let order = self
                .ready
                .push(b_tid, b_prio)
                .map_err(|_| KernError::QueueFull)?;
            self.tasks[b].order = order;
            return Ok(());
        }

        if cur == 0 {
            // The idle task has no root slot to hand over; queue the task
            // and dispatch it.
            let order = self
                .ready
                .push(b_tid, b_prio)
                .map_err(|_| KernError::QueueFull)?;
            self.tasks[b].order = order;
            self.run_new();
            return Ok(());
        }

        let order = self.ready.assign_order();
        self.tasks[b].order = order;
        let entry = Entry {
            tid: b_tid,
            prio: b_prio,
            order,
        };
        uassert!(self.ready.replace_top(entry, cur_prio).is_ok());

        // The displaced task goes to the back of its priority class.
        let cur_tid = self.tasks[cur].tid;
        self.ready.retire_order(self.tasks[cur].order);
        let new_order = self
            .ready
            .push(cur_tid, cur_prio)
            .map_err(|_| KernError::QueueFull)?;
        self.tasks[cur].order = new_order;

        self.switch_to(b);
        Ok(())
    }

    /// Checks the cross-component invariants, then each component's own.
    #[cfg(test)]
    pub fn assert_invariants(&self) {
        self.heap.assert_invariants();
        self.ready.assert_invariants();

        let running: Vec<usize> = (0..MAX_TASKS)
            .filter(|&i| self.tasks[i].state == TaskState::Running)
            .collect();
        assert_eq!(running, vec![self.current], "running-task mismatch");

        if self.current != 0 {
            assert_eq!(
                self.ready.peek().map(|e| e.tid.index()),
                Some(self.current),
                "running task is not the queue root"
            );
        }
        for i in 0..MAX_TASKS {
            let queued = self.ready.index_of(Tid(i as u8)).is_some();
            match self.tasks[i].state {
                // The idle task is Ready whenever it's off the CPU, but
                // never queued.
                TaskState::Ready if i != 0 => {
                    assert!(queued, "ready task {i} unqueued")
                }
                TaskState::Ready | TaskState::Running => {}
                _ => assert!(!queued, "non-ready task {i} queued"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{desc, Backing, ARENA_SIZE};

    #[test]
    fn boot_with_no_tasks_idles() {
        let mut backing = Backing::new();
        let kernel = Kernel::new(&mut backing.0, &[]).unwrap();
        assert_eq!(kernel.current, 0);
        assert!(kernel.ready.is_empty());
        kernel.assert_invariants();
    }

    #[test]
    fn boot_dispatches_best_task_first() {
        let mut backing = Backing::new();
        let mut kernel = Kernel::new(
            &mut backing.0,
            &[
                desc(Priority::LOW),
                desc(Priority::HIGH),
                desc(Priority::MEDIUM),
            ],
        )
        .unwrap();
        kernel.run_new();
        kernel.assert_invariants();
        assert_eq!(
            kernel.tasks[kernel.current].priority,
            Priority::HIGH
        );
        // The boot stack's context was parked in the idle task's slot.
        assert_eq!(kernel.tasks[0].state, TaskState::Ready);
    }

    #[test]
    fn boot_claims_kcd_slot_by_flag() {
        let mut backing = Backing::new();
        let kcd = TaskDesc {
            flags: TaskFlags::CMD_DISPATCHER,
            ..desc(Priority::HIGH)
        };
        let kernel =
            Kernel::new(&mut backing.0, &[desc(Priority::LOW), kcd]).unwrap();
        assert_eq!(kernel.tasks[Tid::KCD.index()].state, TaskState::Ready);
        assert_eq!(
            kernel.tasks[Tid::KCD.index()].priority,
            Priority::HIGH
        );
    }

    #[test]
    fn boot_rejects_bad_descriptors() {
        let run = |d: TaskDesc| {
            let mut backing = Backing::new();
            Kernel::new(&mut backing.0, &[d]).map(|_| ())
        };
        assert_eq!(
            run(desc(Priority::RT)),
            Err(KernError::BadPriority)
        );
        assert_eq!(
            run(desc(Priority::NULL_TASK)),
            Err(KernError::BadPriority)
        );
        assert_eq!(
            run(TaskDesc {
                entry_point: 0,
                ..desc(Priority::LOW)
            }),
            Err(KernError::BadEntryPoint)
        );
        assert_eq!(
            run(TaskDesc {
                stack_size: U_STACK_SIZE - 8,
                ..desc(Priority::LOW)
            }),
            Err(KernError::BadStackSize)
        );
        assert_eq!(
            run(TaskDesc {
                stack_size: U_STACK_SIZE + 4,
                ..desc(Priority::LOW)
            }),
            Err(KernError::BadStackSize)
        );
    }

    #[test]
    fn privileged_boot_task_gets_no_user_stack() {
        let mut backing = Backing::new();
        let privileged = TaskDesc {
            flags: TaskFlags::PRIVILEGED,
            stack_size: 0,
            ..desc(Priority::MEDIUM)
        };
        let kernel = Kernel::new(&mut backing.0, &[privileged]).unwrap();
        let task = &kernel.tasks[1];
        assert!(task.ustack.is_none());
        // Nothing was carved from the heap.
        assert_eq!(
            kernel.heap.count_extfrag(ARENA_SIZE as u32 + 1),
            1
        );
    }
}
