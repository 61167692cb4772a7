// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent kernel entry points.
//!
//! Every function here takes `&mut Kernel` plus the caller's arguments and
//! returns a `Result` (or a value, for the infallible ones). The SVC trap
//! layer is responsible for marshalling user registers into these calls
//! and folding errors back into the C-level return convention; it is not
//! part of this crate.
//!
//! "The caller" is always `kern.current`. Functions that can deschedule
//! the caller -- `tsk_exit`, `tsk_yield`, `recv_msg`, and anything that
//! triggers preemption -- return (on real hardware) only once the caller
//! has been scheduled again.

use core::ptr::NonNull;

use abi::{
    KernError, MsgHeader, Priority, TaskDesc, TaskFlags, TaskInfo, TaskState,
    Tid, K_STACK_SIZE, MIN_MBX_SIZE,
};
use zerocopy::FromBytes;

use crate::kernel::Kernel;
use crate::mailbox::Mailbox;
use crate::readyq::Entry;

/// Creates an unprivileged task and applies the preemption rule: if the
/// new task strictly outranks the caller, it is running by the time this
/// returns.
pub fn tsk_create(
    kern: &mut Kernel<'_>,
    entry_point: u32,
    priority: Priority,
    stack_size: u32,
) -> Result<Tid, KernError> {
    let desc = TaskDesc {
        entry_point,
        priority,
        stack_size,
        flags: TaskFlags::empty(),
    };
    let tid = kern.tid_pool.alloc().ok_or(KernError::OutOfTaskIds)?;
    if let Err(e) = kern.create_task_in_slot(tid, &desc) {
        kern.tid_pool.release(tid);
        return Err(e);
    }
    kern.enter_ready_set(tid.index())?;
    Ok(tid)
}

/// Terminates the calling task: its user stack and mailbox storage go back
/// to the heap, its id goes back to the pool, and the scheduler picks a
/// successor. Has no failure mode; on the idle task it does nothing.
pub fn tsk_exit(kern: &mut Kernel<'_>) {
    let cur = kern.current;
    if cur == 0 {
        return;
    }
    let tid = kern.tasks[cur].tid;
    klog!("task {} exiting", tid.0);

    if let Some((off, _size)) = kern.tasks[cur].ustack.take() {
        uassert!(kern.heap.dealloc(off, Tid::NULL).is_ok());
    }
    if let Some(mb) = kern.tasks[cur].mailbox.take() {
        let (off, _cap) = mb.storage();
        uassert!(kern.heap.dealloc(off, Tid::NULL).is_ok());
    }

    kern.tasks[cur].state = TaskState::Dormant;
    kern.tid_pool.release(tid);
    let popped = kern.ready.pop_top();
    uassert!(popped.map(|e| e.tid) == Some(tid));
    kern.run_new();
}

/// Voluntarily cedes the CPU. The caller keeps running unless some ready
/// task would outrank it once the caller is re-homed behind its priority
/// class -- so equal-priority tasks rotate FIFO, and a strictly dominant
/// caller continues undisturbed.
pub fn tsk_yield(kern: &mut Kernel<'_>) -> Result<(), KernError> {
    let cur = kern.current;
    if cur == 0 {
        kern.run_new();
        return Ok(());
    }
    let Some(best) = kern.ready.best_other() else {
        return Ok(());
    };
    let prio = kern.tasks[cur].priority;
    if prio.is_more_important_than(best.prio) {
        return Ok(());
    }

    let popped = kern.ready.pop_top();
    uassert!(popped.map(|e| e.tid.index()) == Some(cur));
    let tid = kern.tasks[cur].tid;
    let order = kern.ready.push(tid, prio).map_err(KernError::from)?;
    kern.tasks[cur].order = order;
    kern.run_new();
    Ok(())
}

/// Changes a task's priority and recomputes its place in the schedule.
///
/// Changing another task: an unprivileged caller may not touch a
/// privileged task. A blocked or suspended target just keeps the new
/// priority for later. A ready target either preempts the caller --
/// keeping its arrival position -- or is re-homed to the back of its new
/// priority class.
///
/// Changing one's own priority is always permitted; the caller keeps the
/// CPU only if it still strictly outranks the best ready contender.
pub fn tsk_set_prio(
    kern: &mut Kernel<'_>,
    tid: Tid,
    priority: Priority,
) -> Result<(), KernError> {
    if priority == Priority::RT || priority == Priority::NULL_TASK {
        return Err(KernError::BadPriority);
    }
    if tid == Tid::NULL || !tid.is_in_table() {
        return Err(KernError::TaskOutOfRange);
    }
    let t = tid.index();
    if kern.tasks[t].state == TaskState::Dormant {
        return Err(KernError::TaskDormant);
    }
    let cur = kern.current;

    if t == cur {
        // Own priority: no permission check applies.
        kern.tasks[t].priority = priority;
        kern.ready.set_prio_at(0, priority);
        if let Some(best) = kern.ready.best_other() {
            if !priority.is_more_important_than(best.prio) {
                let popped = kern.ready.pop_top();
                uassert!(popped.map(|e| e.tid) == Some(tid));
                let order =
                    kern.ready.push(tid, priority).map_err(KernError::from)?;
                kern.tasks[t].order = order;
                kern.run_new();
            }
        }
        return Ok(());
    }

    if !kern.tasks[cur].is_privileged() && kern.tasks[t].is_privileged() {
        return Err(KernError::PermissionDenied);
    }
    kern.tasks[t].priority = priority;
    match kern.tasks[t].state {
        TaskState::BlockedOnMsg | TaskState::Suspended => return Ok(()),
        _ => {}
    }

    // The target is ready, hence queued.
    let i = match kern.ready.index_of(tid) {
        Some(i) => i,
        None => {
            uassert!(false);
            return Err(KernError::TaskOutOfRange);
        }
    };
    let cur_prio = kern.tasks[cur].priority;

    if cur != 0 && priority.is_more_important_than(cur_prio) {
        // Promotion past the caller: the target preempts, keeping the
        // arrival position it already had.
        let removed = kern.ready.remove_at(i);
        let entry = Entry {
            prio: priority,
            ..removed
        };
        uassert!(kern.ready.replace_top(entry, cur_prio).is_ok());
        let cur_tid = kern.tasks[cur].tid;
        kern.ready.retire_order(kern.tasks[cur].order);
        let order =
            kern.ready.push(cur_tid, cur_prio).map_err(KernError::from)?;
        kern.tasks[cur].order = order;
        kern.switch_to(t);
    } else {
        // Re-home at the back of the new priority class.
        let removed = kern.ready.remove_at(i);
        kern.ready.retire_order(removed.order);
        let order =
            kern.ready.push(tid, priority).map_err(KernError::from)?;
        kern.tasks[t].order = order;
        if cur == 0 {
            kern.run_new();
        }
    }
    Ok(())
}

/// Reports a live task's public state.
pub fn tsk_get_info(
    kern: &Kernel<'_>,
    tid: Tid,
) -> Result<TaskInfo, KernError> {
    if !tid.is_in_table() {
        return Err(KernError::TaskOutOfRange);
    }
    let task = &kern.tasks[tid.index()];
    if task.state == TaskState::Dormant {
        return Err(KernError::TaskDormant);
    }
    Ok(TaskInfo {
        tid,
        priority: task.priority,
        state: task.state,
        privileged: task.is_privileged(),
        entry_point: task.entry_point,
        k_stack_top: task.kstack.0.as_ptr() as usize + K_STACK_SIZE as usize,
        k_stack_size: K_STACK_SIZE,
        u_stack_top: task.ustack.map(|(off, size)| off + size).unwrap_or(0),
        u_stack_size: task.ustack.map(|(_, size)| size).unwrap_or(0),
    })
}

/// The calling task's id.
pub fn tsk_get_tid(kern: &Kernel<'_>) -> Tid {
    kern.tasks[kern.current].tid
}

/// Allocates `size` bytes from the kernel heap, owned by the caller.
pub fn mem_alloc(kern: &mut Kernel<'_>, size: u32) -> Option<NonNull<u8>> {
    let owner = kern.tasks[kern.current].tid;
    let off = kern.heap.alloc(size, owner)?;
    NonNull::new(kern.heap.payload_addr(off) as *mut u8)
}

/// Frees a block previously returned by [`mem_alloc`] to the caller.
/// A null pointer is accepted and ignored.
pub fn mem_dealloc(kern: &mut Kernel<'_>, ptr: *mut u8) -> Result<(), KernError> {
    if ptr.is_null() {
        return Ok(());
    }
    let off = kern
        .heap
        .offset_of_addr(ptr as usize)
        .ok_or(KernError::UnknownBlock)?;
    let owner = kern.tasks[kern.current].tid;
    kern.heap.dealloc(off, owner).map_err(KernError::from)
}

/// Counts free blocks too small to serve a `size`-byte footprint.
pub fn mem_count_extfrag(kern: &Kernel<'_>, size: u32) -> usize {
    kern.heap.count_extfrag(size)
}

/// Gives the calling task a mailbox of `capacity` bytes, backed by
/// kernel-owned heap storage.
pub fn mbx_create(kern: &mut Kernel<'_>, capacity: u32) -> Result<(), KernError> {
    let cur = kern.current;
    if kern.tasks[cur].mailbox.is_some() {
        return Err(KernError::MailboxExists);
    }
    if capacity < MIN_MBX_SIZE {
        return Err(KernError::MailboxTooSmall);
    }
    let off = kern
        .heap
        .alloc(capacity, Tid::NULL)
        .ok_or(KernError::OutOfMemory)?;
    kern.tasks[cur].mailbox = Some(Mailbox::new(off, capacity));
    Ok(())
}

/// Sends `msg` -- a `MsgHeader` followed by payload -- to `target`'s
/// mailbox. If the target was blocked receiving, it wakes, and preempts
/// the caller if it strictly outranks it.
pub fn send_msg(
    kern: &mut Kernel<'_>,
    target: Tid,
    msg: &[u8],
) -> Result<(), KernError> {
    let sender = kern.tasks[kern.current].tid;
    send_msg_from(kern, sender, target, msg)
}

/// Send variant for the UART interrupt path: identical delivery, but the
/// recorded sender is the reserved interrupt id rather than whichever task
/// happened to be running when the interrupt arrived.
pub fn irq_send_msg(
    kern: &mut Kernel<'_>,
    target: Tid,
    msg: &[u8],
) -> Result<(), KernError> {
    send_msg_from(kern, Tid::UART_IRQ, target, msg)
}

fn send_msg_from(
    kern: &mut Kernel<'_>,
    sender: Tid,
    target: Tid,
    msg: &[u8],
) -> Result<(), KernError> {
    if !target.is_in_table() {
        return Err(KernError::TaskOutOfRange);
    }
    let t = target.index();
    if kern.tasks[t].state == TaskState::Dormant {
        return Err(KernError::TaskDormant);
    }
    let (header, _) = MsgHeader::read_from_prefix(msg)
        .map_err(|_| KernError::MessageTooShort)?;
    if header.length < MsgHeader::MIN_LENGTH
        || (msg.len() as u32) < header.length
    {
        return Err(KernError::MessageTooShort);
    }

    let heap = &mut kern.heap;
    let Some(mb) = kern.tasks[t].mailbox.as_mut() else {
        return Err(KernError::MailboxMissing);
    };
    let (off, cap) = mb.storage();
    let ring = heap.payload_mut(off, cap);
    mb.enqueue(ring, sender, &msg[..header.length as usize])
        .map_err(KernError::from)?;

    if kern.tasks[t].state == TaskState::BlockedOnMsg {
        kern.tasks[t].state = TaskState::Ready;
        kern.enter_ready_set(t)?;
    }
    Ok(())
}

/// Receives the next message into `buf`, blocking while the caller's
/// mailbox is empty. Returns the sender's id; the header and payload are
/// in `buf`.
///
/// A `buf` that can't hold the message's payload still consumes the
/// message and reports [`KernError::BufferTooSmall`].
pub fn recv_msg(
    kern: &mut Kernel<'_>,
    buf: &mut [u8],
) -> Result<Tid, KernError> {
    let caller = kern.current;
    let Some(mb) = kern.tasks[caller].mailbox.as_ref() else {
        return Err(KernError::MailboxMissing);
    };

    if mb.is_empty() {
        if caller == 0 {
            // The idle task must always be runnable.
            return Err(KernError::WouldBlock);
        }
        kern.tasks[caller].state = TaskState::BlockedOnMsg;
        let popped = kern.ready.pop_top();
        uassert!(popped.map(|e| e.tid.index()) == Some(caller));
        kern.run_new();
        // On real hardware, control returns here only after a sender has
        // made this task runnable again.
    }

    let heap = &kern.heap;
    let Some(mb) = kern.tasks[caller].mailbox.as_mut() else {
        // The mailbox cannot vanish while its owner is blocked on it.
        unreachable!()
    };
    let (off, cap) = mb.storage();
    let ring = heap.payload(off, cap);
    match mb.dequeue(ring, buf) {
        Ok((sender, _length)) => Ok(sender),
        Err(e) => Err(e.into()),
    }
}
