// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between kernel and applications.

#![no_std]

use serde::{Deserialize, Serialize};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Number of slots in the task table, including the idle task at slot 0.
pub const MAX_TASKS: usize = 16;

/// Size of each task's kernel stack, in bytes. Must be a multiple of 8.
pub const K_STACK_SIZE: u32 = 0x200;

/// Minimum user stack size, in bytes. `tsk_create` rejects anything smaller.
/// Requested sizes must also be a multiple of 8.
pub const U_STACK_SIZE: u32 = 0x200;

/// Smallest admissible mailbox capacity: one 4-byte sender word, one message
/// header, and one payload byte padded to a word.
pub const MIN_MBX_SIZE: u32 = 16;

/// Smallest admissible message payload, in bytes. A header with `length`
/// below `size_of::<MsgHeader>() + MIN_MSG_PAYLOAD` is rejected at send.
pub const MIN_MSG_PAYLOAD: u32 = 1;

/// Rounds `n` up to the next multiple of 4, the alignment unit of both the
/// heap and the mailbox wire format.
pub const fn round_up4(n: u32) -> u32 {
    (n + 3) & !3
}

/// Names a task slot.
///
/// Task ids are small integers indexing the fixed task table. Id 0 is the
/// idle task, which always exists and is never dormant. A handful of other
/// ids are reserved; see the associated constants.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, FromBytes,
    IntoBytes, Immutable, KnownLayout, Unaligned,
)]
#[repr(transparent)]
pub struct Tid(pub u8);

impl Tid {
    /// The idle (null) task. Also the recorded owner of heap blocks that the
    /// kernel allocates on behalf of a task, such as stacks and mailboxes.
    pub const NULL: Self = Self(0);

    /// Fixed slot for the keyboard command dispatcher task. Kept out of the
    /// free-id pool; claimed at boot by a descriptor carrying
    /// [`TaskFlags::CMD_DISPATCHER`].
    pub const KCD: Self = Self(15);

    /// Synthetic sender id recorded on messages sent from the UART interrupt
    /// path. Deliberately outside the task table; never schedulable.
    pub const UART_IRQ: Self = Self(16);

    /// This id as a task-table index.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    /// Whether this id can name a slot in the task table at all.
    pub fn is_in_table(self) -> bool {
        self.index() < MAX_TASKS
    }
}

/// Indicates priority of a task.
///
/// Priorities are small numbers where numerically lower values are more
/// important. This type *deliberately* does not implement
/// `PartialOrd`/`Ord`, to keep us from confusing ourselves on whether `>`
/// means numerically greater / less important, or more important /
/// numerically smaller.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, FromBytes,
    IntoBytes, Immutable, KnownLayout, Unaligned, Default,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Reserved for the (unimplemented) real-time class. Rejected by
    /// `tsk_create` and `tsk_set_prio`.
    pub const RT: Self = Self(0);

    pub const HIGH: Self = Self(0x80);
    pub const MEDIUM: Self = Self(0x81);
    pub const LOW: Self = Self(0x82);
    pub const LOWEST: Self = Self(0x83);

    /// The idle task's priority. Worse than every schedulable priority and
    /// rejected as an argument.
    pub const NULL_TASK: Self = Self(0xFF);

    /// Checks if `self` is strictly more important than `other`.
    ///
    /// This is easier to read than comparing the numeric values of the
    /// priorities, since lower numbers are more important.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

/// Scheduling state of a task slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Default)]
pub enum TaskState {
    /// Slot unused; every field of the TCB other than the state is garbage.
    #[default]
    Dormant,
    /// In the ready queue, waiting for the CPU.
    Ready,
    /// On the CPU. Exactly one task is in this state at any time.
    Running,
    /// Blocked on an empty mailbox; off the ready queue until a send
    /// arrives.
    BlockedOnMsg,
    /// Reserved for the periodic-task extension; tasks never enter this
    /// state in the current kernel.
    Suspended,
}

bitflags::bitflags! {
    /// Boolean properties of a task, fixed at creation.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    pub struct TaskFlags: u32 {
        /// Task runs in privileged mode on its kernel stack; it has no user
        /// stack and may adjust any task's priority.
        const PRIVILEGED = 1 << 0;
        /// Boot descriptor claims the reserved [`Tid::KCD`] slot.
        const CMD_DISPATCHER = 1 << 1;
    }
}

/// Record describing a single boot-time task.
#[derive(Copy, Clone, Debug)]
pub struct TaskDesc {
    /// Address of the task's entry point. This is the first instruction that
    /// will be executed when the task starts.
    pub entry_point: u32,
    /// Initial priority of this task. Must not be [`Priority::RT`] or
    /// [`Priority::NULL_TASK`].
    pub priority: Priority,
    /// Requested user stack size in bytes. Ignored for privileged tasks.
    pub stack_size: u32,
    /// Collection of boolean flags controlling task behavior.
    pub flags: TaskFlags,
}

/// Snapshot of one task's public state, as returned by `tsk_get_info`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub tid: Tid,
    pub priority: Priority,
    pub state: TaskState,
    pub privileged: bool,
    pub entry_point: u32,
    pub k_stack_top: usize,
    pub k_stack_size: u32,
    /// Top of the user stack, as an offset into the kernel heap arena. Zero
    /// for privileged tasks, which have no user stack.
    pub u_stack_top: u32,
    pub u_stack_size: u32,
}

/// Wire header preceding every message payload in a mailbox.
///
/// `length` counts this header plus the payload. It does *not* count the
/// sender id word that the kernel prepends in the ring, nor the padding that
/// rounds the payload out to a word boundary.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct MsgHeader {
    pub length: u32,
    pub ty: u32,
}

impl MsgHeader {
    /// Size of the encoded header: 8 bytes.
    pub const SIZE: u32 = core::mem::size_of::<Self>() as u32;

    /// Smallest `length` value `send_msg` accepts.
    pub const MIN_LENGTH: u32 = Self::SIZE + MIN_MSG_PAYLOAD;
}

/// An error committed by user code when interacting with a kernel entry
/// point.
///
/// All of these are recoverable: they are reported to the immediate caller
/// and never terminate a task. A trap layer flattens them to the C-level
/// error return.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum KernError {
    /// Priority argument was `RT`, `NULL_TASK`, or otherwise unusable.
    BadPriority,
    /// Stack size below the minimum or not a multiple of 8.
    BadStackSize,
    /// Null/zero entry point.
    BadEntryPoint,
    /// The free-id pool is empty; the task table is full.
    OutOfTaskIds,
    /// Heap exhausted.
    OutOfMemory,
    /// Task id does not name a slot in the table.
    TaskOutOfRange,
    /// Operation requires a live task, but the named slot is dormant.
    TaskDormant,
    /// `mem_dealloc` argument does not match any allocated payload.
    UnknownBlock,
    /// `mem_dealloc` caller does not own the named block.
    NotBlockOwner,
    /// `mbx_create` on a task that already has a mailbox.
    MailboxExists,
    /// Message operation against a task with no mailbox.
    MailboxMissing,
    /// `mbx_create` capacity below [`MIN_MBX_SIZE`].
    MailboxTooSmall,
    /// Not enough free ring space for the framed message.
    MailboxFull,
    /// Header `length` below [`MsgHeader::MIN_LENGTH`], or the send buffer
    /// is shorter than its own header claims.
    MessageTooShort,
    /// Receive buffer cannot hold the message. The message is still
    /// consumed.
    BufferTooSmall,
    /// Unprivileged task attempted to adjust a privileged task's priority.
    PermissionDenied,
    /// The ready queue cannot take another entry.
    QueueFull,
    /// Blocking receive cannot suspend on this architecture build.
    WouldBlock,
}
