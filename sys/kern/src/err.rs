// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Leaf components report failures with their own small error types, which
//! keeps their contracts narrow; the syscall surface folds everything into
//! the flat [`abi::KernError`] that a trap layer would hand back to user
//! code. The conversions live here so the fold is a `?` away.

use abi::KernError;

use crate::heap;
use crate::mailbox;
use crate::readyq;

impl From<heap::NoSpace> for KernError {
    fn from(_: heap::NoSpace) -> Self {
        KernError::OutOfMemory
    }
}

impl From<heap::DeallocError> for KernError {
    fn from(e: heap::DeallocError) -> Self {
        match e {
            heap::DeallocError::UnknownBlock => KernError::UnknownBlock,
            heap::DeallocError::NotOwner => KernError::NotBlockOwner,
        }
    }
}

impl From<mailbox::MailboxFull> for KernError {
    fn from(_: mailbox::MailboxFull) -> Self {
        KernError::MailboxFull
    }
}

impl From<mailbox::RecvError> for KernError {
    fn from(e: mailbox::RecvError) -> Self {
        match e {
            // An empty mailbox after an (attempted) block means this build
            // can't actually suspend the caller.
            mailbox::RecvError::Empty => KernError::WouldBlock,
            mailbox::RecvError::BufferTooSmall => KernError::BufferTooSmall,
        }
    }
}

impl From<readyq::QueueFull> for KernError {
    fn from(_: readyq::QueueFull) -> Self {
        KernError::QueueFull
    }
}
