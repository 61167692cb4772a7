// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-task mailboxes: fixed-capacity circular byte buffers holding framed
//! messages.
//!
//! A mailbox's backing bytes live in the kernel heap (allocated with
//! kernel ownership, so they can be reclaimed at task exit no matter who
//! is running); this module only holds the ring *metadata* and operates on
//! the backing slice the kernel passes in.
//!
//! Each message occupies, in order:
//!
//! ```text
//! [sender id][3 pad bytes][MsgHeader][payload][pad to 4-byte multiple]
//! ```
//!
//! `MsgHeader::length` covers the header and payload only; the sender word
//! and trailing padding are ring overhead. Copies in and out are done with
//! at most two slice operations each, splitting at the wrap point.

use abi::{round_up4, MsgHeader, Tid};
use zerocopy::FromBytes;

/// Error returned when the ring can't fit a framed message.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MailboxFull;

/// Ways a dequeue can come up short.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RecvError {
    /// Nothing queued. The caller decides whether that means blocking.
    Empty,
    /// Destination can't hold the message. If the header had already been
    /// read out, the message has been consumed anyway.
    BufferTooSmall,
}

/// Ring metadata for one task's mailbox.
#[derive(Copy, Clone, Debug)]
pub struct Mailbox {
    /// Payload offset of the backing storage in the heap arena.
    buf: u32,
    capacity: u32,
    /// Index of the next byte to read.
    head: u32,
    /// Index of the last byte written; starts at capacity - 1 so the first
    /// write lands on index 0.
    tail: u32,
    /// Occupied bytes.
    size: u32,
}

impl Mailbox {
    pub fn new(buf: u32, capacity: u32) -> Self {
        Self {
            buf,
            capacity,
            head: 0,
            tail: capacity - 1,
            size: 0,
        }
    }

    pub fn storage(&self) -> (u32, u32) {
        (self.buf, self.capacity)
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn free(&self) -> u32 {
        self.capacity - self.size
    }

    /// Appends one framed message. `msg` is the header-plus-payload image,
    /// already validated by the caller (its length equals the header's
    /// `length` field).
    pub fn enqueue(
        &mut self,
        ring: &mut [u8],
        sender: Tid,
        msg: &[u8],
    ) -> Result<(), MailboxFull> {
        uassert_eq!(ring.len(), self.capacity as usize);
        let length = msg.len() as u32;
        let framed = 4 + round_up4(length);
        if framed > self.free() {
            return Err(MailboxFull);
        }

        let mut at = (self.tail + 1) % self.capacity;
        copy_in(ring, at as usize, &[sender.0, 0, 0, 0]);
        at = (at + 4) % self.capacity;
        copy_in(ring, at as usize, msg);
        let pad = round_up4(length) - length;
        if pad > 0 {
            at = (at + length) % self.capacity;
            copy_in(ring, at as usize, &[0u8; 3][..pad as usize]);
        }

        self.tail = (self.tail + framed) % self.capacity;
        self.size += framed;
        Ok(())
    }

    /// Removes the message at the head of the ring. The header lands in
    /// `dest[..8]`, the payload after it. Returns the sender id and the
    /// header's `length`.
    ///
    /// A `dest` too small for even the header fails without consuming
    /// anything. A `dest` that fits the header but not the payload
    /// *consumes the message anyway* and reports `BufferTooSmall`; the
    /// header remains in `dest` as a record of what was lost.
    pub fn dequeue(
        &mut self,
        ring: &[u8],
        dest: &mut [u8],
    ) -> Result<(Tid, u32), RecvError> {
        uassert_eq!(ring.len(), self.capacity as usize);
        if self.size == 0 {
            return Err(RecvError::Empty);
        }
        let hdr_len = MsgHeader::SIZE as usize;
        if dest.len() < hdr_len {
            return Err(RecvError::BufferTooSmall);
        }

        let mut sender_word = [0u8; 4];
        copy_out(ring, self.head as usize, &mut sender_word);
        let sender = Tid(sender_word[0]);
        self.advance(4);

        copy_out(ring, self.head as usize, &mut dest[..hdr_len]);
        self.advance(MsgHeader::SIZE);
        let Ok(header) = MsgHeader::read_from_bytes(&dest[..hdr_len]) else {
            // dest was length-checked above.
            unreachable!()
        };

        let body = header.length - MsgHeader::SIZE;
        let pad = round_up4(header.length) - header.length;
        if header.length as usize <= dest.len() {
            copy_out(
                ring,
                self.head as usize,
                &mut dest[hdr_len..header.length as usize],
            );
            self.advance(body + pad);
            Ok((sender, header.length))
        } else {
            self.advance(body + pad);
            Err(RecvError::BufferTooSmall)
        }
    }

    fn advance(&mut self, n: u32) {
        self.head = (self.head + n) % self.capacity;
        self.size -= n;
    }

    /// Checks ring accounting and that the occupied region parses as a
    /// whole number of well-formed frames.
    #[cfg(test)]
    pub fn assert_invariants(&self, ring: &[u8]) {
        assert!(self.head < self.capacity);
        assert!(self.size <= self.capacity);
        assert_eq!((self.head + self.size) % self.capacity, (self.tail + 1) % self.capacity);
        let mut at = self.head;
        let mut left = self.size;
        while left > 0 {
            assert!(left >= 4 + MsgHeader::SIZE, "trailing partial frame");
            let mut bytes = [0u8; 8];
            copy_out(ring, ((at + 4) % self.capacity) as usize, &mut bytes);
            let header = MsgHeader::read_from_bytes(&bytes).unwrap();
            assert!(header.length >= MsgHeader::MIN_LENGTH);
            let framed = 4 + round_up4(header.length);
            assert!(framed <= left, "frame overruns occupied region");
            at = (at + framed) % self.capacity;
            left -= framed;
        }
    }
}

/// Writes `src` into the ring starting at `at`, wrapping once if needed.
fn copy_in(ring: &mut [u8], at: usize, src: &[u8]) {
    let n = src.len();
    let first = (ring.len() - at).min(n);
    ring[at..at + first].copy_from_slice(&src[..first]);
    ring[..n - first].copy_from_slice(&src[first..]);
}

/// Reads `dest.len()` bytes from the ring starting at `at`, wrapping once
/// if needed.
fn copy_out(ring: &[u8], at: usize, dest: &mut [u8]) {
    let n = dest.len();
    let first = (ring.len() - at).min(n);
    dest[..first].copy_from_slice(&ring[at..at + first]);
    dest[first..].copy_from_slice(&ring[..n - first]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    const SENDER: Tid = Tid(7);

    fn msg(ty: u32, payload: &[u8]) -> Vec<u8> {
        let header = MsgHeader {
            length: MsgHeader::SIZE + payload.len() as u32,
            ty,
        };
        let mut bytes = header.as_bytes().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn wire_layout_is_literal() {
        let mut ring = [0xAAu8; 32];
        let mut mb = Mailbox::new(0, 32);
        mb.enqueue(&mut ring, SENDER, &msg(2, b"hi!")).unwrap();
        mb.assert_invariants(&ring);
        assert_eq!(
            &ring[..16],
            &[
                7, 0, 0, 0, // sender id, padded to a word
                11, 0, 0, 0, // length: 8-byte header + 3-byte payload
                2, 0, 0, 0, // type
                b'h', b'i', b'!', 0, // payload, padded to a word
            ]
        );
        assert_eq!(mb.size, 16);
    }

    #[test]
    fn round_trips_sender_type_and_payload() {
        let mut ring = [0u8; 64];
        let mut mb = Mailbox::new(0, 64);
        mb.enqueue(&mut ring, SENDER, &msg(5, b"abcdefg")).unwrap();
        let mut dest = [0u8; 32];
        let (sender, length) = mb.dequeue(&ring, &mut dest).unwrap();
        assert_eq!(sender, SENDER);
        assert_eq!(length, 15);
        let header = MsgHeader::read_from_bytes(&dest[..8]).unwrap();
        assert_eq!(header.ty, 5);
        assert_eq!(&dest[8..15], b"abcdefg");
        assert!(mb.is_empty());
    }

    #[test]
    fn fifo_across_wrap() {
        // 20-byte ring, 16-byte frames: successive messages land at
        // different phases and must still come out in order.
        let mut ring = [0u8; 20];
        let mut mb = Mailbox::new(0, 20);
        for round in 0..10u8 {
            mb.enqueue(&mut ring, SENDER, &msg(round as u32, &[round]))
                .unwrap();
            mb.assert_invariants(&ring);
            let mut dest = [0u8; 9];
            let (_, length) = mb.dequeue(&ring, &mut dest).unwrap();
            assert_eq!(length, 9);
            assert_eq!(dest[8], round);
            mb.assert_invariants(&ring);
        }
    }

    #[test]
    fn fills_and_refuses_and_drains() {
        let mut ring = [0u8; 32];
        let mut mb = Mailbox::new(0, 32);
        mb.enqueue(&mut ring, SENDER, &msg(0, b"one")).unwrap();
        mb.enqueue(&mut ring, SENDER, &msg(1, b"two")).unwrap();
        // 32 bytes of frames are in; nothing else fits.
        assert_eq!(
            mb.enqueue(&mut ring, SENDER, &msg(2, b"x")),
            Err(MailboxFull)
        );
        let mut dest = [0u8; 16];
        assert_eq!(mb.dequeue(&ring, &mut dest).unwrap().1, 11);
        mb.enqueue(&mut ring, SENDER, &msg(2, b"3")).unwrap();
        assert_eq!(mb.dequeue(&ring, &mut dest).unwrap().1, 11);
        assert_eq!(mb.dequeue(&ring, &mut dest).unwrap().1, 9);
        assert_eq!(mb.dequeue(&ring, &mut dest), Err(RecvError::Empty));
    }

    #[test]
    fn undersized_dest_drains_message() {
        let mut ring = [0u8; 64];
        let mut mb = Mailbox::new(0, 64);
        mb.enqueue(&mut ring, SENDER, &msg(9, b"0123456789")).unwrap();
        mb.enqueue(&mut ring, SENDER, &msg(3, b"ok")).unwrap();

        // Shorter than a header: refused, nothing consumed.
        let mut tiny = [0u8; 4];
        assert_eq!(
            mb.dequeue(&ring, &mut tiny),
            Err(RecvError::BufferTooSmall)
        );
        mb.assert_invariants(&ring);

        // Fits the header but not the payload: consumed and lost.
        let mut small = [0u8; 12];
        assert_eq!(
            mb.dequeue(&ring, &mut small),
            Err(RecvError::BufferTooSmall)
        );
        mb.assert_invariants(&ring);

        // The next message is intact.
        let mut dest = [0u8; 16];
        let (_, length) = mb.dequeue(&ring, &mut dest).unwrap();
        assert_eq!(length, 10);
        assert_eq!(&dest[8..10], b"ok");
    }
}
