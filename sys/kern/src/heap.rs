// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel heap: first-fit allocation with eager bidirectional coalescing.
//!
//! The heap manages a borrowed byte arena and speaks in `u32` *offsets*
//! into it, never raw pointers. Every block -- allocated or free -- is an
//! 8-byte header followed by its payload. The header is two little-endian
//! words whose meaning depends on the block's state:
//!
//! - word 0: offset of the next free block when the block is free
//!   (`NO_BLOCK` terminates the list); the owning task id when the block is
//!   allocated.
//! - word 1: payload size in bytes, always a positive multiple of 4.
//!
//! Free blocks are threaded into a single list in strictly ascending
//! address order, which is what makes deallocation's neighbor checks and
//! coalescing cheap. There is deliberately no "allocated" bit: a block is
//! allocated exactly when it is not on the free list, and `dealloc`
//! re-derives that fact by walking the allocated run between the two free
//! blocks that bracket the candidate.
//!
//! Payloads start 4-aligned because the arena base is 8-aligned, headers
//! are 8 bytes, and sizes are rounded to 4.

use abi::{round_up4, Tid};
use byteorder::{ByteOrder, LittleEndian};

/// Size of a block header, in bytes.
pub const HEADER_SIZE: u32 = 8;

/// Free-list terminator / "no offset" sentinel.
const NO_BLOCK: u32 = u32::MAX;

/// The allocator's error on construction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NoSpace;

/// Ways `dealloc` can reject a caller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeallocError {
    /// The offset is not the payload of any currently allocated block.
    UnknownBlock,
    /// The block exists but belongs to a different task.
    NotOwner,
}

/// A first-fit heap over borrowed memory.
pub struct Heap<'m> {
    arena: &'m mut [u8],
    /// Number of managed bytes; `arena.len()` rounded down to a word.
    limit: u32,
    /// Offset of the first free block, or `NO_BLOCK` if everything is
    /// allocated.
    head: u32,
}

impl<'m> Heap<'m> {
    /// Takes over `arena`, leaving it as a single free block spanning
    /// everything but one header.
    ///
    /// The arena base must be 8-aligned (the target startup code and the
    /// test fixtures both guarantee this). Fails if the arena cannot hold a
    /// header plus at least one word of payload.
    pub fn new(arena: &'m mut [u8]) -> Result<Self, NoSpace> {
        uassert!(arena.as_ptr() as usize & 7 == 0);
        let limit = (arena.len() as u32) & !3;
        if limit < HEADER_SIZE + 4 {
            return Err(NoSpace);
        }
        let mut heap = Self {
            arena,
            limit,
            head: 0,
        };
        heap.set_link(0, NO_BLOCK);
        heap.set_size(0, limit - HEADER_SIZE);
        Ok(heap)
    }

    fn word(&self, off: u32) -> u32 {
        LittleEndian::read_u32(&self.arena[off as usize..][..4])
    }

    fn set_word(&mut self, off: u32, value: u32) {
        LittleEndian::write_u32(&mut self.arena[off as usize..][..4], value);
    }

    // Header field accessors. `link`/`set_link` are only meaningful on free
    // blocks, `owner`/`set_owner` only on allocated ones; they share word 0.

    fn link(&self, hdr: u32) -> u32 {
        self.word(hdr)
    }

    fn set_link(&mut self, hdr: u32, next: u32) {
        self.set_word(hdr, next);
    }

    fn owner(&self, hdr: u32) -> Tid {
        Tid(self.word(hdr) as u8)
    }

    fn set_owner(&mut self, hdr: u32, owner: Tid) {
        self.set_word(hdr, u32::from(owner.0));
    }

    fn size(&self, hdr: u32) -> u32 {
        self.word(hdr + 4)
    }

    fn set_size(&mut self, hdr: u32, size: u32) {
        self.set_word(hdr + 4, size);
    }

    /// Allocates `size` bytes (rounded up to a word) on behalf of `owner`,
    /// returning the payload offset.
    ///
    /// `owner` is recorded in the block and checked again at `dealloc`.
    /// When the kernel allocates on a task's behalf -- stacks, mailbox
    /// storage -- it passes `Tid::NULL` so that it can free the block at
    /// task exit no matter who is running by then.
    ///
    /// Returns `None` when `size` is zero or no free block fits.
    pub fn alloc(&mut self, size: u32, owner: Tid) -> Option<u32> {
        if size == 0 {
            return None;
        }
        let size = round_up4(size);

        let mut prev = NO_BLOCK;
        let mut curr = self.head;
        while curr != NO_BLOCK {
            let avail = self.size(curr);
            if avail >= size {
                if avail > size + HEADER_SIZE {
                    // Split: the tail of this block becomes a new free
                    // block, inheriting the link, and takes this block's
                    // place in the list.
                    let tail = curr + HEADER_SIZE + size;
                    self.set_link(tail, self.link(curr));
                    self.set_size(tail, avail - size - HEADER_SIZE);
                    if prev == NO_BLOCK {
                        self.head = tail;
                    } else {
                        self.set_link(prev, tail);
                    }
                    self.set_size(curr, size);
                } else {
                    // Too tight to split; consume the block whole.
                    let next = self.link(curr);
                    if prev == NO_BLOCK {
                        self.head = next;
                    } else {
                        self.set_link(prev, next);
                    }
                }
                self.set_owner(curr, owner);
                return Some(curr + HEADER_SIZE);
            }
            prev = curr;
            curr = self.link(curr);
        }
        None
    }

    /// Frees the block whose payload starts at `payload`, on behalf of
    /// `owner`.
    ///
    /// The offset is validated by walking the allocated run between the
    /// free blocks that would bracket it; anything that isn't exactly the
    /// payload of a live allocated block is rejected, as is a caller that
    /// doesn't own the block. On success the block is linked into the free
    /// list and merged with either neighbor that is already free.
    pub fn dealloc(
        &mut self,
        payload: u32,
        owner: Tid,
    ) -> Result<(), DeallocError> {
        if payload < HEADER_SIZE || payload >= self.limit {
            return Err(DeallocError::UnknownBlock);
        }

        // Find the free blocks bracketing the claimed header.
        let mut prev = NO_BLOCK;
        let mut next = self.head;
        while next != NO_BLOCK && next < payload {
            prev = next;
            next = self.link(next);
        }

        // Walk the allocated run from the end of `prev` (or the base of
        // the arena) to prove the claimed header is a real block boundary.
        let mut hdr = if prev == NO_BLOCK {
            0
        } else {
            prev + HEADER_SIZE + self.size(prev)
        };
        while hdr + HEADER_SIZE != payload {
            if (next != NO_BLOCK && hdr >= next) || hdr >= self.limit {
                return Err(DeallocError::UnknownBlock);
            }
            hdr = hdr + HEADER_SIZE + self.size(hdr);
        }

        if self.owner(hdr) != owner {
            return Err(DeallocError::NotOwner);
        }

        // Insert between the bracketing pair.
        self.set_link(hdr, next);
        if prev != NO_BLOCK {
            self.set_link(prev, hdr);
        }

        // Coalesce forward, then backward.
        if next != NO_BLOCK && hdr + HEADER_SIZE + self.size(hdr) == next {
            self.set_size(
                hdr,
                self.size(hdr) + HEADER_SIZE + self.size(next),
            );
            self.set_link(hdr, self.link(next));
        }
        let mut merged = hdr;
        if prev != NO_BLOCK
            && prev + HEADER_SIZE + self.size(prev) == hdr
        {
            self.set_size(
                prev,
                self.size(prev) + HEADER_SIZE + self.size(hdr),
            );
            self.set_link(prev, self.link(hdr));
            merged = prev;
        }

        if self.head == NO_BLOCK || merged < self.head {
            self.head = merged;
        }
        Ok(())
    }

    /// Counts free blocks whose total footprint -- header plus payload --
    /// is strictly smaller than `size`. This is the external fragmentation
    /// measure: how many free blocks could never satisfy a `size`-byte
    /// footprint.
    pub fn count_extfrag(&self, size: u32) -> usize {
        let mut count = 0;
        let mut curr = self.head;
        while curr != NO_BLOCK {
            if self.size(curr) + HEADER_SIZE < size {
                count += 1;
            }
            curr = self.link(curr);
        }
        count
    }

    /// Read-only view of an allocated payload.
    pub fn payload(&self, payload: u32, len: u32) -> &[u8] {
        uassert!(payload + len <= self.limit);
        &self.arena[payload as usize..(payload + len) as usize]
    }

    /// Mutable view of an allocated payload.
    pub fn payload_mut(&mut self, payload: u32, len: u32) -> &mut [u8] {
        uassert!(payload + len <= self.limit);
        &mut self.arena[payload as usize..(payload + len) as usize]
    }

    /// Address of an allocated payload, for handing out of the kernel.
    pub fn payload_addr(&self, payload: u32) -> usize {
        self.arena.as_ptr() as usize + payload as usize
    }

    /// Maps an address previously produced by `payload_addr` back to an
    /// offset. `None` if the address isn't inside the arena at all.
    pub fn offset_of_addr(&self, addr: usize) -> Option<u32> {
        let base = self.arena.as_ptr() as usize;
        if addr < base || addr >= base + self.limit as usize {
            return None;
        }
        Some((addr - base) as u32)
    }

    /// Checks the structural invariants: the free list is strictly
    /// ascending with no two adjacent members, and walking blocks by their
    /// recorded sizes tiles the arena exactly.
    #[cfg(test)]
    pub fn assert_invariants(&self) {
        let mut free = Vec::new();
        let mut curr = self.head;
        while curr != NO_BLOCK {
            if let Some(&last) = free.last() {
                assert!(curr > last, "free list not ascending at {curr:#x}");
                let gap = curr - (last + HEADER_SIZE + self.size(last));
                assert!(gap != 0, "adjacent free blocks at {last:#x}/{curr:#x}");
            }
            free.push(curr);
            curr = self.link(curr);
        }

        let mut hdr = 0;
        while hdr < self.limit {
            let size = self.size(hdr);
            assert!(size > 0, "zero-size block at {hdr:#x}");
            assert_eq!(size % 4, 0, "unaligned size at {hdr:#x}");
            hdr += HEADER_SIZE + size;
        }
        assert_eq!(hdr, self.limit, "blocks do not tile the arena");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARENA_SIZE: usize = 4096;

    #[repr(align(8))]
    struct Backing([u8; ARENA_SIZE]);

    fn run(body: impl FnOnce(&mut Heap<'_>)) {
        let mut backing = Box::new(Backing([0; ARENA_SIZE]));
        let mut heap = Heap::new(&mut backing.0).unwrap();
        body(&mut heap);
    }

    const T1: Tid = Tid(3);

    #[test]
    fn init_is_one_block() {
        run(|heap| {
            heap.assert_invariants();
            let initial = ARENA_SIZE as u32 - HEADER_SIZE;
            // Anything that would fit is not "too small"; one byte more
            // than the whole arena is.
            assert_eq!(heap.count_extfrag(initial + HEADER_SIZE), 0);
            assert_eq!(heap.count_extfrag(initial + HEADER_SIZE + 1), 1);
        });
    }

    #[test]
    fn refuses_tiny_arena() {
        #[repr(align(8))]
        struct Tiny([u8; 8]);
        let mut tiny = Tiny([0; 8]);
        assert!(Heap::new(&mut tiny.0).is_err());
    }

    #[test]
    fn zero_size_alloc_fails() {
        run(|heap| {
            assert_eq!(heap.alloc(0, T1), None);
        });
    }

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        run(|heap| {
            let a = heap.alloc(13, T1).unwrap();
            let b = heap.alloc(1, T1).unwrap();
            assert_eq!(a % 4, 0);
            assert_eq!(b % 4, 0);
            // 13 rounds to 16; b's header sits right past a's payload.
            assert_eq!(b, a + 16 + HEADER_SIZE);
            heap.assert_invariants();
        });
    }

    #[test]
    fn exhaustion_returns_none() {
        run(|heap| {
            assert!(heap.alloc(ARENA_SIZE as u32, T1).is_none());
            let all = heap.alloc(ARENA_SIZE as u32 - HEADER_SIZE, T1);
            assert!(all.is_some());
            assert!(heap.alloc(4, T1).is_none());
        });
    }

    #[test]
    fn split_threshold_consumes_whole_block() {
        run(|heap| {
            let a = heap.alloc(32, T1).unwrap();
            let b = heap.alloc(32, T1).unwrap();
            heap.dealloc(a, T1).unwrap();
            // A's 32-byte hole can't be split by a 28-byte request (the
            // 4-byte remainder couldn't hold a header plus payload), so
            // the whole block is handed out.
            let c = heap.alloc(28, T1).unwrap();
            assert_eq!(c, a);
            heap.dealloc(c, T1).unwrap();
            heap.dealloc(b, T1).unwrap();
            heap.assert_invariants();
        });
    }

    #[test]
    fn dealloc_unknown_offsets() {
        run(|heap| {
            let a = heap.alloc(32, T1).unwrap();
            assert_eq!(heap.dealloc(a + 4, T1), Err(DeallocError::UnknownBlock));
            assert_eq!(heap.dealloc(a - 4, T1), Err(DeallocError::UnknownBlock));
            assert_eq!(heap.dealloc(4, T1), Err(DeallocError::UnknownBlock));
            assert_eq!(
                heap.dealloc(ARENA_SIZE as u32 + 8, T1),
                Err(DeallocError::UnknownBlock)
            );
            // Double free: after the real free, the same offset is no
            // longer the payload of an allocated block.
            heap.dealloc(a, T1).unwrap();
            assert_eq!(heap.dealloc(a, T1), Err(DeallocError::UnknownBlock));
        });
    }

    #[test]
    fn dealloc_checks_owner() {
        run(|heap| {
            let a = heap.alloc(32, T1).unwrap();
            assert_eq!(heap.dealloc(a, Tid(4)), Err(DeallocError::NotOwner));
            assert_eq!(heap.dealloc(a, T1), Ok(()));
        });
    }

    #[test]
    fn coalescing_via_extfrag() {
        run(|heap| {
            let h = HEADER_SIZE;
            let p: Vec<u32> =
                (0..9).map(|_| heap.alloc(32, T1).unwrap()).collect();

            assert_eq!(heap.count_extfrag(32 + h + 1), 0);
            assert_eq!(heap.count_extfrag(96 + 3 * h + 1), 0);

            for i in [1, 3, 5, 7] {
                heap.dealloc(p[i], T1).unwrap();
            }
            heap.assert_invariants();
            assert_eq!(heap.count_extfrag(32 + h + 1), 4);
            assert_eq!(heap.count_extfrag(96 + 3 * h + 1), 4);

            for i in [2, 6] {
                heap.dealloc(p[i], T1).unwrap();
            }
            heap.assert_invariants();
            // Each triple merged into a 112-byte hole.
            assert_eq!(heap.count_extfrag(32 + h + 1), 0);
            assert_eq!(heap.count_extfrag(96 + 3 * h + 1), 2);

            for i in [0, 4, 8] {
                heap.dealloc(p[i], T1).unwrap();
            }
            heap.assert_invariants();
            assert_eq!(heap.count_extfrag(288 + 9 * h + 1), 0);
        });
    }

    #[test]
    fn extfrag_is_strict() {
        run(|heap| {
            let p1 = heap.alloc(12, T1).unwrap();
            let p2 = heap.alloc(12, T1).unwrap();
            let _p3 = heap.alloc(12, T1).unwrap();
            heap.dealloc(p2, T1).unwrap();
            let footprint = 12 + HEADER_SIZE;
            assert_eq!(heap.count_extfrag(footprint), 0);
            assert_eq!(heap.count_extfrag(footprint + 1), 1);
            let _ = p1;
        });
    }

    #[test]
    fn full_round_trip_restores_initial_state() {
        run(|heap| {
            let initial = ARENA_SIZE as u32 - HEADER_SIZE;
            let mut ptrs: Vec<u32> = (1..20)
                .map(|i| heap.alloc(i * 7, T1).unwrap())
                .collect();
            // Free in an interleaved order to exercise both coalesce
            // directions and head updates.
            let order: Vec<usize> = (0..ptrs.len())
                .step_by(2)
                .chain((1..ptrs.len()).step_by(2))
                .collect();
            for &i in &order {
                heap.dealloc(ptrs[i], T1).unwrap();
                heap.assert_invariants();
            }
            ptrs.clear();
            assert_eq!(heap.count_extfrag(initial + HEADER_SIZE), 0);
            assert_eq!(heap.count_extfrag(initial + HEADER_SIZE + 1), 1);
            // And the whole arena is again allocatable in one piece.
            let all = heap.alloc(initial, T1).unwrap();
            assert_eq!(all, HEADER_SIZE);
        });
    }

    #[test]
    fn first_fit_reuses_lowest_hole() {
        run(|heap| {
            let a = heap.alloc(64, T1).unwrap();
            let _b = heap.alloc(64, T1).unwrap();
            let c = heap.alloc(64, T1).unwrap();
            heap.dealloc(a, T1).unwrap();
            heap.dealloc(c, T1).unwrap();
            // Both holes fit; first fit must choose the lower one.
            assert_eq!(heap.alloc(64, T1), Some(a));
        });
    }
}
