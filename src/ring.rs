// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dataplane contributors
//
// The in-process ("shim") buffer ring shared by the two ends of a local
// connection.
//
// One allocation holds all payloads, stride-aligned; slot headers and
// states live alongside. Four rotating cursors implement the
// single-producer / single-consumer exchange:
//
//   get-for-write (next_write) → put (next_put) → get-for-read
//   (next_read) → release (next_release)
//
// Cursor discipline relies on one-producer/one-consumer ordering, not
// locking: a slot's state word is the only synchronization point between
// the two ends (Release on publish, Acquire on observe), exactly as a
// shared-memory ring would use its write/read indices.
//
// Each slot additionally hosts a spin-guarded zero-copy queue: another
// port may insert an already-full buffer it owns ahead of this slot, and
// the consumer drains that queue before looking at the slot itself.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::SpinLock;

/// Default ring depth when neither metadata nor params say otherwise.
pub const DEFAULT_NBUFFERS: u32 = 2;
/// Default message buffer size in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;
/// Payload alignment within the shared allocation.
pub const BUFFER_ALIGN: usize = 16;

/// Per-message header carried with every buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader {
    /// Message length in bytes.
    pub length: u32,
    /// Application opcode.
    pub op_code: u8,
    /// End-of-stream marker.
    pub end: bool,
    /// Routing hint for Directed distribution.
    pub direct: u8,
}

// Slot lifecycle: Empty → Filling (producer holds) → Full → Reading
// (consumer holds) → Empty.
const EMPTY: u8 = 0;
const FILLING: u8 = 1;
const FULL: u8 = 2;
const READING: u8 = 3;

struct Slot {
    state: AtomicU8,
    hdr: UnsafeCell<MessageHeader>,
    zc: ZcQueue,
}

/// A guest reference into some ring: the buffer at `slot` of `ring`.
/// Arena-indexed; no raw pointers cross ring boundaries.
pub struct ZcRef {
    pub ring: Arc<Ring>,
    pub slot: u32,
}

/// Spin-guarded single-reader queue of guest buffers hosted by one slot.
/// `push` and `pop` are the only operations touching shared state.
struct ZcQueue {
    lock: SpinLock,
    nonempty: AtomicBool,
    q: UnsafeCell<VecDeque<ZcRef>>,
}

impl ZcQueue {
    fn new() -> Self {
        Self {
            lock: SpinLock::new(),
            nonempty: AtomicBool::new(false),
            q: UnsafeCell::new(VecDeque::new()),
        }
    }

    fn push(&self, r: ZcRef) {
        self.lock.with(|| {
            unsafe { &mut *self.q.get() }.push_back(r);
            self.nonempty.store(true, Ordering::Release);
        });
    }

    fn pop(&self) -> Option<ZcRef> {
        if !self.nonempty.load(Ordering::Acquire) {
            return None;
        }
        self.lock.with(|| {
            let q = unsafe { &mut *self.q.get() };
            let r = q.pop_front();
            if q.is_empty() {
                self.nonempty.store(false, Ordering::Release);
            }
            r
        })
    }
}

/// What `next_full` yielded: the host slot itself, or a guest queued
/// ahead of it by a zero-copy put.
pub enum RingBuf {
    Host(u32),
    Guest(ZcRef),
}

/// The shared shim ring. Both ends of an in-process connection hold the
/// same `Arc<Ring>`; the producer end uses the write/put cursors and the
/// consumer end the read/release cursors.
pub struct Ring {
    n: u32,
    buffer_size: usize,
    stride: usize,
    slots: Box<[Slot]>,
    data: Box<[UnsafeCell<u8>]>,
    next_write: AtomicU32,
    next_put: AtomicU32,
    next_read: AtomicU32,
    next_release: AtomicU32,
    n_written: AtomicU64,
    n_read: AtomicU64,
}

// Payload ranges are disjoint per slot and owned by whichever end holds
// the slot in Filling/Reading state; the state word orders the handoff.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

fn round_up(v: usize, align: usize) -> usize {
    (v + align - 1) / align * align
}

impl Ring {
    /// Allocate a ring of `n` slots of `buffer_size` bytes each.
    /// One allocation backs all payloads, `BUFFER_ALIGN`-aligned.
    pub fn new(n: u32, buffer_size: usize) -> Arc<Ring> {
        assert!(n > 0);
        let stride = round_up(buffer_size.max(1), BUFFER_ALIGN);
        let slots = (0..n).map(|_| Slot {
            state: AtomicU8::new(EMPTY),
            hdr: UnsafeCell::new(MessageHeader::default()),
            zc: ZcQueue::new(),
        });
        Arc::new(Ring {
            n,
            buffer_size,
            stride,
            slots: slots.collect(),
            data: (0..stride * n as usize).map(|_| UnsafeCell::new(0u8)).collect(),
            next_write: AtomicU32::new(0),
            next_put: AtomicU32::new(0),
            next_read: AtomicU32::new(0),
            next_release: AtomicU32::new(0),
            n_written: AtomicU64::new(0),
            n_read: AtomicU64::new(0),
        })
    }

    pub fn n_buffers(&self) -> u32 {
        self.n
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn buffer_stride(&self) -> usize {
        self.stride
    }

    fn index(&self, cursor: u32) -> u32 {
        cursor % self.n
    }

    // --- producer end ---

    /// Claim the next slot for writing, or `None` when it is still full
    /// or held. Never blocks.
    pub fn next_empty(&self) -> Option<u32> {
        let w = self.next_write.load(Ordering::Relaxed);
        let idx = self.index(w);
        let slot = &self.slots[idx as usize];
        if slot.state.load(Ordering::Acquire) != EMPTY {
            return None;
        }
        slot.state.store(FILLING, Ordering::Relaxed);
        self.next_write.store(w.wrapping_add(1), Ordering::Relaxed);
        Some(idx)
    }

    /// Commit the slot claimed longest ago, publishing `hdr` and the
    /// payload bytes written since `next_empty`.
    pub fn commit(&self, slot: u32, hdr: MessageHeader) {
        let p = self.next_put.load(Ordering::Relaxed);
        assert_eq!(slot, self.index(p), "commit out of ring order");
        let s = &self.slots[slot as usize];
        assert_eq!(s.state.load(Ordering::Relaxed), FILLING);
        unsafe { *s.hdr.get() = hdr };
        s.state.store(FULL, Ordering::Release);
        self.next_put.store(p.wrapping_add(1), Ordering::Relaxed);
        self.n_written.fetch_add(1, Ordering::Relaxed);
    }

    // --- consumer end ---

    /// Take the next readable buffer: a guest queued on the current slot
    /// first, else the slot itself once full. Never blocks.
    pub fn next_full(&self) -> Option<RingBuf> {
        let r = self.next_read.load(Ordering::Relaxed);
        let idx = self.index(r);
        let slot = &self.slots[idx as usize];
        if let Some(guest) = slot.zc.pop() {
            return Some(RingBuf::Guest(guest));
        }
        if slot.state.load(Ordering::Acquire) != FULL {
            return None;
        }
        slot.state.store(READING, Ordering::Relaxed);
        self.next_read.store(r.wrapping_add(1), Ordering::Relaxed);
        Some(RingBuf::Host(idx))
    }

    /// Peek the opcode of the next readable message without consuming it.
    pub fn peek_op_code(&self) -> Option<u8> {
        let idx = self.index(self.next_read.load(Ordering::Relaxed));
        let slot = &self.slots[idx as usize];
        // A queued guest is read before the host slot.
        if slot.zc.nonempty.load(Ordering::Acquire) {
            let op = slot.zc.lock.with(|| {
                let q = unsafe { &*slot.zc.q.get() };
                q.front().map(|g| g.ring.header(g.slot).op_code)
            });
            if let Some(op) = op {
                return Some(op);
            }
        }
        if slot.state.load(Ordering::Acquire) == FULL {
            return Some(unsafe { *slot.hdr.get() }.op_code);
        }
        None
    }

    /// Return the slot released longest ago to the empty state.
    pub fn release(&self, slot: u32) {
        let r = self.next_release.load(Ordering::Relaxed);
        assert_eq!(slot, self.index(r), "release out of ring order");
        let s = &self.slots[slot as usize];
        assert_eq!(s.state.load(Ordering::Relaxed), READING);
        s.state.store(EMPTY, Ordering::Release);
        self.next_release.store(r.wrapping_add(1), Ordering::Relaxed);
        self.n_read.fetch_add(1, Ordering::Relaxed);
    }

    /// Queue `guest` (a reading-held buffer of another ring) ahead of
    /// this ring's next write slot.
    pub fn push_zero_copy(&self, guest: ZcRef) {
        assert!(
            !std::ptr::eq(self, guest.ring.as_ref()),
            "zero-copy put must cross ports"
        );
        let idx = self.index(self.next_write.load(Ordering::Relaxed));
        self.slots[idx as usize].zc.push(guest);
    }

    // --- shared queries ---

    /// Message header of a full or reading-held slot.
    pub fn header(&self, slot: u32) -> MessageHeader {
        unsafe { *self.slots[slot as usize].hdr.get() }
    }

    /// Rewrite the header of a slot the caller holds (zero-copy puts
    /// restamp length/opcode before queueing the buffer elsewhere).
    pub fn set_header(&self, slot: u32, hdr: MessageHeader) {
        assert_eq!(
            self.slots[slot as usize].state.load(Ordering::Relaxed),
            READING
        );
        unsafe { *self.slots[slot as usize].hdr.get() = hdr };
    }

    /// Committed-but-unread message count.
    pub fn full_count(&self) -> u32 {
        let r = self.index(self.next_read.load(Ordering::Relaxed));
        if self.slots[r as usize].state.load(Ordering::Acquire) != FULL {
            return 0;
        }
        let p = self.index(self.next_put.load(Ordering::Relaxed));
        p + if p > r { 0 } else { self.n } - r
    }

    /// Slots currently available to the producer.
    pub fn empty_count(&self) -> u32 {
        let w = self.index(self.next_write.load(Ordering::Relaxed));
        if self.slots[w as usize].state.load(Ordering::Acquire) != EMPTY {
            return 0;
        }
        let r = self.index(self.next_release.load(Ordering::Relaxed));
        r + if r > w { 0 } else { self.n } - w
    }

    /// Total messages committed minus total released.
    pub fn in_flight(&self) -> u64 {
        self.n_written.load(Ordering::Relaxed) - self.n_read.load(Ordering::Relaxed)
    }

    // --- payload access (crate-internal; soundness from slot states) ---

    pub(crate) fn payload_ptr(&self, slot: u32) -> *mut u8 {
        let base = self.data.as_ptr() as *mut u8;
        unsafe { base.add(slot as usize * self.stride) }
    }

    /// Payload of a slot held by the consumer (Reading state).
    ///
    /// # Safety
    /// Caller must hold the buffer per ring discipline.
    pub(crate) unsafe fn payload(&self, slot: u32, len: usize) -> &[u8] {
        std::slice::from_raw_parts(self.payload_ptr(slot), len.min(self.buffer_size))
    }

    /// Payload of a slot held by the producer (Filling state).
    ///
    /// # Safety
    /// Caller must hold the buffer per ring discipline.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn payload_mut(&self, slot: u32) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.payload_ptr(slot), self.buffer_size)
    }
}
