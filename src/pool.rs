// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transaction/request pool and cross-context submission rings (`spec`
//! C5): a fixed-capacity slab addressed by stable indices, plus
//! lock-free SPSC and MPSC ring buffers for cross-thread submission.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

/// A fixed-capacity slab of `T`, addressed by stable `usize` indices.
/// `acquire`/`release` are O(1).
#[derive(Debug)]
pub struct Slab<T, const N: usize> {
    slots: [Option<T>; N],
    in_use: usize,
}

impl<T, const N: usize> Default for Slab<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Slab<T, N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; N],
            in_use: 0,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        N
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.in_use
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.in_use == 0
    }

    /// Returns true iff every slot is currently free. Intended for a
    /// caller-controlled quiescent point, not as a concurrency check.
    #[must_use]
    pub fn has_leaks(&self) -> bool {
        self.in_use != 0
    }

    /// Occupies the first free slot, returning its index.
    pub fn acquire(&mut self, value: T) -> Option<usize> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(value);
                self.in_use += 1;
                return Some(i);
            }
        }
        None
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    #[must_use]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    /// Frees `index`, returning the value that was stored there.
    pub fn release(&mut self, index: usize) -> Option<T> {
        let slot = self.slots.get_mut(index)?;
        let value = slot.take();
        if value.is_some() {
            self.in_use -= 1;
        }
        value
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|v| (i, v)))
    }
}

/// A fixed-capacity, lock-free, single-producer/single-consumer ring
/// buffer. `N` must be a power of two; `new` panics otherwise so the
/// modulo-by-mask trick used by `push`/`pop` stays correct.
pub struct SpscRing<T, const N: usize> {
    buf: UnsafeCell<[MaybeUninit<T>; N]>,
    head: AtomicUsize,
    tail: AtomicUsize,
    high_water_mark: AtomicUsize,
}

// SAFETY: `head` is only written by the consumer, `tail` only by the
// producer; the buffer slot for index `i` is only touched by the
// producer until `tail` publishes it, and only by the consumer from
// the moment `head` has not yet passed it.
unsafe impl<T: Send, const N: usize> Sync for SpscRing<T, N> {}

impl<T, const N: usize> SpscRing<T, N> {
    #[must_use]
    pub fn new() -> Self {
        assert!(N.is_power_of_two(), "SpscRing capacity must be a power of two");
        Self {
            buf: UnsafeCell::new([const { MaybeUninit::uninit() }; N]),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            high_water_mark: AtomicUsize::new(0),
        }
    }

    fn mask(i: usize) -> usize {
        i & (N - 1)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tail
            .load(Ordering::Acquire)
            .wrapping_sub(self.head.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark.load(Ordering::Relaxed)
    }

    /// Non-blocking enqueue. Returns `false` if the ring is full.
    pub fn enqueue(&self, value: T) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= N {
            return false;
        }
        // SAFETY: this slot is exclusively owned by the single producer
        // until `tail` is published below.
        unsafe {
            (*self.buf.get())[Self::mask(tail)].write(value);
        }
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        let len = tail.wrapping_sub(head) + 1;
        self.high_water_mark.fetch_max(len, Ordering::Relaxed);
        true
    }

    /// Non-blocking dequeue. Returns `None` if the ring is empty.
    pub fn dequeue(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        // SAFETY: this slot was published by the producer and is
        // exclusively owned by the single consumer until `head` moves.
        let value = unsafe { (*self.buf.get())[Self::mask(head)].assume_init_read() };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }
}

impl<T, const N: usize> Default for SpscRing<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// A fixed-capacity, lock-free, multi-producer/single-consumer ring
/// buffer. Producers reserve a slot via compare-and-swap on `tail`;
/// the consumer owns `head` exclusively.
pub struct MpscRing<T, const N: usize> {
    buf: UnsafeCell<[MaybeUninit<T>; N]>,
    ready: [core::sync::atomic::AtomicBool; N],
    head: AtomicUsize,
    tail: AtomicUsize,
    high_water_mark: AtomicUsize,
}

unsafe impl<T: Send, const N: usize> Sync for MpscRing<T, N> {}

impl<T, const N: usize> MpscRing<T, N> {
    #[must_use]
    pub fn new() -> Self {
        assert!(N.is_power_of_two(), "MpscRing capacity must be a power of two");
        Self {
            buf: UnsafeCell::new([const { MaybeUninit::uninit() }; N]),
            ready: [const { core::sync::atomic::AtomicBool::new(false) }; N],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            high_water_mark: AtomicUsize::new(0),
        }
    }

    fn mask(i: usize) -> usize {
        i & (N - 1)
    }

    #[must_use]
    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark.load(Ordering::Relaxed)
    }

    /// Non-blocking enqueue, safe to call from any number of producer
    /// contexts concurrently. Returns `false` if the ring is full.
    pub fn enqueue(&self, value: T) -> bool {
        loop {
            let tail = self.tail.load(Ordering::Relaxed);
            let head = self.head.load(Ordering::Acquire);
            if tail.wrapping_sub(head) >= N {
                return false;
            }
            if self
                .tail
                .compare_exchange_weak(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                let idx = Self::mask(tail);
                // SAFETY: the CAS above uniquely reserved slot `idx` for
                // this producer; no other producer can write it until
                // the consumer clears `ready[idx]` on a future wraparound.
                unsafe {
                    (*self.buf.get())[idx].write(value);
                }
                self.ready[idx].store(true, Ordering::Release);
                let len = tail.wrapping_sub(head) + 1;
                self.high_water_mark.fetch_max(len, Ordering::Relaxed);
                return true;
            }
        }
    }

    /// Non-blocking dequeue. Only the single consumer may call this.
    /// Returns `None` if the ring is empty or the head slot's producer
    /// has reserved but not yet finished writing it.
    pub fn dequeue(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let idx = Self::mask(head);
        if !self.ready[idx].load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: `ready[idx]` was published with Release by the
        // producer after writing the slot; the Acquire load above
        // synchronises with it.
        let value = unsafe { (*self.buf.get())[idx].assume_init_read() };
        self.ready[idx].store(false, Ordering::Release);
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }
}

impl<T, const N: usize> Default for MpscRing<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slab_acquire_release_cycles_leave_no_leaks() {
        let mut slab: Slab<u32, 4> = Slab::new();
        for round in 0..10 {
            let mut handles = [0usize; 4];
            for (i, h) in handles.iter_mut().enumerate() {
                *h = slab.acquire((round * 4 + i) as u32).unwrap();
            }
            assert!(slab.acquire(999).is_none());
            for h in handles {
                slab.release(h);
            }
        }
        assert!(!slab.has_leaks());
    }

    #[test]
    fn slab_reissues_indices_after_release() {
        let mut slab: Slab<u8, 2> = Slab::new();
        let a = slab.acquire(1).unwrap();
        let b = slab.acquire(2).unwrap();
        assert_ne!(a, b);
        slab.release(a);
        let c = slab.acquire(3).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn spsc_ring_fifo_order() {
        let ring: SpscRing<u32, 4> = SpscRing::new();
        assert!(ring.enqueue(1));
        assert!(ring.enqueue(2));
        assert_eq!(ring.dequeue(), Some(1));
        assert_eq!(ring.dequeue(), Some(2));
        assert_eq!(ring.dequeue(), None);
    }

    #[test]
    fn spsc_ring_rejects_over_capacity() {
        let ring: SpscRing<u32, 2> = SpscRing::new();
        assert!(ring.enqueue(1));
        assert!(ring.enqueue(2));
        assert!(!ring.enqueue(3));
        assert_eq!(ring.high_water_mark(), 2);
    }

    #[test]
    fn mpsc_ring_fifo_order() {
        let ring: MpscRing<u32, 4> = MpscRing::new();
        assert!(ring.enqueue(1));
        assert!(ring.enqueue(2));
        assert_eq!(ring.dequeue(), Some(1));
        assert_eq!(ring.dequeue(), Some(2));
        assert_eq!(ring.dequeue(), None);
    }
}
