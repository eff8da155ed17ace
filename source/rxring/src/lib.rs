//! RxRing - a byte ring between a receive interrupt and foreground code
//!
//! One side (the "producer", normally a UART receive-complete interrupt) calls
//! [`RxRing::put`]; the other side (the "consumer", normally code polling
//! from the main loop) calls [`RxRing::get`], [`RxRing::len`] and
//! [`RxRing::clear`].
//!
//! When the ring is full, [`RxRing::put`] stores as many bytes as fit and
//! reports how many that was. Unread bytes are never overwritten.
//!
//! # Positions
//!
//! The read and write positions run over `0..2 * CAP` rather than `0..CAP`,
//! so a full ring (`write - read == CAP`) can be told apart from an empty one
//! (`write == read`) without a separate length counter, and `CAP` does not
//! need to be a power of two.

#![cfg_attr(not(test), no_std)]
#![allow(clippy::len_without_is_empty)]

use core::{cell::UnsafeCell, cmp::min, ptr};
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};

/// Receive buffer capacity used by the deployed firmware.
pub const DEFAULT_CAPACITY: usize = 12 * 1024;

pub struct RxRing<const CAP: usize> {
    buf: UnsafeCell<[u8; CAP]>,
    /// Producer-owned position, in `0..2 * CAP`.
    write_pos: AtomicUsize,
    /// Consumer-owned position, in `0..2 * CAP`.
    read_pos: AtomicUsize,
    producing: AtomicBool,
    consuming: AtomicBool,
}

// Safety: the bytes in `buf` are only touched by the side that currently
// holds the matching claim flag, and ownership of each byte is handed between
// the sides with release/acquire stores of the positions.
unsafe impl<const CAP: usize> Sync for RxRing<CAP> {}

/// Exclusive claim over one side of the ring.
struct Claim<'a>(&'a AtomicBool);

impl<'a> Claim<'a> {
    #[inline]
    fn try_take(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| Claim(flag))
    }
}

impl Drop for Claim<'_> {
    #[inline]
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<const CAP: usize> RxRing<CAP> {
    /// Creates an empty ring.
    ///
    /// `CAP` must be non-zero, or this will panic (at compile time, when used
    /// to initialize a `static`).
    #[track_caller]
    #[must_use]
    pub const fn new() -> Self {
        assert!(CAP > 0, "Capacity must be larger than 0!");
        assert!(CAP <= usize::MAX / 2, "Capacity is too large!");
        Self {
            buf: UnsafeCell::new([0; CAP]),
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
            producing: AtomicBool::new(false),
            consuming: AtomicBool::new(false),
        }
    }

    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        CAP
    }

    /// Appends as many of `bytes` as currently fit, returning how many were
    /// stored.
    ///
    /// A short count means the ring is full. The caller should treat that as
    /// backpressure: retry the remainder later, or drop it.
    ///
    /// Only one producer may be active at a time. If another `put` is already
    /// in progress (from a nested interrupt, for example), this stores nothing
    /// and returns 0.
    pub fn put(&self, bytes: &[u8]) -> usize {
        let Some(_claim) = Claim::try_take(&self.producing) else {
            return 0;
        };

        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);
        let free = CAP - Self::distance(write, read);
        let n = min(free, bytes.len());
        if n == 0 {
            return 0;
        }

        let start = Self::slot(write);
        let first = min(n, CAP - start);
        let base = self.buf.get().cast::<u8>();
        // Safety: the `n` slots following `write` are free, so the consumer
        // will not look at them until `write_pos` is published below. `start
        // + first <= CAP` and `n - first <= start`.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(start), first);
            ptr::copy_nonoverlapping(bytes.as_ptr().add(first), base, n - first);
        }

        self.write_pos
            .store(Self::advance(write, n), Ordering::Release);
        n
    }

    /// Removes up to `out.len()` buffered bytes into the front of `out`,
    /// returning how many were removed. Returns 0 when the ring is empty.
    ///
    /// Only one consumer may be active at a time; a concurrent call returns 0.
    pub fn get(&self, out: &mut [u8]) -> usize {
        let Some(_claim) = Claim::try_take(&self.consuming) else {
            return 0;
        };

        let read = self.read_pos.load(Ordering::Relaxed);
        let write = self.write_pos.load(Ordering::Acquire);
        let n = min(Self::distance(write, read), out.len());
        if n == 0 {
            return 0;
        }

        let start = Self::slot(read);
        let first = min(n, CAP - start);
        let base = self.buf.get().cast::<u8>().cast_const();
        // Safety: the `n` slots following `read` were published by the
        // producer's release store of `write_pos`, and it will not reuse them
        // until `read_pos` is advanced below.
        unsafe {
            ptr::copy_nonoverlapping(base.add(start), out.as_mut_ptr(), first);
            ptr::copy_nonoverlapping(base, out.as_mut_ptr().add(first), n - first);
        }

        self.read_pos
            .store(Self::advance(read, n), Ordering::Release);
        n
    }

    /// Number of bytes currently buffered.
    ///
    /// Exact when called from the consumer side. From anywhere else it is a
    /// snapshot that may already be stale.
    #[must_use]
    pub fn len(&self) -> usize {
        let read = self.read_pos.load(Ordering::Acquire);
        let write = self.write_pos.load(Ordering::Acquire);
        min(Self::distance(write, read), CAP)
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() == CAP
    }

    /// Slot the next received byte will be stored into.
    #[must_use]
    pub fn write_index(&self) -> usize {
        Self::slot(self.write_pos.load(Ordering::Acquire))
    }

    /// Slot the next byte will be read from.
    #[must_use]
    pub fn read_index(&self) -> usize {
        Self::slot(self.read_pos.load(Ordering::Acquire))
    }

    /// Discards everything currently buffered. This is a consumer-side
    /// operation.
    ///
    /// If no `put` is in progress, both indices return to slot 0. Otherwise
    /// the read position jumps to the producer's published write position.
    /// Either way no byte stored before the call will be returned by a later
    /// [`get`](Self::get).
    pub fn clear(&self) {
        let Some(_consumer) = Claim::try_take(&self.consuming) else {
            return;
        };

        match Claim::try_take(&self.producing) {
            Some(_producer) => {
                self.write_pos.store(0, Ordering::Release);
                self.read_pos.store(0, Ordering::Release);
            }
            None => {
                let write = self.write_pos.load(Ordering::Acquire);
                self.read_pos.store(write, Ordering::Release);
            }
        }
    }

    #[inline]
    const fn slot(pos: usize) -> usize {
        if pos >= CAP {
            pos - CAP
        } else {
            pos
        }
    }

    #[inline]
    const fn advance(pos: usize, n: usize) -> usize {
        let next = pos + n;
        if next >= 2 * CAP {
            next - 2 * CAP
        } else {
            next
        }
    }

    #[inline]
    const fn distance(write: usize, read: usize) -> usize {
        if write >= read {
            write - read
        } else {
            write + 2 * CAP - read
        }
    }
}

impl<const CAP: usize> Default for RxRing<CAP> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CAP: usize> core::fmt::Debug for RxRing<CAP> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RxRing")
            .field("capacity", &CAP)
            .field("len", &self.len())
            .field("read_index", &self.read_index())
            .field("write_index", &self.write_index())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    #[test]
    fn put_get_fifo() {
        let ring = RxRing::<8>::new();
        assert_eq!(ring.put(&[1, 2, 3]), 3);
        assert_eq!(ring.len(), 3);

        let mut out = [0u8; 2];
        assert_eq!(ring.get(&mut out), 2);
        assert_eq!(out, [1, 2]);
        assert_eq!(ring.len(), 1);

        let mut out = [0u8; 8];
        assert_eq!(ring.get(&mut out), 1);
        assert_eq!(out[0], 3);
        assert!(ring.is_empty());
    }

    #[test]
    fn get_empty_is_nonblocking() {
        let ring = RxRing::<4>::new();
        let mut out = [0xAAu8; 4];
        assert_eq!(ring.get(&mut out), 0);
        assert_eq!(out, [0xAA; 4]);
    }

    #[test]
    fn full_ring_rejects_without_overwriting() {
        let ring = RxRing::<4>::new();
        assert_eq!(ring.put(&[1, 2, 3, 4, 5, 6]), 4);
        assert!(ring.is_full());
        assert_eq!(ring.put(&[7]), 0);

        let mut out = [0u8; 4];
        assert_eq!(ring.get(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn wraps_around_capacity() {
        let ring = RxRing::<5>::new();
        let mut out = [0u8; 5];
        for round in 0..20u8 {
            let data = [round, round.wrapping_add(1), round.wrapping_add(2)];
            assert_eq!(ring.put(&data), 3);
            assert_eq!(ring.get(&mut out[..3]), 3);
            assert_eq!(&out[..3], &data);
        }
        assert!(ring.read_index() < 5);
        assert_eq!(ring.read_index(), ring.write_index());
    }

    #[test]
    fn clear_resets_indices() {
        let ring = RxRing::<6>::new();
        ring.put(&[1, 2, 3, 4]);
        let mut out = [0u8; 1];
        ring.get(&mut out);
        ring.clear();

        assert_eq!(ring.len(), 0);
        assert_eq!(ring.read_index(), 0);
        assert_eq!(ring.write_index(), 0);
        assert_eq!(ring.get(&mut out), 0);

        ring.put(&[9]);
        assert_eq!(ring.get(&mut out), 1);
        assert_eq!(out, [9]);
    }

    #[test]
    fn clear_with_busy_producer_realigns() {
        let ring = RxRing::<6>::new();
        ring.put(&[1, 2, 3]);

        // Pretend an interrupt is halfway through a `put`.
        let producer = Claim::try_take(&ring.producing).unwrap();
        ring.clear();
        assert_eq!(ring.len(), 0);
        assert_eq!(ring.read_index(), ring.write_index());
        assert_eq!(ring.put(&[4]), 0, "second producer must be refused");
        drop(producer);

        ring.put(&[4]);
        let mut out = [0u8; 4];
        assert_eq!(ring.get(&mut out), 1);
        assert_eq!(out[0], 4);
    }

    #[test]
    fn threaded_producer_preserves_order() {
        use std::sync::Arc;

        const TOTAL: usize = 100_000;
        let ring = Arc::new(RxRing::<64>::new());
        let producer = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                let mut sent = 0usize;
                while sent < TOTAL {
                    let byte = [(sent % 251) as u8];
                    if ring.put(&byte) == 1 {
                        sent += 1;
                    } else {
                        std::hint::spin_loop();
                    }
                }
            })
        };

        let mut received = 0usize;
        let mut out = [0u8; 17];
        while received < TOTAL {
            let n = ring.get(&mut out);
            for b in &out[..n] {
                assert_eq!(*b, (received % 251) as u8);
                received += 1;
            }
        }
        producer.join().unwrap();
        assert!(ring.is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Put(Vec<u8>),
        Get(usize),
        Clear,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => proptest::collection::vec(any::<u8>(), 0..24).prop_map(Op::Put),
            4 => (0usize..24).prop_map(Op::Get),
            1 => Just(Op::Clear),
        ]
    }

    proptest! {
        #[test]
        fn behaves_like_a_bounded_fifo(ops in proptest::collection::vec(op(), 0..200)) {
            const CAP: usize = 13;
            let ring = RxRing::<CAP>::new();
            let mut model = VecDeque::new();

            for op in ops {
                match op {
                    Op::Put(bytes) => {
                        let stored = ring.put(&bytes);
                        let expected = bytes.len().min(CAP - model.len());
                        prop_assert_eq!(stored, expected);
                        model.extend(&bytes[..stored]);
                    }
                    Op::Get(n) => {
                        let mut out = vec![0u8; n];
                        let got = ring.get(&mut out);
                        let expected: Vec<u8> = model.drain(..n.min(model.len())).collect();
                        prop_assert_eq!(&out[..got], &expected[..]);
                    }
                    Op::Clear => {
                        ring.clear();
                        model.clear();
                    }
                }
                prop_assert_eq!(ring.len(), model.len());
                prop_assert!(ring.len() <= CAP);
            }
        }
    }
}
