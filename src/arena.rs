// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Fixed-size payload arena for in-flight ZMQ request bodies.
//!
//! Allocation is a monotonic bump of `next_offset` that wraps to zero when
//! the tail cannot fit the payload; there is no compaction and no free
//! list. Each in-flight request owns a half-open byte range until its
//! response is sent (the [`PayloadSlice`] guard releases it on drop).
//!
//! Correctness of the bump-with-wrap design rests on sizing: the arena must
//! hold at least twice the expected in-flight payload bytes so the write
//! head never catches the oldest outstanding range. Rather than trusting
//! that invariant blindly, a reservation that would overlap an unreleased
//! range is refused — the caller drops the request and marks its meter —
//! and every wrap increments a counter so undersizing shows up in the
//! metrics report.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::metrics::Counter;

struct ArenaInner {
    buf: Vec<u8>,
    next_offset: usize,
    /// Unreleased ranges, keyed by start offset. Ranges are disjoint.
    in_flight: BTreeMap<usize, usize>,
}

pub struct PayloadArena {
    inner: Mutex<ArenaInner>,
    capacity: usize,
    wrap_counter: Arc<Counter>,
}

impl PayloadArena {
    pub fn new(capacity: usize, wrap_counter: Arc<Counter>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ArenaInner {
                buf: vec![0u8; capacity],
                next_offset: 0,
                in_flight: BTreeMap::new(),
            }),
            capacity,
            wrap_counter,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().unwrap().in_flight.len()
    }

    /// Reserve a contiguous range, copy `payload` into it, and return the
    /// owning guard. `None` means the payload does not fit without
    /// overwriting an unreleased range; the request must be dropped.
    pub fn store(self: &Arc<Self>, payload: &[u8]) -> Option<PayloadSlice> {
        let len = payload.len();
        if len == 0 {
            return Some(PayloadSlice {
                arena: self.clone(),
                offset: 0,
                len: 0,
                reserved: false,
            });
        }
        if len > self.capacity {
            return None;
        }
        let mut inner = self.inner.lock().unwrap();
        let mut start = inner.next_offset;
        if start + len > self.capacity {
            start = 0;
            self.wrap_counter.increment(1);
        }
        let end = start + len;
        // Disjoint intervals are totally ordered, so only the closest range
        // starting below `end` can reach into the candidate.
        if let Some((&prev_start, &prev_len)) = inner.in_flight.range(..end).next_back() {
            if prev_start + prev_len > start {
                return None;
            }
        }
        inner.buf[start..end].copy_from_slice(payload);
        inner.in_flight.insert(start, len);
        inner.next_offset = end;
        Some(PayloadSlice {
            arena: self.clone(),
            offset: start,
            len,
            reserved: true,
        })
    }

    fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        inner.buf[offset..offset + len].to_vec()
    }

    fn release(&self, offset: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.in_flight.remove(&offset);
    }
}

/// Guard over one reserved byte range. The range stays owned until the
/// guard drops, which happens after the response is written out (or the
/// request fails earlier).
pub struct PayloadSlice {
    arena: Arc<PayloadArena>,
    offset: usize,
    len: usize,
    reserved: bool,
}

impl PayloadSlice {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Copy the payload back out of the arena.
    pub fn bytes(&self) -> Vec<u8> {
        if self.len == 0 {
            return Vec::new();
        }
        self.arena.read(self.offset, self.len)
    }
}

impl Drop for PayloadSlice {
    fn drop(&mut self) {
        if self.reserved {
            self.arena.release(self.offset);
        }
    }
}

impl std::fmt::Debug for PayloadSlice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadSlice")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;

    fn arena(capacity: usize) -> (Arc<PayloadArena>, Arc<Counter>) {
        let registry = MetricsRegistry::new();
        let wraps = registry.create_counter("wraps").unwrap();
        (PayloadArena::new(capacity, wraps.clone()), wraps)
    }

    #[test]
    fn store_and_read_round_trip() {
        let (arena, _) = arena(64);
        let slice = arena.store(b"hello").unwrap();
        assert_eq!(slice.bytes(), b"hello");
        assert_eq!(arena.in_flight(), 1);
        drop(slice);
        assert_eq!(arena.in_flight(), 0);
    }

    #[test]
    fn concurrent_reservations_never_overlap() {
        let (arena, _) = arena(1024);
        let slices: Vec<_> = (0..8)
            .map(|i| arena.store(&vec![i as u8; 100]).unwrap())
            .collect();
        for (i, a) in slices.iter().enumerate() {
            for b in slices.iter().skip(i + 1) {
                let a_end = a.offset() + a.len();
                let b_end = b.offset() + b.len();
                assert!(a_end <= b.offset() || b_end <= a.offset());
            }
        }
    }

    #[test]
    fn wrap_reuses_released_head() {
        let (arena, wraps) = arena(100);
        let a = arena.store(&[1u8; 60]).unwrap();
        drop(a);
        // Tail holds 40 free bytes; this wraps to offset zero.
        let b = arena.store(&[2u8; 60]).unwrap();
        assert_eq!(b.offset(), 0);
        assert_eq!(wraps.value(), 1);
        assert_eq!(b.bytes(), vec![2u8; 60]);
    }

    #[test]
    fn wrap_into_unreleased_range_is_refused() {
        let (arena, _) = arena(100);
        let head = arena.store(&[1u8; 60]).unwrap();
        // Would wrap onto `head`, which is still in flight.
        assert!(arena.store(&[2u8; 60]).is_none());
        drop(head);
        assert!(arena.store(&[2u8; 60]).is_some());
    }

    #[test]
    fn oversized_payload_is_refused() {
        let (arena, _) = arena(16);
        assert!(arena.store(&[0u8; 17]).is_none());
    }

    #[test]
    fn empty_payload_needs_no_reservation() {
        let (arena, _) = arena(16);
        let slice = arena.store(b"").unwrap();
        assert!(slice.is_empty());
        assert_eq!(arena.in_flight(), 0);
    }
}
