//! The ring engine shared by all four queue kinds.
//!
//! A queue is a power-of-two array of fixed-size elements in DMA-coherent
//! memory, plus free-running 16-bit producer and consumer counters. The
//! element index is the counter masked by `count - 1`; the bit at `count`
//! flips each lap and drives the ownership parity:
//!
//! * the device stamps each element it writes with an ownership bit equal
//!   to the lap parity of its own producer counter,
//! * the host treats an element as ready when its ownership bit equals
//!   `(consumer_counter & count) != 0`.
//!
//! Because the parities agree exactly on the lap the device last wrote,
//! a stale element from the previous lap is never consumed, without any
//! extra valid flag. Completion and event queues are initialized with all
//! ownership bits set so that lap zero (parity 0) starts empty.

use std::sync::atomic::{fence, Ordering};

use crate::bus::Bus;
use crate::mem::MemoryBlock;

/// One hardware ring and its per-element host-side attachments.
///
/// `A` carries whatever the host must remember per posted element:
/// in-flight transmit state for send queues, posted buffers for receive
/// queues, nothing for completion and event queues.
pub struct Queue<A> {
    num: u8,
    count: u16,
    elem_size: usize,
    mem: MemoryBlock,
    producer_counter: u16,
    consumer_counter: u16,
    slots: Vec<Option<A>>,
}

impl<A> Queue<A> {
    /// Wrap a coherent block of `count * elem_size` bytes. `count` must be
    /// a power of two.
    pub fn new(num: u8, count: u16, elem_size: usize, mem: MemoryBlock) -> Self {
        debug_assert!(count.is_power_of_two());
        debug_assert!(mem.len() >= count as usize * elem_size);
        let mut slots = Vec::with_capacity(count as usize);
        slots.resize_with(count as usize, || None);
        Queue {
            num,
            count,
            elem_size,
            mem,
            producer_counter: 0,
            consumer_counter: 0,
            slots,
        }
    }

    pub fn num(&self) -> u8 {
        self.num
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    pub fn mem(&self) -> &MemoryBlock {
        &self.mem
    }

    /// Release the backing memory for freeing during teardown.
    pub fn into_mem(self) -> MemoryBlock {
        self.mem
    }

    pub fn producer_counter(&self) -> u16 {
        self.producer_counter
    }

    pub fn consumer_counter(&self) -> u16 {
        self.consumer_counter
    }

    /// Index the producer counter currently addresses.
    pub fn producer_index(&self) -> usize {
        (self.producer_counter & (self.count - 1)) as usize
    }

    /// Index the consumer counter currently addresses.
    pub fn consumer_index(&self) -> usize {
        (self.consumer_counter & (self.count - 1)) as usize
    }

    /// Advance the consumer without an ownership check. Send and receive
    /// queues have no ownership bits; the host learns how far the device
    /// consumed from completion reports instead.
    pub fn consumer_advance(&mut self) {
        self.consumer_counter = self.consumer_counter.wrapping_add(1);
    }

    /// Elements produced but not yet consumed.
    pub fn in_flight(&self) -> u16 {
        self.producer_counter.wrapping_sub(self.consumer_counter)
    }

    /// True when every element is outstanding. Producing into a full ring
    /// would alias a live element one lap back.
    pub fn is_full(&self) -> bool {
        self.in_flight() == self.count
    }

    /// Claim the element at the producer index and advance the producer.
    /// Returns the claimed index, or `None` when the ring is full.
    pub fn producer_reserve(&mut self) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        let index = self.producer_index();
        self.producer_counter = self.producer_counter.wrapping_add(1);
        Some(index)
    }

    /// Consume the element at the consumer index if the device has handed
    /// it over. On success the element bytes are in `out`, re-read after
    /// an acquire fence so nothing precedes the ownership check.
    pub fn consume(&mut self, owner: impl Fn(&[u8]) -> bool, out: &mut [u8]) -> bool {
        debug_assert_eq!(out.len(), self.elem_size);
        let index = (self.consumer_counter & (self.count - 1)) as usize;
        self.mem.copy_to_slice(index * self.elem_size, out);
        let parity = (self.consumer_counter & self.count) != 0;
        if owner(out) != parity {
            return false;
        }
        self.consumer_counter = self.consumer_counter.wrapping_add(1);
        fence(Ordering::Acquire);
        self.mem.copy_to_slice(index * self.elem_size, out);
        true
    }

    /// Copy element `index` into `out`.
    pub fn read_elem(&self, index: usize, out: &mut [u8]) {
        self.mem.copy_to_slice(index * self.elem_size, out);
    }

    /// Overwrite element `index` with `data`.
    pub fn write_elem(&self, index: usize, data: &[u8]) {
        debug_assert_eq!(data.len(), self.elem_size);
        self.mem.copy_from_slice(index * self.elem_size, data);
    }

    /// Run `f` over every element. Used at initialization to stamp
    /// ownership bits.
    pub fn init_elements(&self, f: impl Fn(&mut [u8])) {
        let mut elem = vec![0u8; self.elem_size];
        for index in 0..self.count as usize {
            self.mem.copy_to_slice(index * self.elem_size, &mut elem);
            f(&mut elem);
            self.mem.copy_from_slice(index * self.elem_size, &elem);
        }
    }

    pub fn set_slot(&mut self, index: usize, attachment: A) {
        self.slots[index] = Some(attachment);
    }

    pub fn take_slot(&mut self, index: usize) -> Option<A> {
        self.slots[index].take()
    }

    pub fn slot(&self, index: usize) -> Option<&A> {
        self.slots[index].as_ref()
    }

    /// Drain every attachment, e.g. to unmap buffers during teardown.
    pub fn drain_slots(&mut self) -> impl Iterator<Item = A> + '_ {
        self.slots.iter_mut().filter_map(|s| s.take())
    }

    // ── Doorbells ───────────────────────────────────────────────────
    //
    // A release fence precedes every doorbell so element writes are
    // visible to the device before the counter update.

    /// Publish the producer counter (send and receive queues).
    pub fn ring_producer(&self, bus: &dyn Bus, page_offset: u32, kind_offset: u32) {
        fence(Ordering::Release);
        bus.write32(
            crate::regs::doorbell_addr(page_offset, kind_offset, self.num),
            self.producer_counter as u32,
        );
    }

    /// Publish the consumer counter (completion and event queues). The
    /// written value is offset by `count` so the device sees how far it
    /// may produce, one full lap ahead of the consumer.
    pub fn ring_consumer(&self, bus: &dyn Bus, page_offset: u32, kind_offset: u32) {
        fence(Ordering::Release);
        bus.write32(
            crate::regs::doorbell_addr(page_offset, kind_offset, self.num),
            self.consumer_counter.wrapping_add(self.count) as u32,
        );
    }

    /// Request an interrupt for the next element produced at or after the
    /// consumer counter.
    pub fn ring_arm(&self, bus: &dyn Bus, page_offset: u32, kind_offset: u32) {
        fence(Ordering::Release);
        bus.write32(
            crate::regs::doorbell_addr(page_offset, kind_offset, self.num),
            self.consumer_counter as u32,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::{cqe, CQE_SIZE};
    use std::ptr::NonNull;

    fn test_queue(count: u16) -> Queue<u32> {
        let len = count as usize * CQE_SIZE;
        let buf = vec![0u8; len].into_boxed_slice();
        let ptr = NonNull::new(Box::leak(buf).as_mut_ptr()).unwrap();
        let q = Queue::new(0, count, CQE_SIZE, MemoryBlock::new(ptr, 0x1000, len));
        q.init_elements(|e| cqe::set_owner(e, true));
        q
    }

    /// Write an element the way the device would: ownership bit from the
    /// lap parity of the device-side counter.
    fn device_post(q: &Queue<u32>, hw_counter: u16, fill: impl Fn(&mut [u8])) {
        let index = (hw_counter & (q.count() - 1)) as usize;
        let mut elem = vec![0u8; q.elem_size()];
        fill(&mut elem);
        cqe::set_owner(&mut elem, (hw_counter & q.count()) != 0);
        q.write_elem(index, &elem);
    }

    #[test]
    fn empty_ring_yields_nothing() {
        let mut q = test_queue(8);
        let mut out = [0u8; CQE_SIZE];
        assert!(!q.consume(cqe::owner, &mut out));
        assert_eq!(q.consumer_counter(), 0);
    }

    #[test]
    fn consumes_in_order() {
        let mut q = test_queue(8);
        for hw in 0..3u16 {
            device_post(&q, hw, |e| cqe::set_byte_count(e, 100 + hw));
        }
        let mut out = [0u8; CQE_SIZE];
        for hw in 0..3u16 {
            assert!(q.consume(cqe::owner, &mut out));
            assert_eq!(cqe::byte_count(&out), 100 + hw);
        }
        assert!(!q.consume(cqe::owner, &mut out));
        assert_eq!(q.consumer_counter(), 3);
    }

    #[test]
    fn stale_previous_lap_element_is_not_consumed() {
        let count = 4u16;
        let mut q = test_queue(count);
        let mut out = [0u8; CQE_SIZE];
        // First lap: produce and consume the full ring.
        for hw in 0..count {
            device_post(&q, hw, |_| {});
        }
        for _ in 0..count {
            assert!(q.consume(cqe::owner, &mut out));
        }
        // Second lap: index 0 still holds a lap-0 element (owner bit 0),
        // while the consumer parity is now 1.
        assert!(!q.consume(cqe::owner, &mut out));
        device_post(&q, count, |_| {});
        assert!(q.consume(cqe::owner, &mut out));
    }

    #[test]
    fn producer_full_detection() {
        let mut q = test_queue(4);
        for _ in 0..4 {
            assert!(q.producer_reserve().is_some());
        }
        assert!(q.is_full());
        assert!(q.producer_reserve().is_none());
        // Consuming one frees one.
        device_post(&q, 0, |_| {});
        let mut out = [0u8; CQE_SIZE];
        assert!(q.consume(cqe::owner, &mut out));
        assert_eq!(q.producer_reserve(), Some(0));
    }

    #[test]
    fn counters_wrap_through_u16() {
        let mut q = test_queue(4);
        q.producer_counter = u16::MAX;
        q.consumer_counter = u16::MAX;
        assert_eq!(q.in_flight(), 0);
        let index = q.producer_reserve().unwrap();
        assert_eq!(index, (u16::MAX & 3) as usize);
        assert_eq!(q.producer_counter(), 0);
        assert_eq!(q.in_flight(), 1);
    }

    #[test]
    fn slots_attach_and_detach() {
        let mut q = test_queue(4);
        q.set_slot(2, 77);
        assert_eq!(q.slot(2), Some(&77));
        assert_eq!(q.take_slot(2), Some(77));
        assert_eq!(q.take_slot(2), None);
    }
}
