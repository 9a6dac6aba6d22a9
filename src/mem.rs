//! DMA-coherent memory blocks.
//!
//! A [`MemoryBlock`] is a chunk of memory visible to both the host and the
//! device: the host sees it through a raw pointer, the device through a bus
//! address. All accesses are volatile because the device may write the
//! same bytes at any time, subject to the ownership protocol.

use std::ptr::NonNull;

/// A DMA-coherent buffer (host pointer, device address, length).
///
/// Allocated and freed through [`Bus`](crate::bus::Bus); exclusively owned
/// by the component that allocated it. There is no `Drop` impl: freeing
/// needs the bus, so owners release blocks explicitly during teardown.
pub struct MemoryBlock {
    ptr: NonNull<u8>,
    device_addr: u64,
    len: usize,
}

// Safety: the block is plain memory; concurrent device writes are mediated
// by volatile accesses and the ring ownership protocol.
unsafe impl Send for MemoryBlock {}
unsafe impl Sync for MemoryBlock {}

impl MemoryBlock {
    /// Wrap raw allocator output. `ptr` must stay valid for `len` bytes
    /// until the block is returned to the allocator.
    pub fn new(ptr: NonNull<u8>, device_addr: u64, len: usize) -> Self {
        MemoryBlock {
            ptr,
            device_addr,
            len,
        }
    }

    /// Bus address the device uses to reach this block.
    pub fn device_addr(&self) -> u64 {
        self.device_addr
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Host pointer to the start of the block.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Volatile big-endian 32-bit read at `offset`.
    pub fn read_u32_be(&self, offset: usize) -> u32 {
        debug_assert!(offset + 4 <= self.len);
        let mut raw = [0u8; 4];
        self.copy_to_slice(offset, &mut raw);
        u32::from_be_bytes(raw)
    }

    /// Volatile copy out of the block.
    pub fn copy_to_slice(&self, offset: usize, out: &mut [u8]) {
        assert!(offset + out.len() <= self.len, "read past end of block");
        let base = self.ptr.as_ptr();
        for (i, byte) in out.iter_mut().enumerate() {
            // Safety: bounds checked above.
            *byte = unsafe { base.add(offset + i).read_volatile() };
        }
    }

    /// Volatile copy into the block.
    pub fn copy_from_slice(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.len, "write past end of block");
        let base = self.ptr.as_ptr();
        for (i, byte) in data.iter().enumerate() {
            // Safety: bounds checked above.
            unsafe { base.add(offset + i).write_volatile(*byte) };
        }
    }

    /// Zero `len` bytes starting at `offset`.
    pub fn zero(&self, offset: usize, len: usize) {
        assert!(offset + len <= self.len, "zero past end of block");
        let base = self.ptr.as_ptr();
        for i in 0..len {
            // Safety: bounds checked above.
            unsafe { base.add(offset + i).write_volatile(0) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaked_block(len: usize) -> MemoryBlock {
        let buf = vec![0u8; len].into_boxed_slice();
        let ptr = NonNull::new(Box::leak(buf).as_mut_ptr()).unwrap();
        MemoryBlock::new(ptr, 0x1000, len)
    }

    #[test]
    fn round_trip_bytes() {
        let block = leaked_block(64);
        block.copy_from_slice(8, &[1, 2, 3, 4]);
        let mut out = [0u8; 4];
        block.copy_to_slice(8, &mut out);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn u32_is_big_endian() {
        let block = leaked_block(16);
        block.copy_from_slice(0, &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(block.read_u32_be(0), 0x1234_5678);
    }

    #[test]
    fn zero_range() {
        let block = leaked_block(16);
        block.copy_from_slice(0, &[0xFF; 16]);
        block.zero(4, 8);
        let mut out = [0u8; 16];
        block.copy_to_slice(0, &mut out);
        assert_eq!(&out[..4], &[0xFF; 4]);
        assert_eq!(&out[4..12], &[0; 8]);
        assert_eq!(&out[12..], &[0xFF; 4]);
    }
}
