//! The bus abstraction consumed by the transport.
//!
//! Everything the OS would normally provide (register I/O, DMA-coherent
//! allocation, streaming DMA mapping, interrupt registration) is behind
//! [`Bus`]. The [`sim`](crate::sim) module implements it in software; a
//! real deployment implements it over a mapped BAR and the platform's DMA
//! API.

use crate::error::Error;
use crate::mem::MemoryBlock;

/// Direction of a streaming DMA mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDir {
    /// Host memory read by the device (transmit).
    ToDevice,
    /// Host memory written by the device (receive).
    FromDevice,
}

/// Handler invoked in interrupt context. Its only job is to schedule the
/// event-queue bottom halves; it must never block.
pub type IrqHandler = Box<dyn Fn() + Send + Sync>;

/// Host side of the memory-mapped bus.
///
/// Register accesses are 32-bit big-endian at fixed offsets from the
/// device's register window. Implementations must be safe to call from
/// multiple threads.
pub trait Bus: Send + Sync {
    /// Read a 32-bit big-endian register.
    fn read32(&self, offset: u32) -> u32;

    /// Write a 32-bit big-endian register.
    fn write32(&self, offset: u32, val: u32);

    /// Allocate a zeroed DMA-coherent block.
    fn alloc_coherent(&self, len: usize) -> Result<MemoryBlock, Error>;

    /// Return a block obtained from [`alloc_coherent`](Bus::alloc_coherent).
    fn free_coherent(&self, block: MemoryBlock);

    /// Map host memory for streaming DMA; returns the device-visible
    /// address. The memory must stay valid until unmapped.
    fn dma_map(&self, ptr: *const u8, len: usize, dir: DmaDir) -> Result<u64, Error>;

    /// Release a mapping created by [`dma_map`](Bus::dma_map).
    fn dma_unmap(&self, addr: u64, len: usize, dir: DmaDir);

    /// Register the single interrupt handler. Called once at bring-up;
    /// the previous handler (if any) is replaced.
    fn register_interrupt(&self, handler: IrqHandler);
}
