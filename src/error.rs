use thiserror::Error;

use crate::regs;

/// Errors returned by transport bring-up, teardown and the command channel.
#[derive(Debug, Error)]
pub enum Error {
    /// DMA-coherent or slot-array allocation failed.
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),
    /// Streaming DMA mapping failed.
    #[error("dma mapping failed")]
    DmaMap,
    /// The device rejected a command with a non-zero status.
    #[error("command failed with status {status:#04x} ({})", status_name(.status))]
    CmdStatus { status: u8 },
    /// The device did not complete a command within the configured window.
    /// Distinct from `CmdStatus`: the channel stays usable afterwards.
    #[error("command timed out")]
    CmdTimeout,
    /// A concurrent command-channel user panicked while holding the lock.
    /// The acquisition is aborted with no device access.
    #[error("command channel poisoned")]
    CmdPoisoned,
    /// The command channel was already shut down.
    #[error("command channel closed")]
    CmdClosed,
    /// Configuration value out of range.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The device reported capabilities this transport cannot drive.
    #[error("unsupported device: {0}")]
    Unsupported(String),
    /// The resource query never produced the end-of-table sentinel
    /// within the page limit.
    #[error("resource table sentinel missing")]
    ResourceSentinelMissing,
    /// The key-value partition split violates a device minimum.
    #[error("kvd partition: {0}")]
    KvdPartition(String),
    /// Worker thread spawn failed.
    #[error("worker spawn: {0}")]
    WorkerSpawn(std::io::Error),
}

fn status_name(status: &u8) -> &'static str {
    regs::cmd_status_str(*status)
}

/// Errors returned by the frame-transmit entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransmitError {
    /// The target send queue is full. The caller may retry or drop.
    #[error("send queue full")]
    Busy,
    /// A fragment could not be DMA-mapped. Already-mapped fragments
    /// were unmapped before returning.
    #[error("dma mapping failed")]
    Map,
    /// A fragment exceeds the 14-bit per-entry byte count.
    #[error("fragment too large for a scatter entry")]
    TooLarge,
}
