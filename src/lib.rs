//! Host-side ring transport for a memory-mapped switch device.
//!
//! The device and host communicate through four kinds of power-of-two
//! descriptor rings in DMA-coherent memory (send, receive, completion,
//! event), a doorbell page, and a register-bank command channel backed by
//! two DMA mailboxes. [`SwitchTransport`] brings the device up (reset,
//! firmware query, firmware memory area, resource negotiation, queue
//! registration), runs one dispatcher thread per completion and event
//! queue, and exposes frame transmit/receive and raw command execution.
//!
//! All device access goes through the [`Bus`] trait. Real deployments
//! implement it over a mapped BAR; [`sim::SimDevice`] implements it in
//! software and is what the test suite runs against.
//!
//! ```no_run
//! use std::sync::Arc;
//! use switchline::sim::SimDevice;
//! use switchline::{Config, SwitchTransport, TxFrame, TxInfo};
//!
//! let bus = Arc::new(SimDevice::new());
//! let transport = SwitchTransport::new(
//!     bus,
//!     Config::default(),
//!     Box::new(|frame, info| println!("{} bytes from port {}", frame.len(), info.port)),
//! )?;
//! transport.transmit(
//!     TxFrame::contiguous(bytes::Bytes::from_static(b"hello")),
//!     &TxInfo { local_port: 1 },
//! )?;
//! transport.fini();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod bus;
mod cmd;
pub mod config;
mod error;
mod mem;
pub mod metrics;
mod queue;
pub mod regs;
pub mod resources;
pub mod sim;
mod transport;
mod workers;

pub use bus::{Bus, DmaDir, IrqHandler};
pub use cmd::CmdChannel;
pub use config::{Config, ConfigBuilder, Profile};
pub use error::{Error, TransmitError};
pub use mem::MemoryBlock;
pub use resources::{AqCaps, BoardInfo, FwInfo, KvdSplit, Resources};
pub use transport::{
    QueueKind, QueueStats, RxCallback, RxInfo, SwitchTransport, TxFrame, TxInfo,
};
