//! The mailbox command channel.
//!
//! Commands run one at a time over a bank of seven registers: input and
//! output parameters (or mailbox addresses), an input modifier, a token,
//! and a control word whose go bit hands the command to the device. Two
//! DMA-coherent mailboxes are allocated once at bring-up and reused for
//! every command.
//!
//! Completion is observed two ways. Before the event queues exist the
//! channel polls the control register until the go bit clears. Once event
//! delivery is switched on, the device posts a command-completion event
//! instead and the issuing thread sleeps on a condvar until the event
//! dispatcher wakes it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::debug;

use crate::bus::Bus;
use crate::error::Error;
use crate::mem::MemoryBlock;
use crate::metrics;
use crate::regs;

struct CmdIo {
    token: u8,
    in_mbox: MemoryBlock,
    out_mbox: MemoryBlock,
}

#[derive(Default)]
struct CmdWait {
    done: bool,
    token: u8,
    status: u8,
    out_param: u64,
}

pub struct CmdChannel {
    bus: Arc<dyn Bus>,
    timeout: Duration,
    event_mode: AtomicBool,
    // Serializes the whole register protocol. Everything the registers
    // and mailboxes carry for one command lives behind this lock.
    io: Mutex<Option<CmdIo>>,
    wait: Mutex<CmdWait>,
    cond: Condvar,
}

impl CmdChannel {
    pub fn new(bus: Arc<dyn Bus>, timeout: Duration) -> Result<Self, Error> {
        let in_mbox = bus.alloc_coherent(regs::MBOX_SIZE)?;
        let out_mbox = match bus.alloc_coherent(regs::MBOX_SIZE) {
            Ok(mbox) => mbox,
            Err(e) => {
                bus.free_coherent(in_mbox);
                return Err(e);
            }
        };
        Ok(CmdChannel {
            bus,
            timeout,
            event_mode: AtomicBool::new(false),
            io: Mutex::new(Some(CmdIo {
                token: 0,
                in_mbox,
                out_mbox,
            })),
            wait: Mutex::new(CmdWait::default()),
            cond: Condvar::new(),
        })
    }

    /// Switch between polled and event-driven completion. Event mode
    /// requires a live event dispatcher feeding [`notify_event`].
    ///
    /// [`notify_event`]: CmdChannel::notify_event
    pub fn set_event_mode(&self, on: bool) {
        self.event_mode.store(on, Ordering::Release);
    }

    /// Deliver a command-completion event from the event dispatcher.
    pub fn notify_event(&self, token: u8, status: u8, out_param: u64) {
        let mut wait = match self.wait.lock() {
            Ok(wait) => wait,
            Err(_) => return,
        };
        wait.done = true;
        wait.token = token;
        wait.status = status;
        wait.out_param = out_param;
        self.cond.notify_all();
    }

    /// Execute one command and return its output bytes.
    ///
    /// `in_bytes`, when present, is copied into the input mailbox and its
    /// address passed to the device. `out_len` bytes of output are
    /// returned, taken from the output mailbox, or, when `out_direct` is
    /// set, from the 64-bit output parameter itself (`out_len <= 8`).
    pub fn execute(
        &self,
        opcode: u16,
        opcode_mod: u8,
        in_mod: u32,
        in_bytes: Option<&[u8]>,
        out_len: usize,
        out_direct: bool,
    ) -> Result<Vec<u8>, Error> {
        debug_assert!(opcode < (1 << 12));
        debug_assert!(!out_direct || out_len <= 8);
        let mut guard = self.io.lock().map_err(|_| Error::CmdPoisoned)?;
        let io = guard.as_mut().ok_or(Error::CmdClosed)?;
        io.token = io.token.wrapping_add(1);
        let token = io.token;
        let event_mode = self.event_mode.load(Ordering::Acquire);

        debug!(
            "cmd exec: opcode {:#05x} mod {} in_mod {} token {} ({})",
            opcode,
            opcode_mod,
            in_mod,
            token,
            if event_mode { "event" } else { "poll" },
        );

        let in_param = match in_bytes {
            Some(bytes) => {
                debug_assert!(bytes.len() <= regs::MBOX_SIZE);
                io.in_mbox.zero(0, regs::MBOX_SIZE);
                io.in_mbox.copy_from_slice(0, bytes);
                io.in_mbox.device_addr()
            }
            None => 0,
        };
        let out_param = if out_len > 0 && !out_direct {
            io.out_mbox.zero(0, regs::MBOX_SIZE);
            io.out_mbox.device_addr()
        } else {
            0
        };

        self.bus
            .write32(regs::CIR_IN_PARAM_HI, (in_param >> 32) as u32);
        self.bus.write32(regs::CIR_IN_PARAM_LO, in_param as u32);
        self.bus.write32(regs::CIR_IN_MODIFIER, in_mod);
        self.bus
            .write32(regs::CIR_OUT_PARAM_HI, (out_param >> 32) as u32);
        self.bus.write32(regs::CIR_OUT_PARAM_LO, out_param as u32);
        self.bus.write32(regs::CIR_TOKEN, (token as u32) << 16);

        if event_mode {
            // Clear the waiter before the go bit so the completion event
            // cannot race the reset.
            if let Ok(mut wait) = self.wait.lock() {
                wait.done = false;
            }
        }

        let mut ctrl = regs::CIR_CTRL_GO_BIT
            | ((opcode_mod as u32) << regs::CIR_CTRL_OPCODE_MOD_SHIFT)
            | opcode as u32;
        if event_mode {
            ctrl |= regs::CIR_CTRL_EVREQ_BIT;
        }
        self.bus.write32(regs::CIR_CTRL, ctrl);

        let (status, direct_out) = if event_mode {
            self.wait_event(token)?
        } else {
            self.wait_poll()?
        };

        if status != 0 {
            return Err(Error::CmdStatus { status });
        }

        if out_len == 0 {
            Ok(Vec::new())
        } else if out_direct {
            Ok(direct_out.to_be_bytes()[..out_len].to_vec())
        } else {
            let mut out = vec![0u8; out_len];
            io.out_mbox.copy_to_slice(0, &mut out);
            Ok(out)
        }
    }

    fn wait_poll(&self) -> Result<(u8, u64), Error> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let ctrl = self.bus.read32(regs::CIR_CTRL);
            if ctrl & regs::CIR_CTRL_GO_BIT == 0 {
                let status = (ctrl >> regs::CIR_CTRL_STATUS_SHIFT) as u8;
                let out = ((self.bus.read32(regs::CIR_OUT_PARAM_HI) as u64) << 32)
                    | self.bus.read32(regs::CIR_OUT_PARAM_LO) as u64;
                return Ok((status, out));
            }
            if Instant::now() >= deadline {
                metrics::CMD_TIMEOUTS.increment();
                return Err(Error::CmdTimeout);
            }
            std::thread::yield_now();
        }
    }

    fn wait_event(&self, token: u8) -> Result<(u8, u64), Error> {
        let wait = self.wait.lock().map_err(|_| Error::CmdPoisoned)?;
        let (wait, timeout) = self
            .cond
            .wait_timeout_while(wait, self.timeout, |w| !w.done || w.token != token)
            .map_err(|_| Error::CmdPoisoned)?;
        if timeout.timed_out() {
            metrics::CMD_TIMEOUTS.increment();
            return Err(Error::CmdTimeout);
        }
        Ok((wait.status, wait.out_param))
    }

    /// Free the mailboxes. The channel rejects commands afterwards.
    pub fn fini(&self) {
        if let Ok(mut guard) = self.io.lock() {
            if let Some(io) = guard.take() {
                self.bus.free_coherent(io.in_mbox);
                self.bus.free_coherent(io.out_mbox);
            }
        }
    }
}
