//! A software model of the device, for tests and development hosts.
//!
//! Implements [`Bus`] with identity DMA mapping (device addresses are
//! host pointers), a register file, and enough device behavior to drive
//! the transport end to end: the command interface with every bring-up
//! command, queue registration, doorbell processing, completion and event
//! posting with correct ownership parity, and interrupt delivery through
//! the registered handler.
//!
//! Test hooks allow stalling or scripting command responses, injecting
//! received frames, failing DMA mappings, and inspecting transmitted
//! frames and the programmed key-value partition.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Mutex;

use crate::bus::{Bus, DmaDir, IrqHandler};
use crate::error::Error;
use crate::mem::MemoryBlock;
use crate::regs::{self, cqe, eqe, opcode, wqe};
use crate::resources::res_id;

const DOORBELL_PAGE: u32 = 0x10000;
const DEFAULT_FW_PAGES: u16 = 2;

fn mem_read(addr: u64, out: &mut [u8]) {
    // Safety: addresses come from identity-mapped allocations owned by
    // the host side of the same process.
    unsafe { std::ptr::copy_nonoverlapping(addr as *const u8, out.as_mut_ptr(), out.len()) };
}

fn mem_write(addr: u64, data: &[u8]) {
    // Safety: as above.
    unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len()) };
}

struct PendingCmd {
    opcode: u16,
    opcode_mod: u8,
    in_mod: u32,
    in_param: u64,
    out_param_addr: u64,
    token: u8,
    evreq: bool,
}

struct SimDq {
    base: u64,
    count: u16,
    cq: u8,
    /// Device-side consumer of posted descriptors.
    consumer: u16,
    /// Host producer counter, from the producer doorbell.
    producer_limit: u16,
}

struct SimRing {
    base: u64,
    count: u16,
    elem_size: usize,
    /// Event queue fed by this completion queue (unused for event rings).
    eq: u8,
    /// Device-side producer counter.
    hw: u16,
    /// One lap past the host consumer, from the consumer doorbell.
    limit: u16,
    armed: bool,
    overflows: u32,
}

impl SimRing {
    /// Write one element with the device-side ownership parity. Returns
    /// true when the ring was armed (caller signals and disarms).
    fn post(&mut self, build: impl FnOnce(&mut [u8])) -> bool {
        if self.hw == self.limit {
            self.overflows += 1;
            return false;
        }
        let index = (self.hw & (self.count - 1)) as usize;
        let mut elem = vec![0u8; self.elem_size];
        build(&mut elem);
        let owner = (self.hw & self.count) != 0;
        if self.elem_size == regs::CQE_SIZE {
            cqe::set_owner(&mut elem, owner);
        } else {
            eqe::set_owner(&mut elem, owner);
        }
        mem_write(self.base + (index * self.elem_size) as u64, &elem);
        self.hw = self.hw.wrapping_add(1);
        std::mem::take(&mut self.armed)
    }
}

struct Caps {
    log_sdq_sz: u8,
    num_sdqs: u8,
    log_rdq_sz: u8,
    num_rdqs: u8,
    log_cq_sz: u8,
    num_cqs: u8,
    log_eq_sz: u8,
    num_eqs: u8,
}

struct State {
    regs: HashMap<u32, u32>,
    pending: Option<PendingCmd>,
    stall_next: bool,
    scripted: HashMap<u16, (u8, u64)>,
    last_status: u8,
    last_out_param: u64,
    cir_violations: u32,

    fw_pages: u16,
    cmd_interface_rev: u16,
    doorbell_bar: u8,
    resources: Vec<(u16, u64)>,
    omit_sentinel: bool,
    caps: Caps,

    fw_mapped_pages: u32,
    kvd: Option<(u32, u32, u32)>,

    sdqs: HashMap<u8, SimDq>,
    rdqs: HashMap<u8, SimDq>,
    cqs: HashMap<u8, SimRing>,
    eqs: HashMap<u8, SimRing>,

    transmitted: Vec<Vec<u8>>,
    fail_dma_maps: u32,
    hold_tx: bool,
    doorbell_counts: HashMap<u32, u32>,
}

pub struct SimDevice {
    state: Mutex<State>,
    irq: Mutex<Option<IrqHandler>>,
    coherent_outstanding: AtomicIsize,
    mappings_outstanding: AtomicIsize,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDevice {
    pub fn new() -> SimDevice {
        SimDevice {
            state: Mutex::new(State {
                regs: HashMap::new(),
                pending: None,
                stall_next: false,
                scripted: HashMap::new(),
                last_status: 0,
                last_out_param: 0,
                cir_violations: 0,
                fw_pages: DEFAULT_FW_PAGES,
                cmd_interface_rev: 1,
                doorbell_bar: 0,
                resources: vec![
                    (res_id::KVD_SIZE, 0x40000),
                    (res_id::KVD_SINGLE_MIN_SIZE, 0x4000),
                    (res_id::KVD_DOUBLE_MIN_SIZE, 0x4000),
                    (res_id::MAX_SPAN, 8),
                    (res_id::MAX_LAG, 64),
                    (res_id::MAX_PORTS_IN_LAG, 16),
                    (res_id::MAX_SYSTEM_PORT, 64),
                    (res_id::MAX_REGIONS, 1024),
                    (res_id::MAX_VLAN_GROUPS, 256),
                    (res_id::MAX_VIRTUAL_ROUTERS, 256),
                    (res_id::MAX_RIF, 1000),
                ],
                omit_sentinel: false,
                caps: Caps {
                    log_sdq_sz: 10,
                    num_sdqs: 16,
                    log_rdq_sz: 10,
                    num_rdqs: 16,
                    log_cq_sz: 12,
                    num_cqs: regs::CQS_MAX as u8,
                    log_eq_sz: 12,
                    num_eqs: regs::EQS_COUNT as u8,
                },
                fw_mapped_pages: 0,
                kvd: None,
                sdqs: HashMap::new(),
                rdqs: HashMap::new(),
                cqs: HashMap::new(),
                eqs: HashMap::new(),
                transmitted: Vec::new(),
                fail_dma_maps: 0,
                hold_tx: false,
                doorbell_counts: HashMap::new(),
            }),
            irq: Mutex::new(None),
            coherent_outstanding: AtomicIsize::new(0),
            mappings_outstanding: AtomicIsize::new(0),
        }
    }

    // ── Test hooks ──────────────────────────────────────────────────

    /// Hold the next command in flight until [`complete_stalled`] runs.
    ///
    /// [`complete_stalled`]: SimDevice::complete_stalled
    pub fn stall_next_command(&self) {
        self.lock().stall_next = true;
    }

    /// Finish a stalled command with the given status and output
    /// parameter. Returns false when nothing was stalled.
    pub fn complete_stalled(&self, status: u8, out_param: u64) -> bool {
        let fire = {
            let mut state = self.lock();
            match state.pending.take() {
                Some(cmd) => Self::finish(&mut state, &cmd, status, out_param),
                None => return false,
            }
        };
        self.fire_irq(fire);
        true
    }

    /// True while a stalled command is held in flight.
    pub fn command_stalled(&self) -> bool {
        self.lock().pending.is_some()
    }

    /// Script the next occurrence of `opcode` to complete with the given
    /// status and output parameter instead of executing.
    pub fn program_response(&self, opcode: u16, status: u8, out_param: u64) {
        self.lock().scripted.insert(opcode, (status, out_param));
    }

    /// Fail the next `n` streaming DMA mappings.
    pub fn fail_dma_maps(&self, n: u32) {
        self.lock().fail_dma_maps = n;
    }

    /// Stop consuming posted send descriptors, so the send rings fill.
    pub fn hold_tx_completions(&self) {
        self.lock().hold_tx = true;
    }

    /// Resume send processing and drain everything posted meanwhile.
    pub fn release_tx_completions(&self) {
        let fire = {
            let mut state = self.lock();
            state.hold_tx = false;
            let nums: Vec<u8> = state.sdqs.keys().copied().collect();
            let mut fire = false;
            for num in nums {
                fire |= Self::process_sdq(&mut state, num);
            }
            fire
        };
        self.fire_irq(fire);
    }

    pub fn set_fw_pages(&self, pages: u16) {
        self.lock().fw_pages = pages;
    }

    pub fn set_cmd_interface_rev(&self, rev: u16) {
        self.lock().cmd_interface_rev = rev;
    }

    pub fn set_doorbell_bar(&self, bar: u8) {
        self.lock().doorbell_bar = bar;
    }

    /// Lower the advertised send-queue count.
    pub fn set_max_sdqs(&self, n: u8) {
        self.lock().caps.num_sdqs = n;
    }

    /// Replace the reported resource table.
    pub fn set_resources(&self, table: Vec<(u16, u64)>) {
        self.lock().resources = table;
    }

    /// Never report the end-of-table sentinel.
    pub fn omit_resource_sentinel(&self) {
        self.lock().omit_sentinel = true;
    }

    /// Deliver a frame on receive queue `rdq`. Returns false when the
    /// ring has no posted buffer.
    pub fn inject_rx(&self, rdq: u8, payload: &[u8], port: u16, trap_id: u16) -> bool {
        let fire = {
            let mut state = self.lock();
            let (base, count, cq, consumer, limit) = match state.rdqs.get(&rdq) {
                Some(dq) => (dq.base, dq.count, dq.cq, dq.consumer, dq.producer_limit),
                None => return false,
            };
            if consumer == limit {
                return false;
            }
            let index = (consumer & (count - 1)) as usize;
            let mut desc = [0u8; regs::WQE_SIZE];
            mem_read(base + (index * regs::WQE_SIZE) as u64, &mut desc);
            let buf_addr = wqe::address(&desc, 0);
            let buf_len = wqe::byte_count(&desc, 0) as usize;
            let n = payload.len().min(buf_len);
            mem_write(buf_addr, &payload[..n]);
            if let Some(dq) = state.rdqs.get_mut(&rdq) {
                dq.consumer = dq.consumer.wrapping_add(1);
            }
            Self::post_completion(&mut state, cq, |e| {
                cqe::set_send(e, false);
                cqe::set_dqn(e, rdq);
                cqe::set_wqe_counter(e, consumer);
                cqe::set_byte_count(e, n as u16);
                cqe::set_port(e, port);
                cqe::set_trap_id(e, trap_id);
            })
        };
        self.fire_irq(fire);
        true
    }

    /// Post a raw event of the given type on event queue `eq`.
    pub fn inject_event(&self, eq: u8, event_type: u32) {
        let fire = {
            let mut state = self.lock();
            Self::post_event(&mut state, eq, |e| {
                eqe::set_event_type(e, event_type);
            })
        };
        self.fire_irq(fire);
    }

    /// Writes observed on one doorbell register.
    pub fn doorbell_writes(&self, kind_offset: u32, num: u8) -> u32 {
        let db = kind_offset + 4 * num as u32;
        self.lock().doorbell_counts.get(&db).copied().unwrap_or(0)
    }

    /// Frames transmitted so far, in order.
    pub fn transmitted(&self) -> Vec<Vec<u8>> {
        self.lock().transmitted.clone()
    }

    /// The key-value partition sizes received via the profile command:
    /// (linear, single, double).
    pub fn kvd_programmed(&self) -> Option<(u32, u32, u32)> {
        self.lock().kvd
    }

    /// Commands issued while another was still in flight.
    pub fn cir_violations(&self) -> u32 {
        self.lock().cir_violations
    }

    /// Pages currently mapped for firmware use.
    pub fn fw_mapped_pages(&self) -> u32 {
        self.lock().fw_mapped_pages
    }

    /// Registered queues by kind: (send, receive, completion, event).
    pub fn live_queues(&self) -> (usize, usize, usize, usize) {
        let state = self.lock();
        (
            state.sdqs.len(),
            state.rdqs.len(),
            state.cqs.len(),
            state.eqs.len(),
        )
    }

    /// Completion or event elements dropped because a ring was full.
    pub fn ring_overflows(&self) -> u32 {
        let state = self.lock();
        state.cqs.values().chain(state.eqs.values()).map(|r| r.overflows).sum()
    }

    pub fn coherent_outstanding(&self) -> isize {
        self.coherent_outstanding.load(Ordering::Acquire)
    }

    pub fn mappings_outstanding(&self) -> isize {
        self.mappings_outstanding.load(Ordering::Acquire)
    }

    // ── Internals ───────────────────────────────────────────────────

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fire_irq(&self, fire: bool) {
        if !fire {
            return;
        }
        if let Ok(guard) = self.irq.lock() {
            if let Some(handler) = guard.as_ref() {
                handler();
            }
        }
    }

    /// Post a completion element and chase the armed state up through
    /// the linked event queue. Returns whether to raise the interrupt.
    fn post_completion(state: &mut State, cqn: u8, build: impl FnOnce(&mut [u8])) -> bool {
        let signal = match state.cqs.get_mut(&cqn) {
            Some(cq) => {
                let eq = cq.eq;
                if cq.post(build) {
                    Some(eq)
                } else {
                    None
                }
            }
            None => None,
        };
        match signal {
            Some(eqn) => Self::post_event(state, eqn, |e| {
                eqe::set_event_type(e, regs::EQE_EVENT_TYPE_COMP);
                eqe::set_cqn(e, cqn);
            }),
            None => false,
        }
    }

    fn post_event(state: &mut State, eqn: u8, build: impl FnOnce(&mut [u8])) -> bool {
        match state.eqs.get_mut(&eqn) {
            Some(eq) => eq.post(build),
            None => false,
        }
    }

    fn finish(state: &mut State, cmd: &PendingCmd, status: u8, out_param: u64) -> bool {
        if cmd.evreq {
            Self::post_event(state, regs::EQ_ASYNC_NUM, |e| {
                eqe::set_event_type(e, regs::EQE_EVENT_TYPE_CMD);
                eqe::set_cmd_token(e, cmd.token);
                eqe::set_cmd_status(e, status);
                eqe::set_cmd_out_param(e, out_param);
            })
        } else {
            state.last_status = status;
            state.last_out_param = out_param;
            false
        }
    }

    fn handle_ctrl_write(state: &mut State, val: u32) -> bool {
        if state.pending.is_some() {
            state.cir_violations += 1;
            return false;
        }
        let in_param = ((*state.regs.get(&regs::CIR_IN_PARAM_HI).unwrap_or(&0) as u64) << 32)
            | *state.regs.get(&regs::CIR_IN_PARAM_LO).unwrap_or(&0) as u64;
        let out_param_addr = ((*state.regs.get(&regs::CIR_OUT_PARAM_HI).unwrap_or(&0) as u64)
            << 32)
            | *state.regs.get(&regs::CIR_OUT_PARAM_LO).unwrap_or(&0) as u64;
        let cmd = PendingCmd {
            opcode: (val & 0xFFF) as u16,
            opcode_mod: ((val >> regs::CIR_CTRL_OPCODE_MOD_SHIFT) & 0xF) as u8,
            in_mod: *state.regs.get(&regs::CIR_IN_MODIFIER).unwrap_or(&0),
            in_param,
            out_param_addr,
            token: (*state.regs.get(&regs::CIR_TOKEN).unwrap_or(&0) >> 16) as u8,
            evreq: val & regs::CIR_CTRL_EVREQ_BIT != 0,
        };
        if state.stall_next {
            state.stall_next = false;
            state.pending = Some(cmd);
            return false;
        }
        if let Some((status, out_param)) = state.scripted.remove(&cmd.opcode) {
            return Self::finish(state, &cmd, status, out_param);
        }
        let (status, out_param) = Self::execute(state, &cmd);
        Self::finish(state, &cmd, status, out_param)
    }

    fn read_in_mbox(cmd: &PendingCmd) -> Vec<u8> {
        let mut mbox = vec![0u8; regs::MBOX_SIZE];
        if cmd.in_param != 0 {
            mem_read(cmd.in_param, &mut mbox);
        }
        mbox
    }

    fn execute(state: &mut State, cmd: &PendingCmd) -> (u8, u64) {
        match cmd.opcode {
            opcode::QUERY_FW => {
                let mut out = [0u8; 0x20];
                regs::query_fw::set_fw_rev_major(&mut out, 13);
                regs::query_fw::set_fw_rev_minor(&mut out, 1910);
                regs::query_fw::set_fw_rev_subminor(&mut out, 622);
                regs::query_fw::set_cmd_interface_rev(&mut out, state.cmd_interface_rev);
                regs::query_fw::set_fw_pages(&mut out, state.fw_pages);
                regs::query_fw::set_doorbell_page_bar(&mut out, state.doorbell_bar);
                regs::query_fw::set_doorbell_page_offset(&mut out, DOORBELL_PAGE);
                mem_write(cmd.out_param_addr, &out);
                (0, 0)
            }
            opcode::QUERY_AQ_CAP => {
                let mut out = [0u8; 0x10];
                regs::query_aq_cap::set_log_max_sdq_sz(&mut out, state.caps.log_sdq_sz);
                regs::query_aq_cap::set_max_num_sdqs(&mut out, state.caps.num_sdqs);
                regs::query_aq_cap::set_log_max_rdq_sz(&mut out, state.caps.log_rdq_sz);
                regs::query_aq_cap::set_max_num_rdqs(&mut out, state.caps.num_rdqs);
                regs::query_aq_cap::set_log_max_cq_sz(&mut out, state.caps.log_cq_sz);
                regs::query_aq_cap::set_max_num_cqs(&mut out, state.caps.num_cqs);
                regs::query_aq_cap::set_log_max_eq_sz(&mut out, state.caps.log_eq_sz);
                regs::query_aq_cap::set_max_num_eqs(&mut out, state.caps.num_eqs);
                mem_write(cmd.out_param_addr, &out);
                (0, 0)
            }
            opcode::QUERY_BOARDINFO => {
                let mut out = [0u8; 0x70];
                let psid = b"SIM0000000000000";
                out[regs::boardinfo::PSID_OFFSET..regs::boardinfo::PSID_OFFSET + psid.len()]
                    .copy_from_slice(psid);
                mem_write(cmd.out_param_addr, &out);
                (0, 0)
            }
            opcode::QUERY_RESOURCES => {
                let mut entries: Vec<(u16, u64)> = state.resources.clone();
                if !state.omit_sentinel {
                    entries.push((res_id::TABLE_END, 0));
                }
                let per_page = regs::query_resources::ENTRIES_PER_PAGE;
                let mut out = vec![0u8; per_page * regs::query_resources::ENTRY_STRIDE];
                let start = cmd.in_mod as usize * per_page;
                for i in 0..per_page {
                    if let Some(&(id, data)) = entries.get(start + i) {
                        regs::query_resources::set_id(&mut out, i, id);
                        regs::query_resources::set_data(&mut out, i, data);
                    }
                }
                mem_write(cmd.out_param_addr, &out);
                (0, 0)
            }
            opcode::CONFIG_PROFILE => {
                let mbox = Self::read_in_mbox(cmd);
                state.kvd = Some((
                    regs::config_profile::kvd_linear_size(&mbox),
                    regs::config_profile::kvd_hash_single_size(&mbox),
                    regs::config_profile::kvd_hash_double_size(&mbox),
                ));
                (0, 0)
            }
            opcode::MAP_FA => {
                if cmd.in_mod as usize > regs::MAP_FA_ENTRIES_MAX {
                    return (0x03, 0);
                }
                state.fw_mapped_pages += cmd.in_mod;
                (0, 0)
            }
            opcode::UNMAP_FA => {
                state.fw_mapped_pages = 0;
                (0, 0)
            }
            opcode::SW2HW_DQ => {
                let mbox = Self::read_in_mbox(cmd);
                let dq = SimDq {
                    base: regs::sw2hw_dq::pa(&mbox, 0),
                    count: 1u16 << regs::sw2hw_dq::log2_dq_sz(&mbox),
                    cq: regs::sw2hw_dq::cq(&mbox),
                    consumer: 0,
                    producer_limit: 0,
                };
                let num = cmd.in_mod as u8;
                let table = if cmd.opcode_mod == 0 {
                    &mut state.sdqs
                } else {
                    &mut state.rdqs
                };
                if table.contains_key(&num) {
                    return (0x09, 0);
                }
                table.insert(num, dq);
                (0, 0)
            }
            opcode::HW2SW_DQ => {
                let num = cmd.in_mod as u8;
                let table = if cmd.opcode_mod == 0 {
                    &mut state.sdqs
                } else {
                    &mut state.rdqs
                };
                match table.remove(&num) {
                    Some(_) => (0, 0),
                    None => (0x09, 0),
                }
            }
            opcode::SW2HW_CQ => {
                let mbox = Self::read_in_mbox(cmd);
                let num = cmd.in_mod as u8;
                if state.cqs.contains_key(&num) {
                    return (0x09, 0);
                }
                state.cqs.insert(
                    num,
                    SimRing {
                        base: regs::sw2hw_cq::pa(&mbox, 0),
                        count: 1u16 << regs::sw2hw_cq::log_cq_size(&mbox),
                        elem_size: regs::CQE_SIZE,
                        eq: regs::sw2hw_cq::c_eqn(&mbox),
                        hw: 0,
                        limit: 0,
                        armed: false,
                        overflows: 0,
                    },
                );
                (0, 0)
            }
            opcode::HW2SW_CQ => match state.cqs.remove(&(cmd.in_mod as u8)) {
                Some(_) => (0, 0),
                None => (0x09, 0),
            },
            opcode::SW2HW_EQ => {
                let mbox = Self::read_in_mbox(cmd);
                let num = cmd.in_mod as u8;
                if state.eqs.contains_key(&num) {
                    return (0x09, 0);
                }
                state.eqs.insert(
                    num,
                    SimRing {
                        base: regs::sw2hw_eq::pa(&mbox, 0),
                        count: 1u16 << regs::sw2hw_eq::log_eq_size(&mbox),
                        elem_size: regs::EQE_SIZE,
                        eq: 0,
                        hw: 0,
                        limit: 0,
                        armed: false,
                        overflows: 0,
                    },
                );
                (0, 0)
            }
            opcode::HW2SW_EQ => match state.eqs.remove(&(cmd.in_mod as u8)) {
                Some(_) => (0, 0),
                None => (0x09, 0),
            },
            _ => (0x02, 0),
        }
    }

    /// Consume send descriptors up to the published producer counter,
    /// record the frames, and post completions.
    fn process_sdq(state: &mut State, num: u8) -> bool {
        let mut fire = false;
        loop {
            let (base, count, cq, consumer, limit) = match state.sdqs.get(&num) {
                Some(dq) => (dq.base, dq.count, dq.cq, dq.consumer, dq.producer_limit),
                None => return fire,
            };
            if consumer == limit {
                return fire;
            }
            let index = (consumer & (count - 1)) as usize;
            let mut desc = [0u8; regs::WQE_SIZE];
            mem_read(base + (index * regs::WQE_SIZE) as u64, &mut desc);
            let mut frame = Vec::new();
            for sg in 0..regs::WQE_SG_ENTRIES {
                let len = wqe::byte_count(&desc, sg) as usize;
                if len == 0 {
                    break;
                }
                let mut part = vec![0u8; len];
                mem_read(wqe::address(&desc, sg), &mut part);
                frame.extend_from_slice(&part);
            }
            let total = frame.len();
            state.transmitted.push(frame);
            if let Some(dq) = state.sdqs.get_mut(&num) {
                dq.consumer = dq.consumer.wrapping_add(1);
            }
            fire |= Self::post_completion(state, cq, |e| {
                cqe::set_send(e, true);
                cqe::set_dqn(e, num);
                cqe::set_wqe_counter(e, consumer);
                cqe::set_byte_count(e, total as u16);
            });
        }
    }

    fn handle_doorbell(state: &mut State, db: u32, val: u32) -> bool {
        *state.doorbell_counts.entry(db).or_insert(0) += 1;
        let kind = db & 0xF00;
        let num = ((db & 0xFF) / 4) as u8;
        let val16 = val as u16;
        match kind {
            regs::DOORBELL_SDQ_OFFSET => {
                if let Some(dq) = state.sdqs.get_mut(&num) {
                    dq.producer_limit = val16;
                }
                if state.hold_tx {
                    false
                } else {
                    Self::process_sdq(state, num)
                }
            }
            regs::DOORBELL_RDQ_OFFSET => {
                if let Some(dq) = state.rdqs.get_mut(&num) {
                    dq.producer_limit = val16;
                }
                false
            }
            regs::DOORBELL_CQ_OFFSET => {
                if let Some(cq) = state.cqs.get_mut(&num) {
                    cq.limit = val16;
                }
                false
            }
            regs::DOORBELL_EQ_OFFSET => {
                if let Some(eq) = state.eqs.get_mut(&num) {
                    eq.limit = val16;
                }
                false
            }
            regs::DOORBELL_ARM_CQ_OFFSET => {
                // Re-check after arming: an element produced before the
                // arm must still raise an event.
                let signal = match state.cqs.get_mut(&num) {
                    Some(cq) => {
                        if cq.hw != val16 {
                            Some(cq.eq)
                        } else {
                            cq.armed = true;
                            None
                        }
                    }
                    None => None,
                };
                match signal {
                    Some(eqn) => Self::post_event(state, eqn, |e| {
                        eqe::set_event_type(e, regs::EQE_EVENT_TYPE_COMP);
                        eqe::set_cqn(e, num);
                    }),
                    None => false,
                }
            }
            regs::DOORBELL_ARM_EQ_OFFSET => match state.eqs.get_mut(&num) {
                Some(eq) => {
                    if eq.hw != val16 {
                        true
                    } else {
                        eq.armed = true;
                        false
                    }
                }
                None => false,
            },
            _ => false,
        }
    }
}

impl Bus for SimDevice {
    fn read32(&self, offset: u32) -> u32 {
        let state = self.lock();
        match offset {
            regs::FW_READY => regs::FW_READY_MAGIC,
            regs::CIR_CTRL => {
                if state.pending.is_some() {
                    regs::CIR_CTRL_GO_BIT
                } else {
                    (state.last_status as u32) << regs::CIR_CTRL_STATUS_SHIFT
                }
            }
            regs::CIR_OUT_PARAM_HI => (state.last_out_param >> 32) as u32,
            regs::CIR_OUT_PARAM_LO => state.last_out_param as u32,
            _ => *state.regs.get(&offset).unwrap_or(&0),
        }
    }

    fn write32(&self, offset: u32, val: u32) {
        let fire = {
            let mut state = self.lock();
            if offset == regs::CIR_CTRL && val & regs::CIR_CTRL_GO_BIT != 0 {
                Self::handle_ctrl_write(&mut state, val)
            } else if (DOORBELL_PAGE..DOORBELL_PAGE + 0x600).contains(&offset) {
                Self::handle_doorbell(&mut state, offset - DOORBELL_PAGE, val)
            } else {
                state.regs.insert(offset, val);
                false
            }
        };
        self.fire_irq(fire);
    }

    fn alloc_coherent(&self, len: usize) -> Result<MemoryBlock, Error> {
        let raw = Box::into_raw(vec![0u8; len].into_boxed_slice()) as *mut u8;
        let ptr = NonNull::new(raw).ok_or(Error::OutOfMemory("coherent block"))?;
        self.coherent_outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(MemoryBlock::new(ptr, ptr.as_ptr() as u64, len))
    }

    fn free_coherent(&self, block: MemoryBlock) {
        self.coherent_outstanding.fetch_sub(1, Ordering::AcqRel);
        let (ptr, len) = (block.as_ptr(), block.len());
        // Safety: allocated by alloc_coherent via Box::into_raw.
        let _ = unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, len)) };
    }

    fn dma_map(&self, ptr: *const u8, _len: usize, _dir: DmaDir) -> Result<u64, Error> {
        {
            let mut state = self.lock();
            if state.fail_dma_maps > 0 {
                state.fail_dma_maps -= 1;
                return Err(Error::DmaMap);
            }
        }
        self.mappings_outstanding.fetch_add(1, Ordering::AcqRel);
        Ok(ptr as u64)
    }

    fn dma_unmap(&self, _addr: u64, _len: usize, _dir: DmaDir) {
        self.mappings_outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    fn register_interrupt(&self, handler: IrqHandler) {
        if let Ok(mut guard) = self.irq.lock() {
            *guard = Some(handler);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_dma_mapping() {
        let sim = SimDevice::new();
        let data = [1u8, 2, 3];
        let addr = sim.dma_map(data.as_ptr(), 3, DmaDir::ToDevice).unwrap();
        assert_eq!(addr, data.as_ptr() as u64);
        sim.dma_unmap(addr, 3, DmaDir::ToDevice);
        assert_eq!(sim.mappings_outstanding(), 0);
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let sim = SimDevice::new();
        sim.write32(regs::CIR_CTRL, regs::CIR_CTRL_GO_BIT | 0x7ED);
        let ctrl = sim.read32(regs::CIR_CTRL);
        assert_eq!(ctrl & regs::CIR_CTRL_GO_BIT, 0);
        assert_eq!((ctrl >> regs::CIR_CTRL_STATUS_SHIFT) as u8, 0x02);
    }

    #[test]
    fn firmware_ready_magic_is_reported() {
        let sim = SimDevice::new();
        assert_eq!(
            sim.read32(regs::FW_READY) & regs::FW_READY_MASK,
            regs::FW_READY_MAGIC
        );
    }
}
