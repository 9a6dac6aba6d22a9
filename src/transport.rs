//! Transport bring-up, the transmit path, and teardown.
//!
//! Bring-up follows a fixed order: software reset, command channel,
//! firmware query, firmware memory area, identity and resource
//! negotiation, then the queue groups (event, completion, send, receive),
//! then the dispatcher threads. Teardown walks the same list in reverse.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use crossbeam_channel::Sender;
use log::{info, warn};

use crate::bus::{Bus, DmaDir};
use crate::cmd::CmdChannel;
use crate::config::Config;
use crate::error::{Error, TransmitError};
use crate::mem::MemoryBlock;
use crate::metrics::{self, LogInterval};
use crate::queue::Queue;
use crate::regs::{self, cqe, eqe, opcode, wqe};
use crate::resources::{self, BoardInfo, FwInfo, KvdSplit, Resources};
use crate::workers;

/// Traffic class stamped on every send queue.
const SDQ_TCLASS: u8 = 3;

const SW_RESET_TIMEOUT: Duration = Duration::from_millis(900);
const SW_RESET_POLL: Duration = Duration::from_millis(10);

/// Metadata delivered with every received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxInfo {
    /// When set, `port` is a link-aggregation group id rather than a
    /// system port.
    pub is_lag: bool,
    pub port: u16,
    /// Reason the frame was sent to the host.
    pub trap_id: u16,
}

/// Metadata supplied with a frame to transmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxInfo {
    /// Selects the send queue: `local_port` modulo the queue count.
    pub local_port: u16,
}

/// An outgoing frame: a mandatory head plus optional extra fragments.
/// Frames with more fragments than the descriptor has scatter entries
/// are linearized into a single buffer before posting.
pub struct TxFrame {
    pub head: Bytes,
    pub frags: Vec<Bytes>,
}

impl TxFrame {
    pub fn contiguous(data: Bytes) -> Self {
        TxFrame {
            head: data,
            frags: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.head.len() + self.frags.iter().map(|f| f.len()).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Callback invoked from a completion dispatcher thread for every frame
/// the device hands to the host.
pub type RxCallback = dyn Fn(Bytes, &RxInfo) + Send + Sync;

/// In-flight transmit state parked on a send queue slot until the
/// completion for that element arrives.
pub(crate) struct TxEntry {
    #[allow(dead_code)]
    pub(crate) frame: TxFrame,
    pub(crate) mapped: Vec<(u64, usize)>,
}

/// A posted receive buffer. The box is dissolved into raw parts while
/// the device may write it and reassembled on completion.
pub(crate) struct RxBuffer {
    ptr: NonNull<u8>,
    len: usize,
    pub(crate) addr: u64,
}

// Safety: the buffer is exclusively owned; the device side only touches
// it between posting and completion.
unsafe impl Send for RxBuffer {}

impl RxBuffer {
    /// Allocate and DMA-map one receive buffer.
    pub(crate) fn alloc(bus: &dyn Bus, len: usize) -> Option<RxBuffer> {
        let raw = Box::into_raw(vec![0u8; len].into_boxed_slice()) as *mut u8;
        let ptr = NonNull::new(raw)?;
        match bus.dma_map(ptr.as_ptr(), len, DmaDir::FromDevice) {
            Ok(addr) => Some(RxBuffer { ptr, len, addr }),
            Err(_) => {
                // Safety: raw came from Box::into_raw with this length.
                unsafe {
                    drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                        ptr.as_ptr(),
                        len,
                    )))
                };
                None
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Reclaim the buffer as an owned byte string of `n` bytes.
    pub(crate) fn into_bytes(self, n: usize) -> Bytes {
        let len = self.len;
        // Safety: ptr/len came from Box::into_raw in alloc.
        let boxed = unsafe {
            Box::from_raw(std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), len))
        };
        let mut v = boxed.into_vec();
        v.truncate(n.min(len));
        Bytes::from(v)
    }

    pub(crate) fn free(self) {
        // Safety: ptr/len came from Box::into_raw in alloc.
        let _ = unsafe {
            Box::from_raw(std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len))
        };
    }
}

/// Lock a queue mutex, adopting the state of a panicked holder.
pub(crate) fn lock_queue<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// State shared between the public handle and the dispatcher threads.
pub(crate) struct Shared {
    pub(crate) bus: Arc<dyn Bus>,
    pub(crate) config: Config,
    pub(crate) cmd: CmdChannel,
    pub(crate) doorbell_offset: u32,
    pub(crate) sdqs: Vec<Mutex<Option<Queue<TxEntry>>>>,
    pub(crate) rdqs: Vec<Mutex<Option<Queue<RxBuffer>>>>,
    pub(crate) cqs: Vec<Mutex<Option<Queue<()>>>>,
    pub(crate) eqs: Vec<Mutex<Option<Queue<()>>>>,
    pub(crate) cq_wakes: OnceLock<Vec<Sender<()>>>,
    pub(crate) rx_cb: Box<RxCallback>,
    pub(crate) shutdown: AtomicBool,
    pub(crate) fw_area: Mutex<Vec<MemoryBlock>>,
    pub(crate) refill_warn: LogInterval,
    pub(crate) mismatch_warn: LogInterval,
}

/// Which of the four rings a [`QueueStats`] entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Send,
    Receive,
    Completion,
    Event,
}

/// Counter snapshot for one queue.
#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
    pub kind: QueueKind,
    pub num: u8,
    pub count: u16,
    pub producer: u16,
    pub consumer: u16,
}

/// The host side of one switch device.
pub struct SwitchTransport {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    eq_wakes: Vec<Sender<()>>,
    fw_info: FwInfo,
    board: BoardInfo,
    resources: Resources,
    kvd: KvdSplit,
}

struct Negotiated {
    fw: FwInfo,
    fw_area: Vec<MemoryBlock>,
    board: BoardInfo,
    resources: Resources,
    kvd: KvdSplit,
}

impl SwitchTransport {
    /// Bring the device up and start the dispatcher threads. `rx_cb`
    /// receives every frame the device traps to the host.
    pub fn new(
        bus: Arc<dyn Bus>,
        config: Config,
        rx_cb: Box<RxCallback>,
    ) -> Result<SwitchTransport, Error> {
        config.validate()?;
        sw_reset(bus.as_ref());
        let cmd = CmdChannel::new(bus.clone(), config.cmd_timeout)?;

        let neg = match negotiate(&bus, &cmd, &config) {
            Ok(neg) => neg,
            Err(e) => {
                cmd.fini();
                return Err(e);
            }
        };
        let doorbell_offset = neg.fw.doorbell_page_offset;

        let queues = match create_queues(&bus, &cmd, &config, doorbell_offset) {
            Ok(queues) => queues,
            Err(e) => {
                unmap_fw_area(bus.as_ref(), &cmd, neg.fw_area);
                cmd.fini();
                return Err(e);
            }
        };

        let shared = Arc::new(Shared {
            bus: bus.clone(),
            config,
            cmd,
            doorbell_offset,
            sdqs: queues.sdqs.into_iter().map(|q| Mutex::new(Some(q))).collect(),
            rdqs: queues.rdqs.into_iter().map(|q| Mutex::new(Some(q))).collect(),
            cqs: queues.cqs.into_iter().map(|q| Mutex::new(Some(q))).collect(),
            eqs: queues.eqs.into_iter().map(|q| Mutex::new(Some(q))).collect(),
            cq_wakes: OnceLock::new(),
            rx_cb,
            shutdown: AtomicBool::new(false),
            fw_area: Mutex::new(neg.fw_area),
            refill_warn: LogInterval::new(Duration::from_secs(10)),
            mismatch_warn: LogInterval::new(Duration::from_secs(10)),
        });

        let mut transport = SwitchTransport {
            shared,
            workers: Mutex::new(Vec::new()),
            eq_wakes: Vec::new(),
            fw_info: neg.fw,
            board: neg.board,
            resources: neg.resources,
            kvd: neg.kvd,
        };

        match workers::spawn(&transport.shared) {
            Ok((handles, eq_wakes)) => {
                *lock_queue(&transport.workers) = handles;
                transport.eq_wakes = eq_wakes;
            }
            Err(e) => {
                transport.fini();
                return Err(e);
            }
        }

        let irq_wakes = transport.eq_wakes.clone();
        bus.register_interrupt(Box::new(move || {
            for wake in &irq_wakes {
                let _ = wake.send(());
            }
        }));
        transport.shared.cmd.set_event_mode(true);
        info!("transport up: doorbell page at {doorbell_offset:#x}");
        Ok(transport)
    }

    pub fn fw_info(&self) -> &FwInfo {
        &self.fw_info
    }

    pub fn board_info(&self) -> &BoardInfo {
        &self.board
    }

    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    pub fn kvd_split(&self) -> KvdSplit {
        self.kvd
    }

    /// Run one device command. See [`CmdChannel::execute`].
    pub fn execute(
        &self,
        opcode: u16,
        opcode_mod: u8,
        in_mod: u32,
        in_bytes: Option<&[u8]>,
        out_len: usize,
        out_direct: bool,
    ) -> Result<Vec<u8>, Error> {
        self.shared
            .cmd
            .execute(opcode, opcode_mod, in_mod, in_bytes, out_len, out_direct)
    }

    /// Post one frame for transmission. Completion is reported through
    /// the completion queue; the frame memory is held until then.
    pub fn transmit(&self, frame: TxFrame, info: &TxInfo) -> Result<(), TransmitError> {
        let shared = &self.shared;
        let frame = if 1 + frame.frags.len() > regs::WQE_SG_ENTRIES {
            linearize(frame)
        } else {
            frame
        };
        if frame.head.len() > 0x3FFF || frame.frags.iter().any(|f| f.len() > 0x3FFF) {
            return Err(TransmitError::TooLarge);
        }

        let sdq_index = sdq_for(shared.sdqs.len(), info);
        let mut guard = lock_queue(&shared.sdqs[sdq_index]);
        let q = match guard.as_mut() {
            Some(q) => q,
            None => return Err(TransmitError::Busy),
        };
        if q.is_full() {
            metrics::TX_BUSY.increment();
            return Err(TransmitError::Busy);
        }

        let mut mapped = Vec::with_capacity(1 + frame.frags.len());
        for part in std::iter::once(&frame.head)
            .chain(frame.frags.iter())
            .filter(|p| !p.is_empty())
        {
            match shared.bus.dma_map(part.as_ptr(), part.len(), DmaDir::ToDevice) {
                Ok(addr) => mapped.push((addr, part.len())),
                Err(_) => {
                    for (addr, len) in &mapped {
                        shared.bus.dma_unmap(*addr, *len, DmaDir::ToDevice);
                    }
                    return Err(TransmitError::Map);
                }
            }
        }

        // Not None: fullness was checked under the same lock.
        let index = match q.producer_reserve() {
            Some(index) => index,
            None => {
                for (addr, len) in &mapped {
                    shared.bus.dma_unmap(*addr, *len, DmaDir::ToDevice);
                }
                return Err(TransmitError::Busy);
            }
        };

        let mut elem = [0u8; regs::WQE_SIZE];
        wqe::set_type(&mut elem, regs::WQE_TYPE_ETHERNET);
        wqe::set_completion_report(&mut elem, true);
        for (i, (addr, len)) in mapped.iter().enumerate() {
            wqe::set_address(&mut elem, i, *addr);
            wqe::set_byte_count(&mut elem, i, *len as u16);
        }
        q.write_elem(index, &elem);
        q.set_slot(index, TxEntry { frame, mapped });
        q.ring_producer(
            shared.bus.as_ref(),
            shared.doorbell_offset,
            regs::DOORBELL_SDQ_OFFSET,
        );
        Ok(())
    }

    /// True when the send queue that would carry this frame is full.
    /// Advisory only: another producer may fill the queue between this
    /// check and a transmit.
    pub fn transmit_busy(&self, info: &TxInfo) -> bool {
        let index = sdq_for(self.shared.sdqs.len(), info);
        match lock_queue(&self.shared.sdqs[index]).as_ref() {
            Some(q) => q.is_full(),
            None => true,
        }
    }

    /// Counter snapshot across every live queue.
    pub fn queue_stats(&self) -> Vec<QueueStats> {
        let mut stats = Vec::new();
        fn collect<A>(
            out: &mut Vec<QueueStats>,
            kind: QueueKind,
            queues: &[Mutex<Option<Queue<A>>>],
        ) {
            for m in queues {
                if let Some(q) = lock_queue(m).as_ref() {
                    out.push(QueueStats {
                        kind,
                        num: q.num(),
                        count: q.count(),
                        producer: q.producer_counter(),
                        consumer: q.consumer_counter(),
                    });
                }
            }
        }
        collect(&mut stats, QueueKind::Send, &self.shared.sdqs);
        collect(&mut stats, QueueKind::Receive, &self.shared.rdqs);
        collect(&mut stats, QueueKind::Completion, &self.shared.cqs);
        collect(&mut stats, QueueKind::Event, &self.shared.eqs);
        stats
    }

    fn stop_workers(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        for wake in &self.eq_wakes {
            let _ = wake.send(());
        }
        if let Some(wakes) = self.shared.cq_wakes.get() {
            for wake in wakes {
                let _ = wake.send(());
            }
        }
        let handles = std::mem::take(&mut *lock_queue(&self.workers));
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Orderly shutdown: stop the dispatchers, return every queue to the
    /// device, unmap the firmware area, and release the command channel.
    pub fn fini(self) {
        self.shared.cmd.set_event_mode(false);
        self.stop_workers();
        let shared = &self.shared;
        let bus = shared.bus.as_ref();
        for m in shared.rdqs.iter().rev() {
            if let Some(q) = lock_queue(m).take() {
                destroy_rdq(bus, &shared.cmd, q);
            }
        }
        for m in shared.sdqs.iter().rev() {
            if let Some(q) = lock_queue(m).take() {
                destroy_sdq(bus, &shared.cmd, q);
            }
        }
        for m in shared.cqs.iter().rev() {
            if let Some(q) = lock_queue(m).take() {
                destroy_cq(bus, &shared.cmd, q);
            }
        }
        for m in shared.eqs.iter().rev() {
            if let Some(q) = lock_queue(m).take() {
                destroy_eq(bus, &shared.cmd, q);
            }
        }
        let fw_area = std::mem::take(&mut *lock_queue(&shared.fw_area));
        unmap_fw_area(bus, &shared.cmd, fw_area);
        shared.cmd.fini();
    }
}

impl Drop for SwitchTransport {
    fn drop(&mut self) {
        // fini() already emptied the handle list; a bare drop still has
        // live dispatcher threads to stop.
        self.stop_workers();
    }
}

fn sdq_for(num_sdqs: usize, info: &TxInfo) -> usize {
    info.local_port as usize % num_sdqs
}

fn linearize(frame: TxFrame) -> TxFrame {
    let mut buf = BytesMut::with_capacity(frame.len());
    buf.extend_from_slice(&frame.head);
    for frag in &frame.frags {
        buf.extend_from_slice(frag);
    }
    TxFrame {
        head: buf.freeze(),
        frags: Vec::new(),
    }
}

fn sw_reset(bus: &dyn Bus) {
    bus.write32(regs::SW_RESET, regs::SW_RESET_RST_BIT);
    let deadline = Instant::now() + SW_RESET_TIMEOUT;
    loop {
        if bus.read32(regs::FW_READY) & regs::FW_READY_MASK == regs::FW_READY_MAGIC {
            return;
        }
        if Instant::now() >= deadline {
            warn!("firmware ready magic not observed after reset, proceeding");
            return;
        }
        std::thread::sleep(SW_RESET_POLL);
    }
}

fn negotiate(bus: &Arc<dyn Bus>, cmd: &CmdChannel, config: &Config) -> Result<Negotiated, Error> {
    let fw = resources::query_fw(cmd)?;
    let fw_area = map_fw_area(bus.as_ref(), cmd, fw.fw_pages)?;
    let rest: Result<_, Error> = (|| {
        let board = resources::query_boardinfo(cmd)?;
        let res = resources::query_resources(cmd)?;
        let kvd = resources::kvd_split(&res, &config.profile)?;
        resources::config_profile(cmd, &kvd)?;
        let caps = resources::query_aq_cap(cmd)?;
        caps.check(config)?;
        resources::log_limits(&res);
        Ok((board, res, kvd))
    })();
    match rest {
        Ok((board, res, kvd)) => Ok(Negotiated {
            fw,
            fw_area,
            board,
            resources: res,
            kvd,
        }),
        Err(e) => {
            unmap_fw_area(bus.as_ref(), cmd, fw_area);
            Err(e)
        }
    }
}

/// Map `fw_pages` pages of host memory for firmware use, in command-sized
/// chunks.
fn map_fw_area(bus: &dyn Bus, cmd: &CmdChannel, fw_pages: u16) -> Result<Vec<MemoryBlock>, Error> {
    let mut blocks: Vec<MemoryBlock> = Vec::with_capacity(fw_pages as usize);
    let mut remaining = fw_pages as usize;
    let result: Result<(), Error> = (|| {
        while remaining > 0 {
            let chunk = remaining.min(regs::MAP_FA_ENTRIES_MAX);
            let mut mbox = vec![0u8; chunk * 16];
            for i in 0..chunk {
                let block = bus.alloc_coherent(regs::PAGE_SIZE)?;
                regs::map_fa::set_pa(&mut mbox, i, block.device_addr());
                regs::map_fa::set_log2size(&mut mbox, i, 0);
                blocks.push(block);
            }
            cmd.execute(opcode::MAP_FA, 0, chunk as u32, Some(&mbox), 0, false)?;
            remaining -= chunk;
        }
        Ok(())
    })();
    match result {
        Ok(()) => Ok(blocks),
        Err(e) => {
            unmap_fw_area(bus, cmd, blocks);
            Err(e)
        }
    }
}

fn unmap_fw_area(bus: &dyn Bus, cmd: &CmdChannel, blocks: Vec<MemoryBlock>) {
    if blocks.is_empty() {
        return;
    }
    if let Err(e) = cmd.execute(opcode::UNMAP_FA, 0, 0, None, 0, false) {
        warn!("firmware area unmap failed: {e}");
    }
    for block in blocks {
        bus.free_coherent(block);
    }
}

pub(crate) struct QueueSet {
    pub(crate) eqs: Vec<Queue<()>>,
    pub(crate) cqs: Vec<Queue<()>>,
    pub(crate) sdqs: Vec<Queue<TxEntry>>,
    pub(crate) rdqs: Vec<Queue<RxBuffer>>,
}

fn create_queues(
    bus: &Arc<dyn Bus>,
    cmd: &CmdChannel,
    config: &Config,
    db: u32,
) -> Result<QueueSet, Error> {
    let mut set = QueueSet {
        eqs: Vec::new(),
        cqs: Vec::new(),
        sdqs: Vec::new(),
        rdqs: Vec::new(),
    };
    let result: Result<(), Error> = (|| {
        for num in 0..regs::EQS_COUNT {
            set.eqs.push(create_eq(bus.as_ref(), cmd, config, db, num as u8)?);
        }
        for num in 0..config.num_cqs {
            set.cqs.push(create_cq(bus.as_ref(), cmd, config, db, num as u8)?);
        }
        for num in 0..config.num_sdqs {
            set.sdqs.push(create_sdq(bus.as_ref(), cmd, config, num as u8)?);
        }
        for num in 0..config.num_rdqs {
            set.rdqs.push(create_rdq(bus.as_ref(), cmd, config, db, num as u8)?);
        }
        Ok(())
    })();
    match result {
        Ok(()) => Ok(set),
        Err(e) => {
            let bus = bus.as_ref();
            for q in set.rdqs.into_iter().rev() {
                destroy_rdq(bus, cmd, q);
            }
            for q in set.sdqs.into_iter().rev() {
                destroy_sdq(bus, cmd, q);
            }
            for q in set.cqs.into_iter().rev() {
                destroy_cq(bus, cmd, q);
            }
            for q in set.eqs.into_iter().rev() {
                destroy_eq(bus, cmd, q);
            }
            Err(e)
        }
    }
}

fn fill_page_list(mem: &MemoryBlock, mut set: impl FnMut(usize, u64)) {
    let pages = mem.len().div_ceil(regs::PAGE_SIZE);
    debug_assert!(pages <= regs::AQ_PAGES);
    for i in 0..pages {
        set(i, mem.device_addr() + (i * regs::PAGE_SIZE) as u64);
    }
}

fn create_eq(
    bus: &dyn Bus,
    cmd: &CmdChannel,
    config: &Config,
    db: u32,
    num: u8,
) -> Result<Queue<()>, Error> {
    let mem = bus.alloc_coherent(config.eq_count * regs::EQE_SIZE)?;
    let q = Queue::new(num, config.eq_count as u16, regs::EQE_SIZE, mem);
    q.init_elements(|e| eqe::set_owner(e, true));
    let mut m = [0u8; 0x10 + 8 * regs::AQ_PAGES];
    regs::sw2hw_eq::set_int_msix(&mut m, true);
    regs::sw2hw_eq::set_st(&mut m, 1);
    regs::sw2hw_eq::set_oi(&mut m, false);
    regs::sw2hw_eq::set_log_eq_size(&mut m, config.eq_count.trailing_zeros() as u8);
    fill_page_list(q.mem(), |i, pa| regs::sw2hw_eq::set_pa(&mut m, i, pa));
    if let Err(e) = cmd.execute(opcode::SW2HW_EQ, 0, num as u32, Some(&m), 0, false) {
        bus.free_coherent(q.into_mem());
        return Err(e);
    }
    q.ring_consumer(bus, db, regs::DOORBELL_EQ_OFFSET);
    q.ring_arm(bus, db, regs::DOORBELL_ARM_EQ_OFFSET);
    Ok(q)
}

fn create_cq(
    bus: &dyn Bus,
    cmd: &CmdChannel,
    config: &Config,
    db: u32,
    num: u8,
) -> Result<Queue<()>, Error> {
    let mem = bus.alloc_coherent(config.cq_count * regs::CQE_SIZE)?;
    let q = Queue::new(num, config.cq_count as u16, regs::CQE_SIZE, mem);
    q.init_elements(|e| cqe::set_owner(e, true));
    let mut m = [0u8; 0x10 + 8 * regs::AQ_PAGES];
    regs::sw2hw_cq::set_cv(&mut m, 0);
    regs::sw2hw_cq::set_c_eqn(&mut m, regs::EQ_COMP_NUM);
    regs::sw2hw_cq::set_st(&mut m, 0);
    regs::sw2hw_cq::set_oi(&mut m, false);
    regs::sw2hw_cq::set_log_cq_size(&mut m, config.cq_count.trailing_zeros() as u8);
    fill_page_list(q.mem(), |i, pa| regs::sw2hw_cq::set_pa(&mut m, i, pa));
    if let Err(e) = cmd.execute(opcode::SW2HW_CQ, 0, num as u32, Some(&m), 0, false) {
        bus.free_coherent(q.into_mem());
        return Err(e);
    }
    q.ring_consumer(bus, db, regs::DOORBELL_CQ_OFFSET);
    q.ring_arm(bus, db, regs::DOORBELL_ARM_CQ_OFFSET);
    Ok(q)
}

fn create_sdq(
    bus: &dyn Bus,
    cmd: &CmdChannel,
    config: &Config,
    num: u8,
) -> Result<Queue<TxEntry>, Error> {
    let mem = bus.alloc_coherent(config.sdq_count * regs::WQE_SIZE)?;
    let q = Queue::new(num, config.sdq_count as u16, regs::WQE_SIZE, mem);
    let mut m = [0u8; 0x10 + 8 * regs::AQ_PAGES];
    // Send queue `num` completes into completion queue `num`.
    regs::sw2hw_dq::set_cq(&mut m, num);
    regs::sw2hw_dq::set_sdq_tclass(&mut m, SDQ_TCLASS);
    regs::sw2hw_dq::set_log2_dq_sz(&mut m, config.sdq_count.trailing_zeros() as u8);
    fill_page_list(q.mem(), |i, pa| regs::sw2hw_dq::set_pa(&mut m, i, pa));
    if let Err(e) = cmd.execute(opcode::SW2HW_DQ, 0, num as u32, Some(&m), 0, false) {
        bus.free_coherent(q.into_mem());
        return Err(e);
    }
    Ok(q)
}

fn create_rdq(
    bus: &dyn Bus,
    cmd: &CmdChannel,
    config: &Config,
    db: u32,
    num: u8,
) -> Result<Queue<RxBuffer>, Error> {
    let mem = bus.alloc_coherent(config.rdq_count * regs::WQE_SIZE)?;
    let mut q = Queue::new(num, config.rdq_count as u16, regs::WQE_SIZE, mem);
    let mut m = [0u8; 0x10 + 8 * regs::AQ_PAGES];
    // Receive queue `num` completes into the completion queue after the
    // send block.
    regs::sw2hw_dq::set_cq(&mut m, (config.num_sdqs + num as usize) as u8);
    regs::sw2hw_dq::set_log2_dq_sz(&mut m, config.rdq_count.trailing_zeros() as u8);
    fill_page_list(q.mem(), |i, pa| regs::sw2hw_dq::set_pa(&mut m, i, pa));
    if let Err(e) = cmd.execute(opcode::SW2HW_DQ, 1, num as u32, Some(&m), 0, false) {
        bus.free_coherent(q.into_mem());
        return Err(e);
    }
    // Fill the ring with buffers before the device may deliver.
    while let Some(index) = q.producer_reserve() {
        match RxBuffer::alloc(bus, config.rx_buffer_size) {
            Some(buf) => {
                write_rx_wqe(&q, index, &buf);
                q.set_slot(index, buf);
            }
            None => {
                destroy_rdq(bus, cmd, q);
                return Err(Error::OutOfMemory("receive buffers"));
            }
        }
    }
    q.ring_producer(bus, db, regs::DOORBELL_RDQ_OFFSET);
    Ok(q)
}

/// Write the single-entry receive descriptor pointing at `buf`.
pub(crate) fn write_rx_wqe(q: &Queue<RxBuffer>, index: usize, buf: &RxBuffer) {
    let mut elem = [0u8; regs::WQE_SIZE];
    wqe::set_address(&mut elem, 0, buf.addr);
    wqe::set_byte_count(&mut elem, 0, buf.len() as u16);
    q.write_elem(index, &elem);
}

fn destroy_eq(bus: &dyn Bus, cmd: &CmdChannel, q: Queue<()>) {
    if let Err(e) = cmd.execute(opcode::HW2SW_EQ, 0, q.num() as u32, None, 0, false) {
        warn!("event queue {} release failed: {e}", q.num());
    }
    bus.free_coherent(q.into_mem());
}

fn destroy_cq(bus: &dyn Bus, cmd: &CmdChannel, q: Queue<()>) {
    if let Err(e) = cmd.execute(opcode::HW2SW_CQ, 0, q.num() as u32, None, 0, false) {
        warn!("completion queue {} release failed: {e}", q.num());
    }
    bus.free_coherent(q.into_mem());
}

fn destroy_sdq(bus: &dyn Bus, cmd: &CmdChannel, mut q: Queue<TxEntry>) {
    if let Err(e) = cmd.execute(opcode::HW2SW_DQ, 0, q.num() as u32, None, 0, false) {
        warn!("send queue {} release failed: {e}", q.num());
    }
    let entries: Vec<TxEntry> = q.drain_slots().collect();
    for entry in entries {
        for (addr, len) in &entry.mapped {
            bus.dma_unmap(*addr, *len, DmaDir::ToDevice);
        }
    }
    bus.free_coherent(q.into_mem());
}

fn destroy_rdq(bus: &dyn Bus, cmd: &CmdChannel, mut q: Queue<RxBuffer>) {
    if let Err(e) = cmd.execute(opcode::HW2SW_DQ, 1, q.num() as u32, None, 0, false) {
        warn!("receive queue {} release failed: {e}", q.num());
    }
    let buffers: Vec<RxBuffer> = q.drain_slots().collect();
    for buf in buffers {
        bus.dma_unmap(buf.addr, buf.len(), DmaDir::FromDevice);
        buf.free();
    }
    bus.free_coherent(q.into_mem());
}
