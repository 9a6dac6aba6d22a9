//! Completion and event dispatcher threads.
//!
//! One named thread per completion queue and per event queue. The
//! interrupt handler only pokes the event threads through their wake
//! channels; event threads in turn wake the completion threads named by
//! completion-activity events. Each pass over a queue is bounded by a
//! credit of half the ring so one busy queue cannot starve the rest; a
//! thread that spends its whole credit re-wakes itself.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::warn;

use crate::bus::DmaDir;
use crate::error::Error;
use crate::metrics;
use crate::queue::Queue;
use crate::regs::{self, cqe, eqe};
use crate::transport::{lock_queue, write_rx_wqe, RxBuffer, RxInfo, Shared};

pub(crate) fn spawn(
    shared: &Arc<Shared>,
) -> Result<(Vec<JoinHandle<()>>, Vec<Sender<()>>), Error> {
    let mut handles = Vec::new();
    let mut cq_senders = Vec::new();
    let mut eq_senders = Vec::new();
    let result: Result<(), Error> = (|| {
        for num in 0..shared.cqs.len() {
            let (tx, rx) = unbounded();
            let shared = shared.clone();
            let self_wake = tx.clone();
            handles.push(
                Builder::new()
                    .name(format!("cq-{num}"))
                    .spawn(move || cq_loop(shared, num, self_wake, rx))
                    .map_err(Error::WorkerSpawn)?,
            );
            cq_senders.push(tx);
        }
        // Event threads translate completion events into these wakes, so
        // the list must be in place before the first event thread runs.
        let _ = shared.cq_wakes.set(cq_senders.clone());
        for num in 0..shared.eqs.len() {
            let (tx, rx) = unbounded();
            let shared = shared.clone();
            let self_wake = tx.clone();
            handles.push(
                Builder::new()
                    .name(format!("eq-{num}"))
                    .spawn(move || eq_loop(shared, num, self_wake, rx))
                    .map_err(Error::WorkerSpawn)?,
            );
            eq_senders.push(tx);
        }
        Ok(())
    })();
    match result {
        Ok(()) => Ok((handles, eq_senders)),
        Err(e) => {
            shared.shutdown.store(true, Ordering::Release);
            if let Some(wakes) = shared.cq_wakes.get() {
                for wake in wakes {
                    let _ = wake.send(());
                }
            }
            for wake in &eq_senders {
                let _ = wake.send(());
            }
            for handle in handles {
                let _ = handle.join();
            }
            Err(e)
        }
    }
}

fn eq_loop(shared: Arc<Shared>, num: usize, self_wake: Sender<()>, rx: Receiver<()>) {
    loop {
        if rx.recv().is_err() {
            break;
        }
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        let mut comp_pending = vec![false; shared.cqs.len()];
        let exhausted;
        {
            let mut guard = lock_queue(&shared.eqs[num]);
            let q = match guard.as_mut() {
                Some(q) => q,
                None => break,
            };
            let budget = q.count() / 2;
            let mut credits = budget;
            let mut elem = vec![0u8; regs::EQE_SIZE];
            while credits > 0 {
                if !q.consume(eqe::owner, &mut elem) {
                    break;
                }
                credits -= 1;
                match eqe::event_type(&elem) {
                    regs::EQE_EVENT_TYPE_CMD => {
                        metrics::EQ_CMD_EVENTS.increment();
                        shared.cmd.notify_event(
                            eqe::cmd_token(&elem),
                            eqe::cmd_status(&elem),
                            eqe::cmd_out_param(&elem),
                        );
                    }
                    regs::EQE_EVENT_TYPE_COMP => {
                        metrics::EQ_COMP_EVENTS.increment();
                        let cqn = eqe::cqn(&elem) as usize;
                        if cqn < comp_pending.len() {
                            comp_pending[cqn] = true;
                        } else {
                            metrics::EQ_OTHER_EVENTS.increment();
                        }
                    }
                    _ => {
                        metrics::EQ_OTHER_EVENTS.increment();
                    }
                }
            }
            exhausted = credits == 0;
            // A wake with nothing to consume must not touch the doorbells.
            if credits < budget {
                q.ring_consumer(
                    shared.bus.as_ref(),
                    shared.doorbell_offset,
                    regs::DOORBELL_EQ_OFFSET,
                );
                q.ring_arm(
                    shared.bus.as_ref(),
                    shared.doorbell_offset,
                    regs::DOORBELL_ARM_EQ_OFFSET,
                );
            }
        }
        if let Some(wakes) = shared.cq_wakes.get() {
            for (cqn, pending) in comp_pending.iter().enumerate() {
                if *pending {
                    let _ = wakes[cqn].send(());
                }
            }
        }
        if exhausted {
            let _ = self_wake.send(());
        }
    }
}

fn cq_loop(shared: Arc<Shared>, num: usize, self_wake: Sender<()>, rx: Receiver<()>) {
    loop {
        if rx.recv().is_err() {
            break;
        }
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        let mut deliveries: Vec<(Bytes, RxInfo)> = Vec::new();
        let exhausted;
        {
            let mut guard = lock_queue(&shared.cqs[num]);
            let q = match guard.as_mut() {
                Some(q) => q,
                None => break,
            };
            let budget = q.count() / 2;
            let mut credits = budget;
            let mut elem = vec![0u8; regs::CQE_SIZE];
            while credits > 0 {
                if !q.consume(cqe::owner, &mut elem) {
                    break;
                }
                credits -= 1;
                if cqe::is_send(&elem) {
                    handle_send_completion(&shared, &elem);
                } else if let Some(delivery) = handle_recv_completion(&shared, &elem) {
                    deliveries.push(delivery);
                }
            }
            exhausted = credits == 0;
            if credits < budget {
                q.ring_consumer(
                    shared.bus.as_ref(),
                    shared.doorbell_offset,
                    regs::DOORBELL_CQ_OFFSET,
                );
                q.ring_arm(
                    shared.bus.as_ref(),
                    shared.doorbell_offset,
                    regs::DOORBELL_ARM_CQ_OFFSET,
                );
            }
        }
        // Deliver with no ring lock held; the callback may transmit.
        for (frame, info) in deliveries {
            (shared.rx_cb)(frame, &info);
        }
        if exhausted {
            let _ = self_wake.send(());
        }
    }
}

fn handle_send_completion(shared: &Shared, elem: &[u8]) {
    let dqn = cqe::dqn(elem) as usize;
    if dqn >= shared.sdqs.len() {
        metrics::CQ_BAD_QUEUE.increment();
        if shared.mismatch_warn.ready() {
            warn!("send completion for unknown queue {dqn}");
        }
        return;
    }
    metrics::CQ_SEND_COMPLETIONS.increment();
    let target = cqe::wqe_counter(elem).wrapping_add(1);
    let mut guard = lock_queue(&shared.sdqs[dqn]);
    let q = match guard.as_mut() {
        Some(q) => q,
        None => return,
    };
    // Free everything up to and including the reported descriptor; one
    // completion may cover several.
    while q.consumer_counter() != target {
        if q.in_flight() == 0 {
            metrics::SDQ_COUNTER_MISMATCH.increment();
            if shared.mismatch_warn.ready() {
                warn!(
                    "send queue {dqn}: completion counter {} ahead of ring",
                    cqe::wqe_counter(elem)
                );
            }
            break;
        }
        let index = q.consumer_index();
        if let Some(entry) = q.take_slot(index) {
            for (addr, len) in &entry.mapped {
                shared.bus.dma_unmap(*addr, *len, DmaDir::ToDevice);
            }
        }
        q.consumer_advance();
    }
}

fn handle_recv_completion(shared: &Shared, elem: &[u8]) -> Option<(Bytes, RxInfo)> {
    let dqn = cqe::dqn(elem) as usize;
    if dqn >= shared.rdqs.len() {
        metrics::CQ_BAD_QUEUE.increment();
        if shared.mismatch_warn.ready() {
            warn!("receive completion for unknown queue {dqn}");
        }
        return None;
    }
    metrics::CQ_RECV_COMPLETIONS.increment();
    let mut guard = lock_queue(&shared.rdqs[dqn]);
    let q = guard.as_mut()?;
    if q.consumer_counter() != cqe::wqe_counter(elem) && shared.mismatch_warn.ready() {
        warn!(
            "receive queue {dqn}: completion counter {} does not match ring {}",
            cqe::wqe_counter(elem),
            q.consumer_counter()
        );
    }
    let index = q.consumer_index();
    let taken = q.take_slot(index);
    q.consumer_advance();
    let old = match taken {
        Some(buf) => buf,
        None => {
            if shared.mismatch_warn.ready() {
                warn!("receive queue {dqn}: completion for an empty slot");
            }
            return None;
        }
    };

    // One-for-one replenishment, buffer first: if no replacement can be
    // allocated, the frame is dropped and the old buffer goes straight
    // back on the ring, so the ring never shrinks.
    match RxBuffer::alloc(shared.bus.as_ref(), shared.config.rx_buffer_size) {
        Some(new_buf) => {
            repost(shared, q, new_buf);
            shared.bus.dma_unmap(old.addr, old.len(), DmaDir::FromDevice);
            let mut byte_count = cqe::byte_count(elem);
            if cqe::crc(elem) {
                byte_count = byte_count.saturating_sub(regs::ETH_FCS_LEN);
            }
            let frame = old.into_bytes(byte_count as usize);
            let info = RxInfo {
                is_lag: cqe::is_lag(elem),
                port: cqe::port(elem),
                trap_id: cqe::trap_id(elem),
            };
            Some((frame, info))
        }
        None => {
            metrics::RX_REFILL_FAILED.increment();
            if shared.refill_warn.ready() {
                warn!("receive queue {dqn}: buffer replenishment failed, frame dropped");
            }
            repost(shared, q, old);
            None
        }
    }
}

fn repost(shared: &Shared, q: &mut Queue<RxBuffer>, buf: RxBuffer) {
    match q.producer_reserve() {
        Some(index) => {
            write_rx_wqe(q, index, &buf);
            q.set_slot(index, buf);
            q.ring_producer(
                shared.bus.as_ref(),
                shared.doorbell_offset,
                regs::DOORBELL_RDQ_OFFSET,
            );
        }
        None => {
            shared.bus.dma_unmap(buf.addr, buf.len(), DmaDir::FromDevice);
            buf.free();
        }
    }
}
